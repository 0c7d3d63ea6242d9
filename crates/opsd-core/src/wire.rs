//! Wire records published by agents over the bus.
//!
//! All payloads are msgpack maps keyed by the snake_case field names below.
//! Encode with [`encode`] (map-named encoding, matching what agents send)
//! and decode with [`decode`].

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Lookup priority for the incident source inside event details.
const SOURCE_KEYS: [&str; 4] = ["source", "container_name", "service", "path"];

/// Encode a record as a msgpack map.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(value)
}

/// Decode a msgpack map into a record.
///
/// # Errors
///
/// Returns an error on malformed msgpack or a shape mismatch.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}

/// Periodic presence message written to the KV bucket, keyed by agent id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Wire format version.
    #[serde(default)]
    pub v: u32,
    /// Reporting agent.
    #[serde(default)]
    pub agent_id: String,
    /// Agent software version.
    #[serde(default)]
    pub agent_version: String,
    /// Reported hostname.
    #[serde(default)]
    pub hostname: String,
    /// Operating system name.
    #[serde(default)]
    pub os: String,
    /// Architecture.
    #[serde(default)]
    pub arch: String,
    /// Host uptime in seconds.
    #[serde(default)]
    pub uptime: i64,
    /// Unix seconds since the current bus connection was established.
    #[serde(default)]
    pub connected_since: i64,
    /// Capabilities advertised by the agent.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Host CPU usage.
    #[serde(default)]
    pub cpu_percent: f64,
    /// Host memory usage.
    #[serde(default)]
    pub mem_percent: f64,
    /// Number of active watchers on the host.
    #[serde(default)]
    pub watchers: i64,
    /// Actions the agent accepts over RPC.
    #[serde(default)]
    pub actions: Vec<String>,
    /// Discovery inventory, carried on the first heartbeat only.
    #[serde(default)]
    pub inventory: Option<Inventory>,
}

/// Discovery data describing the managed host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inventory {
    /// Platform name.
    #[serde(default)]
    pub platform: String,
    /// Platform version.
    #[serde(default)]
    pub platform_version: String,
    /// Kernel version.
    #[serde(default)]
    pub kernel_version: String,
    /// CPU model string.
    #[serde(default)]
    pub cpu_model: String,
    /// Total RAM in bytes.
    #[serde(default)]
    pub ram_total: i64,
    /// Discovered services and processes.
    #[serde(default)]
    pub candidates: Vec<ProcessCandidate>,
}

/// A discovered service or process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessCandidate {
    /// Process name.
    #[serde(default)]
    pub name: String,
    /// Full command line.
    #[serde(default)]
    pub cmdline: String,
    /// Process id.
    #[serde(default)]
    pub pid: i32,
    /// Candidate type.
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Listening TCP ports.
    #[serde(default)]
    pub listen_ports: Vec<u16>,
    /// Owning systemd unit, when detected.
    #[serde(default)]
    pub source_systemd: String,
    /// Owning docker container, when detected.
    #[serde(default)]
    pub source_docker: String,
    /// Resource usage snapshot.
    #[serde(default)]
    pub stats: ProcessStats,
}

/// Resource usage for a discovered process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessStats {
    /// CPU usage.
    #[serde(default)]
    pub cpu_percent: f64,
    /// Resident memory in bytes.
    #[serde(default)]
    pub mem_rss: i64,
}

/// Alert event published on the events stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Wire format version.
    #[serde(default)]
    pub v: u32,
    /// Unix milliseconds at emission.
    #[serde(default)]
    pub ts: i64,
    /// Reporting agent.
    #[serde(default)]
    pub agent_id: String,
    /// Alert type.
    #[serde(default)]
    pub alert_type: String,
    /// Alert message.
    #[serde(default)]
    pub message: String,
    /// Free-form alert details.
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
    /// Whether the agent truncated the payload.
    #[serde(default)]
    pub truncated: bool,
}

impl Event {
    /// Extract the incident source from the details.
    ///
    /// Lookup priority is `source`, `container_name`, `service`, `path`;
    /// the first non-empty string wins, falling back to `"unknown"`.
    #[must_use]
    pub fn source(&self) -> &str {
        for key in SOURCE_KEYS {
            if let Some(value) = self.details.get(key).and_then(|v| v.as_str()) {
                if !value.is_empty() {
                    return value;
                }
            }
        }
        "unknown"
    }

    /// Extract attached log lines from the details, when present.
    #[must_use]
    pub fn logs(&self) -> &str {
        self.details
            .get("logs")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
    }

    /// Compose the sanitized raw-error text stored on the incident.
    ///
    /// The message is followed by a blank line and the logs when logs are
    /// non-empty. NUL bytes are stripped; Postgres rejects them in text
    /// columns.
    #[must_use]
    pub fn raw_error(&self) -> String {
        let logs = self.logs();
        let composed = if logs.is_empty() {
            self.message.clone()
        } else {
            format!("{}\n\n{logs}", self.message)
        };
        composed.replace('\x00', "")
    }
}

/// RPC request dispatched to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Action name.
    pub action: String,
    /// Action arguments.
    #[serde(default)]
    pub args: HashMap<String, String>,
    /// Correlation id (uuid).
    pub request_id: String,
    /// Agent-side execution budget in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// RPC response returned by an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionResponse {
    /// Correlation id echoed from the request.
    #[serde(default)]
    pub request_id: String,
    /// Whether the action succeeded.
    #[serde(default)]
    pub success: bool,
    /// Captured output.
    #[serde(default)]
    pub output: String,
    /// Process exit code, when applicable.
    #[serde(default)]
    pub exit_code: i32,
    /// Execution duration in milliseconds.
    #[serde(default)]
    pub duration_ms: i64,
    /// Error text on failure.
    #[serde(default)]
    pub error: String,
    /// Machine-readable error code on failure.
    #[serde(default)]
    pub error_code: String,
    /// Whether the agent truncated the output.
    #[serde(default)]
    pub truncated: bool,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn event_with_details(details: serde_json::Value) -> Event {
        Event {
            v: 3,
            ts: 1_700_000_000_000,
            agent_id: "abc123456789".to_string(),
            alert_type: "container_down".to_string(),
            message: "container exited".to_string(),
            details: details.as_object().cloned().unwrap_or_default(),
            truncated: false,
        }
    }

    #[test]
    fn test_source_lookup_priority() {
        let event = event_with_details(json!({
            "container_name": "web",
            "service": "nginx",
        }));
        assert_eq!(event.source(), "web");

        let event = event_with_details(json!({
            "source": "syslog",
            "container_name": "web",
        }));
        assert_eq!(event.source(), "syslog");
    }

    #[test]
    fn test_source_skips_empty_values() {
        let event = event_with_details(json!({
            "source": "",
            "container_name": "web",
        }));
        assert_eq!(event.source(), "web");
    }

    #[test]
    fn test_source_falls_back_to_unknown() {
        let event = event_with_details(json!({ "other": 1 }));
        assert_eq!(event.source(), "unknown");

        let event = event_with_details(json!({ "source": 42 }));
        assert_eq!(event.source(), "unknown");
    }

    #[test]
    fn test_raw_error_appends_logs() {
        let event = event_with_details(json!({ "logs": "line1\nline2" }));
        assert_eq!(event.raw_error(), "container exited\n\nline1\nline2");

        let event = event_with_details(json!({}));
        assert_eq!(event.raw_error(), "container exited");
    }

    #[test]
    fn test_raw_error_strips_nul_bytes() {
        let mut event = event_with_details(json!({ "logs": "bad\x00log" }));
        event.message = "msg\x00here".to_string();
        assert_eq!(event.raw_error(), "msghere\n\nbadlog");
    }

    #[test]
    fn test_heartbeat_round_trip() {
        let hb = Heartbeat {
            v: 3,
            agent_id: "a1b2c3d4e5f6".to_string(),
            agent_version: "1.4.0".to_string(),
            hostname: "web-01".to_string(),
            os: "linux".to_string(),
            arch: "amd64".to_string(),
            uptime: 86_400,
            connected_since: 1_700_000_000,
            capabilities: vec!["docker".to_string()],
            cpu_percent: 12.5,
            mem_percent: 40.0,
            watchers: 3,
            actions: vec!["restart_container".to_string()],
            inventory: None,
        };

        let bytes = encode(&hb).unwrap();
        let decoded: Heartbeat = decode(&bytes).unwrap();
        assert_eq!(decoded.agent_id, hb.agent_id);
        assert_eq!(decoded.hostname, hb.hostname);
        assert!((decoded.cpu_percent - hb.cpu_percent).abs() < f64::EPSILON);
        assert!(decoded.inventory.is_none());
    }

    #[test]
    fn test_decode_tolerates_missing_fields() {
        // An older agent omitting newer fields must still decode.
        let bytes = encode(&json!({
            "agent_id": "a1b2c3d4e5f6",
            "hostname": "web-01",
        }))
        .unwrap();

        let decoded: Heartbeat = decode(&bytes).unwrap();
        assert_eq!(decoded.agent_id, "a1b2c3d4e5f6");
        assert_eq!(decoded.v, 0);
        assert!(decoded.capabilities.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode::<Event>(b"\xc1not msgpack").is_err());
    }

    #[test]
    fn test_action_response_defaults_optional_fields() {
        // Agents omit output/exit_code/error on the happy path.
        let bytes = encode(&json!({
            "request_id": "req-1",
            "success": true,
        }))
        .unwrap();

        let decoded: ActionResponse = decode(&bytes).unwrap();
        assert!(decoded.success);
        assert_eq!(decoded.request_id, "req-1");
        assert_eq!(decoded.output, "");
        assert_eq!(decoded.exit_code, 0);
        assert!(!decoded.truncated);
    }

    #[test]
    fn test_action_request_omits_absent_timeout() {
        let request = ActionRequest {
            action: "restart_container".to_string(),
            args: HashMap::new(),
            request_id: "req-1".to_string(),
            timeout_ms: None,
        };

        let bytes = encode(&request).unwrap();
        let as_value: serde_json::Value = decode(&bytes).unwrap();
        assert!(as_value.get("timeout_ms").is_none());
        assert_eq!(as_value["action"], "restart_container");
    }
}
