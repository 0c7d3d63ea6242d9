//! Bus connection and infrastructure bootstrap.
//!
//! Connects to NATS, then ensures the `OPS_EVENTS` stream and the
//! `AGENTS` heartbeat KV bucket exist with the expected limits. The bus
//! being unreachable at startup is fatal; reconnects afterwards are
//! handled by the client and only logged.

use std::time::Duration;

use anyhow::Context as _;
use async_nats::jetstream::{self, kv, stream};
use tracing::{info, warn};

/// Events stream name.
pub const EVENTS_STREAM: &str = "OPS_EVENTS";

/// Heartbeat KV bucket name.
pub const AGENTS_BUCKET: &str = "AGENTS";

/// Subjects captured by the events stream. Inventory shares the stream
/// so both durable consumers bind against one retention policy.
const EVENTS_SUBJECTS: [&str; 2] = ["ops.*.events.>", "ops.*.inventory"];

/// Heartbeat entry TTL enforced by the bucket.
const AGENTS_BUCKET_TTL: Duration = Duration::from_secs(30);

/// Connected bus handles shared by the daemon's components.
#[derive(Clone)]
pub struct Bus {
    /// Core client, used for request-reply dispatch.
    pub client: async_nats::Client,
    /// JetStream context.
    pub jetstream: jetstream::Context,
    /// Heartbeat KV bucket.
    pub kv: kv::Store,
}

/// Connect and ensure infrastructure.
///
/// # Errors
///
/// Returns an error when the bus is unreachable or stream/bucket
/// creation fails.
pub async fn connect(urls: &[String]) -> anyhow::Result<Bus> {
    let joined = urls.join(",");

    let client = async_nats::ConnectOptions::new()
        .name("opsd-daemon")
        .event_callback(|event| async move {
            match event {
                async_nats::Event::Disconnected => warn!("bus disconnected"),
                async_nats::Event::Connected => info!("bus reconnected"),
                async_nats::Event::ClientError(err) => warn!(error = %err, "bus client error"),
                other => info!(event = %other, "bus event"),
            }
        })
        .connect(joined.as_str())
        .await
        .with_context(|| format!("connect to bus at {joined}"))?;

    info!(urls = %joined, "connected to bus");

    let jetstream = jetstream::new(client.clone());
    ensure_events_stream(&jetstream).await?;
    let kv = ensure_agents_bucket(&jetstream).await?;

    Ok(Bus {
        client,
        jetstream,
        kv,
    })
}

async fn ensure_events_stream(js: &jetstream::Context) -> anyhow::Result<()> {
    js.get_or_create_stream(stream::Config {
        name: EVENTS_STREAM.to_string(),
        subjects: EVENTS_SUBJECTS.iter().map(ToString::to_string).collect(),
        retention: stream::RetentionPolicy::Limits,
        max_age: Duration::from_secs(72 * 3600),
        max_bytes: 10 * 1024 * 1024 * 1024,
        max_message_size: 1024 * 1024,
        discard: stream::DiscardPolicy::Old,
        storage: stream::StorageType::File,
        ..Default::default()
    })
    .await
    .context("ensure events stream")?;

    Ok(())
}

async fn ensure_agents_bucket(js: &jetstream::Context) -> anyhow::Result<kv::Store> {
    if let Ok(store) = js.get_key_value(AGENTS_BUCKET).await {
        return Ok(store);
    }

    let store = js
        .create_key_value(kv::Config {
            bucket: AGENTS_BUCKET.to_string(),
            max_age: AGENTS_BUCKET_TTL,
            max_value_size: 8 * 1024,
            history: 1,
            storage: stream::StorageType::File,
            ..Default::default()
        })
        .await
        .context("create agents KV bucket")?;

    info!(bucket = AGENTS_BUCKET, "created heartbeat KV bucket");
    Ok(store)
}
