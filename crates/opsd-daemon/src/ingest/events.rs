//! Events consumer: alert events become incidents.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use opsd_core::batch::BatchSizer;
use opsd_core::wire::{decode, Event};

use crate::bus::Bus;
use crate::storage::{AgentUpsert, NewIncident, Storage, StorageError};

use super::{durable_consumer, run_pull_loop, Disposition, MessageProcessor};

const DURABLE_NAME: &str = "backend-processor";
const FILTER_SUBJECT: &str = "ops.*.events.>";

const INITIAL_FETCH: usize = 64;
const MIN_FETCH: usize = 8;
const MAX_FETCH: usize = 512;

struct EventsProcessor {
    storage: Storage,
}

#[async_trait]
impl MessageProcessor for EventsProcessor {
    fn name(&self) -> &'static str {
        "events"
    }

    async fn process(
        &self,
        message: &async_nats::jetstream::Message,
    ) -> Result<Disposition, StorageError> {
        let event: Event = match decode(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                // Decode failures are deterministic; redelivery would only
                // amplify the log noise.
                error!(subject = %message.subject, error = %e, "undecodable event, terminating");
                return Ok(Disposition::Terminate);
            }
        };

        info!(
            agent_id = %event.agent_id,
            alert_type = %event.alert_type,
            "event received"
        );

        if self
            .storage
            .get_agent_by_agent_id(&event.agent_id)
            .await?
            .is_none()
        {
            self.storage
                .upsert_agent(&AgentUpsert::observed(&event.agent_id))
                .await?;
        }

        let incident = self
            .storage
            .create_incident(&NewIncident {
                agent_id: event.agent_id.clone(),
                kind: event.alert_type.clone(),
                source: event.source().to_string(),
                raw_error: event.raw_error(),
                context: serde_json::Value::Object(event.details.clone()),
            })
            .await?;

        info!(
            incident_id = incident.id,
            agent_id = %event.agent_id,
            alert_type = %event.alert_type,
            source = %incident.source,
            "incident created"
        );

        Ok(Disposition::Ack)
    }
}

/// Start the durable events consumer on its own task.
///
/// # Errors
///
/// Returns an error when the durable consumer cannot be created.
pub async fn start_events_consumer(
    bus: &Bus,
    storage: Storage,
    cancel: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let consumer = durable_consumer(&bus.jetstream, DURABLE_NAME, FILTER_SUBJECT).await?;
    let sizer = BatchSizer::new(INITIAL_FETCH, MIN_FETCH, MAX_FETCH);
    let processor = EventsProcessor { storage };

    Ok(tokio::spawn(run_pull_loop(
        consumer, sizer, processor, cancel,
    )))
}
