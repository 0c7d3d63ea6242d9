//! Telemetry ingest: durable pull consumers and the heartbeat KV watcher.
//!
//! Both stream consumers share one pull skeleton and differ only in
//! their durable name, subject filter, fetch bounds and per-message side
//! effect. Processing is synchronous within a consumer task - the
//! ack/nak protocol needs each message's outcome before requesting more;
//! horizontal scale comes from running more instances on the same
//! durable name.

mod events;
mod inventory;
mod kv;

pub use events::start_events_consumer;
pub use inventory::start_inventory_consumer;
pub use kv::start_kv_watcher;

use std::time::Duration;

use async_nats::jetstream::consumer::pull::Config as PullConfig;
use async_nats::jetstream::consumer::{AckPolicy, PullConsumer};
use async_nats::jetstream::context::Context;
use async_nats::jetstream::AckKind;
use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use opsd_core::batch::BatchSizer;

use crate::bus::EVENTS_STREAM;
use crate::storage::StorageError;

/// Redelivery pause requested when a side effect fails.
const NAK_DELAY: Duration = Duration::from_secs(5);

/// How long one fetch waits for messages.
const FETCH_MAX_WAIT: Duration = Duration::from_secs(5);

/// Time the server holds an unacknowledged message before redelivery.
const ACK_WAIT: Duration = Duration::from_secs(30);

/// Delivery attempts before the server gives up on a message.
const MAX_DELIVER: i64 = 3;

/// In-flight unacknowledged message ceiling.
const MAX_ACK_PENDING: i64 = 1000;

/// What to do with a decoded message.
pub(crate) enum Disposition {
    /// Side effect applied; acknowledge.
    Ack,
    /// Permanently undecodable; dead-letter without redelivery.
    Terminate,
}

/// Per-message side effect of one consumer.
#[async_trait]
pub(crate) trait MessageProcessor: Send + Sync + 'static {
    /// Consumer name for logs.
    fn name(&self) -> &'static str;

    /// Apply the message. An `Err` requests redelivery via nak.
    async fn process(
        &self,
        message: &async_nats::jetstream::Message,
    ) -> Result<Disposition, StorageError>;
}

/// Create the durable pull consumer for a processor.
pub(crate) async fn durable_consumer(
    js: &Context,
    durable_name: &str,
    filter_subject: &str,
) -> anyhow::Result<PullConsumer> {
    let stream = js.get_stream(EVENTS_STREAM).await?;
    let consumer = stream
        .get_or_create_consumer(
            durable_name,
            PullConfig {
                durable_name: Some(durable_name.to_string()),
                filter_subject: filter_subject.to_string(),
                ack_policy: AckPolicy::Explicit,
                ack_wait: ACK_WAIT,
                max_deliver: MAX_DELIVER,
                max_ack_pending: MAX_ACK_PENDING,
                ..Default::default()
            },
        )
        .await?;
    Ok(consumer)
}

/// Run the adaptive pull loop until cancellation.
///
/// A batch in flight is always drained before the loop observes the
/// cancellation token, so fetched messages are never abandoned mid-batch.
pub(crate) async fn run_pull_loop<P: MessageProcessor>(
    consumer: PullConsumer,
    mut sizer: BatchSizer,
    processor: P,
    cancel: CancellationToken,
) {
    info!(consumer = processor.name(), "consumer started");

    loop {
        if cancel.is_cancelled() {
            info!(consumer = processor.name(), "consumer stopped");
            return;
        }

        let batch = consumer
            .batch()
            .max_messages(sizer.size())
            .expires(FETCH_MAX_WAIT)
            .messages()
            .await;

        let mut batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                warn!(consumer = processor.name(), error = %e, "fetch error");
                sizer.record(0);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let mut fetched = 0;
        while let Some(next) = batch.next().await {
            match next {
                Ok(message) => {
                    fetched += 1;
                    handle_message(&processor, &message).await;
                }
                Err(e) => {
                    warn!(consumer = processor.name(), error = %e, "batch error");
                    break;
                }
            }
        }

        sizer.record(fetched);
    }
}

async fn handle_message<P: MessageProcessor>(
    processor: &P,
    message: &async_nats::jetstream::Message,
) {
    match processor.process(message).await {
        Ok(Disposition::Ack) => {
            if let Err(e) = message.ack().await {
                warn!(consumer = processor.name(), error = %e, "ack failed");
            }
        }
        Ok(Disposition::Terminate) => {
            if let Err(e) = message.ack_with(AckKind::Term).await {
                warn!(consumer = processor.name(), error = %e, "term failed");
            }
        }
        Err(e) => {
            warn!(
                consumer = processor.name(),
                subject = %message.subject,
                error = %e,
                "process error, requesting redelivery"
            );
            if let Err(e) = message.ack_with(AckKind::Nak(Some(NAK_DELAY))).await {
                warn!(consumer = processor.name(), error = %e, "nak failed");
            }
        }
    }
}
