use std::sync::Arc;
use std::time::Duration;

use atm_common::health::HealthHandle;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dedup::DedupCache;
use crate::error::{IngestError, SourceError};
use crate::reconcile::{reconcile, ReconcileOutcome, RecordStore};
use crate::record::parse_records;
use crate::source::{fingerprint, MessageSource, Notification, FINALIZE_EVENT};
use crate::storage::{FetchOutcome, ObjectStore};

/// What to do with a message after handling it.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    /// Stop redelivery: processed, deduplicated, or deliberately skipped.
    Acknowledge,
    /// Leave outstanding so the source redelivers and we retry.
    Withhold,
}

enum FileOutcome {
    Reconciled(ReconcileOutcome),
    /// The referenced object does not exist. Redelivery cannot produce
    /// it, so the message is still acknowledged.
    Missing,
}

/// The long-lived control loop: pull a batch, run each notification
/// through dedup → fetch → normalize → reconcile, then acknowledge the
/// batch's accumulated tokens in one call.
///
/// All collaborators are injected, nothing here owns global state. One
/// instance runs on one task; messages within a batch are handled
/// sequentially.
pub struct IngestionLoop {
    source: Arc<dyn MessageSource>,
    objects: Arc<dyn ObjectStore>,
    records: Arc<dyn RecordStore>,
    cache: Arc<DedupCache>,
    max_messages: i32,
    poll_interval: Duration,
    liveness: HealthHandle,
    shutdown: CancellationToken,
}

impl IngestionLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn MessageSource>,
        objects: Arc<dyn ObjectStore>,
        records: Arc<dyn RecordStore>,
        cache: Arc<DedupCache>,
        max_messages: i32,
        poll_interval: Duration,
        liveness: HealthHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            objects,
            records,
            cache,
            max_messages,
            poll_interval,
            liveness,
            shutdown,
        }
    }

    /// Run until the shutdown token is cancelled. No per-message or
    /// per-pull error terminates the loop; everything is logged and the
    /// next cycle proceeds.
    pub async fn run(&self) {
        info!("listening for notifications");
        loop {
            self.liveness.report_healthy();

            let pulled = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("ingestion loop shutting down");
                    return;
                }
                result = self.source.pull(self.max_messages) => result,
            };

            match pulled {
                Ok(notifications) if notifications.is_empty() => {}
                Ok(notifications) => self.process_batch(notifications).await,
                Err(SourceError::Timeout) => {
                    debug!("pull deadline exceeded, retrying");
                }
                Err(error) => {
                    error!("failed to pull notifications: {}", error);
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("ingestion loop shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Handle one pulled batch sequentially, then send one acknowledgment
    /// call for everything marked along the way. A failing message never
    /// blocks acknowledgment of the others.
    pub async fn process_batch(&self, notifications: Vec<Notification>) {
        metrics::counter!("ingest_messages_pulled_total")
            .increment(notifications.len() as u64);

        let mut ack_ids = Vec::with_capacity(notifications.len());
        for notification in notifications {
            match self.handle_message(&notification).await {
                Disposition::Acknowledge => ack_ids.push(notification.ack_id),
                Disposition::Withhold => {}
            }
        }

        if !ack_ids.is_empty() {
            metrics::counter!("ingest_messages_acked_total").increment(ack_ids.len() as u64);
            if let Err(error) = self.source.acknowledge(ack_ids).await {
                // The tokens are lost; the source redelivers and the
                // dedup cache absorbs the repeats.
                error!("failed to acknowledge processed messages: {}", error);
            }
        }
    }

    async fn handle_message(&self, notification: &Notification) -> Disposition {
        let body: Value = match serde_json::from_slice(&notification.data) {
            Ok(body) => body,
            Err(error) => {
                error!("failed to decode notification payload: {}", error);
                let labels = [("reason", "decode".to_owned())];
                metrics::counter!("ingest_messages_failed_total", &labels).increment(1);
                return Disposition::Withhold;
            }
        };

        let fingerprint = fingerprint(&body);
        debug!(%fingerprint, "received notification");

        if self.cache.seen(&fingerprint) {
            debug!(%fingerprint, "already processed, skipping");
            metrics::counter!("ingest_messages_deduped_total").increment(1);
            return Disposition::Acknowledge;
        }

        let event_type = notification.event_type().unwrap_or("");
        if event_type != FINALIZE_EVENT {
            info!(event_type, "ignoring notification event type");
            metrics::counter!("ingest_messages_ignored_total").increment(1);
            self.cache.record(&fingerprint);
            return Disposition::Acknowledge;
        }

        let Some(file_name) = body.get("name").and_then(Value::as_str) else {
            warn!("finalize notification carries no object name");
            let labels = [("reason", "missing_name".to_owned())];
            metrics::counter!("ingest_messages_failed_total", &labels).increment(1);
            self.cache.record(&fingerprint);
            return Disposition::Acknowledge;
        };

        let started = tokio::time::Instant::now();
        match self.ingest_file(file_name).await {
            Ok(FileOutcome::Reconciled(outcome)) => {
                info!(
                    file_name,
                    updated = outcome.updated,
                    inserted = outcome.inserted,
                    "file reconciled"
                );
                metrics::histogram!("ingest_file_processing_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                metrics::counter!("ingest_files_processed_total").increment(1);
                // The fingerprint is only recorded once the pipeline
                // succeeded, so a failed message stays retryable.
                self.cache.record(&fingerprint);
                Disposition::Acknowledge
            }
            Ok(FileOutcome::Missing) => {
                warn!(file_name, "referenced object not found, skipping");
                let labels = [("reason", "not_found".to_owned())];
                metrics::counter!("ingest_messages_failed_total", &labels).increment(1);
                self.cache.record(&fingerprint);
                Disposition::Acknowledge
            }
            Err(error) => {
                error!(
                    file_name,
                    "failed to process notification, leaving unacked: {}", error
                );
                let labels = [("reason", failure_reason(&error).to_owned())];
                metrics::counter!("ingest_messages_failed_total", &labels).increment(1);
                Disposition::Withhold
            }
        }
    }

    async fn ingest_file(&self, name: &str) -> Result<FileOutcome, IngestError> {
        match self.objects.fetch(name).await? {
            FetchOutcome::NotFound => Ok(FileOutcome::Missing),
            FetchOutcome::Found(bytes) => {
                metrics::counter!("ingest_files_fetched_total").increment(1);
                let records = parse_records(&bytes)?;
                let outcome = reconcile(self.records.as_ref(), records).await?;
                Ok(FileOutcome::Reconciled(outcome))
            }
        }
    }
}

fn failure_reason(error: &IngestError) -> &'static str {
    match error {
        IngestError::Normalize(_) => "normalize",
        IngestError::Persistence(_) => "persistence",
        IngestError::Storage(_) => "storage",
    }
}
