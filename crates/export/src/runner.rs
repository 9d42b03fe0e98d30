//! Export job runner: segment snapshot → rows → payload → destination.

use std::sync::Arc;

use audience_cdp::{ConnectorRegistry, DeliveryAck, DeliveryMetadata};
use audience_core::types::{Destination, ExportFormat};
use audience_core::{AudienceError, AudienceResult, Clock};
use audience_segmentation::{ResolvedRows, Segment, SegmentationEngine};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::render::render;

/// One export run. The segment is a snapshot taken when the job was created.
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub segment: Segment,
    pub format: ExportFormat,
    pub destination: Destination,
    pub schedule_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Receipt {
    /// Written to local export storage.
    Stored { path: String, bytes_written: u64 },
    /// Accepted by a remote destination.
    Delivered { ack: DeliveryAck },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Success { row_count: u64, receipt: Receipt },
    Failure { reason: String },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success { .. })
    }
}

pub struct ExportJobRunner {
    engine: Arc<SegmentationEngine>,
    registry: Arc<ConnectorRegistry>,
    clock: Arc<dyn Clock>,
}

impl ExportJobRunner {
    pub fn new(
        engine: Arc<SegmentationEngine>,
        registry: Arc<ConnectorRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine,
            registry,
            clock,
        }
    }

    pub fn engine(&self) -> &Arc<SegmentationEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<ConnectorRegistry> {
        &self.registry
    }

    /// Runs the job to completion. Every failure is folded into
    /// [`JobOutcome::Failure`]; this never returns an error.
    pub async fn run(&self, job: &ExportJob) -> JobOutcome {
        let outcome = match self.execute(job).await {
            Ok((row_count, receipt)) => JobOutcome::Success { row_count, receipt },
            Err(e) => JobOutcome::Failure {
                reason: e.to_string(),
            },
        };

        let status = if outcome.is_success() { "success" } else { "failure" };
        metrics::counter!("export.jobs", "format" => job.format.extension(), "status" => status)
            .increment(1);
        match &outcome {
            JobOutcome::Success { row_count, .. } => info!(
                segment = %job.segment.name,
                format = %job.format,
                destination = %job.destination,
                rows = row_count,
                "Export job succeeded"
            ),
            JobOutcome::Failure { reason } => {
                metrics::counter!("export.failures", "destination" => job.destination.id())
                    .increment(1);
                warn!(
                    segment = %job.segment.name,
                    format = %job.format,
                    destination = %job.destination,
                    reason = %reason,
                    "Export job failed"
                );
            }
        }
        outcome
    }

    async fn execute(&self, job: &ExportJob) -> AudienceResult<(u64, Receipt)> {
        let ResolvedRows { columns, rows } = self.engine.resolve(&job.segment.definition).await?;
        let row_count = rows.len() as u64;

        let format = job.format;
        let payload = tokio::task::spawn_blocking(move || render(format, &columns, &rows))
            .await
            .map_err(|e| AudienceError::Render(format!("render task failed: {e}")))??;

        let metadata = DeliveryMetadata {
            segment_name: job.segment.name.clone(),
            format: job.format,
            timestamp: self.clock.now(),
            row_count,
            schedule_id: job.schedule_id,
        };
        let ack = self
            .registry
            .deliver(job.destination, &payload, &metadata)
            .await?;

        let receipt = match job.destination {
            Destination::None => Receipt::Stored {
                path: ack.reference,
                bytes_written: ack.bytes,
            },
            _ => Receipt::Delivered { ack },
        };
        Ok((row_count, receipt))
    }
}
