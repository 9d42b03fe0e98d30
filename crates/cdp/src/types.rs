use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use audience_core::types::{Destination, ExportFormat};

/// Describes a payload handed to a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    pub segment_name: String,
    pub format: ExportFormat,
    pub timestamp: DateTime<Utc>,
    pub row_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<Uuid>,
}

/// Acknowledgement returned by a connector after a successful delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub destination: Destination,
    /// Destination-side reference: a file path for local storage, an upload
    /// or job id for remote platforms.
    pub reference: String,
    pub bytes: u64,
    /// Hex SHA-256 of the delivered payload.
    pub digest: String,
    /// Stamped by the registry from its clock once the connector returns.
    pub delivered_at: DateTime<Utc>,
}

/// Hex SHA-256 of a payload.
pub fn payload_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Point-in-time counters for one registered connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorStats {
    pub destination: Destination,
    pub configured: bool,
    pub deliveries_total: u64,
    pub deliveries_succeeded: u64,
    pub deliveries_failed: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}
