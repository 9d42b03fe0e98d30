//! Connector runtime: per-destination delivery bookkeeping, the delivery
//! timeout, and the registry that selects a connector by destination.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use audience_core::config::ConnectorsConfig;
use audience_core::types::Destination;
use audience_core::{AudienceResult, Clock, DeliveryError, SystemClock};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{info, warn};

use crate::adapters::{create_connector, DestinationConnector};
use crate::types::{ConnectorStats, DeliveryAck, DeliveryMetadata};

/// A registered connector plus its delivery counters.
pub struct ConnectorRuntime {
    connector: Arc<dyn DestinationConnector>,
    deliveries_total: AtomicU64,
    deliveries_succeeded: AtomicU64,
    deliveries_failed: AtomicU64,
    latency_sum_ms: AtomicU64,
    latency_max_ms: AtomicU64,
    last_success_at: parking_lot::Mutex<Option<DateTime<Utc>>>,
    last_failure: parking_lot::Mutex<Option<(DateTime<Utc>, String)>>,
}

impl ConnectorRuntime {
    pub fn new(connector: Arc<dyn DestinationConnector>) -> Self {
        Self {
            connector,
            deliveries_total: AtomicU64::new(0),
            deliveries_succeeded: AtomicU64::new(0),
            deliveries_failed: AtomicU64::new(0),
            latency_sum_ms: AtomicU64::new(0),
            latency_max_ms: AtomicU64::new(0),
            last_success_at: parking_lot::Mutex::new(None),
            last_failure: parking_lot::Mutex::new(None),
        }
    }

    pub fn connector(&self) -> &Arc<dyn DestinationConnector> {
        &self.connector
    }

    fn record_success(&self, latency_ms: u64, at: DateTime<Utc>) {
        self.deliveries_total.fetch_add(1, Ordering::Relaxed);
        self.deliveries_succeeded.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.latency_max_ms.fetch_max(latency_ms, Ordering::Relaxed);
        *self.last_success_at.lock() = Some(at);
    }

    fn record_failure(&self, error: &DeliveryError, at: DateTime<Utc>) {
        self.deliveries_total.fetch_add(1, Ordering::Relaxed);
        self.deliveries_failed.fetch_add(1, Ordering::Relaxed);
        *self.last_failure.lock() = Some((at, error.to_string()));
    }

    pub fn stats(&self) -> ConnectorStats {
        let succeeded = self.deliveries_succeeded.load(Ordering::Relaxed);
        let sum_ms = self.latency_sum_ms.load(Ordering::Relaxed);
        let avg_latency_ms = if succeeded > 0 {
            sum_ms as f64 / succeeded as f64
        } else {
            0.0
        };
        let last_failure = self.last_failure.lock().clone();

        ConnectorStats {
            destination: self.connector.destination(),
            configured: self.connector.is_configured(),
            deliveries_total: self.deliveries_total.load(Ordering::Relaxed),
            deliveries_succeeded: succeeded,
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            avg_latency_ms,
            max_latency_ms: self.latency_max_ms.load(Ordering::Relaxed),
            last_success_at: *self.last_success_at.lock(),
            last_failure_at: last_failure.as_ref().map(|(at, _)| *at),
            last_error: last_failure.map(|(_, e)| e),
        }
    }
}

/// Connectors keyed by destination. Deliveries are bounded by a timeout and
/// never retried here.
pub struct ConnectorRegistry {
    connectors: DashMap<Destination, Arc<ConnectorRuntime>>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl ConnectorRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            connectors: DashMap::new(),
            timeout,
            clock: Arc::new(SystemClock),
        }
    }

    /// Time source for delivery acks and connector statistics.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Registers a connector for every destination from configuration.
    pub fn from_config(
        config: &ConnectorsConfig,
        export_dir: impl Into<PathBuf>,
    ) -> AudienceResult<Self> {
        let export_dir = export_dir.into();
        let registry = Self::new(Duration::from_secs(config.delivery_timeout_secs));
        for destination in Destination::ALL {
            registry.register(create_connector(destination, config, export_dir.clone())?);
        }
        let configured: Vec<&str> = Destination::ALL
            .iter()
            .filter(|d| registry.is_available(**d))
            .map(|d| d.id())
            .collect();
        info!(?configured, "Destination connectors registered");
        Ok(registry)
    }

    /// Registers or replaces the connector for its destination.
    pub fn register(&self, connector: Arc<dyn DestinationConnector>) {
        let destination = connector.destination();
        self.connectors
            .insert(destination, Arc::new(ConnectorRuntime::new(connector)));
    }

    /// Whether a configured connector exists for the destination.
    pub fn is_available(&self, destination: Destination) -> bool {
        self.connectors
            .get(&destination)
            .is_some_and(|rt| rt.connector().is_configured())
    }

    pub fn stats(&self) -> Vec<ConnectorStats> {
        let mut stats: Vec<ConnectorStats> =
            self.connectors.iter().map(|e| e.value().stats()).collect();
        stats.sort_by_key(|s| s.destination.id());
        stats
    }

    pub async fn deliver(
        &self,
        destination: Destination,
        payload: &[u8],
        metadata: &DeliveryMetadata,
    ) -> Result<DeliveryAck, DeliveryError> {
        // Clone out of the map so no shard lock is held across the await.
        let runtime = self
            .connectors
            .get(&destination)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| DeliveryError::NotConfigured(destination.display_name().to_string()))?;

        let started = Instant::now();
        let mut result = match tokio::time::timeout(
            self.timeout,
            runtime.connector().deliver(payload, metadata),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout {
                secs: self.timeout.as_secs(),
            }),
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        let now = self.clock.now();

        match &mut result {
            Ok(ack) => {
                ack.delivered_at = now;
                runtime.record_success(latency_ms, now);
                metrics::counter!("connector.deliveries", "destination" => destination.id(), "outcome" => "success")
                    .increment(1);
                info!(
                    destination = %destination,
                    segment = %metadata.segment_name,
                    reference = %ack.reference,
                    bytes = ack.bytes,
                    latency_ms,
                    "Delivery succeeded"
                );
            }
            Err(e) => {
                runtime.record_failure(e, now);
                metrics::counter!("connector.deliveries", "destination" => destination.id(), "outcome" => "failure")
                    .increment(1);
                warn!(
                    destination = %destination,
                    segment = %metadata.segment_name,
                    error = %e,
                    "Delivery failed"
                );
            }
        }
        metrics::histogram!("connector.delivery_latency_ms", "destination" => destination.id())
            .record(latency_ms as f64);
        result
    }
}
