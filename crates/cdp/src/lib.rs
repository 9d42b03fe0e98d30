//! Destination connectors for segment exports: local export storage and the
//! CRM / ad-platform uploads, selected through a registry keyed by destination.

pub mod adapters;
pub mod connector_runtime;
pub mod local;
pub mod types;

pub use adapters::{create_connector, DestinationConnector};
pub use connector_runtime::ConnectorRegistry;
pub use local::LocalConnector;
pub use types::{payload_digest, ConnectorStats, DeliveryAck, DeliveryMetadata};
