//! Segment evaluation over a tabular customer dataset: field catalog,
//! structured conditions, read-only raw queries, and segment persistence.

pub mod builder;
pub mod columnar;
pub mod conditions;
pub mod dataset;
pub mod engine;
pub mod query;
pub mod segment;
pub mod store;

pub use builder::ConditionSetBuilder;
pub use conditions::{Condition, ConditionSet, ConditionState, Threshold};
pub use dataset::Dataset;
pub use engine::{ResolvedRows, SegmentationEngine};
pub use segment::{Segment, SegmentDefinition};
pub use store::{InMemorySegmentStore, SegmentStore, YamlSegmentStore};
