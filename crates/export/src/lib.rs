//! Segment exports: rendering to CSV, JSON or Parquet and running export
//! jobs against the destination connectors.

pub mod render;
pub mod runner;

pub use render::render;
pub use runner::{ExportJob, ExportJobRunner, JobOutcome, Receipt};
