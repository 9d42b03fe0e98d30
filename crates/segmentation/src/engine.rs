//! Segmentation engine: evaluates definitions against the dataset and owns
//! the segment lifecycle.

use std::sync::Arc;
use std::time::Duration;

use audience_core::config::{DatasetConfig, QueryConfig};
use audience_core::types::{Column, EvaluationResult, Record};
use audience_core::{AudienceError, AudienceResult, Clock};
use tracing::{debug, info};

use crate::conditions::{self, ConditionSet};
use crate::dataset::Dataset;
use crate::query::{self, QueryEvaluator};
use crate::segment::{validate_name, Segment, SegmentDefinition};
use crate::store::SegmentStore;

/// Matching records of a segment, with the catalog describing their columns.
#[derive(Debug, Clone)]
pub struct ResolvedRows {
    pub columns: Vec<Column>,
    pub rows: Vec<Record>,
}

pub struct SegmentationEngine {
    dataset: Arc<Dataset>,
    query: QueryEvaluator,
    store: Arc<dyn SegmentStore>,
    clock: Arc<dyn Clock>,
    precision: u32,
}

impl SegmentationEngine {
    pub fn new(
        dataset: Arc<Dataset>,
        store: Arc<dyn SegmentStore>,
        clock: Arc<dyn Clock>,
        dataset_config: &DatasetConfig,
        query_config: &QueryConfig,
    ) -> AudienceResult<Self> {
        let query = QueryEvaluator::new(
            &dataset,
            dataset_config.table_name.clone(),
            Duration::from_millis(query_config.timeout_ms),
        )?;
        Ok(Self {
            dataset,
            query,
            store,
            clock,
            precision: dataset_config.percentage_precision,
        })
    }

    /// The field catalog, in dataset column order.
    pub fn catalog(&self) -> &[Column] {
        self.dataset.columns()
    }

    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    pub fn evaluate_conditions(&self, conditions: &ConditionSet) -> AudienceResult<EvaluationResult> {
        let result = conditions::evaluate(conditions, &self.dataset, self.precision)?;
        metrics::counter!("segments.evaluations", "kind" => "conditions").increment(1);
        debug!(
            conditions = conditions.ready_count(),
            matched = result.matched_count,
            total = result.total_count,
            "Conditions evaluated"
        );
        Ok(result)
    }

    pub async fn evaluate_query(&self, query: &str) -> AudienceResult<EvaluationResult> {
        let result = self.query.evaluate(query, self.precision).await?;
        metrics::counter!("segments.evaluations", "kind" => "raw_query").increment(1);
        Ok(result)
    }

    pub async fn evaluate(&self, definition: &SegmentDefinition) -> AudienceResult<EvaluationResult> {
        match definition {
            SegmentDefinition::Conditions(conditions) => self.evaluate_conditions(conditions),
            SegmentDefinition::RawQuery(query) => self.evaluate_query(query).await,
        }
    }

    /// Validates and upserts a segment. Re-saving an existing name keeps its
    /// `created_at`; everything else is replaced.
    pub async fn save_segment(
        &self,
        name: &str,
        definition: SegmentDefinition,
        creator: &str,
    ) -> AudienceResult<Segment> {
        validate_name(name)?;
        match &definition {
            SegmentDefinition::Conditions(conditions) => {
                conditions::compile(conditions, &self.dataset)?;
            }
            SegmentDefinition::RawQuery(q) => {
                query::guard(q)?;
                self.query.evaluate(q, self.precision).await?;
            }
        }

        let now = self.clock.now();
        let created_at = self
            .store
            .get(name)?
            .map(|existing| existing.created_at)
            .unwrap_or(now);
        let segment = Segment {
            name: name.to_string(),
            definition,
            creator: creator.to_string(),
            created_at,
            updated_at: now,
        };
        self.store.put(&segment)?;

        info!(
            segment = %segment.name,
            kind = segment.definition.kind(),
            creator = %segment.creator,
            "Segment saved"
        );
        Ok(segment)
    }

    pub fn get_segment(&self, name: &str) -> AudienceResult<Segment> {
        self.store
            .get(name)?
            .ok_or_else(|| AudienceError::NotFound(format!("segment '{name}'")))
    }

    pub fn list_segments(&self) -> AudienceResult<Vec<Segment>> {
        Ok(self.store.list()?)
    }

    pub fn delete_segment(&self, name: &str) -> AudienceResult<()> {
        if !self.store.delete(name)? {
            return Err(AudienceError::NotFound(format!("segment '{name}'")));
        }
        info!(segment = %name, "Segment deleted");
        Ok(())
    }

    /// Materializes the records a definition selects. Condition segments keep
    /// catalog column order; raw queries keep their result column order.
    pub async fn resolve(&self, definition: &SegmentDefinition) -> AudienceResult<ResolvedRows> {
        match definition {
            SegmentDefinition::Conditions(conditions) => Ok(ResolvedRows {
                columns: self.dataset.columns().to_vec(),
                rows: conditions::matching_rows(conditions, &self.dataset)?,
            }),
            SegmentDefinition::RawQuery(q) => {
                let result = self.query.rows(q).await?;
                Ok(ResolvedRows {
                    columns: result.columns,
                    rows: result.rows,
                })
            }
        }
    }
}
