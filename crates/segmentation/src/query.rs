//! Read-only raw-query evaluation on an embedded DataFusion context.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use audience_core::types::{Column, EvaluationResult, Record};
use audience_core::{AudienceError, AudienceResult, QueryError};
use datafusion::common::TableReference;
use datafusion::datasource::MemTable;
use datafusion::execution::context::SQLOptions;
use datafusion::prelude::{DataFrame, SessionConfig, SessionContext};
use futures::StreamExt;
use regex::Regex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::columnar::{columns_from_schema, rows_from_batches, to_record_batch};
use crate::dataset::Dataset;

fn literal_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)'(?:[^']|'')*'|"(?:[^"]|"")*"|--[^\n]*|/\*.*?\*/"#)
            .expect("valid literal pattern")
    })
}

fn mutating_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(insert|update|delete|drop|alter|create|truncate|merge|grant|revoke|copy|attach|detach|vacuum|pragma)\b|\breplace\s+into\b",
        )
        .expect("valid keyword pattern")
    })
}

fn leading_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^[\s(]*(select|with|values)\b").expect("valid leading pattern"))
}

/// Rejects anything that is not a single read-only statement. String
/// literals, quoted identifiers and comments are blanked before keywords are
/// inspected.
pub fn guard(query: &str) -> Result<(), QueryError> {
    let stripped = literal_pattern().replace_all(query, |caps: &regex::Captures<'_>| {
        match caps[0].as_bytes()[0] {
            b'\'' => "''",
            b'"' => "\"\"",
            _ => " ",
        }
    });
    let body = stripped.trim().trim_end_matches(';').trim_end();

    if body.is_empty() {
        return Err(QueryError::Rejected("query is empty".into()));
    }
    if body.contains(';') {
        return Err(QueryError::Rejected(
            "only a single statement is allowed".into(),
        ));
    }
    if let Some(m) = mutating_pattern().find(body) {
        return Err(QueryError::Rejected(format!(
            "'{}' is not allowed in a read-only query",
            m.as_str().to_uppercase()
        )));
    }
    if !leading_pattern().is_match(body) {
        return Err(QueryError::Rejected(
            "query must start with SELECT, WITH or VALUES".into(),
        ));
    }
    Ok(())
}

fn execution(e: impl std::fmt::Display) -> QueryError {
    QueryError::Execution(e.to_string())
}

/// Raised once the caller stops waiting for a query.
#[derive(Clone, Default)]
struct Cancel(Arc<AtomicBool>);

impl Cancel {
    fn check(&self) -> Result<(), QueryError> {
        if self.0.load(Ordering::Relaxed) {
            return Err(QueryError::Execution("query cancelled".into()));
        }
        Ok(())
    }
}

struct CancelOnDrop(Cancel);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0 .0.store(true, Ordering::Relaxed);
    }
}

/// Runs `work` on a dedicated thread with its own runtime and waits at most
/// `timeout` for it. A CPU-bound plan never yields, so the deadline has to be
/// enforced from outside the thread executing it. On expiry, or when the
/// caller is dropped, the worker is cancelled and stops at its next batch.
async fn isolated<T, F, Fut>(timeout: Duration, work: F) -> Result<T, QueryError>
where
    T: Send + 'static,
    F: FnOnce(Cancel) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, QueryError>>,
{
    let cancel = Cancel::default();
    let _cancel_on_drop = CancelOnDrop(cancel.clone());
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("audience-query".into())
        .spawn(move || {
            let result = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime.block_on(work(cancel)),
                Err(e) => Err(execution(e)),
            };
            let _ = tx.send(result);
        })
        .map_err(execution)?;

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(QueryError::Execution(
            "query worker exited without a result".into(),
        )),
        Err(_) => Err(QueryError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Pulls the plan's output one batch at a time, checking for cancellation
/// between batches.
async fn drain(
    df: DataFrame,
    cancel: &Cancel,
    mut each: impl FnMut(RecordBatch),
) -> Result<(), QueryError> {
    let mut stream = df.execute_stream().await.map_err(execution)?;
    while let Some(batch) = stream.next().await {
        cancel.check()?;
        each(batch.map_err(execution)?);
    }
    Ok(())
}

/// Rows produced by a raw query, with a catalog describing the result schema.
#[derive(Debug, Clone)]
pub struct QueryRows {
    pub columns: Vec<Column>,
    pub rows: Vec<Record>,
}

/// The dataset as one shared Arrow batch plus the name queries address it by.
#[derive(Clone)]
struct QueryTable {
    name: String,
    batch: RecordBatch,
    total: u64,
}

impl QueryTable {
    fn context(&self) -> Result<SessionContext, QueryError> {
        let config = SessionConfig::new()
            .set_bool("datafusion.sql_parser.enable_ident_normalization", false);
        let ctx = SessionContext::new_with_config(config);
        let table = MemTable::try_new(self.batch.schema(), vec![vec![self.batch.clone()]])
            .map_err(execution)?;
        ctx.register_table(TableReference::bare(self.name.clone()), Arc::new(table))
            .map_err(execution)?;
        Ok(ctx)
    }

    async fn plan(&self, query: &str) -> Result<DataFrame, QueryError> {
        let options = SQLOptions::new()
            .with_allow_ddl(false)
            .with_allow_dml(false)
            .with_allow_statements(false);
        self.context()?
            .sql_with_options(query, options)
            .await
            .map_err(execution)
    }

    fn check_subset(&self, returned: u64) -> Result<(), QueryError> {
        if returned > self.total {
            return Err(QueryError::NotASubset {
                returned,
                total: self.total,
            });
        }
        Ok(())
    }
}

pub struct QueryEvaluator {
    table: QueryTable,
    timeout: Duration,
}

impl QueryEvaluator {
    /// Materializes the dataset as a single Arrow batch shared by every query.
    pub fn new(dataset: &Dataset, table_name: impl Into<String>, timeout: Duration) -> AudienceResult<Self> {
        let name = table_name.into();
        if name.trim().is_empty() {
            return Err(AudienceError::config("query table name is empty"));
        }
        let batch = to_record_batch(dataset.columns(), dataset.rows())?;
        Ok(Self {
            table: QueryTable {
                name,
                batch,
                total: dataset.len() as u64,
            },
            timeout,
        })
    }

    /// Counts the rows a query returns against the dataset size.
    pub async fn evaluate(&self, query: &str, precision: u32) -> Result<EvaluationResult, QueryError> {
        let result = match guard(query) {
            Ok(()) => {
                let table = self.table.clone();
                let query = query.to_string();
                isolated(self.timeout, move |cancel| async move {
                    let df = table.plan(&query).await?;
                    let mut returned = 0u64;
                    drain(df, &cancel, |batch| returned += batch.num_rows() as u64).await?;
                    table.check_subset(returned)?;
                    Ok(EvaluationResult::new(returned, table.total, precision))
                })
                .await
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(r) => debug!(matched = r.matched_count, total = r.total_count, "Raw query evaluated"),
            Err(e) => {
                metrics::counter!("query.errors").increment(1);
                warn!(error = %e, "Raw query failed");
            }
        }
        result
    }

    /// Materializes the rows a query returns, in result-schema column order.
    pub async fn rows(&self, query: &str) -> Result<QueryRows, QueryError> {
        let result = match guard(query) {
            Ok(()) => {
                let table = self.table.clone();
                let query = query.to_string();
                isolated(self.timeout, move |cancel| async move {
                    let df = table.plan(&query).await?;
                    let schema: Schema = df.schema().into();
                    let mut batches = Vec::new();
                    drain(df, &cancel, |batch| batches.push(batch)).await?;
                    let returned: usize = batches.iter().map(|b| b.num_rows()).sum();
                    table.check_subset(returned as u64)?;

                    let columns = columns_from_schema(&schema);
                    let rows = rows_from_batches(&columns, &batches).map_err(execution)?;
                    Ok(QueryRows { columns, rows })
                })
                .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            metrics::counter!("query.errors").increment(1);
            warn!(error = %e, "Raw query materialization failed");
        }
        result
    }
}
