//! Column-scoped conditions and their evaluation against the dataset.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use audience_core::types::{Column, ColumnType, EvaluationResult, Record, Value};
use audience_core::{AudienceError, AudienceResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;

/// A range bound: a number for numeric columns, an ISO date for date columns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Threshold {
    Number(f64),
    Date(NaiveDate),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Threshold>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Threshold>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MembershipCondition {
    pub values: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Membership(MembershipCondition),
    Range(RangeCondition),
}

/// Whether a condition takes part in evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionState {
    /// Still being edited: a range with neither bound. Contributes nothing.
    Unset,
    Ready,
}

impl Condition {
    pub fn range(min: Option<Threshold>, max: Option<Threshold>) -> Self {
        Condition::Range(RangeCondition { min, max })
    }

    pub fn one_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Condition::Membership(MembershipCondition {
            values: values.into_iter().map(Into::into).collect(),
        })
    }

    /// An empty membership set is `Ready`: it deliberately matches nothing.
    pub fn state(&self) -> ConditionState {
        match self {
            Condition::Range(RangeCondition {
                min: None,
                max: None,
            }) => ConditionState::Unset,
            _ => ConditionState::Ready,
        }
    }
}

/// Conditions keyed by column name, implicitly AND-ed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionSet(BTreeMap<String, Condition>);

impl ConditionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, condition: Condition) -> Option<Condition> {
        self.0.insert(column.into(), condition)
    }

    pub fn get(&self, column: &str) -> Option<&Condition> {
        self.0.get(column)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Condition)> {
        self.0.iter()
    }

    /// Number of conditions that will actually be evaluated.
    pub fn ready_count(&self) -> usize {
        self.0
            .values()
            .filter(|c| c.state() == ConditionState::Ready)
            .count()
    }
}

impl FromIterator<(String, Condition)> for ConditionSet {
    fn from_iter<T: IntoIterator<Item = (String, Condition)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A condition bound to a column position, with bounds resolved to the
/// column's comparison domain.
#[derive(Debug)]
enum Compiled {
    Numeric {
        idx: usize,
        min: Option<f64>,
        max: Option<f64>,
    },
    Date {
        idx: usize,
        min: Option<NaiveDate>,
        max: Option<NaiveDate>,
    },
    Membership {
        idx: usize,
        values: HashSet<String>,
    },
}

impl Compiled {
    fn matches(&self, row: &Record) -> bool {
        match self {
            Compiled::Numeric { idx, min, max } => match row[*idx].as_f64() {
                Some(v) => min.map_or(true, |m| v >= m) && max.map_or(true, |m| v <= m),
                None => false,
            },
            Compiled::Date { idx, min, max } => match row[*idx].as_date() {
                Some(v) => min.map_or(true, |m| v >= m) && max.map_or(true, |m| v <= m),
                None => false,
            },
            Compiled::Membership { idx, values } => match &row[*idx] {
                Value::String(s) => values.contains(s),
                _ => false,
            },
        }
    }
}

fn numeric_bound(column: &Column, bound: Option<Threshold>) -> AudienceResult<Option<f64>> {
    match bound {
        None => Ok(None),
        Some(Threshold::Number(n)) => Ok(Some(n)),
        Some(Threshold::Date(d)) => Err(AudienceError::config(format!(
            "column '{}' is {}, got date bound {}",
            column.name, column.column_type, d
        ))),
    }
}

fn date_bound(column: &Column, bound: Option<Threshold>) -> AudienceResult<Option<NaiveDate>> {
    match bound {
        None => Ok(None),
        Some(Threshold::Date(d)) => Ok(Some(d)),
        Some(Threshold::Number(n)) => Err(AudienceError::config(format!(
            "column '{}' is a Date, got numeric bound {}",
            column.name, n
        ))),
    }
}

fn compile_one(
    idx: usize,
    column: &Column,
    condition: &Condition,
) -> AudienceResult<Compiled> {
    match (column.column_type, condition) {
        (ColumnType::Integer | ColumnType::Float, Condition::Range(r)) => Ok(Compiled::Numeric {
            idx,
            min: numeric_bound(column, r.min)?,
            max: numeric_bound(column, r.max)?,
        }),
        (ColumnType::Date, Condition::Range(r)) => Ok(Compiled::Date {
            idx,
            min: date_bound(column, r.min)?,
            max: date_bound(column, r.max)?,
        }),
        (ColumnType::String, Condition::Membership(m)) => {
            if let Some(known) = &column.unique_values {
                if let Some(unknown) = m.values.iter().find(|v| !known.contains(*v)) {
                    return Err(AudienceError::config(format!(
                        "'{}' is not a known value of column '{}'",
                        unknown, column.name
                    )));
                }
            }
            Ok(Compiled::Membership {
                idx,
                values: m.values.iter().cloned().collect(),
            })
        }
        (ColumnType::String, Condition::Range(_)) => Err(AudienceError::config(format!(
            "range condition on String column '{}'",
            column.name
        ))),
        (column_type, Condition::Membership(_)) => Err(AudienceError::config(format!(
            "membership condition on {} column '{}'",
            column_type, column.name
        ))),
    }
}

/// Resolves a condition set against the catalog. Type dispatch uses the
/// catalog's declared column type only.
///
/// Returns `NoConditions` when nothing is left to evaluate.
pub fn compile(conditions: &ConditionSet, dataset: &Dataset) -> AudienceResult<CompiledConditions> {
    let mut compiled = Vec::with_capacity(conditions.len());
    for (name, condition) in conditions.iter() {
        let (idx, column) = dataset
            .column(name)
            .ok_or_else(|| AudienceError::config(format!("unknown column '{name}'")))?;
        if condition.state() == ConditionState::Unset {
            continue;
        }
        compiled.push(compile_one(idx, column, condition)?);
    }
    if compiled.is_empty() {
        return Err(AudienceError::NoConditions);
    }
    Ok(CompiledConditions(compiled))
}

#[derive(Debug)]
pub struct CompiledConditions(Vec<Compiled>);

impl CompiledConditions {
    pub fn matches(&self, row: &Record) -> bool {
        self.0.iter().all(|c| c.matches(row))
    }
}

/// Counts matching records with a full scan of the dataset.
pub fn evaluate(
    conditions: &ConditionSet,
    dataset: &Dataset,
    precision: u32,
) -> AudienceResult<EvaluationResult> {
    let predicate = compile(conditions, dataset)?;
    let matched = dataset.rows().iter().filter(|r| predicate.matches(r)).count();
    Ok(EvaluationResult::new(
        matched as u64,
        dataset.len() as u64,
        precision,
    ))
}

/// Clones out the matching records, in dataset order.
pub fn matching_rows(conditions: &ConditionSet, dataset: &Dataset) -> AudienceResult<Vec<Record>> {
    let predicate = compile(conditions, dataset)?;
    Ok(dataset
        .rows()
        .iter()
        .filter(|r| predicate.matches(r))
        .cloned()
        .collect())
}
