//! Fluent API for assembling condition sets.

use chrono::NaiveDate;

use crate::conditions::{Condition, ConditionSet, Threshold};

#[derive(Debug, Default)]
pub struct ConditionSetBuilder {
    conditions: ConditionSet,
}

impl ConditionSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn between(mut self, column: impl Into<String>, min: f64, max: f64) -> Self {
        self.conditions.insert(
            column,
            Condition::range(Some(Threshold::Number(min)), Some(Threshold::Number(max))),
        );
        self
    }

    pub fn at_least(mut self, column: impl Into<String>, min: f64) -> Self {
        self.conditions
            .insert(column, Condition::range(Some(Threshold::Number(min)), None));
        self
    }

    pub fn at_most(mut self, column: impl Into<String>, max: f64) -> Self {
        self.conditions
            .insert(column, Condition::range(None, Some(Threshold::Number(max))));
        self
    }

    pub fn dated_between(
        mut self,
        column: impl Into<String>,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Self {
        self.conditions.insert(
            column,
            Condition::range(from.map(Threshold::Date), to.map(Threshold::Date)),
        );
        self
    }

    pub fn one_of<I, S>(mut self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conditions.insert(column, Condition::one_of(values));
        self
    }

    /// Adds a range with no bounds yet. It is kept but skipped at evaluation.
    pub fn unset(mut self, column: impl Into<String>) -> Self {
        self.conditions.insert(column, Condition::range(None, None));
        self
    }

    pub fn build(self) -> ConditionSet {
        self.conditions
    }
}
