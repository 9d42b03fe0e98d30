use audience_core::{AudienceError, AudienceResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conditions::ConditionSet;

const MAX_NAME_LEN: usize = 128;

/// How a segment selects its records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SegmentDefinition {
    Conditions(ConditionSet),
    RawQuery(String),
}

impl SegmentDefinition {
    pub fn kind(&self) -> &'static str {
        match self {
            SegmentDefinition::Conditions(_) => "conditions",
            SegmentDefinition::RawQuery(_) => "raw_query",
        }
    }
}

/// A saved, named segment. The name is the primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub name: String,
    pub definition: SegmentDefinition,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Segment names double as file stems, so path-like names are refused.
pub fn validate_name(name: &str) -> AudienceResult<()> {
    if name.trim().is_empty() {
        return Err(AudienceError::config("segment name is empty"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(AudienceError::config(format!(
            "segment name '{name}' contains a path separator"
        )));
    }
    if name.starts_with('.') {
        return Err(AudienceError::config(format!(
            "segment name '{name}' must not start with '.'"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(AudienceError::config("segment name contains control characters"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(AudienceError::config(format!(
            "segment name is longer than {MAX_NAME_LEN} bytes"
        )));
    }
    Ok(())
}
