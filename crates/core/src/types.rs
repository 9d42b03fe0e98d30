use std::collections::BTreeSet;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Declared type of a dataset column, as published by the field catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Date,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::String => "String",
            ColumnType::Integer => "Integer",
            ColumnType::Float => "Float",
            ColumnType::Date => "Date",
        };
        f.write_str(name)
    }
}

/// One entry of the field catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_values: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            unique_values: None,
            description: None,
        }
    }
}

/// A single cell of a customer record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    String(String),
    Integer(i64),
    Float(f64),
    Date(NaiveDate),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::String(s) => f.write_str(s),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

/// One customer record, cells in catalog order.
pub type Record = Vec<Value>;

/// Match statistics for a segment definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    #[serde(rename = "count")]
    pub matched_count: u64,
    #[serde(rename = "total")]
    pub total_count: u64,
    pub percentage: f64,
}

impl EvaluationResult {
    /// Builds a result, rounding the percentage to `precision` decimal places.
    /// An empty dataset yields 0%.
    pub fn new(matched_count: u64, total_count: u64, precision: u32) -> Self {
        debug_assert!(matched_count <= total_count);
        let percentage = if total_count == 0 {
            0.0
        } else {
            let scale = 10f64.powi(precision as i32);
            let raw = 100.0 * matched_count as f64 / total_count as f64;
            (raw * scale).round() / scale
        };
        Self {
            matched_count,
            total_count,
            percentage,
        }
    }
}

/// Output format of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Csv,
    Json,
    #[serde(alias = "columnar")]
    Parquet,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
            ExportFormat::Parquet => "parquet",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Json => "application/json",
            ExportFormat::Parquet => "application/vnd.apache.parquet",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Where an export is delivered. `None` keeps the file in local export storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    #[default]
    #[serde(alias = "local")]
    None,
    Salesforce,
    GoogleAds,
    MetaAds,
}

impl Destination {
    pub const ALL: [Destination; 4] = [
        Destination::None,
        Destination::Salesforce,
        Destination::GoogleAds,
        Destination::MetaAds,
    ];

    /// Human-readable display name for this destination.
    pub fn display_name(&self) -> &'static str {
        match self {
            Destination::None => "Local export storage",
            Destination::Salesforce => "Salesforce CRM",
            Destination::GoogleAds => "Google Ads Customer Match",
            Destination::MetaAds => "Meta Custom Audiences",
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Destination::None => "none",
            Destination::Salesforce => "salesforce",
            Destination::GoogleAds => "google_ads",
            Destination::MetaAds => "meta_ads",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_rounding() {
        let r = EvaluationResult::new(1, 3, 2);
        assert_eq!(r.percentage, 33.33);
        let r = EvaluationResult::new(2, 3, 2);
        assert_eq!(r.percentage, 66.67);
        let r = EvaluationResult::new(2, 3, 0);
        assert_eq!(r.percentage, 67.0);
        let r = EvaluationResult::new(5, 5, 2);
        assert_eq!(r.percentage, 100.0);
    }

    #[test]
    fn test_empty_dataset_is_zero_percent() {
        let r = EvaluationResult::new(0, 0, 2);
        assert_eq!(r.percentage, 0.0);
        assert_eq!(r.total_count, 0);
    }

    #[test]
    fn test_format_and_destination_wire_names() {
        let f: ExportFormat = serde_json::from_str("\"columnar\"").unwrap();
        assert_eq!(f, ExportFormat::Parquet);
        let d: Destination = serde_json::from_str("\"google_ads\"").unwrap();
        assert_eq!(d, Destination::GoogleAds);
        let d: Destination = serde_json::from_str("\"local\"").unwrap();
        assert_eq!(d, Destination::None);
        assert_eq!(serde_json::to_string(&Destination::None).unwrap(), "\"none\"");
    }

    #[test]
    fn test_value_serialization() {
        let date = NaiveDate::from_ymd_opt(2021, 3, 4).unwrap();
        let row = vec![
            Value::Null,
            Value::String("NYC".into()),
            Value::Integer(42),
            Value::Float(1.5),
            Value::Date(date),
        ];
        assert_eq!(
            serde_json::to_string(&row).unwrap(),
            r#"[null,"NYC",42,1.5,"2021-03-04"]"#
        );
        assert_eq!(Value::Date(date).to_string(), "2021-03-04");
        assert_eq!(Value::Null.to_string(), "");
    }
}
