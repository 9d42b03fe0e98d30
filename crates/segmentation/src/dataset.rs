//! Read-only customer dataset and the field catalog describing it.
//!
//! The dataset is loaded once at startup and shared behind an `Arc`; nothing
//! in the engine mutates it afterwards.

use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::path::Path;

use audience_core::config::{ColumnOverride, DatasetConfig};
use audience_core::types::{Column, ColumnType, Record, Value};
use audience_core::{AudienceError, AudienceResult};
use chrono::NaiveDate;
use tracing::{debug, info};

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone)]
pub struct Dataset {
    columns: Vec<Column>,
    rows: Vec<Record>,
    index: HashMap<String, usize>,
}

impl Dataset {
    /// Builds a dataset from an explicit catalog and rows. Every row must have
    /// one cell per column, and every non-null cell must match its column type.
    pub fn new(columns: Vec<Column>, rows: Vec<Record>) -> AudienceResult<Self> {
        let mut index = HashMap::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            if index.insert(column.name.clone(), i).is_some() {
                return Err(AudienceError::config(format!(
                    "duplicate column '{}' in catalog",
                    column.name
                )));
            }
        }

        for (row_no, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(AudienceError::config(format!(
                    "row {} has {} cells, catalog has {} columns",
                    row_no,
                    row.len(),
                    columns.len()
                )));
            }
            for (cell, column) in row.iter().zip(&columns) {
                if !cell_matches_type(cell, column.column_type) {
                    return Err(AudienceError::config(format!(
                        "row {} column '{}': value {:?} is not a {}",
                        row_no, column.name, cell, column.column_type
                    )));
                }
            }
        }

        Ok(Self {
            columns,
            rows,
            index,
        })
    }

    /// Loads a CSV file, inferring the catalog from its contents.
    pub fn from_csv_path(path: impl AsRef<Path>, config: &DatasetConfig) -> AudienceResult<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            AudienceError::config(format!("cannot open dataset {}: {}", path.display(), e))
        })?;
        let dataset = Self::from_csv_reader(file, config)?;
        info!(
            path = %path.display(),
            rows = dataset.len(),
            columns = dataset.columns.len(),
            "Dataset loaded"
        );
        Ok(dataset)
    }

    /// Parses CSV from any reader. Column types are inferred per column
    /// (Integer, then Float, then Date, falling back to String) unless a
    /// config override forces one. Empty cells are nulls.
    pub fn from_csv_reader<R: Read>(reader: R, config: &DatasetConfig) -> AudienceResult<Self> {
        let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers: Vec<String> = csv_reader
            .headers()
            .map_err(|e| AudienceError::config(format!("invalid dataset header: {e}")))?
            .iter()
            .map(str::to_string)
            .collect();

        let mut raw: Vec<Vec<String>> = Vec::new();
        for (line, record) in csv_reader.records().enumerate() {
            let record = record
                .map_err(|e| AudienceError::config(format!("invalid dataset row {}: {e}", line + 1)))?;
            raw.push(record.iter().map(str::to_string).collect());
        }

        let overrides: HashMap<&str, &ColumnOverride> =
            config.columns.iter().map(|o| (o.name.as_str(), o)).collect();

        let mut columns = Vec::with_capacity(headers.len());
        for (i, name) in headers.iter().enumerate() {
            let cells = raw.iter().map(|r| r[i].as_str());
            let override_ = overrides.get(name.as_str());
            let column_type = override_
                .and_then(|o| o.column_type)
                .unwrap_or_else(|| infer_type(cells.clone()));

            let mut column = Column::new(name.clone(), column_type);
            if column_type == ColumnType::String {
                let distinct: BTreeSet<String> = cells
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect();
                if distinct.len() <= config.max_categorical_values {
                    column.unique_values = Some(distinct);
                }
            }
            column.description = override_.and_then(|o| o.description.clone());
            debug!(column = %name, column_type = %column_type, "Inferred column type");
            columns.push(column);
        }

        let mut rows = Vec::with_capacity(raw.len());
        for (row_no, cells) in raw.into_iter().enumerate() {
            let mut row = Vec::with_capacity(columns.len());
            for (cell, column) in cells.into_iter().zip(&columns) {
                let value = parse_cell(cell, column.column_type).ok_or_else(|| {
                    AudienceError::config(format!(
                        "row {} column '{}' is not a valid {}",
                        row_no + 1,
                        column.name,
                        column.column_type
                    ))
                })?;
                row.push(value);
            }
            rows.push(row);
        }

        Self::new(columns, rows)
    }

    /// The field catalog, in dataset column order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<(usize, &Column)> {
        self.index.get(name).map(|&i| (i, &self.columns[i]))
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn cell_matches_type(cell: &Value, column_type: ColumnType) -> bool {
    matches!(
        (cell, column_type),
        (Value::Null, _)
            | (Value::String(_), ColumnType::String)
            | (Value::Integer(_), ColumnType::Integer)
            | (Value::Float(_), ColumnType::Float)
            | (Value::Date(_), ColumnType::Date)
    )
}

fn infer_type<'a>(cells: impl Iterator<Item = &'a str> + Clone) -> ColumnType {
    let mut present = cells.filter(|c| !c.is_empty()).peekable();
    if present.peek().is_none() {
        return ColumnType::String;
    }
    if present.clone().all(|c| c.parse::<i64>().is_ok()) {
        ColumnType::Integer
    } else if present.clone().all(|c| c.parse::<f64>().is_ok()) {
        ColumnType::Float
    } else if present.all(|c| NaiveDate::parse_from_str(c, DATE_FORMAT).is_ok()) {
        ColumnType::Date
    } else {
        ColumnType::String
    }
}

fn parse_cell(cell: String, column_type: ColumnType) -> Option<Value> {
    if cell.is_empty() {
        return Some(Value::Null);
    }
    match column_type {
        ColumnType::String => Some(Value::String(cell)),
        ColumnType::Integer => cell.parse().ok().map(Value::Integer),
        ColumnType::Float => cell.parse().ok().map(Value::Float),
        ColumnType::Date => NaiveDate::parse_from_str(&cell, DATE_FORMAT)
            .ok()
            .map(Value::Date),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE_CSV: &str = "\
CustomerID,Name,Age,Location,Balance,AccountOpenDate
C001,Alice,34,NYC,1200.50,2019-04-01
C002,Bob,17,LA,80.00,2021-07-15
C003,Carol,65,NYC,15000.00,2010-01-20
C004,Dan,45,Chicago,,2018-11-30
C005,Eve,,NYC,530.25,2022-02-02
C006,Frank,70,LA,99.99,2015-06-06
";

    pub(crate) fn sample_dataset() -> Dataset {
        Dataset::from_csv_reader(SAMPLE_CSV.as_bytes(), &DatasetConfig::default()).unwrap()
    }

    #[test]
    fn test_infers_catalog() {
        let ds = sample_dataset();
        let types: Vec<ColumnType> = ds.columns().iter().map(|c| c.column_type).collect();
        assert_eq!(
            types,
            vec![
                ColumnType::String,
                ColumnType::String,
                ColumnType::Integer,
                ColumnType::String,
                ColumnType::Float,
                ColumnType::Date,
            ]
        );
        assert_eq!(ds.len(), 6);

        let (_, location) = ds.column("Location").unwrap();
        let values: Vec<&str> = location
            .unique_values
            .as_ref()
            .unwrap()
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(values, vec!["Chicago", "LA", "NYC"]);
    }

    #[test]
    fn test_empty_cells_are_null() {
        let ds = sample_dataset();
        let (age, _) = ds.column("Age").unwrap();
        let (balance, _) = ds.column("Balance").unwrap();
        assert!(ds.rows()[4][age].is_null());
        assert!(ds.rows()[3][balance].is_null());
    }

    #[test]
    fn test_cardinality_cap_drops_unique_values() {
        let config = DatasetConfig {
            max_categorical_values: 3,
            ..DatasetConfig::default()
        };
        let ds = Dataset::from_csv_reader(SAMPLE_CSV.as_bytes(), &config).unwrap();
        assert!(ds.column("CustomerID").unwrap().1.unique_values.is_none());
        assert!(ds.column("Location").unwrap().1.unique_values.is_some());
    }

    #[test]
    fn test_override_forces_type_and_description() {
        let config = DatasetConfig {
            columns: vec![ColumnOverride {
                name: "Age".into(),
                column_type: Some(ColumnType::Float),
                description: Some("Age of the customer in years".into()),
            }],
            ..DatasetConfig::default()
        };
        let ds = Dataset::from_csv_reader(SAMPLE_CSV.as_bytes(), &config).unwrap();
        let (idx, age) = ds.column("Age").unwrap();
        assert_eq!(age.column_type, ColumnType::Float);
        assert_eq!(age.description.as_deref(), Some("Age of the customer in years"));
        assert_eq!(ds.rows()[0][idx], Value::Float(34.0));
    }

    #[test]
    fn test_override_with_unparseable_cell_is_rejected() {
        let config = DatasetConfig {
            columns: vec![ColumnOverride {
                name: "Location".into(),
                column_type: Some(ColumnType::Integer),
                description: None,
            }],
            ..DatasetConfig::default()
        };
        let err = Dataset::from_csv_reader(SAMPLE_CSV.as_bytes(), &config).unwrap_err();
        assert!(matches!(err, AudienceError::Configuration(_)));
    }

    #[test]
    fn test_new_rejects_ragged_rows() {
        let columns = vec![Column::new("a", ColumnType::Integer)];
        let err = Dataset::new(columns, vec![vec![Value::Integer(1), Value::Null]]).unwrap_err();
        assert!(err.to_string().contains("row 0"));
    }
}
