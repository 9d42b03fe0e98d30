//! Renders resolved segment rows into export payloads.

use audience_core::types::{Column, ExportFormat, Record, Value};
use audience_core::{AudienceError, AudienceResult};
use audience_segmentation::columnar::to_record_batch;
use parquet::arrow::ArrowWriter;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

pub fn render(format: ExportFormat, columns: &[Column], rows: &[Record]) -> AudienceResult<Vec<u8>> {
    match format {
        ExportFormat::Csv => render_csv(columns, rows),
        ExportFormat::Json => render_json(columns, rows),
        ExportFormat::Parquet => render_parquet(columns, rows),
    }
}

/// CSV with a header row, present even when there are no records.
pub fn render_csv(columns: &[Column], rows: &[Record]) -> AudienceResult<Vec<u8>> {
    let csv_err = |e: csv::Error| AudienceError::Render(format!("csv: {e}"));
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(columns.iter().map(|c| c.name.as_str()))
        .map_err(csv_err)?;
    for row in rows {
        writer
            .write_record(row.iter().map(Value::to_string))
            .map_err(csv_err)?;
    }
    writer
        .into_inner()
        .map_err(|e| AudienceError::Render(format!("csv: {}", e.error())))
}

struct JsonRecord<'a> {
    columns: &'a [Column],
    row: &'a Record,
}

impl Serialize for JsonRecord<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (column, value) in self.columns.iter().zip(self.row) {
            map.serialize_entry(&column.name, value)?;
        }
        map.end()
    }
}

struct JsonRecords<'a> {
    columns: &'a [Column],
    rows: &'a [Record],
}

impl Serialize for JsonRecords<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.rows.len()))?;
        for row in self.rows {
            seq.serialize_element(&JsonRecord {
                columns: self.columns,
                row,
            })?;
        }
        seq.end()
    }
}

/// A JSON array of objects whose keys follow column order. `[]` when empty.
pub fn render_json(columns: &[Column], rows: &[Record]) -> AudienceResult<Vec<u8>> {
    Ok(serde_json::to_vec(&JsonRecords { columns, rows })?)
}

/// Parquet file bytes. The schema is written even when there are no records.
pub fn render_parquet(columns: &[Column], rows: &[Record]) -> AudienceResult<Vec<u8>> {
    let batch = to_record_batch(columns, rows)?;
    let parquet_err = |e: parquet::errors::ParquetError| AudienceError::Render(format!("parquet: {e}"));

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None).map_err(parquet_err)?;
    if batch.num_rows() > 0 {
        writer.write(&batch).map_err(parquet_err)?;
    }
    writer.close().map_err(parquet_err)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::DataType;
    use audience_core::types::ColumnType;
    use chrono::NaiveDate;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    fn columns() -> Vec<Column> {
        vec![
            Column::new("Name", ColumnType::String),
            Column::new("Age", ColumnType::Integer),
            Column::new("Balance", ColumnType::Float),
            Column::new("Opened", ColumnType::Date),
        ]
    }

    fn rows() -> Vec<Record> {
        vec![
            vec![
                Value::String("Smith, Jo".into()),
                Value::Integer(41),
                Value::Float(10.5),
                Value::Date(NaiveDate::from_ymd_opt(2020, 2, 29).unwrap()),
            ],
            vec![Value::String("Lee".into()), Value::Null, Value::Null, Value::Null],
        ]
    }

    #[test]
    fn test_csv_quotes_and_nulls() {
        let out = String::from_utf8(render_csv(&columns(), &rows()).unwrap()).unwrap();
        assert_eq!(
            out,
            "Name,Age,Balance,Opened\n\"Smith, Jo\",41,10.5,2020-02-29\nLee,,,\n"
        );
    }

    #[test]
    fn test_csv_header_without_rows() {
        let out = String::from_utf8(render_csv(&columns(), &[]).unwrap()).unwrap();
        assert_eq!(out, "Name,Age,Balance,Opened\n");
    }

    #[test]
    fn test_json_keys_follow_column_order() {
        let out = String::from_utf8(render_json(&columns(), &rows()).unwrap()).unwrap();
        assert_eq!(
            out,
            r#"[{"Name":"Smith, Jo","Age":41,"Balance":10.5,"Opened":"2020-02-29"},{"Name":"Lee","Age":null,"Balance":null,"Opened":null}]"#
        );
        assert_eq!(render_json(&columns(), &[]).unwrap(), b"[]");
    }

    fn read_parquet(bytes: Vec<u8>) -> Vec<arrow::record_batch::RecordBatch> {
        let mut file = tempfile::tempfile().unwrap();
        std::io::Write::write_all(&mut file, &bytes).unwrap();
        ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_parquet_schema_and_rows() {
        let batches = read_parquet(render_parquet(&columns(), &rows()).unwrap());
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 2);

        let schema = batches[0].schema();
        assert_eq!(schema.field(0).data_type(), &DataType::Utf8);
        assert_eq!(schema.field(1).data_type(), &DataType::Int64);
        assert_eq!(schema.field(2).data_type(), &DataType::Float64);
        assert_eq!(schema.field(3).data_type(), &DataType::Date32);
        assert!(schema.fields().iter().all(|f| f.is_nullable()));
        assert_eq!(batches[0].column(1).null_count(), 1);
    }

    #[test]
    fn test_parquet_without_rows_keeps_schema() {
        let bytes = render_parquet(&columns(), &[]).unwrap();
        let mut file = tempfile::tempfile().unwrap();
        std::io::Write::write_all(&mut file, &bytes).unwrap();
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).unwrap();
        let names: Vec<String> = builder
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(names, vec!["Name", "Age", "Balance", "Opened"]);
    }
}
