//! Conversions between catalog rows and Arrow record batches.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, Date32Builder, Float64Builder, Int64Builder, StringBuilder,
};
use arrow::datatypes::{DataType, Date32Type, Field, Float64Type, Int64Type, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use arrow::temporal_conversions::date32_to_datetime;
use arrow::util::display::array_value_to_string;
use audience_core::types::{Column, ColumnType, Record, Value};
use audience_core::{AudienceError, AudienceResult};
use chrono::NaiveDate;

fn arrow_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::String => DataType::Utf8,
        ColumnType::Integer => DataType::Int64,
        ColumnType::Float => DataType::Float64,
        ColumnType::Date => DataType::Date32,
    }
}

/// Arrow schema mirroring the catalog. Every field is nullable.
pub fn arrow_schema(columns: &[Column]) -> SchemaRef {
    let fields: Vec<Field> = columns
        .iter()
        .map(|c| Field::new(c.name.as_str(), arrow_type(c.column_type), true))
        .collect();
    Arc::new(Schema::new(fields))
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    date.signed_duration_since(epoch).num_days() as i32
}

/// Builds a single record batch from rows laid out in catalog order.
pub fn to_record_batch(columns: &[Column], rows: &[Record]) -> AudienceResult<RecordBatch> {
    let schema = arrow_schema(columns);
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());

    for (i, column) in columns.iter().enumerate() {
        let cells = rows.iter().map(|r| r.get(i).unwrap_or(&Value::Null));
        let array: ArrayRef = match column.column_type {
            ColumnType::String => {
                let mut b = StringBuilder::with_capacity(rows.len(), rows.len() * 8);
                cells.for_each(|v| b.append_option(v.as_str()));
                Arc::new(b.finish())
            }
            ColumnType::Integer => {
                let mut b = Int64Builder::with_capacity(rows.len());
                cells.for_each(|v| match v {
                    Value::Integer(n) => b.append_value(*n),
                    _ => b.append_null(),
                });
                Arc::new(b.finish())
            }
            ColumnType::Float => {
                let mut b = Float64Builder::with_capacity(rows.len());
                cells.for_each(|v| b.append_option(v.as_f64()));
                Arc::new(b.finish())
            }
            ColumnType::Date => {
                let mut b = Date32Builder::with_capacity(rows.len());
                cells.for_each(|v| b.append_option(v.as_date().map(days_since_epoch)));
                Arc::new(b.finish())
            }
        };
        arrays.push(array);
    }

    RecordBatch::try_new(schema, arrays)
        .map_err(|e| AudienceError::Render(format!("arrow batch assembly failed: {e}")))
}

fn column_type_of(data_type: &DataType) -> ColumnType {
    match data_type {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => ColumnType::Integer,
        DataType::Float16 | DataType::Float32 | DataType::Float64 | DataType::Decimal128(_, _) => {
            ColumnType::Float
        }
        DataType::Date32 | DataType::Date64 => ColumnType::Date,
        _ => ColumnType::String,
    }
}

/// Catalog describing an arbitrary result schema (e.g. a raw query's output).
pub fn columns_from_schema(schema: &Schema) -> Vec<Column> {
    schema
        .fields()
        .iter()
        .map(|f| Column::new(f.name().clone(), column_type_of(f.data_type())))
        .collect()
}

/// Flattens record batches back into rows. Columns are cast to the canonical
/// Arrow type of their catalog type; anything that cannot be cast is rendered
/// as text.
pub fn rows_from_batches(columns: &[Column], batches: &[RecordBatch]) -> AudienceResult<Vec<Record>> {
    let total: usize = batches.iter().map(|b| b.num_rows()).sum();
    let mut rows: Vec<Record> = Vec::with_capacity(total);

    for batch in batches {
        let mut casted: Vec<(ArrayRef, ColumnType)> = Vec::with_capacity(columns.len());
        for (array, column) in batch.columns().iter().zip(columns) {
            let target = arrow_type(column.column_type);
            let array = if array.data_type() == &target {
                array.clone()
            } else {
                arrow::compute::cast(array, &target).map_err(|e| {
                    AudienceError::Render(format!("cannot convert column '{}': {e}", column.name))
                })?
            };
            casted.push((array, column.column_type));
        }

        for row in 0..batch.num_rows() {
            let record = casted
                .iter()
                .map(|(array, column_type)| cell(array, *column_type, row))
                .collect();
            rows.push(record);
        }
    }

    Ok(rows)
}

fn cell(array: &ArrayRef, column_type: ColumnType, row: usize) -> Value {
    if array.is_null(row) {
        return Value::Null;
    }
    match column_type {
        ColumnType::Integer => Value::Integer(array.as_primitive::<Int64Type>().value(row)),
        ColumnType::Float => Value::Float(array.as_primitive::<Float64Type>().value(row)),
        ColumnType::Date => date32_to_datetime(array.as_primitive::<Date32Type>().value(row))
            .map(|dt| Value::Date(dt.date()))
            .unwrap_or(Value::Null),
        ColumnType::String => match array.as_string_opt::<i32>() {
            Some(strings) => Value::String(strings.value(row).to_string()),
            None => array_value_to_string(array, row)
                .map(Value::String)
                .unwrap_or(Value::Null),
        },
    }
}
