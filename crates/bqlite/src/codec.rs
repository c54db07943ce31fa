// SPDX-License-Identifier: Apache-2.0

//! Conversion between BigQuery's JSON row format and [`Value`]s.
//!
//! Inbound rows arrive as `{"f": [{"v": ...}, ...]}` with scalars encoded as
//! strings. Outbound rows for insertAll are `{"json": {column: value}}`, where
//! every missing cell is written as an explicit JSON `null`.

use arrow::array::{Array, AsArray, RecordBatch};
use arrow::datatypes::{
    DataType, Float16Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type,
    TimeUnit, TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
    TimestampSecondType, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use arrow::util::display::array_value_to_string;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{BqError, BqResult};
use crate::types::{FieldMode, FieldSchema, FieldType, TableSchema};
use crate::value::{RowBatch, Value};

/// One row as returned by the query result endpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    #[serde(default)]
    pub f: Vec<TableCell>,
}

/// One cell of a [`TableRow`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableCell {
    #[serde(default)]
    pub v: JsonValue,
}

/// One row of an insertAll request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsertRow {
    #[serde(rename = "insertId", skip_serializing_if = "Option::is_none")]
    pub insert_id: Option<String>,
    pub json: Map<String, JsonValue>,
}

/// Decode one result page into a row batch aligned with `schema`
pub fn decode_rows(schema: &TableSchema, rows: Vec<TableRow>) -> BqResult<RowBatch> {
    let columns = schema.names().map(str::to_string).collect();
    let mut batch = RowBatch::new(columns)?;

    for (index, row) in rows.into_iter().enumerate() {
        if row.f.len() != schema.len() {
            return Err(BqError::data_shape(format!(
                "result row {} has {} cells, schema has {} columns",
                index,
                row.f.len(),
                schema.len()
            )));
        }
        let values = schema
            .fields
            .iter()
            .zip(row.f)
            .map(|(field, cell)| decode_cell(field, cell.v))
            .collect::<BqResult<Vec<_>>>()?;
        batch.push_row(values)?;
    }

    Ok(batch)
}

/// Decode one cell according to its column
pub fn decode_cell(field: &FieldSchema, raw: JsonValue) -> BqResult<Value> {
    match (field.mode, raw) {
        (_, JsonValue::Null) => Ok(Value::Null),
        (FieldMode::Repeated, JsonValue::Array(items)) => items
            .into_iter()
            .map(|item| {
                let inner = match item {
                    JsonValue::Object(mut cell) => cell.remove("v").unwrap_or(JsonValue::Null),
                    other => other,
                };
                decode_scalar(field, inner)
            })
            .collect::<BqResult<Vec<_>>>()
            .map(Value::Repeated),
        (FieldMode::Repeated, other) => Err(BqError::data_shape(format!(
            "column {} is REPEATED but got {}",
            field.name, other
        ))),
        (_, raw) => decode_scalar(field, raw),
    }
}

fn decode_scalar(field: &FieldSchema, raw: JsonValue) -> BqResult<Value> {
    let invalid = |raw: &JsonValue| {
        BqError::data_shape(format!(
            "invalid {} value for column {}: {}",
            field.field_type, field.name, raw
        ))
    };

    let value = match (field.field_type, &raw) {
        (_, JsonValue::Null) => Value::Null,
        (FieldType::Integer, JsonValue::String(s)) => {
            Value::Integer(s.parse().map_err(|_| invalid(&raw))?)
        }
        (FieldType::Integer, JsonValue::Number(n)) => {
            Value::Integer(n.as_i64().ok_or_else(|| invalid(&raw))?)
        }
        (FieldType::Float, JsonValue::String(s)) => {
            Value::Float(s.parse().map_err(|_| invalid(&raw))?)
        }
        (FieldType::Float, JsonValue::Number(n)) => {
            Value::Float(n.as_f64().ok_or_else(|| invalid(&raw))?)
        }
        (FieldType::Boolean, JsonValue::String(s)) => Value::Boolean(s.eq_ignore_ascii_case("true")),
        (FieldType::Boolean, JsonValue::Bool(b)) => Value::Boolean(*b),
        (FieldType::Timestamp, JsonValue::String(s)) => {
            Value::Timestamp(parse_epoch_micros(s).ok_or_else(|| invalid(&raw))?)
        }
        (
            FieldType::String | FieldType::Date | FieldType::Datetime | FieldType::Time,
            JsonValue::String(s),
        ) => Value::String(s.clone()),
        _ => return Err(invalid(&raw)),
    };
    Ok(value)
}

/// Parse epoch seconds in decimal or scientific notation (`"1.7053128E9"`)
/// into whole microseconds without going through a float
pub fn parse_epoch_micros(text: &str) -> Option<i64> {
    let text = text.trim();
    let (mantissa, exponent) = match text.find(['e', 'E']) {
        Some(pos) => (&text[..pos], text[pos + 1..].parse::<i32>().ok()?),
        None => (text, 0),
    };
    let (negative, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, mantissa.strip_prefix('+').unwrap_or(mantissa)),
    };
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    let digits = format!("{}{}", int_part, frac_part);
    let digits = digits.trim_start_matches('0');
    if digits.len() > 36 {
        return None;
    }
    let mut micros: i128 = if digits.is_empty() { 0 } else { digits.parse().ok()? };

    if negative {
        micros = -micros;
    }

    // Scale to microseconds, flooring sub-microsecond remainders
    let frac_len = i32::try_from(frac_part.len()).ok()?;
    let scale = exponent.checked_add(6)?.checked_sub(frac_len)?;
    if scale >= 0 {
        micros = micros.checked_mul(10i128.checked_pow(scale.unsigned_abs())?)?;
    } else if scale.unsigned_abs() > 36 {
        micros = if micros < 0 { -1 } else { 0 };
    } else {
        micros = micros.div_euclid(10i128.pow(scale.unsigned_abs()));
    }

    i64::try_from(micros).ok()
}

/// Build insertAll rows from a record batch for a table with `schema`.
///
/// Columns are matched by name. Table columns missing from the batch and null
/// cells are both sent as explicit `null`.
pub fn encode_batch(batch: &RecordBatch, schema: &TableSchema) -> BqResult<Vec<InsertRow>> {
    let batch_schema = batch.schema();
    for field in batch_schema.fields() {
        if schema.field(field.name()).is_none() {
            return Err(BqError::data_shape(format!(
                "column {} does not exist in the destination table",
                field.name()
            )));
        }
    }

    let columns: Vec<Option<usize>> = schema
        .fields
        .iter()
        .map(|field| batch_schema.index_of(&field.name).ok())
        .collect();

    (0..batch.num_rows())
        .map(|row| {
            let mut json = Map::with_capacity(schema.len());
            for (field, column) in schema.fields.iter().zip(&columns) {
                let value = match column {
                    Some(index) => cell_value(batch.column(*index).as_ref(), row)?,
                    None => Value::Null,
                };
                json.insert(field.name.clone(), value_to_json(&value)?);
            }
            Ok(InsertRow {
                insert_id: None,
                json,
            })
        })
        .collect()
}

/// Read one Arrow cell as a [`Value`]; null slots become [`Value::Null`]
pub fn cell_value(array: &dyn Array, row: usize) -> BqResult<Value> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }

    let value = match array.data_type() {
        DataType::Int8 => Value::Integer(array.as_primitive::<Int8Type>().value(row) as i64),
        DataType::Int16 => Value::Integer(array.as_primitive::<Int16Type>().value(row) as i64),
        DataType::Int32 => Value::Integer(array.as_primitive::<Int32Type>().value(row) as i64),
        DataType::Int64 => Value::Integer(array.as_primitive::<Int64Type>().value(row)),
        DataType::UInt8 => Value::Integer(array.as_primitive::<UInt8Type>().value(row) as i64),
        DataType::UInt16 => Value::Integer(array.as_primitive::<UInt16Type>().value(row) as i64),
        DataType::UInt32 => Value::Integer(array.as_primitive::<UInt32Type>().value(row) as i64),
        DataType::UInt64 => {
            let v = array.as_primitive::<UInt64Type>().value(row);
            Value::Integer(i64::try_from(v).map_err(|_| {
                BqError::data_shape(format!("unsigned value {} overflows INTEGER", v))
            })?)
        }
        DataType::Float16 => Value::Float(array.as_primitive::<Float16Type>().value(row).to_f64()),
        DataType::Float32 => Value::Float(array.as_primitive::<Float32Type>().value(row) as f64),
        DataType::Float64 => Value::Float(array.as_primitive::<Float64Type>().value(row)),
        DataType::Boolean => Value::Boolean(array.as_boolean().value(row)),
        DataType::Utf8 => Value::String(array.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => Value::String(array.as_string::<i64>().value(row).to_string()),
        DataType::Timestamp(unit, _) => Value::Timestamp(timestamp_micros(array, *unit, row)),
        DataType::List(_) => {
            let items = array.as_list::<i32>().value(row);
            list_values(items.as_ref())?
        }
        DataType::LargeList(_) => {
            let items = array.as_list::<i64>().value(row);
            list_values(items.as_ref())?
        }
        _ => Value::String(array_value_to_string(array, row)?),
    };
    Ok(value)
}

fn list_values(items: &dyn Array) -> BqResult<Value> {
    (0..items.len())
        .map(|i| cell_value(items, i))
        .collect::<BqResult<Vec<_>>>()
        .map(Value::Repeated)
}

fn timestamp_micros(array: &dyn Array, unit: TimeUnit, row: usize) -> i64 {
    match unit {
        TimeUnit::Second => array
            .as_primitive::<TimestampSecondType>()
            .value(row)
            .saturating_mul(1_000_000),
        TimeUnit::Millisecond => array
            .as_primitive::<TimestampMillisecondType>()
            .value(row)
            .saturating_mul(1_000),
        TimeUnit::Microsecond => array.as_primitive::<TimestampMicrosecondType>().value(row),
        TimeUnit::Nanosecond => array
            .as_primitive::<TimestampNanosecondType>()
            .value(row)
            .div_euclid(1_000),
    }
}

/// Wire form of a value for insertAll
pub fn value_to_json(value: &Value) -> BqResult<JsonValue> {
    let json = match value {
        Value::Null => JsonValue::Null,
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Integer(i) => JsonValue::from(*i),
        Value::Float(f) if f.is_finite() => JsonValue::from(*f),
        Value::Float(f) if f.is_nan() => JsonValue::String("NaN".to_string()),
        Value::Float(f) if *f > 0.0 => JsonValue::String("Infinity".to_string()),
        Value::Float(_) => JsonValue::String("-Infinity".to_string()),
        Value::Boolean(b) => JsonValue::Bool(*b),
        Value::Timestamp(micros) => {
            let ts = chrono::DateTime::from_timestamp_micros(*micros).ok_or_else(|| {
                BqError::data_shape(format!("timestamp {} out of range", micros))
            })?;
            JsonValue::String(ts.format("%Y-%m-%d %H:%M:%S%.6f UTC").to_string())
        }
        Value::Repeated(items) => JsonValue::Array(
            items
                .iter()
                .map(value_to_json)
                .collect::<BqResult<Vec<_>>>()?,
        ),
    };
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::{
        ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, ListArray, StringArray,
        TimestampMillisecondArray,
    };
    use arrow::datatypes::{Field, Schema};
    use serde_json::json;

    use crate::materializer::materialize;

    fn cells(values: Vec<JsonValue>) -> TableRow {
        TableRow {
            f: values.into_iter().map(|v| TableCell { v }).collect(),
        }
    }

    fn sample_schema() -> TableSchema {
        TableSchema::from_pairs([
            ("id", FieldType::Integer),
            ("name", FieldType::String),
            ("score", FieldType::Float),
            ("active", FieldType::Boolean),
            ("at", FieldType::Timestamp),
        ])
    }

    #[test]
    fn test_decode_rows() {
        let rows: Vec<TableRow> = serde_json::from_value(json!([
            {"f": [{"v": "1"}, {"v": "alice"}, {"v": "0.5"}, {"v": "true"}, {"v": "1.7053128E9"}]},
            {"f": [{"v": "2"}, {"v": null}, {"v": "NaN"}, {"v": "false"}, {"v": null}]}
        ]))
        .unwrap();

        let batch = decode_rows(&sample_schema(), rows).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(
            batch.rows()[0],
            vec![
                Value::Integer(1),
                Value::from("alice"),
                Value::Float(0.5),
                Value::Boolean(true),
                Value::Timestamp(1_705_312_800_000_000),
            ]
        );
        assert_eq!(batch.rows()[1][1], Value::Null);
        assert!(matches!(batch.rows()[1][2], Value::Float(f) if f.is_nan()));
        assert_eq!(batch.rows()[1][4], Value::Null);
    }

    #[test]
    fn test_decode_repeated() {
        let field = FieldSchema::new("xs", FieldType::Integer).with_mode(FieldMode::Repeated);
        let value = decode_cell(&field, json!([{"v": "1"}, {"v": "2"}])).unwrap();
        assert_eq!(
            value,
            Value::Repeated(vec![Value::Integer(1), Value::Integer(2)])
        );
        assert_eq!(decode_cell(&field, json!([])).unwrap(), Value::Repeated(vec![]));
        assert!(decode_cell(&field, json!("1")).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_cells() {
        let schema = TableSchema::from_pairs([("id", FieldType::Integer)]);
        assert!(decode_rows(&schema, vec![cells(vec![json!("abc")])]).is_err());
        assert!(decode_rows(&schema, vec![cells(vec![json!("1"), json!("2")])]).is_err());
    }

    #[test]
    fn test_parse_epoch_micros() {
        assert_eq!(parse_epoch_micros("1.7053128E9"), Some(1_705_312_800_000_000));
        assert_eq!(
            parse_epoch_micros("1.705312800123456E9"),
            Some(1_705_312_800_123_456)
        );
        assert_eq!(parse_epoch_micros("1705312800"), Some(1_705_312_800_000_000));
        assert_eq!(parse_epoch_micros("0.5"), Some(500_000));
        assert_eq!(parse_epoch_micros("-1.5"), Some(-1_500_000));
        assert_eq!(parse_epoch_micros("1.0E-7"), Some(0));
        assert_eq!(parse_epoch_micros("abc"), None);
        assert_eq!(parse_epoch_micros(""), None);
    }

    #[test]
    fn test_parse_epoch_micros_floors_negative_fractions() {
        assert_eq!(parse_epoch_micros("-1.0000005"), Some(-1_000_001));
        assert_eq!(parse_epoch_micros("-1.0E-7"), Some(-1));
        assert_eq!(parse_epoch_micros("-1E-40"), Some(-1));
        assert_eq!(parse_epoch_micros("1.0000005"), Some(1_000_000));
    }

    #[test]
    fn test_parse_epoch_micros_extreme_exponents() {
        assert_eq!(parse_epoch_micros("1E2147483647"), None);
        assert_eq!(parse_epoch_micros("1E2147483642"), None);
        assert_eq!(parse_epoch_micros("1E-2147483648"), Some(0));
        assert_eq!(parse_epoch_micros("1.5E-2147483648"), Some(0));
        assert_eq!(parse_epoch_micros("1E99999999999"), None);
        assert_eq!(parse_epoch_micros("1E30"), None);
    }

    #[test]
    fn test_encode_null_is_explicit() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, true),
            Field::new("name", DataType::Utf8, true),
            Field::new("score", DataType::Float64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![Some(1), None])) as ArrayRef,
                Arc::new(StringArray::from(vec![None, Some("")])),
                Arc::new(Float64Array::from(vec![None, Some(0.0)])),
            ],
        )
        .unwrap();

        let table = TableSchema::from_pairs([
            ("id", FieldType::Integer),
            ("name", FieldType::String),
            ("score", FieldType::Float),
            ("extra", FieldType::Boolean),
        ]);
        let rows = encode_batch(&batch, &table).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(
            JsonValue::Object(rows[0].json.clone()),
            json!({"id": 1, "name": null, "score": null, "extra": null})
        );
        assert_eq!(
            JsonValue::Object(rows[1].json.clone()),
            json!({"id": null, "name": "", "score": 0.0, "extra": null})
        );
        // Every column key is present, none omitted
        assert!(rows.iter().all(|r| r.json.len() == 4));
    }

    #[test]
    fn test_encode_unknown_column_rejected() {
        let schema = Arc::new(Schema::new(vec![Field::new("other", DataType::Int32, true)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int32Array::from(vec![1])) as ArrayRef],
        )
        .unwrap();
        let table = TableSchema::from_pairs([("id", FieldType::Integer)]);
        assert!(matches!(
            encode_batch(&batch, &table),
            Err(BqError::DataShape(_))
        ));
    }

    #[test]
    fn test_encode_timestamps_and_lists() {
        let list = ListArray::from_iter_primitive::<Int64Type, _, _>(vec![
            Some(vec![Some(1), None]),
            None,
        ]);
        let schema = Arc::new(Schema::new(vec![
            Field::new(
                "at",
                DataType::Timestamp(TimeUnit::Millisecond, None),
                true,
            ),
            Field::new("xs", list.data_type().clone(), true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(TimestampMillisecondArray::from(vec![Some(1_705_312_800_123), None]))
                    as ArrayRef,
                Arc::new(list),
            ],
        )
        .unwrap();

        let table = TableSchema::from_arrow(&schema);
        let rows = encode_batch(&batch, &table).unwrap();
        assert_eq!(
            rows[0].json["at"],
            json!("2024-01-15 10:00:00.123000 UTC")
        );
        assert_eq!(rows[0].json["xs"], json!([1, null]));
        assert_eq!(rows[1].json["at"], JsonValue::Null);
        assert_eq!(rows[1].json["xs"], JsonValue::Null);
    }

    #[test]
    fn test_non_finite_floats() {
        assert_eq!(value_to_json(&Value::Float(f64::NAN)).unwrap(), json!("NaN"));
        assert_eq!(
            value_to_json(&Value::Float(f64::NEG_INFINITY)).unwrap(),
            json!("-Infinity")
        );
        assert_eq!(value_to_json(&Value::Float(1.5)).unwrap(), json!(1.5));
    }

    #[test]
    fn test_insert_row_wire_form() {
        let mut json = Map::new();
        json.insert("a".to_string(), JsonValue::Null);
        let row = InsertRow {
            insert_id: None,
            json,
        };
        assert_eq!(serde_json::to_value(&row).unwrap(), json!({"json": {"a": null}}));
    }

    /// Stand-in for the service: stores the inserted JSON and serves it back
    /// in result-page form, numbers and booleans as strings.
    fn serve_back(rows: &[InsertRow], schema: &TableSchema) -> Vec<TableRow> {
        rows.iter()
            .map(|row| {
                cells(
                    schema
                        .fields
                        .iter()
                        .map(|field| match &row.json[&field.name] {
                            JsonValue::Null => JsonValue::Null,
                            JsonValue::String(s) => json!(s),
                            other => json!(other.to_string()),
                        })
                        .collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_nulls_survive_write_then_read() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, true),
            Field::new("name", DataType::Utf8, true),
            Field::new("flag", DataType::Boolean, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![Some(0), None, Some(7)])) as ArrayRef,
                Arc::new(StringArray::from(vec![Some(""), Some("x"), None])),
                Arc::new(BooleanArray::from(vec![None, Some(false), Some(true)])),
            ],
        )
        .unwrap();

        let table = TableSchema::from_arrow(&schema);
        let inserted = encode_batch(&batch, &table).unwrap();
        let page = decode_rows(&table, serve_back(&inserted, &table)).unwrap();
        let read_back = materialize(vec![Ok(page)], Some(table), Some(3)).unwrap();

        for column in 0..3 {
            let written = batch.column(column);
            let read = read_back.column(column);
            for row in 0..3 {
                assert_eq!(written.is_null(row), read.is_null(row), "column {column} row {row}");
            }
        }
        assert_eq!(read_back.column(0).as_primitive::<Int64Type>().value(0), 0);
        assert_eq!(read_back.column(1).as_string::<i32>().value(0), "");
        assert!(!read_back.column(2).as_boolean().value(1));
    }
}
