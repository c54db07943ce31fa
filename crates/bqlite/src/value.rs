// SPDX-License-Identifier: Apache-2.0

//! Cell values and row batches as delivered by one result page

use std::collections::HashMap;

use crate::error::{BqError, BqResult};
use crate::types::FieldType;

/// One cell.
///
/// `Null` is the only representation of a missing value; it is never folded
/// into zero, `false` or an empty string.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    /// Microseconds since the Unix epoch, UTC
    Timestamp(i64),
    /// Elements of a REPEATED column
    Repeated(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Column type this value would infer; `None` for null or empty lists
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Value::Null => None,
            Value::String(_) => Some(FieldType::String),
            Value::Integer(_) => Some(FieldType::Integer),
            Value::Float(_) => Some(FieldType::Float),
            Value::Boolean(_) => Some(FieldType::Boolean),
            Value::Timestamp(_) => Some(FieldType::Timestamp),
            Value::Repeated(items) => items.iter().find_map(Value::field_type),
        }
    }

    /// Short name of the variant, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::String(_) => "string",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Boolean(_) => "boolean",
            Value::Timestamp(_) => "timestamp",
            Value::Repeated(_) => "repeated",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// One record as an ordered column name to value mapping
pub type Record = Vec<(String, Value)>;

/// Rows of one result page sharing a single column list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl RowBatch {
    /// Empty batch with the given columns
    pub fn new(columns: Vec<String>) -> BqResult<Self> {
        check_unique(&columns)?;
        Ok(Self {
            columns,
            rows: Vec::new(),
        })
    }

    /// Batch from positional rows aligned with `columns`
    pub fn try_new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> BqResult<Self> {
        let mut batch = Self::new(columns)?;
        batch.rows.reserve(rows.len());
        for row in rows {
            batch.push_row(row)?;
        }
        Ok(batch)
    }

    /// Batch from name to value records.
    ///
    /// Every record must carry the same column set as the first; columns keep
    /// the first record's order.
    pub fn from_records(records: Vec<Record>) -> BqResult<Self> {
        let mut records = records.into_iter();
        let Some(first) = records.next() else {
            return Ok(Self::default());
        };

        let (columns, first_row): (Vec<String>, Vec<Value>) = first.into_iter().unzip();
        let mut batch = Self::new(columns)?;
        batch.rows.push(first_row);

        let positions: HashMap<String, usize> = batch
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        for (index, record) in records.enumerate() {
            if record.len() != batch.columns.len() {
                return Err(BqError::data_shape(format!(
                    "record {} has {} columns, expected {}",
                    index + 1,
                    record.len(),
                    batch.columns.len()
                )));
            }

            let mut row = vec![Value::Null; batch.columns.len()];
            let mut seen = vec![false; batch.columns.len()];
            for (name, value) in record {
                let pos = *positions.get(&name).ok_or_else(|| {
                    BqError::data_shape(format!("record {} has unexpected column {}", index + 1, name))
                })?;
                if seen[pos] {
                    return Err(BqError::data_shape(format!(
                        "record {} repeats column {}",
                        index + 1,
                        name
                    )));
                }
                seen[pos] = true;
                row[pos] = value;
            }
            batch.rows.push(row);
        }

        Ok(batch)
    }

    /// Append one positional row
    pub fn push_row(&mut self, row: Vec<Value>) -> BqResult<()> {
        if row.len() != self.columns.len() {
            return Err(BqError::data_shape(format!(
                "row has {} values, expected {}",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<Vec<Value>>) {
        (self.columns, self.rows)
    }
}

fn check_unique(columns: &[String]) -> BqResult<()> {
    let mut seen = std::collections::HashSet::with_capacity(columns.len());
    for name in columns {
        if !seen.insert(name.as_str()) {
            return Err(BqError::data_shape(format!("duplicate column {}", name)));
        }
    }
    Ok(())
}
