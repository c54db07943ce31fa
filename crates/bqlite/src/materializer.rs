// SPDX-License-Identifier: Apache-2.0

//! Assembles paged query results into a single Arrow record batch.
//!
//! Each column gets one Arrow builder, created with capacity for the expected
//! total row count. Page values are appended straight into those builders, so
//! there is one pass over the data and no per-page table is ever built and
//! later concatenated.
//!
//! Without an explicit schema a column's type is taken from its first non-null
//! value, whichever page it arrives in. Nulls seen before that are counted and
//! back-filled once the builder exists; a column that never sees a value is
//! STRING.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{
    make_builder, ArrayBuilder, ArrayRef, BooleanBuilder, Float64Builder, Int64Builder,
    ListBuilder, RecordBatch, RecordBatchOptions, StringBuilder, TimestampMicrosecondBuilder,
};
use arrow_schema::Schema;
use tracing::{debug, trace};

use crate::error::{BqError, BqResult};
use crate::types::{FieldMode, FieldSchema, FieldType, TableSchema};
use crate::value::{RowBatch, Value};

/// Builder capacity when the total row count is unknown
const DEFAULT_CAPACITY: usize = 1024;

/// Single-pass accumulator for row batches
pub struct ResultMaterializer {
    expected_rows: Option<usize>,
    columns: Option<Columns>,
    rows: usize,
    poisoned: bool,
}

/// One output column; the builder exists once the column type is known
struct Column {
    name: String,
    typed: Option<(FieldSchema, Box<dyn ArrayBuilder>)>,
    /// Untyped values seen before the first typed one: nulls, and lists
    /// holding no typed element
    pending: Vec<Value>,
}

impl Column {
    fn typed(field: FieldSchema, capacity: usize) -> Self {
        let builder = make_builder(field.arrow_field().data_type(), capacity);
        Self {
            name: field.name.clone(),
            typed: Some((field, builder)),
            pending: Vec::new(),
        }
    }

    fn untyped(name: String) -> Self {
        Self {
            name,
            typed: None,
            pending: Vec::new(),
        }
    }

    fn append(&mut self, value: Value, capacity: usize) -> BqResult<()> {
        if let Some((field, builder)) = self.typed.as_mut() {
            return append_value(&mut **builder, field, value);
        }
        match value.field_type() {
            None => {
                self.pending.push(value);
                Ok(())
            }
            Some(field_type) => {
                let mode = mode_of(&value);
                self.resolve(field_type, mode, capacity)?;
                self.append(value, capacity)
            }
        }
    }

    /// Fix the column type and back-fill the values held so far
    fn resolve(&mut self, field_type: FieldType, mode: FieldMode, capacity: usize) -> BqResult<()> {
        let field = FieldSchema::new(self.name.clone(), field_type).with_mode(mode);
        trace!(
            "Column {} resolved as {} after {} untyped value(s)",
            self.name,
            field_type,
            self.pending.len()
        );
        let mut builder = make_builder(field.arrow_field().data_type(), capacity);
        for value in std::mem::take(&mut self.pending) {
            append_value(&mut *builder, &field, value)?;
        }
        self.typed = Some((field, builder));
        Ok(())
    }

    fn finish(&mut self, capacity: usize) -> BqResult<(FieldSchema, ArrayRef)> {
        if self.typed.is_none() {
            let mode = if self.pending.iter().any(|v| matches!(v, Value::Repeated(_))) {
                FieldMode::Repeated
            } else {
                FieldMode::Nullable
            };
            self.resolve(FieldType::String, mode, capacity)?;
        }
        match self.typed.as_mut() {
            Some((field, builder)) => Ok((field.clone(), builder.finish())),
            None => Err(BqError::data_shape(format!(
                "column {} has no type",
                self.name
            ))),
        }
    }
}

fn mode_of(value: &Value) -> FieldMode {
    match value {
        Value::Repeated(_) => FieldMode::Repeated,
        _ => FieldMode::Nullable,
    }
}

struct Columns {
    positions: HashMap<String, usize>,
    columns: Vec<Column>,
}

impl Columns {
    fn from_schema(schema: TableSchema, capacity: usize) -> Self {
        Self::build(
            schema
                .fields
                .into_iter()
                .map(|field| Column::typed(field, capacity))
                .collect(),
        )
    }

    fn from_names(names: &[String]) -> Self {
        Self::build(names.iter().cloned().map(Column::untyped).collect())
    }

    fn build(columns: Vec<Column>) -> Self {
        let positions = columns
            .iter()
            .enumerate()
            .map(|(i, column)| (column.name.clone(), i))
            .collect();
        Self { positions, columns }
    }

    /// Maps each batch column to its result position, rejecting other column sets
    fn align(&self, batch: &RowBatch) -> BqResult<Vec<usize>> {
        let names = batch.columns();
        if names.len() != self.columns.len() {
            return Err(self.mismatch(names));
        }
        names
            .iter()
            .map(|name| {
                self.positions
                    .get(name)
                    .copied()
                    .ok_or_else(|| self.mismatch(names))
            })
            .collect()
    }

    fn mismatch(&self, names: &[String]) -> BqError {
        BqError::data_shape(format!(
            "batch columns [{}] do not match result columns [{}]",
            names.join(", "),
            self.columns
                .iter()
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }
}

impl ResultMaterializer {
    /// Materializer whose column types are inferred from the values
    pub fn new(expected_rows: Option<usize>) -> Self {
        Self {
            expected_rows,
            columns: None,
            rows: 0,
            poisoned: false,
        }
    }

    /// Materializer with a known result schema
    pub fn with_schema(schema: TableSchema, expected_rows: Option<usize>) -> Self {
        let capacity = expected_rows.unwrap_or(DEFAULT_CAPACITY);
        Self {
            expected_rows,
            columns: Some(Columns::from_schema(schema, capacity)),
            rows: 0,
            poisoned: false,
        }
    }

    /// Rows accumulated so far
    pub fn rows(&self) -> usize {
        self.rows
    }

    fn capacity(&self) -> usize {
        self.expected_rows.unwrap_or(DEFAULT_CAPACITY)
    }

    /// Append one batch.
    ///
    /// After an error the materializer refuses further batches and `finish`.
    pub fn push_batch(&mut self, batch: RowBatch) -> BqResult<()> {
        if self.poisoned {
            return Err(BqError::data_shape(
                "materializer already failed on an earlier batch",
            ));
        }
        let result = self.append(batch);
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn append(&mut self, batch: RowBatch) -> BqResult<()> {
        let capacity = self.capacity().max(batch.num_rows());
        let columns = self
            .columns
            .get_or_insert_with(|| Columns::from_names(batch.columns()));

        let order = columns.align(&batch)?;
        let batch_rows = batch.num_rows();
        let (_, rows) = batch.into_parts();

        for row in rows {
            for (value, &pos) in row.into_iter().zip(&order) {
                columns.columns[pos].append(value, capacity)?;
            }
        }

        self.rows += batch_rows;
        trace!("Appended {} row(s), {} total", batch_rows, self.rows);
        Ok(())
    }

    /// Build the final record batch
    pub fn finish(self) -> BqResult<RecordBatch> {
        if self.poisoned {
            return Err(BqError::data_shape(
                "materializer already failed on an earlier batch",
            ));
        }

        let capacity = self.capacity();
        let Some(mut columns) = self.columns else {
            return Ok(RecordBatch::new_empty(Arc::new(Schema::empty())));
        };

        let mut fields = Vec::with_capacity(columns.columns.len());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.columns.len());
        for column in columns.columns.iter_mut() {
            let (field, array) = column.finish(capacity)?;
            fields.push(field);
            arrays.push(array);
        }

        let schema = TableSchema::new(fields).to_arrow();
        let options = RecordBatchOptions::new().with_row_count(Some(self.rows));
        debug!("Materialized {} row(s)", self.rows);
        Ok(RecordBatch::try_new_with_options(schema, arrays, &options)?)
    }
}

/// Drain `batches` into one record batch.
///
/// The first error, from the source or from a shape check, is returned and no
/// partial result is produced.
pub fn materialize<I>(
    batches: I,
    schema: Option<TableSchema>,
    expected_rows: Option<usize>,
) -> BqResult<RecordBatch>
where
    I: IntoIterator<Item = BqResult<RowBatch>>,
{
    let mut materializer = match schema {
        Some(schema) => ResultMaterializer::with_schema(schema, expected_rows),
        None => ResultMaterializer::new(expected_rows),
    };
    for batch in batches {
        materializer.push_batch(batch?)?;
    }
    materializer.finish()
}

fn append_value(builder: &mut dyn ArrayBuilder, field: &FieldSchema, value: Value) -> BqResult<()> {
    match field.mode {
        FieldMode::Repeated => {
            let list = downcast::<ListBuilder<Box<dyn ArrayBuilder>>>(builder, &field.name)?;
            match value {
                Value::Null => list.append(false),
                Value::Repeated(items) => {
                    for item in items {
                        append_scalar(&mut **list.values(), field, item)?;
                    }
                    list.append(true);
                }
                other => return Err(type_mismatch(field, &other)),
            }
            Ok(())
        }
        FieldMode::Required if value.is_null() => Err(BqError::data_shape(format!(
            "null in required column {}",
            field.name
        ))),
        FieldMode::Required | FieldMode::Nullable => append_scalar(builder, field, value),
    }
}

fn append_scalar(builder: &mut dyn ArrayBuilder, field: &FieldSchema, value: Value) -> BqResult<()> {
    let name = field.name.as_str();
    match field.field_type {
        FieldType::Integer => {
            let b = downcast::<Int64Builder>(builder, name)?;
            match value {
                Value::Null => b.append_null(),
                Value::Integer(v) => b.append_value(v),
                other => return Err(type_mismatch(field, &other)),
            }
        }
        FieldType::Float => {
            let b = downcast::<Float64Builder>(builder, name)?;
            match value {
                Value::Null => b.append_null(),
                Value::Float(v) => b.append_value(v),
                Value::Integer(v) => b.append_value(v as f64),
                other => return Err(type_mismatch(field, &other)),
            }
        }
        FieldType::Boolean => {
            let b = downcast::<BooleanBuilder>(builder, name)?;
            match value {
                Value::Null => b.append_null(),
                Value::Boolean(v) => b.append_value(v),
                other => return Err(type_mismatch(field, &other)),
            }
        }
        FieldType::Timestamp => {
            let b = downcast::<TimestampMicrosecondBuilder>(builder, name)?;
            match value {
                Value::Null => b.append_null(),
                Value::Timestamp(v) => b.append_value(v),
                other => return Err(type_mismatch(field, &other)),
            }
        }
        FieldType::String | FieldType::Date | FieldType::Datetime | FieldType::Time => {
            let b = downcast::<StringBuilder>(builder, name)?;
            match value {
                Value::Null => b.append_null(),
                Value::String(v) => b.append_value(v),
                other => return Err(type_mismatch(field, &other)),
            }
        }
    }
    Ok(())
}

fn downcast<'a, B: ArrayBuilder>(
    builder: &'a mut dyn ArrayBuilder,
    column: &str,
) -> BqResult<&'a mut B> {
    builder
        .as_any_mut()
        .downcast_mut::<B>()
        .ok_or_else(|| BqError::data_shape(format!("unexpected builder for column {}", column)))
}

fn type_mismatch(field: &FieldSchema, value: &Value) -> BqError {
    BqError::data_shape(format!(
        "column {} of type {} cannot hold a {} value",
        field.name,
        field.field_type,
        value.kind()
    ))
}
