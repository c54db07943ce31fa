// SPDX-License-Identifier: Apache-2.0

//! Table schemas and the mapping between BigQuery column types and Arrow types

use std::fmt;
use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};

use crate::error::{BqError, BqResult};

/// Column types the client reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Date,
    Datetime,
    Time,
}

impl FieldType {
    /// Parse a BigQuery type name, accepting standard SQL aliases
    pub fn parse(type_str: &str) -> BqResult<Self> {
        match type_str.trim().to_uppercase().as_str() {
            "STRING" => Ok(FieldType::String),
            "INTEGER" | "INT64" => Ok(FieldType::Integer),
            "FLOAT" | "FLOAT64" => Ok(FieldType::Float),
            "BOOLEAN" | "BOOL" => Ok(FieldType::Boolean),
            "TIMESTAMP" => Ok(FieldType::Timestamp),
            "DATE" => Ok(FieldType::Date),
            "DATETIME" => Ok(FieldType::Datetime),
            "TIME" => Ok(FieldType::Time),
            other => Err(BqError::UnsupportedType(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "STRING",
            FieldType::Integer => "INTEGER",
            FieldType::Float => "FLOAT",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Date => "DATE",
            FieldType::Datetime => "DATETIME",
            FieldType::Time => "TIME",
        }
    }

    /// Arrow type of a materialized column.
    ///
    /// DATE, DATETIME and TIME stay textual, as BigQuery returns them.
    pub fn arrow_type(&self) -> DataType {
        match self {
            FieldType::String | FieldType::Date | FieldType::Datetime | FieldType::Time => {
                DataType::Utf8
            }
            FieldType::Integer => DataType::Int64,
            FieldType::Float => DataType::Float64,
            FieldType::Boolean => DataType::Boolean,
            FieldType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        }
    }

    /// Column type for an Arrow scalar type; unknown types are written as text
    pub fn from_arrow(data_type: &DataType) -> Self {
        match data_type {
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => FieldType::Integer,
            DataType::Float16 | DataType::Float32 | DataType::Float64 => FieldType::Float,
            DataType::Boolean => FieldType::Boolean,
            DataType::Timestamp(_, _) => FieldType::Timestamp,
            DataType::Date32 | DataType::Date64 => FieldType::Date,
            DataType::Time32(_) | DataType::Time64(_) => FieldType::Time,
            _ => FieldType::String,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
    Repeated,
}

impl FieldMode {
    pub fn parse(mode: Option<&str>) -> BqResult<Self> {
        match mode.map(|m| m.trim().to_uppercase()).as_deref() {
            None | Some("") | Some("NULLABLE") => Ok(FieldMode::Nullable),
            Some("REQUIRED") => Ok(FieldMode::Required),
            Some("REPEATED") => Ok(FieldMode::Repeated),
            Some(other) => Err(BqError::UnsupportedType(format!("mode {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldMode::Nullable => "NULLABLE",
            FieldMode::Required => "REQUIRED",
            FieldMode::Repeated => "REPEATED",
        }
    }
}

/// One column of a table schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSchema {
    pub name: String,
    pub field_type: FieldType,
    pub mode: FieldMode,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: FieldMode::Nullable,
        }
    }

    pub fn with_mode(mut self, mode: FieldMode) -> Self {
        self.mode = mode;
        self
    }

    /// Arrow field for the materialized column
    pub fn arrow_field(&self) -> Field {
        match self.mode {
            FieldMode::Repeated => Field::new(
                &self.name,
                DataType::List(Arc::new(Field::new("item", self.field_type.arrow_type(), true))),
                true,
            ),
            FieldMode::Required => Field::new(&self.name, self.field_type.arrow_type(), false),
            FieldMode::Nullable => Field::new(&self.name, self.field_type.arrow_type(), true),
        }
    }
}

/// Ordered column list of a table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSchema {
    pub fields: Vec<FieldSchema>,
}

impl TableSchema {
    pub fn new(fields: Vec<FieldSchema>) -> Self {
        Self { fields }
    }

    /// Build a schema from a column name to type mapping
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, FieldType)>,
        S: Into<String>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(name, field_type)| FieldSchema::new(name, field_type))
                .collect(),
        )
    }

    /// Derive a table schema from Arrow column types.
    ///
    /// Lists of scalars become REPEATED columns of the element type.
    pub fn from_arrow(schema: &Schema) -> Self {
        let fields = schema
            .fields()
            .iter()
            .map(|field| match field.data_type() {
                DataType::List(item) | DataType::LargeList(item) => FieldSchema::new(
                    field.name().clone(),
                    FieldType::from_arrow(item.data_type()),
                )
                .with_mode(FieldMode::Repeated),
                other => FieldSchema::new(field.name().clone(), FieldType::from_arrow(other)),
            })
            .collect();
        Self { fields }
    }

    /// Arrow schema of the materialized result
    pub fn to_arrow(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.fields
                .iter()
                .map(FieldSchema::arrow_field)
                .collect::<Vec<_>>(),
        ))
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl From<&Schema> for TableSchema {
    fn from(schema: &Schema) -> Self {
        Self::from_arrow(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_types() {
        assert_eq!(FieldType::parse("STRING").unwrap(), FieldType::String);
        assert_eq!(FieldType::parse("int64").unwrap(), FieldType::Integer);
        assert_eq!(FieldType::parse("FLOAT64").unwrap(), FieldType::Float);
        assert_eq!(FieldType::parse("bool").unwrap(), FieldType::Boolean);
        assert_eq!(FieldType::parse("DATETIME").unwrap(), FieldType::Datetime);
        assert!(matches!(
            FieldType::parse("GEOGRAPHY"),
            Err(BqError::UnsupportedType(t)) if t == "GEOGRAPHY"
        ));
        assert!(FieldType::parse("RECORD").is_err());
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(FieldMode::parse(None).unwrap(), FieldMode::Nullable);
        assert_eq!(FieldMode::parse(Some("REPEATED")).unwrap(), FieldMode::Repeated);
        assert_eq!(FieldMode::parse(Some("required")).unwrap(), FieldMode::Required);
        assert!(FieldMode::parse(Some("SOMETIMES")).is_err());
    }

    #[test]
    fn test_from_arrow_schema() {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("score", DataType::Float32, true),
            Field::new("flag", DataType::Boolean, true),
            Field::new("name", DataType::Utf8, true),
            Field::new(
                "at",
                DataType::Timestamp(TimeUnit::Nanosecond, None),
                true,
            ),
            Field::new("day", DataType::Date32, true),
            Field::new("blob", DataType::Binary, true),
            Field::new(
                "tags",
                DataType::List(Arc::new(Field::new("item", DataType::Utf8, true))),
                true,
            ),
        ]);

        let table = TableSchema::from(&schema);
        let types: Vec<_> = table
            .fields
            .iter()
            .map(|f| (f.name.as_str(), f.field_type, f.mode))
            .collect();
        assert_eq!(
            types,
            vec![
                ("id", FieldType::Integer, FieldMode::Nullable),
                ("score", FieldType::Float, FieldMode::Nullable),
                ("flag", FieldType::Boolean, FieldMode::Nullable),
                ("name", FieldType::String, FieldMode::Nullable),
                ("at", FieldType::Timestamp, FieldMode::Nullable),
                ("day", FieldType::Date, FieldMode::Nullable),
                ("blob", FieldType::String, FieldMode::Nullable),
                ("tags", FieldType::String, FieldMode::Repeated),
            ]
        );
    }

    #[test]
    fn test_to_arrow_schema() {
        let table = TableSchema::new(vec![
            FieldSchema::new("id", FieldType::Integer).with_mode(FieldMode::Required),
            FieldSchema::new("at", FieldType::Timestamp),
            FieldSchema::new("day", FieldType::Date),
            FieldSchema::new("scores", FieldType::Float).with_mode(FieldMode::Repeated),
        ]);

        let schema = table.to_arrow();
        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        assert!(!schema.field(0).is_nullable());
        assert_eq!(
            schema.field(1).data_type(),
            &DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        );
        assert_eq!(schema.field(2).data_type(), &DataType::Utf8);
        match schema.field(3).data_type() {
            DataType::List(item) => assert_eq!(item.data_type(), &DataType::Float64),
            other => panic!("Expected List type, got {other:?}"),
        }
    }

    #[test]
    fn test_from_pairs_keeps_order() {
        let table = TableSchema::from_pairs([("b", FieldType::String), ("a", FieldType::Integer)]);
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(table.field("a").unwrap().field_type, FieldType::Integer);
        assert!(table.field("c").is_none());
    }
}
