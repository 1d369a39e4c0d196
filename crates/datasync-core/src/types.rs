//! Value and schema types for datasync-core
//!
//! - `Value`: a single cell, as read from a spreadsheet source or the store
//! - `Row`: ordered column -> value mapping
//! - `ColumnType`: declared column type classes the coercion table understands
//! - `TableSchema`: ordered columns plus key descriptors, as introspected from the store

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// SQL value type that can hold any cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Value {
    /// SQL NULL / empty cell
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int64(i64),
    /// 64-bit floating point
    Float64(f64),
    /// Exact decimal (currency)
    Decimal(Decimal),
    /// Text
    String(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Date without time
    Date(NaiveDate),
    /// Timestamp without timezone
    DateTime(NaiveDateTime),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// NULL, or a string that is empty after trimming (an empty spreadsheet cell)
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Null => true,
            Self::String(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Get SQL type name
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "BOOLEAN",
            Self::Int64(_) => "INTEGER",
            Self::Float64(_) => "DOUBLE",
            Self::Decimal(_) => "DECIMAL",
            Self::String(_) => "VARCHAR",
            Self::Bytes(_) => "BLOB",
            Self::Date(_) => "DATE",
            Self::DateTime(_) => "DATETIME",
        }
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int64(n) => Some(*n != 0),
            Self::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" | "on" => Some(true),
                "false" | "f" | "no" | "n" | "0" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(n) => Some(*n),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Float64(n) if n.is_finite() && n.fract() == 0.0 => Some(*n as i64),
            Self::Decimal(d) if d.fract().is_zero() => d.to_string().parse().ok(),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int64(n) => Some(*n as f64),
            Self::Float64(n) => Some(*n),
            Self::Decimal(d) => d.to_string().parse().ok(),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Try to get a date, truncating timestamps
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            Self::DateTime(dt) => Some(dt.date()),
            _ => None,
        }
    }

    /// Canonical string used to compare key values of a column declared as
    /// `column_type`. Numeric columns compare by magnitude, so `Int64(7)`,
    /// `Float64(7.0)` and `String("7")` collide; any other column compares
    /// strings by their trimmed text, so `"007"` and `"7"` stay distinct.
    pub fn key_string(&self, column_type: ColumnType) -> String {
        match self {
            Self::Null => "\u{0}NULL".to_string(),
            Self::Bool(b) => i64::from(*b).to_string(),
            Self::Int64(n) => n.to_string(),
            Self::Float64(n) if n.is_finite() && n.fract() == 0.0 => (*n as i64).to_string(),
            Self::Float64(n) => n.to_string(),
            Self::Decimal(d) => d.normalize().to_string(),
            Self::String(s) if column_type.is_numeric() => {
                let trimmed = s.trim();
                match trimmed.parse::<Decimal>() {
                    Ok(d) => d.normalize().to_string(),
                    Err(_) => trimmed.to_string(),
                }
            }
            Self::String(s) => s.trim().to_string(),
            Self::Bytes(b) => b.iter().map(|byte| format!("{:02x}", byte)).collect(),
            Self::Date(d) => d.format("%Y-%m-%d").to_string(),
            Self::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int64(n) => write!(f, "{}", n),
            Self::Float64(n) => write!(f, "{}", n),
            Self::Decimal(d) => write!(f, "{}", d),
            Self::String(s) => write!(f, "'{}'", s),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Self::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int64(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// A row as ordered column values. Column lookups are case-insensitive,
/// matching how the store resolves identifiers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Row {
    /// Column names
    columns: Vec<String>,
    /// Column values (same order as columns)
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Build a row from `(column, value)` pairs
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut row = Self::default();
        for (k, v) in pairs {
            row.set(k, v);
        }
        row
    }

    /// Get column count
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if row is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get column names
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get all values
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Get value by column index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Get value by column name
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    /// Set a column value, replacing an existing column of the same name
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        match self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(&column))
        {
            Some(idx) => self.values[idx] = value,
            None => {
                self.columns.push(column);
                self.values.push(value);
            }
        }
    }

    /// Iterate `(column, value)` pairs in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Render as `col=value` pairs for diagnostics
    pub fn describe(&self) -> String {
        self.iter()
            .map(|(c, v)| format!("{}={}", c, v))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Convert row to HashMap
    pub fn into_map(self) -> HashMap<String, Value> {
        self.columns.into_iter().zip(self.values).collect()
    }
}

/// Declared column type classes.
///
/// The store's declared type text (`VARCHAR(50)`, `CURRENCY`, `DATETIME`, ...)
/// is classified once at introspection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// Whole numbers (INTEGER, LONG, SHORT, BYTE, COUNTER)
    Integer,
    /// Floating point (DOUBLE, SINGLE, REAL, FLOAT, NUMBER)
    Float,
    /// Exact decimal (CURRENCY, DECIMAL, NUMERIC, MONEY)
    Decimal,
    /// Text (VARCHAR, CHAR, TEXT, MEMO)
    Text,
    /// Boolean (BIT, YESNO, BOOLEAN, LOGICAL)
    Boolean,
    /// Date only
    Date,
    /// Date and time
    DateTime,
    /// Binary (BLOB, LONGBINARY)
    Binary,
}

impl ColumnType {
    /// Classify a declared type name
    pub fn from_declared(type_name: &str) -> Self {
        let upper = type_name.trim().to_uppercase();
        let base = upper.split('(').next().unwrap_or("").trim();
        match base {
            "INTEGER" | "INT" | "LONG" | "SHORT" | "BYTE" | "COUNTER" | "AUTOINCREMENT"
            | "BIGINT" | "SMALLINT" | "TINYINT" => Self::Integer,
            "DOUBLE" | "SINGLE" | "REAL" | "FLOAT" | "NUMBER" | "DOUBLE PRECISION" => Self::Float,
            "CURRENCY" | "DECIMAL" | "NUMERIC" | "MONEY" => Self::Decimal,
            "BIT" | "YESNO" | "BOOLEAN" | "BOOL" | "LOGICAL" => Self::Boolean,
            "DATE" => Self::Date,
            "DATETIME" | "TIMESTAMP" | "DATE/TIME" => Self::DateTime,
            "BLOB" | "LONGBINARY" | "BINARY" | "VARBINARY" => Self::Binary,
            _ => Self::Text,
        }
    }

    /// Whether the class is numeric
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Float | Self::Decimal)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Decimal => "decimal",
            Self::Text => "text",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::DateTime => "datetime",
            Self::Binary => "binary",
        };
        f.write_str(name)
    }
}

/// Column metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnMetadata {
    /// Column name
    pub name: String,
    /// Declared type text, as stored in the catalog
    pub type_name: String,
    /// Classified type
    pub column_type: ColumnType,
    /// Whether column is nullable
    pub nullable: bool,
    /// Maximum length for text columns
    pub max_length: Option<u32>,
    /// Primary key ordinal (1-based, None if not PK)
    pub primary_key_ordinal: Option<u32>,
    /// Column ordinal (0-based)
    pub ordinal: u32,
    /// Default value expression
    pub default_value: Option<String>,
}

impl ColumnMetadata {
    /// Create basic column metadata from a declared type
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            name: name.into(),
            column_type: ColumnType::from_declared(&type_name),
            max_length: parse_declared_length(&type_name),
            type_name,
            nullable: true,
            primary_key_ordinal: None,
            ordinal: 0,
            default_value: None,
        }
    }

    /// Mark as NOT NULL
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Mark as primary key member
    pub fn primary_key(mut self, ordinal: u32) -> Self {
        self.primary_key_ordinal = Some(ordinal);
        self
    }

    /// Check if this column is part of the primary key
    #[inline]
    pub fn is_key(&self) -> bool {
        self.primary_key_ordinal.is_some()
    }
}

fn parse_declared_length(type_name: &str) -> Option<u32> {
    let open = type_name.find('(')?;
    let close = type_name[open..].find(')')? + open;
    let inner = &type_name[open + 1..close];
    if inner.contains(',') {
        return None;
    }
    inner.trim().parse().ok()
}

/// A uniqueness descriptor: primary key or unique index
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyDescriptor {
    /// Index/constraint name
    pub name: String,
    /// Member columns in key order
    pub columns: Vec<String>,
    /// Whether this is the primary key
    pub primary: bool,
}

/// A declared foreign key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForeignKeyDescriptor {
    /// Referencing column in this table
    pub column: String,
    /// Referenced table
    pub referenced_table: String,
    /// Referenced column
    pub referenced_column: String,
}

/// Table schema: ordered columns plus key descriptors
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSchema {
    /// Table name
    pub name: String,
    /// Column metadata (in ordinal order)
    pub columns: Vec<ColumnMetadata>,
    /// Primary key and unique indexes
    pub keys: Vec<KeyDescriptor>,
    /// Declared foreign keys
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
}

impl TableSchema {
    /// Create new table schema
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            keys: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Append a column, assigning its ordinal
    pub fn with_column(mut self, mut column: ColumnMetadata) -> Self {
        column.ordinal = self.columns.len() as u32;
        self.columns.push(column);
        self
    }

    /// Get column by name
    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Whether a column exists
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Get primary key columns in key order
    pub fn primary_key_columns(&self) -> Vec<&ColumnMetadata> {
        let mut pk_cols: Vec<_> = self.columns.iter().filter(|c| c.is_key()).collect();
        pk_cols.sort_by_key(|c| c.primary_key_ordinal);
        pk_cols
    }

    /// Whether the store assigns `name` when it is omitted. Only a
    /// single-column primary key declared exactly `INTEGER` aliases the row
    /// identity; members of a composite key never do.
    pub fn is_auto_generated(&self, name: &str) -> bool {
        match self.primary_key_columns().as_slice() {
            [only] => {
                only.name.eq_ignore_ascii_case(name)
                    && only.type_name.trim().eq_ignore_ascii_case("INTEGER")
            }
            _ => false,
        }
    }

    /// Declared type class of `name`; unknown columns compare as text
    pub fn column_type(&self, name: &str) -> ColumnType {
        self.column(name)
            .map(|c| c.column_type)
            .unwrap_or(ColumnType::Text)
    }

    /// Columns identifying a row for upsert/update: the primary key, or the
    /// first unique index when no primary key is declared.
    pub fn key_columns(&self) -> Vec<String> {
        let pk: Vec<String> = self
            .primary_key_columns()
            .into_iter()
            .map(|c| c.name.clone())
            .collect();
        if !pk.is_empty() {
            return pk;
        }
        self.keys
            .iter()
            .find(|k| !k.primary)
            .map(|k| k.columns.clone())
            .unwrap_or_default()
    }

    /// All uniqueness descriptors including the primary key
    pub fn unique_keys(&self) -> Vec<KeyDescriptor> {
        let mut keys = Vec::new();
        let pk: Vec<String> = self
            .primary_key_columns()
            .into_iter()
            .map(|c| c.name.clone())
            .collect();
        if !pk.is_empty() {
            keys.push(KeyDescriptor {
                name: "PRIMARY".to_string(),
                columns: pk,
                primary: true,
            });
        }
        keys.extend(self.keys.iter().filter(|k| !k.primary).cloned());
        keys
    }

    /// Get column names
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}
