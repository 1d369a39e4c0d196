//! Schema-aware row validation
//!
//! Validation runs over a whole batch before any write and collects every
//! violation instead of stopping at the first. The only early exit is an
//! unknown column, which means the source does not match the table at all.
//!
//! Checks per row, in order:
//! 1. unknown columns (schema-fatal unless ignored)
//! 2. required columns present and non-blank
//! 3. type compatibility through the coercion table
//! 4. string length against the declared maximum
//! 5. numeric/date ranges
//! 6. regular-expression patterns
//! 7. uniqueness against declared keys, in-batch and pre-fetched
//! 8. foreign-key existence against pre-fetched key sets
//!
//! The output carries the coerced rows that writes use, aligned with the
//! input by index.

use chrono::NaiveDate;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use crate::coercion::{coerce, FormatTag};
use crate::error::{Error, Result};
use crate::types::{Row, TableSchema, Value};

/// Kind of violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    /// Required column absent or blank
    MissingRequired,
    /// Value does not convert to the declared type
    TypeMismatch,
    /// String longer than the declared maximum
    TooLong,
    /// Value outside the configured range
    OutOfRange,
    /// String does not match the configured pattern
    PatternMismatch,
    /// Key already seen in this batch or present in the table
    DuplicateKey,
    /// Referenced key not present in the parent table
    ForeignKeyMissing,
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MissingRequired => "missing_required",
            Self::TypeMismatch => "type_mismatch",
            Self::TooLong => "too_long",
            Self::OutOfRange => "out_of_range",
            Self::PatternMismatch => "pattern_mismatch",
            Self::DuplicateKey => "duplicate_key",
            Self::ForeignKeyMissing => "foreign_key_missing",
        };
        f.write_str(s)
    }
}

/// One violation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationError {
    /// Index of the row in the input batch
    pub row_index: usize,
    /// Offending column
    pub column: String,
    /// Violation kind
    pub kind: ValidationErrorKind,
    /// Human-readable message
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row {} column {}: {} ({})",
            self.row_index, self.column, self.message, self.kind
        )
    }
}

/// Non-blocking finding, e.g. a truncated string
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationWarning {
    /// Index of the row in the input batch
    pub row_index: usize,
    /// Column concerned
    pub column: String,
    /// Human-readable message
    pub message: String,
}

/// Counters for a validation run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidationStats {
    /// Rows examined
    pub rows_checked: usize,
    /// Rows with at least one error
    pub rows_failed: usize,
    /// Warnings raised
    pub warnings: usize,
}

/// Aggregated report; empty errors means pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationResult {
    /// All violations, in row order
    pub errors: Vec<ValidationError>,
    /// All warnings, in row order
    pub warnings: Vec<ValidationWarning>,
    /// Counters
    pub stats: ValidationStats,
}

impl ValidationResult {
    /// Whether no violation was found
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Indices of rows with at least one violation
    pub fn failed_rows(&self) -> BTreeSet<usize> {
        self.errors.iter().map(|e| e.row_index).collect()
    }

    /// Violations for one row
    pub fn errors_for_row(&self, row_index: usize) -> Vec<&ValidationError> {
        self.errors.iter().filter(|e| e.row_index == row_index).collect()
    }

    fn absorb(&mut self, outcome: &RowOutcome) {
        self.stats.rows_checked += 1;
        if !outcome.errors.is_empty() {
            self.stats.rows_failed += 1;
        }
        self.stats.warnings += outcome.warnings.len();
        self.errors.extend(outcome.errors.iter().cloned());
        self.warnings.extend(outcome.warnings.iter().cloned());
    }
}

/// Inclusive range for a column
#[derive(Debug, Clone, PartialEq)]
pub enum ValueRange {
    /// Numeric bounds
    Number {
        /// Lower bound
        min: Option<f64>,
        /// Upper bound
        max: Option<f64>,
    },
    /// Date bounds
    Date {
        /// Lower bound
        min: Option<NaiveDate>,
        /// Upper bound
        max: Option<NaiveDate>,
    },
}

impl ValueRange {
    fn check(&self, value: &Value) -> Option<String> {
        match self {
            Self::Number { min, max } => {
                let n = value.as_f64()?;
                match (min, max) {
                    (Some(lo), _) if n < *lo => Some(format!("{} is below minimum {}", n, lo)),
                    (_, Some(hi)) if n > *hi => Some(format!("{} is above maximum {}", n, hi)),
                    _ => None,
                }
            }
            Self::Date { min, max } => {
                let d = value.as_date()?;
                match (min, max) {
                    (Some(lo), _) if d < *lo => Some(format!("{} is before {}", d, lo)),
                    (_, Some(hi)) if d > *hi => Some(format!("{} is after {}", d, hi)),
                    _ => None,
                }
            }
        }
    }
}

/// Validation rules beyond what the schema declares
#[derive(Debug, Clone, Default)]
pub struct ValidationRules {
    /// Columns that must be present and non-blank, in addition to NOT NULL columns
    pub required: Vec<String>,
    /// Ranges by column
    pub ranges: HashMap<String, ValueRange>,
    /// Patterns by column
    pub patterns: HashMap<String, Regex>,
    /// Allowed parent values by referencing column
    pub foreign_keys: HashMap<String, Vec<Value>>,
    /// Composite keys already present in the table (insert mode)
    pub existing_keys: Option<HashSet<String>>,
    /// Truncate over-length strings with a warning instead of failing
    pub truncate_strings: bool,
    /// Drop source columns the table does not declare
    pub ignore_unknown_columns: bool,
    /// Rows carry only the columns to change; absent NOT NULL columns are fine
    pub partial_rows: bool,
}

impl ValidationRules {
    /// Empty rule set
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a column
    pub fn require(mut self, column: impl Into<String>) -> Self {
        self.required.push(column.into());
        self
    }

    /// Constrain a column to a range
    pub fn range(mut self, column: impl Into<String>, range: ValueRange) -> Self {
        self.ranges.insert(column.into().to_lowercase(), range);
        self
    }

    /// Require string values of a column to match a regular expression
    pub fn pattern(mut self, column: impl Into<String>, pattern: &str) -> Result<Self> {
        let column = column.into();
        let regex = Regex::new(pattern)
            .map_err(|e| Error::config(format!("invalid pattern for {}: {}", column, e)))?;
        self.patterns.insert(column.to_lowercase(), regex);
        Ok(self)
    }

    /// Allowed values for a referencing column
    pub fn foreign_key_values<I>(mut self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        self.foreign_keys
            .insert(column.into().to_lowercase(), values.into_iter().collect());
        self
    }

    /// Composite keys already present in the table
    pub fn existing_keys(mut self, keys: HashSet<String>) -> Self {
        self.existing_keys = Some(keys);
        self
    }

    /// Truncate over-length strings instead of failing
    pub fn truncate_strings(mut self, enabled: bool) -> Self {
        self.truncate_strings = enabled;
        self
    }

    /// Drop unknown source columns instead of failing
    pub fn ignore_unknown_columns(mut self, enabled: bool) -> Self {
        self.ignore_unknown_columns = enabled;
        self
    }

    /// Rows carry only the columns to change
    pub fn partial_rows(mut self, enabled: bool) -> Self {
        self.partial_rows = enabled;
        self
    }

    fn is_required(&self, column: &str) -> bool {
        self.required.iter().any(|c| c.eq_ignore_ascii_case(column))
    }
}

/// Canonical composite key for `columns` of a row, compared the way each
/// column's declared type compares. `None` when any member is absent or NULL.
pub fn composite_key(row: &Row, schema: &TableSchema, columns: &[String]) -> Option<String> {
    let mut parts = Vec::with_capacity(columns.len());
    for column in columns {
        let value = row.get_by_name(column)?;
        if value.is_null() {
            return None;
        }
        parts.push(value.key_string(schema.column_type(column)));
    }
    Some(parts.join("\u{1f}"))
}

/// Validation result for one row
#[derive(Debug, Clone, PartialEq)]
pub struct RowOutcome {
    /// Coerced row, ready to write when `errors` is empty
    pub row: Row,
    /// Violations
    pub errors: Vec<ValidationError>,
    /// Warnings
    pub warnings: Vec<ValidationWarning>,
    /// Display formats of string inputs by column, for round-trip checks
    pub formats: HashMap<String, FormatTag>,
}

/// Stateful validator tracking keys seen earlier in the batch
#[derive(Debug)]
pub struct Validator<'a> {
    schema: &'a TableSchema,
    rules: &'a ValidationRules,
    parents: HashMap<String, HashSet<String>>,
    seen: HashMap<String, HashSet<String>>,
}

impl<'a> Validator<'a> {
    /// Create a validator for one batch
    pub fn new(schema: &'a TableSchema, rules: &'a ValidationRules) -> Self {
        let parents = rules
            .foreign_keys
            .iter()
            .map(|(column, values)| {
                let column_type = schema.column_type(column);
                let allowed = values.iter().map(|v| v.key_string(column_type)).collect();
                (column.clone(), allowed)
            })
            .collect();
        Self {
            schema,
            rules,
            parents,
            seen: HashMap::new(),
        }
    }

    /// Validate one row; `Err` only for a schema-fatal unknown column
    pub fn check(&mut self, row_index: usize, row: &Row) -> Result<RowOutcome> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut formats = HashMap::new();
        let mut out = Row::default();

        let mut push_error = |column: &str, kind, message: String| {
            errors.push(ValidationError {
                row_index,
                column: column.to_string(),
                kind,
                message,
            })
        };

        for (name, value) in row.iter() {
            let Some(column) = self.schema.column(name) else {
                if self.rules.ignore_unknown_columns {
                    continue;
                }
                return Err(Error::ColumnNotFound {
                    table: self.schema.name.clone(),
                    column: name.to_string(),
                });
            };

            let coerced = match coerce(value, column.column_type) {
                Ok(c) => c,
                Err(e) => {
                    push_error(&column.name, ValidationErrorKind::TypeMismatch, e.to_string());
                    out.set(column.name.clone(), value.clone());
                    continue;
                }
            };
            if coerced.original.is_some() {
                formats.insert(column.name.clone(), coerced.tag);
            }
            let mut stored = coerced.value;

            let over_length = match (&stored, column.max_length) {
                (Value::String(s), Some(max)) if s.chars().count() > max as usize => {
                    Some((s.chars().count(), max))
                }
                _ => None,
            };
            if let Some((len, max)) = over_length {
                if self.rules.truncate_strings {
                    warnings.push(ValidationWarning {
                        row_index,
                        column: column.name.clone(),
                        message: format!("truncated from {} to {} characters", len, max),
                    });
                    let shortened = stored
                        .as_str()
                        .map(|s| s.chars().take(max as usize).collect::<String>())
                        .unwrap_or_default();
                    stored = Value::String(shortened);
                } else {
                    push_error(
                        &column.name,
                        ValidationErrorKind::TooLong,
                        format!("length {} exceeds maximum {}", len, max),
                    );
                }
            }

            let key = column.name.to_lowercase();
            if !stored.is_null() {
                if let Some(msg) = self.rules.ranges.get(&key).and_then(|r| r.check(&stored)) {
                    push_error(&column.name, ValidationErrorKind::OutOfRange, msg);
                }
                if let Some(regex) = self.rules.patterns.get(&key) {
                    let text = match (&stored, &coerced.original) {
                        (Value::String(s), _) => s.clone(),
                        (_, Some(original)) => original.trim().to_string(),
                        (other, None) => other.to_string(),
                    };
                    if !regex.is_match(&text) {
                        push_error(
                            &column.name,
                            ValidationErrorKind::PatternMismatch,
                            format!("{:?} does not match {}", text, regex.as_str()),
                        );
                    }
                }
                if let Some(allowed) = self.parents.get(&key) {
                    if !allowed.contains(&stored.key_string(column.column_type)) {
                        push_error(
                            &column.name,
                            ValidationErrorKind::ForeignKeyMissing,
                            format!("{} has no matching parent row", stored),
                        );
                    }
                }
            }

            out.set(column.name.clone(), stored);
        }

        for column in &self.schema.columns {
            let required = self.rules.is_required(&column.name)
                || (!self.rules.partial_rows
                    && !column.nullable
                    && column.default_value.is_none()
                    && !self.schema.is_auto_generated(&column.name));
            if !required {
                continue;
            }
            match out.get_by_name(&column.name) {
                None if self.rules.partial_rows && !self.rules.is_required(&column.name) => {}
                None => push_error(
                    &column.name,
                    ValidationErrorKind::MissingRequired,
                    "required column is missing".to_string(),
                ),
                Some(v) if v.is_blank() => push_error(
                    &column.name,
                    ValidationErrorKind::MissingRequired,
                    "required column is blank".to_string(),
                ),
                Some(_) => {}
            }
        }

        // Keys of a row that fails are not recorded, so a later valid row
        // carrying the same key is still accepted
        let key_columns = self.schema.key_columns();
        let mut fresh = Vec::new();
        for descriptor in self.schema.unique_keys() {
            let Some(key) = composite_key(&out, self.schema, &descriptor.columns) else {
                continue;
            };
            let label = descriptor.columns.join(", ");
            let duplicate = self
                .seen
                .get(&descriptor.name)
                .is_some_and(|seen| seen.contains(&key));
            if duplicate {
                push_error(
                    &label,
                    ValidationErrorKind::DuplicateKey,
                    format!("duplicate key ({}) within batch", label),
                );
                continue;
            }
            if descriptor.columns == key_columns {
                if let Some(existing) = &self.rules.existing_keys {
                    if existing.contains(&key) {
                        push_error(
                            &label,
                            ValidationErrorKind::DuplicateKey,
                            format!("key ({}) already exists in {}", label, self.schema.name),
                        );
                        continue;
                    }
                }
            }
            fresh.push((descriptor.name, key));
        }
        if errors.is_empty() {
            for (name, key) in fresh {
                self.seen.entry(name).or_default().insert(key);
            }
        }

        Ok(RowOutcome {
            row: out,
            errors,
            warnings,
            formats,
        })
    }
}

/// Coerced rows plus the aggregated report for a batch
#[derive(Debug, Clone, Default)]
pub struct ValidatedRows {
    /// One outcome per input row, in input order
    pub outcomes: Vec<RowOutcome>,
    /// Aggregated report
    pub result: ValidationResult,
}

/// Validate a single row with no batch context
pub fn validate_row(row: &Row, schema: &TableSchema, rules: &ValidationRules) -> Result<ValidationResult> {
    let outcome = Validator::new(schema, rules).check(0, row)?;
    let mut result = ValidationResult::default();
    result.absorb(&outcome);
    Ok(result)
}

/// Validate a batch, collecting every violation
pub fn validate_rows(rows: &[Row], schema: &TableSchema, rules: &ValidationRules) -> Result<ValidatedRows> {
    let mut validator = Validator::new(schema, rules);
    let mut validated = ValidatedRows::default();
    for (index, row) in rows.iter().enumerate() {
        let outcome = validator.check(index, row)?;
        validated.result.absorb(&outcome);
        validated.outcomes.push(outcome);
    }
    Ok(validated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnMetadata, KeyDescriptor};

    fn schema() -> TableSchema {
        let mut s = TableSchema::new("Customers")
            .with_column(ColumnMetadata::new("ID", "INTEGER").primary_key(1).not_null())
            .with_column(ColumnMetadata::new("Code", "VARCHAR(5)").not_null())
            .with_column(ColumnMetadata::new("Balance", "CURRENCY"))
            .with_column(ColumnMetadata::new("Region", "INTEGER"));
        s.keys.push(KeyDescriptor {
            name: "ux_code".into(),
            columns: vec!["Code".into()],
            primary: false,
        });
        s
    }

    #[test]
    fn test_valid_row_is_coerced() {
        let s = schema();
        let rules = ValidationRules::new();
        let mut v = Validator::new(&s, &rules);
        let row = Row::from_pairs([("ID", Value::from("7")), ("Code", "AB".into()), ("Balance", "$1,000.25".into())]);
        let outcome = v.check(0, &row).unwrap();
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.row.get_by_name("ID"), Some(&Value::Int64(7)));
        assert_eq!(outcome.formats.get("Balance"), Some(&FormatTag::Currency));
    }

    #[test]
    fn test_collects_all_violations() {
        let s = schema();
        let rules = ValidationRules::new().range(
            "Region",
            ValueRange::Number {
                min: Some(1.0),
                max: Some(9.0),
            },
        );
        let row = Row::from_pairs([("Code", Value::from("TOOLONG")), ("Balance", "abc".into()), ("Region", 12.into())]);
        let result = validate_row(&row, &s, &rules).unwrap();
        let kinds: Vec<_> = result.errors.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&ValidationErrorKind::TooLong));
        assert!(kinds.contains(&ValidationErrorKind::TypeMismatch));
        assert!(kinds.contains(&ValidationErrorKind::OutOfRange));
        // Integer primary key is generated by the store, so it is not required
        assert!(!kinds.contains(&ValidationErrorKind::MissingRequired));
        assert_eq!(result.stats.rows_failed, 1);
    }

    #[test]
    fn test_unknown_column_is_fatal_unless_ignored() {
        let s = schema();
        let row = Row::from_pairs([("Code", Value::from("A")), ("Extra", 1.into())]);
        let err = validate_row(&row, &s, &ValidationRules::new()).unwrap_err();
        assert!(matches!(err, Error::ColumnNotFound { .. }));

        let rules = ValidationRules::new().ignore_unknown_columns(true);
        let result = validate_row(&row, &s, &rules).unwrap();
        assert!(result.is_valid());
    }

    #[test]
    fn test_duplicates_in_batch_and_existing() {
        let s = schema();
        let rules = ValidationRules::new().existing_keys(HashSet::from(["1".to_string()]));
        let rows = vec![
            Row::from_pairs([("ID", Value::Int64(1)), ("Code", "A".into())]),
            Row::from_pairs([("ID", Value::Int64(2)), ("Code", "B".into())]),
            Row::from_pairs([("ID", Value::from("2")), ("Code", "C".into())]),
        ];
        let validated = validate_rows(&rows, &s, &rules).unwrap();
        assert_eq!(validated.result.failed_rows(), BTreeSet::from([0, 2]));
        assert_eq!(validated.outcomes.len(), 3);
    }

    #[test]
    fn test_truncation_warning() {
        let s = schema();
        let rules = ValidationRules::new().truncate_strings(true);
        let row = Row::from_pairs([("Code", Value::from("ABCDEFG"))]);
        let outcome = Validator::new(&s, &rules).check(0, &row).unwrap();
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.row.get_by_name("Code"), Some(&Value::from("ABCDE")));
    }

    #[test]
    fn test_pattern_and_foreign_key() {
        let s = schema();
        let rules = ValidationRules::new()
            .pattern("Code", "^[A-Z]+$")
            .unwrap()
            .foreign_key_values("Region", [Value::Int64(1), Value::Int64(2)]);
        let row = Row::from_pairs([("Code", Value::from("ab1")), ("Region", Value::from("3"))]);
        let result = validate_row(&row, &s, &rules).unwrap();
        let kinds: Vec<_> = result.errors.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![ValidationErrorKind::PatternMismatch, ValidationErrorKind::ForeignKeyMissing]
        );
        assert!(ValidationRules::new().pattern("Code", "(").is_err());
    }

    #[test]
    fn test_required_blank() {
        let s = schema();
        let row = Row::from_pairs([("Code", Value::from("  "))]);
        let result = validate_row(&row, &s, &ValidationRules::new()).unwrap();
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, ValidationErrorKind::MissingRequired);
    }

    #[test]
    fn test_failed_row_does_not_claim_its_key() {
        let s = schema();
        let rows = vec![
            Row::from_pairs([("ID", Value::Int64(1)), ("Code", "A".into()), ("Balance", "abc".into())]),
            Row::from_pairs([("ID", Value::Int64(1)), ("Code", "A".into())]),
            Row::from_pairs([("ID", Value::Int64(1)), ("Code", "B".into())]),
        ];
        let validated = validate_rows(&rows, &s, &ValidationRules::new()).unwrap();
        assert_eq!(validated.result.failed_rows(), BTreeSet::from([0, 2]));
        assert_eq!(
            validated.outcomes[2].errors[0].kind,
            ValidationErrorKind::DuplicateKey
        );
    }

    #[test]
    fn test_text_keys_compare_as_text() {
        let s = TableSchema::new("Codes")
            .with_column(ColumnMetadata::new("Code", "VARCHAR(10)").primary_key(1).not_null());
        let rows = vec![
            Row::from_pairs([("Code", Value::from("007"))]),
            Row::from_pairs([("Code", Value::from("7"))]),
            Row::from_pairs([("Code", Value::from(" 7 "))]),
        ];
        let validated = validate_rows(&rows, &s, &ValidationRules::new()).unwrap();
        assert_eq!(validated.result.failed_rows(), BTreeSet::from([2]));
    }

    #[test]
    fn test_composite_integer_key_members_are_required() {
        let s = TableSchema::new("Lines")
            .with_column(ColumnMetadata::new("OrderID", "INTEGER").primary_key(1).not_null())
            .with_column(ColumnMetadata::new("Line", "INTEGER").primary_key(2).not_null());
        let row = Row::from_pairs([("OrderID", Value::Int64(10))]);
        let result = validate_row(&row, &s, &ValidationRules::new()).unwrap();
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].column, "Line");
        assert_eq!(result.errors[0].kind, ValidationErrorKind::MissingRequired);
    }

    #[test]
    fn test_foreign_key_values_follow_column_type() {
        let s = schema();
        let rules = ValidationRules::new().foreign_key_values("Region", [Value::from("2")]);
        let row = Row::from_pairs([("Code", Value::from("A")), ("Region", Value::Int64(2))]);
        assert!(validate_row(&row, &s, &rules).unwrap().is_valid());
    }
}
