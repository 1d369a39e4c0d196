//! Explicit coercion table for source values
//!
//! Source cells arrive as loosely-typed values, often display strings such
//! as `"$1,234.50"`, `"15.47%"` or `"2,701"`. Each string is tagged with the
//! [`FormatTag`] it was written in, and the declared [`ColumnType`] decides
//! how (and whether) it is parsed. The original string is kept next to the
//! parsed value so the display form can be rebuilt with [`render`].
//!
//! | column type | accepted input                                              |
//! |-------------|-------------------------------------------------------------|
//! | integer     | integers, integral floats/decimals, Plain/Thousands/Currency/Percent strings with no fraction |
//! | float       | any number, any numeric string                              |
//! | decimal     | any number, any numeric string                              |
//! | boolean     | bools, 0/1, `true/yes/on/1`, `false/no/off/0`               |
//! | date        | dates, timestamps (date part), ISO or `MM/DD/YYYY` strings  |
//! | datetime    | dates (midnight), timestamps, ISO or `MM/DD/YYYY[ HH:MM:SS]` strings |
//! | text        | anything, rendered and trimmed                              |
//! | binary      | bytes only                                                  |
//!
//! Percent strings keep their displayed number: `"15.47%"` is 15.47.

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::prelude::*;
use serde::Serialize;
use thiserror::Error;

use crate::types::{ColumnType, Value};

/// Display format a string value was written in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatTag {
    /// Ordinary text or number
    Plain,
    /// Currency symbol present (`$1,234.50`)
    Currency,
    /// Trailing percent sign (`15.47%`)
    Percent,
    /// Thousands separators without a currency symbol (`2,701`)
    Thousands,
    /// Empty or whitespace-only cell
    Blank,
}

const CURRENCY_SYMBOLS: &[char] = &['$', '€', '£', '¥'];

/// Detect the display format of a string
pub fn detect_format(s: &str) -> FormatTag {
    let t = s.trim();
    if t.is_empty() {
        FormatTag::Blank
    } else if t.ends_with('%') {
        FormatTag::Percent
    } else if t.contains(CURRENCY_SYMBOLS) {
        FormatTag::Currency
    } else if t.contains(',') && t.chars().any(|c| c.is_ascii_digit()) {
        FormatTag::Thousands
    } else {
        FormatTag::Plain
    }
}

/// A value after coercion to its column type
#[derive(Debug, Clone, PartialEq)]
pub struct CoercedValue {
    /// Value to store
    pub value: Value,
    /// Source string, when the input was a string
    pub original: Option<String>,
    /// Detected format of the source string
    pub tag: FormatTag,
}

impl CoercedValue {
    fn plain(value: Value) -> Self {
        Self {
            value,
            original: None,
            tag: FormatTag::Plain,
        }
    }
}

/// Value incompatible with its declared column type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot convert {found} to {expected}")]
pub struct CoercionError {
    /// Declared column type
    pub expected: ColumnType,
    /// Offending value as displayed
    pub found: String,
}

fn mismatch(expected: ColumnType, value: &Value) -> CoercionError {
    CoercionError {
        expected,
        found: value.to_string(),
    }
}

/// Parse the numeric content of a display string, dropping currency
/// symbols, thousands separators and a trailing percent sign.
/// Accounting negatives like `($12.00)` are accepted.
pub fn parse_number(s: &str) -> Option<Decimal> {
    let mut t = s.trim();
    let mut negative = false;
    if let Some(inner) = t.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        negative = true;
        t = inner.trim();
    }
    let cleaned: String = t
        .trim_end_matches('%')
        .chars()
        .filter(|c| !CURRENCY_SYMBOLS.contains(c) && *c != ',' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let parsed = Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .ok()?;
    Some(if negative { -parsed } else { parsed })
}

fn decimal_of(value: &Value) -> Option<Decimal> {
    match value {
        Value::Int64(n) => Some(Decimal::from(*n)),
        Value::Float64(n) if n.is_finite() => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&format!("{:e}", n)))
            .ok(),
        Value::Decimal(d) => Some(*d),
        Value::Bool(b) => Some(Decimal::from(i64::from(*b))),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let t = s.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(t, f).ok())
        .or_else(|| parse_date(t).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let t = s.trim();
    DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(t, f).ok())
}

/// Coerce a source value to a declared column type
pub fn coerce(value: &Value, column_type: ColumnType) -> Result<CoercedValue, CoercionError> {
    let (tag, original) = match value {
        Value::String(s) => (detect_format(s), Some(s.clone())),
        _ => (FormatTag::Plain, None),
    };

    if column_type == ColumnType::Text {
        let value = match value {
            Value::Null => Value::Null,
            Value::String(s) => Value::String(s.trim().to_string()),
            Value::Bytes(_) => return Err(mismatch(column_type, value)),
            Value::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            Value::DateTime(dt) => Value::String(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
            other => Value::String(other.to_string()),
        };
        return Ok(CoercedValue {
            value,
            original,
            tag,
        });
    }

    if value.is_blank() {
        return Ok(CoercedValue {
            value: Value::Null,
            original,
            tag: FormatTag::Blank,
        });
    }

    let coerced = match column_type {
        ColumnType::Integer => {
            let d = decimal_of(value).ok_or_else(|| mismatch(column_type, value))?;
            if !d.fract().is_zero() {
                return Err(mismatch(column_type, value));
            }
            Value::Int64(d.to_i64().ok_or_else(|| mismatch(column_type, value))?)
        }
        ColumnType::Float => {
            let f = match value {
                Value::Float64(n) => Some(*n),
                Value::Int64(n) => Some(*n as f64),
                // Parse the cleaned text so the displayed digits map to the nearest float
                Value::String(s) => parse_number(s).and_then(|d| d.to_string().parse().ok()),
                other => decimal_of(other).and_then(|d| d.to_f64()),
            }
            .ok_or_else(|| mismatch(column_type, value))?;
            Value::Float64(f)
        }
        ColumnType::Decimal => {
            Value::Decimal(decimal_of(value).ok_or_else(|| mismatch(column_type, value))?)
        }
        ColumnType::Boolean => match value {
            Value::Float64(n) if *n == 0.0 || *n == 1.0 => Value::Bool(*n == 1.0),
            Value::Int64(n) if *n != 0 && *n != 1 => return Err(mismatch(column_type, value)),
            other => Value::Bool(other.as_bool().ok_or_else(|| mismatch(column_type, value))?),
        },
        ColumnType::Date => match value {
            Value::Date(d) => Value::Date(*d),
            Value::DateTime(dt) => Value::Date(dt.date()),
            Value::String(s) => Value::Date(
                parse_date(s)
                    .or_else(|| parse_datetime(s).map(|dt| dt.date()))
                    .ok_or_else(|| mismatch(column_type, value))?,
            ),
            _ => return Err(mismatch(column_type, value)),
        },
        ColumnType::DateTime => match value {
            Value::DateTime(dt) => Value::DateTime(*dt),
            Value::Date(d) => Value::DateTime(
                d.and_hms_opt(0, 0, 0)
                    .ok_or_else(|| mismatch(column_type, value))?,
            ),
            Value::String(s) => {
                Value::DateTime(parse_datetime(s).ok_or_else(|| mismatch(column_type, value))?)
            }
            _ => return Err(mismatch(column_type, value)),
        },
        ColumnType::Binary => match value {
            Value::Bytes(b) => Value::Bytes(b.clone()),
            _ => return Err(mismatch(column_type, value)),
        },
        ColumnType::Text => value.clone(),
    };

    Ok(match original {
        Some(original) => CoercedValue {
            value: coerced,
            original: Some(original),
            tag,
        },
        None => CoercedValue::plain(coerced),
    })
}

/// Convert a value read from the store to its declared column type.
/// Values that do not convert are returned unchanged.
pub fn from_store(value: Value, column_type: ColumnType) -> Value {
    match (&value, column_type) {
        (Value::String(s), ColumnType::Date) => parse_date(s)
            .or_else(|| parse_datetime(s).map(|dt| dt.date()))
            .map(Value::Date)
            .unwrap_or(value),
        (Value::String(s), ColumnType::DateTime) => {
            parse_datetime(s).map(Value::DateTime).unwrap_or(value)
        }
        (Value::Int64(n), ColumnType::Boolean) => Value::Bool(*n != 0),
        (Value::Int64(_) | Value::Float64(_) | Value::String(_), ColumnType::Decimal) => {
            decimal_of(&value).map(Value::Decimal).unwrap_or(value)
        }
        (Value::Int64(n), ColumnType::Float) => Value::Float64(*n as f64),
        _ => value,
    }
}

fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn grouped(d: Decimal) -> String {
    let text = d.abs().to_string();
    let (int_part, frac_part) = match text.split_once('.') {
        Some((i, f)) => (i.to_string(), Some(f.to_string())),
        None => (text, None),
    };
    let mut out = String::new();
    if d.is_sign_negative() && !d.is_zero() {
        out.push('-');
    }
    out.push_str(&group_thousands(&int_part));
    if let Some(frac) = frac_part {
        out.push('.');
        out.push_str(&frac);
    }
    out
}

/// Rebuild the display string for a value in the given format.
///
/// Currency renders with two decimals (`$1,234.50`); percent and thousands
/// keep the value's own precision. Non-numeric values render plainly.
pub fn render(value: &Value, tag: FormatTag) -> String {
    if tag == FormatTag::Blank || value.is_null() {
        return String::new();
    }
    let Some(d) = decimal_of(value).filter(|_| !matches!(value, Value::String(_))) else {
        return match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
    };
    match tag {
        FormatTag::Currency => {
            let mut cents = d.round_dp(2);
            cents.rescale(2);
            let body = grouped(cents.abs());
            if cents.is_sign_negative() && !cents.is_zero() {
                format!("-${}", body)
            } else {
                format!("${}", body)
            }
        }
        FormatTag::Percent => format!("{}%", d.normalize()),
        FormatTag::Thousands => grouped(d.normalize()),
        FormatTag::Plain | FormatTag::Blank => d.normalize().to_string(),
    }
}
