//! SQL dialect abstraction for datasync-core
//!
//! The target store uses bracket-quoted identifiers (`[name]`). Brackets have
//! no escape for `]`, so a name containing one is double-quoted instead
//! (`"a]b"`, with `"` doubled). Every identifier that reaches generated SQL
//! goes through `quote_identifier`, reserved word or not, so no
//! reserved-word list is consulted anywhere.
//!
//! - SqlDialect: trait for store-specific SQL fragments and catalog queries
//! - SqliteDialect: embedded single-file store with bracket quoting
//! - `quote_name`: the quoting rule itself
//! - `quote_aliases`: quotes alias tokens following `AS` in expression text

use crate::types::ColumnMetadata;

/// SQL dialect for store-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column, alias). Idempotent.
    fn quote_identifier(&self, name: &str) -> String;

    /// Get the placeholder for a parameter (1-based index)
    fn placeholder(&self, index: usize) -> String;

    /// Pseudo-column giving a stable row order when a table has no key
    fn row_identity(&self) -> &'static str;

    /// SQL listing user tables; one text column named `name`
    fn list_tables_sql(&self) -> &'static str;

    /// SQL describing a table's columns; binds the table name as `?1`
    fn table_info_sql(&self) -> &'static str;

    /// SQL listing a table's indexes; binds the table name as `?1`
    fn index_list_sql(&self) -> &'static str;

    /// SQL listing an index's member columns; binds the index name as `?1`
    fn index_columns_sql(&self) -> &'static str;

    /// SQL listing a table's foreign keys; binds the table name as `?1`
    fn foreign_keys_sql(&self) -> &'static str;

    /// Column definition for DDL, e.g. `[Amount] CURRENCY`
    fn column_definition(&self, column: &ColumnMetadata) -> String;

    /// LIMIT/OFFSET fragment using bound parameters
    fn limit_offset_sql(&self, has_limit: bool, has_offset: bool, next_index: usize) -> String;
}

/// Embedded single-file store dialect.
///
/// Identifiers are bracket-quoted as in the Access/Jet family; the embedded
/// engine accepts bracket quoting natively.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "SQLite"
    }

    fn quote_identifier(&self, name: &str) -> String {
        quote_name(name)
    }

    fn placeholder(&self, index: usize) -> String {
        format!("?{}", index)
    }

    fn row_identity(&self) -> &'static str {
        "rowid"
    }

    fn list_tables_sql(&self) -> &'static str {
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
    }

    fn table_info_sql(&self) -> &'static str {
        "SELECT cid, name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid"
    }

    fn index_list_sql(&self) -> &'static str {
        "SELECT name, \"unique\", origin FROM pragma_index_list(?1)"
    }

    fn index_columns_sql(&self) -> &'static str {
        "SELECT name FROM pragma_index_info(?1) ORDER BY seqno"
    }

    fn foreign_keys_sql(&self) -> &'static str {
        "SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq"
    }

    fn column_definition(&self, column: &ColumnMetadata) -> String {
        let type_name = if column.type_name.trim().is_empty() {
            "TEXT"
        } else {
            column.type_name.trim()
        };
        format!("{} {}", self.quote_identifier(&column.name), type_name)
    }

    fn limit_offset_sql(&self, has_limit: bool, has_offset: bool, next_index: usize) -> String {
        match (has_limit, has_offset) {
            (true, true) => format!(
                " LIMIT {} OFFSET {}",
                self.placeholder(next_index),
                self.placeholder(next_index + 1)
            ),
            (true, false) => format!(" LIMIT {}", self.placeholder(next_index)),
            // The embedded engine requires LIMIT before OFFSET; -1 means unbounded
            (false, true) => format!(" LIMIT -1 OFFSET {}", self.placeholder(next_index)),
            (false, false) => String::new(),
        }
    }
}

/// Quote an identifier: `[name]`, or `"name"` when the name contains `]`.
/// Already-quoted input is returned unchanged.
pub fn quote_name(name: &str) -> String {
    if is_bracket_quoted(name) || is_double_quoted(name) {
        return name.to_string();
    }
    if name.contains(']') {
        format!("\"{}\"", name.replace('"', "\"\""))
    } else {
        format!("[{}]", name)
    }
}

/// Whether `name` is a single bracket-quoted identifier
pub fn is_bracket_quoted(name: &str) -> bool {
    name.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .is_some_and(|inner| !inner.is_empty() && !inner.contains(']'))
}

/// Whether `name` is a single double-quoted identifier
pub fn is_double_quoted(name: &str) -> bool {
    let Some(inner) = name
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    else {
        return false;
    };
    if inner.is_empty() {
        return false;
    }
    // Every '"' inside must be part of an escaped '""' pair
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
            } else {
                return false;
            }
        }
    }
    true
}

/// Quote the alias token following every `AS` keyword (case-insensitive)
/// in an expression, e.g. `COUNT(*) as total` -> `COUNT(*) as [total]`.
///
/// Trailing commas and closing parentheses stay outside the quotes.
pub fn quote_aliases(dialect: &dyn SqlDialect, expression: &str) -> String {
    let mut out = String::with_capacity(expression.len() + 8);
    let mut expect_alias = false;

    for (i, token) in split_keep_whitespace(expression).into_iter().enumerate() {
        if token.chars().all(char::is_whitespace) {
            out.push_str(token);
            continue;
        }
        if expect_alias {
            let split = token
                .find(|c: char| c == ',' || c == ')')
                .unwrap_or(token.len());
            let (alias, trailing) = token.split_at(split);
            if alias.is_empty() {
                out.push_str(token);
            } else {
                out.push_str(&dialect.quote_identifier(alias));
                out.push_str(trailing);
            }
            expect_alias = false;
            continue;
        }
        if i > 0 && token.eq_ignore_ascii_case("AS") {
            expect_alias = true;
        }
        out.push_str(token);
    }
    out
}

fn split_keep_whitespace(s: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut in_space = None;
    for (idx, c) in s.char_indices() {
        let space = c.is_whitespace();
        match in_space {
            Some(prev) if prev != space => {
                tokens.push(&s[start..idx]);
                start = idx;
            }
            _ => {}
        }
        in_space = Some(space);
    }
    if start < s.len() {
        tokens.push(&s[start..]);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier() {
        let d = SqliteDialect;
        assert_eq!(d.quote_identifier("Sales"), "[Sales]");
        assert_eq!(d.quote_identifier("Order Date"), "[Order Date]");
        assert_eq!(d.quote_identifier("Time"), "[Time]");
        assert_eq!(d.quote_identifier("weird]name"), "\"weird]name\"");
        assert_eq!(d.quote_identifier("say \"hi\"]"), "\"say \"\"hi\"\"]\"");
    }

    #[test]
    fn test_quote_is_idempotent() {
        let d = SqliteDialect;
        for name in ["Sales", "Order Date", "SELECT", "a]b", "[x]", "[", "]", "a\"]b", "[a]b]"] {
            let once = d.quote_identifier(name);
            assert_eq!(d.quote_identifier(&once), once, "not idempotent for {:?}", name);
            assert!(is_bracket_quoted(&once) || is_double_quoted(&once));
        }
    }

    #[test]
    fn test_is_quoted() {
        assert!(is_bracket_quoted("[a]"));
        assert!(!is_bracket_quoted("[a]b]"));
        assert!(!is_bracket_quoted("[]"));
        assert!(!is_bracket_quoted("a"));
        assert!(is_double_quoted("\"a]b\""));
        assert!(is_double_quoted("\"a\"\"b\""));
        assert!(!is_double_quoted("\"a\"b\""));
        assert!(!is_double_quoted("\"\""));
    }

    #[test]
    fn test_quote_aliases() {
        let d = SqliteDialect;
        assert_eq!(
            quote_aliases(&d, "COUNT(*) AS row_count"),
            "COUNT(*) AS [row_count]"
        );
        assert_eq!(
            quote_aliases(&d, "MAX(x) as hi, MIN(x) As lo"),
            "MAX(x) as [hi], MIN(x) As [lo]"
        );
        assert_eq!(
            quote_aliases(&d, "COUNT(*) AS [row_count]"),
            "COUNT(*) AS [row_count]"
        );
        assert_eq!(quote_aliases(&d, "price * qty"), "price * qty");
    }

    #[test]
    fn test_limit_offset() {
        let d = SqliteDialect;
        assert_eq!(d.limit_offset_sql(true, true, 3), " LIMIT ?3 OFFSET ?4");
        assert_eq!(d.limit_offset_sql(false, true, 1), " LIMIT -1 OFFSET ?1");
        assert_eq!(d.limit_offset_sql(false, false, 1), "");
    }
}
