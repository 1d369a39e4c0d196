//! Parameterized statement builder
//!
//! Every statement is returned as a [`Statement`]: SQL text plus the ordered
//! list of bound values. Values are never inlined into SQL text and every
//! identifier passes through the dialect's `quote_identifier`.
//!
//! When a [`TableSchema`] is supplied, any column referenced by a predicate,
//! projection, ordering or write that the schema does not declare is rejected
//! with [`Error::Build`] before a statement is produced.

use crate::dialect::{quote_aliases, SqlDialect};
use crate::error::{Error, Result};
use crate::types::{Row, TableSchema, Value};
use std::fmt;

/// A SQL statement with its bound parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Statement text with dialect placeholders
    pub sql: String,
    /// Bound parameters in placeholder order
    pub params: Vec<Value>,
}

impl Statement {
    /// Statement with no parameters
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql)?;
        if !self.params.is_empty() {
            let params: Vec<String> = self.params.iter().map(|p| p.to_string()).collect();
            write!(f, " -- params: [{}]", params.join(", "))?;
        }
        Ok(())
    }
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `LIKE`
    Like,
}

impl CompareOp {
    /// SQL operator text
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::Like => "LIKE",
        }
    }
}

/// Predicate tree of bound comparisons
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `column op ?`
    Compare {
        /// Column name (unquoted)
        column: String,
        /// Operator
        op: CompareOp,
        /// Bound value
        value: Value,
    },
    /// `column IS [NOT] NULL`
    IsNull {
        /// Column name (unquoted)
        column: String,
        /// `IS NOT NULL` when true
        negated: bool,
    },
    /// Conjunction; empty means always true
    And(Vec<Predicate>),
    /// Disjunction; empty means always false
    Or(Vec<Predicate>),
}

impl Predicate {
    /// Build a comparison
    pub fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// `column = value`
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    /// `column >= value`
    pub fn gte(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::GtEq, value)
    }

    /// `column < value`
    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Lt, value)
    }

    /// `column IS NULL`
    pub fn is_null(column: impl Into<String>) -> Self {
        Self::IsNull {
            column: column.into(),
            negated: false,
        }
    }

    /// Flat conjunction of `column = value` pairs
    pub fn all_eq<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self::And(pairs.into_iter().map(|(k, v)| Self::eq(k, v)).collect())
    }

    /// Combine with another predicate under AND
    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            first => Self::And(vec![first, other]),
        }
    }

    /// Combine with another predicate under OR
    pub fn or(self, other: Predicate) -> Self {
        match self {
            Self::Or(mut parts) => {
                parts.push(other);
                Self::Or(parts)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    /// All column names referenced by this predicate
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Compare { column, .. } | Self::IsNull { column, .. } => out.push(column.as_str()),
            Self::And(parts) | Self::Or(parts) => {
                for part in parts {
                    part.collect_columns(out);
                }
            }
        }
    }

    fn render(&self, dialect: &dyn SqlDialect, params: &mut Vec<Value>) -> String {
        match self {
            Self::Compare { column, op, value } => {
                params.push(value.clone());
                format!(
                    "{} {} {}",
                    dialect.quote_identifier(column),
                    op.as_sql(),
                    dialect.placeholder(params.len())
                )
            }
            Self::IsNull { column, negated } => format!(
                "{} IS {}NULL",
                dialect.quote_identifier(column),
                if *negated { "NOT " } else { "" }
            ),
            Self::And(parts) => render_group(dialect, parts, " AND ", "1 = 1", params),
            Self::Or(parts) => render_group(dialect, parts, " OR ", "1 = 0", params),
        }
    }
}

fn render_group(
    dialect: &dyn SqlDialect,
    parts: &[Predicate],
    joiner: &str,
    empty: &str,
    params: &mut Vec<Value>,
) -> String {
    match parts {
        [] => empty.to_string(),
        [single] => single.render(dialect, params),
        _ => {
            let rendered: Vec<String> = parts
                .iter()
                .map(|p| match p {
                    Predicate::And(_) | Predicate::Or(_) => format!("({})", p.render(dialect, params)),
                    _ => p.render(dialect, params),
                })
                .collect();
            rendered.join(joiner)
        }
    }
}

/// Human-readable form with values shown inline, for diagnostics only
impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compare { column, op, value } => write!(f, "{} {} {}", column, op.as_sql(), value),
            Self::IsNull { column, negated } => {
                write!(f, "{} IS {}NULL", column, if *negated { "NOT " } else { "" })
            }
            Self::And(parts) | Self::Or(parts) => {
                let joiner = if matches!(self, Self::And(_)) { " AND " } else { " OR " };
                let rendered: Vec<String> = parts.iter().map(|p| format!("({})", p)).collect();
                write!(f, "{}", rendered.join(joiner))
            }
        }
    }
}

/// ORDER BY entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    /// Column name
    pub column: String,
    /// Descending order
    pub descending: bool,
}

impl OrderBy {
    /// Ascending order on a column
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    /// Descending order on a column
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

/// Description of a SELECT
#[derive(Debug, Clone, Default)]
pub struct Select {
    table: String,
    columns: Vec<String>,
    filter: Option<Predicate>,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl Select {
    /// `SELECT * FROM table`
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    /// Project specific columns
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Set the WHERE predicate
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filter = Some(predicate);
        self
    }

    /// Append an ORDER BY entry
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    /// Set LIMIT
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set OFFSET
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Dialect-aware statement builder
#[derive(Clone, Copy)]
pub struct QueryBuilder<'a> {
    dialect: &'a dyn SqlDialect,
    schema: Option<&'a TableSchema>,
}

impl<'a> QueryBuilder<'a> {
    /// Builder without schema checks
    pub fn new(dialect: &'a dyn SqlDialect) -> Self {
        Self {
            dialect,
            schema: None,
        }
    }

    /// Check referenced columns against a schema
    pub fn with_schema(mut self, schema: &'a TableSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// The dialect in use
    pub fn dialect(&self) -> &'a dyn SqlDialect {
        self.dialect
    }

    fn check_column(&self, column: &str) -> Result<()> {
        match self.schema {
            Some(schema) if !schema.has_column(column) => Err(Error::build(format!(
                "column {} is not declared by table {}",
                column, schema.name
            ))),
            _ => Ok(()),
        }
    }

    fn check_predicate(&self, predicate: &Predicate) -> Result<()> {
        for column in predicate.columns() {
            self.check_column(column)?;
        }
        Ok(())
    }

    fn quote(&self, name: &str) -> String {
        self.dialect.quote_identifier(name)
    }

    fn where_clause(&self, filter: Option<&Predicate>, params: &mut Vec<Value>) -> Result<String> {
        match filter {
            Some(predicate) => {
                self.check_predicate(predicate)?;
                Ok(format!(" WHERE {}", predicate.render(self.dialect, params)))
            }
            None => Ok(String::new()),
        }
    }

    /// Build a SELECT
    pub fn select(&self, select: &Select) -> Result<Statement> {
        let mut params = Vec::new();
        let projection = if select.columns.is_empty() {
            "*".to_string()
        } else {
            for column in &select.columns {
                self.check_column(column)?;
            }
            select
                .columns
                .iter()
                .map(|c| self.quote(c))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut sql = format!("SELECT {} FROM {}", projection, self.quote(&select.table));
        sql.push_str(&self.where_clause(select.filter.as_ref(), &mut params)?);

        if !select.order_by.is_empty() {
            let mut parts = Vec::with_capacity(select.order_by.len());
            for order in &select.order_by {
                // The row identity pseudo-column is never declared by a schema
                if !order.column.eq_ignore_ascii_case(self.dialect.row_identity()) {
                    self.check_column(&order.column)?;
                }
                parts.push(format!(
                    "{}{}",
                    self.quote(&order.column),
                    if order.descending { " DESC" } else { " ASC" }
                ));
            }
            sql.push_str(" ORDER BY ");
            sql.push_str(&parts.join(", "));
        }

        sql.push_str(&self.dialect.limit_offset_sql(
            select.limit.is_some(),
            select.offset.is_some(),
            params.len() + 1,
        ));
        if let Some(limit) = select.limit {
            params.push(Value::Int64(to_i64(limit)?));
        }
        if let Some(offset) = select.offset {
            params.push(Value::Int64(to_i64(offset)?));
        }

        Ok(Statement { sql, params })
    }

    /// `SELECT COUNT(*) AS [alias] FROM [table] WHERE ...`
    pub fn count(&self, table: &str, filter: Option<&Predicate>, alias: &str) -> Result<Statement> {
        let mut params = Vec::new();
        let expression = quote_aliases(self.dialect, &format!("COUNT(*) AS {}", alias));
        let mut sql = format!("SELECT {} FROM {}", expression, self.quote(table));
        sql.push_str(&self.where_clause(filter, &mut params)?);
        Ok(Statement { sql, params })
    }

    /// INSERT of one row; columns are taken from the row in order
    pub fn insert(&self, table: &str, row: &Row) -> Result<Statement> {
        if row.is_empty() {
            return Err(Error::build(format!("cannot insert an empty row into {}", table)));
        }
        let mut columns = Vec::with_capacity(row.len());
        let mut placeholders = Vec::with_capacity(row.len());
        let mut params = Vec::with_capacity(row.len());
        for (column, value) in row.iter() {
            self.check_column(column)?;
            columns.push(self.quote(column));
            params.push(value.clone());
            placeholders.push(self.dialect.placeholder(params.len()));
        }
        Ok(Statement {
            sql: format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.quote(table),
                columns.join(", "),
                placeholders.join(", ")
            ),
            params,
        })
    }

    /// UPDATE of one row identified by `key_columns`; non-key columns are set
    pub fn update(&self, table: &str, row: &Row, key_columns: &[String]) -> Result<Statement> {
        if key_columns.is_empty() {
            return Err(Error::build(format!(
                "table {} has no key columns to identify rows for update",
                table
            )));
        }
        let is_key = |c: &str| key_columns.iter().any(|k| k.eq_ignore_ascii_case(c));

        let mut params = Vec::new();
        let mut assignments = Vec::new();
        for (column, value) in row.iter().filter(|(c, _)| !is_key(*c)) {
            self.check_column(column)?;
            params.push(value.clone());
            assignments.push(format!(
                "{} = {}",
                self.quote(column),
                self.dialect.placeholder(params.len())
            ));
        }
        if assignments.is_empty() {
            return Err(Error::build(format!(
                "update of {} sets no columns besides the key",
                table
            )));
        }

        let key = key_predicate(row, key_columns)?;
        let mut sql = format!("UPDATE {} SET {}", self.quote(table), assignments.join(", "));
        sql.push_str(&self.where_clause(Some(&key), &mut params)?);
        Ok(Statement { sql, params })
    }

    /// DELETE matching a predicate
    pub fn delete(&self, table: &str, filter: &Predicate) -> Result<Statement> {
        let mut params = Vec::new();
        let mut sql = format!("DELETE FROM {}", self.quote(table));
        sql.push_str(&self.where_clause(Some(filter), &mut params)?);
        Ok(Statement { sql, params })
    }

    /// `INSERT INTO [target] (...) SELECT ... FROM [source] WHERE ...`
    ///
    /// The column list comes from the supplied schema when present, so the
    /// copy does not depend on physical column order.
    pub fn insert_select(&self, target: &str, source: &str, filter: &Predicate) -> Result<Statement> {
        let mut params = Vec::new();
        let sql = match self.schema {
            Some(schema) => {
                let columns = schema
                    .columns
                    .iter()
                    .map(|c| self.quote(&c.name))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "INSERT INTO {} ({}) SELECT {} FROM {}",
                    self.quote(target),
                    columns,
                    columns,
                    self.quote(source)
                )
            }
            None => format!(
                "INSERT INTO {} SELECT * FROM {}",
                self.quote(target),
                self.quote(source)
            ),
        };
        let sql = sql + &self.where_clause(Some(filter), &mut params)?;
        Ok(Statement { sql, params })
    }

    /// CREATE TABLE with the same column definitions as `schema`
    pub fn create_table_like(&self, target: &str, schema: &TableSchema) -> Result<Statement> {
        if schema.columns.is_empty() {
            return Err(Error::build(format!("table {} declares no columns", schema.name)));
        }
        let columns: Vec<String> = schema
            .columns
            .iter()
            .map(|c| self.dialect.column_definition(c))
            .collect();
        Ok(Statement::new(format!(
            "CREATE TABLE {} ({})",
            self.quote(target),
            columns.join(", ")
        )))
    }

    /// DROP TABLE
    pub fn drop_table(&self, table: &str) -> Statement {
        Statement::new(format!("DROP TABLE {}", self.quote(table)))
    }
}

/// Equality predicate on the key columns of a row
pub fn key_predicate(row: &Row, key_columns: &[String]) -> Result<Predicate> {
    let mut parts = Vec::with_capacity(key_columns.len());
    for key in key_columns {
        let value = row
            .get_by_name(key)
            .ok_or_else(|| Error::build(format!("row has no value for key column {}", key)))?;
        if value.is_null() {
            return Err(Error::build(format!("key column {} is NULL", key)));
        }
        parts.push(Predicate::eq(key.as_str(), value.clone()));
    }
    Ok(Predicate::And(parts))
}

fn to_i64(n: u64) -> Result<i64> {
    i64::try_from(n).map_err(|_| Error::build(format!("value {} exceeds the store's integer range", n)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqliteDialect;
    use crate::types::ColumnMetadata;
    use chrono::NaiveDate;

    fn sales() -> TableSchema {
        TableSchema::new("Sales")
            .with_column(ColumnMetadata::new("ID", "INTEGER").primary_key(1))
            .with_column(ColumnMetadata::new("Time", "DATE"))
            .with_column(ColumnMetadata::new("Amount", "CURRENCY"))
    }

    #[test]
    fn test_select_with_filter_order_and_paging() {
        let schema = sales();
        let qb = QueryBuilder::new(&SqliteDialect).with_schema(&schema);
        let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let stmt = qb
            .select(
                &Select::from("Sales")
                    .columns(["ID", "Amount"])
                    .filter(Predicate::gte("Time", start))
                    .order_by(OrderBy::asc("ID"))
                    .limit(100)
                    .offset(200),
            )
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT [ID], [Amount] FROM [Sales] WHERE [Time] >= ?1 ORDER BY [ID] ASC LIMIT ?2 OFFSET ?3"
        );
        assert_eq!(
            stmt.params,
            vec![Value::Date(start), Value::Int64(100), Value::Int64(200)]
        );
    }

    #[test]
    fn test_nested_predicate() {
        let qb = QueryBuilder::new(&SqliteDialect);
        let p = Predicate::eq("a", 1).and(Predicate::eq("b", 2).or(Predicate::is_null("c")));
        let stmt = qb.delete("t", &p).unwrap();
        assert_eq!(
            stmt.sql,
            "DELETE FROM [t] WHERE [a] = ?1 AND ([b] = ?2 OR [c] IS NULL)"
        );
        assert_eq!(stmt.params.len(), 2);
    }

    #[test]
    fn test_unknown_column_is_build_error() {
        let schema = sales();
        let qb = QueryBuilder::new(&SqliteDialect).with_schema(&schema);
        let err = qb
            .count("Sales", Some(&Predicate::eq("Nope", 1)), "n")
            .unwrap_err();
        assert!(matches!(err, Error::Build { .. }));
    }

    #[test]
    fn test_count_quotes_alias() {
        let qb = QueryBuilder::new(&SqliteDialect);
        let stmt = qb.count("Order", None, "total").unwrap();
        assert_eq!(stmt.sql, "SELECT COUNT(*) AS [total] FROM [Order]");
    }

    #[test]
    fn test_insert_and_update() {
        let qb = QueryBuilder::new(&SqliteDialect);
        let row = Row::from_pairs([("ID", Value::Int64(7)), ("Amount", Value::Float64(1.5))]);
        let insert = qb.insert("Sales", &row).unwrap();
        assert_eq!(insert.sql, "INSERT INTO [Sales] ([ID], [Amount]) VALUES (?1, ?2)");

        let update = qb.update("Sales", &row, &["ID".to_string()]).unwrap();
        assert_eq!(update.sql, "UPDATE [Sales] SET [Amount] = ?1 WHERE [ID] = ?2");
        assert_eq!(update.params, vec![Value::Float64(1.5), Value::Int64(7)]);
    }

    #[test]
    fn test_update_without_key_fails() {
        let qb = QueryBuilder::new(&SqliteDialect);
        let row = Row::from_pairs([("Amount", Value::Float64(1.5))]);
        assert!(qb.update("Sales", &row, &[]).is_err());
        assert!(qb.update("Sales", &row, &["ID".to_string()]).is_err());
    }

    #[test]
    fn test_snapshot_statements() {
        let schema = sales();
        let qb = QueryBuilder::new(&SqliteDialect).with_schema(&schema);
        let create = qb.create_table_like("Sales_1.5.2025_temp_table", &schema).unwrap();
        assert_eq!(
            create.sql,
            "CREATE TABLE [Sales_1.5.2025_temp_table] ([ID] INTEGER, [Time] DATE, [Amount] CURRENCY)"
        );
        let copy = qb
            .insert_select("Sales_1.5.2025_temp_table", "Sales", &Predicate::eq("ID", 1))
            .unwrap();
        assert!(copy.sql.starts_with("INSERT INTO [Sales_1.5.2025_temp_table] ([ID], [Time], [Amount]) SELECT"));
        assert!(copy.sql.ends_with("FROM [Sales] WHERE [ID] = ?1"));
    }
}
