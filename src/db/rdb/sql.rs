//! Dialect-specific SQL text
//!
//! Statements are assembled as strings and executed through the sqlx `Any`
//! driver, which passes SQL through untouched. The only differences that
//! matter here are placeholder syntax and identifier quoting.

use sqlx::any::{Any, AnyArguments};
use sqlx::query::Query;

use crate::db::{Dialect, HOST_PARAM_CHUNK};

/// Bind value for generated statements
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Text(String),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Int(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Placeholder for the `n`th (1-based) parameter.
pub fn placeholder(dialect: Dialect, n: usize) -> String {
    match dialect {
        Dialect::Postgres => format!("${}", n),
        _ => "?".to_string(),
    }
}

/// `count` comma-separated placeholders numbered from `start`.
pub fn placeholders(dialect: Dialect, start: usize, count: usize) -> String {
    (start..start + count)
        .map(|n| placeholder(dialect, n))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parenthesised placeholder list for `IN (...)`.
pub fn in_list(dialect: Dialect, start: usize, count: usize) -> String {
    format!("({})", placeholders(dialect, start, count))
}

pub fn quote(dialect: Dialect, ident: &str) -> String {
    match dialect {
        Dialect::Mysql => format!("`{}`", ident),
        _ => format!("\"{}\"", ident),
    }
}

/// Multi-row `INSERT` for `rows` rows of `columns`.
pub fn insert_statement(dialect: Dialect, table: &str, columns: &[&str], rows: usize) -> String {
    let cols = columns
        .iter()
        .map(|c| quote(dialect, c))
        .collect::<Vec<_>>()
        .join(", ");
    let tuples = (0..rows)
        .map(|r| format!("({})", placeholders(dialect, r * columns.len() + 1, columns.len())))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({}) VALUES {}", quote(dialect, table), cols, tuples)
}

/// `DELETE FROM table WHERE column IN (...)` for `count` ids.
pub fn delete_in_statement(dialect: Dialect, table: &str, column: &str, count: usize) -> String {
    format!(
        "DELETE FROM {} WHERE {} IN {}",
        quote(dialect, table),
        quote(dialect, column),
        in_list(dialect, 1, count)
    )
}

/// `SELECT id FROM table WHERE column IN (...)` for `count` ids.
pub fn select_ids_in_statement(dialect: Dialect, table: &str, column: &str, count: usize) -> String {
    format!(
        "SELECT {} FROM {} WHERE {} IN {}",
        quote(dialect, "id"),
        quote(dialect, table),
        quote(dialect, column),
        in_list(dialect, 1, count)
    )
}

/// Rows per INSERT so that one statement stays under the host-parameter ceiling.
pub fn rows_per_statement(columns: usize, batch: usize) -> usize {
    (HOST_PARAM_CHUNK / columns.max(1)).clamp(1, batch.max(1))
}

pub fn bind_all<'q>(mut query: Query<'q, Any, AnyArguments<'q>>, values: Vec<Value>) -> Query<'q, Any, AnyArguments<'q>> {
    for v in values {
        query = match v {
            Value::Int(i) => query.bind(i),
            Value::Text(s) => query.bind(s),
        };
    }
    query
}
