//! Table catalogue and additive migration
//!
//! Child rows point at their parent through plain id columns. No foreign
//! key constraints are declared; the driver keeps parents and children
//! consistent by ordering its inserts and deletes.

use sqlx::AnyConnection;
use sqlx::Row;

use super::sql::{placeholder, quote};
use crate::db::Dialect;
use crate::error::Result;

/// Column written by the v1 layout only
pub const LEGACY_FETCH_META_COLUMN: &str = "file_name";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Id,
    Int,
    /// Short, indexable text
    Key,
    /// Long free text
    Text,
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub kind: Kind,
}

const fn col(name: &'static str, kind: Kind) -> Column {
    Column { name, kind }
}

#[derive(Debug)]
pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column],
    pub indexes: &'static [&'static [&'static str]],
    pub unique: &'static [&'static [&'static str]],
}

impl Table {
    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }
}

pub const FETCH_META: Table = Table {
    name: "fetch_meta",
    columns: &[
        col("id", Kind::Id),
        col("revision", Kind::Key),
        col("schema_version", Kind::Int),
        col("last_fetched_at", Kind::Key),
    ],
    indexes: &[],
    unique: &[],
};

pub const ROOTS: Table = Table {
    name: "roots",
    columns: &[
        col("id", Kind::Id),
        col("family", Kind::Key),
        col("os_version", Kind::Key),
        col("timestamp", Kind::Key),
    ],
    indexes: &[],
    unique: &[&["family", "os_version"]],
};

pub const DEFINITIONS: Table = Table {
    name: "definitions",
    columns: &[
        col("id", Kind::Id),
        col("root_id", Kind::Int),
        col("definition_id", Kind::Key),
        col("title", Kind::Text),
        col("description", Kind::Text),
    ],
    indexes: &[&["root_id"], &["definition_id"]],
    unique: &[],
};

pub const ADVISORIES: Table = Table {
    name: "advisories",
    columns: &[
        col("id", Kind::Id),
        col("definition_id", Kind::Int),
        col("severity", Kind::Key),
        col("issued", Kind::Key),
        col("updated", Kind::Key),
    ],
    indexes: &[&["definition_id"]],
    unique: &[],
};

pub const CVES: Table = Table {
    name: "cves",
    columns: &[
        col("id", Kind::Id),
        col("advisory_id", Kind::Int),
        col("cve_id", Kind::Key),
        col("cvss2", Kind::Key),
        col("cvss3", Kind::Key),
        col("cwe", Kind::Key),
        col("impact", Kind::Key),
        col("href", Kind::Text),
        col("public", Kind::Key),
    ],
    indexes: &[&["advisory_id"], &["cve_id"]],
    unique: &[],
};

pub const BUGZILLAS: Table = Table {
    name: "bugzillas",
    columns: &[
        col("id", Kind::Id),
        col("advisory_id", Kind::Int),
        col("bugzilla_id", Kind::Key),
        col("url", Kind::Text),
        col("title", Kind::Text),
    ],
    indexes: &[&["advisory_id"]],
    unique: &[],
};

pub const RESOLUTIONS: Table = Table {
    name: "resolutions",
    columns: &[
        col("id", Kind::Id),
        col("advisory_id", Kind::Int),
        col("state", Kind::Key),
    ],
    indexes: &[&["advisory_id"]],
    unique: &[],
};

pub const COMPONENTS: Table = Table {
    name: "components",
    columns: &[
        col("id", Kind::Id),
        col("resolution_id", Kind::Int),
        col("component", Kind::Key),
    ],
    indexes: &[&["resolution_id"]],
    unique: &[],
};

pub const CPES: Table = Table {
    name: "cpes",
    columns: &[
        col("id", Kind::Id),
        col("advisory_id", Kind::Int),
        col("cpe", Kind::Text),
    ],
    indexes: &[&["advisory_id"]],
    unique: &[],
};

pub const PACKAGES: Table = Table {
    name: "packages",
    columns: &[
        col("id", Kind::Id),
        col("definition_id", Kind::Int),
        col("name", Kind::Key),
        col("version", Kind::Key),
        col("arch", Kind::Key),
        col("not_fixed_yet", Kind::Int),
        col("modularity_label", Kind::Key),
    ],
    indexes: &[&["definition_id"], &["name"]],
    unique: &[],
};

pub const REFERENCES: Table = Table {
    name: "references",
    columns: &[
        col("id", Kind::Id),
        col("definition_id", Kind::Int),
        col("source", Kind::Key),
        col("ref_id", Kind::Key),
        col("ref_url", Kind::Text),
    ],
    indexes: &[&["definition_id"]],
    unique: &[],
};

pub const DEBIANS: Table = Table {
    name: "debians",
    columns: &[
        col("id", Kind::Id),
        col("definition_id", Kind::Int),
        col("dsa", Kind::Key),
    ],
    indexes: &[&["definition_id"]],
    unique: &[],
};

pub const TABLES: &[&Table] = &[
    &FETCH_META,
    &ROOTS,
    &DEFINITIONS,
    &ADVISORIES,
    &CVES,
    &BUGZILLAS,
    &RESOLUTIONS,
    &COMPONENTS,
    &CPES,
    &PACKAGES,
    &REFERENCES,
    &DEBIANS,
];

pub fn column_type(dialect: Dialect, kind: Kind) -> &'static str {
    match (kind, dialect) {
        (Kind::Id, _) => "BIGINT NOT NULL PRIMARY KEY",
        (Kind::Int, _) => "BIGINT NOT NULL DEFAULT 0",
        (Kind::Key, Dialect::Mysql) => "VARCHAR(255)",
        (Kind::Text, Dialect::Mysql) => "LONGTEXT",
        _ => "TEXT",
    }
}

fn index_name(table: &Table, columns: &[&str], unique: bool) -> String {
    let prefix = if unique { "uidx" } else { "idx" };
    format!("{}_{}_{}", prefix, table.name, columns.join("_"))
}

fn all_indexes(table: &Table) -> impl Iterator<Item = (&'static [&'static str], bool)> + '_ {
    let plain = table.indexes.iter().map(|idx| (*idx, false));
    plain.chain(table.unique.iter().map(|idx| (*idx, true)))
}

fn quoted_list(dialect: Dialect, columns: &[&str]) -> String {
    columns
        .iter()
        .map(|c| quote(dialect, c))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn create_table_sql(dialect: Dialect, table: &Table) -> String {
    let mut parts: Vec<String> = table
        .columns
        .iter()
        .map(|c| format!("{} {}", quote(dialect, c.name), column_type(dialect, c.kind)))
        .collect();

    // MySQL has no CREATE INDEX IF NOT EXISTS, so its indexes go inline
    if dialect == Dialect::Mysql {
        for (idx, unique) in all_indexes(table) {
            parts.push(format!(
                "{}INDEX {} ({})",
                if unique { "UNIQUE " } else { "" },
                quote(dialect, &index_name(table, idx, unique)),
                quoted_list(dialect, idx)
            ));
        }
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote(dialect, table.name),
        parts.join(", ")
    )
}

pub fn create_index_sql(dialect: Dialect, table: &Table, columns: &[&str], unique: bool) -> String {
    format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
        if unique { "UNIQUE " } else { "" },
        quote(dialect, &index_name(table, columns, unique)),
        quote(dialect, table.name),
        quoted_list(dialect, columns)
    )
}

pub fn add_column_sql(dialect: Dialect, table: &Table, column: &Column) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote(dialect, table.name),
        quote(dialect, column.name),
        column_type(dialect, column.kind)
    )
}

pub fn has_column_sql(dialect: Dialect) -> String {
    let (t, c) = (placeholder(dialect, 1), placeholder(dialect, 2));
    match dialect {
        Dialect::Mysql => format!(
            "SELECT COUNT(*) FROM information_schema.columns \
             WHERE table_schema = DATABASE() AND table_name = {} AND column_name = {}",
            t, c
        ),
        Dialect::Postgres => format!(
            "SELECT COUNT(*) FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = {} AND column_name = {}",
            t, c
        ),
        _ => format!("SELECT COUNT(*) FROM pragma_table_info({}) WHERE name = {}", t, c),
    }
}

pub async fn has_column(conn: &mut AnyConnection, dialect: Dialect, table: &str, column: &str) -> Result<bool> {
    let sql = has_column_sql(dialect);
    let row = sqlx::query(&sql)
        .bind(table.to_string())
        .bind(column.to_string())
        .fetch_one(&mut *conn)
        .await?;
    let n: i64 = row.try_get(0)?;
    Ok(n > 0)
}

/// Create missing tables, columns and indexes. Never drops anything.
pub async fn migrate(conn: &mut AnyConnection, dialect: Dialect) -> Result<()> {
    for table in TABLES {
        sqlx::query(&create_table_sql(dialect, table)).execute(&mut *conn).await?;

        for column in table.columns.iter().filter(|c| c.kind != Kind::Id) {
            if !has_column(conn, dialect, table.name, column.name).await? {
                tracing::debug!(table = table.name, column = column.name, "adding column");
                sqlx::query(&add_column_sql(dialect, table, column)).execute(&mut *conn).await?;
            }
        }

        if dialect != Dialect::Mysql {
            for (idx, unique) in all_indexes(table) {
                sqlx::query(&create_index_sql(dialect, table, idx, unique)).execute(&mut *conn).await?;
            }
        }
    }
    Ok(())
}
