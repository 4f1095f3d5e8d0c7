//! Storage drivers and the query contract they share

pub mod filter;
pub mod kv;
pub mod rdb;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Months, Utc};
use serde::Deserialize;

use crate::error::{OvalError, Result};
use crate::models::{Definition, FetchMeta, Root};

pub use kv::KvDriver;
pub use rdb::RdbDriver;

/// Revision of the binary that writes FetchMeta
pub const REVISION: &str = match option_env!("OVALDB_REVISION") {
    Some(rev) => rev,
    None => env!("CARGO_PKG_VERSION"),
};

/// Schema version written to FetchMeta
pub const LATEST_SCHEMA_VERSION: u32 = 2;

/// Largest chunk a single statement may cover (embedded SQL host-parameter ceiling)
pub const HOST_PARAM_CHUNK: usize = 998;

/// Query contract implemented by every storage backend.
///
/// Every method taking `(family, version)` canonicalizes them first, so
/// callers may pass caller vocabulary (`centos`, `7.9`, ...).
pub trait OvalStore: Send + Sync {
    /// Dialect tag of this driver
    fn name(&self) -> &'static str;

    /// True if the database was written with the legacy v1 layout
    fn is_legacy_v1(&self) -> Result<bool>;

    /// Create or extend the storage layout
    fn migrate(&self) -> Result<()>;

    /// Release the backend; later calls fail with `Closed`
    fn close(&self) -> Result<()>;

    /// Stored FetchMeta, or a synthesized default
    fn fetch_meta(&self) -> Result<FetchMeta>;

    /// Store FetchMeta; revision and schema version are replaced by this build's
    fn upsert_fetch_meta(&self, meta: &FetchMeta) -> Result<()>;

    /// Number of definitions stored for (family, version)
    fn count_defs(&self, family: &str, version: &str) -> Result<usize>;

    /// Feed timestamp of the stored snapshot at whole-second precision, or
    /// [`very_old`] if there is none
    fn last_modified(&self, family: &str, version: &str) -> Result<DateTime<Utc>>;

    /// Replace the snapshot for the root's (family, version)
    fn insert_root(&self, root: &Root) -> Result<()>;

    /// Definitions affecting `package` (optionally only for `arch`)
    fn get_by_package_name(&self, family: &str, version: &str, package: &str, arch: &str) -> Result<Vec<Definition>>;

    /// Definitions referencing `cve_id`
    fn get_by_cve_id(&self, family: &str, version: &str, cve_id: &str, arch: &str) -> Result<Vec<Definition>>;

    /// Advisory id -> CVE ids
    fn get_advisories(&self, family: &str, version: &str) -> Result<HashMap<String, Vec<String>>>;
}

/// Supported backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Sqlite3,
    Mysql,
    Postgres,
    Sled,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Sqlite3 => "sqlite3",
            Dialect::Mysql => "mysql",
            Dialect::Postgres => "postgres",
            Dialect::Sled => "sled",
        }
    }

    pub fn is_relational(&self) -> bool {
        !matches!(self, Dialect::Sled)
    }
}

impl FromStr for Dialect {
    type Err = OvalError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sqlite3" => Ok(Dialect::Sqlite3),
            "mysql" => Ok(Dialect::Mysql),
            "postgres" => Ok(Dialect::Postgres),
            "sled" | "redis" => Ok(Dialect::Sled),
            other => Err(OvalError::UnsupportedDialect(other.to_string())),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Driver options
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Rows per insert batch; must be positive
    pub batch_size: i64,
    /// Per-read deadline for the KV driver
    pub kv_read_timeout: Option<Duration>,
    /// KV read worker threads
    pub kv_readers: usize,
    /// Busy handler for the embedded SQL file; zero reports contention at once
    pub sqlite_busy_timeout: Duration,
    /// Pool size for relational dialects
    pub max_connections: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            batch_size: 50,
            kv_read_timeout: None,
            kv_readers: 4,
            sqlite_busy_timeout: Duration::ZERO,
            max_connections: 5,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_size(mut self, n: i64) -> Self {
        self.batch_size = n;
        self
    }

    pub fn kv_read_timeout(mut self, d: Duration) -> Self {
        self.kv_read_timeout = if d.is_zero() { None } else { Some(d) };
        self
    }

    pub fn kv_readers(mut self, n: usize) -> Self {
        self.kv_readers = n;
        self
    }

    pub fn sqlite_busy_timeout(mut self, d: Duration) -> Self {
        self.sqlite_busy_timeout = d;
        self
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    /// Defaults overlaid with `OVALDB_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self> {
        let mut opts = Self::default();
        if let Some(v) = lookup("OVALDB_BATCH_SIZE") {
            opts.batch_size = parse_env("OVALDB_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("OVALDB_READ_TIMEOUT_SECS") {
            opts = opts.kv_read_timeout(Duration::from_secs(parse_env("OVALDB_READ_TIMEOUT_SECS", &v)?));
        }
        if let Some(v) = lookup("OVALDB_MAX_CONNECTIONS") {
            opts.max_connections = parse_env("OVALDB_MAX_CONNECTIONS", &v)?;
        }
        Ok(opts)
    }

    /// Validated batch size.
    pub(crate) fn checked_batch_size(&self) -> Result<usize> {
        if self.batch_size < 1 {
            return Err(OvalError::Config(
                "batch-size option is not set properly".to_string(),
            ));
        }
        Ok(self.batch_size as usize)
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| OvalError::Config(format!("invalid value for {}: {:?}", key, value)))
}

/// "No data" timestamp: now minus 100 years.
pub fn very_old() -> DateTime<Utc> {
    let now = Utc::now();
    now.checked_sub_months(Months::new(1200)).unwrap_or(now)
}

/// Open a driver, refuse legacy layouts, and migrate.
pub fn new_db(dialect: &str, conn: &str, debug: bool, options: Options) -> Result<Box<dyn OvalStore>> {
    let parsed: Dialect = dialect.parse()?;
    let driver: Box<dyn OvalStore> = match parsed {
        Dialect::Sled => Box::new(KvDriver::open(conn, debug, &options)?),
        relational => Box::new(RdbDriver::open(relational, conn, debug, &options)?),
    };

    if driver.is_legacy_v1()? {
        if let Err(e) = driver.close() {
            tracing::warn!(error = %e, "close after schema check failed");
        }
        return Err(OvalError::SchemaIncompatible {
            dialect: parsed.to_string(),
            conn: conn.to_string(),
        });
    }

    driver.migrate()?;
    tracing::debug!(dialect = %parsed, "database ready");
    Ok(driver)
}

/// Chunk length bounded by both the configured batch and [`HOST_PARAM_CHUNK`].
pub(crate) fn bounded_chunk(batch: usize) -> usize {
    batch.clamp(1, HOST_PARAM_CHUNK)
}
