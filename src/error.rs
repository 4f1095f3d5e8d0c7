//! Error types for the OVAL dictionary

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OvalError>;

#[derive(Error, Debug)]
pub enum OvalError {
    #[error("unknown os family: {family}")]
    UnsupportedFamily { family: String },

    #[error("not supported DB dialect: {0}")]
    UnsupportedDialect(String),

    /// Embedded file database reported SQLITE_BUSY / SQLITE_LOCKED.
    #[error("database is locked")]
    Locked,

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("KV error: {0}")]
    Kv(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("relationship may be broken, definition field does not exist. family: {family}, version: {version}, defID: {def_id}")]
    BrokenRelationship {
        family: String,
        version: String,
        def_id: String,
    },

    #[error("database {conn} ({dialect}) was created by an incompatible schema version. Delete the database and fetch again")]
    SchemaIncompatible { dialect: String, conn: String },

    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),

    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("database is closed")]
    Closed,

    #[error("failed to {op}{target}: {source}")]
    Context {
        op: &'static str,
        target: String,
        #[source]
        source: Box<OvalError>,
    },
}

impl OvalError {
    /// True if this error, or any error it wraps, is the locked sentinel.
    pub fn is_locked(&self) -> bool {
        match self {
            OvalError::Locked => true,
            OvalError::Context { source, .. } => source.is_locked(),
            _ => false,
        }
    }

    /// True if this error, or any error it wraps, is a schema gate refusal.
    pub fn is_schema_incompatible(&self) -> bool {
        match self {
            OvalError::SchemaIncompatible { .. } => true,
            OvalError::Context { source, .. } => source.is_schema_incompatible(),
            _ => false,
        }
    }

    /// Innermost error beneath any `Context` layers.
    pub fn root_cause(&self) -> &OvalError {
        match self {
            OvalError::Context { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Attach the operation name and (family, version) to a failure.
pub trait ResultExt<T> {
    fn context(self, op: &'static str, family: &str, version: &str) -> Result<T>;

    fn op(self, op: &'static str) -> Result<T>;
}

impl<T, E: Into<OvalError>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, op: &'static str, family: &str, version: &str) -> Result<T> {
        self.map_err(|e| OvalError::Context {
            op,
            target: format!(". family: {}, version: {}", family, version),
            source: Box::new(e.into()),
        })
    }

    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|e| OvalError::Context {
            op,
            target: String::new(),
            source: Box::new(e.into()),
        })
    }
}
