//! ovaldb - OVAL vulnerability dictionary storage and query engine
//!
//! # Architecture
//!
//! - **One contract, two stores**: [`OvalStore`] over SQL (sqlite3, mysql,
//!   postgres via sqlx) and over an embedded KV store (sled)
//! - **Canonical keys**: every (family, version) goes through
//!   [`family::canonicalize`] on the way in and on the way out
//! - **Snapshot replace**: `insert_root` swaps the whole feed of one
//!   (family, version); the KV driver reconciles its indexes from a
//!   dependency manifest instead of scanning
//! - **Shared shaping**: family filters and advisory maps live in
//!   [`db::filter`] so the drivers cannot drift
//!
//! # Usage example
//!
//! ```no_run
//! use chrono::Utc;
//! use ovaldb::{new_db, Options, OvalStore};
//! use ovaldb::models::{Cve, Definition, Package, Root};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let db = new_db("sqlite3", "/var/lib/oval/oval.sqlite3", false, Options::default())?;
//!
//! let mut def = Definition {
//!     definition_id: "oval:com.redhat.rhsa:def:20190001".into(),
//!     affected_packs: vec![Package::new("bash", "0:4.2.46-34.el7")],
//!     ..Default::default()
//! };
//! def.advisory.cves.push(Cve::new("CVE-2019-9924"));
//! db.insert_root(&Root::new("centos", "7", Utc::now()).with_definitions(vec![def]))?;
//!
//! // centos 7.9 is stored and queried as redhat 7
//! let defs = db.get_by_cve_id("centos", "7.9", "CVE-2019-9924", "")?;
//! println!("Found {} definitions", defs.len());
//! # Ok(())
//! # }
//! ```

pub mod db;
pub mod error;
pub mod family;
pub mod models;

pub use db::{new_db, Dialect, KvDriver, Options, OvalStore, RdbDriver};
pub use error::{OvalError, Result};
pub use models::{Definition, FetchMeta, Root};
