//! Key-value driver
//!
//! Snapshot data lives under fixed key names:
//!
//! ```text
//! OVAL#<family>#<version>#DEF            hash   def id -> Definition JSON
//! OVAL#<family>#<version>#CVE#<cve id>   set    def ids
//! OVAL#<family>#<version>#PKG#<name>     set    def ids
//! OVAL#<family>#<version>#ADV            hash   advisory id -> JSON cve id list
//! OVAL#<family>#<version>#DEP            string dependency manifest
//! OVAL#<family>#<version>#LASTMODIFIED   string feed timestamp
//! OVAL#FETCHMETA                         hash   Revision / SchemaVersion / LastFetchedAt
//! ```
//!
//! Ingest never scans: the DEP manifest written with each snapshot lists
//! every set membership and advisory it created, and the next ingest removes
//! whatever the new snapshot no longer produces.

pub mod deps;
pub mod keyspace;
pub mod reader;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rayon::prelude::*;

use self::deps::DepManifest;
use self::keyspace::{Keyspace, WriteBatch};
use self::reader::ReadPool;
use super::{filter, very_old, OvalStore, Options};
use crate::error::{OvalError, Result, ResultExt};
use crate::family;
use crate::models::{epoch_sentinel, Definition, FetchMeta, Root};

pub const FETCH_META_KEY: &str = "OVAL#FETCHMETA";
const KEY_PREFIX: &str = "OVAL#";
const LAST_MODIFIED_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

const FIELD_REVISION: &str = "Revision";
const FIELD_SCHEMA_VERSION: &str = "SchemaVersion";
const FIELD_LAST_FETCHED_AT: &str = "LastFetchedAt";

fn def_key(family: &str, version: &str) -> String {
    format!("OVAL#{}#{}#DEF", family, version)
}

fn cve_key(family: &str, version: &str, cve_id: &str) -> String {
    format!("OVAL#{}#{}#CVE#{}", family, version, cve_id)
}

fn pkg_key(family: &str, version: &str, name: &str) -> String {
    format!("OVAL#{}#{}#PKG#{}", family, version, name)
}

fn adv_key(family: &str, version: &str) -> String {
    format!("OVAL#{}#{}#ADV", family, version)
}

fn dep_key(family: &str, version: &str) -> String {
    format!("OVAL#{}#{}#DEP", family, version)
}

fn last_modified_key(family: &str, version: &str) -> String {
    format!("OVAL#{}#{}#LASTMODIFIED", family, version)
}

struct Shared {
    keyspace: Arc<Keyspace>,
    readers: ReadPool,
}

/// OVAL store on an embedded sled database
pub struct KvDriver {
    shared: RwLock<Option<Arc<Shared>>>,
    options: Options,
    debug: bool,
}

impl KvDriver {
    /// Open (or create) the sled directory at `conn`.
    pub fn open(conn: &str, debug: bool, options: &Options) -> Result<Self> {
        let path = conn.strip_prefix("sled://").unwrap_or(conn);
        let keyspace = Keyspace::open(path).op("open DB")?;
        Self::with_keyspace(keyspace, debug, options)
    }

    /// Driver over an in-memory keyspace that disappears on close.
    pub fn temporary(options: &Options) -> Result<Self> {
        let keyspace = Keyspace::temporary().op("open DB")?;
        Self::with_keyspace(keyspace, false, options)
    }

    fn with_keyspace(keyspace: Keyspace, debug: bool, options: &Options) -> Result<Self> {
        let keyspace = Arc::new(keyspace);
        let readers = ReadPool::spawn(Arc::clone(&keyspace), options.kv_readers, options.kv_read_timeout)
            .op("start read workers")?;
        tracing::debug!(readers = readers.worker_count(), timeout = ?options.kv_read_timeout, "kv driver opened");

        Ok(Self {
            shared: RwLock::new(Some(Arc::new(Shared { keyspace, readers }))),
            options: options.clone(),
            debug,
        })
    }

    fn shared(&self) -> Result<Arc<Shared>> {
        let guard = self.shared.read().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().cloned().ok_or(OvalError::Closed)
    }

    /// Look up definition ids in `index_key` and load their bodies.
    fn lookup(&self, family: &str, version: &str, index_key: String) -> Result<Vec<Definition>> {
        let shared = self.shared()?;
        let family = family.to_string();
        let version = version.to_string();
        if self.debug {
            tracing::debug!(key = %index_key, "smembers");
        }

        let bodies = shared.readers.run(move |ks| {
            let def_ids = ks.smembers(&index_key)?;
            if def_ids.is_empty() {
                return Ok(Vec::new());
            }
            let values = ks.hmget(&def_key(&family, &version), &def_ids)?;
            def_ids
                .into_iter()
                .zip(values)
                .map(|(def_id, value)| {
                    value.ok_or_else(|| OvalError::BrokenRelationship {
                        family: family.clone(),
                        version: version.clone(),
                        def_id,
                    })
                })
                .collect::<Result<Vec<String>>>()
        })?;

        bodies
            .iter()
            .map(|s| serde_json::from_str::<Definition>(s).map_err(OvalError::from))
            .collect()
    }
}

impl OvalStore for KvDriver {
    fn name(&self) -> &'static str {
        "sled"
    }

    fn is_legacy_v1(&self) -> Result<bool> {
        let shared = self.shared()?;
        shared
            .readers
            .run(|ks| {
                if ks.exists(FETCH_META_KEY)? {
                    return Ok(false);
                }
                ks.any_key_with_prefix(KEY_PREFIX)
            })
            .op("check schema version")
    }

    fn migrate(&self) -> Result<()> {
        // Key layout needs no migration
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let taken = self.shared.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(shared) = taken {
            shared.keyspace.flush().op("close DB")?;
        }
        Ok(())
    }

    fn fetch_meta(&self) -> Result<FetchMeta> {
        let shared = self.shared()?;
        let fields = shared
            .readers
            .run(|ks| {
                if !ks.exists(FETCH_META_KEY)? {
                    return Ok(None);
                }
                ks.hgetall(FETCH_META_KEY).map(Some)
            })
            .op("get FetchMeta")?;

        let Some(fields) = fields else {
            return Ok(FetchMeta::default());
        };
        decode_fetch_meta(&fields).op("get FetchMeta")
    }

    fn upsert_fetch_meta(&self, meta: &FetchMeta) -> Result<()> {
        let shared = self.shared()?;
        let current = FetchMeta::new(meta.last_fetched_at);
        let mut batch = WriteBatch::new();
        batch.hset(FETCH_META_KEY, FIELD_REVISION, &current.revision);
        batch.hset(FETCH_META_KEY, FIELD_SCHEMA_VERSION, &current.schema_version.to_string());
        batch.hset(
            FETCH_META_KEY,
            FIELD_LAST_FETCHED_AT,
            &current.last_fetched_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        );
        shared.keyspace.apply(batch).op("upsert FetchMeta")
    }

    fn count_defs(&self, family: &str, version: &str) -> Result<usize> {
        let (f, v) = family::canonicalize(family, version)?;
        let shared = self.shared()?;
        let key = def_key(&f, &v);
        shared.readers.run(move |ks| ks.hlen(&key)).context("count definitions", &f, &v)
    }

    fn last_modified(&self, family: &str, version: &str) -> Result<DateTime<Utc>> {
        let (f, v) = family::canonicalize(family, version)?;
        let shared = self.shared()?;
        let key = last_modified_key(&f, &v);
        let raw = shared.readers.run(move |ks| ks.get(&key)).context("get last modified", &f, &v)?;

        match raw {
            None => Ok(very_old()),
            Some(s) => NaiveDateTime::parse_from_str(&s, LAST_MODIFIED_FORMAT)
                .map(|t| t.and_utc())
                .map_err(|e| OvalError::InvalidData(format!("last modified {:?}: {}", s, e)))
                .context("get last modified", &f, &v),
        }
    }

    fn insert_root(&self, root: &Root) -> Result<()> {
        let batch_size = self.options.checked_batch_size()?;
        let (f, v) = family::canonicalize(&root.family, &root.os_version)?;
        let shared = self.shared()?;
        tracing::info!(family = %f, version = %v, "Refreshing...");

        write_snapshot(&shared.keyspace, &f, &v, root, batch_size).context("insert OVAL", &f, &v)
    }

    fn get_by_package_name(&self, family: &str, version: &str, package: &str, arch: &str) -> Result<Vec<Definition>> {
        let (f, v) = family::canonicalize(family, version)?;
        let defs = self
            .lookup(&f, &v, pkg_key(&f, &v, package))
            .context("get definitions by package name", &f, &v)?;
        Ok(filter::shape_package_lookup(&f, &v, package, arch, defs))
    }

    fn get_by_cve_id(&self, family: &str, version: &str, cve_id: &str, arch: &str) -> Result<Vec<Definition>> {
        let (f, v) = family::canonicalize(family, version)?;
        let defs = self
            .lookup(&f, &v, cve_key(&f, &v, cve_id))
            .context("get definitions by CVE ID", &f, &v)?;
        Ok(filter::shape_cve_lookup(&f, &v, arch, defs))
    }

    fn get_advisories(&self, family: &str, version: &str) -> Result<HashMap<String, Vec<String>>> {
        let (f, v) = family::canonicalize(family, version)?;
        let shared = self.shared()?;
        let key = adv_key(&f, &v);
        let raw = shared.readers.run(move |ks| ks.hgetall(&key)).context("get advisories", &f, &v)?;

        raw.into_iter()
            .map(|(adv, cves)| -> Result<(String, Vec<String>)> { Ok((adv, serde_json::from_str(&cves)?)) })
            .collect::<Result<HashMap<_, _>>>()
            .context("get advisories", &f, &v)
    }
}

fn decode_fetch_meta(fields: &HashMap<String, String>) -> Result<FetchMeta> {
    let revision = fields
        .get(FIELD_REVISION)
        .cloned()
        .ok_or_else(|| OvalError::InvalidData("FetchMeta has no Revision".to_string()))?;
    let schema_version = fields
        .get(FIELD_SCHEMA_VERSION)
        .ok_or_else(|| OvalError::InvalidData("FetchMeta has no SchemaVersion".to_string()))?
        .parse::<u32>()
        .map_err(|e| OvalError::InvalidData(format!("SchemaVersion: {}", e)))?;
    let last_fetched_at = match fields.get(FIELD_LAST_FETCHED_AT) {
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map_err(|e| OvalError::InvalidData(format!("LastFetchedAt {:?}: {}", s, e)))?
            .with_timezone(&Utc),
        None => epoch_sentinel(),
    };

    Ok(FetchMeta {
        revision,
        schema_version,
        last_fetched_at,
    })
}

/// Write `root` over the previous snapshot of (family, version).
fn write_snapshot(ks: &Keyspace, family: &str, version: &str, root: &Root, batch_size: usize) -> Result<()> {
    let unique = filter::first_occurrences(&root.definitions);
    let advisories = filter::advisory_map(family, unique.iter().copied());

    let dkey = dep_key(family, version);
    let mut old = DepManifest::parse(ks.get(&dkey)?.as_deref())?;
    let mut new = DepManifest::new();
    let defs_key = def_key(family, version);

    tracing::info!(count = unique.len(), "Inserting new definitions");
    for chunk in unique.chunks(batch_size) {
        let bodies = chunk
            .par_iter()
            .map(|d| serde_json::to_string(d))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut batch = WriteBatch::new();
        for (def, body) in chunk.iter().zip(&bodies) {
            let id = def.definition_id.as_str();
            batch.hset(&defs_key, id, body);
            new.record_definition(id);

            for cve in def.cve_ids() {
                batch.sadd(&cve_key(family, version, cve), id);
                new.add_cve(id, cve);
                old.forget_cve(id, cve);
            }
            for pack in &def.affected_packs {
                batch.sadd(&pkg_key(family, version, &pack.name), id);
                new.add_package(id, &pack.name);
                old.forget_package(id, &pack.name);
            }
            old.prune(id);
        }
        tracing::debug!(ops = batch.len(), "definition batch");
        ks.apply(batch)?;
    }

    tracing::info!(count = advisories.len(), "Inserting advisories");
    let akey = adv_key(family, version);
    let adv_ids: Vec<&String> = advisories.keys().collect();
    for chunk in adv_ids.chunks(batch_size) {
        let mut batch = WriteBatch::new();
        for adv in chunk {
            batch.hset(&akey, adv, &serde_json::to_string(&advisories[*adv])?);
            new.add_advisory(adv);
            old.forget_advisory(adv);
        }
        ks.apply(batch)?;
    }

    let mut batch = WriteBatch::new();
    for adv in old.advisories() {
        batch.hdel(&akey, &adv);
    }
    let stale = old.definitions();
    if !stale.is_empty() {
        tracing::info!(count = stale.len(), "Deleting old definitions");
    }
    for entry in stale {
        for cve in &entry.cves {
            batch.srem(&cve_key(family, version, cve), &entry.def_id);
        }
        for pack in &entry.packages {
            batch.srem(&pkg_key(family, version, pack), &entry.def_id);
        }
        if !new.has_definition(&entry.def_id) {
            batch.hdel(&defs_key, &entry.def_id);
        }
    }
    batch.set(&dkey, &new.to_json()?);
    batch.set(
        &last_modified_key(family, version),
        &root.timestamp.format(LAST_MODIFIED_FORMAT).to_string(),
    );
    ks.apply(batch)?;
    ks.flush()?;
    Ok(())
}
