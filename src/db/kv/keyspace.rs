//! String / hash / set values on top of one sled tree
//!
//! Layout of the physical keys:
//!
//! ```text
//! S <key>                  -> string value
//! H <key> 0x00 <field>     -> hash field value
//! M <key> 0x00 <member>    -> set member (empty value)
//! ```
//!
//! Logical keys never contain 0x00, so a prefix scan over `H <key> 0x00`
//! yields exactly the fields of one hash.

use std::collections::HashMap;
use std::path::Path;

use sled::{Db, IVec, Tree};

use crate::error::{OvalError, Result};

const TREE_NAME: &str = "oval";
const STRING_TAG: u8 = b'S';
const HASH_TAG: u8 = b'H';
const SET_TAG: u8 = b'M';
const SEP: u8 = 0;

fn string_key(key: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(key.len() + 1);
    k.push(STRING_TAG);
    k.extend_from_slice(key.as_bytes());
    k
}

fn container_prefix(tag: u8, key: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(key.len() + 2);
    k.push(tag);
    k.extend_from_slice(key.as_bytes());
    k.push(SEP);
    k
}

fn member_key(tag: u8, key: &str, member: &str) -> Vec<u8> {
    let mut k = container_prefix(tag, key);
    k.extend_from_slice(member.as_bytes());
    k
}

fn decode(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| OvalError::InvalidData(format!("non UTF-8 value: {}", e)))
}

/// Redis-style value types over an embedded ordered KV store
pub struct Keyspace {
    db: Db,
    tree: Tree,
}

impl Keyspace {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref()).map_err(lock_error)?;
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self { db, tree })
    }

    /// Throwaway keyspace that lives only in memory
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self { db, tree })
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.tree
            .get(string_key(key))?
            .map(|v| decode(&v))
            .transpose()
    }

    /// True if `key` holds a value of any type.
    pub fn exists(&self, key: &str) -> Result<bool> {
        if self.tree.contains_key(string_key(key))? {
            return Ok(true);
        }
        for tag in [HASH_TAG, SET_TAG] {
            if self.tree.scan_prefix(container_prefix(tag, key)).next().transpose()?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// True if any logical key starts with `prefix`.
    pub fn any_key_with_prefix(&self, prefix: &str) -> Result<bool> {
        for tag in [STRING_TAG, HASH_TAG, SET_TAG] {
            let mut p = Vec::with_capacity(prefix.len() + 1);
            p.push(tag);
            p.extend_from_slice(prefix.as_bytes());
            if self.tree.scan_prefix(p).next().transpose()?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.tree
            .get(member_key(HASH_TAG, key, field))?
            .map(|v| decode(&v))
            .transpose()
    }

    /// Values for `fields` in order; `None` where a field is missing.
    pub fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        fields.iter().map(|f| self.hget(key, f)).collect()
    }

    pub fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let prefix = container_prefix(HASH_TAG, key);
        let mut out = HashMap::new();
        for item in self.tree.scan_prefix(&prefix) {
            let (k, v) = item?;
            out.insert(decode(&k[prefix.len()..])?, decode(&v)?);
        }
        Ok(out)
    }

    pub fn hlen(&self, key: &str) -> Result<usize> {
        let mut n = 0;
        for item in self.tree.scan_prefix(container_prefix(HASH_TAG, key)) {
            item?;
            n += 1;
        }
        Ok(n)
    }

    pub fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let prefix = container_prefix(SET_TAG, key);
        self.tree
            .scan_prefix(&prefix)
            .keys()
            .map(|k| decode(&k?[prefix.len()..]))
            .collect()
    }

    /// Apply every operation of `batch` atomically.
    pub fn apply(&self, batch: WriteBatch) -> Result<()> {
        if batch.ops == 0 {
            return Ok(());
        }
        self.tree.apply_batch(batch.inner)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<usize> {
        Ok(self.db.flush()?)
    }
}

/// Map sled's file-lock failure onto the locked sentinel.
fn lock_error(err: sled::Error) -> OvalError {
    match &err {
        sled::Error::Io(io) if io.to_string().contains("could not acquire lock") => OvalError::Locked,
        _ => OvalError::Kv(err),
    }
}

/// Write operations applied together by [`Keyspace::apply`]
#[derive(Default)]
pub struct WriteBatch {
    inner: sled::Batch,
    ops: usize,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.push(string_key(key), Some(value.as_bytes()));
    }

    pub fn hset(&mut self, key: &str, field: &str, value: &str) {
        self.push(member_key(HASH_TAG, key, field), Some(value.as_bytes()));
    }

    pub fn hdel(&mut self, key: &str, field: &str) {
        self.push(member_key(HASH_TAG, key, field), None);
    }

    pub fn sadd(&mut self, key: &str, member: &str) {
        self.push(member_key(SET_TAG, key, member), Some(&[]));
    }

    pub fn srem(&mut self, key: &str, member: &str) {
        self.push(member_key(SET_TAG, key, member), None);
    }

    pub fn len(&self) -> usize {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops == 0
    }

    fn push(&mut self, key: Vec<u8>, value: Option<&[u8]>) {
        match value {
            Some(v) => self.inner.insert(key, IVec::from(v)),
            None => self.inner.remove(key),
        }
        self.ops += 1;
    }
}
