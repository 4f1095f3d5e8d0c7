//! Dependency manifest kept under `OVAL#<family>#<version>#DEP`
//!
//! Records which CVE and package sets each definition was added to, plus
//! the advisory ids written, so the next snapshot can remove exactly what
//! it no longer contains. Stored as JSON:
//!
//! ```json
//! {"advisories": {"USN-1-1": {}},
//!  "oval:def:1": {"cves": {"CVE-1": {}}, "packages": {"bash": {}}}}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const ADVISORIES: &str = "advisories";
pub const CVES: &str = "cves";
pub const PACKAGES: &str = "packages";

/// Empty JSON object used as a set member marker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

type Members = BTreeMap<String, Empty>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DepManifest(BTreeMap<String, BTreeMap<String, Members>>);

/// What a definition id owned in a previous snapshot
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StaleDefinition {
    pub def_id: String,
    pub cves: Vec<String>,
    pub packages: Vec<String>,
}

impl DepManifest {
    /// Fresh manifest for a snapshot being written.
    pub fn new() -> Self {
        let mut m = BTreeMap::new();
        m.insert(ADVISORIES.to_string(), BTreeMap::new());
        Self(m)
    }

    /// Decode a stored manifest; a missing one is empty.
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        match raw {
            Some(s) if !s.is_empty() => Ok(serde_json::from_str(s)?),
            _ => Ok(Self::default()),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Register a definition with empty `cves` and `packages` groups.
    pub fn record_definition(&mut self, def_id: &str) {
        let entry = self.0.entry(def_id.to_string()).or_default();
        entry.entry(CVES.to_string()).or_default();
        entry.entry(PACKAGES.to_string()).or_default();
    }

    pub fn add_cve(&mut self, def_id: &str, cve_id: &str) {
        self.add(def_id, CVES, cve_id);
    }

    pub fn add_package(&mut self, def_id: &str, name: &str) {
        self.add(def_id, PACKAGES, name);
    }

    pub fn add_advisory(&mut self, adv_id: &str) {
        self.0
            .entry(ADVISORIES.to_string())
            .or_default()
            .insert(adv_id.to_string(), Members::new());
    }

    pub fn forget_cve(&mut self, def_id: &str, cve_id: &str) {
        self.forget(def_id, CVES, cve_id);
    }

    pub fn forget_package(&mut self, def_id: &str, name: &str) {
        self.forget(def_id, PACKAGES, name);
    }

    pub fn forget_advisory(&mut self, adv_id: &str) {
        if let Some(advs) = self.0.get_mut(ADVISORIES) {
            advs.remove(adv_id);
        }
    }

    /// True if `def_id` is recorded in this manifest.
    pub fn has_definition(&self, def_id: &str) -> bool {
        def_id != ADVISORIES && self.0.contains_key(def_id)
    }

    /// Remove empty groups and then `def_id` itself if nothing is left.
    pub fn prune(&mut self, def_id: &str) {
        if def_id == ADVISORIES {
            return;
        }
        if let Some(groups) = self.0.get_mut(def_id) {
            groups.retain(|_, members| !members.is_empty());
            if groups.is_empty() {
                self.0.remove(def_id);
            }
        }
    }

    /// Advisory ids listed in this manifest.
    pub fn advisories(&self) -> Vec<String> {
        self.0
            .get(ADVISORIES)
            .map(|advs| advs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Every definition entry with what it still owns.
    pub fn definitions(&self) -> Vec<StaleDefinition> {
        self.0
            .iter()
            .filter(|(id, _)| id.as_str() != ADVISORIES)
            .map(|(id, groups)| {
                let keys = |name: &str| -> Vec<String> {
                    groups.get(name).map(|m| m.keys().cloned().collect()).unwrap_or_default()
                };
                StaleDefinition {
                    def_id: id.clone(),
                    cves: keys(CVES),
                    packages: keys(PACKAGES),
                }
            })
            .collect()
    }

    fn add(&mut self, outer: &str, group: &str, member: &str) {
        self.0
            .entry(outer.to_string())
            .or_default()
            .entry(group.to_string())
            .or_default()
            .insert(member.to_string(), Empty {});
    }

    fn forget(&mut self, outer: &str, group: &str, member: &str) {
        if let Some(members) = self.0.get_mut(outer).and_then(|g| g.get_mut(group)) {
            members.remove(member);
        }
    }
}
