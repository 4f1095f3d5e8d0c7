//! OVAL data model
//!
//! The serde shape of [`Definition`] is what the KV driver stores in its
//! DEF hash, so field names are fixed.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel instant used when no time is known (1000-01-01T00:00:00Z).
pub fn epoch_sentinel() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1000, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Identity of the tool that last wrote the database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchMeta {
    pub revision: String,
    pub schema_version: u32,
    pub last_fetched_at: DateTime<Utc>,
}

impl FetchMeta {
    pub fn new(last_fetched_at: DateTime<Utc>) -> Self {
        Self {
            revision: crate::db::REVISION.to_string(),
            schema_version: crate::db::LATEST_SCHEMA_VERSION,
            last_fetched_at,
        }
    }

    /// True if this database was written by the current schema.
    pub fn outdated(&self) -> bool {
        self.schema_version != crate::db::LATEST_SCHEMA_VERSION
    }
}

impl Default for FetchMeta {
    fn default() -> Self {
        Self::new(epoch_sentinel())
    }
}

/// One snapshot of OVAL data for a single (family, version)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Root {
    pub family: String,
    pub os_version: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub definitions: Vec<Definition>,
}

impl Root {
    pub fn new(family: impl Into<String>, os_version: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            family: family.into(),
            os_version: os_version.into(),
            timestamp,
            definitions: Vec::new(),
        }
    }

    pub fn with_definitions(mut self, definitions: Vec<Definition>) -> Self {
        self.definitions = definitions;
        self
    }
}

/// One advisory record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    #[serde(rename = "DefinitionID")]
    pub definition_id: String,
    #[serde(rename = "Title", default)]
    pub title: String,
    #[serde(rename = "Description", default)]
    pub description: String,
    #[serde(rename = "Advisory", default)]
    pub advisory: Advisory,
    #[serde(rename = "Debian", default)]
    pub debian: Option<Debian>,
    #[serde(rename = "AffectedPacks", default, deserialize_with = "nullable_vec")]
    pub affected_packs: Vec<Package>,
    #[serde(rename = "References", default, deserialize_with = "nullable_vec")]
    pub references: Vec<Reference>,
}

impl Definition {
    pub fn cve_ids(&self) -> impl Iterator<Item = &str> {
        self.advisory.cves.iter().map(|c| c.cve_id.as_str())
    }
}

/// Scoring and cross-reference bundle of a definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advisory {
    #[serde(rename = "Severity", default)]
    pub severity: String,
    #[serde(rename = "Cves", default, deserialize_with = "nullable_vec")]
    pub cves: Vec<Cve>,
    #[serde(rename = "Bugzillas", default, deserialize_with = "nullable_vec")]
    pub bugzillas: Vec<Bugzilla>,
    #[serde(rename = "AffectedResolution", default, deserialize_with = "nullable_vec")]
    pub affected_resolution: Vec<Resolution>,
    #[serde(rename = "AffectedCPEList", default, deserialize_with = "nullable_vec")]
    pub affected_cpe_list: Vec<Cpe>,
    #[serde(rename = "Issued", default = "epoch_sentinel")]
    pub issued: DateTime<Utc>,
    #[serde(rename = "Updated", default = "epoch_sentinel")]
    pub updated: DateTime<Utc>,
}

impl Default for Advisory {
    fn default() -> Self {
        Self {
            severity: String::new(),
            cves: Vec::new(),
            bugzillas: Vec::new(),
            affected_resolution: Vec::new(),
            affected_cpe_list: Vec::new(),
            issued: epoch_sentinel(),
            updated: epoch_sentinel(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cve {
    #[serde(rename = "CveID")]
    pub cve_id: String,
    #[serde(rename = "Cvss2", default)]
    pub cvss2: String,
    #[serde(rename = "Cvss3", default)]
    pub cvss3: String,
    #[serde(rename = "Cwe", default)]
    pub cwe: String,
    #[serde(rename = "Impact", default)]
    pub impact: String,
    #[serde(rename = "Href", default)]
    pub href: String,
    #[serde(rename = "Public", default)]
    pub public: String,
}

impl Cve {
    pub fn new(cve_id: impl Into<String>) -> Self {
        Self {
            cve_id: cve_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bugzilla {
    #[serde(rename = "BugzillaID", default)]
    pub bugzilla_id: String,
    #[serde(rename = "URL", default)]
    pub url: String,
    #[serde(rename = "Title", default)]
    pub title: String,
}

/// Affected-resolution bundle (Red Hat "state" plus component names)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "Components", default, deserialize_with = "nullable_vec")]
    pub components: Vec<Component>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    #[serde(rename = "Component", default)]
    pub component: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cpe {
    #[serde(rename = "Cpe", default)]
    pub cpe: String,
}

/// Affected package. `version` is the fixed version, empty when not fixed yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Version", default)]
    pub version: String,
    /// Empty means any architecture
    #[serde(rename = "Arch", default)]
    pub arch: String,
    #[serde(rename = "NotFixedYet", default)]
    pub not_fixed_yet: bool,
    #[serde(rename = "ModularityLabel", default)]
    pub modularity_label: String,
}

impl Package {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = arch.into();
        self
    }

    pub fn not_fixed_yet(mut self) -> Self {
        self.not_fixed_yet = true;
        self.version.clear();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    #[serde(rename = "Source", default)]
    pub source: String,
    #[serde(rename = "RefID", default)]
    pub ref_id: String,
    #[serde(rename = "RefURL", default)]
    pub ref_url: String,
}

impl Reference {
    pub fn new(source: impl Into<String>, ref_id: impl Into<String>, ref_url: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ref_id: ref_id.into(),
            ref_url: ref_url.into(),
        }
    }
}

/// Debian-specific side block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Debian {
    #[serde(rename = "DSA", default)]
    pub dsa: String,
}

/// Stored documents written by other tools encode empty lists as `null`.
fn nullable_vec<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
