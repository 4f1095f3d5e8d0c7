//! Family-specific result shaping shared by every driver
//!
//! Drivers only fetch; everything that depends on the family happens here so
//! that the relational and KV backends cannot drift apart.

use std::collections::{HashMap, HashSet};

use crate::family::{self, AMAZON, DEBIAN, FEDORA, ORACLE, REDHAT, UBUNTU};
use crate::models::{Definition, Package};

const REDHAT_CVE_DEF_PREFIX: &str = "oval:com.redhat.cve:def:";
const UBUNTU_NOTICE_PREFIX: &str = "https://ubuntu.com/security/notices/";
const UBUNTU_USN_PREFIX: &str = "https://ubuntu.com/security/notices/USN-";

/// Keep packages built for the requested Red Hat major release.
///
/// Not-fixed-yet packages carry no version and always survive.
pub fn filter_by_redhat_major(packs: Vec<Package>, major: &str) -> Vec<Package> {
    if major.is_empty() {
        return packs;
    }
    let el = format!(".el{}", major);
    let module_el = format!(".module+el{}", major);
    packs
        .into_iter()
        .filter(|p| p.not_fixed_yet || p.version.contains(&el) || p.version.contains(&module_el))
        .collect()
}

/// Keep packages for `arch`; an empty `arch` keeps everything.
pub fn filter_by_arch(packs: Vec<Package>, arch: &str) -> Vec<Package> {
    if arch.is_empty() {
        return packs;
    }
    packs.into_iter().filter(|p| p.arch == arch).collect()
}

/// Apply the per-family package filters and definition de-duplication.
///
/// `family` and `version` must already be canonical.
pub fn shape_definitions(family: &str, version: &str, arch: &str, defs: Vec<Definition>) -> Vec<Definition> {
    let mut defs = defs;
    if family == REDHAT {
        let major = family::major(version);
        for def in &mut defs {
            let packs = std::mem::take(&mut def.affected_packs);
            def.affected_packs = filter_by_redhat_major(packs, major);
        }
    } else if family::filters_by_arch(family) {
        for def in &mut defs {
            let packs = std::mem::take(&mut def.affected_packs);
            def.affected_packs = filter_by_arch(packs, arch);
        }
    }

    if family::is_suse(family) {
        let mut seen = HashSet::new();
        defs.retain(|d| seen.insert(d.definition_id.clone()));
    }
    defs
}

/// Shape the result of a package-name lookup.
///
/// Definitions survive the package filters even when those empty their
/// package list. On families indexed by architecture a non-empty `arch`
/// additionally requires the requested package built for that `arch`.
pub fn shape_package_lookup(
    family: &str,
    version: &str,
    package: &str,
    arch: &str,
    defs: Vec<Definition>,
) -> Vec<Definition> {
    let mut defs = shape_definitions(family, version, arch, defs);
    if family::filters_by_arch(family) && !arch.is_empty() {
        defs.retain(|d| d.affected_packs.iter().any(|p| p.name == package && p.arch == arch));
    }
    defs
}

/// Shape the result of a CVE lookup.
pub fn shape_cve_lookup(family: &str, version: &str, arch: &str, defs: Vec<Definition>) -> Vec<Definition> {
    shape_definitions(family, version, arch, defs)
}

/// One definition per id, the first occurrence in feed order.
pub fn first_occurrences(defs: &[Definition]) -> Vec<&Definition> {
    let mut seen = HashSet::with_capacity(defs.len());
    defs.iter().filter(|d| seen.insert(d.definition_id.as_str())).collect()
}

/// Build the advisory-id → CVE-id map for a canonical family.
///
/// Families without an advisory notion (alpine, anything unlisted) map to
/// an empty result.
pub fn advisory_map<'a, I>(family: &str, defs: I) -> HashMap<String, Vec<String>>
where
    I: IntoIterator<Item = &'a Definition>,
{
    let mut advs: HashMap<String, Vec<String>> = HashMap::new();
    let mut dedup = true;

    for def in defs {
        if def.advisory.cves.is_empty() {
            continue;
        }
        let cves = || def.cve_ids().map(str::to_string);

        match family {
            DEBIAN => {
                if let Some(dsa) = def.debian.as_ref().map(|d| d.dsa.as_str()).filter(|s| !s.is_empty()) {
                    advs.entry(dsa.to_string()).or_default().extend(cves());
                }
            }
            UBUNTU => {
                for r in &def.references {
                    if r.ref_url.starts_with(UBUNTU_USN_PREFIX) {
                        let id = r.ref_url.trim_start_matches(UBUNTU_NOTICE_PREFIX);
                        advs.entry(id.to_string()).or_default().extend(cves());
                    }
                }
            }
            REDHAT => {
                if def.definition_id.starts_with(REDHAT_CVE_DEF_PREFIX) {
                    continue;
                }
                group_by_reference(&mut advs, def, "RHSA");
            }
            ORACLE => group_by_reference(&mut advs, def, "elsa"),
            AMAZON | FEDORA => {
                dedup = false;
                advs.entry(def.title.clone()).or_default().extend(cves());
            }
            f if family::is_suse(f) => group_by_reference(&mut advs, def, "SUSE-SU"),
            _ => return HashMap::new(),
        }
    }

    if dedup {
        for cves in advs.values_mut() {
            unique_in_place(cves);
        }
    }
    advs
}

fn group_by_reference(advs: &mut HashMap<String, Vec<String>>, def: &Definition, source: &str) {
    for r in def.references.iter().filter(|r| r.source == source) {
        advs.entry(r.ref_id.clone())
            .or_default()
            .extend(def.cve_ids().map(str::to_string));
    }
}

/// Drop repeated entries, keeping first-seen order.
fn unique_in_place(items: &mut Vec<String>) {
    let mut seen = HashSet::with_capacity(items.len());
    items.retain(|s| seen.insert(s.clone()));
}
