//! Distribution families and (family, version) canonicalization
//!
//! Every write and every read goes through [`canonicalize`], so both sides
//! of an index lookup always agree on the key.

use crate::error::{OvalError, Result};

pub const DEBIAN: &str = "debian";
pub const UBUNTU: &str = "ubuntu";
pub const RASPBIAN: &str = "raspbian";
pub const REDHAT: &str = "redhat";
pub const CENTOS: &str = "centos";
pub const ORACLE: &str = "oracle";
pub const AMAZON: &str = "amazon";
pub const ALPINE: &str = "alpine";
pub const FEDORA: &str = "fedora";
pub const OPENSUSE: &str = "opensuse";
pub const OPENSUSE_LEAP: &str = "opensuse.leap";
pub const SUSE_ENTERPRISE_DESKTOP: &str = "suse.enterprise.desktop";
pub const SUSE_ENTERPRISE_SERVER: &str = "suse.enterprise.server";

/// Rolling release token, the only non-numeric openSUSE version.
pub const TUMBLEWEED: &str = "tumbleweed";

/// How much of a version string a family indexes at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precision {
    Major,
    MajorMinor,
    /// Major.minor, but `tumbleweed` passes through
    RollingOrMajorMinor,
    /// Amazon Linux release token from the first word
    AmazonRelease,
}

/// (input family, canonical family, version rule)
const FAMILY_TABLE: &[(&str, &str, Precision)] = &[
    (DEBIAN, DEBIAN, Precision::Major),
    (UBUNTU, UBUNTU, Precision::MajorMinor),
    (RASPBIAN, DEBIAN, Precision::Major),
    (REDHAT, REDHAT, Precision::Major),
    (CENTOS, REDHAT, Precision::Major),
    (ORACLE, ORACLE, Precision::Major),
    (AMAZON, AMAZON, Precision::AmazonRelease),
    (ALPINE, ALPINE, Precision::MajorMinor),
    (FEDORA, FEDORA, Precision::Major),
    (OPENSUSE, OPENSUSE, Precision::RollingOrMajorMinor),
    (OPENSUSE_LEAP, OPENSUSE_LEAP, Precision::MajorMinor),
    (SUSE_ENTERPRISE_DESKTOP, SUSE_ENTERPRISE_DESKTOP, Precision::MajorMinor),
    (SUSE_ENTERPRISE_SERVER, SUSE_ENTERPRISE_SERVER, Precision::MajorMinor),
];

/// Map caller vocabulary to the canonical (family, version) pair.
///
/// Examples:
/// - `("centos", "7.9")` -> `("redhat", "7")`
/// - `("raspbian", "10")` -> `("debian", "10")`
/// - `("ubuntu", "20.04.3")` -> `("ubuntu", "20.04")`
/// - `("amazon", "2 (Karoo)")` -> `("amazon", "2")`
pub fn canonicalize(family: &str, version: &str) -> Result<(String, String)> {
    let (_, canonical, precision) = FAMILY_TABLE
        .iter()
        .find(|(input, _, _)| *input == family)
        .ok_or_else(|| OvalError::UnsupportedFamily {
            family: family.to_string(),
        })?;

    let version = match precision {
        Precision::Major => major(version).to_string(),
        Precision::MajorMinor => major_dot_minor(version),
        Precision::RollingOrMajorMinor if version == TUMBLEWEED => version.to_string(),
        Precision::RollingOrMajorMinor => major_dot_minor(version),
        Precision::AmazonRelease => amazon_release(version).to_string(),
    };

    Ok((canonical.to_string(), version))
}

/// True for every tag [`canonicalize`] accepts.
pub fn is_supported(family: &str) -> bool {
    FAMILY_TABLE.iter().any(|(input, _, _)| *input == family)
}

/// Canonical families whose package rows are filtered by architecture.
pub fn filters_by_arch(family: &str) -> bool {
    matches!(family, AMAZON | ORACLE | FEDORA)
}

/// The four SUSE-derived canonical families.
pub fn is_suse(family: &str) -> bool {
    matches!(
        family,
        OPENSUSE | OPENSUSE_LEAP | SUSE_ENTERPRISE_DESKTOP | SUSE_ENTERPRISE_SERVER
    )
}

/// First dot-separated component.
pub fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

/// First two dot-separated components; shorter versions pass through.
fn major_dot_minor(version: &str) -> String {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() < 3 {
        return version.to_string();
    }
    parts[..2].join(".")
}

fn amazon_release(version: &str) -> &'static str {
    match version.split_whitespace().next() {
        Some("2023") => "2023",
        Some("2022") => "2022",
        Some("2") => "2",
        _ => "1",
    }
}
