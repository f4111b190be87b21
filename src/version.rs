//! Cluster version resolution
//!
//! A tenant declares its desired version as an annotation: either the
//! development sentinel, a full pinned string like `v1.14.5-002`, or a loose
//! `MAJOR.MINOR` form that is resolved against the catalogs present on disk.
//! Loose versions resolve to the highest patch, then the highest revision,
//! and the pinned result is written back onto the tenant object so later
//! passes see a stable target.

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::{Error, Result};

/// Version literal meaning "always redeploy, unversioned development build"
pub const DEV_VERSION: &str = "dev";

/// A fully pinned release version, `vMAJOR.MINOR.PATCH-REVISION`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseVersion {
    major: u32,
    minor: u32,
    patch: u32,
    /// Revision digits as they appear in the catalog name; compared
    /// numerically but displayed verbatim so catalog paths round-trip.
    revision: String,
}

impl ReleaseVersion {
    /// The Kubernetes distribution component, `MAJOR.MINOR.PATCH`
    pub fn kubernetes_version(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }

    /// The internal revision component as a number
    pub fn revision(&self) -> u32 {
        // validated to be all digits at parse time
        self.revision.parse().unwrap_or(0)
    }

    fn cmp_key(&self) -> (u32, u32, u32, u32) {
        (self.major, self.minor, self.patch, self.revision())
    }
}

impl PartialOrd for ReleaseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReleaseVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_key().cmp(&other.cmp_key())
    }
}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v{}.{}.{}-{}",
            self.major, self.minor, self.patch, self.revision
        )
    }
}

impl FromStr for ReleaseVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidVersion(s.to_string());

        let rest = s.strip_prefix('v').ok_or_else(invalid)?;
        let (dotted, revision) = rest.split_once('-').ok_or_else(invalid)?;
        if revision.is_empty() || !revision.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let mut parts = dotted.splitn(3, '.');
        let mut next = || -> Result<u32> {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(invalid)
        };
        let (major, minor, patch) = (next()?, next()?, next()?);

        Ok(Self {
            major,
            minor,
            patch,
            revision: revision.to_string(),
        })
    }
}

/// A resolved target version: a pinned release or the development sentinel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterVersion {
    /// Unversioned development build; every chart redeploys on every pass
    Dev,
    /// A concrete, catalog-backed release
    Release(ReleaseVersion),
}

impl ClusterVersion {
    /// Whether this is the development sentinel
    pub fn is_dev(&self) -> bool {
        matches!(self, ClusterVersion::Dev)
    }

    /// The Kubernetes distribution component, where one exists
    pub fn kubernetes_version(&self) -> Option<String> {
        match self {
            ClusterVersion::Dev => None,
            ClusterVersion::Release(r) => Some(r.kubernetes_version()),
        }
    }
}

impl fmt::Display for ClusterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterVersion::Dev => f.write_str(DEV_VERSION),
            ClusterVersion::Release(r) => r.fmt(f),
        }
    }
}

/// What a tenant should run, decided by policy when nothing is declared
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissingVersionPolicy {
    /// Fail the pass with `MissingVersion`
    Reject,
    /// Fall back to the development sentinel
    DevSentinel,
}

/// Outcome of version resolution
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedVersion {
    /// The concrete target version
    pub version: ClusterVersion,
    /// True when a loose `MAJOR.MINOR` declaration was pinned to a concrete
    /// catalog; the caller writes the pinned string back onto the tenant.
    pub pinned: bool,
}

/// Resolve a declared version string against the catalogs present on disk.
pub fn resolve(
    declared: Option<&str>,
    catalog_root: &Path,
    policy: MissingVersionPolicy,
) -> Result<ResolvedVersion> {
    let declared = declared.map(str::trim).filter(|s| !s.is_empty());

    let declared = match declared {
        None => {
            return match policy {
                MissingVersionPolicy::Reject => Err(Error::MissingVersion),
                MissingVersionPolicy::DevSentinel => Ok(ResolvedVersion {
                    version: ClusterVersion::Dev,
                    pinned: false,
                }),
            }
        }
        Some(s) => s,
    };

    // Guard against catalog-path traversal before the string touches a path.
    if declared.contains(std::path::is_separator) || declared.contains("..") {
        return Err(Error::InvalidVersion(declared.to_string()));
    }

    if declared == DEV_VERSION {
        return Ok(ResolvedVersion {
            version: ClusterVersion::Dev,
            pinned: false,
        });
    }

    // Exact on-disk catalog match resolves as-is.
    if catalog_root.join(declared).is_dir() {
        let version = declared.parse::<ReleaseVersion>()?;
        return Ok(ResolvedVersion {
            version: ClusterVersion::Release(version),
            pinned: false,
        });
    }

    // A loose MAJOR.MINOR declaration pins to the best matching catalog.
    if let Some((major, minor)) = parse_major_minor(declared) {
        let best = on_disk_versions(catalog_root)?
            .into_iter()
            .filter(|v| (v.major, v.minor) == (major, minor))
            .max();
        return match best {
            Some(version) => Ok(ResolvedVersion {
                version: ClusterVersion::Release(version),
                pinned: true,
            }),
            None => Err(Error::NoSuchVersion(declared.to_string())),
        };
    }

    // A full version string that matched no catalog directory.
    if declared.parse::<ReleaseVersion>().is_ok() {
        return Err(Error::NoSuchVersion(declared.to_string()));
    }

    Err(Error::InvalidVersion(declared.to_string()))
}

fn parse_major_minor(s: &str) -> Option<(u32, u32)> {
    let s = s.strip_prefix('v').unwrap_or(s);
    let (major, minor) = s.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// All parseable catalog directory names under the root. Directories that do
/// not look like versions (including the dev catalog) are ignored.
fn on_disk_versions(catalog_root: &Path) -> Result<Vec<ReleaseVersion>> {
    let mut versions = Vec::new();
    for entry in std::fs::read_dir(catalog_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if let Ok(version) = name.parse::<ReleaseVersion>() {
                versions.push(version);
            }
        }
    }
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_fixture(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        dir
    }

    #[test]
    fn full_version_parses_and_round_trips() {
        let v: ReleaseVersion = "v1.14.5-002".parse().unwrap();
        assert_eq!(v.kubernetes_version(), "1.14.5");
        assert_eq!(v.revision(), 2);
        assert_eq!(v.to_string(), "v1.14.5-002");
    }

    #[test]
    fn malformed_versions_are_rejected() {
        for bad in ["1.14.5-002", "v1.14.5", "v1.14-002", "v1.14.5-x2", "vvv"] {
            assert!(bad.parse::<ReleaseVersion>().is_err(), "{bad}");
        }
    }

    #[test]
    fn loose_version_pins_to_highest_patch_then_revision() {
        let dir = catalog_fixture(&["v1.14.3-001", "v1.14.5-002", "v1.14.5-001"]);

        let resolved = resolve(Some("1.14"), dir.path(), MissingVersionPolicy::Reject).unwrap();
        assert!(resolved.pinned);
        assert_eq!(resolved.version.to_string(), "v1.14.5-002");
    }

    #[test]
    fn exact_match_resolves_as_is_without_pinning() {
        let dir = catalog_fixture(&["v1.14.3-001", "v1.14.5-002"]);

        let resolved =
            resolve(Some("v1.14.3-001"), dir.path(), MissingVersionPolicy::Reject).unwrap();
        assert!(!resolved.pinned);
        assert_eq!(resolved.version.to_string(), "v1.14.3-001");
    }

    #[test]
    fn loose_version_with_no_catalog_fails() {
        let dir = catalog_fixture(&["v1.14.5-002"]);

        let err = resolve(Some("1.15"), dir.path(), MissingVersionPolicy::Reject).unwrap_err();
        assert!(matches!(err, Error::NoSuchVersion(_)));
    }

    #[test]
    fn pinned_version_absent_from_disk_fails() {
        let dir = catalog_fixture(&["v1.14.5-002"]);

        let err = resolve(Some("v1.14.5-003"), dir.path(), MissingVersionPolicy::Reject)
            .unwrap_err();
        assert!(matches!(err, Error::NoSuchVersion(_)));
    }

    #[test]
    fn path_separators_are_rejected() {
        let dir = catalog_fixture(&["v1.14.5-002"]);

        for bad in ["../v1.14.5-002", "a/b", "v1.14.5-002/.."] {
            let err = resolve(Some(bad), dir.path(), MissingVersionPolicy::Reject).unwrap_err();
            assert!(matches!(err, Error::InvalidVersion(_)), "{bad}");
        }
    }

    #[test]
    fn missing_version_follows_policy() {
        let dir = catalog_fixture(&[]);

        let err = resolve(None, dir.path(), MissingVersionPolicy::Reject).unwrap_err();
        assert!(matches!(err, Error::MissingVersion));

        let resolved = resolve(Some("  "), dir.path(), MissingVersionPolicy::DevSentinel).unwrap();
        assert_eq!(resolved.version, ClusterVersion::Dev);
        assert!(!resolved.pinned);
    }

    #[test]
    fn dev_sentinel_resolves_to_dev() {
        let dir = catalog_fixture(&[]);

        let resolved = resolve(Some("dev"), dir.path(), MissingVersionPolicy::Reject).unwrap();
        assert!(resolved.version.is_dev());
        assert_eq!(resolved.version.kubernetes_version(), None);
    }

    #[test]
    fn release_ordering_prefers_patch_over_revision() {
        let a: ReleaseVersion = "v1.14.5-001".parse().unwrap();
        let b: ReleaseVersion = "v1.14.3-009".parse().unwrap();
        assert!(a > b);
    }
}
