//! The kernel extension bundle model
//!
//! A `Kext` is the in-memory form of one bundle: the metadata an external
//! scanner parsed for it, the admission and load state the manager tracks,
//! and the two links (`prior_version`, `duplicate_version`) that thread it
//! into the version/duplicate tree. Kexts live in an arena owned by their
//! repository; everything else refers to them through `KextHandle`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use kextmgr_core::{Personality, VersionNumber};

/// Non-owning reference to a kext in a repository arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KextHandle {
    pub(crate) repo: usize,
    pub(crate) slot: usize,
}

/// A library dependency declared by a kext
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryRequirement {
    /// Identifier of the library kext
    pub identifier: String,
    /// Version the dependent was built against; any candidate whose
    /// compatibility range covers this version satisfies the requirement
    pub version: VersionNumber,
}

/// Parsed bundle metadata, supplied by the external scanner or a cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KextInfo {
    /// Bundle identifier (non-empty, compared for exact equality)
    pub identifier: String,
    /// Bundle version
    pub version: VersionNumber,
    /// Oldest version this bundle remains compatible with
    #[serde(default)]
    pub compatible_version: Option<VersionNumber>,
    /// Whether the bundle is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether the bundle may load during safe boot
    #[serde(default)]
    pub safe_boot_eligible: bool,
    /// Whether the bundle declares an executable
    #[serde(default)]
    pub has_executable: bool,
    /// Declared library dependencies
    #[serde(default)]
    pub libraries: Vec<LibraryRequirement>,
    /// Driver personalities by name
    #[serde(default)]
    pub personalities: BTreeMap<String, Personality>,
}

fn default_true() -> bool {
    true
}

impl KextInfo {
    /// Minimal metadata for a bundle with no dependencies or personalities
    pub fn new(identifier: impl Into<String>, version: VersionNumber) -> Self {
        Self {
            identifier: identifier.into(),
            version,
            compatible_version: None,
            enabled: true,
            safe_boot_eligible: false,
            has_executable: false,
            libraries: Vec::new(),
            personalities: BTreeMap::new(),
        }
    }
}

/// One kernel extension bundle
#[derive(Debug, Clone)]
pub struct Kext {
    info: KextInfo,
    path: PathBuf,
    valid: bool,
    load_failed: bool,
    authentic: bool,
    dependencies: Option<Vec<KextHandle>>,
    has_all_dependencies: bool,
    is_loaded: bool,
    other_version_is_loaded: bool,
    start_address: u64,
    pub(crate) prior_version: Option<KextHandle>,
    pub(crate) duplicate_version: Option<KextHandle>,
}

impl Kext {
    /// Create a kext from parsed metadata and its on-disk location
    pub fn new(info: KextInfo, path: impl Into<PathBuf>) -> Self {
        Self {
            info,
            path: path.into(),
            valid: true,
            load_failed: false,
            authentic: false,
            dependencies: None,
            has_all_dependencies: false,
            is_loaded: false,
            other_version_is_loaded: false,
            start_address: 0,
            prior_version: None,
            duplicate_version: None,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.info.identifier
    }

    pub fn version(&self) -> VersionNumber {
        self.info.version
    }

    pub fn compatible_version(&self) -> Option<VersionNumber> {
        self.info.compatible_version
    }

    /// Absolute path of the bundle on disk
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Mark the bundle invalid (external validation failed)
    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    pub fn is_enabled(&self) -> bool {
        self.info.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.info.enabled = enabled;
    }

    pub fn is_eligible_during_safe_boot(&self) -> bool {
        self.info.safe_boot_eligible
    }

    pub fn has_executable(&self) -> bool {
        self.info.has_executable
    }

    pub fn declares_load_failed(&self) -> bool {
        self.load_failed
    }

    pub fn set_load_failed(&mut self, failed: bool) {
        self.load_failed = failed;
    }

    pub fn is_authentic(&self) -> bool {
        self.authentic
    }

    pub fn mark_authentic(&mut self) {
        self.authentic = true;
    }

    pub(crate) fn clear_authentic(&mut self) {
        self.authentic = false;
    }

    pub fn libraries(&self) -> &[LibraryRequirement] {
        &self.info.libraries
    }

    /// Resolved direct dependencies, if resolution has run
    pub fn dependencies(&self) -> Option<&[KextHandle]> {
        self.dependencies.as_deref()
    }

    pub(crate) fn set_dependencies(&mut self, deps: Vec<KextHandle>, complete: bool) {
        self.dependencies = Some(deps);
        self.has_all_dependencies = complete;
    }

    pub fn has_all_dependencies(&self) -> bool {
        self.has_all_dependencies
    }

    pub(crate) fn clear_dependency_state(&mut self) {
        self.dependencies = None;
        self.has_all_dependencies = false;
    }

    pub(crate) fn clear_version_relationships(&mut self) {
        self.prior_version = None;
        self.duplicate_version = None;
    }

    pub fn is_loaded(&self) -> bool {
        self.is_loaded
    }

    pub(crate) fn set_loaded(&mut self) {
        self.is_loaded = true;
    }

    pub fn other_version_is_loaded(&self) -> bool {
        self.other_version_is_loaded
    }

    pub(crate) fn set_other_version_loaded(&mut self) {
        self.other_version_is_loaded = true;
    }

    pub(crate) fn clear_loaded_state(&mut self) {
        self.is_loaded = false;
        self.other_version_is_loaded = false;
        self.start_address = 0;
    }

    /// Address the running kernel reported for this module, zero if unknown
    pub fn start_address(&self) -> u64 {
        self.start_address
    }

    pub(crate) fn set_start_address(&mut self, address: u64) {
        self.start_address = address;
    }

    /// Driver personalities by name
    pub fn personalities(&self) -> &BTreeMap<String, Personality> {
        &self.info.personalities
    }

    pub fn has_personalities(&self) -> bool {
        !self.info.personalities.is_empty()
    }

    /// Clone the personality map
    pub fn copy_personalities(&self) -> BTreeMap<String, Personality> {
        self.info.personalities.clone()
    }

    /// Whether this bundle can stand in for the requested version
    ///
    /// True when the bundle declares a compatibility range and the requested
    /// version falls inside it. A bundle without a declared range is never
    /// compatible with anything but itself by exact lookup.
    pub fn is_compatible_with_version(&self, requested: VersionNumber) -> bool {
        match self.info.compatible_version {
            Some(floor) => floor <= requested && requested <= self.info.version,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(s: &str) -> VersionNumber {
        s.parse().unwrap()
    }

    #[test]
    fn test_compatibility_range() {
        let mut info = KextInfo::new("com.ex.lib", version("3.0"));
        info.compatible_version = Some(version("1.5"));
        let kext = Kext::new(info, "/tmp/lib.kext");

        assert!(kext.is_compatible_with_version(version("1.5")));
        assert!(kext.is_compatible_with_version(version("2.0")));
        assert!(kext.is_compatible_with_version(version("3.0")));
        assert!(!kext.is_compatible_with_version(version("1.0")));
        assert!(!kext.is_compatible_with_version(version("3.1")));
    }

    #[test]
    fn test_no_declared_range_is_never_compatible() {
        let kext = Kext::new(KextInfo::new("com.ex.lib", version("3.0")), "/tmp/lib.kext");
        assert!(!kext.is_compatible_with_version(version("3.0")));
    }

    #[test]
    fn test_dependency_state_reset() {
        let mut kext = Kext::new(KextInfo::new("com.ex.a", version("1.0")), "/tmp/a.kext");
        kext.set_dependencies(vec![], true);
        assert!(kext.has_all_dependencies());

        kext.clear_dependency_state();
        assert!(!kext.has_all_dependencies());
        assert!(kext.dependencies().is_none());
    }
}
