//! The running kernel's loaded-module set
//!
//! Enumerating loaded modules is a syscall behind a trait so the manager
//! can be driven against a fake kernel in tests. The kernel may report more
//! records than it actually filled in; the `has_next` sentinel on each
//! record terminates iteration early in that case.

use tracing::{debug, error, trace};

use kextmgr_core::{Result, VersionNumber};

use crate::kext::KextHandle;
use crate::manager::KextManager;

/// One loaded module as the kernel reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    /// Module name (the bundle identifier)
    pub name: String,
    /// Version string as loaded; may fail to parse
    pub version: String,
    /// Load address of the module
    pub address: u64,
    /// Whether another valid record follows this one
    pub has_next: bool,
}

/// Access to the running kernel's module list
pub trait LoadedKernel {
    /// Enumerate currently loaded modules
    fn loaded_modules(&self) -> Result<Vec<LoadedModule>>;
}

impl KextManager {
    /// Refresh the loaded/other-version-loaded marks from the kernel
    ///
    /// Every kext sharing an identifier with a loaded module is marked:
    /// nodes at the loaded version as loaded, all other versions as having
    /// another version loaded. Modules whose version does not parse are
    /// skipped with an error log.
    pub fn check_for_loaded_kexts(&mut self, kernel: &dyn LoadedKernel) -> Result<()> {
        debug!("checking kernel for loaded extensions");

        for index in self.repository_indices() {
            if let Some(repo) = self.repository_mut(index) {
                repo.mark_kexts_not_loaded();
            }
        }

        let modules = kernel.loaded_modules()?;

        self.ensure_relationships();

        for module in modules {
            trace!(name = module.name, version = module.version, "found loaded module");

            let loaded_version = match module.version.parse::<VersionNumber>() {
                Ok(version) => version,
                Err(_) => {
                    error!(
                        version = module.version,
                        module = module.name,
                        "can't parse version of loaded module; skipping"
                    );
                    if !module.has_next {
                        break;
                    }
                    continue;
                }
            };

            let head = self.candidate_index.get(&module.name).copied();
            let mut spine = head;
            while let Some(node) = spine {
                let mut chain: Vec<KextHandle> = vec![node];
                chain.extend(self.duplicates(node));
                for handle in chain {
                    if let Some(kext) = self.kext_mut(handle) {
                        kext.set_start_address(module.address);
                        if kext.version() == loaded_version {
                            kext.set_loaded();
                        } else {
                            kext.set_other_version_loaded();
                        }
                    }
                }
                spine = self.kext(node).and_then(|k| k.prior_version);
            }

            // the kernel can report more records than it filled in
            if !module.has_next {
                break;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kext::{Kext, KextInfo};
    use std::path::Path;

    /// Fixed module list standing in for the kernel
    pub struct FakeKernel(pub Vec<LoadedModule>);

    impl LoadedKernel for FakeKernel {
        fn loaded_modules(&self) -> Result<Vec<LoadedModule>> {
            Ok(self.0.clone())
        }
    }

    fn version(s: &str) -> VersionNumber {
        s.parse().unwrap()
    }

    fn module(name: &str, vers: &str, has_next: bool) -> LoadedModule {
        LoadedModule {
            name: name.to_string(),
            version: vers.to_string(),
            address: 0xffff_0000,
            has_next,
        }
    }

    fn setup() -> (KextManager, usize) {
        let mut manager = KextManager::new();
        let repo = manager.add_repository(Path::new("/repo"), true).unwrap();
        (manager, repo)
    }

    fn add(manager: &mut KextManager, repo: usize, id: &str, vers: &str, path: &str) -> KextHandle {
        manager
            .add_kext_to_repository(repo, Kext::new(KextInfo::new(id, version(vers)), path))
            .unwrap()
    }

    #[test]
    fn test_loaded_marks_split_by_version() {
        let (mut manager, repo) = setup();
        let v2 = add(&mut manager, repo, "com.ex.a", "2.0", "/repo/a2.kext");
        let v1 = add(&mut manager, repo, "com.ex.a", "1.0", "/repo/a1.kext");

        let kernel = FakeKernel(vec![module("com.ex.a", "1.0", false)]);
        manager.check_for_loaded_kexts(&kernel).unwrap();

        assert!(manager.kext(v1).unwrap().is_loaded());
        assert!(!manager.kext(v1).unwrap().other_version_is_loaded());
        assert!(manager.kext(v2).unwrap().other_version_is_loaded());
        assert!(!manager.kext(v2).unwrap().is_loaded());
        assert_eq!(manager.kext(v1).unwrap().start_address(), 0xffff_0000);
    }

    #[test]
    fn test_sentinel_stops_iteration_early() {
        let (mut manager, repo) = setup();
        let a = add(&mut manager, repo, "com.ex.a", "1.0", "/repo/a.kext");
        let b = add(&mut manager, repo, "com.ex.b", "1.0", "/repo/b.kext");

        let kernel = FakeKernel(vec![
            module("com.ex.a", "1.0", false),
            module("com.ex.b", "1.0", false),
        ]);
        manager.check_for_loaded_kexts(&kernel).unwrap();

        assert!(manager.kext(a).unwrap().is_loaded());
        assert!(!manager.kext(b).unwrap().is_loaded(), "record past sentinel");
    }

    #[test]
    fn test_unparseable_version_is_skipped() {
        let (mut manager, repo) = setup();
        let a = add(&mut manager, repo, "com.ex.a", "1.0", "/repo/a.kext");

        let kernel = FakeKernel(vec![
            module("com.ex.a", "not-a-version", true),
            module("com.ex.a", "1.0", false),
        ]);
        manager.check_for_loaded_kexts(&kernel).unwrap();

        assert!(manager.kext(a).unwrap().is_loaded());
    }

    #[test]
    fn test_refresh_clears_previous_marks() {
        let (mut manager, repo) = setup();
        let a = add(&mut manager, repo, "com.ex.a", "1.0", "/repo/a.kext");

        let kernel = FakeKernel(vec![module("com.ex.a", "1.0", false)]);
        manager.check_for_loaded_kexts(&kernel).unwrap();
        assert!(manager.kext(a).unwrap().is_loaded());

        let empty = FakeKernel(Vec::new());
        manager.check_for_loaded_kexts(&empty).unwrap();
        assert!(!manager.kext(a).unwrap().is_loaded());
        assert_eq!(manager.kext(a).unwrap().start_address(), 0);
    }
}
