//! Candidate lookups
//!
//! Every query that reads the candidate index repairs it first: a pending
//! clear is honored, then a pending rebuild. Callers therefore never see
//! stale relationships, no matter how many mutations were coalesced.

use tracing::warn;

use super::KextManager;
use crate::kernel::LoadedKernel;
use crate::kext::KextHandle;
use kextmgr_core::VersionNumber;

impl KextManager {
    /// Head of an identifier's tree: the greatest known version
    pub fn get_kext_with_identifier(&mut self, identifier: &str) -> Option<KextHandle> {
        self.ensure_relationships();
        self.candidate_index.get(identifier).copied()
    }

    /// The spine node carrying exactly the requested version
    pub fn get_kext_with_identifier_and_version(
        &mut self,
        identifier: &str,
        version: VersionNumber,
    ) -> Option<KextHandle> {
        self.ensure_relationships();
        let mut scan = self.candidate_index.get(identifier).copied();
        while let Some(node) = scan {
            let kext = self.kext(node)?;
            if kext.version() == version {
                return Some(node);
            }
            scan = kext.prior_version;
        }
        None
    }

    /// A candidate able to stand in for the requested version
    ///
    /// A loaded compatible version wins over a newer unloaded one; among
    /// unloaded candidates the latest compatible version is returned.
    pub fn get_kext_compatible_with_version(
        &mut self,
        identifier: &str,
        version: VersionNumber,
    ) -> Option<KextHandle> {
        self.ensure_relationships();
        self.find_compatible_in_index(identifier, version)
    }

    /// The loaded version of an identifier if one is running, else the head
    ///
    /// The loaded set is refreshed first; failure to reach the kernel is
    /// not fatal, the latest known version is returned instead.
    pub fn get_loaded_or_latest_kext_with_identifier(
        &mut self,
        identifier: &str,
        kernel: &dyn LoadedKernel,
    ) -> Option<KextHandle> {
        self.ensure_relationships();
        if let Err(err) = self.check_for_loaded_kexts(kernel) {
            warn!(%err, "can't check which kernel extensions are currently loaded");
        }

        let head = self.candidate_index.get(identifier).copied()?;
        let mut scan = Some(head);
        while let Some(node) = scan {
            let kext = self.kext(node)?;
            if kext.is_loaded() {
                return Some(node);
            }
            scan = kext.prior_version;
        }
        Some(head)
    }

    /// Every bundle known for an identifier: the spine head to tail, each
    /// node's duplicates before the spine advances
    pub fn copy_kexts_with_identifier(&mut self, identifier: &str) -> Vec<KextHandle> {
        self.ensure_relationships();
        let mut out = Vec::new();
        let mut spine = self.candidate_index.get(identifier).copied();
        while let Some(node) = spine {
            out.push(node);
            out.extend(self.duplicates(node));
            spine = self.kext(node).and_then(|k| k.prior_version);
        }
        out
    }

    /// Every kext the manager knows about: the flattened index plus every
    /// repository's bad kexts
    pub fn copy_all_kexts(&mut self) -> Vec<KextHandle> {
        self.ensure_relationships();
        let mut out = Vec::new();
        let identifiers: Vec<String> = self.candidate_index.keys().cloned().collect();
        for identifier in identifiers {
            let mut spine = self.candidate_index.get(&identifier).copied();
            while let Some(node) = spine {
                out.push(node);
                out.extend(self.duplicates(node));
                spine = self.kext(node).and_then(|k| k.prior_version);
            }
        }
        for repo_index in self.repository_indices() {
            if let Some(repo) = self.repository(repo_index) {
                out.extend(repo.bad_slots().iter().map(|&slot| KextHandle {
                    repo: repo_index,
                    slot,
                }));
            }
        }
        out
    }

    /// Kext found by its absolute bundle path (candidates and bad kexts)
    pub fn get_kext_with_path(&self, path: &std::path::Path) -> Option<KextHandle> {
        self.kext_handle_with_path(path)
    }

    /// Kexts pruned for unresolvable dependencies, in prune order
    pub fn kexts_with_missing_dependencies(&self) -> &[KextHandle] {
        &self.missing_deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kext::{Kext, KextInfo};
    use std::path::Path;

    fn version(s: &str) -> VersionNumber {
        s.parse().unwrap()
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
    fn test_get_returns_greatest_version() {
        let (mut manager, repo) = setup();
        add(&mut manager, repo, "com.ex.a", "1.0", "/repo/a1.kext");
        let v2 = add(&mut manager, repo, "com.ex.a", "2.0", "/repo/a2.kext");

        assert_eq!(manager.get_kext_with_identifier("com.ex.a"), Some(v2));
        assert_eq!(manager.get_kext_with_identifier("com.ex.zzz"), None);
    }

    #[test]
    fn test_get_exact_version() {
        let (mut manager, repo) = setup();
        let v1 = add(&mut manager, repo, "com.ex.a", "1.0", "/repo/a1.kext");
        add(&mut manager, repo, "com.ex.a", "2.0", "/repo/a2.kext");

        assert_eq!(
            manager.get_kext_with_identifier_and_version("com.ex.a", version("1.0")),
            Some(v1)
        );
        assert_eq!(
            manager.get_kext_with_identifier_and_version("com.ex.a", version("3.0")),
            None
        );
    }

    #[test]
    fn test_compatible_prefers_latest_unloaded() {
        let (mut manager, repo) = setup();
        let mut old = KextInfo::new("com.ex.a", version("2.0"));
        old.compatible_version = Some(version("1.0"));
        let mut new = KextInfo::new("com.ex.a", version("3.0"));
        new.compatible_version = Some(version("1.0"));
        manager
            .add_kext_to_repository(repo, Kext::new(old, "/repo/a2.kext"))
            .unwrap();
        let newer = manager
            .add_kext_to_repository(repo, Kext::new(new, "/repo/a3.kext"))
            .unwrap();

        assert_eq!(
            manager.get_kext_compatible_with_version("com.ex.a", version("1.5")),
            Some(newer)
        );
    }

    #[test]
    fn test_query_performs_read_repair() {
        let (mut manager, repo) = setup();
        add(&mut manager, repo, "com.ex.a", "1.0", "/repo/a.kext");
        assert!(manager.get_kext_with_identifier("com.ex.a").is_some());

        // a mutation invalidates; the next read rebuilds on its own
        let b = add(&mut manager, repo, "com.ex.b", "1.0", "/repo/b.kext");
        assert!(manager.needs_recalc || manager.needs_clear);
        assert_eq!(manager.get_kext_with_identifier("com.ex.b"), Some(b));
    }

    #[test]
    fn test_copy_kexts_with_identifier_flattens_duplicates() {
        let (mut manager, repo) = setup();
        let head = add(&mut manager, repo, "com.ex.a", "2.0", "/repo/a2.kext");
        let dup = add(&mut manager, repo, "com.ex.a", "2.0", "/repo/a2b.kext");
        let old = add(&mut manager, repo, "com.ex.a", "1.0", "/repo/a1.kext");

        assert_eq!(
            manager.copy_kexts_with_identifier("com.ex.a"),
            vec![head, dup, old]
        );
    }

    #[test]
    fn test_copy_all_kexts_includes_bad_kexts() {
        let (mut manager, repo) = setup();
        add(&mut manager, repo, "com.ex.a", "1.0", "/repo/a.kext");
        let bad = manager
            .add_bad_kext_to_repository(
                repo,
                Kext::new(KextInfo::new("com.ex.bad", version("1.0")), "/repo/bad.kext"),
            )
            .unwrap();

        let all = manager.copy_all_kexts();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&bad));
    }
}
