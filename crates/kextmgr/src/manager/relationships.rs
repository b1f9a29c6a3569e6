//! Version relationship building
//!
//! Rebuilds the candidate index from every repository's candidate list.
//! Each identifier maps to the head of a two-dimensional tree: a spine of
//! strictly decreasing versions, where each spine node heads a list of
//! duplicates sharing its version. The head is always the greatest known
//! version; the dictionary entry is the single point of truth for the tree.

use tracing::{debug, trace};

use super::{admission, KextManager};
use crate::kext::KextHandle;
use kextmgr_core::VersionNumber;

impl KextManager {
    /// Rebuild the candidate index from scratch
    ///
    /// Clears all relationship and dependency state, then walks every
    /// repository in insertion order and every candidate in discovery
    /// order, inserting each admissible kext. Ties on version resolve by
    /// discovery order: the first bundle seen at a version becomes the
    /// spine node, later ones attach as duplicates.
    pub fn calculate_version_relationships(&mut self) {
        debug!("calculating version relationships");

        self.clear_relationships_now();
        self.clear_dependency_relationships();

        for repo_index in self.repository_indices() {
            let slots: Vec<usize> = match self.repository(repo_index) {
                Some(repo) => repo.candidate_slots().to_vec(),
                None => continue,
            };
            for slot in slots {
                let handle = KextHandle {
                    repo: repo_index,
                    slot,
                };
                let Some(kext) = self.kext(handle) else {
                    continue;
                };
                if let Some(reason) = admission::denial(kext, self.safe_boot_mode()) {
                    trace!(
                        path = %kext.path().display(),
                        ?reason,
                        "skipping extension not eligible for indexing"
                    );
                    continue;
                }
                self.index_insert(handle);
            }
        }

        self.needs_recalc = false;
    }

    /// Insert one admitted kext into its identifier's tree
    ///
    /// Re-inserting a kext already present is a no-op.
    pub(crate) fn index_insert(&mut self, handle: KextHandle) {
        let Some(kext) = self.kext(handle) else {
            return;
        };
        let identifier = kext.identifier().to_string();
        let version = kext.version();

        let Some(&head) = self.candidate_index.get(&identifier) else {
            self.candidate_index.insert(identifier, handle);
            return;
        };

        if self.tree_contains(head, handle) {
            return;
        }

        let Some(head_version) = self.version_of(head) else {
            return;
        };

        if version > head_version {
            if let Some(kext) = self.kext_mut(handle) {
                kext.prior_version = Some(head);
            }
            self.candidate_index.insert(identifier, handle);
            return;
        }

        if version == head_version {
            self.append_duplicate(head, handle);
            return;
        }

        // version < head_version: descend the spine to the splice point
        let mut cur = head;
        loop {
            let next = self.kext(cur).and_then(|k| k.prior_version);
            match next {
                None => {
                    if let Some(kext) = self.kext_mut(cur) {
                        kext.prior_version = Some(handle);
                    }
                    return;
                }
                Some(next) => {
                    let Some(next_version) = self.version_of(next) else {
                        return;
                    };
                    if next_version > version {
                        cur = next;
                    } else if next_version == version {
                        self.append_duplicate(next, handle);
                        return;
                    } else {
                        if let Some(kext) = self.kext_mut(handle) {
                            kext.prior_version = Some(next);
                        }
                        if let Some(kext) = self.kext_mut(cur) {
                            kext.prior_version = Some(handle);
                        }
                        return;
                    }
                }
            }
        }
    }

    fn append_duplicate(&mut self, spine_node: KextHandle, handle: KextHandle) {
        let mut tail = spine_node;
        while let Some(next) = self.kext(tail).and_then(|k| k.duplicate_version) {
            if next == handle {
                return;
            }
            tail = next;
        }
        if let Some(kext) = self.kext_mut(tail) {
            kext.duplicate_version = Some(handle);
        }
    }

    fn tree_contains(&self, head: KextHandle, handle: KextHandle) -> bool {
        let mut spine = Some(head);
        while let Some(node) = spine {
            if node == handle {
                return true;
            }
            let mut dup = self.kext(node).and_then(|k| k.duplicate_version);
            while let Some(d) = dup {
                if d == handle {
                    return true;
                }
                dup = self.kext(d).and_then(|k| k.duplicate_version);
            }
            spine = self.kext(node).and_then(|k| k.prior_version);
        }
        false
    }

    pub(crate) fn version_of(&self, handle: KextHandle) -> Option<VersionNumber> {
        self.kext(handle).map(|k| k.version())
    }

    /// Spine handles for an identifier, head to tail (no read-repair)
    pub(crate) fn spine(&self, identifier: &str) -> Vec<KextHandle> {
        let mut out = Vec::new();
        let mut cur = self.candidate_index.get(identifier).copied();
        while let Some(node) = cur {
            out.push(node);
            cur = self.kext(node).and_then(|k| k.prior_version);
        }
        out
    }

    /// Duplicate handles attached to a spine node, in list order
    pub(crate) fn duplicates(&self, spine_node: KextHandle) -> Vec<KextHandle> {
        let mut out = Vec::new();
        let mut cur = self.kext(spine_node).and_then(|k| k.duplicate_version);
        while let Some(node) = cur {
            out.push(node);
            cur = self.kext(node).and_then(|k| k.duplicate_version);
        }
        out
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

    fn spine_versions(manager: &KextManager, id: &str) -> Vec<String> {
        manager
            .spine(id)
            .iter()
            .filter_map(|h| manager.version_of(*h))
            .map(|v| v.to_string())
            .collect()
    }

    #[test]
    fn test_spine_strictly_decreasing_regardless_of_insert_order() {
        let (mut manager, repo) = setup();
        for (vers, path) in [
            ("2.0", "/repo/a2.kext"),
            ("4.0", "/repo/a4.kext"),
            ("1.0", "/repo/a1.kext"),
            ("3.0", "/repo/a3.kext"),
        ] {
            add(&mut manager, repo, "com.ex.a", vers, path);
        }
        manager.calculate_version_relationships();

        assert_eq!(
            spine_versions(&manager, "com.ex.a"),
            vec!["4.0", "3.0", "2.0", "1.0"]
        );
    }

    #[test]
    fn test_equal_versions_become_duplicates() {
        let (mut manager, repo) = setup();
        let first = add(&mut manager, repo, "com.ex.a", "1.0", "/repo/first.kext");
        let second = add(&mut manager, repo, "com.ex.a", "1.0", "/repo/second.kext");
        let third = add(&mut manager, repo, "com.ex.a", "1.0", "/repo/third.kext");
        manager.calculate_version_relationships();

        let spine = manager.spine("com.ex.a");
        assert_eq!(spine, vec![first]);
        assert_eq!(manager.duplicates(first), vec![second, third]);
    }

    #[test]
    fn test_duplicate_below_head() {
        let (mut manager, repo) = setup();
        add(&mut manager, repo, "com.ex.a", "2.0", "/repo/a2.kext");
        let low = add(&mut manager, repo, "com.ex.a", "1.0", "/repo/a1.kext");
        let low_dup = add(&mut manager, repo, "com.ex.a", "1.0", "/repo/a1b.kext");
        manager.calculate_version_relationships();

        assert_eq!(spine_versions(&manager, "com.ex.a"), vec!["2.0", "1.0"]);
        assert_eq!(manager.duplicates(low), vec![low_dup]);
    }

    #[test]
    fn test_reinsert_same_kext_is_noop() {
        let (mut manager, repo) = setup();
        let head = add(&mut manager, repo, "com.ex.a", "2.0", "/repo/a2.kext");
        let tail = add(&mut manager, repo, "com.ex.a", "1.0", "/repo/a1.kext");
        manager.calculate_version_relationships();

        for handle in [head, tail] {
            manager.index_insert(handle);
        }

        assert_eq!(spine_versions(&manager, "com.ex.a"), vec!["2.0", "1.0"]);
        assert!(manager.duplicates(head).is_empty());
        assert!(manager.duplicates(tail).is_empty());
    }

    #[test]
    fn test_discovery_order_across_repositories() {
        let mut manager = KextManager::new();
        let r1 = manager.add_repository(Path::new("/r1"), true).unwrap();
        let r2 = manager.add_repository(Path::new("/r2"), true).unwrap();
        let from_r1 = add(&mut manager, r1, "com.ex.b", "1.0", "/r1/b.kext");
        let from_r2 = add(&mut manager, r2, "com.ex.b", "1.0", "/r2/b.kext");
        manager.calculate_version_relationships();

        assert_eq!(manager.spine("com.ex.b"), vec![from_r1]);
        assert_eq!(manager.duplicates(from_r1), vec![from_r2]);
    }

    #[test]
    fn test_inadmissible_kexts_are_not_indexed() {
        let (mut manager, repo) = setup();
        let handle = add(&mut manager, repo, "com.ex.a", "1.0", "/repo/a.kext");
        if let Some(kext) = manager.kext_mut(handle) {
            kext.set_enabled(false);
        }
        manager.calculate_version_relationships();

        assert!(manager.spine("com.ex.a").is_empty());
    }
}
