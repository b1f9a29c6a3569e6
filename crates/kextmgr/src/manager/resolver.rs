//! Dependency resolution and pruning
//!
//! Phase one resolves the declared libraries of every node in the index
//! (every spine node and every duplicate). Phase two prunes nodes whose
//! dependencies could not be resolved, re-stitching both the spine and the
//! duplicate chains in place; the dictionary entry is rewritten whenever a
//! head falls. A duplicate promoted into a pruned head's slot is itself
//! re-examined in the same pass, so nothing unresolvable survives.

use std::collections::HashSet;

use tracing::{debug, trace, warn};

use super::KextManager;
use crate::kext::KextHandle;
use kextmgr_core::{Error, Result};

impl KextManager {
    /// Resolve dependencies for every kext in the candidate index, then
    /// prune the nodes that came up short
    ///
    /// Pruned kexts are recorded in the missing-dependency diagnostics,
    /// each exactly once. With full tests enabled, bad kexts get a
    /// diagnostic resolution pass as well; they are never admitted.
    pub fn resolve_all_kext_dependencies(&mut self) {
        debug!("resolving dependencies for all kernel extensions");

        let identifiers: Vec<String> = self.candidate_index.keys().cloned().collect();

        for identifier in &identifiers {
            let mut spine = self.candidate_index.get(identifier).copied();
            while let Some(node) = spine {
                let _ = self.resolve_kext_dependencies(node);
                let mut dup = self.kext(node).and_then(|k| k.duplicate_version);
                while let Some(d) = dup {
                    let _ = self.resolve_kext_dependencies(d);
                    dup = self.kext(d).and_then(|k| k.duplicate_version);
                }
                spine = self.kext(node).and_then(|k| k.prior_version);
            }
        }

        for identifier in &identifiers {
            self.prune_identifier(identifier);
        }

        if self.performs_full_tests() {
            debug!(
                "resolving dependencies for kernel extensions with validation \
                 and authentication failures"
            );
            for repo_index in self.repository_indices() {
                let bad: Vec<usize> = match self.repository(repo_index) {
                    Some(repo) => repo.bad_slots().to_vec(),
                    None => continue,
                };
                for slot in bad {
                    let handle = KextHandle {
                        repo: repo_index,
                        slot,
                    };
                    let _ = self.resolve_kext_dependencies(handle);
                }
            }
        }
    }

    /// Resolve one kext's declared libraries against the candidate index
    ///
    /// Resolution is transitive: the kext only counts as having all of its
    /// dependencies when each library resolves and the resolved library is
    /// itself complete. Results are cached on the kext until dependency
    /// state is cleared.
    pub fn resolve_kext_dependencies(&mut self, handle: KextHandle) -> Result<()> {
        let mut visiting = HashSet::new();
        self.resolve_recursive(handle, &mut visiting)
    }

    fn resolve_recursive(
        &mut self,
        handle: KextHandle,
        visiting: &mut HashSet<KextHandle>,
    ) -> Result<()> {
        let Some(kext) = self.kext(handle) else {
            return Err(Error::kext_not_found(""));
        };
        let identifier = kext.identifier().to_string();

        if kext.dependencies().is_some() {
            return if kext.has_all_dependencies() {
                Ok(())
            } else {
                Err(Error::dependency(identifier))
            };
        }

        if !visiting.insert(handle) {
            return Err(Error::dependency_loop(identifier));
        }

        let libraries = kext.libraries().to_vec();
        let mut resolved = Vec::with_capacity(libraries.len());
        let mut result = Ok(());

        for library in libraries {
            match self.find_compatible_in_index(&library.identifier, library.version) {
                Some(dependency) => {
                    if let Err(err) = self.resolve_recursive(dependency, visiting) {
                        trace!(
                            identifier,
                            library = library.identifier,
                            "library found but incomplete"
                        );
                        if result.is_ok() {
                            result = match err {
                                Error::DependencyLoop { .. } => Err(err),
                                _ => Err(Error::dependency(identifier.clone())),
                            };
                        }
                    }
                    resolved.push(dependency);
                }
                None => {
                    trace!(
                        identifier,
                        library = library.identifier,
                        version = %library.version,
                        "no compatible candidate for library"
                    );
                    if result.is_ok() {
                        result = Err(Error::dependency(identifier.clone()));
                    }
                }
            }
        }

        visiting.remove(&handle);
        let complete = result.is_ok();
        if let Some(kext) = self.kext_mut(handle) {
            kext.set_dependencies(resolved, complete);
        }
        result
    }

    /// The dependency closure of a kext, dependencies before dependents,
    /// ending with the kext itself
    pub fn copy_all_dependencies(&self, handle: KextHandle) -> Result<Vec<KextHandle>> {
        let mut closure = Vec::new();
        let mut seen = HashSet::new();
        let mut visiting = HashSet::new();
        self.closure_visit(handle, &mut closure, &mut seen, &mut visiting)?;
        Ok(closure)
    }

    fn closure_visit(
        &self,
        handle: KextHandle,
        closure: &mut Vec<KextHandle>,
        seen: &mut HashSet<KextHandle>,
        visiting: &mut HashSet<KextHandle>,
    ) -> Result<()> {
        if seen.contains(&handle) {
            return Ok(());
        }
        let Some(kext) = self.kext(handle) else {
            return Err(Error::kext_not_found(""));
        };
        let identifier = kext.identifier().to_string();
        if !visiting.insert(handle) {
            return Err(Error::dependency_loop(identifier));
        }
        let Some(dependencies) = kext.dependencies() else {
            return Err(Error::dependency(identifier));
        };
        for dependency in dependencies.to_vec() {
            self.closure_visit(dependency, closure, seen, visiting)?;
        }
        visiting.remove(&handle);
        seen.insert(handle);
        closure.push(handle);
        Ok(())
    }

    /// Find a candidate compatible with the requested version
    ///
    /// Walks the spine preferring a loaded compatible node; among unloaded
    /// nodes the latest compatible one wins. No read-repair: resolution
    /// runs against the index as it stands.
    pub(crate) fn find_compatible_in_index(
        &self,
        identifier: &str,
        requested: kextmgr_core::VersionNumber,
    ) -> Option<KextHandle> {
        let mut scan = self.candidate_index.get(identifier).copied();
        let mut found = None;
        while let Some(node) = scan {
            let kext = self.kext(node)?;
            if kext.is_compatible_with_version(requested) {
                if kext.is_loaded() {
                    return Some(node);
                }
                if found.is_none() {
                    found = Some(node);
                }
            }
            scan = kext.prior_version;
        }
        found
    }

    /// Prune every node of one identifier's tree that lacks dependencies
    fn prune_identifier(&mut self, identifier: &str) {
        let Some(&head) = self.candidate_index.get(identifier) else {
            return;
        };

        let mut prev: Option<KextHandle> = None;
        let mut cur = Some(head);

        while let Some(node) = cur {
            let next = self.kext(node).and_then(|k| k.prior_version);
            let dup = self.kext(node).and_then(|k| k.duplicate_version);
            let complete = self
                .kext(node)
                .map(|k| k.has_all_dependencies())
                .unwrap_or(false);

            if !complete {
                warn!(
                    path = %self.kext_display(node),
                    "extension is missing dependencies"
                );
                self.missing_deps.push(node);

                match dup {
                    None => {
                        // plain unlink: bridge prev to next, or move the
                        // dictionary entry
                        if let Some(prev) = prev {
                            if let Some(kext) = self.kext_mut(prev) {
                                kext.prior_version = next;
                            }
                        } else if let Some(next) = next {
                            self.candidate_index.insert(identifier.to_string(), next);
                        } else {
                            self.candidate_index.remove(identifier);
                        }
                        cur = next;
                    }
                    Some(promoted) => {
                        // promote the first duplicate into this spine slot
                        // and re-examine it before moving on
                        if let Some(prev) = prev {
                            if let Some(kext) = self.kext_mut(prev) {
                                kext.prior_version = Some(promoted);
                            }
                        } else {
                            self.candidate_index
                                .insert(identifier.to_string(), promoted);
                        }
                        if let Some(kext) = self.kext_mut(promoted) {
                            kext.prior_version = next;
                        }
                        cur = Some(promoted);
                    }
                }
            } else {
                // the spine node survives; sweep its duplicate list
                let mut dup_prev = node;
                let mut dup_cur = dup;
                while let Some(d) = dup_cur {
                    let dup_next = self.kext(d).and_then(|k| k.duplicate_version);
                    let dup_complete = self
                        .kext(d)
                        .map(|k| k.has_all_dependencies())
                        .unwrap_or(false);
                    if !dup_complete {
                        warn!(
                            path = %self.kext_display(d),
                            "extension is missing dependencies"
                        );
                        self.missing_deps.push(d);
                        if let Some(kext) = self.kext_mut(dup_prev) {
                            kext.duplicate_version = dup_next;
                        }
                    } else {
                        dup_prev = d;
                    }
                    dup_cur = dup_next;
                }

                prev = Some(node);
                cur = next;
            }
        }
    }
}
