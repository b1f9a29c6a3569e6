//! Kext repositories
//!
//! A repository is one on-disk directory of bundles. It owns its kexts in a
//! slot arena (slots stay stable across removals so handles held elsewhere
//! never dangle into a different kext) and tracks two orderings: the
//! candidate list of kexts eligible for indexing, and the bad list of kexts
//! that failed intake or were disqualified.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::kext::Kext;

/// One repository directory and the kexts discovered in it
#[derive(Debug)]
pub struct Repository {
    directory: PathBuf,
    scans_for_kexts: bool,
    kexts: Vec<Option<Kext>>,
    candidates: Vec<usize>,
    bad: Vec<usize>,
}

impl Repository {
    /// Create an empty repository for a directory
    pub fn new(directory: impl Into<PathBuf>, scans_for_kexts: bool) -> Self {
        Self {
            directory: directory.into(),
            scans_for_kexts,
            kexts: Vec::new(),
            candidates: Vec::new(),
            bad: Vec::new(),
        }
    }

    /// The repository directory
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn scans_for_kexts(&self) -> bool {
        self.scans_for_kexts
    }

    pub fn set_scans_for_kexts(&mut self, scans: bool) {
        self.scans_for_kexts = scans;
    }

    /// Add a kext to the candidate list, returning its slot
    pub fn add_kext(&mut self, kext: Kext) -> usize {
        let slot = self.store(kext);
        self.candidates.push(slot);
        slot
    }

    /// Add a kext straight to the bad list, returning its slot
    pub fn add_bad_kext(&mut self, kext: Kext) -> usize {
        let slot = self.store(kext);
        self.bad.push(slot);
        slot
    }

    fn store(&mut self, kext: Kext) -> usize {
        self.kexts.push(Some(kext));
        self.kexts.len() - 1
    }

    /// Remove a kext entirely
    pub fn remove_kext(&mut self, slot: usize) -> Option<Kext> {
        self.candidates.retain(|s| *s != slot);
        self.bad.retain(|s| *s != slot);
        self.kexts.get_mut(slot).and_then(Option::take)
    }

    /// Move a kext out of candidacy into the bad list
    pub fn disqualify(&mut self, slot: usize) {
        if let Some(pos) = self.candidates.iter().position(|s| *s == slot) {
            self.candidates.remove(pos);
            self.bad.push(slot);
            if let Some(kext) = self.kext(slot) {
                debug!(identifier = kext.identifier(), "disqualified extension");
            }
        }
    }

    /// Move a kext from the bad list back into candidacy
    pub fn requalify(&mut self, slot: usize) {
        if let Some(pos) = self.bad.iter().position(|s| *s == slot) {
            self.bad.remove(pos);
            self.candidates.push(slot);
            if let Some(kext) = self.kext(slot) {
                debug!(identifier = kext.identifier(), "requalified extension");
            }
        }
    }

    /// Candidate slots in discovery order
    pub fn candidate_slots(&self) -> &[usize] {
        &self.candidates
    }

    /// Bad-kext slots in discovery order
    pub fn bad_slots(&self) -> &[usize] {
        &self.bad
    }

    pub fn kext(&self, slot: usize) -> Option<&Kext> {
        self.kexts.get(slot).and_then(Option::as_ref)
    }

    pub fn kext_mut(&mut self, slot: usize) -> Option<&mut Kext> {
        self.kexts.get_mut(slot).and_then(Option::as_mut)
    }

    /// Find a kext (candidate or bad) by its absolute bundle path
    pub fn kext_slot_with_path(&self, path: &Path) -> Option<usize> {
        self.candidates
            .iter()
            .chain(self.bad.iter())
            .copied()
            .find(|slot| self.kext(*slot).map(|k| k.path() == path).unwrap_or(false))
    }

    fn each_kext_mut(&mut self, mut f: impl FnMut(&mut Kext)) {
        for entry in self.kexts.iter_mut().flatten() {
            f(entry);
        }
    }

    /// Drop all version/duplicate links
    pub(crate) fn clear_relationships(&mut self) {
        self.each_kext_mut(Kext::clear_version_relationships);
    }

    /// Drop all resolved dependency state
    pub(crate) fn clear_dependency_state(&mut self) {
        self.each_kext_mut(Kext::clear_dependency_state);
    }

    /// Forget which kexts the running kernel has loaded
    pub(crate) fn mark_kexts_not_loaded(&mut self) {
        self.each_kext_mut(Kext::clear_loaded_state);
    }

    /// Lift the load-failed quarantine from every kext
    pub fn clear_load_failures(&mut self) {
        self.each_kext_mut(|k| k.set_load_failed(false));
    }

    /// Mark every kext authentic without checking
    pub fn mark_kexts_authentic(&mut self) {
        self.each_kext_mut(Kext::mark_authentic);
    }

    /// Drop all derived state, forcing re-resolution and re-authentication
    pub fn reset(&mut self) {
        self.each_kext_mut(|k| {
            k.clear_version_relationships();
            k.clear_dependency_state();
            k.clear_loaded_state();
            k.clear_authentic();
        });
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn bad_count(&self) -> usize {
        self.bad.len()
    }
}
