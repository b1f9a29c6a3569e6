//! Relationship invalidation
//!
//! Producers that mutate the candidate set call `clear_relationships`.
//! While a disable window is open the clear is deferred and coalesced; the
//! read paths repair before observing anything, so stale state is never
//! visible. Every `disable_clear` must be paired with an `enable_clear` on
//! all exit paths of the region that depends on stable relationships.

use tracing::debug;

use super::KextManager;

impl KextManager {
    /// Open a window during which relationship clears are deferred
    pub fn disable_clear(&mut self) {
        self.disable_count += 1;
    }

    /// Close a deferral window; the last close performs any pending clear
    pub fn enable_clear(&mut self) {
        if self.disable_count > 0 {
            self.disable_count -= 1;
        }
        if self.disable_count == 0 && self.needs_clear {
            self.clear_relationships();
        }
    }

    /// Invalidate the candidate index and dependency diagnostics
    ///
    /// Deferred (and coalesced) while a disable window is open.
    pub fn clear_relationships(&mut self) {
        if self.disable_count > 0 {
            debug!("request to clear relationships while disabled; pending");
            self.needs_clear = true;
            self.needs_recalc = true;
            return;
        }

        debug!("clearing all version/dependency relationships among kernel extensions");
        self.clear_relationships_now();
    }

    /// Unconditionally empty the index and per-kext relationship state
    pub(crate) fn clear_relationships_now(&mut self) {
        for index in self.repository_indices() {
            if let Some(repo) = self.repository_mut(index) {
                repo.clear_relationships();
                repo.clear_dependency_state();
            }
        }
        self.candidate_index.clear();
        self.missing_deps.clear();
        self.needs_clear = false;
        self.needs_recalc = true;
    }

    /// Drop resolved dependency state everywhere, keeping the version tree
    pub(crate) fn clear_dependency_relationships(&mut self) {
        for index in self.repository_indices() {
            if let Some(repo) = self.repository_mut(index) {
                repo.clear_dependency_state();
            }
        }
        self.missing_deps.clear();
    }

    /// Read-repair: honor a pending clear, then a pending rebuild
    ///
    /// Every read path that needs a consistent index calls this first.
    pub(crate) fn ensure_relationships(&mut self) {
        if self.needs_clear {
            self.clear_relationships_now();
            self.clear_dependency_relationships();
        }
        if self.needs_recalc {
            self.calculate_version_relationships();
        }
    }
}
