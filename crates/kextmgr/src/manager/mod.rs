//! The kext manager
//!
//! Owns the repositories, the candidate index (the version/duplicate tree
//! per identifier), the missing-dependency diagnostics, and the
//! invalidation state that keeps all of it consistent. Everything here is
//! single-threaded: operations run to completion on the caller's thread.

mod admission;
mod invalidation;
mod queries;
mod relationships;
mod resolver;

pub use admission::{is_admissible, AdmissionDenial};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use kextmgr_core::{Error, Result};

use crate::auth::{Authenticator, TrustingAuthenticator};
use crate::kext::{Kext, KextHandle, KextInfo};
use crate::prompt::{NullPrompt, UserPrompt};
use crate::repository::Repository;

/// The kernel extension manager
pub struct KextManager {
    // repository arena: slots are stable so handles never dangle into a
    // different repository; iteration order is insertion order
    repositories: Vec<Option<Repository>>,
    pub(crate) candidate_index: BTreeMap<String, KextHandle>,
    pub(crate) missing_deps: Vec<KextHandle>,
    pub(crate) disable_count: u32,
    pub(crate) needs_clear: bool,
    pub(crate) needs_recalc: bool,
    safe_boot: bool,
    full_tests: bool,
    strict_authentication: bool,
    load_in_process: bool,
    pub(crate) authenticator: Box<dyn Authenticator>,
    pub(crate) prompt: Box<dyn UserPrompt>,
}

impl Default for KextManager {
    fn default() -> Self {
        Self::new()
    }
}

impl KextManager {
    /// Create an empty manager with non-interactive defaults
    pub fn new() -> Self {
        Self {
            repositories: Vec::new(),
            candidate_index: BTreeMap::new(),
            missing_deps: Vec::new(),
            disable_count: 0,
            needs_clear: false,
            needs_recalc: true,
            safe_boot: false,
            full_tests: false,
            strict_authentication: false,
            load_in_process: false,
            authenticator: Box::new(TrustingAuthenticator),
            prompt: Box::new(NullPrompt),
        }
    }

    /// Replace the authentication capability
    pub fn with_authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticator = Box::new(authenticator);
        self
    }

    /// Replace the user-prompt capability
    pub fn with_prompt(mut self, prompt: impl UserPrompt + 'static) -> Self {
        self.prompt = Box::new(prompt);
        self
    }

    pub fn safe_boot_mode(&self) -> bool {
        self.safe_boot
    }

    /// Toggle safe-boot mode; the candidate set changes, so relationships
    /// are cleared
    pub fn set_safe_boot_mode(&mut self, safe_boot: bool) {
        if self.safe_boot != safe_boot {
            self.safe_boot = safe_boot;
            self.clear_relationships();
        }
    }

    pub fn performs_full_tests(&self) -> bool {
        self.full_tests
    }

    pub fn set_performs_full_tests(&mut self, full_tests: bool) {
        self.full_tests = full_tests;
    }

    pub fn performs_strict_authentication(&self) -> bool {
        self.strict_authentication
    }

    pub fn set_performs_strict_authentication(&mut self, strict: bool) {
        self.strict_authentication = strict;
    }

    pub fn performs_loads_in_process(&self) -> bool {
        self.load_in_process
    }

    pub fn set_performs_loads_in_process(&mut self, in_process: bool) {
        self.load_in_process = in_process;
    }

    /// Repository indices in insertion order
    pub fn repository_indices(&self) -> Vec<usize> {
        self.repositories
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|_| i))
            .collect()
    }

    pub fn repository(&self, index: usize) -> Option<&Repository> {
        self.repositories.get(index).and_then(Option::as_ref)
    }

    pub(crate) fn repository_mut(&mut self, index: usize) -> Option<&mut Repository> {
        self.repositories.get_mut(index).and_then(Option::as_mut)
    }

    pub fn repository_count(&self) -> usize {
        self.repositories.iter().flatten().count()
    }

    /// Register a repository directory
    ///
    /// Adding a directory that is already registered is a no-op returning
    /// the existing repository (its scan flag is widened if the new request
    /// asks for scanning).
    pub fn add_repository(&mut self, directory: &Path, scans_for_kexts: bool) -> Result<usize> {
        let canonical = canonicalize_directory(directory);
        debug!(directory = %canonical.display(), "adding repository");

        if let Some(index) = self.repository_index_for_directory(&canonical) {
            debug!(directory = %canonical.display(), "repository exists");
            if scans_for_kexts {
                if let Some(repo) = self.repository_mut(index) {
                    if !repo.scans_for_kexts() {
                        repo.set_scans_for_kexts(true);
                    }
                }
            }
            return Ok(index);
        }

        let repository = Repository::new(canonical, scans_for_kexts);
        Ok(self.install_repository(repository))
    }

    pub(crate) fn install_repository(&mut self, repository: Repository) -> usize {
        debug!(directory = %repository.directory().display(), "added repository");
        self.repositories.push(Some(repository));
        let index = self.repositories.len() - 1;
        self.clear_relationships();
        index
    }

    /// Remove a repository by directory; unknown directories are ignored
    pub fn remove_repository(&mut self, directory: &Path) {
        let canonical = canonicalize_directory(directory);
        debug!(directory = %canonical.display(), "request to remove repository");

        if let Some(index) = self.repository_index_for_directory(&canonical) {
            self.clear_relationships();
            self.clear_dependency_relationships();
            self.repositories[index] = None;
        }
    }

    /// Find a registered repository by directory
    pub fn repository_index_for_directory(&self, directory: &Path) -> Option<usize> {
        let canonical = canonicalize_directory(directory);
        self.repositories
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|r| (i, r)))
            .find(|(_, r)| r.directory() == canonical)
            .map(|(i, _)| i)
    }

    /// Drop all derived state in every repository and rebuild lazily
    pub fn reset_all_repositories(&mut self) {
        debug!("resetting all repositories");
        self.disable_clear();
        for repo in self.repositories.iter_mut().flatten() {
            repo.reset();
        }
        self.clear_relationships();
        self.enable_clear();
    }

    /// Intake a kext whose metadata an external scanner already parsed
    ///
    /// The path is classified first: it must name a `.kext` directory lying
    /// inside a registered repository. A path already known returns the
    /// existing kext.
    pub fn add_kext_at_path(&mut self, path: &Path, info: KextInfo) -> Result<KextHandle> {
        debug!(path = %path.display(), "request to add kernel extension");

        classify_kext_path(path)?;

        if let Some(existing) = self.kext_handle_with_path(path) {
            debug!(path = %path.display(), "kernel extension exists");
            return Ok(existing);
        }

        let repo_index = self
            .repository_index_containing(path)
            .ok_or_else(|| Error::url_not_in_repository(path.display().to_string()))?;

        self.add_kext_to_repository(repo_index, Kext::new(info, path))
    }

    /// Add a fully built kext to a repository's candidate list
    pub fn add_kext_to_repository(&mut self, repo: usize, kext: Kext) -> Result<KextHandle> {
        if kext.identifier().is_empty() {
            return Err(Error::invalid_argument("empty bundle identifier"));
        }
        let repository = self
            .repository_mut(repo)
            .ok_or_else(|| Error::invalid_argument("no such repository"))?;
        let slot = repository.add_kext(kext);
        self.clear_relationships();
        Ok(KextHandle { repo, slot })
    }

    /// Park an unusable kext in a repository's bad list
    pub fn add_bad_kext_to_repository(&mut self, repo: usize, kext: Kext) -> Result<KextHandle> {
        let repository = self
            .repository_mut(repo)
            .ok_or_else(|| Error::invalid_argument("no such repository"))?;
        let slot = repository.add_bad_kext(kext);
        Ok(KextHandle { repo, slot })
    }

    /// Remove a kext from its repository
    pub fn remove_kext(&mut self, handle: KextHandle) {
        if let Some(repo) = self.repository_mut(handle.repo) {
            repo.remove_kext(handle.slot);
            self.clear_relationships();
        }
    }

    /// Replace a kext in place with freshly scanned metadata
    pub fn rescan_kext(&mut self, handle: KextHandle, info: KextInfo) -> Result<KextHandle> {
        let path = self
            .kext(handle)
            .map(|k| k.path().to_path_buf())
            .ok_or_else(|| Error::kext_not_found(""))?;
        self.remove_kext(handle);
        self.add_kext_at_path(&path, info)
    }

    /// Move a kext out of candidacy; it will not be indexed again until
    /// requalified
    pub fn disqualify_kext(&mut self, handle: KextHandle) {
        if let Some(repo) = self.repository_mut(handle.repo) {
            repo.disqualify(handle.slot);
            self.clear_relationships();
        }
    }

    /// Return a disqualified kext to candidacy
    pub fn requalify_kext(&mut self, handle: KextHandle) {
        if let Some(repo) = self.repository_mut(handle.repo) {
            repo.requalify(handle.slot);
            self.clear_relationships();
        }
    }

    /// Record the external validator's verdict for a kext
    pub fn set_kext_valid(&mut self, handle: KextHandle, valid: bool) {
        let changed = match self.kext_mut(handle) {
            Some(kext) if kext.is_valid() != valid => {
                kext.set_valid(valid);
                true
            }
            _ => false,
        };
        if changed {
            self.clear_relationships();
        }
    }

    /// Enable or disable a kext by policy
    pub fn set_kext_enabled(&mut self, handle: KextHandle, enabled: bool) {
        let changed = match self.kext_mut(handle) {
            Some(kext) if kext.is_enabled() != enabled => {
                kext.set_enabled(enabled);
                true
            }
            _ => false,
        };
        if changed {
            self.clear_relationships();
        }
    }

    /// Authenticate every not-yet-authentic kext in every repository
    pub fn authenticate_all_kexts(&mut self) {
        debug!("authenticating all kernel extensions");
        let strict = self.strict_authentication;
        for repo in self.repositories.iter_mut().flatten() {
            let slots: Vec<usize> = repo
                .candidate_slots()
                .iter()
                .chain(repo.bad_slots())
                .copied()
                .collect();
            for slot in slots {
                let Some(kext) = repo.kext(slot) else { continue };
                if kext.is_authentic() {
                    continue;
                }
                match self.authenticator.authenticate(kext, strict) {
                    Ok(()) => {
                        if let Some(kext) = repo.kext_mut(slot) {
                            kext.mark_authentic();
                        }
                    }
                    Err(err) => {
                        error!(
                            path = %kext.path().display(),
                            %err,
                            "authentication failed for extension"
                        );
                    }
                }
            }
        }
    }

    /// Mark every kext authentic without checking (trusted callers only)
    pub fn mark_all_kexts_authentic(&mut self) {
        debug!("marking all kernel extensions authentic");
        for repo in self.repositories.iter_mut().flatten() {
            repo.mark_kexts_authentic();
        }
    }

    /// Lift the load-failed quarantine everywhere
    pub fn clear_load_failures(&mut self) {
        info!("clearing load failures");
        for repo in self.repositories.iter_mut().flatten() {
            repo.clear_load_failures();
        }
        self.clear_relationships();
    }

    /// Read a kext through its handle
    pub fn kext(&self, handle: KextHandle) -> Option<&Kext> {
        self.repository(handle.repo)
            .and_then(|r| r.kext(handle.slot))
    }

    pub(crate) fn kext_mut(&mut self, handle: KextHandle) -> Option<&mut Kext> {
        self.repository_mut(handle.repo)
            .and_then(|r| r.kext_mut(handle.slot))
    }

    /// Display name for log messages: the bundle path, or the identifier
    /// when the handle no longer resolves
    pub(crate) fn kext_display(&self, handle: KextHandle) -> String {
        self.kext(handle)
            .map(|k| k.path().display().to_string())
            .unwrap_or_else(|| "(unknown)".to_string())
    }

    pub(crate) fn kext_handle_with_path(&self, path: &Path) -> Option<KextHandle> {
        self.repositories
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|r| (i, r)))
            .find_map(|(repo, r)| {
                r.kext_slot_with_path(path)
                    .map(|slot| KextHandle { repo, slot })
            })
    }

    fn repository_index_containing(&self, path: &Path) -> Option<usize> {
        self.repositories
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|r| (i, r)))
            .find(|(_, r)| path.starts_with(r.directory()))
            .map(|(i, _)| i)
    }
}

/// Canonicalize a repository directory, falling back to the given path when
/// the directory is not reachable (the caller will hit the real error soon
/// enough)
fn canonicalize_directory(directory: &Path) -> PathBuf {
    directory
        .canonicalize()
        .unwrap_or_else(|_| directory.to_path_buf())
}

/// Syntactic classification of a kext bundle path
///
/// Existence and readability are the scanner's concern; intake only rejects
/// paths that can never name a kext bundle.
fn classify_kext_path(path: &Path) -> Result<()> {
    let display = || path.display().to_string();
    match path.extension().and_then(|e| e.to_str()) {
        Some("kext") => {}
        Some(_) => return Err(Error::not_a_kext(display())),
        None => return Err(Error::not_a_bundle(display())),
    }
    if path.exists() && !path.is_dir() {
        return Err(Error::not_a_directory(display()));
    }
    Ok(())
}
