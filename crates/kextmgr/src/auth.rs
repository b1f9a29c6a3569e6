//! Authentication capability
//!
//! Checking a bundle on disk (ownership, permissions) is the host's job,
//! not the manager's. The manager only needs a yes/no answer per kext, so
//! the check is a capability object supplied at construction.

use kextmgr_core::Result;

use crate::kext::Kext;

/// Per-bundle authentication check
pub trait Authenticator {
    /// Verify the bundle on disk
    ///
    /// `strict` carries the manager's strict-authentication policy flag.
    /// Returns `Err(Error::Authentication { .. })` when the bundle fails the
    /// check, or another error kind (for example `Cache`) when the check
    /// itself could not complete.
    fn authenticate(&self, kext: &Kext, strict: bool) -> Result<()>;
}

/// Accepts every bundle
///
/// The default for trusted callers (mirroring a blanket mark-authentic
/// pass) and for tests. Production callers supply a real implementation.
#[derive(Debug, Default)]
pub struct TrustingAuthenticator;

impl Authenticator for TrustingAuthenticator {
    fn authenticate(&self, _kext: &Kext, _strict: bool) -> Result<()> {
        Ok(())
    }
}
