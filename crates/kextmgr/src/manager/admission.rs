//! Candidate admission
//!
//! Pure predicates deciding whether a bundle may enter the candidate index.

use crate::kext::Kext;

/// Why a bundle was refused admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDenial {
    /// Failed its validity predicate
    Invalid,
    /// Quarantined after a failed load
    LoadFailed,
    /// Disabled by policy
    Disabled,
    /// Not eligible while safe boot is in effect
    NotSafeBootEligible,
}

/// Check a bundle against the admission policy, returning the first
/// rejection reason
pub(crate) fn denial(kext: &Kext, safe_boot: bool) -> Option<AdmissionDenial> {
    if !kext.is_valid() {
        return Some(AdmissionDenial::Invalid);
    }
    if kext.declares_load_failed() {
        return Some(AdmissionDenial::LoadFailed);
    }
    if safe_boot && !kext.is_eligible_during_safe_boot() {
        return Some(AdmissionDenial::NotSafeBootEligible);
    }
    if !kext.is_enabled() {
        return Some(AdmissionDenial::Disabled);
    }
    None
}

/// Whether a bundle is admissible into the candidate index
pub fn is_admissible(kext: &Kext, safe_boot: bool) -> bool {
    denial(kext, safe_boot).is_none()
}
