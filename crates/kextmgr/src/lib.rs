//! Kernel extension management
//!
//! This crate handles:
//! - Repository registration and kext intake
//! - The candidate index: a version spine per identifier, duplicates
//!   chained off each spine node
//! - Admission policy (validity, enablement, safe boot, load-failed
//!   quarantine)
//! - Dependency resolution with pruning of unresolvable candidates
//! - Coalesced invalidation with read-repairing queries
//! - Load preparation and dispatch to the external link/load driver
//! - Driver personality exchange with the kernel catalog
//! - Repository cache reconstruction
//!
//! The manager is single-threaded cooperative: no internal scheduler, no
//! background work, every operation runs to completion on the caller's
//! thread. Callers using it from several threads serialize externally.

pub mod auth;
pub mod cache;
pub mod catalog;
pub mod kernel;
pub mod kext;
pub mod loader;
pub mod manager;
pub mod prompt;
pub mod repository;

pub use auth::{Authenticator, TrustingAuthenticator};
pub use catalog::{CatalogVerb, KernelCatalog};
pub use kernel::{LoadedKernel, LoadedModule};
pub use kext::{Kext, KextHandle, KextInfo, LibraryRequirement};
pub use loader::{
    DependencyGraph, DriverRequest, GraphEntry, LinkLoadDriver, LoadOptions, ModuleAddress,
};
pub use manager::{is_admissible, AdmissionDenial, KextManager};
pub use prompt::{NullPrompt, UserPrompt};
pub use repository::Repository;

pub use kextmgr_core::{Error, Personality, Result, VersionNumber};
