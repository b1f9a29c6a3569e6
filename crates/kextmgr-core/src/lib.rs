//! Core types for the kernel extension manager
//!
//! This crate holds the foundation the manager crate builds on:
//! - the error taxonomy with its stable numeric codes
//! - kext version numbers and their total ordering
//! - driver personality dictionaries

pub mod error;
pub mod personality;
pub mod version;

pub use error::{Error, Result};
pub use personality::{Personality, IOKIT_DEBUG_KEY, MODULE_DEMAND_KEY};
pub use version::VersionNumber;
