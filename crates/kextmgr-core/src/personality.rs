//! Driver personalities
//!
//! A personality is a property-list dictionary describing a match
//! specification for kernel-side driver dispatch. The manager treats the
//! contents as opaque except for the handful of keys it inspects.

use std::fmt;

use plist::{Dictionary, Value};
use serde::{Deserialize, Serialize};

/// Key the kernel uses to request a demand-load of a module
pub const MODULE_DEMAND_KEY: &str = "OSBundleModuleDemand";

/// Debug-flags key that disqualifies a personality under safe boot
pub const IOKIT_DEBUG_KEY: &str = "IOKitDebug";

/// A driver personality dictionary
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Personality(Dictionary);

impl Personality {
    /// Create an empty personality
    pub fn new() -> Self {
        Self(Dictionary::new())
    }

    /// Wrap an existing property-list dictionary
    pub fn from_dictionary(dict: Dictionary) -> Self {
        Self(dict)
    }

    /// The minimal personality published so the kernel can demand-load a
    /// module from its own prelinked set
    pub fn module_demand(identifier: &str) -> Self {
        let mut dict = Dictionary::new();
        dict.insert(
            MODULE_DEMAND_KEY.to_string(),
            Value::String(identifier.to_string()),
        );
        Self(dict)
    }

    /// Look up a value by key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Insert a value, returning any previous value for the key
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Whether this personality may be sent to the kernel under safe boot
    ///
    /// A personality with a nonzero (or unreadable) `IOKitDebug` value is
    /// held back during safe boot.
    pub fn eligible_during_safe_boot(&self) -> bool {
        match self.0.get(IOKIT_DEBUG_KEY) {
            None => true,
            Some(value) => value.as_signed_integer() == Some(0),
        }
    }

    /// The personality as a plist value, for serialization
    pub fn to_value(&self) -> Value {
        Value::Dictionary(self.0.clone())
    }

    /// The underlying dictionary
    pub fn as_dictionary(&self) -> &Dictionary {
        &self.0
    }
}

impl fmt::Display for Personality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "personality with {} keys", self.0.len())
    }
}
