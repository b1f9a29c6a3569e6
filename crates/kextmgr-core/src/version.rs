//! Kernel extension version numbers
//!
//! Kext versions use the canonical numeric-dotted form
//! `major[.minor[.revision]]` with an optional pre-release stage suffix
//! (`d` development, `a` alpha, `b` beta, `f`/`fc` release candidate)
//! followed by a stage level, e.g. `1.0.2d3`. This is not semver, so the
//! format is parsed by hand. A parsed version is encoded into a single
//! integer so that ordering and equality are plain integer comparisons.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

const MAX_MAJOR: i64 = 9999;
const MAX_MINOR: i64 = 99;
const MAX_REVISION: i64 = 99;
const MAX_STAGE_LEVEL: i64 = 255;

/// Pre-release stage of a version, ordered development < release
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ReleaseStage {
    Development = 1,
    Alpha = 3,
    Beta = 5,
    Candidate = 7,
    Release = 9,
}

impl ReleaseStage {
    fn suffix(self) -> &'static str {
        match self {
            ReleaseStage::Development => "d",
            ReleaseStage::Alpha => "a",
            ReleaseStage::Beta => "b",
            ReleaseStage::Candidate => "fc",
            ReleaseStage::Release => "",
        }
    }

    fn from_encoded(value: i64) -> Self {
        match value {
            1 => ReleaseStage::Development,
            3 => ReleaseStage::Alpha,
            5 => ReleaseStage::Beta,
            7 => ReleaseStage::Candidate,
            _ => ReleaseStage::Release,
        }
    }
}

/// A totally ordered kext version number
///
/// The wrapped value is the canonical integer encoding; two versions are
/// equal exactly when their canonical strings are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionNumber(i64);

impl VersionNumber {
    /// Parse a version from its canonical string form
    pub fn parse(s: &str) -> Result<Self, Error> {
        s.parse()
    }

    /// The raw integer encoding (useful for logging and diagnostics)
    pub fn encoded(self) -> i64 {
        self.0
    }

    fn components(self) -> (i64, i64, i64, ReleaseStage, i64) {
        let major = self.0 / 100_000_000_000;
        let minor = (self.0 / 1_000_000_000) % 100;
        let revision = (self.0 / 10_000_000) % 100;
        let stage = ReleaseStage::from_encoded((self.0 / 1_000_000) % 10);
        let level = self.0 % 1_000_000;
        (major, minor, revision, stage, level)
    }
}

fn encode(major: i64, minor: i64, revision: i64, stage: ReleaseStage, level: i64) -> i64 {
    major * 100_000_000_000
        + minor * 1_000_000_000
        + revision * 10_000_000
        + (stage as i64) * 1_000_000
        + level
}

impl FromStr for VersionNumber {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || Error::invalid_argument(format!("invalid version string: {s:?}"));
        let bytes = s.as_bytes();
        let mut pos = 0;

        let read_number = |pos: &mut usize| -> Result<i64, Error> {
            let start = *pos;
            while *pos < bytes.len() && bytes[*pos].is_ascii_digit() {
                *pos += 1;
            }
            if *pos == start {
                return Err(bad());
            }
            s[start..*pos].parse().map_err(|_| bad())
        };

        let mut numbers = Vec::with_capacity(3);
        numbers.push(read_number(&mut pos)?);
        while pos < bytes.len() && bytes[pos] == b'.' {
            pos += 1;
            numbers.push(read_number(&mut pos)?);
            if numbers.len() > 3 {
                return Err(bad());
            }
        }

        let mut stage = ReleaseStage::Release;
        let mut level = 0;
        if pos < bytes.len() {
            stage = match bytes[pos] {
                b'd' => ReleaseStage::Development,
                b'a' => ReleaseStage::Alpha,
                b'b' => ReleaseStage::Beta,
                b'f' => ReleaseStage::Candidate,
                _ => return Err(bad()),
            };
            pos += 1;
            if stage == ReleaseStage::Candidate && pos < bytes.len() && bytes[pos] == b'c' {
                pos += 1;
            }
            level = read_number(&mut pos)?;
        }

        if pos != bytes.len() {
            return Err(bad());
        }

        let major = numbers[0];
        let minor = numbers.get(1).copied().unwrap_or(0);
        let revision = numbers.get(2).copied().unwrap_or(0);

        if major > MAX_MAJOR
            || minor > MAX_MINOR
            || revision > MAX_REVISION
            || level > MAX_STAGE_LEVEL
        {
            return Err(bad());
        }

        Ok(VersionNumber(encode(major, minor, revision, stage, level)))
    }
}

impl fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (major, minor, revision, stage, level) = self.components();
        write!(f, "{major}.{minor}")?;
        if revision != 0 {
            write!(f, ".{revision}")?;
        }
        if stage != ReleaseStage::Release {
            write!(f, "{}{level}", stage.suffix())?;
        }
        Ok(())
    }
}

impl TryFrom<String> for VersionNumber {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl From<VersionNumber> for String {
    fn from(v: VersionNumber) -> String {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> VersionNumber {
        s.parse().unwrap()
    }

    #[test]
    fn test_ordering() {
        assert!(v("2.0") > v("1.0"));
        assert!(v("1.0.1") > v("1.0"));
        assert!(v("10.0") > v("9.9.9"));
        assert!(v("1.0.2d3") < v("1.0.2"));
        assert!(v("1.0.2d3") < v("1.0.2a1"));
        assert!(v("1.0.2b5") < v("1.0.2fc1"));
        assert!(v("1.0.2fc1") < v("1.0.2"));
    }

    #[test]
    fn test_equality_of_equivalent_forms() {
        assert_eq!(v("1.0"), v("1.0.0"));
        assert_eq!(v("1"), v("1.0"));
        assert_eq!(v("1.0.2fc3"), v("1.0.2f3"));
    }

    #[test]
    fn test_parse_failures_are_observable() {
        for s in ["", "abc", "1.", "1..2", "1.0.0.0", "1.0x", "-1.0", "1.0d", "1.0.2q3"] {
            assert!(VersionNumber::parse(s).is_err(), "expected failure for {s:?}");
        }
    }

    #[test]
    fn test_display_canonical() {
        assert_eq!(v("3.0").to_string(), "3.0");
        assert_eq!(v("1.0.2").to_string(), "1.0.2");
        assert_eq!(v("1.0.2d3").to_string(), "1.0.2d3");
        assert_eq!(v("2.1.0fc2").to_string(), "2.1fc2");
        assert_eq!(v("1").to_string(), "1.0");
    }

    #[test]
    fn test_limits() {
        assert!(VersionNumber::parse("9999.99.99").is_ok());
        assert!(VersionNumber::parse("10000.0").is_err());
        assert!(VersionNumber::parse("1.100").is_err());
        assert!(VersionNumber::parse("1.0b256").is_err());
    }
}
