//! Host-version compatibility matching.
//!
//! A manifest's `agentOSVersion` is a range in one of three forms:
//!
//! - exact: `1.2.0`
//! - wildcard: `*`, `1.x`, `1.2.*` (missing trailing components match anything)
//! - caret: `^1.2.0` (same left-most non-zero component, not below the base)
//!
//! A range is compatible when at least one host-supported version satisfies it.

use std::fmt;

/// A concrete `MAJOR.MINOR.PATCH[-pre]` version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<String>,
}

impl Version {
    /// Parse a concrete version. Returns `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (core, pre) = match s.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_owned())),
            Some(_) => return None,
            None => (s, None),
        };
        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            patch,
            pre,
        })
    }

    fn triple(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

/// A parsed version range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionReq {
    Exact(Version),
    /// Up to three components; `None` matches any value.
    Wildcard([Option<u64>; 3]),
    Caret(Version),
}

impl VersionReq {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        if let Some(base) = s.strip_prefix('^') {
            return Version::parse(base).map(Self::Caret);
        }
        if let Some(exact) = Version::parse(s) {
            return Some(Self::Exact(exact));
        }
        parse_wildcard(s).map(Self::Wildcard)
    }

    pub fn matches(&self, version: &Version) -> bool {
        match self {
            Self::Exact(exact) => exact == version,
            Self::Wildcard(parts) => {
                let actual = [version.major, version.minor, version.patch];
                parts
                    .iter()
                    .zip(actual)
                    .all(|(want, got)| want.is_none_or(|w| w == got))
            }
            Self::Caret(base) => {
                if version.triple() < base.triple() {
                    return false;
                }
                if base.major > 0 {
                    version.major == base.major
                } else if base.minor > 0 {
                    version.major == 0 && version.minor == base.minor
                } else {
                    version.triple() == base.triple()
                }
            }
        }
    }
}

fn parse_wildcard(s: &str) -> Option<[Option<u64>; 3]> {
    let mut out = [None; 3];
    let mut seen_wild = false;
    let mut count = 0;
    for (i, part) in s.split('.').enumerate() {
        if i >= 3 {
            return None;
        }
        count += 1;
        match part {
            "*" | "x" | "X" => seen_wild = true,
            digits => {
                // A number after a wildcard (`1.x.3`) is not a valid range.
                if seen_wild {
                    return None;
                }
                out[i] = Some(digits.parse().ok()?);
            }
        }
    }
    // Partial versions like `1.2` are treated as `1.2.*`.
    (seen_wild || count < 3).then_some(out)
}

/// Outcome of a compatibility check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    /// The range is well formed but no supported version satisfies it.
    Incompatible,
    /// The range could not be parsed.
    Unrecognized,
}

/// Check `range` against every host-supported version.
pub fn check_compatibility<S: AsRef<str>>(range: &str, supported: &[S]) -> Compatibility {
    let Some(req) = VersionReq::parse(range) else {
        return Compatibility::Unrecognized;
    };
    let any = supported
        .iter()
        .filter_map(|v| Version::parse(v.as_ref()))
        .any(|v| req.matches(&v));
    if any {
        Compatibility::Compatible
    } else {
        Compatibility::Incompatible
    }
}
