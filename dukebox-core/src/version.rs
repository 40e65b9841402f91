//! Runtime version numbers.
//!
//! Java runtime versions are `major.minor.patch` with an optional build
//! number (`21.0.2+13`). Components are arbitrary-precision - vendors have
//! shipped build metadata far outside `u32` - and the total order is
//! major, then minor, then patch, then build, with a missing build
//! comparing equal to build 0.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use num_bigint::BigUint;

use crate::error::Error;

/// An ordered runtime version.
#[derive(Debug, Clone)]
pub struct RuntimeVersion {
    major: BigUint,
    minor: BigUint,
    patch: BigUint,
    build: Option<BigUint>,
}

impl RuntimeVersion {
    pub fn new(major: BigUint, minor: BigUint, patch: BigUint, build: Option<BigUint>) -> Self {
        Self {
            major,
            minor,
            patch,
            build,
        }
    }

    /// Convenience constructor for versions that fit machine words.
    pub fn from_parts(major: u64, minor: u64, patch: u64, build: Option<u64>) -> Self {
        Self::new(
            BigUint::from(major),
            BigUint::from(minor),
            BigUint::from(patch),
            build.map(BigUint::from),
        )
    }

    pub fn major(&self) -> &BigUint {
        &self.major
    }

    pub fn minor(&self) -> &BigUint {
        &self.minor
    }

    pub fn patch(&self) -> &BigUint {
        &self.patch
    }

    pub fn build(&self) -> Option<&BigUint> {
        self.build.as_ref()
    }

    fn effective_build(&self) -> BigUint {
        self.build.clone().unwrap_or_default()
    }
}

impl PartialEq for RuntimeVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RuntimeVersion {}

impl Ord for RuntimeVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then_with(|| self.minor.cmp(&other.minor))
            .then_with(|| self.patch.cmp(&other.patch))
            .then_with(|| self.effective_build().cmp(&other.effective_build()))
    }
}

impl PartialOrd for RuntimeVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

impl FromStr for RuntimeVersion {
    type Err = Error;

    /// Parses `major[.minor[.patch]][+build]`; omitted components are 0.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidDescriptor(format!("invalid version string '{s}'"));

        let (numbers, build) = match s.split_once('+') {
            Some((numbers, build)) => (numbers, Some(build)),
            None => (s, None),
        };

        let mut parts = numbers.split('.');
        let mut component = |missing_ok: bool| -> Result<BigUint, Error> {
            match parts.next() {
                Some(p) => BigUint::from_str(p).map_err(|_| invalid()),
                None if missing_ok => Ok(BigUint::default()),
                None => Err(invalid()),
            }
        };

        let major = component(false)?;
        let minor = component(true)?;
        let patch = component(true)?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        let build = match build {
            Some(b) => Some(BigUint::from_str(b).map_err(|_| invalid())?),
            None => None,
        };

        Ok(Self::new(major, minor, patch, build))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn v(s: &str) -> RuntimeVersion {
        s.parse().unwrap()
    }

    #[test]
    fn parses_all_shapes() {
        assert_eq!(v("8"), RuntimeVersion::from_parts(8, 0, 0, None));
        assert_eq!(v("11.0"), RuntimeVersion::from_parts(11, 0, 0, None));
        assert_eq!(v("21.0.2"), RuntimeVersion::from_parts(21, 0, 2, None));
        assert_eq!(v("21.0.2+13"), RuntimeVersion::from_parts(21, 0, 2, Some(13)));
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "a.b.c", "1.2.3.4", "1+", "+5", "1.2.3+x"] {
            assert!(bad.parse::<RuntimeVersion>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn total_order() {
        assert!(v("8") < v("9"));
        assert!(v("9.0.1") < v("9.1.0"));
        assert!(v("9.1.0") < v("10"));
        assert!(v("21.0.2") < v("21.0.2+13"));
        assert!(v("21.0.2+13") < v("21.0.2+14"));
    }

    #[test]
    fn missing_build_is_zero() {
        assert_eq!(v("17.0.1"), v("17.0.1+0"));
        assert!(v("17.0.1") < v("17.0.1+1"));
    }

    #[test]
    fn display_round_trips() {
        for s in ["8.0.0", "21.0.2", "21.0.2+13"] {
            assert_eq!(v(s).to_string(), s);
        }
    }

    #[test]
    fn handles_values_beyond_u64() {
        let big = "99999999999999999999999999.0.0+88888888888888888888";
        let parsed = v(big);
        assert_eq!(parsed.to_string(), big);
        assert!(parsed > v("21"));
    }
}
