//! The search predicate engine.
//!
//! [`matches`] is a pure function: logical AND across every criterion
//! that is present, exact equality except for the tag subset test and the
//! version range. No criteria at all matches everything.

use std::collections::BTreeSet;

use crate::descriptor::{Configuration, RuntimeDescriptor};
use crate::error::{Error, Result};
use crate::version::RuntimeVersion;

/// An inclusive/exclusive version interval.
#[derive(Debug, Clone, Default)]
pub struct VersionRange {
    lower: Option<RuntimeVersion>,
    lower_exclusive: bool,
    upper: Option<RuntimeVersion>,
    upper_exclusive: bool,
}

impl VersionRange {
    /// Rejects inverted ranges (`lower > upper`).
    pub fn new(
        lower: Option<RuntimeVersion>,
        lower_exclusive: bool,
        upper: Option<RuntimeVersion>,
        upper_exclusive: bool,
    ) -> Result<Self> {
        if let (Some(lo), Some(hi)) = (&lower, &upper) {
            if lo > hi {
                return Err(Error::InvalidCriteria(format!(
                    "version range lower bound {lo} exceeds upper bound {hi}"
                )));
            }
        }
        Ok(Self {
            lower,
            lower_exclusive,
            upper,
            upper_exclusive,
        })
    }

    /// `[lower, upper)` - the common shape for "all of major N".
    pub fn half_open(lower: RuntimeVersion, upper: RuntimeVersion) -> Result<Self> {
        Self::new(Some(lower), false, Some(upper), true)
    }

    pub fn contains(&self, version: &RuntimeVersion) -> bool {
        if let Some(lower) = &self.lower {
            let ok = if self.lower_exclusive {
                version > lower
            } else {
                version >= lower
            };
            if !ok {
                return false;
            }
        }
        if let Some(upper) = &self.upper {
            let ok = if self.upper_exclusive {
                version < upper
            } else {
                version <= upper
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

/// Filter criteria; every absent field is a wildcard.
#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    pub repository: Option<String>,
    pub platform: Option<String>,
    pub architecture: Option<String>,
    pub vm: Option<String>,
    pub configuration: Option<Configuration>,
    pub version: Option<VersionRange>,
    pub required_tags: BTreeSet<String>,
}

impl SearchCriteria {
    /// The match-everything criteria.
    pub fn any() -> Self {
        Self::default()
    }
}

/// True when the descriptor satisfies every present criterion.
pub fn matches(descriptor: &RuntimeDescriptor, criteria: &SearchCriteria) -> bool {
    if let Some(repository) = &criteria.repository {
        if descriptor.repository() != repository {
            return false;
        }
    }
    if let Some(platform) = &criteria.platform {
        if descriptor.platform() != platform {
            return false;
        }
    }
    if let Some(architecture) = &criteria.architecture {
        if descriptor.architecture() != architecture {
            return false;
        }
    }
    if let Some(vm) = &criteria.vm {
        if descriptor.vm() != vm {
            return false;
        }
    }
    if let Some(configuration) = criteria.configuration {
        if descriptor.configuration() != configuration {
            return false;
        }
    }
    if let Some(range) = &criteria.version {
        if !range.contains(descriptor.version()) {
            return false;
        }
    }
    criteria.required_tags.is_subset(descriptor.tags())
}
