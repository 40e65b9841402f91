//! Immutable descriptors for fetchable runtime archives.
//!
//! A [`RuntimeDescriptor`] identifies one downloadable JDK/JRE archive.
//! Its identity is the archive's hash value, which makes the whole system
//! content-addressable: two archives with identical bytes collapse to one
//! inventory entry regardless of which backend advertised them.
//!
//! All invariants are enforced by the validating constructors, never at
//! use time. Serde goes through a raw mirror struct so deserialized
//! descriptors pass through the same validation.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, FixedOffset};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::version::RuntimeVersion;

fn hash_value_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[a-f0-9]{1,256}$").unwrap())
}

fn hash_algorithm_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[A-Z0-9-]{1,32}$").unwrap())
}

/// A cryptographic hash naming an archive's expected content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHash {
    algorithm: String,
    value: String,
}

impl ArchiveHash {
    /// Validates and normalizes: the value is lowercased hex, the
    /// algorithm an uppercase digest name such as `SHA-256`.
    pub fn new(algorithm: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let algorithm = algorithm.into();
        let value = value.into().to_ascii_lowercase();

        if !hash_algorithm_pattern().is_match(&algorithm) {
            return Err(Error::InvalidDescriptor(format!(
                "hash algorithm '{algorithm}' does not match [A-Z0-9-]{{1,32}}"
            )));
        }
        if !hash_value_pattern().is_match(&value) {
            return Err(Error::InvalidDescriptor(format!(
                "hash value '{value}' does not match [a-f0-9]{{1,256}}"
            )));
        }

        Ok(Self { algorithm, value })
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for ArchiveHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.value)
    }
}

/// Whether an archive carries a full JDK or just a JRE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Configuration {
    Jdk,
    Jre,
}

impl Configuration {
    pub fn as_str(self) -> &'static str {
        match self {
            Configuration::Jdk => "jdk",
            Configuration::Jre => "jre",
        }
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Configuration {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "jdk" => Ok(Configuration::Jdk),
            "jre" => Ok(Configuration::Jre),
            other => Err(Error::InvalidDescriptor(format!(
                "configuration must be 'jdk' or 'jre', got '{other}'"
            ))),
        }
    }
}

/// Optional upstream build metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    number: String,
    timestamp: DateTime<FixedOffset>,
}

impl BuildInfo {
    pub fn new(number: impl Into<String>, timestamp: DateTime<FixedOffset>) -> Result<Self> {
        let number = number.into();
        require_token("build number", &number)?;
        Ok(Self { number, timestamp })
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    pub fn timestamp(&self) -> &DateTime<FixedOffset> {
        &self.timestamp
    }
}

/// An immutable description of one fetchable runtime archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDescriptor", into = "RawDescriptor")]
pub struct RuntimeDescriptor {
    repository: String,
    version: RuntimeVersion,
    platform: String,
    architecture: String,
    vm: String,
    configuration: Configuration,
    archive_uri: String,
    archive_size: u64,
    archive_hash: ArchiveHash,
    tags: BTreeSet<String>,
    build: Option<BuildInfo>,
}

/// Serde mirror of [`RuntimeDescriptor`]; all validation runs in
/// `TryFrom`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDescriptor {
    repository: String,
    version: String,
    platform: String,
    architecture: String,
    vm: String,
    configuration: String,
    archive_uri: String,
    archive_size: u64,
    archive_hash_algorithm: String,
    archive_hash_value: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    build_number: Option<String>,
    #[serde(default)]
    build_time: Option<String>,
}

#[allow(clippy::too_many_arguments)]
impl RuntimeDescriptor {
    /// Validating constructor. Platform, architecture and vm are
    /// normalized to lowercase; every free-form string is rejected if it
    /// would not survive the flat metadata record (embedded whitespace in
    /// tokens, control characters anywhere).
    pub fn new(
        repository: impl Into<String>,
        version: RuntimeVersion,
        platform: impl Into<String>,
        architecture: impl Into<String>,
        vm: impl Into<String>,
        configuration: Configuration,
        archive_uri: impl Into<String>,
        archive_size: u64,
        archive_hash: ArchiveHash,
        tags: BTreeSet<String>,
        build: Option<BuildInfo>,
    ) -> Result<Self> {
        let repository = repository.into();
        let platform = platform.into().to_ascii_lowercase();
        let architecture = architecture.into().to_ascii_lowercase();
        let vm = vm.into().to_ascii_lowercase();
        let archive_uri = archive_uri.into();

        require_token("repository", &repository)?;
        require_token("platform", &platform)?;
        require_token("architecture", &architecture)?;
        require_token("vm", &vm)?;
        require_token("archive uri", &archive_uri)?;
        for tag in &tags {
            require_token("tag", tag)?;
        }

        Ok(Self {
            repository,
            version,
            platform,
            architecture,
            vm,
            configuration,
            archive_uri,
            archive_size,
            archive_hash,
            tags,
            build,
        })
    }

    /// The content address: the lowercase hex hash value.
    pub fn id(&self) -> &str {
        self.archive_hash.value()
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn version(&self) -> &RuntimeVersion {
        &self.version
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    pub fn vm(&self) -> &str {
        &self.vm
    }

    pub fn configuration(&self) -> Configuration {
        self.configuration
    }

    pub fn archive_uri(&self) -> &str {
        &self.archive_uri
    }

    pub fn archive_size(&self) -> u64 {
        self.archive_size
    }

    pub fn archive_hash(&self) -> &ArchiveHash {
        &self.archive_hash
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn build(&self) -> Option<&BuildInfo> {
        self.build.as_ref()
    }
}

/// Rejects empty strings, embedded whitespace and control characters -
/// anything that would corrupt the space-separated metadata record.
fn require_token(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidDescriptor(format!("{field} must not be empty")));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidDescriptor(format!(
            "{field} '{value}' must not contain whitespace or control characters"
        )));
    }
    Ok(())
}

impl TryFrom<RawDescriptor> for RuntimeDescriptor {
    type Error = Error;

    fn try_from(raw: RawDescriptor) -> Result<Self> {
        let build = match (raw.build_number, raw.build_time) {
            (None, None) => None,
            (Some(number), Some(time)) => {
                let timestamp = DateTime::parse_from_rfc3339(&time).map_err(|e| {
                    Error::InvalidDescriptor(format!("invalid build time '{time}': {e}"))
                })?;
                Some(BuildInfo::new(number, timestamp)?)
            }
            (Some(_), None) => {
                return Err(Error::InvalidDescriptor(
                    "buildNumber given without buildTime".into(),
                ))
            }
            (None, Some(_)) => {
                return Err(Error::InvalidDescriptor(
                    "buildTime given without buildNumber".into(),
                ))
            }
        };

        RuntimeDescriptor::new(
            raw.repository,
            raw.version.parse()?,
            raw.platform,
            raw.architecture,
            raw.vm,
            raw.configuration.parse()?,
            raw.archive_uri,
            raw.archive_size,
            ArchiveHash::new(raw.archive_hash_algorithm, raw.archive_hash_value)?,
            raw.tags.into_iter().collect(),
            build,
        )
    }
}

impl From<RuntimeDescriptor> for RawDescriptor {
    fn from(d: RuntimeDescriptor) -> Self {
        RawDescriptor {
            repository: d.repository,
            version: d.version.to_string(),
            platform: d.platform,
            architecture: d.architecture,
            vm: d.vm,
            configuration: d.configuration.to_string(),
            archive_uri: d.archive_uri,
            archive_size: d.archive_size,
            archive_hash_algorithm: d.archive_hash.algorithm.clone(),
            archive_hash_value: d.archive_hash.value,
            tags: d.tags.into_iter().collect(),
            build_number: d.build.as_ref().map(|b| b.number.clone()),
            build_time: d.build.as_ref().map(|b| b.timestamp.to_rfc3339()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn descriptor_with_hash(value: &str) -> RuntimeDescriptor {
        RuntimeDescriptor::new(
            "https://builds.example.com/temurin",
            "21.0.2+13".parse().unwrap(),
            "linux",
            "x64",
            "hotspot",
            Configuration::Jdk,
            "https://builds.example.com/temurin/21.tar.gz",
            1024,
            ArchiveHash::new("SHA-256", value).unwrap(),
            BTreeSet::from(["production".to_string()]),
            None,
        )
        .unwrap()
    }

    #[test]
    fn id_is_the_hash_value() {
        let d = descriptor_with_hash("ab12");
        assert_eq!(d.id(), "ab12");
    }

    #[test]
    fn hash_value_is_lowercased_then_validated() {
        let h = ArchiveHash::new("SHA-256", "AB12CD").unwrap();
        assert_eq!(h.value(), "ab12cd");

        assert!(ArchiveHash::new("SHA-256", "xyz").is_err());
        assert!(ArchiveHash::new("SHA-256", "").is_err());
        assert!(ArchiveHash::new("SHA-256", "a".repeat(257)).is_err());
    }

    #[test]
    fn algorithm_pattern_is_enforced() {
        assert!(ArchiveHash::new("SHA-256", "ab").is_ok());
        assert!(ArchiveHash::new("MD5", "ab").is_ok());
        assert!(ArchiveHash::new("sha-256", "ab").is_err());
        assert!(ArchiveHash::new("", "ab").is_err());
        assert!(ArchiveHash::new("A".repeat(33), "ab").is_err());
    }

    #[test]
    fn platform_fields_are_normalized() {
        let d = RuntimeDescriptor::new(
            "repo",
            "17".parse().unwrap(),
            "Linux",
            "X64",
            "HotSpot",
            Configuration::Jre,
            "https://x/y.zip",
            0,
            ArchiveHash::new("SHA-256", "ff").unwrap(),
            BTreeSet::new(),
            None,
        )
        .unwrap();
        assert_eq!(d.platform(), "linux");
        assert_eq!(d.architecture(), "x64");
        assert_eq!(d.vm(), "hotspot");
    }

    #[test]
    fn rejects_whitespace_in_tokens() {
        let result = RuntimeDescriptor::new(
            "repo",
            "17".parse().unwrap(),
            "li nux",
            "x64",
            "hotspot",
            Configuration::Jdk,
            "https://x/y.zip",
            0,
            ArchiveHash::new("SHA-256", "ff").unwrap(),
            BTreeSet::new(),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn serde_round_trip_revalidates() {
        let d = descriptor_with_hash("12ef");
        let json = serde_json::to_string(&d).unwrap();
        let back: RuntimeDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);

        let bad = json.replace("12ef", "NOT-HEX");
        assert!(serde_json::from_str::<RuntimeDescriptor>(&bad).is_err());
    }
}
