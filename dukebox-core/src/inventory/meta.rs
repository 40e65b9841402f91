//! The flat `meta.properties` record persisted next to each archive.
//!
//! One record per entry, `key=value` per line, `#` for comments. A record
//! missing a required key, or carrying an unparsable value, fails to load
//! with an error naming the offending key; unknown keys are ignored so
//! newer writers stay readable.

use std::collections::{BTreeSet, HashMap};

use chrono::DateTime;

use crate::descriptor::{ArchiveHash, BuildInfo, RuntimeDescriptor};
use crate::error::{Error, Result};

pub(crate) const META_FILE: &str = "meta.properties";

const FORMAT_VERSION: &str = "1";

const KEY_FORMAT_VERSION: &str = "format-version";
const KEY_ARCHITECTURE: &str = "architecture";
const KEY_HASH_ALGORITHM: &str = "archive-hash-algorithm";
const KEY_HASH_VALUE: &str = "archive-hash-value";
const KEY_ARCHIVE_SIZE: &str = "archive-size";
const KEY_ARCHIVE_URI: &str = "archive-uri";
const KEY_CONFIGURATION: &str = "configuration";
const KEY_PLATFORM: &str = "platform";
const KEY_REPOSITORY_URI: &str = "repository-uri";
const KEY_TAGS: &str = "tags";
const KEY_VM: &str = "vm";
const KEY_VERSION: &str = "version-string";
const KEY_BUILD_NUMBER: &str = "build-number";
const KEY_BUILD_TIME: &str = "build-time";

/// Renders a descriptor as a metadata record.
pub(crate) fn to_record(descriptor: &RuntimeDescriptor) -> String {
    let mut out = String::new();
    let mut put = |key: &str, value: &str| {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    };

    put(KEY_FORMAT_VERSION, FORMAT_VERSION);
    put(KEY_ARCHITECTURE, descriptor.architecture());
    put(KEY_HASH_ALGORITHM, descriptor.archive_hash().algorithm());
    put(KEY_HASH_VALUE, descriptor.archive_hash().value());
    put(KEY_ARCHIVE_SIZE, &descriptor.archive_size().to_string());
    put(KEY_ARCHIVE_URI, descriptor.archive_uri());
    put(KEY_CONFIGURATION, descriptor.configuration().as_str());
    put(KEY_PLATFORM, descriptor.platform());
    put(KEY_REPOSITORY_URI, descriptor.repository());
    put(
        KEY_TAGS,
        &descriptor
            .tags()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(" "),
    );
    put(KEY_VM, descriptor.vm());
    put(KEY_VERSION, &descriptor.version().to_string());
    if let Some(build) = descriptor.build() {
        put(KEY_BUILD_NUMBER, build.number());
        put(KEY_BUILD_TIME, &build.timestamp().to_rfc3339());
    }
    out
}

/// Parses a metadata record back into a validated descriptor.
pub(crate) fn from_record(content: &str) -> Result<RuntimeDescriptor> {
    let mut fields: HashMap<&str, &str> = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| Error::MetadataField {
            key: line.to_string(),
            reason: "line is not a key=value pair".into(),
        })?;
        fields.insert(key.trim(), value.trim());
    }

    let required = |key: &str| -> Result<&str> {
        fields.get(key).copied().ok_or_else(|| Error::MetadataField {
            key: key.to_string(),
            reason: "required key is missing".into(),
        })
    };
    let invalid = |key: &str, detail: String| Error::MetadataField {
        key: key.to_string(),
        reason: detail,
    };

    let format = required(KEY_FORMAT_VERSION)?;
    if format != FORMAT_VERSION {
        return Err(invalid(
            KEY_FORMAT_VERSION,
            format!("unsupported format version '{format}'"),
        ));
    }

    let archive_size: u64 = required(KEY_ARCHIVE_SIZE)?
        .parse()
        .map_err(|e| invalid(KEY_ARCHIVE_SIZE, format!("not an unsigned integer: {e}")))?;

    let version = required(KEY_VERSION)?
        .parse()
        .map_err(|e| invalid(KEY_VERSION, format!("{e}")))?;

    let archive_hash = ArchiveHash::new(required(KEY_HASH_ALGORITHM)?, required(KEY_HASH_VALUE)?)
        .map_err(|e| invalid(KEY_HASH_VALUE, format!("{e}")))?;

    let configuration = required(KEY_CONFIGURATION)?
        .parse()
        .map_err(|e| invalid(KEY_CONFIGURATION, format!("{e}")))?;

    let tags: BTreeSet<String> = required(KEY_TAGS)?
        .split_whitespace()
        .map(str::to_string)
        .collect();

    let build = match (fields.get(KEY_BUILD_NUMBER), fields.get(KEY_BUILD_TIME)) {
        (None, None) => None,
        (Some(number), Some(time)) => {
            let timestamp = DateTime::parse_from_rfc3339(time)
                .map_err(|e| invalid(KEY_BUILD_TIME, format!("not an ISO-8601 datetime: {e}")))?;
            Some(
                BuildInfo::new(*number, timestamp)
                    .map_err(|e| invalid(KEY_BUILD_NUMBER, format!("{e}")))?,
            )
        }
        (Some(_), None) => {
            return Err(invalid(KEY_BUILD_TIME, "missing alongside build-number".into()))
        }
        (None, Some(_)) => {
            return Err(invalid(
                KEY_BUILD_NUMBER,
                "missing alongside build-time".into(),
            ))
        }
    };

    RuntimeDescriptor::new(
        required(KEY_REPOSITORY_URI)?,
        version,
        required(KEY_PLATFORM)?,
        required(KEY_ARCHITECTURE)?,
        required(KEY_VM)?,
        configuration,
        required(KEY_ARCHIVE_URI)?,
        archive_size,
        archive_hash,
        tags,
        build,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Configuration;
    use chrono::FixedOffset;
    use pretty_assertions::assert_eq;

    fn sample() -> RuntimeDescriptor {
        let timestamp = DateTime::parse_from_rfc3339("2024-01-16T10:15:30+01:00").unwrap();
        RuntimeDescriptor::new(
            "https://builds.example.com/temurin",
            "21.0.2+13".parse().unwrap(),
            "linux",
            "x64",
            "hotspot",
            Configuration::Jdk,
            "https://builds.example.com/temurin/21.tar.gz",
            186113536,
            ArchiveHash::new("SHA-256", "c0ffee42").unwrap(),
            BTreeSet::from(["lts".to_string(), "production".to_string()]),
            Some(BuildInfo::new("13", timestamp).unwrap()),
        )
        .unwrap()
    }

    #[test]
    fn record_round_trips() {
        let descriptor = sample();
        let record = to_record(&descriptor);
        let loaded = from_record(&record).unwrap();
        assert_eq!(loaded, descriptor);
    }

    #[test]
    fn build_time_offset_survives() {
        let record = to_record(&sample());
        let loaded = from_record(&record).unwrap();
        let ts = loaded.build().unwrap().timestamp();
        assert_eq!(ts.offset(), &FixedOffset::east_opt(3600).unwrap());
    }

    #[test]
    fn missing_required_key_names_the_key() {
        let record: String = to_record(&sample())
            .lines()
            .filter(|l| !l.starts_with("platform="))
            .map(|l| format!("{l}\n"))
            .collect();

        match from_record(&record) {
            Err(Error::MetadataField { key, .. }) => assert_eq!(key, "platform"),
            other => panic!("expected MetadataField error, got {other:?}"),
        }
    }

    #[test]
    fn unparsable_size_names_the_key() {
        let record = to_record(&sample()).replace("archive-size=186113536", "archive-size=huge");
        match from_record(&record) {
            Err(Error::MetadataField { key, .. }) => assert_eq!(key, "archive-size"),
            other => panic!("expected MetadataField error, got {other:?}"),
        }
    }

    #[test]
    fn build_number_without_time_is_rejected() {
        let record = to_record(&sample())
            .lines()
            .filter(|l| !l.starts_with("build-time="))
            .map(|l| format!("{l}\n"))
            .collect::<String>();
        assert!(matches!(
            from_record(&record),
            Err(Error::MetadataField { .. })
        ));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut record = to_record(&sample());
        record.push_str("x-vendor-note=keep calm\n");
        assert!(from_record(&record).is_ok());
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let record = format!("# generated by dukebox\n\n{}", to_record(&sample()));
        assert!(from_record(&record).is_ok());
    }
}
