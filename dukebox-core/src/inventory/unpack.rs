//! Archive extraction.
//!
//! The committed payload carries no file extension, so the container
//! format is detected from its leading bytes (with the descriptor's
//! archive URI as a tie-breaker between zip and jar). Permission handling
//! is capability-based per container kind rather than per entry type:
//! tar, jar, ar, cpio and arj expose POSIX mode bits, zip and 7z do not.
//! ARJ extraction covers stored (method 0) entries only; compressed
//! methods fail.
//!
//! Cancellation is polled between entries. Unpack is not transactional:
//! a cancelled or failed extraction leaves what was already written.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::cancel::CancelFlag;
use crate::error::{Error, Result};

/// Recognized container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
    Zip,
    Jar,
    Ar,
    Cpio,
    SevenZ,
    Arj,
}

impl ArchiveKind {
    /// Whether this container records POSIX permission bits for its
    /// entries.
    pub fn permissions_available(self) -> bool {
        match self {
            ArchiveKind::Tar | ArchiveKind::TarGz => true,
            ArchiveKind::Jar => true,
            ArchiveKind::Ar | ArchiveKind::Cpio | ArchiveKind::Arj => true,
            ArchiveKind::Zip | ArchiveKind::SevenZ => false,
        }
    }

    /// Sniffs the container format from the payload's leading bytes.
    /// `uri_hint` distinguishes a jar from a plain zip.
    pub fn detect(path: &Path, uri_hint: Option<&str>) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mut head = [0u8; 512];
        let mut filled = 0;
        while filled < head.len() {
            let n = file
                .read(&mut head[filled..])
                .map_err(|e| Error::io(path, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Self::from_magic(&head[..filled], uri_hint).ok_or_else(|| Error::UnsupportedArchive {
            detail: format!("unrecognized container signature in {}", path.display()),
        })
    }

    fn from_magic(head: &[u8], uri_hint: Option<&str>) -> Option<Self> {
        let jar_hint = uri_hint
            .map(|u| u.rsplit('/').next().unwrap_or(u).ends_with(".jar"))
            .unwrap_or(false);

        if head.starts_with(&[0x1f, 0x8b]) {
            return Some(ArchiveKind::TarGz);
        }
        if head.starts_with(b"PK\x03\x04") {
            return Some(if jar_hint {
                ArchiveKind::Jar
            } else {
                ArchiveKind::Zip
            });
        }
        if head.starts_with(&[0x37, 0x7a, 0xbc, 0xaf, 0x27, 0x1c]) {
            return Some(ArchiveKind::SevenZ);
        }
        if head.starts_with(b"!<arch>\n") {
            return Some(ArchiveKind::Ar);
        }
        if head.starts_with(b"070701") || head.starts_with(b"070702") || head.starts_with(b"070707")
        {
            return Some(ArchiveKind::Cpio);
        }
        if head.starts_with(&[0x60, 0xea]) {
            return Some(ArchiveKind::Arj);
        }
        // The tar magic sits at offset 257 in the first header block.
        if head.len() >= 262 && &head[257..262] == b"ustar" {
            return Some(ArchiveKind::Tar);
        }
        None
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArchiveKind::Tar => "tar",
            ArchiveKind::TarGz => "tar.gz",
            ArchiveKind::Zip => "zip",
            ArchiveKind::Jar => "jar",
            ArchiveKind::Ar => "ar",
            ArchiveKind::Cpio => "cpio",
            ArchiveKind::SevenZ => "7z",
            ArchiveKind::Arj => "arj",
        };
        f.write_str(name)
    }
}

/// Extraction options.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnpackOptions {
    /// Drop each entry's first path segment (the conventional
    /// `jdk-21.0.2+13/` wrapper directory).
    pub strip_leading_directory: bool,
    /// On POSIX targets, clear group/other write bits on everything
    /// extracted.
    pub strip_non_owner_writable: bool,
}

pub(crate) fn extract(
    kind: ArchiveKind,
    archive: &Path,
    destination: &Path,
    cancel: &CancelFlag,
    options: UnpackOptions,
) -> Result<()> {
    fs::create_dir_all(destination).map_err(|e| Error::io(destination, e))?;

    let mut extracted: Vec<PathBuf> = Vec::new();
    match kind {
        ArchiveKind::Tar => {
            let file = File::open(archive).map_err(|e| Error::io(archive, e))?;
            extract_tar(file, destination, cancel, options, &mut extracted)?
        }
        ArchiveKind::TarGz => {
            let file = File::open(archive).map_err(|e| Error::io(archive, e))?;
            let decoder = flate2::read::GzDecoder::new(file);
            extract_tar(decoder, destination, cancel, options, &mut extracted)?
        }
        ArchiveKind::Zip | ArchiveKind::Jar => {
            extract_zip(kind, archive, destination, cancel, options, &mut extracted)?
        }
        ArchiveKind::SevenZ => {
            extract_seven_z(archive, destination, cancel, options, &mut extracted)?
        }
        ArchiveKind::Ar => extract_ar(archive, destination, cancel, options, &mut extracted)?,
        ArchiveKind::Cpio => extract_cpio(archive, destination, cancel, options, &mut extracted)?,
        ArchiveKind::Arj => extract_arj(archive, destination, cancel, options, &mut extracted)?,
    }

    if options.strip_non_owner_writable {
        strip_group_other_write(&extracted)?;
    }
    debug!(entries = extracted.len(), kind = %kind, "unpack complete");
    Ok(())
}

/// Maps an archive-relative entry path to its extraction target,
/// applying the leading-directory strip. Absolute paths and `..`
/// traversal are rejected; `None` means the entry vanishes entirely
/// under stripping (e.g. the wrapper directory itself).
fn entry_target(destination: &Path, raw: &Path, options: UnpackOptions) -> Result<Option<PathBuf>> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in raw.components() {
        match component {
            Component::Normal(p) => parts.push(p),
            Component::CurDir => {}
            _ => {
                return Err(Error::Unpack {
                    detail: format!("unsafe entry path '{}'", raw.display()),
                })
            }
        }
    }

    let skip = usize::from(options.strip_leading_directory);
    if parts.len() <= skip {
        return Ok(None);
    }
    let mut target = destination.to_path_buf();
    for part in &parts[skip..] {
        target.push(part);
    }
    Ok(Some(target))
}

fn write_entry_file(target: &Path, reader: &mut dyn Read) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    let mut out = File::create(target).map_err(|e| Error::io(target, e))?;
    io::copy(reader, &mut out).map_err(|e| Error::io(target, e))?;
    Ok(())
}

#[cfg(unix)]
fn apply_mode(target: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(target, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|e| Error::io(target, e))
}

#[cfg(not(unix))]
fn apply_mode(_target: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn strip_group_other_write(extracted: &[PathBuf]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    for path in extracted {
        let meta = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if meta.file_type().is_symlink() {
            continue;
        }
        let mode = meta.permissions().mode();
        let stripped = mode & !0o022;
        if stripped != mode {
            fs::set_permissions(path, fs::Permissions::from_mode(stripped & 0o7777))
                .map_err(|e| Error::io(path, e))?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn strip_group_other_write(_extracted: &[PathBuf]) -> Result<()> {
    Ok(())
}

fn extract_tar<R: Read>(
    reader: R,
    destination: &Path,
    cancel: &CancelFlag,
    options: UnpackOptions,
    extracted: &mut Vec<PathBuf>,
) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    let entries = archive.entries().map_err(|e| Error::Unpack {
        detail: format!("reading tar entries: {e}"),
    })?;
    for entry in entries {
        cancel.check()?;
        let mut entry = entry.map_err(|e| Error::Unpack {
            detail: format!("reading tar entry: {e}"),
        })?;
        let raw = entry
            .path()
            .map_err(|e| Error::Unpack {
                detail: format!("tar entry path: {e}"),
            })?
            .into_owned();
        let Some(target) = entry_target(destination, &raw, options)? else {
            continue;
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        entry.unpack(&target).map_err(|e| Error::Unpack {
            detail: format!("unpacking '{}': {e}", raw.display()),
        })?;
        extracted.push(target);
    }
    Ok(())
}

fn extract_zip(
    kind: ArchiveKind,
    archive_path: &Path,
    destination: &Path,
    cancel: &CancelFlag,
    options: UnpackOptions,
    extracted: &mut Vec<PathBuf>,
) -> Result<()> {
    let file = File::open(archive_path).map_err(|e| Error::io(archive_path, e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| Error::Unpack {
        detail: format!("reading zip central directory: {e}"),
    })?;

    for i in 0..archive.len() {
        cancel.check()?;
        let mut entry = archive.by_index(i).map_err(|e| Error::Unpack {
            detail: format!("reading zip entry {i}: {e}"),
        })?;
        let Some(raw) = entry.enclosed_name() else {
            return Err(Error::Unpack {
                detail: format!("unsafe entry path '{}'", entry.name()),
            });
        };
        let Some(target) = entry_target(destination, &raw, options)? else {
            continue;
        };

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| Error::io(&target, e))?;
        } else {
            write_entry_file(&target, &mut entry)?;
        }
        // Jars carry usable mode bits in the unix extra field; plain
        // zips are treated as having no permission metadata.
        if kind.permissions_available() {
            if let Some(mode) = entry.unix_mode() {
                apply_mode(&target, mode)?;
            }
        }
        extracted.push(target);
    }
    Ok(())
}

fn extract_seven_z(
    archive_path: &Path,
    destination: &Path,
    cancel: &CancelFlag,
    options: UnpackOptions,
    extracted: &mut Vec<PathBuf>,
) -> Result<()> {
    let mut reader = sevenz_rust::SevenZReader::open(archive_path, sevenz_rust::Password::empty())
        .map_err(|e| Error::Unpack {
            detail: format!("reading 7z archive: {e}"),
        })?;

    let mut failure: Option<Error> = None;
    reader
        .for_each_entries(|entry, entry_reader| {
            if cancel.is_cancelled() {
                failure = Some(Error::Cancelled);
                return Ok(false);
            }
            let raw = PathBuf::from(entry.name());
            let target = match entry_target(destination, &raw, options) {
                Ok(Some(target)) => target,
                Ok(None) => {
                    // Skipped entries still need their stream drained.
                    let _ = io::copy(entry_reader, &mut io::sink());
                    return Ok(true);
                }
                Err(e) => {
                    failure = Some(e);
                    return Ok(false);
                }
            };

            let result = if entry.is_directory() {
                fs::create_dir_all(&target).map_err(|e| Error::io(&target, e))
            } else {
                write_entry_file(&target, entry_reader)
            };
            match result {
                Ok(()) => {
                    extracted.push(target);
                    Ok(true)
                }
                Err(e) => {
                    failure = Some(e);
                    Ok(false)
                }
            }
        })
        .map_err(|e| Error::Unpack {
            detail: format!("reading 7z entries: {e}"),
        })?;

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn extract_ar(
    archive_path: &Path,
    destination: &Path,
    cancel: &CancelFlag,
    options: UnpackOptions,
    extracted: &mut Vec<PathBuf>,
) -> Result<()> {
    let file = File::open(archive_path).map_err(|e| Error::io(archive_path, e))?;
    let mut archive = ar::Archive::new(file);
    while let Some(entry) = archive.next_entry() {
        cancel.check()?;
        let mut entry = entry.map_err(|e| Error::Unpack {
            detail: format!("reading ar entry: {e}"),
        })?;
        let name = String::from_utf8_lossy(entry.header().identifier()).into_owned();
        let mode = entry.header().mode();
        let Some(target) = entry_target(destination, Path::new(&name), options)? else {
            continue;
        };
        write_entry_file(&target, &mut entry)?;
        apply_mode(&target, mode)?;
        extracted.push(target);
    }
    Ok(())
}

const CPIO_TYPE_MASK: u32 = 0o170000;
const CPIO_TYPE_DIR: u32 = 0o040000;
const CPIO_TYPE_FILE: u32 = 0o100000;
const CPIO_TYPE_SYMLINK: u32 = 0o120000;

fn extract_cpio(
    archive_path: &Path,
    destination: &Path,
    cancel: &CancelFlag,
    options: UnpackOptions,
    extracted: &mut Vec<PathBuf>,
) -> Result<()> {
    let file = File::open(archive_path).map_err(|e| Error::io(archive_path, e))?;
    let mut input: Box<dyn Read> = Box::new(file);
    loop {
        cancel.check()?;
        let mut reader = cpio::newc::Reader::new(input).map_err(|e| Error::Unpack {
            detail: format!("reading cpio header: {e}"),
        })?;
        let entry = reader.entry();
        if entry.is_trailer() {
            break;
        }
        let name = entry.name().to_string();
        let mode = entry.mode();

        let target = entry_target(destination, Path::new(&name), options)?;
        if let Some(target) = target {
            match mode & CPIO_TYPE_MASK {
                CPIO_TYPE_DIR => {
                    fs::create_dir_all(&target).map_err(|e| Error::io(&target, e))?;
                    apply_mode(&target, mode)?;
                    extracted.push(target);
                }
                CPIO_TYPE_FILE => {
                    write_entry_file(&target, &mut reader)?;
                    apply_mode(&target, mode)?;
                    extracted.push(target);
                }
                CPIO_TYPE_SYMLINK => {
                    extract_symlink(&mut reader, &target)?;
                    extracted.push(target);
                }
                other => {
                    debug!(name, file_type = other, "skipping special cpio entry");
                }
            }
        }

        input = reader.finish().map_err(|e| Error::Unpack {
            detail: format!("advancing cpio stream: {e}"),
        })?;
    }
    Ok(())
}

const ARJ_MAGIC: [u8; 2] = [0x60, 0xea];
// The format caps the basic header at 2600 bytes.
const ARJ_MAX_HEADER: u16 = 2600;
const ARJ_METHOD_STORED: u8 = 0;
const ARJ_TYPE_DIRECTORY: u8 = 3;
const ARJ_HOST_UNIX: u8 = 2;
const ARJ_FLAG_GARBLED: u8 = 0x01;

struct ArjHeader {
    flags: u8,
    method: u8,
    file_type: u8,
    host_os: u8,
    compressed_size: u64,
    mode: u32,
    name: String,
}

/// Reads one basic header block: magic, size, payload, CRC32, then any
/// extended headers. A zero-size block is the end-of-archive marker and
/// yields `None`.
fn read_arj_header(input: &mut dyn Read, archive_path: &Path) -> Result<Option<ArjHeader>> {
    let mut word = [0u8; 2];
    input
        .read_exact(&mut word)
        .map_err(|e| Error::io(archive_path, e))?;
    if word != ARJ_MAGIC {
        return Err(Error::Unpack {
            detail: "bad arj header magic".into(),
        });
    }
    input
        .read_exact(&mut word)
        .map_err(|e| Error::io(archive_path, e))?;
    let size = u16::from_le_bytes(word);
    if size == 0 {
        return Ok(None);
    }
    if size > ARJ_MAX_HEADER {
        return Err(Error::Unpack {
            detail: format!("oversized arj header ({size} bytes)"),
        });
    }

    let mut header = vec![0u8; size as usize];
    input
        .read_exact(&mut header)
        .map_err(|e| Error::io(archive_path, e))?;
    let mut crc_word = [0u8; 4];
    input
        .read_exact(&mut crc_word)
        .map_err(|e| Error::io(archive_path, e))?;
    let mut crc = flate2::Crc::new();
    crc.update(&header);
    if crc.sum() != u32::from_le_bytes(crc_word) {
        return Err(Error::Unpack {
            detail: "arj header checksum mismatch".into(),
        });
    }

    // Extended headers carry a trailing CRC32 of their own.
    loop {
        input
            .read_exact(&mut word)
            .map_err(|e| Error::io(archive_path, e))?;
        let ext = u16::from_le_bytes(word);
        if ext == 0 {
            break;
        }
        io::copy(&mut (&mut *input).take(u64::from(ext) + 4), &mut io::sink())
            .map_err(|e| Error::io(archive_path, e))?;
    }

    let first = header[0] as usize;
    if header.len() < 30 || first < 30 || first > header.len() {
        return Err(Error::Unpack {
            detail: "truncated arj header".into(),
        });
    }
    let name_end = header[first..]
        .iter()
        .position(|&b| b == 0)
        .map(|i| first + i)
        .ok_or_else(|| Error::Unpack {
            detail: "unterminated arj entry name".into(),
        })?;
    let name = String::from_utf8_lossy(&header[first..name_end]).replace('\\', "/");

    let compressed = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
    let mode = u16::from_le_bytes([header[26], header[27]]);
    Ok(Some(ArjHeader {
        flags: header[4],
        method: header[5],
        file_type: header[6],
        host_os: header[3],
        compressed_size: u64::from(compressed),
        mode: u32::from(mode),
        name,
    }))
}

fn extract_arj(
    archive_path: &Path,
    destination: &Path,
    cancel: &CancelFlag,
    options: UnpackOptions,
    extracted: &mut Vec<PathBuf>,
) -> Result<()> {
    let file = File::open(archive_path).map_err(|e| Error::io(archive_path, e))?;
    let mut input = io::BufReader::new(file);

    // The first block is the archive header; it carries no payload.
    let Some(main) = read_arj_header(&mut input, archive_path)? else {
        return Ok(());
    };
    if main.flags & ARJ_FLAG_GARBLED != 0 {
        return Err(Error::UnsupportedArchive {
            detail: "encrypted arj archives cannot be extracted".into(),
        });
    }

    while let Some(header) = read_arj_header(&mut input, archive_path)? {
        cancel.check()?;
        if header.flags & ARJ_FLAG_GARBLED != 0 {
            return Err(Error::UnsupportedArchive {
                detail: format!("arj entry '{}' is encrypted", header.name),
            });
        }
        if header.file_type != ARJ_TYPE_DIRECTORY && header.method != ARJ_METHOD_STORED {
            return Err(Error::UnsupportedArchive {
                detail: format!(
                    "arj entry '{}' uses compression method {}; only stored entries can be extracted",
                    header.name, header.method
                ),
            });
        }

        let mut payload = (&mut input).take(header.compressed_size);
        match entry_target(destination, Path::new(&header.name), options)? {
            None => {
                io::copy(&mut payload, &mut io::sink())
                    .map_err(|e| Error::io(archive_path, e))?;
            }
            Some(target) => {
                if header.file_type == ARJ_TYPE_DIRECTORY {
                    fs::create_dir_all(&target).map_err(|e| Error::io(&target, e))?;
                    io::copy(&mut payload, &mut io::sink())
                        .map_err(|e| Error::io(archive_path, e))?;
                } else {
                    write_entry_file(&target, &mut payload)?;
                }
                // Only the unix host variant stores POSIX modes; DOS
                // attribute words would be garbage here.
                if header.host_os == ARJ_HOST_UNIX {
                    apply_mode(&target, header.mode)?;
                }
                extracted.push(target);
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn extract_symlink(reader: &mut dyn Read, target: &Path) -> Result<()> {
    let mut link = String::new();
    reader
        .read_to_string(&mut link)
        .map_err(|e| Error::io(target, e))?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    if target.exists() {
        let _ = fs::remove_file(target);
    }
    std::os::unix::fs::symlink(link.trim_end(), target).map_err(|e| Error::io(target, e))
}

#[cfg(not(unix))]
fn extract_symlink(reader: &mut dyn Read, target: &Path) -> Result<()> {
    // No symlinks off POSIX; materialize the link target path as a file.
    write_entry_file(target, reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn magic_detection() {
        let cases: Vec<(Vec<u8>, ArchiveKind)> = vec![
            (vec![0x1f, 0x8b, 0x08], ArchiveKind::TarGz),
            (b"PK\x03\x04rest".to_vec(), ArchiveKind::Zip),
            (vec![0x37, 0x7a, 0xbc, 0xaf, 0x27, 0x1c], ArchiveKind::SevenZ),
            (b"!<arch>\ndebian".to_vec(), ArchiveKind::Ar),
            (b"0707010000".to_vec(), ArchiveKind::Cpio),
            (vec![0x60, 0xea, 0x10], ArchiveKind::Arj),
        ];
        for (head, expected) in cases {
            assert_eq!(ArchiveKind::from_magic(&head, None), Some(expected));
        }
    }

    #[test]
    fn tar_magic_at_offset_257() {
        let mut head = vec![0u8; 512];
        head[257..262].copy_from_slice(b"ustar");
        assert_eq!(ArchiveKind::from_magic(&head, None), Some(ArchiveKind::Tar));
    }

    #[test]
    fn jar_needs_zip_magic_and_uri_hint() {
        let head = b"PK\x03\x04".to_vec();
        assert_eq!(
            ArchiveKind::from_magic(&head, Some("https://x/openjfx.jar")),
            Some(ArchiveKind::Jar)
        );
        assert_eq!(
            ArchiveKind::from_magic(&head, Some("https://x/jdk.zip")),
            Some(ArchiveKind::Zip)
        );
    }

    #[test]
    fn unknown_magic_is_none() {
        assert_eq!(ArchiveKind::from_magic(b"plain text", None), None);
    }

    #[test]
    fn permission_capability_table() {
        assert!(ArchiveKind::Tar.permissions_available());
        assert!(ArchiveKind::TarGz.permissions_available());
        assert!(ArchiveKind::Jar.permissions_available());
        assert!(ArchiveKind::Ar.permissions_available());
        assert!(ArchiveKind::Cpio.permissions_available());
        assert!(ArchiveKind::Arj.permissions_available());
        assert!(!ArchiveKind::Zip.permissions_available());
        assert!(!ArchiveKind::SevenZ.permissions_available());
    }

    #[test]
    fn entry_target_strips_leading_directory() {
        let dest = Path::new("/out");
        let opts = UnpackOptions {
            strip_leading_directory: true,
            ..Default::default()
        };
        let target = entry_target(dest, Path::new("jdk-21/bin/java"), opts)
            .unwrap()
            .unwrap();
        assert_eq!(target, Path::new("/out/bin/java"));

        // The wrapper directory itself disappears.
        assert!(entry_target(dest, Path::new("jdk-21"), opts).unwrap().is_none());
    }

    #[test]
    fn entry_target_rejects_traversal() {
        let dest = Path::new("/out");
        let opts = UnpackOptions::default();
        assert!(entry_target(dest, Path::new("../evil"), opts).is_err());
        assert!(entry_target(dest, Path::new("/etc/passwd"), opts).is_err());
    }
}
