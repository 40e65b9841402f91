//! End-to-end inventory behavior against a real temporary directory.

use std::collections::BTreeSet;
use std::io::{Cursor, Write};

use pretty_assertions::assert_eq;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use dukebox_core::inventory::{Inventory, InventoryEvent, UnpackOptions};
use dukebox_core::{ArchiveHash, CancelFlag, Configuration, Error, RuntimeDescriptor, SearchCriteria};

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn descriptor_for(payload: &[u8], uri: &str) -> RuntimeDescriptor {
    RuntimeDescriptor::new(
        "https://builds.example.com/temurin",
        "21.0.2".parse().unwrap(),
        "linux",
        "x64",
        "hotspot",
        Configuration::Jdk,
        uri,
        payload.len() as u64,
        ArchiveHash::new("SHA-256", sha256_hex(payload)).unwrap(),
        BTreeSet::from(["production".to_string()]),
        None,
    )
    .unwrap()
}

fn tar_with_file(name: &str, content: &[u8], mode: u32) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(mode);
    header.set_cksum();
    builder.append_data(&mut header, name, content).unwrap();
    builder.into_inner().unwrap()
}

fn zip_with_file(name: &str, content: &[u8], mode: u32) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(mode);
    writer.start_file(name, options).unwrap();
    writer.write_all(content).unwrap();
    writer.finish().unwrap().into_inner()
}

// One basic header block: magic, little-endian size, payload, CRC32,
// and an empty extended-header chain.
fn arj_block(body: &[u8]) -> Vec<u8> {
    let mut out = vec![0x60, 0xea];
    out.extend((body.len() as u16).to_le_bytes());
    out.extend_from_slice(body);
    let mut crc = flate2::Crc::new();
    crc.update(body);
    out.extend(crc.sum().to_le_bytes());
    out.extend(0u16.to_le_bytes());
    out
}

fn arj_with_file(name: &str, content: &[u8], method: u8, mode: u16) -> Vec<u8> {
    let mut main = vec![0u8; 30];
    main[0] = 30; // first header size
    main[3] = 2; // unix host
    main[6] = 2; // archive header
    main.extend_from_slice(b"test.arj\0\0");
    let mut bytes = arj_block(&main);

    let mut local = vec![0u8; 30];
    local[0] = 30;
    local[3] = 2; // unix host
    local[5] = method;
    local[12..16].copy_from_slice(&(content.len() as u32).to_le_bytes());
    local[16..20].copy_from_slice(&(content.len() as u32).to_le_bytes());
    local[26..28].copy_from_slice(&mode.to_le_bytes());
    local.extend_from_slice(name.as_bytes());
    local.extend_from_slice(b"\0\0");
    bytes.extend(arj_block(&local));
    bytes.extend_from_slice(content);

    // End-of-archive marker: a zero-size header block.
    bytes.extend([0x60, 0xea, 0, 0]);
    bytes
}

#[test]
fn write_then_read_back_round_trip() {
    let temp = TempDir::new().unwrap();
    let inventory = Inventory::open(temp.path()).unwrap();

    let payload = b"pretend this is a runtime archive".to_vec();
    let descriptor = descriptor_for(&payload, "https://x/runtime.bin");

    let path = inventory
        .write(&descriptor, &mut Cursor::new(&payload))
        .unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), payload);

    assert_eq!(
        inventory.path_of(descriptor.id()).unwrap(),
        Some(path.clone())
    );
    assert!(inventory.verify(descriptor.id()).unwrap());

    // A fresh instance over the same root sees the committed entry.
    let reopened = Inventory::open(temp.path()).unwrap();
    let found = reopened.search(&SearchCriteria::any());
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), descriptor.id());
}

#[test]
fn hash_mismatch_commits_nothing() {
    let temp = TempDir::new().unwrap();
    let inventory = Inventory::open(temp.path()).unwrap();

    let payload = b"expected bytes".to_vec();
    let descriptor = descriptor_for(&payload, "https://x/runtime.bin");

    let result = inventory.write(&descriptor, &mut Cursor::new(b"tampered bytes".to_vec()));
    assert!(matches!(result, Err(Error::VerificationFailed { .. })));

    assert_eq!(inventory.path_of(descriptor.id()).unwrap(), None);
    assert!(inventory.search(&SearchCriteria::any()).is_empty());
    // No temporary leftovers either.
    let entry_dir = temp.path().join(descriptor.id());
    if entry_dir.exists() {
        let names: Vec<String> = std::fs::read_dir(&entry_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["lock".to_string()]);
    }
}

#[test]
fn corrupt_entry_is_excluded_but_scan_continues() {
    let temp = TempDir::new().unwrap();
    {
        let inventory = Inventory::open(temp.path()).unwrap();
        let good = b"good archive".to_vec();
        inventory
            .write(&descriptor_for(&good, "https://x/good.bin"), &mut Cursor::new(&good))
            .unwrap();
    }

    // Hand-craft a second entry with a mangled metadata record.
    let bad_dir = temp.path().join("deadbeef");
    std::fs::create_dir(&bad_dir).unwrap();
    std::fs::write(bad_dir.join("archive"), b"whatever").unwrap();
    std::fs::write(bad_dir.join("meta.properties"), "format-version=1\n").unwrap();

    let inventory = Inventory::new(temp.path()).unwrap();
    let mut events = inventory.subscribe();
    inventory.load().unwrap();

    let found = inventory.search(&SearchCriteria::any());
    assert_eq!(found.len(), 1);

    // Exactly one corruption notice for the bad entry.
    let mut corrupt = 0;
    while let Ok(event) = events.try_recv() {
        if let InventoryEvent::CorruptMetadata { path, .. } = event {
            assert_eq!(path, bad_dir);
            corrupt += 1;
        }
    }
    assert_eq!(corrupt, 1);

    // The corrupt entry's files were left in place for inspection.
    assert!(bad_dir.join("archive").exists());
}

#[test]
fn delete_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let inventory = Inventory::open(temp.path()).unwrap();

    let payload = b"short lived".to_vec();
    let descriptor = descriptor_for(&payload, "https://x/runtime.bin");
    inventory
        .write(&descriptor, &mut Cursor::new(&payload))
        .unwrap();

    inventory.delete(descriptor.id()).unwrap();
    assert!(!temp.path().join(descriptor.id()).exists());
    assert_eq!(inventory.path_of(descriptor.id()).unwrap(), None);

    // Second delete of the same id succeeds quietly.
    inventory.delete(descriptor.id()).unwrap();
    // As does deleting something that never existed.
    inventory.delete("cafebabe").unwrap();
}

#[test]
fn verify_unknown_id_is_not_found() {
    let temp = TempDir::new().unwrap();
    let inventory = Inventory::open(temp.path()).unwrap();
    assert!(matches!(
        inventory.verify("cafebabe"),
        Err(Error::NotFound { .. })
    ));
}

#[test]
fn verify_detects_bit_rot() {
    let temp = TempDir::new().unwrap();
    let inventory = Inventory::open(temp.path()).unwrap();

    let payload = b"originally correct".to_vec();
    let descriptor = descriptor_for(&payload, "https://x/runtime.bin");
    let path = inventory
        .write(&descriptor, &mut Cursor::new(&payload))
        .unwrap();
    assert!(inventory.verify(descriptor.id()).unwrap());

    std::fs::write(&path, b"silently flipped").unwrap();
    assert!(!inventory.verify(descriptor.id()).unwrap());
}

#[test]
fn unpack_extracts_a_tar_archive() {
    let temp = TempDir::new().unwrap();
    let inventory = Inventory::open(temp.path()).unwrap();

    let archive = tar_with_file("jdk-21/bin/java", b"#!/bin/sh\n", 0o755);
    let descriptor = descriptor_for(&archive, "https://x/runtime.tar");
    inventory
        .write(&descriptor, &mut Cursor::new(&archive))
        .unwrap();

    let dest = TempDir::new().unwrap();
    inventory
        .unpack(
            descriptor.id(),
            dest.path(),
            &CancelFlag::new(),
            UnpackOptions::default(),
        )
        .unwrap();
    assert!(dest.path().join("jdk-21/bin/java").is_file());
}

#[test]
fn unpack_can_strip_the_leading_directory() {
    let temp = TempDir::new().unwrap();
    let inventory = Inventory::open(temp.path()).unwrap();

    let archive = tar_with_file("jdk-21/release", b"JAVA_VERSION=\"21\"\n", 0o644);
    let descriptor = descriptor_for(&archive, "https://x/runtime.tar");
    inventory
        .write(&descriptor, &mut Cursor::new(&archive))
        .unwrap();

    let dest = TempDir::new().unwrap();
    let options = UnpackOptions {
        strip_leading_directory: true,
        ..Default::default()
    };
    inventory
        .unpack(descriptor.id(), dest.path(), &CancelFlag::new(), options)
        .unwrap();
    assert!(dest.path().join("release").is_file());
    assert!(!dest.path().join("jdk-21").exists());
}

#[test]
fn cancelled_unpack_reports_cancellation() {
    let temp = TempDir::new().unwrap();
    let inventory = Inventory::open(temp.path()).unwrap();

    let archive = tar_with_file("jdk-21/release", b"JAVA_VERSION=\"21\"\n", 0o644);
    let descriptor = descriptor_for(&archive, "https://x/runtime.tar");
    inventory
        .write(&descriptor, &mut Cursor::new(&archive))
        .unwrap();

    let cancel = CancelFlag::new();
    cancel.cancel();
    let dest = TempDir::new().unwrap();
    let result = inventory.unpack(
        descriptor.id(),
        dest.path(),
        &cancel,
        UnpackOptions::default(),
    );
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[test]
fn unpack_extracts_a_zip_archive_without_applying_modes() {
    let temp = TempDir::new().unwrap();
    let inventory = Inventory::open(temp.path()).unwrap();

    let archive = zip_with_file("jdk-21/bin/java", b"#!/bin/sh\n", 0o777);
    let descriptor = descriptor_for(&archive, "https://x/runtime.zip");
    inventory
        .write(&descriptor, &mut Cursor::new(&archive))
        .unwrap();

    let dest = TempDir::new().unwrap();
    inventory
        .unpack(
            descriptor.id(),
            dest.path(),
            &CancelFlag::new(),
            UnpackOptions::default(),
        )
        .unwrap();
    let extracted = dest.path().join("jdk-21/bin/java");
    assert_eq!(std::fs::read(&extracted).unwrap(), b"#!/bin/sh\n");

    // Zip containers carry no trusted permission metadata; the stored
    // 0o777 must not end up on disk.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&extracted).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0);
    }
}

#[cfg(unix)]
#[test]
fn unpack_strips_group_and_other_write_bits() {
    use std::os::unix::fs::PermissionsExt;

    let temp = TempDir::new().unwrap();
    let inventory = Inventory::open(temp.path()).unwrap();

    let archive = tar_with_file("jdk-21/release", b"JAVA_VERSION=\"21\"\n", 0o666);
    let descriptor = descriptor_for(&archive, "https://x/runtime.tar");
    inventory
        .write(&descriptor, &mut Cursor::new(&archive))
        .unwrap();

    let dest = TempDir::new().unwrap();
    let options = UnpackOptions {
        strip_non_owner_writable: true,
        ..Default::default()
    };
    inventory
        .unpack(descriptor.id(), dest.path(), &CancelFlag::new(), options)
        .unwrap();

    let mode = std::fs::metadata(dest.path().join("jdk-21/release"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o022, 0);
    // The owner's write bit survives.
    assert_ne!(mode & 0o200, 0);
}

#[test]
fn unpack_extracts_a_stored_arj_archive() {
    let temp = TempDir::new().unwrap();
    let inventory = Inventory::open(temp.path()).unwrap();

    let archive = arj_with_file("jdk-21/bin/java", b"#!/bin/sh\n", 0, 0o755);
    let descriptor = descriptor_for(&archive, "https://x/runtime.arj");
    inventory
        .write(&descriptor, &mut Cursor::new(&archive))
        .unwrap();

    let dest = TempDir::new().unwrap();
    inventory
        .unpack(
            descriptor.id(),
            dest.path(),
            &CancelFlag::new(),
            UnpackOptions::default(),
        )
        .unwrap();
    let extracted = dest.path().join("jdk-21/bin/java");
    assert_eq!(std::fs::read(&extracted).unwrap(), b"#!/bin/sh\n");

    // Unix-host arj entries carry POSIX modes that do get applied.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&extracted).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}

#[test]
fn compressed_arj_entries_are_rejected() {
    let temp = TempDir::new().unwrap();
    let inventory = Inventory::open(temp.path()).unwrap();

    // Method 1 is "compressed most"; only stored (0) is readable.
    let archive = arj_with_file("jdk-21/release", b"JAVA_VERSION=\"21\"\n", 1, 0o644);
    let descriptor = descriptor_for(&archive, "https://x/runtime.arj");
    inventory
        .write(&descriptor, &mut Cursor::new(&archive))
        .unwrap();

    let dest = TempDir::new().unwrap();
    let result = inventory.unpack(
        descriptor.id(),
        dest.path(),
        &CancelFlag::new(),
        UnpackOptions::default(),
    );
    assert!(matches!(result, Err(Error::UnsupportedArchive { .. })));
}

#[test]
fn version_range_search_over_stored_entries() {
    let temp = TempDir::new().unwrap();
    let inventory = Inventory::open(temp.path()).unwrap();

    for major in [8u64, 9, 10, 11] {
        let payload = format!("runtime for major {major}").into_bytes();
        let descriptor = RuntimeDescriptor::new(
            "https://builds.example.com/temurin",
            dukebox_core::RuntimeVersion::from_parts(major, 0, 0, None),
            "linux",
            "x64",
            "hotspot",
            Configuration::Jdk,
            format!("https://x/jdk-{major}.bin"),
            payload.len() as u64,
            ArchiveHash::new("SHA-256", sha256_hex(&payload)).unwrap(),
            BTreeSet::new(),
            None,
        )
        .unwrap();
        inventory
            .write(&descriptor, &mut Cursor::new(payload))
            .unwrap();
    }

    let mut criteria = SearchCriteria::any();
    criteria.version = Some(
        dukebox_core::VersionRange::half_open("8".parse().unwrap(), "11".parse().unwrap())
            .unwrap(),
    );
    let found = inventory.search(&criteria);
    let mut majors: Vec<String> = found
        .iter()
        .map(|d| d.version().major().to_string())
        .collect();
    majors.sort();
    assert_eq!(majors, vec!["10", "8", "9"]);
}

#[test]
fn concurrent_writers_to_the_same_id_serialize() {
    let temp = TempDir::new().unwrap();
    let inventory = Inventory::open(temp.path()).unwrap();

    let payload = std::iter::repeat(0xabu8).take(256 * 1024).collect::<Vec<_>>();
    let descriptor = descriptor_for(&payload, "https://x/runtime.bin");

    let mut handles = Vec::new();
    for _ in 0..4 {
        let inventory = inventory.clone();
        let descriptor = descriptor.clone();
        let payload = payload.clone();
        handles.push(std::thread::spawn(move || {
            inventory.write(&descriptor, &mut Cursor::new(payload))
        }));
    }

    for handle in handles {
        // Every writer streamed the same verified bytes, so each one
        // commits (or overwrites with) an identical archive.
        handle.join().unwrap().unwrap();
    }

    assert!(inventory.verify(descriptor.id()).unwrap());
    assert_eq!(inventory.search(&SearchCriteria::any()).len(), 1);
}
