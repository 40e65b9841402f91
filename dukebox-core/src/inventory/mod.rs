//! The inventory - a durable, verified, content-addressed store of
//! runtime archives.
//!
//! On disk, one directory per descriptor id:
//!
//! ```text
//! <root>/<id>/lock
//! <root>/<id>/archive
//! <root>/<id>/meta.properties
//! ```
//!
//! Writes stream through a running digest into `archive.tmp` and are
//! renamed into place only after the digest matches the descriptor's
//! declared hash; the metadata record follows the same tmp+rename
//! protocol and is written only after the archive is committed, so a
//! crash between the two never leaves a verified-but-undescribed archive
//! claiming success. No partial state is ever externally visible.

mod hash;
mod lock;
mod meta;
mod unpack;

pub use lock::EntryLock;
pub use unpack::{ArchiveKind, UnpackOptions};

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cancel::CancelFlag;
use crate::descriptor::RuntimeDescriptor;
use crate::error::{Error, Result};
use crate::search::{self, SearchCriteria};

const ARCHIVE_FILE: &str = "archive";
const TMP_SUFFIX: &str = ".tmp";

/// Lifecycle notifications published by an inventory.
#[derive(Debug, Clone)]
pub enum InventoryEvent {
    /// An entry was committed (or discovered during a scan).
    Loaded { descriptor: RuntimeDescriptor },
    /// An entry was removed.
    Deleted { id: String },
    /// An on-disk entry's metadata could not be loaded; the entry was
    /// excluded from the index but its files were left alone.
    CorruptMetadata { path: PathBuf, message: String },
}

struct Inner {
    root: PathBuf,
    index: Mutex<HashMap<String, RuntimeDescriptor>>,
    events: broadcast::Sender<InventoryEvent>,
}

/// The content-addressed store. Cheap to clone; all clones share one
/// index and event stream.
#[derive(Clone)]
pub struct Inventory {
    inner: Arc<Inner>,
}

impl Inventory {
    /// Creates the root directory if absent and returns an inventory
    /// with an empty index. Call [`Inventory::load`] (or use
    /// [`Inventory::open`]) to scan existing entries.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::io(&root, e))?;
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            inner: Arc::new(Inner {
                root,
                index: Mutex::new(HashMap::new()),
                events,
            }),
        })
    }

    /// Creates and scans in one step.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let inventory = Self::new(root)?;
        inventory.load()?;
        Ok(inventory)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Subscribe to lifecycle events. No replay: only events emitted
    /// after the call are observed.
    pub fn subscribe(&self) -> broadcast::Receiver<InventoryEvent> {
        self.inner.events.subscribe()
    }

    /// Scans the root's immediate subdirectories and loads each entry's
    /// metadata record into the index. A directory whose record is
    /// unreadable or malformed is reported as corrupt and excluded, but
    /// its files stay on disk and the scan continues - the failure may
    /// be transient.
    pub fn load(&self) -> Result<()> {
        let root = &self.inner.root;
        let mut loaded = 0usize;
        for dir_entry in fs::read_dir(root).map_err(|e| Error::io(root, e))? {
            let dir_entry = dir_entry.map_err(|e| Error::io(root, e))?;
            let path = dir_entry.path();
            if !path.is_dir() {
                continue;
            }
            match self.load_entry(&path) {
                Ok(Some(descriptor)) => {
                    loaded += 1;
                    self.insert(descriptor.clone());
                    self.emit(InventoryEvent::Loaded { descriptor });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "excluding corrupt inventory entry");
                    self.emit(InventoryEvent::CorruptMetadata {
                        path: path.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        info!(root = %root.display(), entries = loaded, "inventory opened");
        Ok(())
    }

    fn load_entry(&self, entry_dir: &Path) -> Result<Option<RuntimeDescriptor>> {
        let meta_path = entry_dir.join(meta::META_FILE);
        let archive_path = entry_dir.join(ARCHIVE_FILE);
        if !meta_path.exists() && !archive_path.exists() {
            // Leftover lock-only directory, e.g. from an aborted write.
            return Ok(None);
        }
        let content = fs::read_to_string(&meta_path).map_err(|e| Error::CorruptMetadata {
            path: meta_path.clone(),
            source: Box::new(Error::io(&meta_path, e)),
        })?;
        let descriptor = meta::from_record(&content).map_err(|e| Error::CorruptMetadata {
            path: meta_path.clone(),
            source: Box::new(e),
        })?;
        Ok(Some(descriptor))
    }

    /// Starts a streaming write for `descriptor`. The returned writer
    /// holds the entry's exclusive lock until it is committed or
    /// dropped.
    pub fn begin_write(&self, descriptor: &RuntimeDescriptor) -> Result<EntryWriter> {
        let entry_dir = self.entry_dir(descriptor.id());
        fs::create_dir_all(&entry_dir).map_err(|e| Error::io(&entry_dir, e))?;
        let lock = EntryLock::acquire(&entry_dir)?;

        let digest = hash::digest_for(descriptor.archive_hash().algorithm())?;
        let tmp_path = entry_dir.join(format!("{ARCHIVE_FILE}{TMP_SUFFIX}"));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| Error::io(&tmp_path, e))?;

        debug!(id = descriptor.id(), "write started");
        Ok(EntryWriter {
            inventory: self.clone(),
            descriptor: descriptor.clone(),
            entry_dir,
            tmp_path,
            file: Some(file),
            digest: Some(digest),
            written: 0,
            done: false,
            _lock: lock,
        })
    }

    /// Streams `source` into the store, verifying against the
    /// descriptor's declared hash, and returns the committed archive
    /// path. Memory use is bounded by one fixed buffer.
    pub fn write(&self, descriptor: &RuntimeDescriptor, source: &mut dyn Read) -> Result<PathBuf> {
        let mut writer = self.begin_write(descriptor)?;
        let mut buf = vec![0u8; hash::STREAM_BUF_SIZE];
        loop {
            let n = source
                .read(&mut buf)
                .map_err(|e| Error::io(&writer.tmp_path, e))?;
            if n == 0 {
                break;
            }
            writer.write_chunk(&buf[..n])?;
        }
        writer.commit()
    }

    /// The committed archive path for `id`, if a committed entry
    /// exists. Takes the entry lock so a concurrent write or delete is
    /// observed either fully done or not at all.
    pub fn path_of(&self, id: &str) -> Result<Option<PathBuf>> {
        let entry_dir = self.entry_dir(id);
        if !entry_dir.is_dir() {
            return Ok(None);
        }
        let _lock = EntryLock::acquire(&entry_dir)?;
        let archive = entry_dir.join(ARCHIVE_FILE);
        if archive.is_file() && entry_dir.join(meta::META_FILE).is_file() {
            Ok(Some(archive))
        } else {
            Ok(None)
        }
    }

    /// Removes the entry for `id`. A missing id is a successful no-op.
    ///
    /// Under the entry lock every file except the lock file itself is
    /// removed first; the lock is then released and the lock file and
    /// the now-empty directory go last.
    pub fn delete(&self, id: &str) -> Result<()> {
        let entry_dir = self.entry_dir(id);
        if !entry_dir.is_dir() {
            self.remove_from_index(id);
            return Ok(());
        }

        {
            let lock = EntryLock::acquire(&entry_dir)?;
            for dir_entry in fs::read_dir(&entry_dir).map_err(|e| Error::io(&entry_dir, e))? {
                let dir_entry = dir_entry.map_err(|e| Error::io(&entry_dir, e))?;
                let path = dir_entry.path();
                if path == lock.path() {
                    continue;
                }
                fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
            }
        }

        let lock_path = entry_dir.join(lock::LOCK_FILE);
        if lock_path.exists() {
            fs::remove_file(&lock_path).map_err(|e| Error::io(&lock_path, e))?;
        }
        fs::remove_dir(&entry_dir).map_err(|e| Error::io(&entry_dir, e))?;

        self.remove_from_index(id);
        info!(id, "inventory entry deleted");
        self.emit(InventoryEvent::Deleted { id: id.to_string() });
        Ok(())
    }

    /// Re-hashes the committed archive for `id` under the entry lock
    /// and reports whether it still matches the recorded hash. Detects
    /// after-the-fact on-disk corruption; mutates nothing.
    pub fn verify(&self, id: &str) -> Result<bool> {
        let descriptor = self
            .lookup(id)
            .ok_or_else(|| Error::NotFound { id: id.to_string() })?;

        let entry_dir = self.entry_dir(id);
        let _lock = EntryLock::acquire(&entry_dir)?;

        let archive = entry_dir.join(ARCHIVE_FILE);
        let mut file = File::open(&archive).map_err(|e| Error::io(&archive, e))?;
        let mut digest = hash::digest_for(descriptor.archive_hash().algorithm())?;
        let mut buf = vec![0u8; hash::STREAM_BUF_SIZE];
        loop {
            let n = file.read(&mut buf).map_err(|e| Error::io(&archive, e))?;
            if n == 0 {
                break;
            }
            digest.update(&buf[..n]);
        }
        let actual = hex::encode(digest.finalize());
        let matches = actual.eq_ignore_ascii_case(descriptor.archive_hash().value());
        debug!(id, matches, "verify");
        Ok(matches)
    }

    /// Extracts the committed archive for `id` into `destination`.
    ///
    /// The container format is detected from the payload's leading
    /// bytes. Cancellation is polled between entries; on cancellation
    /// whatever was extracted so far is left in place - unpack is not
    /// transactional, unlike write.
    pub fn unpack(
        &self,
        id: &str,
        destination: &Path,
        cancel: &CancelFlag,
        options: UnpackOptions,
    ) -> Result<PathBuf> {
        let descriptor = self
            .lookup(id)
            .ok_or_else(|| Error::NotFound { id: id.to_string() })?;

        let entry_dir = self.entry_dir(id);
        let _lock = EntryLock::acquire(&entry_dir)?;
        let archive = entry_dir.join(ARCHIVE_FILE);
        if !archive.is_file() {
            return Err(Error::NotFound { id: id.to_string() });
        }

        let kind = ArchiveKind::detect(&archive, Some(descriptor.archive_uri()))?;
        info!(id, kind = %kind, destination = %destination.display(), "unpacking");
        unpack::extract(kind, &archive, destination, cancel, options)?;
        Ok(destination.to_path_buf())
    }

    /// Filters the in-memory index; no disk I/O.
    pub fn search(&self, criteria: &SearchCriteria) -> Vec<RuntimeDescriptor> {
        let index = self.inner.index.lock().expect("inventory index poisoned");
        let mut found: Vec<RuntimeDescriptor> = index
            .values()
            .filter(|d| search::matches(d, criteria))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id().cmp(b.id()));
        found
    }

    /// The descriptor committed under `id`, if any.
    pub fn lookup(&self, id: &str) -> Option<RuntimeDescriptor> {
        self.inner
            .index
            .lock()
            .expect("inventory index poisoned")
            .get(id)
            .cloned()
    }

    fn entry_dir(&self, id: &str) -> PathBuf {
        self.inner.root.join(id)
    }

    fn insert(&self, descriptor: RuntimeDescriptor) {
        self.inner
            .index
            .lock()
            .expect("inventory index poisoned")
            .insert(descriptor.id().to_string(), descriptor);
    }

    fn remove_from_index(&self, id: &str) {
        self.inner
            .index
            .lock()
            .expect("inventory index poisoned")
            .remove(id);
    }

    fn emit(&self, event: InventoryEvent) {
        // Nobody listening is fine.
        let _ = self.inner.events.send(event);
    }
}

/// An in-progress streaming write of one entry.
///
/// Holds the entry's exclusive lock. Dropping without committing
/// discards the temporary file; the lock is released on every exit
/// path.
pub struct EntryWriter {
    inventory: Inventory,
    descriptor: RuntimeDescriptor,
    entry_dir: PathBuf,
    tmp_path: PathBuf,
    file: Option<File>,
    digest: Option<Box<dyn digest::DynDigest + Send>>,
    written: u64,
    done: bool,
    _lock: EntryLock,
}

impl EntryWriter {
    /// Feeds one chunk through the running digest and into the
    /// temporary file.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.digest
            .as_mut()
            .expect("write after commit")
            .update(chunk);
        self.file
            .as_mut()
            .expect("write after commit")
            .write_all(chunk)
            .map_err(|e| Error::io(&self.tmp_path, e))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// The number of bytes the descriptor expects.
    pub fn expected(&self) -> u64 {
        self.descriptor.archive_size()
    }

    /// Finalizes the digest, verifies it against the declared hash and,
    /// on match, atomically renames archive then metadata into place.
    /// On mismatch the temporary file is deleted and nothing becomes
    /// visible.
    pub fn commit(mut self) -> Result<PathBuf> {
        self.done = true;

        let file = self.file.take().expect("double commit");
        file.sync_all().map_err(|e| Error::io(&self.tmp_path, e))?;
        drop(file);

        let digest = self.digest.take().expect("double commit");
        let actual = hex::encode(digest.finalize());
        let expected = self.descriptor.archive_hash().value();
        if !actual.eq_ignore_ascii_case(expected) {
            let _ = fs::remove_file(&self.tmp_path);
            warn!(id = self.descriptor.id(), "hash mismatch, write discarded");
            return Err(Error::VerificationFailed {
                id: self.descriptor.id().to_string(),
                expected: expected.to_string(),
                actual,
            });
        }

        let archive_path = self.entry_dir.join(ARCHIVE_FILE);
        fs::rename(&self.tmp_path, &archive_path).map_err(|e| Error::io(&archive_path, e))?;

        // Metadata goes second: a crash here leaves an archive without a
        // record, which the next load reports as corrupt instead of
        // trusting an unverified commit.
        let meta_path = self.entry_dir.join(meta::META_FILE);
        let meta_tmp = self.entry_dir.join(format!("{}{TMP_SUFFIX}", meta::META_FILE));
        fs::write(&meta_tmp, meta::to_record(&self.descriptor))
            .map_err(|e| Error::io(&meta_tmp, e))?;
        fs::rename(&meta_tmp, &meta_path).map_err(|e| Error::io(&meta_path, e))?;

        self.inventory.insert(self.descriptor.clone());
        info!(
            id = self.descriptor.id(),
            bytes = self.written,
            "inventory entry committed"
        );
        self.inventory.emit(InventoryEvent::Loaded {
            descriptor: self.descriptor.clone(),
        });
        Ok(archive_path)
    }
}

impl Drop for EntryWriter {
    fn drop(&mut self) {
        if !self.done {
            let _ = fs::remove_file(&self.tmp_path);
            debug!(id = self.descriptor.id(), "aborted write discarded");
        }
    }
}
