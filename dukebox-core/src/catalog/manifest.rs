//! The bundled JSON-manifest backend.
//!
//! The simplest useful backend: one HTTP GET of a JSON document listing
//! runtime descriptors. It exercises the whole refresh contract -
//! Started/Running/Finished events, per-item cancellation polling,
//! bounded retry on rate limits - and persists the fetched map in its
//! cache directory so a reopened catalog starts warm.
//!
//! Manifest document shape:
//!
//! ```json
//! {
//!   "runtimes": [ { "repository": "...", "version": "21.0.2+13", ... } ]
//! }
//! ```

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::backend::{
    BackendContext, RepositoryDescription, RepositoryHandle, RepositoryProvider, UpdateState,
};
use super::retry::{self, with_backoff};
use crate::cancel::CancelFlag;
use crate::descriptor::RuntimeDescriptor;
use crate::error::{Error, Result};

/// The manifest document as served by the remote.
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    runtimes: Vec<RuntimeDescriptor>,
}

/// What the backend persists between runs.
#[derive(Debug, Serialize, Deserialize)]
struct CachedSnapshot {
    last_updated: Option<DateTime<Utc>>,
    runtimes: Vec<RuntimeDescriptor>,
}

/// Provider for manifest-served repositories.
pub struct ManifestProvider {
    uri: String,
    name: String,
}

impl ManifestProvider {
    pub fn new(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
        }
    }
}

impl RepositoryProvider for ManifestProvider {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, context: &BackendContext) -> Result<Box<dyn RepositoryHandle>> {
        let cache_path = snapshot_path(&context.cache_dir, &self.uri);
        let handle = ManifestHandle {
            uri: self.uri.clone(),
            http: context.http.clone(),
            cache_path,
            runtimes: Mutex::new(HashMap::new()),
            last_updated: Mutex::new(None),
            events: broadcast::channel(64).0,
        };
        handle.load_snapshot();
        Ok(Box::new(handle))
    }
}

/// Cache file name derived from the manifest uri, one per backend.
fn snapshot_path(cache_dir: &std::path::Path, uri: &str) -> PathBuf {
    let mut hasher = DefaultHasher::new();
    uri.hash(&mut hasher);
    cache_dir.join(format!("manifest_{:016x}.json", hasher.finish()))
}

pub struct ManifestHandle {
    uri: String,
    http: reqwest::Client,
    cache_path: PathBuf,
    runtimes: Mutex<HashMap<String, RuntimeDescriptor>>,
    last_updated: Mutex<Option<DateTime<Utc>>>,
    events: broadcast::Sender<UpdateState>,
}

impl ManifestHandle {
    /// Best-effort reload of the persisted snapshot; a stale or corrupt
    /// snapshot just means starting empty.
    fn load_snapshot(&self) {
        let content = match fs::read_to_string(&self.cache_path) {
            Ok(content) => content,
            Err(_) => return,
        };
        match serde_json::from_str::<CachedSnapshot>(&content) {
            Ok(snapshot) => {
                let count = snapshot.runtimes.len();
                let mut runtimes = self.runtimes.lock().expect("manifest state poisoned");
                *runtimes = snapshot
                    .runtimes
                    .into_iter()
                    .map(|d| (d.id().to_string(), d))
                    .collect();
                *self.last_updated.lock().expect("manifest state poisoned") =
                    snapshot.last_updated;
                debug!(uri = self.uri, count, "manifest snapshot reloaded");
            }
            Err(e) => {
                warn!(uri = self.uri, error = %e, "discarding unreadable manifest snapshot");
            }
        }
    }

    fn persist_snapshot(&self) {
        let snapshot = CachedSnapshot {
            last_updated: *self.last_updated.lock().expect("manifest state poisoned"),
            runtimes: self
                .runtimes
                .lock()
                .expect("manifest state poisoned")
                .values()
                .cloned()
                .collect(),
        };
        let result = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| e.to_string())
            .and_then(|json| {
                if let Some(parent) = self.cache_path.parent() {
                    fs::create_dir_all(parent).map_err(|e| e.to_string())?;
                }
                fs::write(&self.cache_path, json).map_err(|e| e.to_string())
            });
        if let Err(e) = result {
            // Caching is best effort; the in-memory map is authoritative.
            warn!(uri = self.uri, error = %e, "failed to persist manifest snapshot");
        }
    }

    fn emit(&self, state: UpdateState) {
        let _ = self.events.send(state);
    }

    async fn fetch_manifest(&self) -> Result<Manifest> {
        let response = self
            .http
            .get(&self.uri)
            .send()
            .await
            .map_err(|e| Error::Transport {
                uri: self.uri.clone(),
                status: None,
                source: Some(e),
            })?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(Error::Transport {
                uri: self.uri.clone(),
                status: Some(status.as_u16()),
                source: None,
            });
        }

        let body = response.text().await.map_err(|e| Error::Transport {
            uri: self.uri.clone(),
            status: None,
            source: Some(e),
        })?;

        serde_json::from_str(&body).map_err(|e| Error::InvalidDescriptor(format!(
            "manifest at {} is not valid: {e}",
            self.uri
        )))
    }

    async fn run_update(&self, cancel: &CancelFlag) -> Result<()> {
        let manifest = with_backoff(
            "manifest fetch",
            retry::DEFAULT_ATTEMPTS,
            retry::DEFAULT_BACKOFF,
            || self.fetch_manifest(),
        )
        .await?;

        let count = manifest.runtimes.len();
        let mut accepted: HashMap<String, RuntimeDescriptor> = HashMap::new();
        for (index, descriptor) in manifest.runtimes.into_iter().enumerate() {
            cancel.check()?;
            if descriptor.repository() != self.uri {
                warn!(
                    uri = self.uri,
                    id = descriptor.id(),
                    claims = descriptor.repository(),
                    "skipping descriptor from another repository"
                );
                continue;
            }
            accepted.insert(descriptor.id().to_string(), descriptor);
            let progress = if count == 0 {
                1.0
            } else {
                (index + 1) as f64 / count as f64
            };
            self.emit(UpdateState::Running { progress });
        }

        *self.runtimes.lock().expect("manifest state poisoned") = accepted;
        *self.last_updated.lock().expect("manifest state poisoned") = Some(Utc::now());
        self.persist_snapshot();
        info!(uri = self.uri, count, "manifest backend updated");
        Ok(())
    }
}

#[async_trait]
impl RepositoryHandle for ManifestHandle {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn description(&self) -> RepositoryDescription {
        let runtimes = self
            .runtimes
            .lock()
            .expect("manifest state poisoned")
            .clone();
        let last_updated = *self.last_updated.lock().expect("manifest state poisoned");
        // Entries were validated against this uri on the way in.
        RepositoryDescription::new(self.uri.clone(), last_updated, runtimes)
            .expect("manifest map violates repository invariant")
    }

    async fn update(&self, cancel: &CancelFlag) -> Result<()> {
        self.emit(UpdateState::Started);
        match self.run_update(cancel).await {
            Ok(()) => {
                self.emit(UpdateState::Finished);
                Ok(())
            }
            Err(e) => {
                self.emit(UpdateState::Failed {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<UpdateState> {
        self.events.subscribe()
    }
}
