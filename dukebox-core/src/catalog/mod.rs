//! The catalog - one merged, searchable view over any number of
//! repository backends.
//!
//! Backends come and go through the [`ProviderRegistry`]; the catalog
//! observes it, opens and closes connections, merges descriptor maps
//! for search (first registered backend wins on duplicate ids), proxies
//! archive fetches as plain HTTP streams, and republishes each
//! backend's refresh events on its own stream. It never persists
//! archive bytes - that is the inventory's job.

mod backend;
pub mod manifest;
mod registry;
pub mod retry;

pub use backend::{
    BackendContext, RepositoryDescription, RepositoryHandle, RepositoryProvider, UpdateState,
};
pub use registry::{ProviderRegistry, RegistryEvent};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::cancel::CancelFlag;
use crate::descriptor::RuntimeDescriptor;
use crate::error::{Error, Result};
use crate::search::{self, SearchCriteria};

/// Notifications published by a catalog.
#[derive(Debug, Clone)]
pub enum CatalogEvent {
    BackendOpened { uri: String },
    BackendClosed { uri: String },
    Update { uri: String, state: UpdateState },
}

struct CatalogInner {
    context: BackendContext,
    // Registration order decides the winning descriptor on duplicate
    // ids, so a Vec rather than a map.
    handles: Mutex<Vec<(String, Arc<dyn RepositoryHandle>)>>,
    events: broadcast::Sender<CatalogEvent>,
}

/// The merged backend view. Cheap to clone.
#[derive(Clone)]
pub struct Catalog {
    inner: Arc<CatalogInner>,
}

impl Catalog {
    pub fn new(context: BackendContext) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(CatalogInner {
                context,
                handles: Mutex::new(Vec::new()),
                events,
            }),
        }
    }

    /// Opens every provider already in `registry` and reacts to later
    /// register/unregister calls. A provider that fails to open is
    /// logged and skipped; it does not poison the rest.
    pub fn attach(&self, registry: &ProviderRegistry) {
        for provider in registry.providers() {
            self.open_backend(provider.as_ref());
        }
        let inner = self.inner.clone();
        registry.observe(move |event| {
            let catalog = Catalog { inner: inner.clone() };
            match event {
                RegistryEvent::Registered(provider) => catalog.open_backend(provider.as_ref()),
                RegistryEvent::Unregistered { uri } => catalog.close_backend(uri),
            }
        });
    }

    fn open_backend(&self, provider: &dyn RepositoryProvider) {
        let uri = provider.uri().to_string();
        match provider.open(&self.inner.context) {
            Ok(handle) => {
                let mut handles = self.inner.handles.lock().expect("catalog poisoned");
                if handles.iter().any(|(u, _)| u == &uri) {
                    warn!(uri, "backend already open, ignoring");
                    return;
                }
                handles.push((uri.clone(), Arc::from(handle)));
                drop(handles);
                info!(uri, name = provider.name(), "backend opened");
                self.emit(CatalogEvent::BackendOpened { uri });
            }
            Err(e) => {
                error!(uri, error = %e, "failed to open backend");
            }
        }
    }

    fn close_backend(&self, uri: &str) {
        let removed = {
            let mut handles = self.inner.handles.lock().expect("catalog poisoned");
            let before = handles.len();
            handles.retain(|(u, _)| u != uri);
            handles.len() != before
        };
        if removed {
            info!(uri, "backend closed");
            self.emit(CatalogEvent::BackendClosed {
                uri: uri.to_string(),
            });
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.inner.events.subscribe()
    }

    /// The uris of the currently open backends, in registration order.
    pub fn backend_uris(&self) -> Vec<String> {
        self.inner
            .handles
            .lock()
            .expect("catalog poisoned")
            .iter()
            .map(|(uri, _)| uri.clone())
            .collect()
    }

    /// Union of every backend's descriptor map, deduplicated by id,
    /// filtered through the predicate engine.
    pub fn search(&self, criteria: &SearchCriteria) -> Vec<RuntimeDescriptor> {
        let handles: Vec<Arc<dyn RepositoryHandle>> = {
            let guard = self.inner.handles.lock().expect("catalog poisoned");
            guard.iter().map(|(_, h)| h.clone()).collect()
        };

        let mut seen = std::collections::HashSet::new();
        let mut found = Vec::new();
        for handle in handles {
            for descriptor in handle.description().into_runtimes().into_values() {
                if !search::matches(&descriptor, criteria) {
                    continue;
                }
                if seen.insert(descriptor.id().to_string()) {
                    found.push(descriptor);
                }
            }
        }
        found.sort_by(|a, b| a.id().cmp(b.id()));
        found
    }

    /// The winning descriptor for `id`, if any backend advertises it.
    pub fn find(&self, id: &str) -> Option<RuntimeDescriptor> {
        let handles: Vec<Arc<dyn RepositoryHandle>> = {
            let guard = self.inner.handles.lock().expect("catalog poisoned");
            guard.iter().map(|(_, h)| h.clone()).collect()
        };
        handles
            .iter()
            .find_map(|handle| handle.description().runtimes().get(id).cloned())
    }

    /// Opens a read-through stream of the winning descriptor's archive.
    pub async fn fetch(&self, id: &str) -> Result<FetchStream> {
        let descriptor = self.find(id).ok_or_else(|| Error::NotFound {
            id: id.to_string(),
        })?;
        let uri = descriptor.archive_uri().to_string();

        let response = self
            .inner
            .context
            .http
            .get(&uri)
            .send()
            .await
            .map_err(|e| Error::Transport {
                uri: uri.clone(),
                status: None,
                source: Some(e),
            })?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(Error::Transport {
                uri,
                status: Some(status),
                source: None,
            });
        }

        let expected = response
            .content_length()
            .unwrap_or_else(|| descriptor.archive_size());
        let stream = response.bytes_stream().boxed();
        Ok(FetchStream {
            descriptor,
            uri,
            expected,
            stream,
        })
    }

    /// Drives exactly one backend's refresh, republishing its state
    /// events on the catalog stream.
    pub async fn update(&self, uri: &str, cancel: &CancelFlag) -> Result<()> {
        let handle = {
            let guard = self.inner.handles.lock().expect("catalog poisoned");
            guard
                .iter()
                .find(|(u, _)| u == uri)
                .map(|(_, h)| h.clone())
        }
        .ok_or_else(|| Error::UnknownRepository {
            uri: uri.to_string(),
        })?;

        let rx = handle.subscribe();
        let mut forwarder = tokio::spawn(forward_updates(
            rx,
            self.inner.events.clone(),
            uri.to_string(),
        ));

        let result = handle.update(cancel).await;

        // The refresh contract ends with Finished or Failed; give the
        // forwarder a moment to relay the terminal state, then cut it
        // loose if the backend broke the contract.
        if tokio::time::timeout(Duration::from_secs(5), &mut forwarder)
            .await
            .is_err()
        {
            forwarder.abort();
        }
        result
    }

    fn emit(&self, event: CatalogEvent) {
        let _ = self.inner.events.send(event);
    }
}

async fn forward_updates(
    mut rx: broadcast::Receiver<UpdateState>,
    events: broadcast::Sender<CatalogEvent>,
    uri: String,
) {
    loop {
        match rx.recv().await {
            Ok(state) => {
                let terminal = state.is_terminal();
                let _ = events.send(CatalogEvent::Update {
                    uri: uri.clone(),
                    state,
                });
                if terminal {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(uri, skipped, "refresh events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// A streaming archive fetch. Bytes are pulled chunk by chunk; nothing
/// is buffered beyond the transport's own windows.
pub struct FetchStream {
    descriptor: RuntimeDescriptor,
    uri: String,
    expected: u64,
    stream: futures::stream::BoxStream<'static, reqwest::Result<Bytes>>,
}

impl FetchStream {
    pub fn descriptor(&self) -> &RuntimeDescriptor {
        &self.descriptor
    }

    /// Bytes the transfer is expected to carry (content-length, or the
    /// descriptor's recorded size when the transport does not say).
    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// The next chunk, or `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match self.stream.next().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(Error::Transport {
                uri: self.uri.clone(),
                status: None,
                source: Some(e),
            }),
            None => Ok(None),
        }
    }
}
