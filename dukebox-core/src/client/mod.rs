//! The client - the single-worker orchestrator over inventory and
//! catalog.
//!
//! Every operation is a message to one worker task; the worker runs
//! exactly one operation at a time, in submission order, so callers
//! never race each other over inventory entries or backend refreshes.
//! Results travel back on per-call reply channels, while inventory,
//! catalog and download notifications all surface on one merged event
//! stream.
//!
//! After [`Client::close`] resolves, every pending and future call
//! fails with [`Error::ClientClosed`]. Closing twice is a no-op.

mod progress;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cancel::CancelFlag;
use crate::catalog::{Catalog, CatalogEvent};
use crate::descriptor::RuntimeDescriptor;
use crate::error::{Error, Result};
use crate::inventory::{Inventory, InventoryEvent, UnpackOptions};
use crate::search::SearchCriteria;

use progress::{ProgressSampler, SAMPLE_INTERVAL};

/// Everything a client can tell its listeners, merged onto one stream.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Inventory(InventoryEvent),
    Catalog(CatalogEvent),
    DownloadStarted {
        id: String,
        expected: u64,
    },
    /// At most one per second per transfer.
    DownloadProgress {
        id: String,
        bytes: u64,
        expected: u64,
        bytes_per_sec: f64,
    },
    DownloadFinished {
        id: String,
        path: PathBuf,
    },
}

enum Command {
    SearchCatalog {
        criteria: SearchCriteria,
        reply: oneshot::Sender<Vec<RuntimeDescriptor>>,
    },
    SearchInventory {
        criteria: SearchCriteria,
        reply: oneshot::Sender<Vec<RuntimeDescriptor>>,
    },
    Download {
        id: String,
        reply: oneshot::Sender<Result<PathBuf>>,
    },
    PathOf {
        id: String,
        reply: oneshot::Sender<Result<Option<PathBuf>>>,
    },
    Delete {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Verify {
        id: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    Unpack {
        id: String,
        destination: PathBuf,
        options: UnpackOptions,
        reply: oneshot::Sender<Result<PathBuf>>,
    },
    Update {
        uri: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

struct ClientInner {
    // Taken (and thereby dropped) on close so the worker's receiver
    // drains and ends.
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    events: broadcast::Sender<ClientEvent>,
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the orchestrator. Cheap to clone; all clones drive the
/// same worker and close together.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Spawns the worker and the event forwarders. Must run inside a
    /// tokio runtime.
    pub fn new(inventory: Inventory, catalog: Catalog) -> Self {
        let (commands, command_rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(256);

        let worker = tokio::spawn(run_worker(
            command_rx,
            inventory.clone(),
            catalog.clone(),
            events.clone(),
        ));

        let forwarders = vec![
            tokio::spawn(forward_inventory(inventory.subscribe(), events.clone())),
            tokio::spawn(forward_catalog(catalog.subscribe(), events.clone())),
        ];

        Self {
            inner: Arc::new(ClientInner {
                commands: Mutex::new(Some(commands)),
                events,
                closed: AtomicBool::new(false),
                worker: Mutex::new(Some(worker)),
                forwarders: Mutex::new(forwarders),
            }),
        }
    }

    /// The merged event stream. No replay.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Searches the merged catalog view.
    pub async fn search_catalog(&self, criteria: SearchCriteria) -> Result<Vec<RuntimeDescriptor>> {
        self.submit(|reply| Command::SearchCatalog { criteria, reply })
            .await
    }

    /// Searches what is already downloaded and verified.
    pub async fn search_inventory(
        &self,
        criteria: SearchCriteria,
    ) -> Result<Vec<RuntimeDescriptor>> {
        self.submit(|reply| Command::SearchInventory { criteria, reply })
            .await
    }

    /// Downloads `id` from the catalog into the inventory, verifying on
    /// the way in, and returns the committed archive path. Already
    /// present means already done.
    pub async fn download(&self, id: impl Into<String>) -> Result<PathBuf> {
        let id = id.into();
        self.submit(|reply| Command::Download { id, reply }).await?
    }

    /// The committed archive path for `id`, if present.
    pub async fn path_of(&self, id: impl Into<String>) -> Result<Option<PathBuf>> {
        let id = id.into();
        self.submit(|reply| Command::PathOf { id, reply }).await?
    }

    /// Removes `id` from the inventory; absent ids succeed.
    pub async fn delete(&self, id: impl Into<String>) -> Result<()> {
        let id = id.into();
        self.submit(|reply| Command::Delete { id, reply }).await?
    }

    /// Re-verifies the stored archive for `id` against its recorded
    /// hash.
    pub async fn verify(&self, id: impl Into<String>) -> Result<bool> {
        let id = id.into();
        self.submit(|reply| Command::Verify { id, reply }).await?
    }

    /// Extracts the stored archive for `id` into `destination`.
    pub async fn unpack(
        &self,
        id: impl Into<String>,
        destination: impl Into<PathBuf>,
        options: UnpackOptions,
    ) -> Result<PathBuf> {
        let id = id.into();
        let destination = destination.into();
        self.submit(|reply| Command::Unpack {
            id,
            destination,
            options,
            reply,
        })
        .await?
    }

    /// Refreshes the backend registered under `uri`.
    pub async fn update(&self, uri: impl Into<String>) -> Result<()> {
        let uri = uri.into();
        self.submit(|reply| Command::Update { uri, reply }).await?
    }

    /// Shuts the worker down after the operation it is currently
    /// running, if any. Safe to call any number of times, from any
    /// clone.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("client closing");

        // Dropping the sender lets the worker drain already-queued
        // commands and stop.
        drop(
            self.inner
                .commands
                .lock()
                .expect("client state poisoned")
                .take(),
        );

        let worker = self.inner.worker.lock().expect("client state poisoned").take();
        if let Some(handle) = worker {
            if handle.await.is_err() {
                warn!("worker ended abnormally during close");
            }
        }

        let forwarders: Vec<JoinHandle<()>> = self
            .inner
            .forwarders
            .lock()
            .expect("client state poisoned")
            .drain(..)
            .collect();
        for task in forwarders {
            task.abort();
        }
    }

    async fn submit<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }
        let sender = self
            .inner
            .commands
            .lock()
            .expect("client state poisoned")
            .clone()
            .ok_or(Error::ClientClosed)?;
        let (reply, rx) = oneshot::channel();
        sender
            .send(build(reply))
            .await
            .map_err(|_| Error::ClientClosed)?;
        rx.await.map_err(|_| Error::ClientClosed)
    }
}

async fn run_worker(
    mut commands: mpsc::Receiver<Command>,
    inventory: Inventory,
    catalog: Catalog,
    events: broadcast::Sender<ClientEvent>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::SearchCatalog { criteria, reply } => {
                let _ = reply.send(catalog.search(&criteria));
            }
            Command::SearchInventory { criteria, reply } => {
                let _ = reply.send(inventory.search(&criteria));
            }
            Command::Download { id, reply } => {
                let result = run_download(&inventory, &catalog, &events, &id).await;
                let _ = reply.send(result);
            }
            Command::PathOf { id, reply } => {
                let inventory = inventory.clone();
                let _ = reply.send(blocking(move || inventory.path_of(&id)).await);
            }
            Command::Delete { id, reply } => {
                let inventory = inventory.clone();
                let _ = reply.send(blocking(move || inventory.delete(&id)).await);
            }
            Command::Verify { id, reply } => {
                let inventory = inventory.clone();
                let _ = reply.send(blocking(move || inventory.verify(&id)).await);
            }
            Command::Unpack {
                id,
                destination,
                options,
                reply,
            } => {
                let inventory = inventory.clone();
                let cancel = CancelFlag::new();
                let _ = reply.send(
                    blocking(move || inventory.unpack(&id, &destination, &cancel, options)).await,
                );
            }
            Command::Update { uri, reply } => {
                let cancel = CancelFlag::new();
                let _ = reply.send(catalog.update(&uri, &cancel).await);
            }
        }
    }
    debug!("worker drained and stopped");
}

/// Runs a synchronous inventory call off the async worker thread.
async fn blocking<T: Send + 'static>(
    op: impl FnOnce() -> Result<T> + Send + 'static,
) -> Result<T> {
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| Error::Internal(format!("inventory task failed: {e}")))?
}

async fn run_download(
    inventory: &Inventory,
    catalog: &Catalog,
    events: &broadcast::Sender<ClientEvent>,
    id: &str,
) -> Result<PathBuf> {
    if inventory.lookup(id).is_some() {
        if let Some(path) = inventory.path_of(id)? {
            debug!(id, "already in inventory, skipping download");
            return Ok(path);
        }
    }

    let mut fetch = catalog.fetch(id).await?;
    let expected = fetch.expected();
    let _ = events.send(ClientEvent::DownloadStarted {
        id: id.to_string(),
        expected,
    });

    let mut writer = inventory.begin_write(fetch.descriptor())?;
    let mut sampler = ProgressSampler::new(SAMPLE_INTERVAL);
    while let Some(chunk) = fetch.next_chunk().await? {
        writer.write_chunk(&chunk)?;
        if let Some(bytes_per_sec) = sampler.sample(writer.written()) {
            let _ = events.send(ClientEvent::DownloadProgress {
                id: id.to_string(),
                bytes: writer.written(),
                expected,
                bytes_per_sec,
            });
        }
    }

    let path = writer.commit()?;
    let _ = events.send(ClientEvent::DownloadFinished {
        id: id.to_string(),
        path: path.clone(),
    });
    Ok(path)
}

async fn forward_inventory(
    mut rx: broadcast::Receiver<InventoryEvent>,
    events: broadcast::Sender<ClientEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let _ = events.send(ClientEvent::Inventory(event));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "inventory events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn forward_catalog(
    mut rx: broadcast::Receiver<CatalogEvent>,
    events: broadcast::Sender<ClientEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let _ = events.send(ClientEvent::Catalog(event));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "catalog events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
