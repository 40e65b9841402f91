//! The repository backend contract.
//!
//! A backend is one remote source of runtime descriptors. The catalog
//! only ever sees these two traits: a [`RepositoryProvider`] it can ask
//! to open a connection, and the resulting [`RepositoryHandle`] exposing
//! the current descriptor map and the refresh protocol.
//!
//! Refresh is a small state machine:
//!
//! ```text
//! Started -> Running(progress in [0,1])* -> Finished | Failed
//! ```
//!
//! `Running` may be emitted many times; progress is best-effort
//! monotonic within one update. Cancellation is cooperative - a backend
//! polls the flag once per unit of work and surfaces the abort as
//! `Failed`.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::cancel::CancelFlag;
use crate::descriptor::RuntimeDescriptor;
use crate::error::{Error, Result};

/// Shared facilities handed to a backend when it is opened.
#[derive(Clone)]
pub struct BackendContext {
    /// Directory a backend may use to persist fetched state between
    /// runs.
    pub cache_dir: PathBuf,
    /// Shared HTTP client; redirects are followed transparently.
    pub http: reqwest::Client,
}

/// One step of the refresh protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateState {
    Started,
    Running { progress: f64 },
    Finished,
    Failed { message: String },
}

impl UpdateState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdateState::Finished | UpdateState::Failed { .. })
    }
}

/// A snapshot of one backend's advertised runtimes.
#[derive(Debug, Clone)]
pub struct RepositoryDescription {
    id: String,
    last_updated: Option<DateTime<Utc>>,
    runtimes: HashMap<String, RuntimeDescriptor>,
}

impl RepositoryDescription {
    /// Validates that every descriptor belongs to this repository and
    /// is keyed by its own id.
    pub fn new(
        id: impl Into<String>,
        last_updated: Option<DateTime<Utc>>,
        runtimes: HashMap<String, RuntimeDescriptor>,
    ) -> Result<Self> {
        let id = id.into();
        for (key, descriptor) in &runtimes {
            if descriptor.repository() != id {
                return Err(Error::InvalidDescriptor(format!(
                    "descriptor '{}' claims repository '{}' inside '{}'",
                    descriptor.id(),
                    descriptor.repository(),
                    id
                )));
            }
            if key != descriptor.id() {
                return Err(Error::InvalidDescriptor(format!(
                    "descriptor '{}' keyed under '{key}'",
                    descriptor.id()
                )));
            }
        }
        Ok(Self {
            id,
            last_updated,
            runtimes,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    pub fn runtimes(&self) -> &HashMap<String, RuntimeDescriptor> {
        &self.runtimes
    }

    pub fn into_runtimes(self) -> HashMap<String, RuntimeDescriptor> {
        self.runtimes
    }
}

/// An open connection to one backend.
#[async_trait]
pub trait RepositoryHandle: Send + Sync {
    /// The backend's uri (its identity inside the catalog).
    fn uri(&self) -> &str;

    /// Current descriptor snapshot.
    fn description(&self) -> RepositoryDescription;

    /// Runs one refresh, driving the [`UpdateState`] machine on the
    /// event stream. Must poll `cancel` at unit-of-work granularity
    /// and surface a cancelled abort as `Failed` before returning
    /// [`Error::Cancelled`].
    async fn update(&self, cancel: &CancelFlag) -> Result<()>;

    /// Subscribe to refresh state events.
    fn subscribe(&self) -> broadcast::Receiver<UpdateState>;
}

/// A factory for backend connections, registered with the provider
/// registry.
pub trait RepositoryProvider: Send + Sync {
    fn uri(&self) -> &str;
    fn name(&self) -> &str;
    fn open(&self, context: &BackendContext) -> Result<Box<dyn RepositoryHandle>>;
}
