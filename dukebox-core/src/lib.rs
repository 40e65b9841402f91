//! Dukebox core library - a package manager engine for Java runtime builds.
//!
//! The library is split along the same lines as the system it models:
//!
//! - [`descriptor`] - immutable value types describing one fetchable
//!   runtime archive, validated at construction.
//! - [`search`] - the pure predicate engine matching descriptors against
//!   optional criteria.
//! - [`inventory`] - the content-addressed, integrity-verified on-disk
//!   store of downloaded archives.
//! - [`catalog`] - the merged view over any number of remote repository
//!   backends, with a streaming fetch path and a cooperative refresh
//!   protocol.
//! - [`client`] - the single-worker orchestrator tying inventory and
//!   catalog together behind an asynchronous, serialized API with one
//!   merged event stream.

pub mod cancel;
pub mod catalog;
pub mod client;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod inventory;
pub mod search;
pub mod version;

pub use cancel::CancelFlag;
pub use catalog::{Catalog, CatalogEvent};
pub use client::{Client, ClientEvent};
pub use descriptor::{ArchiveHash, BuildInfo, Configuration, RuntimeDescriptor};
pub use error::{Error, Result};
pub use inventory::{Inventory, InventoryEvent};
pub use search::{SearchCriteria, VersionRange};
pub use version::RuntimeVersion;
