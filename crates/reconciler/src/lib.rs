//! Reconciliation core for labsync.
//!
//! Brings remote lab resources (projects, environments, networks, VMs, label
//! categories, tunnels) in line with declared desired state.
//!
//! # Building blocks
//!
//! - [`StateWaiter`] polls a refresh function until a runstate settles,
//!   with an injectable [`Clock`] and a [`StopSignal`] for cancellation
//! - [`diff`] compares nested collections (tags, labels, disks, published
//!   services) and [`apply_removals_then_additions`] applies the result
//!   one call at a time
//! - [`CorrelationIndex`] binds id-less declared items to remote ids
//! - [`find_project`] looks up an existing project by name without
//!   managing it
//!
//! # Reconciliation
//!
//! Each kind implements [`ResourceReconciler`] over typed desired and
//! observed structs. The [`Registry`] holds them behind [`DynReconciler`],
//! and the [`Engine`] drives create, read, update and delete from records in
//! a [`StateStore`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use labsync_reconciler::{Engine, InMemoryStateStore, ProviderContext, Registry, ResourceAddress, ResourceKind};
//! use labsync_remote::InMemoryRemoteService;
//!
//! let ctx = ProviderContext::new(Arc::new(InMemoryRemoteService::new()));
//! let engine = Engine::new(Registry::standard(), Arc::new(InMemoryStateStore::new()), ctx);
//! let address = ResourceAddress::new(ResourceKind::Project, "course");
//! let result = engine.apply(&address, serde_json::json!({ "name": "course" })).await?;
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod clock;
pub mod context;
pub mod correlation;
pub mod diff;
pub mod engine;
pub mod error;
pub mod lookup;
pub mod poller;
pub mod reconciler;
pub mod registry;
pub mod resources;
pub mod state;
pub mod stop;
pub mod types;

pub use clock::{Clock, ManualClock, TokioClock};
pub use context::ProviderContext;
pub use correlation::{CorrelationIndex, DeclaredItem, correlate_disks, normalize_ip};
pub use diff::{
    CollectionChanges, CollectionOutcome, DiffKey, DiffResult, apply_removals_then_additions, diff,
};
pub use engine::{Engine, REF_PREFIX};
pub use lookup::find_project;
pub use error::{Error, Result};
pub use poller::{RunstateSets, StateWaiter, WaitConfig};
pub use reconciler::{Applied, DynReconciler, ResourceReconciler};
pub use registry::Registry;
pub use state::{FileStateStore, InMemoryStateStore, ResourceRecord, StateStore};
pub use stop::{StopSignal, Stopper};
pub use types::{ChangeReport, ReconcileAction, ReconcileResult, ResourceAddress, ResourceKind};
