//! Remote provisioning API for labsync.
//!
//! [`RemoteService`] is the contract the reconcilers consume. Two
//! implementations ship with the crate:
//!
//! - [`HttpRemoteService`]: the v2 HTTP API over reqwest
//! - [`InMemoryRemoteService`]: a process-local double with configurable
//!   settle times, used by `--simulate` and the test suites

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod client;
pub mod error;
pub mod memory;
pub mod service;
pub mod types;

pub use client::HttpRemoteService;
pub use error::{RemoteError, Result};
pub use memory::{InMemoryRemoteService, SettleConfig};
pub use service::RemoteService;
pub use types::Runstate;
