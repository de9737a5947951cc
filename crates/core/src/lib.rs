//! Core types shared by every labsync crate.
//!
//! - [`Error`] / [`Result`] for configuration and file handling
//! - [`ResultExt`] / [`OptionExt`] combinators that replace unwrap/expect
//! - [`ProviderConfig`], the single explicit configuration object that the
//!   binary builds once and hands to the reconciler context

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod error;
pub mod result;

pub use config::{OperationTimeouts, ProviderConfig, TimeoutOverrides};
pub use error::Error;
pub use result::{OptionExt, Result, ResultExt};
