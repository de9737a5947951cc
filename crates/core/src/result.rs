//! Result type definition and extension traits for Railway-Oriented Programming.
//!
//! Provides combinators that let call sites log-and-continue or attach context
//! without reaching for unwrap/expect/panic.

use crate::error::Error;

/// The standard Result type for labsync core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing logging combinators for any displayable error.
pub trait ResultExt<T, E> {
    /// Convert a Result to an Option, logging the error if present.
    fn into_option_logged(self) -> Option<T>;

    /// Inspect the error without consuming the Result.
    #[must_use]
    fn inspect_error<F: FnOnce(&E)>(self, f: F) -> Self;
}

impl<T, E: std::fmt::Display> ResultExt<T, E> for std::result::Result<T, E> {
    fn into_option_logged(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "Operation failed");
                None
            }
        }
    }

    fn inspect_error<F: FnOnce(&E)>(self, f: F) -> Self {
        if let Err(ref e) = self {
            f(e);
        }
        self
    }
}

/// Extension trait for Option types providing Railway-style operations.
pub trait OptionExt<T> {
    /// Treat empty strings (after trimming) as absent.
    fn non_blank(self) -> Option<T>
    where
        T: AsRef<str>;
}

impl<T> OptionExt<T> for Option<T> {
    fn non_blank(self) -> Option<T>
    where
        T: AsRef<str>,
    {
        self.filter(|v| !v.as_ref().trim().is_empty())
    }
}
