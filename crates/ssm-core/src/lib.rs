//! # ssm-core
//!
//! Shared error taxonomy for the state-space workspace.
//!
//! Numerics live in `ssm-inference`; this crate stays dependency-light so
//! that callers (controllers, guardrail layers, the CLI) can match on
//! [`Error`] without pulling in the linear-algebra stack.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error types.
pub mod error;

pub use error::{Error, Result};

/// Workspace version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
