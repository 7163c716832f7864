//! Core types shared across the toolgate crates.
//!
//! # Main types
//!
//! - [`ToolgateError`]: Unified error enum for transports, protocol handling,
//!   circuit breaking and routing.
//! - [`ToolgateResult`]: Convenience alias for `Result<T, ToolgateError>`.

/// Error taxonomy for tool-server communication.
pub mod error;

pub use error::{ToolgateError, ToolgateResult};
