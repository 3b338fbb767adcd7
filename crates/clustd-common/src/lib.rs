//! # clustd Common
//!
//! Shared types, errors, and constants used across clustd components.
//!
//! ## Modules
//! - `types` - Wire messages (hello, request, response) and connection metadata
//! - `error` - Common error type
//! - `constants` - Protocol timing and framing constants

pub mod constants;
pub mod error;
pub mod types;

pub use error::ClustdError;
pub use types::*;
