//! # Conduit Platform
//!
//! Shared types for the conduit SSH protocol engine.
//!
//! This crate provides the unified error type (`ConduitError`, `ConduitResult`)
//! used by the codec, transport, key exchange and channel layers.
//!
//! # Examples
//!
//! ```
//! use conduit_platform::{ConduitError, ConduitResult};
//!
//! fn parse_channel(id: Option<u32>) -> ConduitResult<u32> {
//!     id.ok_or_else(|| ConduitError::invalid_argument("id", "channel id is required"))
//! }
//!
//! # fn main() -> ConduitResult<()> {
//! assert_eq!(parse_channel(Some(7))?, 7);
//! assert!(parse_channel(None).is_err());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{ConduitError, ConduitResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
