//! # Constellation Common
//!
//! Shared types, errors, and constants used across Constellation components.
//!
//! ## Modules
//! - `types` - Cluster and lease data model (NodeMetadata, ServiceHealth, Lease, etc.)
//! - `error` - Common error types
//! - `constants` - Shared configuration constants

pub mod constants;
pub mod error;
pub mod types;

pub use error::{ConstellationError, Result};
pub use types::*;
