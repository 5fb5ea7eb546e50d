//! tierstore Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, the configuration model and the
//! identifier types used across all tierstore components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, ErrorClass, Result};
pub use types::*;
