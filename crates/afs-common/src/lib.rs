//! AFS Common - Shared types and utilities
//!
//! This crate provides the identifiers, the operation model, the error
//! taxonomy and the configuration used across all AFS components.

pub mod config;
pub mod error;
pub mod types;

pub use config::AfsConfig;
pub use error::{Error, ErrorClass, Result};
pub use types::*;
