//! fsrelay Common - Shared types and utilities
//!
//! This crate provides the identifiers, wire status codes, error
//! definitions and configuration shared by every fsrelay component.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
