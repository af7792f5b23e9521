//! Relay Common - Shared types, utilities, and configuration for the Dify relay.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation
//! - Error types shared by every stage of a turn
//! - Logging setup
//! - Small string utilities

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod util;
pub mod validation;

pub use config::{AppMode, Config, DifyConfig, ObservabilityConfig};
pub use error::{RelayError, Result};
pub use validation::{Validate, ValidationError, ValidationResult};
