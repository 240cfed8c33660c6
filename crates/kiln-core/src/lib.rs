//! Kiln Core - shared foundations for the kiln build executor
//!
//! This crate provides the error taxonomy and the configuration system
//! (discovery, parsing and validation of `kiln.toml` / `kiln.yaml`).

pub mod config;
pub mod error;

pub use config::{load_config, load_config_from_dir, load_config_or_default, Config};
pub use error::{ConfigError, KilnError, Result};
