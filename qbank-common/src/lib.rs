//! # qbank common library
//!
//! Shared code for the content-bank tools:
//! - Error taxonomy used by every component
//! - Configuration loading (TOML file, environment, command line)
//! - SQLite schema bootstrap for the content bank

pub mod config;
pub mod db;
pub mod error;

pub use config::ConsolidationConfig;
pub use error::{Error, Rejection, RejectionReason, Result};
