//! LumaTM Common - Shared types for the transaction manager
//!
//! This crate provides functionality used across all LumaTM components:
//! - Error types, including the heuristic outcome model
//! - Configuration management
//! - Global transaction identifiers (Uid, Xid) and transaction status
//! - X/Open XA return codes and flags

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod types;
pub mod xa;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
pub use xa::XaError;
