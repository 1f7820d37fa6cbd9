//! Common types, errors, and configuration for wasm-handoff.
//!
//! This crate provides shared functionality used across the workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for engine, worker and memory settings
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{EngineConfig, MemoryConfig, RuntimeConfig, WASM_PAGE_SIZE, WorkerConfig};
pub use config_file::{ConfigFile, ConfigFileError, ModuleEntry};
pub use error::{FailureKind, HandoffError, HostFunctionError};
