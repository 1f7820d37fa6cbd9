//! Configuration file structures for wasm-handoff.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ModuleEntry`]: Module image registered under a location at startup

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.engine]
/// wasm_threads = true
///
/// [runtime.worker]
/// entry_point = "worker_entry_point"
///
/// [runtime.memory]
/// initial_pages = 1
/// maximum_pages = 16
///
/// [[modules]]
/// location = "app"
/// path = "./modules/app.wasm"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine, worker and memory settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Modules to register at startup.
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML, or if the
    /// memory limits or module locations are invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a module entry by location.
    pub fn module(&self, location: &str) -> Option<&ModuleEntry> {
        self.modules.iter().find(|m| m.location == location)
    }

    fn validate(&self) -> Result<(), ConfigFileError> {
        if !self.runtime.memory.is_valid() {
            return Err(ConfigFileError::Invalid {
                message: format!(
                    "memory limits {}..{} pages are not a valid shared memory",
                    self.runtime.memory.initial_pages, self.runtime.memory.maximum_pages
                ),
            });
        }

        for (i, entry) in self.modules.iter().enumerate() {
            if self.modules[..i].iter().any(|m| m.location == entry.location) {
                return Err(ConfigFileError::Invalid {
                    message: format!("duplicate module location '{}'", entry.location),
                });
            }
        }

        Ok(())
    }
}

/// A module image registered under a location.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModuleEntry {
    /// Location name workers resolve.
    pub location: String,

    /// Path to the WebAssembly module (`.wasm`) or AOT artifact (`.cwasm`).
    pub path: String,

    /// Entry point override for this module.
    #[serde(default)]
    pub entry_point: Option<String>,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },

    /// The configuration parsed but is not usable.
    #[error("Invalid config file: {message}")]
    Invalid { message: String },
}
