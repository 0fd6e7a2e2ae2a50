//! Layered configuration loading.
//!
//! Loads and merges configuration from two locations:
//! 1. Global: `~/.config/tether/tether.toml`
//! 2. Project: `<cwd>/.tether/tether.toml`
//!
//! Missing files count as empty. A file that exists but does not parse is
//! an error.

use crate::{SettingsError, TetherConfig};
use std::path::{Path, PathBuf};

const FILE_NAME: &str = "tether.toml";

/// Loads and merges `TetherConfig` from global and project-level files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the merged configuration for the given working directory.
    ///
    /// # Errors
    /// Returns the first read or parse error from either file.
    pub fn load(cwd: &Path) -> Result<TetherConfig, SettingsError> {
        Self::load_layers(
            Self::global_config_path().as_deref(),
            &Self::project_config_path(cwd),
        )
    }

    /// Merge an optional global file with a project file.
    ///
    /// # Errors
    /// Returns the first read or parse error from either file.
    pub fn load_layers(global: Option<&Path>, project: &Path) -> Result<TetherConfig, SettingsError> {
        let global = match global {
            Some(path) => Self::load_optional(path)?,
            None => TetherConfig::default(),
        };
        let project = Self::load_optional(project)?;
        Ok(global.merge(project))
    }

    /// Path to the global config file, if a config directory is known.
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tether").join(FILE_NAME))
    }

    /// Path to the project config file for the given working directory.
    pub fn project_config_path(cwd: &Path) -> PathBuf {
        cwd.join(".tether").join(FILE_NAME)
    }

    fn load_optional(path: &Path) -> Result<TetherConfig, SettingsError> {
        if !path.exists() {
            return Ok(TetherConfig::default());
        }
        TetherConfig::load(path)
    }
}
