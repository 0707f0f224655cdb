use anyhow::{Context, Result};
use std::path::PathBuf;

/// Cross-platform application directory manager.
pub struct ConfigManager;

impl ConfigManager {
    /// Configuration/state directory following platform conventions:
    /// - Linux: $XDG_CONFIG_HOME/snapsync or ~/.config/snapsync
    /// - macOS: ~/Library/Application Support/snapsync
    /// - Windows: %APPDATA%\snapsync
    pub fn config_dir() -> Result<PathBuf> {
        let base = dirs::config_dir().context("failed to locate the user config directory")?;
        Ok(base.join("snapsync"))
    }

    /// Get the log file path
    pub fn log_file_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("snapsync.log"))
    }

    /// Root directory under which per-run conflict backup folders are created
    pub fn conflicts_root() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("conflicts"))
    }

    /// A fresh timestamped conflict backup directory for one sync run.
    /// The directory is created eagerly; the executor removes it again if
    /// the run finishes without conflicts.
    pub fn new_conflicts_dir() -> Result<PathBuf> {
        let dir =
            Self::conflicts_root()?.join(chrono::Local::now().format("%Y%m%d_%H%M%S").to_string());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create conflict backup dir: {}", dir.display()))?;
        Ok(dir)
    }

    /// Ensure the configuration directory exists
    pub fn ensure_config_dir() -> Result<PathBuf> {
        let config_dir = Self::config_dir()?;
        std::fs::create_dir_all(&config_dir).with_context(|| {
            format!("failed to create config directory: {}", config_dir.display())
        })?;
        Ok(config_dir)
    }
}
