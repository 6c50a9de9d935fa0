use crate::ConfigError;
use calsync_core::Settings;
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

const QUALIFIER: &str = "dev";
const ORGANIZATION: &str = "calsync";
const APPLICATION: &str = "calsync";

/// Owns the non-secret `Settings` document (spec.md §6) under the OS config
/// directory. Secrets (refresh token, IdMap, `lastSyncTime`) live in
/// `calsync-storage` instead — this crate is the ambient "where do settings
/// live on disk" concern, matching the teacher's `ConfigManager` shape.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: PathBuf,
    data_dir: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
            .ok_or(ConfigError::MissingDirectories)?;
        Self::at(dirs.config_dir(), dirs.data_dir())
    }

    /// Constructs a manager rooted at explicit directories, bypassing
    /// `ProjectDirs` resolution — used by tests and by callers that want a
    /// non-default profile directory.
    pub fn at(config_dir: &Path, data_dir: &Path) -> Result<Self, ConfigError> {
        fs::create_dir_all(config_dir)?;
        fs::create_dir_all(data_dir)?;

        let config_path = config_dir.join("config.toml");
        if !config_path.exists() {
            let initial = Settings::default();
            fs::write(&config_path, toml::to_string_pretty(&initial)?)?;
        }

        Ok(Self {
            config_path,
            data_dir: data_dir.to_path_buf(),
        })
    }

    pub fn load(&self) -> Result<Settings, ConfigError> {
        let content = fs::read_to_string(&self.config_path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self, settings: &Settings) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(settings)?;
        fs::write(&self.config_path, content)?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Directory `calsync-storage`'s sqlite database file lives under.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_writes_default_settings_on_first_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_dir = dir.path().join("config");
        let data_dir = dir.path().join("data");

        let manager = ConfigManager::at(&config_dir, &data_dir).expect("creates manager");
        let loaded = manager.load().expect("loads default settings");
        assert_eq!(loaded.calendar_id, "primary");
        assert_eq!(loaded.redirect_port, Settings::default().redirect_port);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager =
            ConfigManager::at(&dir.path().join("config"), &dir.path().join("data")).expect("manager");

        let mut settings = Settings::default();
        settings.client_id = "abc123".to_string();
        settings.sync_interval_minutes = 30;
        manager.save(&settings).expect("saves");

        let reloaded = manager.load().expect("reloads");
        assert_eq!(reloaded.client_id, "abc123");
        assert_eq!(reloaded.sync_interval_minutes, 30);
    }
}
