use std::path::{Path, PathBuf};

use recap_common::{Error, Result};
use tracing::info;

use crate::model::AppConfig;

pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Result<Self> {
        let config_dir = Self::default_config_dir();
        Ok(Self { config_dir })
    }

    pub fn default_config_dir() -> PathBuf {
        let home_config = dirs::home_dir().map(|h| h.join(".recap"));
        let xdg_config = dirs::config_dir().map(|c| c.join("recap"));

        match (xdg_config, home_config) {
            (Some(xdg), Some(home)) => {
                if xdg.exists() {
                    xdg
                } else if home.exists() {
                    home
                } else {
                    xdg
                }
            }
            (Some(xdg), None) => xdg,
            (None, Some(home)) => home,
            (None, None) => PathBuf::from(".recap"),
        }
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn load(&self) -> Result<AppConfig> {
        let yaml_path = self.config_dir.join("config.yml");
        let toml_path = self.config_dir.join("config.toml");

        if yaml_path.exists() {
            info!("loading config from {}", yaml_path.display());
            let contents = std::fs::read_to_string(&yaml_path)?;
            serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse YAML config: {e}")))
        } else if toml_path.exists() {
            info!("loading config from {}", toml_path.display());
            let contents = std::fs::read_to_string(&toml_path)?;
            toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse TOML config: {e}")))
        } else {
            info!("no config file found, using defaults");
            Ok(AppConfig::default())
        }
    }

    /// Directory holding the database, its sidecars, and the local key file.
    pub fn data_dir(&self, config: &AppConfig) -> PathBuf {
        config
            .database
            .data_dir
            .clone()
            .unwrap_or_else(|| self.config_dir.join("data"))
    }

    pub fn db_path(&self, config: &AppConfig) -> PathBuf {
        self.data_dir(config).join(&config.database.file)
    }

    /// Local key file, colocated with the database (`<file>.key`).
    pub fn key_file_path(&self, config: &AppConfig) -> PathBuf {
        self.data_dir(config)
            .join(format!("{}.key", config.database.file))
    }

    pub fn ensure_dirs(&self, config: &AppConfig) -> Result<()> {
        let dirs = [self.config_dir.clone(), self.data_dir(config)];

        for dir in &dirs {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ConfigLoader;
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "recap-config-test-{}-{}-{}",
            label,
            std::process::id(),
            nanos
        ))
    }

    #[test]
    fn load_returns_default_when_no_config_exists() {
        let dir = temp_dir("default");
        fs::create_dir_all(&dir).expect("failed to create temp dir");

        let loader = ConfigLoader::with_dir(&dir);
        let config = loader.load().expect("load should succeed");

        assert_eq!(config.database.file, "recap.db");
        assert_eq!(
            config.database.secret_file,
            PathBuf::from("/run/secrets/recap_db_key")
        );

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_prefers_yaml_over_toml_when_both_exist() {
        let dir = temp_dir("yaml-precedence");
        fs::create_dir_all(&dir).expect("failed to create temp dir");

        fs::write(
            dir.join("config.yml"),
            "database:\n  file: \"from-yaml.db\"\n",
        )
        .expect("failed to write yaml config");
        fs::write(dir.join("config.toml"), "[database]\nfile = \"from-toml.db\"\n")
            .expect("failed to write toml config");

        let loader = ConfigLoader::with_dir(&dir);
        let config = loader.load().expect("load should succeed");

        assert_eq!(config.database.file, "from-yaml.db");

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_reads_toml_when_yaml_missing() {
        let dir = temp_dir("toml");
        fs::create_dir_all(&dir).expect("failed to create temp dir");

        fs::write(dir.join("config.toml"), "[database]\nfile = \"chats.db\"\n")
            .expect("failed to write toml config");

        let loader = ConfigLoader::with_dir(&dir);
        let config = loader.load().expect("load should succeed");

        assert_eq!(config.database.file, "chats.db");

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn db_and_key_paths_are_colocated_in_data_dir() {
        let dir = temp_dir("paths");
        let loader = ConfigLoader::with_dir(&dir);
        let config = loader.load().expect("load should succeed");

        let db_path = loader.db_path(&config);
        let key_path = loader.key_file_path(&config);

        assert_eq!(db_path, dir.join("data").join("recap.db"));
        assert_eq!(key_path, dir.join("data").join("recap.db.key"));
        assert_eq!(db_path.parent(), key_path.parent());
    }

    #[test]
    fn data_dir_override_wins() {
        let dir = temp_dir("data-override");
        fs::create_dir_all(&dir).expect("failed to create temp dir");
        fs::write(
            dir.join("config.yml"),
            "database:\n  data_dir: \"/var/lib/recap\"\n",
        )
        .expect("failed to write yaml config");

        let loader = ConfigLoader::with_dir(&dir);
        let config = loader.load().expect("load should succeed");

        assert_eq!(
            loader.db_path(&config),
            PathBuf::from("/var/lib/recap/recap.db")
        );

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn ensure_dirs_creates_config_and_data_dirs() {
        let dir = temp_dir("ensure-dirs");
        let loader = ConfigLoader::with_dir(&dir);
        let config = loader.load().expect("load should succeed");

        loader
            .ensure_dirs(&config)
            .expect("ensure_dirs should succeed");

        assert!(dir.exists());
        assert!(dir.join("data").exists());

        let _ = fs::remove_dir_all(dir);
    }
}
