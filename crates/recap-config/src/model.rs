use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Where the database and its key file live. Defaults to the `data`
    /// subdirectory of the config dir when unset.
    pub data_dir: Option<PathBuf>,

    /// Database file name inside the data directory.
    pub file: String,

    /// Operator-supplied key material, checked before the local key file.
    /// This is the container/orchestrator secret-injection point.
    pub secret_file: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            file: "recap.db".to_string(),
            secret_file: PathBuf::from("/run/secrets/recap_db_key"),
        }
    }
}
