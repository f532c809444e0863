use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing key material, invalid paths. Fatal before any
    /// database handle exists.
    #[error("configuration error: {0}")]
    Config(String),

    /// Wrong key detected at open time. Never retried automatically.
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("database error: {0}")]
    Database(String),

    /// A row failed to scan or insert during batch migration. The
    /// destination holds nothing past the last committed batch.
    #[error("migration of table '{table}' failed at row {row}: {message}")]
    Migration {
        table: String,
        row: u64,
        message: String,
    },

    /// Post-copy row counts disagree between source and destination.
    #[error(
        "verification of table '{table}' failed: source has {source_rows} rows, destination has {dest_rows}"
    )]
    Verification {
        table: String,
        source_rows: i64,
        dest_rows: i64,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
