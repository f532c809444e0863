pub mod guard;
pub mod keys;
pub mod migrate;
pub mod store;

pub use guard::{backup_if_plaintext, PLAINTEXT_HEADER};
pub use keys::KeyManager;
pub use migrate::{migrate_to_encrypted, MigrateOptions, MigrationReport, TableReport};
pub use store::{
    EncryptedStore, MessageKind, NewSummary, SaveOutcome, SkipReason, StoredMessage, Summary,
    SummaryStore,
};
