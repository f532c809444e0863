use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recap_common::{Error, GroupInfo, IncomingMessage, Quote, Reaction, Result, SourceContact};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id TEXT NOT NULL UNIQUE,
        number TEXT,
        display_name TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE TABLE IF NOT EXISTS groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id TEXT NOT NULL UNIQUE,
        name TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id INTEGER NOT NULL REFERENCES groups(id),
        user_id INTEGER NOT NULL REFERENCES users(id),
        timestamp INTEGER NOT NULL,
        kind TEXT NOT NULL DEFAULT 'regular',
        body TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE INDEX IF NOT EXISTS idx_messages_group_time
        ON messages(group_id, timestamp);

    CREATE TABLE IF NOT EXISTS summaries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id INTEGER NOT NULL REFERENCES groups(id),
        period_start INTEGER NOT NULL,
        period_end INTEGER NOT NULL,
        content TEXT NOT NULL,
        model TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE INDEX IF NOT EXISTS idx_summaries_group
        ON summaries(group_id, period_end);";

/// Columns added to `messages` after the initial schema shipped. `init`
/// inspects the live table and issues `ALTER TABLE ADD COLUMN` only for the
/// ones missing, so it is safe on both fresh and long-lived databases with
/// no separate migration-version bookkeeping.
const MESSAGE_COLUMNS: &[(&str, &str)] = &[
    ("quote_author", "TEXT DEFAULT NULL"),
    ("quote_text", "TEXT DEFAULT NULL"),
    ("quote_timestamp", "INTEGER DEFAULT NULL"),
    ("reaction_emoji", "TEXT DEFAULT NULL"),
    ("reaction_target_author", "TEXT DEFAULT NULL"),
    ("reaction_target_timestamp", "INTEGER DEFAULT NULL"),
];

/// Set the encryption key and cipher parameters on a fresh connection. The
/// key pragma must be the very first statement; everything else on the
/// connection comes after.
pub(crate) fn apply_encryption_pragmas(conn: &Connection, key: &str) -> Result<()> {
    // Raw 256-bit key form; a passphrase would run through the KDF instead.
    conn.execute_batch(&format!("PRAGMA key = \"x'{key}'\";"))
        .map_err(|e| Error::Integrity(format!("failed to apply encryption key: {e}")))?;

    // SQLCipher v4 defaults, pinned so every file in a deployment agrees.
    let cipher = |pragma: &str, e: rusqlite::Error| {
        Error::Database(format!("failed to set {pragma}: {e}"))
    };
    conn.pragma_update(None, "cipher_page_size", 4096)
        .map_err(|e| cipher("cipher_page_size", e))?;
    conn.pragma_update(None, "kdf_iter", 256_000)
        .map_err(|e| cipher("kdf_iter", e))?;
    conn.pragma_update(None, "cipher_hmac_algorithm", "HMAC_SHA512")
        .map_err(|e| cipher("cipher_hmac_algorithm", e))?;
    conn.pragma_update(None, "cipher_kdf_algorithm", "PBKDF2_HMAC_SHA512")
        .map_err(|e| cipher("cipher_kdf_algorithm", e))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Regular,
    Quote,
    Reaction,
}

impl MessageKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Quote => "quote",
            Self::Reaction => "reaction",
        }
    }

    fn from_db(value: &str) -> Result<Self> {
        match value {
            "regular" => Ok(Self::Regular),
            "quote" => Ok(Self::Quote),
            "reaction" => Ok(Self::Reaction),
            other => Err(Error::Database(format!("unknown message kind: {other}"))),
        }
    }
}

/// What `save_message` did with a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { message_id: i64, kind: MessageKind },
    Skipped(SkipReason),
}

/// Records discarded as out-of-scope, not as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Receipt,
    NoGroup,
}

/// A persisted message annotated with its quote/reaction metadata, as
/// consumed by the summarization scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub group_id: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    pub body: Option<String>,
    pub quote: Option<Quote>,
    pub reaction: Option<Reaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSummary {
    pub group_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub content: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub id: i64,
    pub group_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub content: String,
    pub model: Option<String>,
}

/// Store surface consumed by the summarization scheduler.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    async fn save_message(&self, incoming: IncomingMessage) -> Result<SaveOutcome>;
    async fn messages_in_range(
        &self,
        group_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredMessage>>;
    async fn list_group_ids(&self) -> Result<Vec<String>>;
    async fn insert_summary(&self, summary: NewSummary) -> Result<i64>;
    async fn summaries_for_group(&self, group_id: &str, limit: usize) -> Result<Vec<Summary>>;
}

/// Encrypted SQLite storage for users, groups, messages, and summaries.
///
/// The connection is serialized behind a mutex; every multi-statement write
/// runs inside one explicit transaction so a message never references a
/// not-yet-committed user or group.
#[derive(Debug)]
pub struct EncryptedStore {
    conn: Mutex<Connection>,
}

impl EncryptedStore {
    /// Open the database at `path` with the given 64-hex-character key.
    ///
    /// The key is applied as the first statement, then a cheap metadata
    /// query confirms it: a wrong key against an existing encrypted file
    /// fails here, never as garbled results on a later read.
    pub fn open(path: &Path, key: &str) -> Result<Self> {
        info!("opening encrypted store at {}", path.display());
        let conn = Connection::open(path).map_err(|e| {
            Error::Database(format!("failed to open database at {}: {e}", path.display()))
        })?;

        apply_encryption_pragmas(&conn, key)?;
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })
        .map_err(|e| {
            Error::Integrity(format!(
                "database at {} is not readable with the supplied key: {e}",
                path.display()
            ))
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Unencrypted in-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Apply the additive schema, then add any `messages` columns that this
    /// build knows about and the database does not. Idempotent.
    pub fn init(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Database(format!("schema creation failed: {e}")))?;

        let existing = message_columns(&conn)?;
        for (name, decl) in MESSAGE_COLUMNS {
            if existing.iter().any(|c| c == name) {
                continue;
            }
            info!("adding missing column messages.{name}");
            conn.execute(
                &format!("ALTER TABLE messages ADD COLUMN {name} {decl}"),
                [],
            )
            .map_err(|e| Error::Database(format!("failed to add column messages.{name}: {e}")))?;
        }

        Ok(())
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("database lock poisoned".into()))
    }

    pub async fn save_message(&self, incoming: IncomingMessage) -> Result<SaveOutcome> {
        self.save_message_sync(&incoming)
    }

    pub async fn messages_in_range(
        &self,
        group_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredMessage>> {
        self.messages_in_range_sync(group_id, start, end)
    }

    pub async fn list_group_ids(&self) -> Result<Vec<String>> {
        self.list_group_ids_sync()
    }

    pub async fn insert_summary(&self, summary: NewSummary) -> Result<i64> {
        self.insert_summary_sync(&summary)
    }

    pub async fn summaries_for_group(&self, group_id: &str, limit: usize) -> Result<Vec<Summary>> {
        self.summaries_for_group_sync(group_id, limit)
    }

    /// Classify and persist one ingested record. The user and group rows it
    /// references are found or created inside the same transaction, so all
    /// three commit atomically.
    pub fn save_message_sync(&self, incoming: &IncomingMessage) -> Result<SaveOutcome> {
        if incoming.is_receipt {
            debug!(
                "skipping delivery/read receipt from {}",
                incoming.sender.source_id
            );
            return Ok(SaveOutcome::Skipped(SkipReason::Receipt));
        }
        let Some(group) = &incoming.group else {
            debug!(
                "skipping message without group context from {}",
                incoming.sender.source_id
            );
            return Ok(SaveOutcome::Skipped(SkipReason::NoGroup));
        };

        let kind = classify(incoming);

        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;

        let user_pk = find_or_create_user(&tx, &incoming.sender)?;
        let group_pk = find_or_create_group(&tx, group)?;

        let quote = match kind {
            MessageKind::Quote => incoming.quote.as_ref(),
            _ => None,
        };
        let reaction = match kind {
            MessageKind::Reaction => incoming.reaction.as_ref(),
            _ => None,
        };

        tx.execute(
            "INSERT INTO messages (
                group_id, user_id, timestamp, kind, body,
                quote_author, quote_text, quote_timestamp,
                reaction_emoji, reaction_target_author, reaction_target_timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                group_pk,
                user_pk,
                incoming.timestamp.timestamp_millis(),
                kind.as_str(),
                incoming.body,
                quote.map(|q| q.author.as_str()),
                quote.and_then(|q| q.text.as_deref()),
                quote.map(|q| q.quoted_timestamp),
                reaction.map(|r| r.emoji.as_str()),
                reaction.map(|r| r.target_author.as_str()),
                reaction.map(|r| r.target_timestamp),
            ],
        )
        .map_err(|e| Error::Database(format!("failed to insert message: {e}")))?;
        let message_id = tx.last_insert_rowid();

        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit message: {e}")))?;

        Ok(SaveOutcome::Saved { message_id, kind })
    }

    /// Timestamp-ordered messages for one group in `[start, end)`.
    pub fn messages_in_range_sync(
        &self,
        group_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT m.id, g.group_id, u.display_name, u.number, u.source_id,
                        m.timestamp, m.kind, m.body,
                        m.quote_author, m.quote_text, m.quote_timestamp,
                        m.reaction_emoji, m.reaction_target_author, m.reaction_target_timestamp
                 FROM messages m
                 JOIN groups g ON g.id = m.group_id
                 JOIN users u ON u.id = m.user_id
                 WHERE g.group_id = ?1 AND m.timestamp >= ?2 AND m.timestamp < ?3
                 ORDER BY m.timestamp ASC",
            )
            .map_err(|e| Error::Database(format!("failed to prepare message query: {e}")))?;

        let rows = stmt
            .query_map(
                params![group_id, start.timestamp_millis(), end.timestamp_millis()],
                row_to_message,
            )
            .map_err(|e| Error::Database(format!("failed to execute message query: {e}")))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(format!("failed to read message rows: {e}")))
    }

    pub fn list_group_ids_sync(&self) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT group_id FROM groups ORDER BY group_id")
            .map_err(|e| Error::Database(format!("failed to prepare group query: {e}")))?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| Error::Database(format!("failed to list groups: {e}")))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(format!("failed to read group rows: {e}")))
    }

    pub fn message_count_sync(&self, group_id: &str) -> Result<i64> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT count(*) FROM messages m
             JOIN groups g ON g.id = m.group_id
             WHERE g.group_id = ?",
            params![group_id],
            |row| row.get(0),
        )
        .map_err(|e| Error::Database(format!("failed to count messages: {e}")))
    }

    pub fn summary_count_sync(&self, group_id: &str) -> Result<i64> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT count(*) FROM summaries s
             JOIN groups g ON g.id = s.group_id
             WHERE g.group_id = ?",
            params![group_id],
            |row| row.get(0),
        )
        .map_err(|e| Error::Database(format!("failed to count summaries: {e}")))
    }

    pub fn insert_summary_sync(&self, summary: &NewSummary) -> Result<i64> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;

        let group_pk = find_or_create_group(
            &tx,
            &GroupInfo {
                group_id: summary.group_id.clone(),
                name: None,
            },
        )?;

        tx.execute(
            "INSERT INTO summaries (group_id, period_start, period_end, content, model)
             VALUES (?, ?, ?, ?, ?)",
            params![
                group_pk,
                summary.period_start.timestamp_millis(),
                summary.period_end.timestamp_millis(),
                summary.content,
                summary.model,
            ],
        )
        .map_err(|e| Error::Database(format!("failed to insert summary: {e}")))?;
        let id = tx.last_insert_rowid();

        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit summary: {e}")))?;

        Ok(id)
    }

    /// Most recent summaries first.
    pub fn summaries_for_group_sync(&self, group_id: &str, limit: usize) -> Result<Vec<Summary>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT s.id, g.group_id, s.period_start, s.period_end, s.content, s.model
                 FROM summaries s
                 JOIN groups g ON g.id = s.group_id
                 WHERE g.group_id = ?1
                 ORDER BY s.period_end DESC
                 LIMIT ?2",
            )
            .map_err(|e| Error::Database(format!("failed to prepare summary query: {e}")))?;

        let rows = stmt
            .query_map(params![group_id, limit as i64], row_to_summary)
            .map_err(|e| Error::Database(format!("failed to execute summary query: {e}")))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(format!("failed to read summary rows: {e}")))
    }
}

#[async_trait]
impl SummaryStore for EncryptedStore {
    async fn save_message(&self, incoming: IncomingMessage) -> Result<SaveOutcome> {
        self.save_message(incoming).await
    }

    async fn messages_in_range(
        &self,
        group_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredMessage>> {
        self.messages_in_range(group_id, start, end).await
    }

    async fn list_group_ids(&self) -> Result<Vec<String>> {
        self.list_group_ids().await
    }

    async fn insert_summary(&self, summary: NewSummary) -> Result<i64> {
        self.insert_summary(summary).await
    }

    async fn summaries_for_group(&self, group_id: &str, limit: usize) -> Result<Vec<Summary>> {
        self.summaries_for_group(group_id, limit).await
    }
}

/// Exactly one kind per record. A reaction may carry a quote envelope of the
/// message it targets, so reactions are checked first.
fn classify(incoming: &IncomingMessage) -> MessageKind {
    if incoming.reaction.is_some() {
        MessageKind::Reaction
    } else if incoming.quote.is_some() {
        MessageKind::Quote
    } else {
        MessageKind::Regular
    }
}

fn find_or_create_user(tx: &Transaction<'_>, contact: &SourceContact) -> Result<i64> {
    let existing = tx
        .query_row(
            "SELECT id FROM users WHERE source_id = ?",
            params![contact.source_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to look up user: {e}")))?;

    if let Some(id) = existing {
        return Ok(id);
    }

    tx.execute(
        "INSERT INTO users (source_id, number, display_name) VALUES (?, ?, ?)",
        params![contact.source_id, contact.number, contact.display_name],
    )
    .map_err(|e| Error::Database(format!("failed to insert user: {e}")))?;
    Ok(tx.last_insert_rowid())
}

fn find_or_create_group(tx: &Transaction<'_>, group: &GroupInfo) -> Result<i64> {
    let existing = tx
        .query_row(
            "SELECT id FROM groups WHERE group_id = ?",
            params![group.group_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to look up group: {e}")))?;

    if let Some(id) = existing {
        return Ok(id);
    }

    tx.execute(
        "INSERT INTO groups (group_id, name) VALUES (?, ?)",
        params![group.group_id, group.name],
    )
    .map_err(|e| Error::Database(format!("failed to insert group: {e}")))?;
    Ok(tx.last_insert_rowid())
}

fn message_columns(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("PRAGMA table_info(messages)")
        .map_err(|e| Error::Database(format!("failed to inspect messages table: {e}")))?;

    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| Error::Database(format!("failed to read table info: {e}")))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Database(format!("failed to collect columns: {e}")))?;

    Ok(columns)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let display_name: Option<String> = row.get(2)?;
    let number: Option<String> = row.get(3)?;
    let source_id: String = row.get(4)?;
    let sender = display_name.or(number).unwrap_or(source_id);

    let millis: i64 = row.get(5)?;
    let timestamp = DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(format!(
            "invalid message timestamp: {millis}"
        ))))
    })?;

    let kind_str: String = row.get(6)?;
    let kind = MessageKind::from_db(&kind_str).map_err(|e| {
        rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(e.to_string())))
    })?;

    let quote = match row.get::<_, Option<String>>(8)? {
        Some(author) => Some(Quote {
            author,
            text: row.get(9)?,
            quoted_timestamp: row.get::<_, Option<i64>>(10)?.unwrap_or_default(),
        }),
        None => None,
    };

    let reaction = match row.get::<_, Option<String>>(11)? {
        Some(emoji) => Some(Reaction {
            emoji,
            target_author: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
            target_timestamp: row.get::<_, Option<i64>>(13)?.unwrap_or_default(),
        }),
        None => None,
    };

    Ok(StoredMessage {
        id: row.get(0)?,
        group_id: row.get(1)?,
        sender,
        timestamp,
        kind,
        body: row.get(7)?,
        quote,
        reaction,
    })
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<Summary> {
    let to_timestamp = |millis: i64| {
        DateTime::from_timestamp_millis(millis).ok_or_else(|| {
            rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(format!(
                "invalid summary timestamp: {millis}"
            ))))
        })
    };

    Ok(Summary {
        id: row.get(0)?,
        group_id: row.get(1)?,
        period_start: to_timestamp(row.get(2)?)?,
        period_end: to_timestamp(row.get(3)?)?,
        content: row.get(4)?,
        model: row.get(5)?,
    })
}
