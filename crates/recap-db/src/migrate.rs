use std::path::{Path, PathBuf};

use chrono::Local;
use recap_common::{Error, Result};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, Statement};
use tracing::{info, warn};

use crate::guard::timestamped_backup_path;
use crate::store::apply_encryption_pragmas;

/// Rows per destination transaction. Commit-and-reopen at this cadence
/// bounds memory use and destination lock duration.
const BATCH_SIZE: u64 = 500;

#[derive(Debug, Clone)]
pub struct MigrateOptions {
    /// Compare per-table row counts after the copy. On by default; catches
    /// duplication or silent drops that per-batch commits cannot.
    pub verify: bool,
    /// Byte-copy the source to a timestamped sibling before any mutation.
    pub backup: bool,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            verify: true,
            backup: false,
        }
    }
}

#[derive(Debug)]
pub struct TableReport {
    pub name: String,
    pub rows_copied: u64,
}

#[derive(Debug, Default)]
pub struct MigrationReport {
    pub tables: Vec<TableReport>,
    pub backup: Option<PathBuf>,
}

impl MigrationReport {
    pub fn print_summary(&self) {
        println!("Migration Report");
        println!("────────────────");
        if let Some(backup) = &self.backup {
            println!("  Backup: {}", backup.display());
        }
        for table in &self.tables {
            println!("  {:<16} {} rows", table.name, table.rows_copied);
        }
    }
}

/// Copy every table of the unencrypted database at `source` into an
/// encrypted database at `dest` keyed with `key`.
///
/// Atomicity is per-batch, not whole-database: a failure at table K leaves
/// tables 1..K-1 fully migrated and table K holding nothing past its last
/// committed batch. Callers needing all-or-nothing semantics must discard
/// the destination file on any error.
pub fn migrate_to_encrypted(
    source: &Path,
    dest: &Path,
    key: &str,
    options: &MigrateOptions,
) -> Result<MigrationReport> {
    if !source.is_file() {
        return Err(Error::Config(format!(
            "source database {} does not exist",
            source.display()
        )));
    }

    let src = Connection::open_with_flags(source, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| {
            Error::Config(format!(
                "failed to open source database {}: {e}",
                source.display()
            ))
        })?;
    src.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })
    .map_err(|e| {
        Error::Config(format!(
            "{} is not a readable SQLite database: {e}",
            source.display()
        ))
    })?;

    let mut report = MigrationReport::default();

    if options.backup {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let backup = timestamped_backup_path(source, &stamp);
        std::fs::copy(source, &backup).map_err(|e| {
            Error::Config(format!(
                "failed to back up source to {}: {e}",
                backup.display()
            ))
        })?;
        info!("backed up source database to {}", backup.display());
        report.backup = Some(backup);
    }

    let dst = Connection::open(dest).map_err(|e| {
        Error::Database(format!(
            "failed to open destination database {}: {e}",
            dest.display()
        ))
    })?;
    apply_encryption_pragmas(&dst, key)?;
    dst.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })
    .map_err(|e| {
        Error::Integrity(format!(
            "destination {} is not readable with the supplied key: {e}",
            dest.display()
        ))
    })?;

    let tables = source_tables(&src)?;
    info!(
        "migrating {} tables from {} to {}",
        tables.len(),
        source.display(),
        dest.display()
    );

    for (name, create_sql) in &tables {
        let rows_copied = copy_table(&src, &dst, name, create_sql)?;
        info!("migrated table '{name}' ({rows_copied} rows)");
        report.tables.push(TableReport {
            name: name.clone(),
            rows_copied,
        });
    }

    if options.verify {
        for (name, _) in &tables {
            verify_table(&src, &dst, name)?;
        }
        info!("row-count verification passed for {} tables", tables.len());
    }

    Ok(report)
}

/// Source tables in deterministic (name) order, with their DDL.
fn source_tables(src: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = src
        .prepare(
            "SELECT name, sql FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )
        .map_err(|e| Error::Database(format!("failed to enumerate source tables: {e}")))?;

    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(|e| Error::Database(format!("failed to read source tables: {e}")))?;

    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Database(format!("failed to collect source tables: {e}")))
}

fn copy_table(src: &Connection, dst: &Connection, table: &str, create_sql: &str) -> Result<u64> {
    let exists: i64 = dst
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE type='table' AND name = ?",
            params![table],
            |row| row.get(0),
        )
        .map_err(|e| Error::Database(format!("failed to inspect destination: {e}")))?;
    if exists == 0 {
        dst.execute_batch(create_sql).map_err(|e| {
            Error::Database(format!(
                "failed to create table '{table}' in destination: {e}"
            ))
        })?;
    }

    let mut select = src
        .prepare(&format!("SELECT * FROM \"{table}\""))
        .map_err(|e| Error::Database(format!("failed to read source table '{table}': {e}")))?;
    let column_count = select.column_count();

    let placeholders = vec!["?"; column_count].join(", ");
    let mut insert = dst
        .prepare(&format!("INSERT INTO \"{table}\" VALUES ({placeholders})"))
        .map_err(|e| {
            Error::Database(format!(
                "destination table '{table}' rejected the source schema: {e}"
            ))
        })?;

    dst.execute_batch("BEGIN")
        .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;

    match stream_rows(&mut select, &mut insert, dst, table, column_count) {
        Ok(copied) => {
            dst.execute_batch("COMMIT").map_err(|e| {
                Error::Database(format!("failed to commit final batch for '{table}': {e}"))
            })?;
            Ok(copied)
        }
        Err(e) => {
            // Keep the destination at its last committed batch.
            if let Err(rollback) = dst.execute_batch("ROLLBACK") {
                warn!("rollback after failed copy of '{table}' also failed: {rollback}");
            }
            Err(e)
        }
    }
}

fn stream_rows(
    select: &mut Statement<'_>,
    insert: &mut Statement<'_>,
    dst: &Connection,
    table: &str,
    column_count: usize,
) -> Result<u64> {
    let mut rows = select.query([]).map_err(|e| row_error(table, 1, e))?;
    let mut copied: u64 = 0;

    loop {
        let row = match rows.next() {
            Ok(Some(row)) => row,
            Ok(None) => break,
            Err(e) => return Err(row_error(table, copied + 1, e)),
        };

        let mut values: Vec<Value> = Vec::with_capacity(column_count);
        for index in 0..column_count {
            values.push(
                row.get::<_, Value>(index)
                    .map_err(|e| row_error(table, copied + 1, e))?,
            );
        }

        insert
            .execute(rusqlite::params_from_iter(values))
            .map_err(|e| row_error(table, copied + 1, e))?;
        copied += 1;

        if copied % BATCH_SIZE == 0 {
            dst.execute_batch("COMMIT; BEGIN").map_err(|e| {
                Error::Database(format!("failed to commit batch for '{table}': {e}"))
            })?;
        }
    }

    Ok(copied)
}

fn row_error(table: &str, row: u64, e: rusqlite::Error) -> Error {
    Error::Migration {
        table: table.to_string(),
        row,
        message: e.to_string(),
    }
}

fn verify_table(src: &Connection, dst: &Connection, table: &str) -> Result<()> {
    let count = |conn: &Connection| {
        conn.query_row(&format!("SELECT count(*) FROM \"{table}\""), [], |row| {
            row.get::<_, i64>(0)
        })
    };

    let source_rows = count(src)
        .map_err(|e| Error::Database(format!("failed to count source '{table}': {e}")))?;
    let dest_rows = count(dst)
        .map_err(|e| Error::Database(format!("failed to count destination '{table}': {e}")))?;

    if source_rows != dest_rows {
        return Err(Error::Verification {
            table: table.to_string(),
            source_rows,
            dest_rows,
        });
    }

    Ok(())
}
