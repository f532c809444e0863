use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::Local;
use recap_common::{Error, Result};
use tracing::{info, warn};

/// First 16 bytes of every unencrypted SQLite database file. An encrypted
/// file never begins with this signature.
pub const PLAINTEXT_HEADER: &[u8; 16] = b"SQLite format 3\0";

/// One-time startup check: if the file at `path` is an unencrypted SQLite
/// database, move it to a timestamped backup before any encrypted handle
/// opens over the same path.
///
/// Idempotent. Returns the backup path when a relocation happened, `None`
/// when the path is missing, in-memory, too short to carry a header, or
/// already encrypted. Plaintext backups are never deleted by this code.
pub fn backup_if_plaintext(path: &Path) -> Result<Option<PathBuf>> {
    if path.to_str() == Some(":memory:") || !path.exists() {
        return Ok(None);
    }

    let mut file = std::fs::File::open(path).map_err(|e| {
        Error::Config(format!(
            "failed to open {} for header check: {e}",
            path.display()
        ))
    })?;

    let mut header = [0u8; PLAINTEXT_HEADER.len()];
    match file.read_exact(&mut header) {
        Ok(()) => {}
        // Empty or near-empty file: nothing worth relocating.
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(Error::Config(format!(
                "failed to read header of {}: {e}",
                path.display()
            )));
        }
    }
    drop(file);

    if &header != PLAINTEXT_HEADER {
        return Ok(None);
    }

    let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
    let backup = timestamped_backup_path(path, &stamp);

    // The main file moves first, and a failure here is fatal before any
    // sidecar is touched, so no partial state can exist.
    std::fs::rename(path, &backup).map_err(|e| {
        Error::Config(format!(
            "failed to move plaintext database {} to {}: {e}",
            path.display(),
            backup.display()
        ))
    })?;
    info!(
        "unencrypted database detected, moved {} to {}",
        path.display(),
        backup.display()
    );

    for ext in ["-wal", "-shm"] {
        let sidecar = sibling_with_suffix(path, ext);
        if !sidecar.exists() {
            continue;
        }
        let sidecar_backup = sibling_with_suffix(&backup, ext);
        if let Err(e) = std::fs::rename(&sidecar, &sidecar_backup) {
            warn!(
                "failed to relocate sidecar {}: {e}",
                sidecar.display()
            );
        }
    }

    Ok(Some(backup))
}

/// `chat.db` becomes `chat_backup_<YYYYMMDD_HHMMSS>.db` next to the original.
pub(crate) fn timestamped_backup_path(path: &Path, stamp: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("database");
    path.with_file_name(format!("{stem}_backup_{stamp}.db"))
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn plaintext_body(extra_zeroes: usize) -> Vec<u8> {
        let mut bytes = PLAINTEXT_HEADER.to_vec();
        bytes.extend(std::iter::repeat(0u8).take(extra_zeroes));
        bytes
    }

    fn backups_in(dir: &Path, stem: &str) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&format!("{stem}_backup_")) && n.ends_with(".db"))
            })
            .collect()
    }

    #[test]
    fn relocates_plaintext_database() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("chat.db");
        std::fs::write(&db, plaintext_body(1000)).unwrap();

        let backup = backup_if_plaintext(&db)
            .expect("guard should succeed")
            .expect("a plaintext file must be relocated");

        assert!(!db.exists());
        assert!(backup.exists());
        assert_eq!(std::fs::read(&backup).unwrap().len(), 16 + 1000);

        let backups = backups_in(dir.path(), "chat");
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0], backup);
    }

    #[test]
    fn missing_path_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let result = backup_if_plaintext(&dir.path().join("absent.db")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn in_memory_path_is_a_noop() {
        let result = backup_if_plaintext(Path::new(":memory:")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn short_file_left_untouched() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("tiny.db");
        std::fs::write(&db, &PLAINTEXT_HEADER[..10]).unwrap();

        let result = backup_if_plaintext(&db).unwrap();

        assert!(result.is_none());
        assert_eq!(std::fs::read(&db).unwrap(), &PLAINTEXT_HEADER[..10]);
    }

    #[test]
    fn non_matching_header_left_untouched() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("encrypted.db");
        let body: Vec<u8> = (0u8..64).collect();
        std::fs::write(&db, &body).unwrap();

        let result = backup_if_plaintext(&db).unwrap();

        assert!(result.is_none());
        assert_eq!(std::fs::read(&db).unwrap(), body);
    }

    #[test]
    fn sidecars_move_with_the_same_suffix() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("chat.db");
        std::fs::write(&db, plaintext_body(32)).unwrap();
        std::fs::write(dir.path().join("chat.db-wal"), b"wal").unwrap();
        std::fs::write(dir.path().join("chat.db-shm"), b"shm").unwrap();

        let backup = backup_if_plaintext(&db).unwrap().unwrap();

        let wal = PathBuf::from(format!("{}-wal", backup.display()));
        let shm = PathBuf::from(format!("{}-shm", backup.display()));
        assert!(wal.exists());
        assert!(shm.exists());
        assert!(!dir.path().join("chat.db-wal").exists());
        assert!(!dir.path().join("chat.db-shm").exists());
    }

    #[test]
    fn second_run_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("chat.db");
        std::fs::write(&db, plaintext_body(64)).unwrap();

        backup_if_plaintext(&db).unwrap().unwrap();
        let second = backup_if_plaintext(&db).unwrap();

        assert!(second.is_none());
        assert_eq!(backups_in(dir.path(), "chat").len(), 1);
    }
}
