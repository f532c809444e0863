use std::path::{Path, PathBuf};

use recap_common::{Error, Result};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::info;

/// SQLCipher raw keys are 256 bits, carried as 64 hex characters.
const KEY_BYTES: usize = 32;
const KEY_HEX_LEN: usize = 64;

/// Resolves, generates, and persists the database encryption key.
///
/// Resolution order, first hit wins: the operator secret, the local key
/// file, then a freshly generated key persisted to the local key file.
/// Exactly one key is ever active per database file; once written it is
/// never regenerated or overwritten.
pub struct KeyManager {
    secret_path: PathBuf,
    key_file: PathBuf,
}

impl KeyManager {
    pub fn new(secret_path: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            secret_path: secret_path.into(),
            key_file: key_file.into(),
        }
    }

    pub fn load_or_create(&self) -> Result<String> {
        if self.secret_path.is_file() {
            let raw = std::fs::read_to_string(&self.secret_path).map_err(|e| {
                Error::Config(format!(
                    "failed to read database key secret at {}: {e}",
                    self.secret_path.display()
                ))
            })?;
            let key = validate_key(&raw).map_err(|e| {
                Error::Config(format!("secret at {}: {e}", self.secret_path.display()))
            })?;
            info!(
                "using database key from secret at {}",
                self.secret_path.display()
            );
            return Ok(key);
        }

        if self.key_file.is_file() {
            let raw = std::fs::read_to_string(&self.key_file).map_err(|e| {
                Error::Config(format!(
                    "failed to read key file at {}: {e}",
                    self.key_file.display()
                ))
            })?;
            // An unreadable key is fatal: regenerating over it could orphan
            // an already-encrypted database.
            let key = validate_key(&raw).map_err(|e| {
                Error::Config(format!("key file at {}: {e}", self.key_file.display()))
            })?;
            return Ok(key);
        }

        let key = generate_key()?;
        if let Some(parent) = self.key_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.key_file, format!("{key}\n"))?;
        restrict_to_owner(&self.key_file)?;
        info!(
            "generated new database key, persisted to {}",
            self.key_file.display()
        );
        Ok(key)
    }
}

/// Validate key material as exactly 64 hex characters (case-insensitive,
/// surrounding whitespace tolerated) and normalize to lowercase.
pub fn validate_key(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.len() != KEY_HEX_LEN {
        return Err(Error::Config(format!(
            "database key must be {KEY_HEX_LEN} hex characters, got {}",
            trimmed.len()
        )));
    }
    if !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::Config(
            "database key contains non-hex characters".into(),
        ));
    }
    Ok(trimmed.to_ascii_lowercase())
}

fn generate_key() -> Result<String> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; KEY_BYTES];
    rng.fill(&mut bytes)
        .map_err(|_| Error::Config("failed to generate key material".into()))?;
    Ok(hex::encode(bytes))
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> KeyManager {
        KeyManager::new(
            dir.path().join("secret"),
            dir.path().join("data").join("recap.db.key"),
        )
    }

    #[test]
    fn generates_key_when_nothing_exists() {
        let dir = TempDir::new().unwrap();
        let km = manager(&dir);

        let key = km.load_or_create().expect("should generate a key");

        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, key.to_ascii_lowercase());

        let persisted =
            std::fs::read_to_string(dir.path().join("data").join("recap.db.key")).unwrap();
        assert_eq!(persisted.trim(), key);
    }

    #[test]
    fn key_file_round_trips_byte_identical() {
        let dir = TempDir::new().unwrap();
        let km = manager(&dir);

        let first = km.load_or_create().unwrap();
        let second = km.load_or_create().unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn secret_takes_precedence_over_key_file() {
        let dir = TempDir::new().unwrap();
        let km = manager(&dir);

        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::write(
            dir.path().join("data").join("recap.db.key"),
            format!("{}\n", "b".repeat(64)),
        )
        .unwrap();
        std::fs::write(dir.path().join("secret"), format!("{}\n", "A".repeat(64))).unwrap();

        let key = km.load_or_create().unwrap();

        // Secret wins, normalized to lowercase.
        assert_eq!(key, "a".repeat(64));
    }

    #[test]
    fn invalid_key_file_is_fatal_and_never_regenerated() {
        let dir = TempDir::new().unwrap();
        let km = manager(&dir);

        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        let key_path = dir.path().join("data").join("recap.db.key");
        std::fs::write(&key_path, "definitely-not-a-key\n").unwrap();

        let err = km.load_or_create().expect_err("invalid key must be fatal");
        assert!(matches!(err, Error::Config(_)));

        // The bad file must be left exactly as found.
        let contents = std::fs::read_to_string(&key_path).unwrap();
        assert_eq!(contents, "definitely-not-a-key\n");
    }

    #[test]
    fn validate_key_rejects_malformed_input() {
        let too_short = "a".repeat(63);
        let too_long = "a".repeat(65);
        let non_hex = "g".repeat(64);
        for bad in ["", "abc", too_short.as_str(), too_long.as_str(), non_hex.as_str()] {
            assert!(
                validate_key(bad).is_err(),
                "expected rejection for {bad:?}"
            );
        }
    }

    #[test]
    fn validate_key_accepts_and_normalizes_mixed_case() {
        let key = validate_key(&format!("  {}\n", "AbCd".repeat(16))).unwrap();
        assert_eq!(key, "abcd".repeat(16));
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let km = manager(&dir);
        km.load_or_create().unwrap();

        let mode = std::fs::metadata(dir.path().join("data").join("recap.db.key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
