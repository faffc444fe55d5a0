//! Console user store: Argon2 password hashes in a single JSON file
//!
//! The file maps username -> `{password_hash, created}` and is always written
//! atomically with owner-only permissions. There is no built-in default
//! password: the first run must supply one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persist;

/// Account created on first run
pub const DEFAULT_ADMIN: &str = "admin";

pub const MIN_PASSWORD_LEN: usize = 8;

const USERS_FILE_MODE: u32 = 0o600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub password_hash: String,
    /// Unix timestamp (seconds)
    pub created: f64,
}

type Users = BTreeMap<String, UserRecord>;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("password must be at least 8 characters")]
    PasswordTooShort,

    #[error("old password incorrect")]
    WrongPassword,

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error(
        "no users file at {}; set BURROW_ADMIN_PASSWORD (or admin_password in config) or run `burrow-server passwd` to create the admin account",
        .0.display()
    )]
    BootstrapRequired(PathBuf),

    #[error("users file is unreadable: {0}")]
    Corrupt(String),

    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What `initialize` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Existing,
    Created,
}

pub struct CredentialStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles on the users file
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the admin account if the users file does not exist yet
    pub fn initialize(&self, bootstrap_password: Option<&str>) -> Result<InitOutcome, CredentialError> {
        let _guard = self.write_lock.lock();

        if self.path.exists() {
            persist::set_mode(&self.path, USERS_FILE_MODE)?;
            return Ok(InitOutcome::Existing);
        }

        let password =
            bootstrap_password.ok_or_else(|| CredentialError::BootstrapRequired(self.path.clone()))?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(CredentialError::PasswordTooShort);
        }

        let mut users = Users::new();
        users.insert(
            DEFAULT_ADMIN.to_string(),
            UserRecord {
                password_hash: hash_password(password)?,
                created: now_secs(),
            },
        );
        self.save(&users)?;

        tracing::info!("Created admin account in {}", self.path.display());
        Ok(InitOutcome::Created)
    }

    /// Check a username/password pair. Any read or parse failure is a `false`.
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        let users = match self.load() {
            Ok(users) => users,
            Err(e) => {
                tracing::warn!("Authentication failed closed: {}", e);
                return false;
            }
        };

        match users.get(username) {
            Some(record) => verify_password(password, &record.password_hash),
            None => false,
        }
    }

    pub fn change_password(
        &self,
        username: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), CredentialError> {
        if new_password.chars().count() < MIN_PASSWORD_LEN {
            return Err(CredentialError::PasswordTooShort);
        }

        let _guard = self.write_lock.lock();
        let mut users = self.load()?;
        let record = users
            .get_mut(username)
            .ok_or_else(|| CredentialError::UnknownUser(username.to_string()))?;

        if !verify_password(old_password, &record.password_hash) {
            return Err(CredentialError::WrongPassword);
        }

        record.password_hash = hash_password(new_password)?;
        self.save(&users)?;

        tracing::info!("Password changed for {}", username);
        Ok(())
    }

    /// Administrative reset; creates the user when missing
    pub fn set_password(&self, username: &str, new_password: &str) -> Result<(), CredentialError> {
        if new_password.chars().count() < MIN_PASSWORD_LEN {
            return Err(CredentialError::PasswordTooShort);
        }

        let _guard = self.write_lock.lock();
        let mut users = if self.path.exists() {
            self.load()?
        } else {
            Users::new()
        };

        let password_hash = hash_password(new_password)?;
        users
            .entry(username.to_string())
            .and_modify(|record| record.password_hash = password_hash.clone())
            .or_insert_with(|| UserRecord {
                password_hash,
                created: now_secs(),
            });
        self.save(&users)?;

        tracing::info!("Password set for {}", username);
        Ok(())
    }

    #[cfg(test)]
    fn has_user(&self, username: &str) -> bool {
        self.load()
            .map(|users| users.contains_key(username))
            .unwrap_or(false)
    }

    fn load(&self) -> Result<Users, CredentialError> {
        let content = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&content).map_err(|e| CredentialError::Corrupt(e.to_string()))
    }

    fn save(&self, users: &Users) -> Result<(), CredentialError> {
        persist::write_json_atomic(&self.path, users, USERS_FILE_MODE)?;
        Ok(())
    }
}

fn hash_password(password: &str) -> Result<String, CredentialError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CredentialError::Hash(e.to_string()))
}

fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> CredentialStore {
        CredentialStore::new(dir.path().join("users.json"))
    }

    fn stored_hash(store: &CredentialStore) -> String {
        store.load().unwrap()[DEFAULT_ADMIN].password_hash.clone()
    }

    #[test]
    fn test_initialize_requires_bootstrap_password() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let result = store.initialize(None);
        assert!(matches!(result, Err(CredentialError::BootstrapRequired(_))));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_initialize_rejects_short_bootstrap_password() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let result = store.initialize(Some("short"));
        assert!(matches!(result, Err(CredentialError::PasswordTooShort)));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_initialize_creates_admin_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        assert_eq!(
            store.initialize(Some("first-run-pass")).unwrap(),
            InitOutcome::Created
        );
        assert!(store.authenticate(DEFAULT_ADMIN, "first-run-pass"));

        // A second boot leaves the existing file alone
        assert_eq!(
            store.initialize(Some("another-pass")).unwrap(),
            InitOutcome::Existing
        );
        assert!(store.authenticate(DEFAULT_ADMIN, "first-run-pass"));
        assert!(!store.authenticate(DEFAULT_ADMIN, "another-pass"));
    }

    #[cfg(unix)]
    #[test]
    fn test_users_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.initialize(Some("first-run-pass")).unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_authenticate_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        // Missing file
        assert!(!store.authenticate(DEFAULT_ADMIN, "anything"));

        // Corrupt file
        std::fs::write(store.path(), "not json").unwrap();
        assert!(!store.authenticate(DEFAULT_ADMIN, "anything"));

        // Unknown user
        std::fs::remove_file(store.path()).unwrap();
        store.initialize(Some("first-run-pass")).unwrap();
        assert!(!store.authenticate("root", "first-run-pass"));
    }

    #[test]
    fn test_change_password_too_short_keeps_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.initialize(Some("first-run-pass")).unwrap();
        let before = stored_hash(&store);

        let result = store.change_password(DEFAULT_ADMIN, "first-run-pass", "short");
        assert!(matches!(result, Err(CredentialError::PasswordTooShort)));
        assert_eq!(stored_hash(&store), before);
    }

    #[test]
    fn test_change_password_wrong_old_keeps_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.initialize(Some("first-run-pass")).unwrap();
        let before = stored_hash(&store);

        let result = store.change_password(DEFAULT_ADMIN, "wrong-old-pass", "a-new-password");
        assert!(matches!(result, Err(CredentialError::WrongPassword)));
        assert_eq!(stored_hash(&store), before);
    }

    #[test]
    fn test_change_password_switches_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.initialize(Some("first-run-pass")).unwrap();

        store
            .change_password(DEFAULT_ADMIN, "first-run-pass", "a-new-password")
            .unwrap();

        assert!(store.authenticate(DEFAULT_ADMIN, "a-new-password"));
        assert!(!store.authenticate(DEFAULT_ADMIN, "first-run-pass"));
    }

    #[test]
    fn test_set_password_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.set_password(DEFAULT_ADMIN, "reset-password").unwrap();
        assert!(store.has_user(DEFAULT_ADMIN));
        assert!(store.authenticate(DEFAULT_ADMIN, "reset-password"));
    }
}
