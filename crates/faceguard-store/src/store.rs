//! SQLite-backed credential store.
//!
//! Layout: one `credentials` table of `(namespace, key) → value` rows under the
//! `faceguard` namespace. Keys: `reference_descriptor` (sealed JSON),
//! `password_digest`, `registered`, `registered_at`, `user_name`.

use crate::crypto::{self, CryptoError, StoreKey};
use chrono::{DateTime, Utc};
use faceguard_core::{Descriptor, PasswordVerifier};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

const NAMESPACE: &str = "faceguard";
const KEY_DESCRIPTOR: &str = "reference_descriptor";
const KEY_PASSWORD: &str = "password_digest";
const KEY_REGISTERED: &str = "registered";
const KEY_REGISTERED_AT: &str = "registered_at";
const KEY_USER_NAME: &str = "user_name";

pub const DEFAULT_USER_NAME: &str = "User";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS credentials (
    namespace  TEXT NOT NULL,
    key        TEXT NOT NULL,
    value      BLOB NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (namespace, key)
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to open credential store at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("storage write failed: {0}")]
    Write(#[source] rusqlite::Error),
    #[error("storage read failed: {0}")]
    Read(#[source] rusqlite::Error),
    #[error("descriptor encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("descriptor sealing failed: {0}")]
    Crypto(#[from] CryptoError),
}

/// Encrypted local store for the reference descriptor and fallback password.
///
/// Writes are serialized through a single connection behind a mutex.
pub struct CredentialStore {
    conn: Mutex<Connection>,
    key: StoreKey,
}

impl CredentialStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path, key: StoreKey) -> Result<Self, StoreError> {
        let open_err = |source| StoreError::Open {
            path: path.display().to_string(),
            source,
        };
        let conn = Connection::open(path).map_err(open_err)?;
        conn.execute_batch(SCHEMA).map_err(open_err)?;
        tracing::info!(path = %path.display(), "credential store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            key,
        })
    }

    /// Non-persistent store, for tests and dry runs.
    pub fn open_in_memory(key: StoreKey) -> Result<Self, StoreError> {
        let open_err = |source| StoreError::Open {
            path: ":memory:".into(),
            source,
        };
        let conn = Connection::open_in_memory().map_err(open_err)?;
        conn.execute_batch(SCHEMA).map_err(open_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            key,
        })
    }

    /// Seal and persist the reference descriptor, replacing any previous one.
    pub fn save_reference_descriptor(&self, descriptor: &Descriptor) -> Result<(), StoreError> {
        let json = serde_json::to_vec(descriptor)?;
        let sealed = self.key.seal(&json)?;
        self.write(|tx| put(tx, KEY_DESCRIPTOR, &sealed))?;
        tracing::info!(dimension = descriptor.dimension(), "reference descriptor saved");
        Ok(())
    }

    /// The enrolled reference descriptor.
    ///
    /// `None` when nothing is enrolled, and also when the stored blob cannot be
    /// read, decrypted, or parsed: an unreadable identity counts as no identity.
    pub fn reference_descriptor(&self) -> Option<Descriptor> {
        let sealed = match self.get(KEY_DESCRIPTOR) {
            Ok(Some(v)) => v,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "reference descriptor unreadable");
                return None;
            }
        };
        let json = match self.key.open(&sealed) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "reference descriptor failed to decrypt");
                return None;
            }
        };
        match serde_json::from_slice(&json) {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                tracing::warn!(error = %e, "reference descriptor failed to parse");
                None
            }
        }
    }

    /// Store a one-way digest of the fallback password.
    pub fn set_password(&self, password: &str) -> Result<(), StoreError> {
        let digest = crypto::password_digest(password);
        self.write(|tx| put(tx, KEY_PASSWORD, digest.as_bytes()))?;
        tracing::info!("fallback password set");
        Ok(())
    }

    pub fn has_password(&self) -> bool {
        matches!(self.get(KEY_PASSWORD), Ok(Some(_)))
    }

    /// `true` iff `password` is exactly the one last passed to [`set_password`](Self::set_password).
    pub fn verify_password(&self, password: &str) -> bool {
        match self.get_text(KEY_PASSWORD) {
            Ok(Some(stored)) => crypto::verify_digest(&stored, password),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "password digest unreadable");
                false
            }
        }
    }

    pub fn set_registered(&self, registered: bool) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let flag: &[u8] = if registered { b"true" } else { b"false" };
        self.write(|tx| {
            put(tx, KEY_REGISTERED, flag)?;
            if registered {
                put(tx, KEY_REGISTERED_AT, now.as_bytes())
            } else {
                delete(tx, KEY_REGISTERED_AT)
            }
        })?;
        tracing::info!(registered, "registration flag updated");
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        match self.get_text(KEY_REGISTERED) {
            Ok(v) => v.as_deref() == Some("true"),
            Err(e) => {
                tracing::warn!(error = %e, "registration flag unreadable");
                false
            }
        }
    }

    pub fn registered_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.get_text(KEY_REGISTERED_AT).ok()??;
        DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn set_user_name(&self, name: &str) -> Result<(), StoreError> {
        self.write(|tx| put(tx, KEY_USER_NAME, name.as_bytes()))
    }

    /// Owner display name, `"User"` if never set.
    pub fn user_name(&self) -> Result<String, StoreError> {
        Ok(self
            .get_text(KEY_USER_NAME)?
            .unwrap_or_else(|| DEFAULT_USER_NAME.to_string()))
    }

    /// Erase every entry in one transaction.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        self.write(|tx| {
            tx.execute(
                "DELETE FROM credentials WHERE namespace = ?1",
                params![NAMESPACE],
            )
            .map(|_| ())
        })?;
        tracing::info!("credential store cleared");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> rusqlite::Result<()>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(StoreError::Write)?;
        f(&tx).map_err(StoreError::Write)?;
        tx.commit().map_err(StoreError::Write)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.lock()
            .query_row(
                "SELECT value FROM credentials WHERE namespace = ?1 AND key = ?2",
                params![NAMESPACE, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::Read)
    }

    fn get_text(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .get(key)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }
}

impl PasswordVerifier for CredentialStore {
    fn verify_password(&self, password: &str) -> bool {
        CredentialStore::verify_password(self, password)
    }
}

fn put(tx: &Transaction<'_>, key: &str, value: &[u8]) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO credentials (namespace, key, value, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (namespace, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![NAMESPACE, key, value, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn delete(tx: &Transaction<'_>, key: &str) -> rusqlite::Result<()> {
    tx.execute(
        "DELETE FROM credentials WHERE namespace = ?1 AND key = ?2",
        params![NAMESPACE, key],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CredentialStore {
        CredentialStore::open_in_memory(StoreKey::embedded()).unwrap()
    }

    fn descriptor() -> Descriptor {
        Descriptor::new((0..128).map(|i| (i as f32 * 0.37).sin()).collect())
    }

    #[test]
    fn test_descriptor_round_trip() {
        let store = store();
        assert!(store.reference_descriptor().is_none());

        let d = descriptor();
        store.save_reference_descriptor(&d).unwrap();
        assert_eq!(store.reference_descriptor(), Some(d));
    }

    #[test]
    fn test_descriptor_overwrite() {
        let store = store();
        store.save_reference_descriptor(&Descriptor::new(vec![1.0])).unwrap();
        store.save_reference_descriptor(&Descriptor::new(vec![2.0, 3.0])).unwrap();
        assert_eq!(store.reference_descriptor(), Some(Descriptor::new(vec![2.0, 3.0])));
    }

    #[test]
    fn test_descriptor_not_stored_in_clear() {
        let store = store();
        store.save_reference_descriptor(&Descriptor::new(vec![0.125, 0.5])).unwrap();
        let raw = store.get(KEY_DESCRIPTOR).unwrap().unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(!text.contains("0.125"));
    }

    #[test]
    fn test_corrupt_descriptor_reads_as_not_enrolled() {
        let store = store();
        store.write(|tx| put(tx, KEY_DESCRIPTOR, b"garbage-bytes-here")).unwrap();
        assert!(store.reference_descriptor().is_none());
    }

    #[test]
    fn test_descriptor_under_other_key_is_absent() {
        let store = store();
        store.save_reference_descriptor(&descriptor()).unwrap();
        let sealed = store.get(KEY_DESCRIPTOR).unwrap().unwrap();

        let other = CredentialStore::open_in_memory(StoreKey::from_secret(b"keystore")).unwrap();
        other.write(|tx| put(tx, KEY_DESCRIPTOR, &sealed)).unwrap();
        assert!(other.reference_descriptor().is_none());
    }

    #[test]
    fn test_password_never_set() {
        let store = store();
        assert!(!store.has_password());
        assert!(!store.verify_password(""));
        assert!(!store.verify_password("anything"));
    }

    #[test]
    fn test_password_verification() {
        let store = store();
        store.set_password("s3cret!").unwrap();
        assert!(store.has_password());
        assert!(store.verify_password("s3cret!"));
        assert!(!store.verify_password("s3cret"));
        assert!(!store.verify_password("S3CRET!"));

        let raw = store.get_text(KEY_PASSWORD).unwrap().unwrap();
        assert!(!raw.contains("s3cret!"));
    }

    #[test]
    fn test_password_replace() {
        let store = store();
        store.set_password("first").unwrap();
        store.set_password("second").unwrap();
        assert!(!store.verify_password("first"));
        assert!(store.verify_password("second"));
    }

    #[test]
    fn test_password_verifier_trait() {
        let store = store();
        store.set_password("pass").unwrap();
        let verifier: &dyn PasswordVerifier = &store;
        assert!(verifier.verify_password("pass"));
    }

    #[test]
    fn test_registration_flag() {
        let store = store();
        assert!(!store.is_registered());
        assert!(store.registered_at().is_none());

        store.set_registered(true).unwrap();
        assert!(store.is_registered());
        assert!(store.registered_at().is_some());

        store.set_registered(false).unwrap();
        assert!(!store.is_registered());
        assert!(store.registered_at().is_none());
    }

    #[test]
    fn test_user_name_default() {
        let store = store();
        assert_eq!(store.user_name().unwrap(), DEFAULT_USER_NAME);
        store.set_user_name("Ada").unwrap();
        assert_eq!(store.user_name().unwrap(), "Ada");
    }

    #[test]
    fn test_clear_all() {
        let store = store();
        store.save_reference_descriptor(&descriptor()).unwrap();
        store.set_password("pass").unwrap();
        store.set_registered(true).unwrap();
        store.set_user_name("Ada").unwrap();

        store.clear_all().unwrap();

        assert!(store.reference_descriptor().is_none());
        assert!(!store.verify_password("pass"));
        assert!(!store.is_registered());
        assert_eq!(store.user_name().unwrap(), DEFAULT_USER_NAME);
    }

    #[test]
    fn test_persists_across_reopen() {
        let path = std::env::temp_dir().join(format!(
            "faceguard-store-test-{}.db",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        {
            let store = CredentialStore::open(&path, StoreKey::embedded()).unwrap();
            store.save_reference_descriptor(&descriptor()).unwrap();
            store.set_password("pass").unwrap();
            store.set_registered(true).unwrap();
        }

        let store = CredentialStore::open(&path, StoreKey::embedded()).unwrap();
        assert_eq!(store.reference_descriptor(), Some(descriptor()));
        assert!(store.verify_password("pass"));
        assert!(store.is_registered());

        drop(store);
        let _ = std::fs::remove_file(&path);
    }
}
