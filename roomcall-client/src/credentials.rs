/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Persisted sign-in state.
//!
//! A signed-in user's display name seeds the name announced on join.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRecord {
    pub token: String,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl AuthRecord {
    /// The name to show in a room: the display name, else the username.
    pub fn preferred_name(&self) -> &str {
        match self.display_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.username,
        }
    }
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("credential store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential store is corrupt: {0}")]
    Format(#[from] serde_json::Error),
}

pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when nobody is signed in.
    fn load(&self) -> Result<Option<AuthRecord>, CredentialError>;

    fn save(&self, record: &AuthRecord) -> Result<(), CredentialError>;

    fn clear(&self) -> Result<(), CredentialError>;
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    record: Mutex<Option<AuthRecord>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<AuthRecord>> {
        self.record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<AuthRecord>, CredentialError> {
        Ok(self.slot().clone())
    }

    fn save(&self, record: &AuthRecord) -> Result<(), CredentialError> {
        *self.slot() = Some(record.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialError> {
        *self.slot() = None;
        Ok(())
    }
}

/// Stores the record as a JSON file.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<AuthRecord>, CredentialError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn save(&self, record: &AuthRecord) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(record)?)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(display_name: Option<&str>) -> AuthRecord {
        AuthRecord {
            token: "tok".to_string(),
            username: "alice".to_string(),
            display_name: display_name.map(str::to_string),
        }
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("roomcall-{}", uuid::Uuid::new_v4()))
            .join("auth.json")
    }

    #[test]
    fn preferred_name_falls_back_to_username() {
        assert_eq!(record(Some("Alice A.")).preferred_name(), "Alice A.");
        assert_eq!(record(Some("  ")).preferred_name(), "alice");
        assert_eq!(record(None).preferred_name(), "alice");
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryCredentialStore::new();
        assert_eq!(store.load().unwrap(), None);
        store.save(&record(None)).unwrap();
        assert_eq!(store.load().unwrap(), Some(record(None)));
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn file_store_persists_across_instances() {
        let path = temp_path();
        let store = FileCredentialStore::new(&path);
        assert_eq!(store.load().unwrap(), None);
        store.save(&record(Some("Alice"))).unwrap();

        let reopened = FileCredentialStore::new(&path);
        assert_eq!(reopened.load().unwrap(), Some(record(Some("Alice"))));
        let json = std::fs::read_to_string(&path).unwrap();
        assert!(json.contains("\"displayName\""));

        reopened.clear().unwrap();
        reopened.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn corrupt_file_is_a_format_error() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        let err = FileCredentialStore::new(&path).load().unwrap_err();
        assert!(matches!(err, CredentialError::Format(_)));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
