//! Local marker of an authenticated login: `{"status": true, "account": …}`.
//!
//! A UI convenience only; nothing trusts it for authorization.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use veriface_core::Account;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMarker {
    pub status: bool,
    pub account: Account,
}

/// `$XDG_DATA_HOME/veriface/session.json` (~/.local/share/veriface/session.json).
pub fn default_path() -> PathBuf {
    let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.local/share")
    });
    PathBuf::from(data_home).join("veriface/session.json")
}

pub fn save(path: &Path, account: &Account) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let marker = SessionMarker {
        status: true,
        account: account.clone(),
    };
    let json = serde_json::to_vec_pretty(&marker)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

pub fn load(path: &Path) -> Result<Option<SessionMarker>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(
            serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt session file {}", path.display()))?,
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Returns whether a marker existed.
pub fn remove(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn account() -> Account {
        Account {
            id: Uuid::new_v4(),
            full_name: "Test User".into(),
            email: "user@example.com".into(),
            face_image: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/session.json");
        assert!(load(&path).unwrap().is_none());

        let account = account();
        save(&path, &account).unwrap();
        let marker = load(&path).unwrap().unwrap();
        assert!(marker.status);
        assert_eq!(marker.account, account);

        assert!(remove(&path).unwrap());
        assert!(!remove(&path).unwrap());
        assert!(load(&path).unwrap().is_none());
    }

    #[test]
    fn test_marker_uses_account_wire_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        save(&path, &account()).unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["status"], true);
        assert_eq!(raw["account"]["fullName"], "Test User");
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, b"{oops").unwrap();
        assert!(load(&path).is_err());
    }
}
