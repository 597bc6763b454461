//! Last-used settings persistence.
//!
//! A single JSON record under the user's home directory, read at startup and
//! written after every successful tunnel start. Both fields stay plain
//! strings: they come from and go back to user-facing input.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The last port/domain pair a tunnel was started with.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct LastUsed {
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub domain: String,
}

/// Default record path: `~/.porthole/last_used.json`.
pub fn default_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".porthole").join("last_used.json"))
}

/// Load the record from an explicit path. A missing file is the empty record.
pub fn load_from(path: &Path) -> Result<LastUsed> {
    if !path.exists() {
        return Ok(LastUsed::default());
    }
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Write the record to an explicit path, creating parent directories.
pub fn save_to(path: &Path, record: &LastUsed) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string(record)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Load the record from the default path.
pub fn load() -> Result<LastUsed> {
    match default_path() {
        Some(path) => load_from(&path),
        None => Err(Error::Config("Cannot determine home directory".into())),
    }
}

/// Save the record to the default path.
pub fn save(record: &LastUsed) -> Result<()> {
    match default_path() {
        Some(path) => save_to(&path, record),
        None => Err(Error::Config("Cannot determine home directory".into())),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_loads_default() {
        let dir = TempDir::new().unwrap();
        let record = load_from(&dir.path().join("last_used.json")).unwrap();
        assert_eq!(record, LastUsed::default());
        assert!(record.port.is_empty());
        assert!(record.domain.is_empty());
    }

    #[test]
    fn record_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("last_used.json");
        let record = LastUsed {
            port: "8080".into(),
            domain: "custom.ngrok.io".into(),
        };
        save_to(&path, &record).unwrap();
        assert_eq!(load_from(&path).unwrap(), record);
    }

    #[test]
    fn partial_record_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_used.json");
        std::fs::write(&path, r#"{"port":"3000"}"#).unwrap();
        let record = load_from(&path).unwrap();
        assert_eq!(record.port, "3000");
        assert!(record.domain.is_empty());
    }

    #[test]
    fn corrupt_record_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_used.json");
        std::fs::write(&path, "not json").unwrap();
        let err = load_from(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
