//! Persistent key/value storage.
//!
//! Values are JSON files in the platform-appropriate config directory:
//!   - Linux: `~/.config/lms/`
//!   - macOS: `~/Library/Application Support/lms/`
//!   - Windows: `%APPDATA%\lms\`

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

const APP_DIR: &str = "lms";

#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    /// Storage rooted in the platform config directory.
    ///
    /// Returns `None` if the platform has no config directory.
    pub fn open_default() -> Option<Self> {
        let dir = dirs::config_dir()?.join(APP_DIR);
        Some(Self { dir })
    }

    /// Storage rooted at an explicit directory.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save a value to persistent storage.
    ///
    /// Returns `true` if the operation succeeded.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.save_raw(key, &json),
            Err(e) => {
                crate::log_error!("storage: failed to serialize '{}': {}", key, e);
                false
            }
        }
    }

    /// Load a value from persistent storage.
    ///
    /// Returns `None` if the key doesn't exist or deserialization fails.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let json = self.load_raw(key)?;
        match serde_json::from_str(&json) {
            Ok(value) => Some(value),
            Err(e) => {
                crate::log_warn!("storage: ignoring unreadable '{}': {}", key, e);
                None
            }
        }
    }

    /// Remove a value from persistent storage.
    pub fn remove(&self, key: &str) {
        let _ = std::fs::remove_file(self.file_path(key));
    }

    /// Check if a key exists in storage.
    pub fn exists(&self, key: &str) -> bool {
        self.file_path(key).is_file()
    }

    fn file_path(&self, key: &str) -> PathBuf {
        // Sanitize key to be a valid filename
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        self.dir.join(format!("{}.json", safe_key))
    }

    fn save_raw(&self, key: &str, value: &str) -> bool {
        if !self.dir.exists() && std::fs::create_dir_all(&self.dir).is_err() {
            return false;
        }
        std::fs::write(self.file_path(key), value).is_ok()
    }

    fn load_raw(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.file_path(key)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::at(tmp.path().join("nested"));

        assert!(!storage.exists("answer"));
        assert!(storage.save("answer", &42u32));
        assert!(storage.exists("answer"));
        assert_eq!(storage.load::<u32>("answer"), Some(42));

        storage.remove("answer");
        assert!(!storage.exists("answer"));
        assert_eq!(storage.load::<u32>("answer"), None);
    }

    #[test]
    fn keys_are_sanitized() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::at(tmp.path());

        assert!(storage.save("a/b:c", &"v"));
        assert!(tmp.path().join("a_b_c.json").is_file());
        assert_eq!(storage.load::<String>("a/b:c").as_deref(), Some("v"));
    }

    #[test]
    fn unreadable_values_load_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::at(tmp.path());
        std::fs::write(tmp.path().join("broken.json"), "{not json").unwrap();
        assert_eq!(storage.load::<u32>("broken"), None);
    }
}
