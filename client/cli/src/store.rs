//! JSON key-value store
//!
//! Every record is one pretty-printed JSON file below the data directory.
//! Writes go to a sibling temp file first and are renamed into place so a
//! concurrent reader never sees half a record.

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct JsonStore {
    root: PathBuf,
}

impl JsonStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for a record, `dir/<encoded key>.json`.
    pub fn record_path(&self, dir: &str, key: &str) -> PathBuf {
        self.root.join(dir).join(format!("{}.json", encode_key(key)))
    }

    /// Read a record. A missing file is `Ok(None)`, a malformed one is an error.
    pub fn read<T: DeserializeOwned>(&self, dir: &str, key: &str) -> anyhow::Result<Option<T>> {
        let path = self.record_path(dir, key);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let value = serde_json::from_str(&content)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(value))
    }

    pub fn write<T: Serialize>(&self, dir: &str, key: &str, value: &T) -> anyhow::Result<()> {
        let path = self.record_path(dir, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, content).with_context(|| format!("write {}", tmp.display()))?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("rename into {}", path.display()));
        }
        Ok(())
    }

    /// Remove a record. Returns whether a file was actually deleted.
    pub fn remove(&self, dir: &str, key: &str) -> anyhow::Result<bool> {
        let path = self.record_path(dir, key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }

    /// Keys of every record in `dir`.
    pub fn keys(&self, dir: &str) -> anyhow::Result<Vec<String>> {
        let dir_path = self.root.join(dir);
        let entries = match fs::read_dir(&dir_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("list {}", dir_path.display())),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(".json") {
                match urlencoding::decode(stem) {
                    Ok(key) => keys.push(key.into_owned()),
                    Err(e) => tracing::debug!("skipping {}: {}", name, e),
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// File stem for a key. User ids come from the chat platform, so the
/// mapping has to be one-to-one: every byte outside `[A-Za-z0-9-._~]` is
/// percent-encoded, which also rules out path separators.
pub fn encode_key(key: &str) -> String {
    urlencoding::encode(key).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        count: u32,
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let record = Record {
            name: "alice".to_string(),
            count: 3,
        };
        store.write("users", "alice", &record).unwrap();

        let fetched: Option<Record> = store.read("users", "alice").unwrap();
        assert_eq!(fetched, Some(record));
    }

    #[test]
    fn test_missing_record_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let fetched: Option<Record> = store.read("users", "nobody").unwrap();
        assert!(fetched.is_none());
    }

    #[test]
    fn test_malformed_record_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let path = store.record_path("users", "broken");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();

        let fetched: anyhow::Result<Option<Record>> = store.read("users", "broken");
        assert!(fetched.is_err());
    }

    #[test]
    fn test_keys_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        store.write("cache", "b", &1u32).unwrap();
        store.write("cache", "a", &2u32).unwrap();
        assert_eq!(store.keys("cache").unwrap(), vec!["a", "b"]);

        assert!(store.remove("cache", "a").unwrap());
        assert!(!store.remove("cache", "a").unwrap());
        assert_eq!(store.keys("cache").unwrap(), vec!["b"]);
        assert!(store.keys("nothing-here").unwrap().is_empty());
    }

    #[test]
    fn test_encode_key() {
        assert_eq!(encode_key("user-42_x.y"), "user-42_x.y");
        assert_eq!(encode_key("../etc/passwd"), "..%2Fetc%2Fpasswd");
        assert_eq!(encode_key("a b/c"), "a%20b%2Fc");
        assert_ne!(encode_key("alice@example"), encode_key("alice_example"));
    }

    #[test]
    fn test_distinct_keys_get_distinct_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        store.write("users", "a@b", &1u32).unwrap();
        store.write("users", "a_b", &2u32).unwrap();
        store.write("users", "a/b", &3u32).unwrap();

        assert_eq!(store.read::<u32>("users", "a@b").unwrap(), Some(1));
        assert_eq!(store.read::<u32>("users", "a_b").unwrap(), Some(2));
        assert_eq!(store.read::<u32>("users", "a/b").unwrap(), Some(3));
        // Keys come back as written
        assert_eq!(store.keys("users").unwrap(), vec!["a/b", "a@b", "a_b"]);
    }
}
