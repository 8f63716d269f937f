//! Key/value and key/value-of-map persistence, plus timestamped
//! checkpoint snapshotting of the configuration directory.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use serde_json::Value;

use crate::error::ConfigError;

pub type KvMap = HashMap<String, String>;
pub type KvMapOfMap = HashMap<String, HashMap<String, String>>;

const CHECKPOINT_FORMAT: &str = "%Y%m%d-%H:%M:%S";

pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ConfigStore { dir: dir.into() }
    }

    fn path_for(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Reads a flat key→value JSON file (e.g. `defaults.json`).
    pub fn read_map(&self, file_name: &str) -> Result<KvMap, ConfigError> {
        let path = self.path_for(file_name);
        if !path.exists() {
            return Ok(KvMap::new());
        }
        let text = fs::read_to_string(&path)?;
        let value: Value = serde_json::from_str(&text)?;
        value_to_kv_map(&value)
    }

    pub fn write_map(&self, file_name: &str, map: &KvMap) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(file_name);
        let text = serde_json::to_string_pretty(map)?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Reads a key→(key→value) JSON file (e.g. `observer.json`).
    pub fn read_map_of_map(&self, file_name: &str) -> Result<KvMapOfMap, ConfigError> {
        let path = self.path_for(file_name);
        if !path.exists() {
            return Ok(KvMapOfMap::new());
        }
        let text = fs::read_to_string(&path)?;
        let value: Value = serde_json::from_str(&text)?;
        let Value::Object(outer) = value else {
            return Err(ConfigError::InvalidValue {
                key: file_name.to_string(),
                reason: "expected a JSON object".to_string(),
            });
        };
        let mut result = KvMapOfMap::new();
        for (k, v) in outer {
            result.insert(k, value_to_kv_map(&v)?);
        }
        Ok(result)
    }

    pub fn write_map_of_map(&self, file_name: &str, map: &KvMapOfMap) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(file_name);
        let text = serde_json::to_string_pretty(map)?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Snapshots every tracked config file into
    /// `<dir>/YYYYMMDD-HH:MM:SS/`.
    pub fn checkpoint(&self, file_names: &[&str], now: chrono::DateTime<Local>) -> Result<PathBuf, ConfigError> {
        let stamp = now.format(CHECKPOINT_FORMAT).to_string();
        let checkpoint_dir = self.dir.join(&stamp);
        fs::create_dir_all(&checkpoint_dir)?;
        for name in file_names {
            let src = self.path_for(name);
            if src.exists() {
                fs::copy(&src, checkpoint_dir.join(name))?;
            }
        }
        Ok(checkpoint_dir)
    }

    /// Resolves `readCheckPoint=latest|<timestamp>` to a concrete
    /// checkpoint directory, the lexically-last one for `latest`
    /// since the timestamp format sorts chronologically.
    pub fn resolve_checkpoint(&self, selector: &str) -> Result<PathBuf, ConfigError> {
        if selector == "latest" {
            let mut candidates: Vec<String> = fs::read_dir(&self.dir)?
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|name| NaiveDateTime::parse_from_str(name, CHECKPOINT_FORMAT).is_ok())
                .collect();
            candidates.sort();
            let latest = candidates.pop().ok_or_else(|| ConfigError::InvalidValue {
                key: "readCheckPoint".to_string(),
                reason: "no checkpoints found".to_string(),
            })?;
            Ok(self.dir.join(latest))
        } else {
            let path = self.dir.join(selector);
            if !path.is_dir() {
                return Err(ConfigError::InvalidValue {
                    key: "readCheckPoint".to_string(),
                    reason: format!("no checkpoint named {}", selector),
                });
            }
            Ok(path)
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn value_to_kv_map(value: &Value) -> Result<KvMap, ConfigError> {
    let Value::Object(obj) = value else {
        return Err(ConfigError::InvalidValue {
            key: "<root>".to_string(),
            reason: "expected a JSON object".to_string(),
        });
    };
    let mut map = KvMap::new();
    for (k, v) in obj {
        let s = match v {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        map.insert(k.clone(), s);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn round_trip_flat_map() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        let mut map = KvMap::new();
        map.insert("fps".to_string(), "15".to_string());
        map.insert("simulationMode".to_string(), "true".to_string());
        store.write_map("defaults.json", &map).unwrap();
        let read_back = store.read_map("defaults.json").unwrap();
        assert_eq!(read_back, map);
    }

    #[test]
    fn round_trip_map_of_map() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        let mut outer = KvMapOfMap::new();
        let mut inner = KvMap::new();
        inner.insert("type".to_string(), "file".to_string());
        outer.insert("observerA".to_string(), inner);
        store.write_map_of_map("observer.json", &outer).unwrap();
        let read_back = store.read_map_of_map("observer.json").unwrap();
        assert_eq!(read_back, outer);
    }

    #[test]
    fn missing_file_reads_as_empty_map() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        assert!(store.read_map("nonexistent.json").unwrap().is_empty());
    }

    #[test]
    fn checkpoint_and_resolve_latest_round_trip() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        let mut map = KvMap::new();
        map.insert("k".to_string(), "v".to_string());
        store.write_map("defaults.json", &map).unwrap();

        let stamp = Local.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let checkpoint_dir = store.checkpoint(&["defaults.json"], stamp).unwrap();
        assert!(checkpoint_dir.join("defaults.json").exists());

        let resolved = store.resolve_checkpoint("latest").unwrap();
        assert_eq!(resolved, checkpoint_dir);
    }
}
