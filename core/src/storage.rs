use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::NamedTempFile;

use crate::error::{CoreError, CoreResult};
use crate::model::LedgerDoc;

/// Durable home of one ledger document.
pub trait LedgerStore: Send {
    fn load(&self) -> CoreResult<Option<LedgerDoc>>;
    fn save(&mut self, doc: &LedgerDoc) -> CoreResult<()>;
    fn location(&self) -> String;
}

/// JSON file replaced atomically on every save: the document is written to a
/// temp file in the same directory, synced, then renamed over the target.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

impl LedgerStore for JsonFileStore {
    fn load(&self) -> CoreResult<Option<LedgerDoc>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(CoreError::Storage(format!(
                    "read {}: {}",
                    self.path.display(),
                    err
                )))
            }
        };
        let doc = serde_json::from_slice(&bytes).map_err(|err| {
            CoreError::LedgerCorrupt(format!("parse {}: {}", self.path.display(), err))
        })?;
        Ok(Some(doc))
    }

    fn save(&mut self, doc: &LedgerDoc) -> CoreResult<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .map_err(|err| CoreError::Storage(format!("create {}: {}", dir.display(), err)))?;

        let json = serde_json::to_vec_pretty(doc)
            .map_err(|err| CoreError::Storage(format!("serialize ledger: {}", err)))?;
        let mut tmp = NamedTempFile::new_in(&dir)
            .map_err(|err| CoreError::Storage(format!("temp file in {}: {}", dir.display(), err)))?;
        tmp.write_all(&json)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|err| CoreError::Storage(format!("write ledger: {}", err)))?;
        tmp.persist(&self.path).map_err(|err| {
            CoreError::Storage(format!("replace {}: {}", self.path.display(), err.error))
        })?;
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-process store. Clones share the same slot, which lets a test drop a
/// ledger and reopen it as a restarted process would.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slot: Arc<Mutex<Option<LedgerDoc>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryStore {
    fn load(&self) -> CoreResult<Option<LedgerDoc>> {
        let slot = self
            .slot
            .lock()
            .map_err(|_| CoreError::Storage("memory store lock poisoned".to_string()))?;
        Ok(slot.clone())
    }

    fn save(&mut self, doc: &LedgerDoc) -> CoreResult<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| CoreError::Storage("memory store lock poisoned".to_string()))?;
        *slot = Some(doc.clone());
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_store_round_trips_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("Foo").join("down.json");
        let mut store = JsonFileStore::new(&path);
        assert!(store.load().expect("load").is_none());

        let mut doc = LedgerDoc::new("Foo".to_string(), "http://a/foo".to_string());
        doc.info.vol_next_url = "http://a/foo?page=2".to_string();
        store.save(&doc).expect("save");
        store.save(&doc).expect("save again");

        let loaded = store.load().expect("load").expect("doc");
        assert_eq!(loaded.info.vol_next_url, "http://a/foo?page=2");

        let entries: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .collect();
        assert_eq!(entries.len(), 1, "only down.json should remain");
    }

    #[test]
    fn truncated_file_is_reported_as_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("down.json");
        fs::write(&path, b"{\"info\": {\"name\": ").unwrap();
        let store = JsonFileStore::new(&path);
        match store.load() {
            Err(CoreError::LedgerCorrupt(_)) => {}
            other => panic!("expected corrupt ledger, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn memory_store_clones_share_state() {
        let mut store = MemoryStore::new();
        let reopened = store.clone();
        store
            .save(&LedgerDoc::new("a".to_string(), String::new()))
            .unwrap();
        assert_eq!(reopened.load().unwrap().unwrap().info.name, "a");
    }
}
