use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::model::{
    now_epoch, ErrorRecord, FileEntry, FileId, FileStatus, JobStatus, JobView, LedgerDoc, Volume,
    VolumeId, VolumeStatus,
};
use crate::storage::{JsonFileStore, LedgerStore};

/// Where a URL duplicate check looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlScope {
    Volume(VolumeId),
    Job,
}

/// Persistent record of one job. Every mutation is flushed to the store
/// before it returns; a failed flush rolls the in-memory document back.
pub struct Ledger {
    doc: LedgerDoc,
    store: Box<dyn LedgerStore>,
    url_index: HashMap<String, Vec<(VolumeId, FileId)>>,
}

impl Ledger {
    /// Opens `<path>/<name>/<ledger_file>`, creating and persisting a fresh
    /// job when it does not exist yet.
    pub fn open_or_create(path: &Path, name: &str, url: &str, ledger_file: &str) -> CoreResult<Self> {
        let store = JsonFileStore::new(path.join(name).join(ledger_file));
        Self::with_store(Box::new(store), name, url)
    }

    pub fn open_existing(path: &Path, name: &str, ledger_file: &str) -> CoreResult<Self> {
        let store = JsonFileStore::new(path.join(name).join(ledger_file));
        if !store.exists() {
            return Err(CoreError::NotFound(store.location()));
        }
        Self::with_store(Box::new(store), name, "")
    }

    pub fn with_store(store: Box<dyn LedgerStore>, name: &str, url: &str) -> CoreResult<Self> {
        match store.load()? {
            Some(doc) => {
                let mut ledger = Self {
                    doc,
                    store,
                    url_index: HashMap::new(),
                };
                ledger.verify()?;
                ledger.rebuild_index();
                debug!(job = %ledger.doc.info.name, location = %ledger.store.location(), "ledger resumed");
                Ok(ledger)
            }
            None => {
                let mut ledger = Self {
                    doc: LedgerDoc::new(name.to_string(), url.to_string()),
                    store,
                    url_index: HashMap::new(),
                };
                ledger.persist()?;
                debug!(job = %name, location = %ledger.store.location(), "ledger created");
                Ok(ledger)
            }
        }
    }

    pub fn document(&self) -> &LedgerDoc {
        &self.doc
    }

    pub fn snapshot(&self) -> JobView {
        JobView::from(&self.doc)
    }

    pub fn location(&self) -> String {
        self.store.location()
    }

    pub fn persist(&mut self) -> CoreResult<()> {
        self.store.save(&self.doc)
    }

    fn commit<R>(&mut self, apply: impl FnOnce(&mut LedgerDoc) -> CoreResult<R>) -> CoreResult<R> {
        let before = self.doc.clone();
        let out = match apply(&mut self.doc) {
            Ok(out) => out,
            Err(err) => {
                self.doc = before;
                return Err(err);
            }
        };
        self.doc.info.touch();
        if let Err(err) = self.store.save(&self.doc) {
            self.doc = before;
            self.rebuild_index();
            return Err(err);
        }
        Ok(out)
    }

    pub fn add_volume(&mut self, name: &str, url: &str, status: VolumeStatus) -> CoreResult<VolumeId> {
        self.commit(|doc| {
            if doc.info.vol_num_dict.contains_key(name) {
                return Err(CoreError::InvalidState(format!("volume [{}] already exists", name)));
            }
            let id = doc.info.vol_num;
            doc.info.vol_num += 1;
            doc.info.vol_num_dict.insert(name.to_string(), id);
            doc.down_list.push(Volume {
                id,
                name: name.to_string(),
                url: url.to_string(),
                status,
                file_num: 0,
                files: Vec::new(),
            });
            Ok(id)
        })
    }

    /// Adds a pending file. URL uniqueness is the caller's concern.
    pub fn add_file(
        &mut self,
        volume_id: VolumeId,
        name: &str,
        url: &str,
        transfer_type: &str,
        extra: Option<Value>,
    ) -> CoreResult<FileId> {
        let file_id = self.commit(|doc| {
            let volume = doc
                .volume_mut(volume_id)
                .ok_or_else(|| CoreError::NotFound(format!("volume {}", volume_id)))?;
            let id = volume.file_num;
            volume.file_num += 1;
            volume.files.push(FileEntry {
                id,
                name: name.to_string(),
                url: url.to_string(),
                transfer_type: transfer_type.to_string(),
                status: FileStatus::Pending,
                extra,
                error: None,
            });
            if volume.status == VolumeStatus::Done {
                volume.status = VolumeStatus::Downloading;
            }
            doc.info.files += 1;
            Ok(id)
        })?;
        self.url_index
            .entry(url.to_string())
            .or_default()
            .push((volume_id, file_id));
        Ok(file_id)
    }

    /// Records a transfer outcome together with its counter and volume
    /// effects. A `done` file never leaves `done`.
    pub fn mark_file(
        &mut self,
        volume_id: VolumeId,
        file_id: FileId,
        status: FileStatus,
        error_detail: Option<String>,
    ) -> CoreResult<()> {
        let current = self
            .doc
            .volume(volume_id)
            .and_then(|vol| vol.file(file_id))
            .map(|file| file.status)
            .ok_or_else(|| CoreError::NotFound(format!("file {}/{}", volume_id, file_id)))?;
        if current == FileStatus::Done {
            if status == FileStatus::Done {
                return Ok(());
            }
            return Err(CoreError::InvalidState(format!(
                "file {}/{} is done and cannot become {}",
                volume_id, file_id, status
            )));
        }

        self.commit(|doc| {
            let volume = doc
                .volume_mut(volume_id)
                .ok_or_else(|| CoreError::NotFound(format!("volume {}", volume_id)))?;
            let file = volume
                .file_mut(file_id)
                .ok_or_else(|| CoreError::NotFound(format!("file {}/{}", volume_id, file_id)))?;
            file.status = status;
            let url = file.url.clone();
            match status {
                FileStatus::Done => {
                    file.error = None;
                    if volume.status != VolumeStatus::Listing && volume.all_done() {
                        volume.status = VolumeStatus::Done;
                    }
                    doc.info.success += 1;
                }
                FileStatus::Error => {
                    let message = error_detail.unwrap_or_else(|| "download failed".to_string());
                    file.error = Some(message.clone());
                    doc.error.push(ErrorRecord {
                        volume_id,
                        file_id,
                        url,
                        message,
                        at: now_epoch(),
                    });
                }
                FileStatus::Pending => {
                    file.error = None;
                }
            }
            Ok(())
        })
    }

    pub fn set_volume_status(&mut self, volume_id: VolumeId, status: VolumeStatus) -> CoreResult<()> {
        self.commit(|doc| {
            let volume = doc
                .volume_mut(volume_id)
                .ok_or_else(|| CoreError::NotFound(format!("volume {}", volume_id)))?;
            if status == VolumeStatus::Done && !volume.all_done() {
                return Err(CoreError::InvalidState(format!(
                    "volume {} still has unfinished files",
                    volume_id
                )));
            }
            volume.status = status;
            Ok(())
        })
    }

    /// Ends the listing phase of a volume: `done` when nothing is left to
    /// fetch (including an empty volume), otherwise `downloading`.
    pub fn finish_listing(&mut self, volume_id: VolumeId) -> CoreResult<VolumeStatus> {
        self.commit(|doc| {
            let volume = doc
                .volume_mut(volume_id)
                .ok_or_else(|| CoreError::NotFound(format!("volume {}", volume_id)))?;
            volume.status = if volume.all_done() {
                VolumeStatus::Done
            } else {
                VolumeStatus::Downloading
            };
            Ok(volume.status)
        })
    }

    pub fn set_flags(&mut self, vol_info_ok: Option<bool>, file_info_ok: Option<bool>) -> CoreResult<()> {
        self.commit(|doc| {
            if let Some(value) = vol_info_ok {
                doc.info.vol_info_ok = value;
            }
            if let Some(value) = file_info_ok {
                doc.info.file_info_ok = value;
            }
            Ok(())
        })
    }

    pub fn set_next_url(&mut self, next_url: &str) -> CoreResult<()> {
        self.commit(|doc| {
            doc.info.vol_next_url = next_url.to_string();
            Ok(())
        })
    }

    pub fn set_url(&mut self, url: &str) -> CoreResult<()> {
        self.commit(|doc| {
            doc.info.url = url.to_string();
            Ok(())
        })
    }

    pub fn set_job_status(&mut self, status: JobStatus) -> CoreResult<()> {
        self.commit(|doc| {
            doc.info.status = status;
            Ok(())
        })
    }

    /// Starts a download pass: the error log only covers the current run.
    pub fn begin_run(&mut self) -> CoreResult<()> {
        self.commit(|doc| {
            doc.error.clear();
            doc.info.status = JobStatus::Downloading;
            Ok(())
        })
    }

    pub fn volume_id_by_name(&self, name: &str) -> Option<VolumeId> {
        self.doc.info.vol_num_dict.get(name).copied()
    }

    pub fn file_exists(&self, url: &str, scope: UrlScope) -> bool {
        match self.url_index.get(url) {
            None => false,
            Some(owners) => match scope {
                UrlScope::Job => !owners.is_empty(),
                UrlScope::Volume(volume_id) => owners.iter().any(|(vol, _)| *vol == volume_id),
            },
        }
    }

    /// Checks the structural invariants of the document.
    pub fn verify(&self) -> CoreResult<()> {
        let info = &self.doc.info;
        let files = self.doc.count_files();
        if info.files != files {
            return Err(CoreError::LedgerCorrupt(format!(
                "files counter {} but {} file records",
                info.files, files
            )));
        }
        let done = self.doc.count_done();
        if info.success != done {
            return Err(CoreError::LedgerCorrupt(format!(
                "success counter {} but {} done files",
                info.success, done
            )));
        }
        for volume in &self.doc.down_list {
            if info.vol_num_dict.get(&volume.name) != Some(&volume.id) {
                return Err(CoreError::LedgerCorrupt(format!(
                    "volume {} [{}] missing from name index",
                    volume.id, volume.name
                )));
            }
            if volume.id >= info.vol_num {
                return Err(CoreError::LedgerCorrupt(format!(
                    "volume id {} not below vol_num {}",
                    volume.id, info.vol_num
                )));
            }
            if volume.status == VolumeStatus::Done && !volume.all_done() {
                return Err(CoreError::LedgerCorrupt(format!(
                    "volume {} is done with unfinished files",
                    volume.id
                )));
            }
            if volume.files.iter().any(|file| file.id >= volume.file_num) {
                return Err(CoreError::LedgerCorrupt(format!(
                    "volume {} has a file id beyond file_num {}",
                    volume.id, volume.file_num
                )));
            }
        }
        if info.vol_num_dict.len() != self.doc.down_list.len() {
            return Err(CoreError::LedgerCorrupt(
                "volume name index does not match volume list".to_string(),
            ));
        }
        Ok(())
    }

    fn rebuild_index(&mut self) {
        self.url_index.clear();
        for volume in &self.doc.down_list {
            for file in &volume.files {
                self.url_index
                    .entry(file.url.clone())
                    .or_default()
                    .push((volume.id, file.id));
            }
        }
    }
}

/// Ledger shared between the orchestrator and pool workers.
#[derive(Clone)]
pub struct LedgerHandle {
    inner: Arc<Mutex<Ledger>>,
}

impl LedgerHandle {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ledger)),
        }
    }

    pub fn lock(&self) -> CoreResult<MutexGuard<'_, Ledger>> {
        self.inner
            .lock()
            .map_err(|_| CoreError::Storage("ledger lock poisoned".to_string()))
    }

    pub fn snapshot(&self) -> CoreResult<JobView> {
        Ok(self.lock()?.snapshot())
    }
}
