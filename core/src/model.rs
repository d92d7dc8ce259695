use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub type VolumeId = u32;
pub type FileId = u32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Downloading,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Downloading => "downloading",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VolumeStatus {
    Listing,
    Downloading,
    Done,
}

impl VolumeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeStatus::Listing => "listing",
            VolumeStatus::Downloading => "downloading",
            VolumeStatus::Done => "done",
        }
    }
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Done,
    Error,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Done => "done",
            FileStatus::Error => "error",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `info` section of a ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub name: String,
    pub url: String,
    pub status: JobStatus,
    pub vol_info_ok: bool,
    pub file_info_ok: bool,
    pub files: u64,
    pub success: u64,
    /// Next volume id to hand out.
    pub vol_num: VolumeId,
    /// Volume name to id; names are the stable key across runs.
    pub vol_num_dict: BTreeMap<String, VolumeId>,
    pub vol_next_url: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl JobInfo {
    pub fn new(name: String, url: String) -> Self {
        let now = now_epoch();
        Self {
            name,
            url,
            status: JobStatus::Downloading,
            vol_info_ok: false,
            file_info_ok: false,
            files: 0,
            success: 0,
            vol_num: 0,
            vol_num_dict: BTreeMap::new(),
            vol_next_url: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_epoch();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub name: String,
    pub url: String,
    pub status: VolumeStatus,
    /// Next file id to hand out inside this volume.
    pub file_num: FileId,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

impl Volume {
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn all_done(&self) -> bool {
        self.files.iter().all(|file| file.status == FileStatus::Done)
    }

    pub fn file(&self, id: FileId) -> Option<&FileEntry> {
        self.files.iter().find(|file| file.id == id)
    }

    pub fn file_mut(&mut self, id: FileId) -> Option<&mut FileEntry> {
        self.files.iter_mut().find(|file| file.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: FileId,
    pub name: String,
    pub url: String,
    pub transfer_type: String,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One entry of the per-run `error` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub volume_id: VolumeId,
    pub file_id: FileId,
    pub url: String,
    pub message: String,
    pub at: u64,
}

/// Whole persisted document: `info`, `down_list`, `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerDoc {
    pub info: JobInfo,
    #[serde(default)]
    pub down_list: Vec<Volume>,
    #[serde(default)]
    pub error: Vec<ErrorRecord>,
}

impl LedgerDoc {
    pub fn new(name: String, url: String) -> Self {
        Self {
            info: JobInfo::new(name, url),
            down_list: Vec::new(),
            error: Vec::new(),
        }
    }

    pub fn volume(&self, id: VolumeId) -> Option<&Volume> {
        self.down_list.iter().find(|vol| vol.id == id)
    }

    pub fn volume_mut(&mut self, id: VolumeId) -> Option<&mut Volume> {
        self.down_list.iter_mut().find(|vol| vol.id == id)
    }

    pub fn count_files(&self) -> u64 {
        self.down_list.iter().map(|vol| vol.files.len() as u64).sum()
    }

    pub fn count_done(&self) -> u64 {
        self.down_list
            .iter()
            .flat_map(|vol| vol.files.iter())
            .filter(|file| file.status == FileStatus::Done)
            .count() as u64
    }

    pub fn listing_volumes(&self) -> usize {
        self.down_list
            .iter()
            .filter(|vol| vol.status == VolumeStatus::Listing)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.info.files == self.info.success && self.listing_volumes() == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeView {
    pub id: VolumeId,
    pub name: String,
    pub status: VolumeStatus,
    pub file_count: usize,
    pub done: usize,
}

/// Read-only copy of a ledger's counts and status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobView {
    pub name: String,
    pub url: String,
    pub status: JobStatus,
    pub vol_info_ok: bool,
    pub file_info_ok: bool,
    pub files: u64,
    pub success: u64,
    pub volumes: Vec<VolumeView>,
}

impl From<&LedgerDoc> for JobView {
    fn from(doc: &LedgerDoc) -> Self {
        Self {
            name: doc.info.name.clone(),
            url: doc.info.url.clone(),
            status: doc.info.status,
            vol_info_ok: doc.info.vol_info_ok,
            file_info_ok: doc.info.file_info_ok,
            files: doc.info.files,
            success: doc.info.success,
            volumes: doc
                .down_list
                .iter()
                .map(|vol| VolumeView {
                    id: vol.id,
                    name: vol.name.clone(),
                    status: vol.status,
                    file_count: vol.file_count(),
                    done: vol
                        .files
                        .iter()
                        .filter(|file| file.status == FileStatus::Done)
                        .count(),
                })
                .collect(),
        }
    }
}

/// What a job run reports back to its caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobSummary {
    pub name: String,
    pub status: JobStatus,
    pub msg: String,
    pub files: u64,
    pub success: u64,
    pub task: u64,
    pub task_fail: u64,
}

impl JobSummary {
    pub fn failed(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: JobStatus::Error,
            msg: msg.into(),
            files: 0,
            success: 0,
            task: 0,
            task_fail: 0,
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.status == JobStatus::Done {
            0
        } else {
            1
        }
    }
}

pub(crate) fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
