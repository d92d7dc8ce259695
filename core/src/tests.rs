use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value;

use crate::backend::{TransferBackend, TransferContext};
use crate::batch::{parse_job_list, BatchRunner};
use crate::config::JobOptions;
use crate::driver::{CarryState, DiscoveredFile, FilePage, ManifestDriver, SiteDriver, VolumePage};
use crate::error::{CoreError, CoreResult};
use crate::job::{JobRequest, Orchestrator, MSG_DONE, MSG_NOT_DONE};
use crate::ledger::Ledger;
use crate::model::{FileStatus, JobStatus, VolumeStatus};
use crate::pool::WorkerPool;
use crate::registry::Registry;
use crate::sanitize::PATH_SPLIT;

/// Site driver answering from scripted pages. Routed for host `site`.
#[derive(Default)]
pub(crate) struct ScriptedDriver {
    name: String,
    pages: Mutex<HashMap<String, VolumePage>>,
    files: Mutex<HashMap<String, Vec<DiscoveredFile>>>,
    failures: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<String>>,
    carries: Mutex<Vec<Option<usize>>>,
}

impl ScriptedDriver {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub(crate) fn page(&self, url: &str, next: &str, volumes: &[(&str, &str)]) {
        let page = VolumePage {
            next_url: next.to_string(),
            volumes: volumes
                .iter()
                .map(|(name, url)| (name.to_string(), url.to_string()))
                .collect(),
        };
        self.pages.lock().unwrap().insert(url.to_string(), page);
    }

    pub(crate) fn files(&self, volume_url: &str, files: &[(&str, &str)]) {
        let files = files
            .iter()
            .map(|(name, url)| DiscoveredFile {
                name: name.to_string(),
                url: url.to_string(),
                transfer_type: "http".to_string(),
                extra: None,
            })
            .collect();
        self.files_typed(volume_url, files);
    }

    pub(crate) fn files_typed(&self, volume_url: &str, files: Vec<DiscoveredFile>) {
        self.files
            .lock()
            .unwrap()
            .insert(volume_url.to_string(), files);
    }

    /// The next `times` calls for `url` fail.
    pub(crate) fn fail(&self, url: &str, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(url.to_string(), times);
    }

    pub(crate) fn call_count(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|called| called.as_str() == url)
            .count()
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn carries(&self) -> Vec<Option<usize>> {
        self.carries.lock().unwrap().clone()
    }

    fn check(&self, url: &str) -> CoreResult<()> {
        self.calls.lock().unwrap().push(url.to_string());
        let mut failures = self.failures.lock().unwrap();
        if let Some(left) = failures.get_mut(url) {
            if *left > 0 {
                *left -= 1;
                return Err(CoreError::Driver(format!("scripted failure for {}", url)));
            }
        }
        Ok(())
    }
}

impl SiteDriver for ScriptedDriver {
    fn id(&self) -> &str {
        "scripted"
    }

    fn supports(&self) -> Vec<String> {
        vec!["SITE".to_string()]
    }

    fn get_name_by_url(&self, _url: &str, _options: &JobOptions) -> CoreResult<String> {
        if self.name.is_empty() {
            return Err(CoreError::Driver("no name scripted".to_string()));
        }
        Ok(self.name.clone())
    }

    fn get_volume_page(&self, url: &str, _options: &JobOptions) -> CoreResult<VolumePage> {
        self.check(url)?;
        self.pages
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| CoreError::Driver(format!("no page scripted for {}", url)))
    }

    fn get_file_page(
        &self,
        volume_url: &str,
        carry: Option<CarryState>,
        _options: &JobOptions,
    ) -> CoreResult<FilePage> {
        self.check(volume_url)?;
        let files = self
            .files
            .lock()
            .unwrap()
            .get(volume_url)
            .cloned()
            .ok_or_else(|| CoreError::Driver(format!("no files scripted for {}", volume_url)))?;
        let received = carry
            .and_then(|carry| carry.downcast::<usize>().ok())
            .map(|value| *value);
        let mut carries = self.carries.lock().unwrap();
        carries.push(received);
        Ok(FilePage {
            carry: Some(Box::new(carries.len())),
            files,
        })
    }
}

/// Transfer backend that writes the URL into the destination file unless
/// told to fail, hang or panic for it.
pub(crate) struct ScriptedBackend {
    kind: String,
    failures: Mutex<HashMap<String, u32>>,
    hangs: Mutex<HashSet<String>>,
    panics: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub(crate) fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            failures: Mutex::new(HashMap::new()),
            hangs: Mutex::new(HashSet::new()),
            panics: Mutex::new(HashSet::new()),
            delay: Mutex::new(Duration::ZERO),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn fail_times(&self, url: &str, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(url.to_string(), times);
    }

    pub(crate) fn fail_always(&self, url: &str) {
        self.fail_times(url, u32::MAX);
    }

    /// Blocks until the transfer is cancelled.
    pub(crate) fn hang_on(&self, url: &str) {
        self.hangs.lock().unwrap().insert(url.to_string());
    }

    pub(crate) fn panic_on(&self, url: &str) {
        self.panics.lock().unwrap().insert(url.to_string());
    }

    pub(crate) fn delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn calls_for(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|called| called.as_str() == url)
            .count()
    }
}

impl TransferBackend for ScriptedBackend {
    fn transfer_type(&self) -> &str {
        &self.kind
    }

    fn download(
        &self,
        url: &str,
        dest: &Path,
        _extra: Option<&Value>,
        ctx: &TransferContext,
    ) -> CoreResult<()> {
        self.calls.lock().unwrap().push(url.to_string());
        let panics = self.panics.lock().unwrap().contains(url);
        if panics {
            panic!("scripted panic for {}", url);
        }
        let hangs = self.hangs.lock().unwrap().contains(url);
        if hangs {
            while !ctx.cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            return Err(CoreError::Transfer(format!("cancelled: {}", url)));
        }
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(url) {
                if *left > 0 {
                    if *left != u32::MAX {
                        *left -= 1;
                    }
                    return Err(CoreError::Network(format!("scripted failure for {}", url)));
                }
            }
        }
        fs::write(dest, url.as_bytes())?;
        Ok(())
    }
}

fn test_options() -> JobOptions {
    JobOptions {
        down_worker: 2,
        redo_interval: Duration::from_millis(1),
        poll_interval: Duration::from_millis(10),
        ..JobOptions::default()
    }
}

fn foo_site() -> Arc<ScriptedDriver> {
    let driver = Arc::new(ScriptedDriver::new("Foo"));
    driver.page("http://site/foo", "", &[("A", "http://site/a"), ("B", "http://site/b")]);
    driver.files(
        "http://site/a",
        &[
            ("a1.jpg", "http://img/a1"),
            ("a2.jpg", "http://img/a2"),
            ("a3.jpg", "http://img/a3"),
        ],
    );
    driver.files("http://site/b", &[("b1.jpg", "http://img/b1"), ("b2.jpg", "http://img/b2")]);
    driver
}

fn orchestrator(driver: Arc<ScriptedDriver>, backend: Arc<ScriptedBackend>, options: JobOptions) -> Orchestrator {
    let mut registry = Registry::new();
    registry.register_driver(driver);
    registry.register_backend(backend);
    Orchestrator::new(Arc::new(registry), options)
}

#[test]
fn test_two_volume_job_with_one_failure_then_rerun() {
    let dir = tempfile::tempdir().expect("tempdir");
    let driver = foo_site();
    let backend = Arc::new(ScriptedBackend::new("http"));
    backend.fail_times("http://img/a3", 1);
    let request = JobRequest::new("http://site/foo", None, dir.path());

    // 1. First run: one network failure in volume A.
    let engine = orchestrator(driver.clone(), backend.clone(), test_options());
    let summary = engine.run(&request).expect("first run");
    assert_eq!(summary.name, "Foo");
    assert_eq!((summary.files, summary.success), (5, 4));
    assert_eq!((summary.task, summary.task_fail), (5, 1));
    assert_eq!(summary.status, JobStatus::Error);
    assert!(!summary.msg.is_empty());
    assert_eq!(summary.exit_code(), 1);

    let view = engine.get_status("Foo", dir.path()).expect("status");
    assert_eq!(view.status, JobStatus::Error);
    assert_eq!(view.volumes[0].status, VolumeStatus::Downloading);
    assert_eq!(view.volumes[1].status, VolumeStatus::Done);
    assert!(dir.path().join("Foo").join("B").join("b2.jpg").is_file());

    // 2. Second run, as a new process: only the failed file is fetched.
    let calls_before = driver.total_calls();
    let engine = orchestrator(driver.clone(), backend.clone(), test_options());
    let summary = engine.run(&request).expect("second run");
    assert_eq!((summary.files, summary.success), (5, 5));
    assert_eq!((summary.task, summary.task_fail), (1, 0));
    assert_eq!(summary.status, JobStatus::Done);
    assert_eq!(summary.msg, MSG_DONE);
    assert_eq!(driver.total_calls(), calls_before);
    assert_eq!(backend.calls_for("http://img/a1"), 1);
    assert_eq!(backend.calls_for("http://img/a3"), 2);
}

#[test]
fn test_ledger_file_has_three_sections() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = orchestrator(foo_site(), Arc::new(ScriptedBackend::new("http")), test_options());
    engine
        .run(&JobRequest::new("http://site/foo", None, dir.path()))
        .expect("run");

    let raw = fs::read(dir.path().join("Foo").join("down.json")).expect("ledger file");
    let doc: Value = serde_json::from_slice(&raw).expect("ledger json");
    assert_eq!(doc["info"]["status"], "done");
    assert_eq!(doc["info"]["files"], 5);
    assert_eq!(doc["down_list"].as_array().map(Vec::len), Some(2));
    assert!(doc["error"].as_array().map(Vec::is_empty).unwrap_or(false));
}

#[test]
fn test_empty_volume_is_done_without_queueing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let driver = Arc::new(ScriptedDriver::new("Empty"));
    driver.page("http://site/empty", "", &[("nothing", "http://site/nothing")]);
    driver.files("http://site/nothing", &[]);
    let backend = Arc::new(ScriptedBackend::new("http"));
    let engine = orchestrator(driver, backend.clone(), test_options());

    let summary = engine
        .run(&JobRequest::new("http://site/empty", None, dir.path()))
        .expect("run");

    assert_eq!(summary.status, JobStatus::Done);
    assert_eq!((summary.files, summary.task), (0, 0));
    assert_eq!(backend.call_count(), 0);
    let view = engine.get_status("Empty", dir.path()).expect("status");
    assert_eq!(view.volumes[0].status, VolumeStatus::Done);
}

#[test]
fn test_duplicate_urls_across_volumes_in_normal_mode() {
    let dir = tempfile::tempdir().expect("tempdir");
    let driver = Arc::new(ScriptedDriver::new("Dup"));
    driver.page("http://site/dup", "", &[("A", "http://site/a"), ("B", "http://site/b")]);
    driver.files("http://site/a", &[("cover.jpg", "http://img/cover"), ("again.jpg", "http://img/cover")]);
    driver.files("http://site/b", &[("cover.jpg", "http://img/cover")]);
    let backend = Arc::new(ScriptedBackend::new("http"));
    let engine = orchestrator(driver, backend.clone(), test_options());

    let summary = engine
        .run(&JobRequest::new("http://site/dup", None, dir.path()))
        .expect("run");

    // One record per volume: uniqueness is scoped to the volume.
    assert_eq!(summary.files, 2);
    assert_eq!(backend.calls_for("http://img/cover"), 2);
}

#[test]
fn test_unsupported_transfer_type_and_remap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let driver = Arc::new(ScriptedDriver::new("Torrent"));
    driver.page("http://site/t", "", &[("A", "http://site/a")]);
    driver.files_typed(
        "http://site/a",
        vec![DiscoveredFile {
            name: "movie.mkv".to_string(),
            url: "magnet:?xt=1".to_string(),
            transfer_type: "torrent".to_string(),
            extra: None,
        }],
    );
    let backend = Arc::new(ScriptedBackend::new("http"));
    let request = JobRequest::new("http://site/t", None, dir.path());

    let engine = orchestrator(driver.clone(), backend.clone(), test_options());
    let summary = engine.run(&request).expect("run");
    assert_eq!(summary.status, JobStatus::Error);
    assert_eq!(summary.msg, "not support transfer type [torrent]");
    let doc = engine.get_index_info("Torrent", dir.path()).expect("index info");
    assert_eq!(doc.error[0].message, "not support transfer type [torrent]");
    assert_eq!(backend.call_count(), 0);

    let mut options = test_options();
    options
        .downtype_mapping
        .insert("torrent".to_string(), "http".to_string());
    let engine = orchestrator(driver, backend.clone(), options);
    let summary = engine.run(&request).expect("remapped run");
    assert_eq!(summary.status, JobStatus::Done);
    assert_eq!(backend.calls_for("magnet:?xt=1"), 1);
}

#[test]
fn test_unsupported_type_fails_job_before_any_transfer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let driver = Arc::new(ScriptedDriver::new("Mixed"));
    driver.page("http://site/mixed", "", &[("A", "http://site/a")]);
    driver.files_typed(
        "http://site/a",
        vec![
            DiscoveredFile {
                name: "cover.jpg".to_string(),
                url: "http://img/cover".to_string(),
                transfer_type: "http".to_string(),
                extra: None,
            },
            DiscoveredFile {
                name: "movie.mkv".to_string(),
                url: "magnet:?xt=2".to_string(),
                transfer_type: "torrent".to_string(),
                extra: None,
            },
        ],
    );
    let backend = Arc::new(ScriptedBackend::new("http"));
    let mut options = test_options();
    options.auto_redo = true;
    options.redo_limit = Some(3);
    let engine = orchestrator(driver, backend.clone(), options);

    let summary = engine
        .run(&JobRequest::new("http://site/mixed", None, dir.path()))
        .expect("run");

    assert_eq!(summary.status, JobStatus::Error);
    assert_eq!(summary.msg, "not support transfer type [torrent]");
    assert_eq!((summary.files, summary.success), (2, 0));
    assert_eq!(backend.call_count(), 0);
    let doc = engine.get_index_info("Mixed", dir.path()).expect("index info");
    assert_eq!(doc.error.len(), 1);
    assert_eq!(doc.info.status, JobStatus::Error);
    let files = &doc.down_list[0].files;
    assert_eq!(files[0].status, FileStatus::Pending);
    assert_eq!(files[1].status, FileStatus::Error);
}

/// First transfer of each URL ignores cancellation, sleeps and then writes
/// `stale`; later transfers write `fresh` at once.
struct StallingBackend {
    stall: Duration,
    seen: Mutex<HashSet<String>>,
}

impl TransferBackend for StallingBackend {
    fn transfer_type(&self) -> &str {
        "http"
    }

    fn download(
        &self,
        url: &str,
        dest: &Path,
        _extra: Option<&Value>,
        _ctx: &TransferContext,
    ) -> CoreResult<()> {
        let first = self.seen.lock().unwrap().insert(url.to_string());
        if first {
            thread::sleep(self.stall);
            fs::write(dest, b"stale")?;
        } else {
            fs::write(dest, b"fresh")?;
        }
        Ok(())
    }
}

#[test]
fn test_evicted_transfer_never_overwrites_a_redone_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let driver = Arc::new(ScriptedDriver::new("Slow"));
    driver.page("http://site/slow", "", &[("A", "http://site/a")]);
    driver.files("http://site/a", &[("1.jpg", "http://img/slow")]);
    let mut registry = Registry::new();
    registry.register_driver(driver);
    registry.register_backend(Arc::new(StallingBackend {
        stall: Duration::from_millis(600),
        seen: Mutex::new(HashSet::new()),
    }));
    let mut options = test_options();
    options.down_worker = 1;
    options.down_overtime = Some(Duration::from_millis(100));
    options.auto_redo = true;
    options.redo_limit = Some(20);
    let engine = Orchestrator::new(Arc::new(registry), options);

    let summary = engine
        .run(&JobRequest::new("http://site/slow", None, dir.path()))
        .expect("run");

    assert_eq!(summary.status, JobStatus::Done);
    assert_eq!(summary.success, 1);
    // Give a leaked stale transfer the chance to land before checking.
    thread::sleep(Duration::from_millis(700));
    let dest = dir.path().join("Slow").join("A").join("1.jpg");
    assert_eq!(fs::read_to_string(dest).expect("downloaded file"), "fresh");
}

#[test]
fn test_auto_redo_is_capped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(ScriptedBackend::new("http"));
    backend.fail_always("http://img/b2");
    let mut options = test_options();
    options.auto_redo = true;
    options.redo_limit = Some(2);
    let engine = orchestrator(foo_site(), backend.clone(), options);

    let summary = engine
        .run(&JobRequest::new("http://site/foo", None, dir.path()))
        .expect("run");

    assert_eq!(summary.status, JobStatus::Error);
    assert_eq!(summary.task_fail, 1);
    assert_eq!(backend.calls_for("http://img/b2"), 3);
    assert_eq!(backend.calls_for("http://img/b1"), 1);
}

#[test]
fn test_auto_redo_recovers_transient_failures() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(ScriptedBackend::new("http"));
    backend.fail_times("http://img/a1", 2);
    let mut options = test_options();
    options.auto_redo = true;
    let engine = orchestrator(foo_site(), backend.clone(), options);

    let summary = engine
        .run(&JobRequest::new("http://site/foo", None, dir.path()))
        .expect("run");

    assert_eq!(summary.status, JobStatus::Done);
    assert_eq!((summary.task, summary.task_fail), (5, 0));
    assert_eq!(backend.calls_for("http://img/a1"), 3);
}

#[test]
fn test_resolution_failure_is_reported_and_retried_next_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let driver = foo_site();
    driver.fail("http://site/foo", 1);
    let backend = Arc::new(ScriptedBackend::new("http"));
    let request = JobRequest::new("http://site/foo", None, dir.path());

    let engine = orchestrator(driver.clone(), backend.clone(), test_options());
    let summary = engine.run(&request).expect("run");
    assert_eq!(summary.status, JobStatus::Error);
    assert_eq!(summary.msg, "site driver error: get volume info error");
    let view = engine.get_status("Foo", dir.path()).expect("status");
    assert_eq!(view.status, JobStatus::Error);
    assert!(!view.vol_info_ok);
    assert_eq!(backend.call_count(), 0);

    let summary = engine.run(&request).expect("rerun");
    assert_eq!(summary.status, JobStatus::Done);
}

#[test]
fn test_index_then_resume_by_name() {
    let dir = tempfile::tempdir().expect("tempdir");
    let driver = foo_site();
    let backend = Arc::new(ScriptedBackend::new("http"));
    let engine = orchestrator(driver.clone(), backend.clone(), test_options());

    let doc = engine
        .index(&JobRequest::new("http://site/foo", None, dir.path()))
        .expect("index");
    assert_eq!(doc.info.files, 5);
    assert!(doc.info.vol_info_ok && doc.info.file_info_ok);
    assert_eq!(backend.call_count(), 0);

    let calls_before = driver.total_calls();
    let summary = engine
        .run(&JobRequest::new("", Some("Foo".to_string()), dir.path()))
        .expect("resume by name");
    assert_eq!(summary.status, JobStatus::Done);
    assert_eq!(driver.total_calls(), calls_before);
    assert_eq!(backend.call_count(), 5);
}

#[test]
fn test_status_of_unknown_job_is_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = orchestrator(foo_site(), Arc::new(ScriptedBackend::new("http")), test_options());
    assert!(matches!(
        engine.get_status("Nope", dir.path()),
        Err(CoreError::NotFound(_))
    ));
    let summary = engine
        .run(&JobRequest::new("", Some("Nope".to_string()), dir.path()))
        .expect("run");
    assert_eq!(summary.status, JobStatus::Error);
}

#[test]
fn test_unfinished_listing_keeps_job_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let driver = foo_site();
    let backend = Arc::new(ScriptedBackend::new("http"));
    let engine = orchestrator(driver.clone(), backend.clone(), test_options());
    let request = JobRequest::new("http://site/foo", None, dir.path());

    let job = engine.open(&request).expect("open");
    {
        let mut ledger = job.ledger.lock().expect("lock");
        ledger
            .add_volume("A", "http://site/a", VolumeStatus::Listing)
            .expect("add volume");
    }
    let summary = engine.download(&job).expect("download");
    assert_eq!(summary.status, JobStatus::Error);
    assert_eq!(summary.msg, MSG_NOT_DONE);
}

#[test]
fn test_crash_mid_pass_resumes_without_redownloading() {
    let dir = tempfile::tempdir().expect("tempdir");
    let driver = Arc::new(ScriptedDriver::new("Long"));
    driver.page("http://site/long", "", &[("A", "http://site/a")]);
    let files: Vec<(String, String)> = (0..6)
        .map(|index| (format!("{}.jpg", index), format!("http://img/{}", index)))
        .collect();
    let borrowed: Vec<(&str, &str)> = files
        .iter()
        .map(|(name, url)| (name.as_str(), url.as_str()))
        .collect();
    driver.files("http://site/a", &borrowed);
    let backend = Arc::new(ScriptedBackend::new("http"));
    backend.delay(Duration::from_millis(40));
    let mut options = test_options();
    options.down_worker = 1;
    let request = JobRequest::new("http://site/long", None, dir.path());

    // 1. Kill the pass after a few files.
    let engine = orchestrator(driver.clone(), backend.clone(), options.clone());
    let (job, _) = engine.prepare(&request).expect("prepare");
    let pool = WorkerPool::new(
        job.ledger.clone(),
        Arc::new({
            let mut registry = Registry::new();
            registry.register_backend(backend.clone());
            registry
        }),
        Arc::new(options.clone()),
        job.job_dir.clone(),
    );
    let handle = pool.start().expect("start");
    while backend.call_count() < 3 {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(handle.stop(Duration::ZERO, true).expect("stop"));
    handle.wait().expect("wait");
    drop(job);
    // Let the abandoned transfer run out before its file is fetched again.
    thread::sleep(Duration::from_millis(80));

    let done_before: Vec<String> = {
        let ledger = Ledger::open_existing(dir.path(), "Long", "down.json").expect("reopen");
        ledger.verify().expect("consistent after crash");
        ledger.document().down_list[0]
            .files
            .iter()
            .filter(|file| file.status == FileStatus::Done)
            .map(|file| file.url.clone())
            .collect()
    };
    assert!(!done_before.is_empty());

    // 2. Restart: everything finishes, nothing done is fetched twice.
    let engine = orchestrator(driver, backend.clone(), options);
    let summary = engine.run(&request).expect("resume");
    assert_eq!(summary.status, JobStatus::Done);
    assert_eq!(summary.success, 6);
    for url in done_before {
        assert_eq!(backend.calls_for(&url), 1, "{} downloaded twice", url);
    }
}

#[test]
fn test_manifest_job_with_nested_volume_dirs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manifest = dir.path().join("work.json");
    fs::write(
        &manifest,
        serde_json::json!({
            "name": "Show",
            "volumes": [
                {
                    "name": format!("Season 1{}Episode 1", PATH_SPLIT),
                    "files": [{"name": "ep1.mp4", "url": "http://cdn/ep1.mp4"}]
                }
            ]
        })
        .to_string(),
    )
    .expect("write manifest");
    let url = url::Url::from_file_path(&manifest).expect("file url").to_string();

    let backend = Arc::new(ScriptedBackend::new("http"));
    let mut registry = Registry::new();
    registry.register_driver(Arc::new(ManifestDriver));
    registry.register_backend(backend.clone());
    let engine = Orchestrator::new(Arc::new(registry), test_options());
    let out = dir.path().join("out");

    let summary = engine.run(&JobRequest::new(url, None, &out)).expect("run");

    assert_eq!(summary.status, JobStatus::Done);
    assert!(out
        .join("Show")
        .join("Season_1")
        .join("Episode_1")
        .join("ep1.mp4")
        .is_file());
}

#[test]
fn test_batch_runs_every_entry_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let driver = foo_site();
    driver.page("http://site/bar", "", &[("A", "http://site/a")]);
    let backend = Arc::new(ScriptedBackend::new("http"));
    let mut options = test_options();
    options.job_worker = 2;
    let engine = Arc::new(orchestrator(driver, backend, options));
    let entries = parse_job_list("http://site/foo\nhttp://site/bar|Bar\nhttp://nowhere.example/x\n");

    let report = BatchRunner::new(engine, dir.path()).run(entries);

    assert_eq!(report.summaries.len(), 3);
    assert_eq!(report.summaries[0].name, "Foo");
    assert_eq!(report.summaries[1].name, "Bar");
    assert_eq!(report.summaries[1].status, JobStatus::Done);
    assert_eq!(report.summaries[2].status, JobStatus::Error);
    assert_eq!(report.done(), 2);
    assert_eq!(report.exit_code(), 1);
    assert!(dir.path().join("Bar").join("down.json").is_file());
}

/// Driver whose name lookup panics.
struct PanickingDriver;

impl SiteDriver for PanickingDriver {
    fn id(&self) -> &str {
        "panicking"
    }

    fn supports(&self) -> Vec<String> {
        vec!["BOOM".to_string()]
    }

    fn get_name_by_url(&self, url: &str, _options: &JobOptions) -> CoreResult<String> {
        panic!("driver blew up on {}", url);
    }

    fn get_volume_page(&self, url: &str, _options: &JobOptions) -> CoreResult<VolumePage> {
        Err(CoreError::Driver(format!("no pages for {}", url)))
    }

    fn get_file_page(
        &self,
        volume_url: &str,
        _carry: Option<CarryState>,
        _options: &JobOptions,
    ) -> CoreResult<FilePage> {
        Err(CoreError::Driver(format!("no files for {}", volume_url)))
    }
}

#[test]
fn test_batch_survives_a_panicking_job() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut registry = Registry::new();
    registry.register_driver(foo_site());
    registry.register_driver(Arc::new(PanickingDriver));
    registry.register_backend(Arc::new(ScriptedBackend::new("http")));
    let engine = Arc::new(Orchestrator::new(Arc::new(registry), test_options()));
    let entries = parse_job_list("http://boom/x\nhttp://site/foo\n");

    let report = BatchRunner::new(engine, dir.path()).run(entries);

    assert_eq!(report.summaries.len(), 2);
    assert_eq!(report.summaries[0].status, JobStatus::Error);
    assert_eq!(report.summaries[0].msg, "job panicked");
    assert_eq!(report.summaries[1].status, JobStatus::Done);
    assert_eq!(report.exit_code(), 1);
}
