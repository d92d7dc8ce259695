use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info, warn};

use crate::config::JobOptions;
use crate::driver::SiteDriver;
use crate::error::{CoreError, CoreResult};
use crate::ledger::{Ledger, LedgerHandle};
use crate::model::{JobStatus, JobSummary, JobView, LedgerDoc};
use crate::pool::WorkerPool;
use crate::registry::Registry;
use crate::resolver::{resolve_files, resolve_volumes, with_redo};
use crate::sanitize::path_char_replace;

pub const MSG_DONE: &str = "download finished";
pub const MSG_NOT_DONE: &str = "no files for download, but job not done!";

/// One job as requested by a caller: a catalog URL, an optional fixed name
/// and the directory jobs are saved under. An empty `url` resumes the job
/// stored under `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub url: String,
    pub name: Option<String>,
    pub path: PathBuf,
}

impl JobRequest {
    pub fn new(url: impl Into<String>, name: Option<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            name: name.filter(|name| !name.trim().is_empty()),
            path: path.into(),
        }
    }

    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.url.clone(),
        }
    }
}

/// A job whose ledger is open.
pub struct PreparedJob {
    pub name: String,
    pub job_dir: PathBuf,
    pub ledger: LedgerHandle,
    pub driver: Arc<dyn SiteDriver>,
}

/// Outcome of the resolution stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Ready,
    VolumesFailed,
    FilesFailed,
}

/// Sequences name lookup, resolution, download passes and the final status
/// decision for a job.
pub struct Orchestrator {
    registry: Arc<Registry>,
    options: Arc<JobOptions>,
}

impl Orchestrator {
    pub fn new(registry: Arc<Registry>, options: JobOptions) -> Self {
        Self {
            registry,
            options: Arc::new(options),
        }
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn fetch_name(&self, url: &str, driver: &dyn SiteDriver) -> CoreResult<String> {
        let raw = with_redo(&self.options, url, || driver.get_name_by_url(url, &self.options))?
            .ok_or_else(|| CoreError::Driver(format!("could not get the name of {}", url)))?;
        let name = path_char_replace(raw.trim());
        if name.is_empty() {
            return Err(CoreError::Driver(format!("driver returned an empty name for {}", url)));
        }
        Ok(name)
    }

    /// Opens (or creates) the job's ledger.
    pub fn open(&self, request: &JobRequest) -> CoreResult<PreparedJob> {
        let given_name = request
            .name
            .as_deref()
            .map(|name| path_char_replace(name.trim()));
        let (url, existing) = if request.url.trim().is_empty() {
            let name = given_name
                .clone()
                .ok_or_else(|| CoreError::Config("a job needs a url or a name".to_string()))?;
            let ledger = Ledger::open_existing(&request.path, &name, &self.options.ledger_file)?;
            (ledger.document().info.url.clone(), Some((name, ledger)))
        } else {
            (request.url.trim().to_string(), None)
        };
        let driver = self
            .registry
            .site_driver_for(&url, self.options.site_driver.as_deref())?;
        let (name, ledger) = match existing {
            Some(opened) => opened,
            None => {
                let name = match given_name {
                    Some(name) => name,
                    None => self.fetch_name(&url, driver.as_ref())?,
                };
                let mut ledger =
                    Ledger::open_or_create(&request.path, &name, &url, &self.options.ledger_file)?;
                if ledger.document().info.url != url {
                    ledger.set_url(&url)?;
                }
                (name, ledger)
            }
        };
        debug!(job = %name, location = %ledger.location(), driver = %driver.id(), "job opened");
        Ok(PreparedJob {
            job_dir: request.path.join(&name),
            name,
            ledger: LedgerHandle::new(ledger),
            driver,
        })
    }

    /// Runs whichever resolution stages are stale or forced.
    pub fn resolve(&self, job: &PreparedJob) -> CoreResult<Resolution> {
        let view = job.ledger.snapshot()?;
        let volumes_stale = self.options.needs_refresh(view.vol_info_ok);
        if volumes_stale && !resolve_volumes(&job.ledger, job.driver.as_ref(), &self.options)? {
            return Ok(Resolution::VolumesFailed);
        }
        let files_stale = volumes_stale || self.options.needs_refresh(view.file_info_ok);
        if files_stale && !resolve_files(&job.ledger, job.driver.as_ref(), &self.options)? {
            return Ok(Resolution::FilesFailed);
        }
        Ok(Resolution::Ready)
    }

    /// Opens and resolves a job.
    pub fn prepare(&self, request: &JobRequest) -> CoreResult<(PreparedJob, Resolution)> {
        let job = self.open(request)?;
        let resolution = self.resolve(&job)?;
        Ok((job, resolution))
    }

    /// Resolution only; the ledger is left ready for a later download.
    pub fn index(&self, request: &JobRequest) -> CoreResult<LedgerDoc> {
        let (job, resolution) = self.prepare(request)?;
        let doc = job.ledger.lock()?.document().clone();
        match resolution {
            Resolution::Ready => {
                info!(job = %job.name, volumes = doc.down_list.len(), files = doc.info.files, "index ready");
                Ok(doc)
            }
            Resolution::VolumesFailed => Err(CoreError::Driver(format!(
                "volume listing of [{}] did not complete",
                job.name
            ))),
            Resolution::FilesFailed => Err(CoreError::Driver(format!(
                "file listing of [{}] did not complete",
                job.name
            ))),
        }
    }

    /// Download passes over a prepared job, redoing failed files while
    /// `auto_redo` allows, then the final status decision. A file whose
    /// transfer type has no backend fails the job before anything is
    /// fetched.
    pub fn download(&self, job: &PreparedJob) -> CoreResult<JobSummary> {
        job.ledger.lock()?.begin_run()?;
        let pool = WorkerPool::new(
            job.ledger.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.options),
            job.job_dir.clone(),
        );
        pool.check_transfer_types()?;
        let mut rounds = 0u32;
        let mut first_pass_tasks: Option<u64> = None;
        let task_fail = loop {
            let report = pool.run()?;
            if let Some(err) = report.ledger_error {
                return Err(CoreError::Storage(err));
            }
            if first_pass_tasks.is_none() {
                first_pass_tasks = Some(report.task);
            }
            let unfinished = report.task_fail + report.busy;
            if unfinished == 0 || !self.options.may_redo(rounds) {
                break unfinished;
            }
            rounds += 1;
            warn!(job = %job.name, failed = unfinished, round = rounds, "redoing failed files");
            thread::sleep(self.options.redo_interval);
            if let Some(limit) = self.options.down_overtime {
                let running = pool.wait_stragglers(limit)?;
                if running > 0 {
                    debug!(job = %job.name, running, "evicted transfers still running");
                }
            }
        };
        self.finalize(job, first_pass_tasks.unwrap_or(0), task_fail)
    }

    /// Derives the job status from the ledger counters.
    pub fn finalize(&self, job: &PreparedJob, task: u64, task_fail: u64) -> CoreResult<JobSummary> {
        let mut ledger = job.ledger.lock()?;
        let complete = ledger.document().is_complete();
        let (status, msg) = if complete {
            (JobStatus::Done, MSG_DONE.to_string())
        } else if task_fail > 0 {
            (JobStatus::Error, format!("{} of {} files failed to download", task_fail, task))
        } else {
            (JobStatus::Error, MSG_NOT_DONE.to_string())
        };
        ledger.set_job_status(status)?;
        let info = &ledger.document().info;
        let summary = JobSummary {
            name: job.name.clone(),
            status,
            msg,
            files: info.files,
            success: info.success,
            task,
            task_fail,
        };
        drop(ledger);

        if complete && self.options.remove_tmp {
            match purge_tmp_files(&job.job_dir) {
                Ok(0) => {}
                Ok(removed) => debug!(job = %job.name, removed, "temporary files removed"),
                Err(err) => warn!(job = %job.name, error = %err, "could not remove temporary files"),
            }
        }
        info!(
            job = %summary.name,
            status = %summary.status,
            files = summary.files,
            success = summary.success,
            "job finished"
        );
        Ok(summary)
    }

    /// The whole state machine for one job. Only ledger failures are
    /// returned as errors; everything else ends up in the summary.
    pub fn run(&self, request: &JobRequest) -> CoreResult<JobSummary> {
        let mut opened: Option<LedgerHandle> = None;
        let result = self.run_stages(request, &mut opened);
        match result {
            Ok(summary) => Ok(summary),
            Err(err) if err.is_fatal() => {
                error!(job = %request.label(), error = %err, "job aborted");
                Err(err)
            }
            Err(err) => {
                warn!(job = %request.label(), error = %err, "job failed");
                let mut summary = JobSummary::failed(request.label(), err.to_string());
                if let Some(ledger) = opened {
                    let mut guard = ledger.lock()?;
                    guard.set_job_status(JobStatus::Error)?;
                    summary.name = guard.document().info.name.clone();
                    summary.files = guard.document().info.files;
                    summary.success = guard.document().info.success;
                }
                Ok(summary)
            }
        }
    }

    fn run_stages(&self, request: &JobRequest, opened: &mut Option<LedgerHandle>) -> CoreResult<JobSummary> {
        let job = self.open(request)?;
        *opened = Some(job.ledger.clone());
        match self.resolve(&job)? {
            Resolution::Ready => self.download(&job),
            Resolution::VolumesFailed => Err(CoreError::Driver("get volume info error".to_string())),
            Resolution::FilesFailed => Err(CoreError::Driver("get file info error".to_string())),
        }
    }

    pub fn get_status(&self, name: &str, path: &Path) -> CoreResult<JobView> {
        let ledger = Ledger::open_existing(path, &path_char_replace(name.trim()), &self.options.ledger_file)?;
        Ok(ledger.snapshot())
    }

    /// The full volume and file tree of a stored job.
    pub fn get_index_info(&self, name: &str, path: &Path) -> CoreResult<LedgerDoc> {
        let ledger = Ledger::open_existing(path, &path_char_replace(name.trim()), &self.options.ledger_file)?;
        Ok(ledger.document().clone())
    }
}

/// Removes `*.tmp` leftovers of transfer backends below `dir`.
pub fn purge_tmp_files(dir: &Path) -> CoreResult<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut removed = 0usize;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            removed += purge_tmp_files(&path)?;
        } else if path.extension().map(|ext| ext == "tmp").unwrap_or(false) {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}
