use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::job::{JobRequest, Orchestrator};
use crate::model::{JobStatus, JobSummary};

/// One `url[|name]` line of a job list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEntry {
    pub url: String,
    pub name: Option<String>,
}

/// Parses a job list. Blank lines and `#` comments are skipped.
pub fn parse_job_list(text: &str) -> Vec<JobEntry> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (url, name) = match line.split_once('|') {
                Some((url, name)) => (url.trim(), name.trim()),
                None => (line, ""),
            };
            if url.is_empty() && name.is_empty() {
                return None;
            }
            Some(JobEntry {
                url: url.to_string(),
                name: (!name.is_empty()).then(|| name.to_string()),
            })
        })
        .collect()
}

pub fn read_job_file(path: &Path) -> CoreResult<Vec<JobEntry>> {
    let bytes = fs::read(path)
        .map_err(|err| CoreError::Config(format!("job file {}: {}", path.display(), err)))?;
    Ok(parse_job_list(&String::from_utf8_lossy(&bytes)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    /// In job-list order.
    pub summaries: Vec<JobSummary>,
}

impl BatchReport {
    pub fn done(&self) -> usize {
        self.summaries
            .iter()
            .filter(|summary| summary.status == JobStatus::Done)
            .count()
    }

    pub fn exit_code(&self) -> i32 {
        if self.done() == self.summaries.len() {
            0
        } else {
            1
        }
    }
}

/// Runs a job list with at most `job_worker` jobs at a time.
pub struct BatchRunner {
    orchestrator: Arc<Orchestrator>,
    path: PathBuf,
}

impl BatchRunner {
    pub fn new(orchestrator: Arc<Orchestrator>, path: impl Into<PathBuf>) -> Self {
        Self {
            orchestrator,
            path: path.into(),
        }
    }

    pub fn run(&self, entries: Vec<JobEntry>) -> BatchReport {
        let batch_id = Uuid::new_v4();
        let span = info_span!("batch", id = %batch_id);
        let total = entries.len();
        let workers = self.orchestrator.options().job_worker.max(1).min(total.max(1));
        info!(parent: &span, jobs = total, workers, "batch starting");

        let (job_tx, job_rx) = crossbeam_channel::unbounded::<(usize, JobEntry)>();
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<(usize, JobSummary)>();
        for job in entries.into_iter().enumerate() {
            // Receivers outlive this loop.
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                let span = span.clone();
                scope.spawn(move || {
                    let _entered = span.enter();
                    while let Ok((index, entry)) = job_rx.recv() {
                        let summary = self.run_entry(&entry);
                        let _ = done_tx.send((index, summary));
                    }
                });
            }
        });
        drop(done_tx);

        let mut finished: Vec<(usize, JobSummary)> = done_rx.iter().collect();
        finished.sort_by_key(|(index, _)| *index);
        let report = BatchReport {
            batch_id,
            summaries: finished.into_iter().map(|(_, summary)| summary).collect(),
        };
        info!(parent: &span, done = report.done(), jobs = total, "batch finished");
        report
    }

    fn run_entry(&self, entry: &JobEntry) -> JobSummary {
        let request = JobRequest::new(entry.url.clone(), entry.name.clone(), self.path.clone());
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.orchestrator.run(&request)));
        match outcome {
            Ok(Ok(summary)) => summary,
            Ok(Err(err)) => {
                error!(job = %request.label(), error = %err, "job aborted in batch");
                JobSummary::failed(request.label(), err.to_string())
            }
            Err(_) => {
                error!(job = %request.label(), "job panicked in batch");
                JobSummary::failed(request.label(), "job panicked")
            }
        }
    }
}
