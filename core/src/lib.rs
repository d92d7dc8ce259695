pub mod backend;
pub mod batch;
pub mod cancel;
pub mod checksum;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod hls;
pub mod job;
pub mod ledger;
pub mod model;
pub mod net;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod resolver;
pub mod sanitize;
pub mod scheduler;
pub mod storage;
pub mod throttle;

#[cfg(test)]
mod tests;

pub use crate::batch::{read_job_file, BatchReport, BatchRunner, JobEntry};
pub use crate::config::JobOptions;
pub use crate::driver::{ManifestDriver, SiteDriver};
pub use crate::error::{CoreError, CoreResult};
pub use crate::job::{JobRequest, Orchestrator};
pub use crate::model::{JobStatus, JobSummary, JobView, LedgerDoc};
pub use crate::registry::Registry;
