use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_LEDGER_FILE: &str = "down.json";

/// Tunables shared by every stage of a job run.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// File workers per job.
    pub down_worker: usize,
    /// Per-file transfer timeout; a worker past it is evicted and replaced.
    pub down_overtime: Option<Duration>,
    /// Concurrent jobs in batch mode.
    pub job_worker: usize,
    pub auto_redo: bool,
    /// `None` keeps redoing for as long as failures occur.
    pub redo_limit: Option<u32>,
    pub redo_interval: Duration,
    pub force_update: bool,
    pub search_mode: bool,
    pub remove_tmp: bool,
    pub ledger_file: String,
    pub downtype_mapping: HashMap<String, String>,
    pub user_agent: String,
    pub overtime: Duration,
    pub connect_retry: u32,
    pub verify_tls: bool,
    pub down_proxy: Option<String>,
    pub speed_limit_bytes_per_sec: Option<u64>,
    pub poll_interval: Duration,
    /// Site driver id; picked from the URL when unset.
    pub site_driver: Option<String>,
    /// Opaque parameters handed to site drivers.
    pub driver_params: HashMap<String, String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            down_worker: 10,
            down_overtime: Some(Duration::from_secs(300)),
            job_worker: 1,
            auto_redo: false,
            redo_limit: Some(10),
            redo_interval: Duration::from_millis(500),
            force_update: false,
            search_mode: false,
            remove_tmp: true,
            ledger_file: DEFAULT_LEDGER_FILE.to_string(),
            downtype_mapping: HashMap::new(),
            user_agent: "Mozilla/5.0".to_string(),
            overtime: Duration::from_secs(30),
            connect_retry: 3,
            verify_tls: true,
            down_proxy: None,
            speed_limit_bytes_per_sec: None,
            poll_interval: Duration::from_millis(200),
            site_driver: None,
            driver_params: HashMap::new(),
        }
    }
}

impl JobOptions {
    /// Whether another redo round is allowed after `done_rounds` retries.
    pub fn may_redo(&self, done_rounds: u32) -> bool {
        if !self.auto_redo {
            return false;
        }
        match self.redo_limit {
            Some(limit) => done_rounds < limit,
            None => true,
        }
    }

    pub fn needs_refresh(&self, ready: bool) -> bool {
        self.force_update || self.search_mode || !ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redo_is_capped_unless_limit_removed() {
        let mut options = JobOptions::default();
        assert!(!options.may_redo(0));

        options.auto_redo = true;
        options.redo_limit = Some(2);
        assert!(options.may_redo(1));
        assert!(!options.may_redo(2));

        options.redo_limit = None;
        assert!(options.may_redo(10_000));
    }

    #[test]
    fn refresh_forced_by_flags() {
        let mut options = JobOptions::default();
        assert!(!options.needs_refresh(true));
        assert!(options.needs_refresh(false));
        options.search_mode = true;
        assert!(options.needs_refresh(true));
    }
}
