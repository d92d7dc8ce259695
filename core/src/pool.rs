use std::collections::HashSet;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::backend::TransferContext;
use crate::cancel::CancelToken;
use crate::config::JobOptions;
use crate::dispatch;
use crate::error::{CoreError, CoreResult};
use crate::ledger::LedgerHandle;
use crate::model::{FileId, FileStatus, VolumeId, VolumeStatus};
use crate::queue::{PendingTask, TaskQueue};
use crate::registry::Registry;
use crate::sanitize::{file_name_from_url, volume_dir};
use crate::scheduler::{PoolState, Scheduler, StateCell};

const STOP_POLL: Duration = Duration::from_millis(20);

/// Counts for one pass of the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    /// Tasks queued for the pass.
    pub task: u64,
    pub task_fail: u64,
    pub success: u64,
    /// Tasks recorded as failed because they ran past `down_overtime`.
    pub evicted: u64,
    /// In-flight tasks left pending by a forced stop.
    pub abandoned: u64,
    /// Unfinished files held back because an evicted transfer of theirs is
    /// still running.
    pub busy: u64,
    /// First ledger update that could not be written.
    pub ledger_error: Option<String>,
}

#[derive(Clone)]
struct InFlight {
    task: PendingTask,
    started: Instant,
    /// Whoever flips this first records the task's outcome.
    settled: Arc<AtomicBool>,
    cancel: CancelToken,
}

impl InFlight {
    fn claim(&self) -> bool {
        self.settled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

struct Shared {
    ledger: LedgerHandle,
    registry: Arc<Registry>,
    options: Arc<JobOptions>,
    job_dir: PathBuf,
    queue: TaskQueue,
    state: StateCell,
    stop_requested: AtomicBool,
    abandon: AtomicBool,
    report: Mutex<PoolReport>,
    stragglers: Arc<Mutex<Vec<Straggler>>>,
}

/// Thread of an evicted transfer that has not returned yet.
struct Straggler {
    volume_id: VolumeId,
    file_id: FileId,
    handle: JoinHandle<()>,
}

impl Shared {
    fn update_report(&self, apply: impl FnOnce(&mut PoolReport)) {
        match self.report.lock() {
            Ok(mut report) => apply(&mut report),
            Err(poisoned) => apply(&mut poisoned.into_inner()),
        }
    }

    /// Writes a task outcome to the ledger. Must only be called by the
    /// holder of the task's settle claim.
    fn settle(&self, task: &PendingTask, outcome: CoreResult<()>) {
        let (status, detail) = match &outcome {
            Ok(()) => (FileStatus::Done, None),
            Err(err) => (FileStatus::Error, Some(err.to_string())),
        };
        let written = self
            .ledger
            .lock()
            .and_then(|mut ledger| ledger.mark_file(task.volume_id, task.file_id, status, detail.clone()));
        match written {
            Ok(()) => {
                if status == FileStatus::Done {
                    debug!(file = %task.label(), url = %task.url, "file done");
                    self.update_report(|report| report.success += 1);
                } else {
                    let message = detail.unwrap_or_default();
                    warn!(file = %task.label(), url = %task.url, error = %message, "file failed");
                    self.update_report(|report| report.task_fail += 1);
                }
            }
            Err(err) => {
                error!(
                    file = %task.label(),
                    url = %task.url,
                    status = %status,
                    error = %err,
                    "ledger update dropped"
                );
                self.update_report(|report| {
                    report.task_fail += 1;
                    if report.ledger_error.is_none() {
                        report.ledger_error = Some(err.to_string());
                    }
                });
            }
        }
    }

    fn execute(&self, task: &PendingTask, cancel: &CancelToken) -> CoreResult<()> {
        let backend = dispatch::get_backend(
            &self.registry,
            &task.transfer_type,
            &self.options.downtype_mapping,
        )?;
        let dir = volume_dir(&self.job_dir, &task.volume_name);
        let name = if task.file_name.is_empty() {
            file_name_from_url(&task.url).unwrap_or_else(|| format!("file_{}", task.file_id))
        } else {
            task.file_name.clone()
        };
        let dest = dir.join(name);
        fs::create_dir_all(&dir)?;
        if dest.exists() {
            fs::remove_file(&dest)?;
        }
        let ctx = TransferContext::new(Arc::clone(&self.options), cancel.clone());
        backend.download(&task.url, &dest, task.extra.as_ref(), &ctx)
    }
}

struct WorkerSlot {
    handle: JoinHandle<()>,
    current: Arc<Mutex<Option<InFlight>>>,
    retired: Arc<AtomicBool>,
}

impl WorkerSlot {
    fn in_flight(&self) -> Option<InFlight> {
        match self.current.lock() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn set_current(current: &Mutex<Option<InFlight>>, value: Option<InFlight>) {
    match current.lock() {
        Ok(mut slot) => *slot = value,
        Err(poisoned) => *poisoned.into_inner() = value,
    }
}

fn worker_loop(shared: Arc<Shared>, current: Arc<Mutex<Option<InFlight>>>, retired: Arc<AtomicBool>) {
    loop {
        if retired.load(Ordering::SeqCst) || shared.stop_requested.load(Ordering::SeqCst) {
            break;
        }
        let Some(task) = shared.queue.pop() else {
            break;
        };
        let flight = InFlight {
            task: task.clone(),
            started: Instant::now(),
            settled: Arc::new(AtomicBool::new(false)),
            cancel: CancelToken::new(),
        };
        set_current(&current, Some(flight.clone()));
        debug!(file = %task.label(), url = %task.url, "file started");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| shared.execute(&task, &flight.cancel)))
            .unwrap_or_else(|_| Err(CoreError::Transfer(format!("transfer of {} panicked", task.url))));
        if flight.claim() {
            shared.settle(&task, outcome);
        }
        set_current(&current, None);
    }
}

fn spawn_worker(shared: &Arc<Shared>) -> WorkerSlot {
    let current = Arc::new(Mutex::new(None));
    let retired = Arc::new(AtomicBool::new(false));
    let handle = {
        let shared = Arc::clone(shared);
        let current = Arc::clone(&current);
        let retired = Arc::clone(&retired);
        thread::spawn(move || worker_loop(shared, current, retired))
    };
    WorkerSlot {
        handle,
        current,
        retired,
    }
}

fn supervise(shared: Arc<Shared>) {
    shared.state.transition(PoolState::Idle, PoolState::Running);
    let scheduler = Scheduler::new(shared.options.down_worker);
    let mut slots: Vec<WorkerSlot> = Vec::new();
    loop {
        if shared.abandon.load(Ordering::SeqCst) {
            abandon_all(&shared, slots);
            break;
        }
        evict_overdue(&shared, &mut slots);
        reap_finished(&shared, &mut slots);

        let draining = shared.stop_requested.load(Ordering::SeqCst);
        if !draining {
            let fill = scheduler.slots_to_fill(slots.len(), shared.queue.len());
            for _ in 0..fill {
                slots.push(spawn_worker(&shared));
            }
        }
        if slots.is_empty() && (draining || shared.queue.is_empty()) {
            break;
        }
        thread::sleep(shared.options.poll_interval);
    }
    shared.state.set(PoolState::Stopped);
}

/// Records overdue tasks as failed and replaces their workers. The stuck
/// thread is cancelled and kept as a straggler until it returns.
fn evict_overdue(shared: &Shared, slots: &mut Vec<WorkerSlot>) {
    let Some(limit) = shared.options.down_overtime else {
        return;
    };
    let mut index = 0usize;
    while index < slots.len() {
        let overdue = slots[index]
            .in_flight()
            .filter(|flight| flight.started.elapsed() > limit);
        match overdue {
            Some(flight) if flight.claim() => {
                let slot = slots.remove(index);
                slot.retired.store(true, Ordering::SeqCst);
                flight.cancel.cancel();
                match shared.stragglers.lock() {
                    Ok(mut stragglers) => stragglers.push(Straggler {
                        volume_id: flight.task.volume_id,
                        file_id: flight.task.file_id,
                        handle: slot.handle,
                    }),
                    Err(_) => error!(file = %flight.task.label(), "straggler lock poisoned"),
                }
                warn!(file = %flight.task.label(), url = %flight.task.url, "worker timed out, replacing it");
                shared.settle(
                    &flight.task,
                    Err(CoreError::Timeout(format!(
                        "{} ran longer than {:?}",
                        flight.task.url, limit
                    ))),
                );
                shared.update_report(|report| report.evicted += 1);
            }
            _ => index += 1,
        }
    }
}

fn reap_finished(shared: &Shared, slots: &mut Vec<WorkerSlot>) {
    let mut index = 0usize;
    while index < slots.len() {
        if !slots[index].handle.is_finished() {
            index += 1;
            continue;
        }
        let slot = slots.remove(index);
        let leftover = slot.in_flight();
        if slot.handle.join().is_err() {
            warn!("worker thread panicked");
        }
        if let Some(flight) = leftover {
            if flight.claim() {
                shared.settle(
                    &flight.task,
                    Err(CoreError::Transfer("worker exited before finishing".to_string())),
                );
            }
        }
    }
}

/// Forced stop: in-flight tasks are given up without touching the ledger,
/// so they stay pending for the next run.
fn abandon_all(shared: &Shared, slots: Vec<WorkerSlot>) {
    for slot in slots {
        slot.retired.store(true, Ordering::SeqCst);
        if let Some(flight) = slot.in_flight() {
            if flight.claim() {
                flight.cancel.cancel();
                info!(file = %flight.task.label(), "abandoned in-flight file");
                shared.update_report(|report| report.abandoned += 1);
            }
        }
    }
}

/// Runs one download pass over every unfinished file of a job.
pub struct WorkerPool {
    ledger: LedgerHandle,
    registry: Arc<Registry>,
    options: Arc<JobOptions>,
    job_dir: PathBuf,
    stragglers: Arc<Mutex<Vec<Straggler>>>,
}

impl WorkerPool {
    pub fn new(
        ledger: LedgerHandle,
        registry: Arc<Registry>,
        options: Arc<JobOptions>,
        job_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ledger,
            registry,
            options,
            job_dir: job_dir.into(),
            stragglers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Joins stragglers that have returned and lists the files whose
    /// evicted transfer is still running.
    fn busy_files(&self) -> CoreResult<HashSet<(VolumeId, FileId)>> {
        let mut stragglers = self
            .stragglers
            .lock()
            .map_err(|_| CoreError::Storage("straggler lock poisoned".to_string()))?;
        let mut running = Vec::new();
        for straggler in stragglers.drain(..) {
            if straggler.handle.is_finished() {
                if straggler.handle.join().is_err() {
                    warn!(volume = straggler.volume_id, file = straggler.file_id, "evicted worker panicked");
                }
            } else {
                running.push(straggler);
            }
        }
        let busy = running
            .iter()
            .map(|straggler| (straggler.volume_id, straggler.file_id))
            .collect();
        *stragglers = running;
        Ok(busy)
    }

    /// Waits up to `budget` for evicted transfers to return. Returns how
    /// many are still running.
    pub fn wait_stragglers(&self, budget: Duration) -> CoreResult<usize> {
        let deadline = Instant::now() + budget;
        loop {
            let busy = self.busy_files()?.len();
            if busy == 0 || Instant::now() >= deadline {
                return Ok(busy);
            }
            thread::sleep(STOP_POLL);
        }
    }

    /// Fails every queued file whose transfer type has no backend, before
    /// anything is fetched. Returns the first such error.
    pub fn check_transfer_types(&self) -> CoreResult<()> {
        let mut ledger = self.ledger.lock()?;
        let mut unsupported = Vec::new();
        for volume in &ledger.document().down_list {
            if volume.status != VolumeStatus::Downloading {
                continue;
            }
            for file in volume.files.iter().filter(|file| file.status != FileStatus::Done) {
                if let Err(err) =
                    dispatch::get_backend(&self.registry, &file.transfer_type, &self.options.downtype_mapping)
                {
                    unsupported.push((volume.id, file.id, file.url.clone(), err));
                }
            }
        }
        let mut first = None;
        for (volume_id, file_id, url, err) in unsupported {
            warn!(volume = volume_id, file = file_id, url = %url, error = %err, "no backend for file");
            ledger.mark_file(volume_id, file_id, FileStatus::Error, Some(err.to_string()))?;
            if first.is_none() {
                first = Some(err);
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Queues every file that is not done, in volume then file order.
    /// Volumes with nothing left are marked done here; volumes still being
    /// listed are skipped.
    pub fn build_queue(&self) -> CoreResult<TaskQueue> {
        Ok(self.build_pass()?.0)
    }

    /// The queue plus the number of files held back as busy.
    fn build_pass(&self) -> CoreResult<(TaskQueue, u64)> {
        let busy_files = self.busy_files()?;
        let mut busy = 0u64;
        let mut ledger = self.ledger.lock()?;
        let mut tasks = Vec::new();
        let mut finished = Vec::new();
        let mut listing = 0usize;
        for volume in &ledger.document().down_list {
            match volume.status {
                VolumeStatus::Done => continue,
                VolumeStatus::Listing => {
                    listing += 1;
                    continue;
                }
                VolumeStatus::Downloading => {}
            }
            let before = tasks.len();
            for file in volume.files.iter().filter(|file| file.status != FileStatus::Done) {
                if busy_files.contains(&(volume.id, file.id)) {
                    busy += 1;
                    continue;
                }
                tasks.push(PendingTask {
                    volume_id: volume.id,
                    file_id: file.id,
                    volume_name: volume.name.clone(),
                    file_name: file.name.clone(),
                    url: file.url.clone(),
                    transfer_type: file.transfer_type.clone(),
                    extra: file.extra.clone(),
                });
            }
            if tasks.len() == before && volume.all_done() {
                finished.push(volume.id);
            }
        }
        for volume_id in finished {
            ledger.set_volume_status(volume_id, VolumeStatus::Done)?;
        }
        if listing > 0 {
            debug!(listing, "volumes still listing were not queued");
        }
        if busy > 0 {
            warn!(busy, "files held back while their evicted transfer runs");
        }
        Ok((TaskQueue::from_tasks(tasks), busy))
    }

    pub fn start(&self) -> CoreResult<PoolHandle> {
        let (queue, busy) = self.build_pass()?;
        let queued = queue.len() as u64;
        let shared = Arc::new(Shared {
            ledger: self.ledger.clone(),
            registry: Arc::clone(&self.registry),
            options: Arc::clone(&self.options),
            job_dir: self.job_dir.clone(),
            queue,
            state: StateCell::new(PoolState::Idle),
            stop_requested: AtomicBool::new(false),
            abandon: AtomicBool::new(false),
            report: Mutex::new(PoolReport {
                task: queued,
                busy,
                ..PoolReport::default()
            }),
            stragglers: Arc::clone(&self.stragglers),
        });
        info!(tasks = queued, workers = self.options.down_worker, "pool starting");
        let supervisor = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || supervise(shared))
        };
        Ok(PoolHandle {
            shared,
            supervisor: Some(supervisor),
        })
    }

    /// Starts the pass and waits for it to drain.
    pub fn run(&self) -> CoreResult<PoolReport> {
        self.start()?.wait()
    }
}

pub struct PoolHandle {
    shared: Arc<Shared>,
    supervisor: Option<JoinHandle<()>>,
}

impl PoolHandle {
    pub fn state(&self) -> PoolState {
        self.shared.state.get()
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Stops taking new tasks and waits up to `overtime` for in-flight ones.
    /// With `force`, in-flight tasks are then abandoned. Returns whether the pool
    /// reached `stopped`.
    pub fn stop(&self, overtime: Duration, force: bool) -> CoreResult<bool> {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared
            .state
            .transition(PoolState::Running, PoolState::Draining);
        if self.wait_stopped(overtime) {
            return Ok(true);
        }
        if !force {
            return Ok(false);
        }
        self.shared.abandon.store(true, Ordering::SeqCst);
        let grace = self.shared.options.poll_interval.saturating_mul(4) + Duration::from_secs(1);
        Ok(self.wait_stopped(grace))
    }

    fn wait_stopped(&self, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        loop {
            if self.state() == PoolState::Stopped {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(STOP_POLL);
        }
    }

    /// Blocks until the pool stops and returns its report.
    pub fn wait(mut self) -> CoreResult<PoolReport> {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor
                .join()
                .map_err(|_| CoreError::InvalidState("pool supervisor panicked".to_string()))?;
        }
        let report = self
            .shared
            .report
            .lock()
            .map_err(|_| CoreError::Storage("pool report lock poisoned".to_string()))?
            .clone();
        info!(
            tasks = report.task,
            success = report.success,
            failed = report.task_fail,
            "pool stopped"
        );
        Ok(report)
    }
}
