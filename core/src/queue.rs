use crossbeam_channel::{Receiver, TryRecvError};
use serde_json::Value;

use crate::model::{FileId, VolumeId};

/// One file waiting for a worker.
#[derive(Debug, Clone)]
pub struct PendingTask {
    pub volume_id: VolumeId,
    pub file_id: FileId,
    pub volume_name: String,
    pub file_name: String,
    pub url: String,
    pub transfer_type: String,
    pub extra: Option<Value>,
}

impl PendingTask {
    pub fn label(&self) -> String {
        format!("{}/{}", self.volume_id, self.file_id)
    }
}

/// Work queue built once per pass and then only drained. Popping never
/// blocks: an empty queue tells the worker to exit.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    rx: Receiver<PendingTask>,
}

impl TaskQueue {
    pub fn from_tasks(tasks: Vec<PendingTask>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        for task in tasks {
            // The receiver is alive for the whole loop.
            let _ = tx.send(task);
        }
        drop(tx);
        Self { rx }
    }

    pub fn pop(&self) -> Option<PendingTask> {
        match self.rx.try_recv() {
            Ok(task) => Some(task),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(volume_id: VolumeId, file_id: FileId) -> PendingTask {
        PendingTask {
            volume_id,
            file_id,
            volume_name: format!("v{}", volume_id),
            file_name: format!("{}.jpg", file_id),
            url: format!("http://img/{}/{}", volume_id, file_id),
            transfer_type: "http".to_string(),
            extra: None,
        }
    }

    #[test]
    fn drains_in_insertion_order_then_reports_empty() {
        let queue = TaskQueue::from_tasks(vec![task(0, 0), task(0, 1), task(1, 0)]);
        let worker_view = queue.clone();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().map(|t| t.label()), Some("0/0".to_string()));
        assert_eq!(worker_view.pop().map(|t| t.label()), Some("0/1".to_string()));
        assert_eq!(queue.pop().map(|t| t.label()), Some("1/0".to_string()));
        assert!(queue.pop().is_none());
        assert!(worker_view.is_empty());
    }
}
