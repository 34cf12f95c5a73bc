//! Asynchronous call-log writer.
//!
//! Handlers enqueue a [`CallLog`] after the response is on the wire and
//! move on; a background task drains the queue and appends JSON lines to
//! the log file. The queue is bounded: when full, the oldest record is
//! dropped with a warning so logging can never block or balloon memory
//! under load.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{info, warn};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;

use crate::models::call_log::CallLog;

pub struct CallLogger {
    queue: Mutex<VecDeque<CallLog>>,
    capacity: usize,
    notify: Notify,
    log_path: Option<PathBuf>,
}

impl CallLogger {
    pub fn new(log_path: Option<PathBuf>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            notify: Notify::new(),
            log_path,
        })
    }

    /// Non-blocking enqueue with drop-oldest overflow handling.
    pub fn enqueue(&self, record: CallLog) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= self.capacity {
            if let Some(dropped) = queue.pop_front() {
                warn!(
                    "Call log queue full, dropping oldest record {}",
                    dropped.request_id
                );
            }
        }
        queue.push_back(record);
        drop(queue);
        self.notify.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn drain(&self) -> Vec<CallLog> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.drain(..).collect()
    }

    /// Spawns the writer task.
    pub fn spawn_writer(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.notify.notified().await;
                let batch = self.drain();
                if batch.is_empty() {
                    continue;
                }
                self.write_batch(&batch).await;
            }
        })
    }

    /// Serializes and appends one batch; public for tests.
    pub async fn write_batch(&self, batch: &[CallLog]) {
        let Some(path) = &self.log_path else {
            return;
        };

        let mut lines = String::new();
        for record in batch {
            match serde_json::to_string(record) {
                Ok(line) => {
                    lines.push_str(&line);
                    lines.push('\n');
                }
                Err(e) => warn!("Failed to serialize call log {}: {e}", record.request_id),
            }
        }

        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(lines.as_bytes()).await?;
            file.flush().await
        }
        .await;

        match result {
            Ok(()) => info!("Flushed {} call log records", batch.len()),
            Err(e) => warn!("Failed to append call logs to {}: {e}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(request_id: &str) -> CallLog {
        CallLog::new(request_id.to_string(), "GET".to_string(), "/a".to_string())
    }

    #[test]
    fn overflow_drops_the_oldest_record() {
        let logger = CallLogger::new(None, 3);
        for i in 0..5 {
            logger.enqueue(record(&format!("req-{i}")));
        }
        let remaining = logger.drain();
        let ids: Vec<&str> = remaining.iter().map(|r| r.request_id.as_str()).collect();
        assert_eq!(ids, vec!["req-2", "req-3", "req-4"]);
    }

    #[tokio::test]
    async fn batches_append_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calls.jsonl");
        let logger = CallLogger::new(Some(path.clone()), 100);

        logger
            .write_batch(&[record("req-1"), record("req-2")])
            .await;
        logger.write_batch(&[record("req-3")]).await;

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 3);
        let parsed: CallLog = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(parsed.request_id, "req-3");
    }

    #[tokio::test]
    async fn writer_task_drains_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calls.jsonl");
        let logger = CallLogger::new(Some(path.clone()), 100);
        let handle = logger.clone().spawn_writer();

        logger.enqueue(record("req-1"));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(logger.pending(), 0);
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("req-1"));
        handle.abort();
    }
}
