//! Periodic retention sweep with a manual trigger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::documents::DocumentStore;
use crate::error::WorkerError;
use crate::queue::TaskQueue;

use super::{schedule_retention_sweep, RetentionPolicy};

pub struct RetentionScheduler {
    documents: Arc<dyn DocumentStore>,
    queue: TaskQueue,
    policy: RetentionPolicy,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl RetentionScheduler {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        queue: TaskQueue,
        policy: RetentionPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            documents,
            queue,
            policy,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts the sweep loop on a background thread. Each message on
    /// `trigger_rx` runs a sweep immediately.
    pub fn start(
        &self,
        mut trigger_rx: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<()>, WorkerError> {
        let documents = Arc::clone(&self.documents);
        let queue = self.queue.clone();
        let policy = self.policy;
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;

        std::thread::Builder::new()
            .name("docflow-retention".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        log::error!("Retention scheduler could not start a runtime: {}", e);
                        return;
                    }
                };

                rt.block_on(async {
                    let mut interval_timer = tokio::time::interval(interval);
                    interval_timer.tick().await; // skip immediate first tick

                    loop {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        tokio::select! {
                            _ = interval_timer.tick() => {},
                            Ok(()) = trigger_rx.recv() => {
                                log::info!("Manual retention sweep triggered");
                            },
                        }

                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        match schedule_retention_sweep(
                            documents.as_ref(),
                            &queue,
                            &policy,
                            Utc::now(),
                        ) {
                            Ok(report) if report.scheduled_count > 0 => {
                                log::info!(
                                    "Retention: scheduled {} permanent deletes",
                                    report.scheduled_count
                                );
                            }
                            Err(e) => log::error!("Retention sweep failed: {}", e),
                            _ => {}
                        }
                    }
                });
            })
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))
    }

    /// Signals the scheduler to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::documents::{NewDocument, SqliteDocumentStore};
    use crate::queue::{RetryPolicy, TaskStatus};

    #[test]
    fn test_manual_trigger_and_shutdown() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteDocumentStore::new(db.clone());
        store
            .create(&NewDocument {
                id: "old".to_string(),
                user_id: "u1".to_string(),
                filename: "old.txt".to_string(),
                checksum: "abc".to_string(),
                size_bytes: 3,
                mime_type: None,
            })
            .unwrap();
        store.mark_active("old", "uploads/old.txt", "v1").unwrap();
        store
            .soft_delete("old", "m1", Utc::now() - chrono::Duration::days(60))
            .unwrap();

        let queue = TaskQueue::new(db, RetryPolicy::default());
        let scheduler = RetentionScheduler::new(
            Arc::new(store),
            queue.clone(),
            RetentionPolicy::default(),
            Duration::from_secs(3600),
        );

        let (trigger_tx, trigger_rx) = broadcast::channel(16);
        let handle = scheduler.start(trigger_rx).unwrap();
        trigger_tx.send(()).unwrap();

        let mut queued = 0;
        for _ in 0..100 {
            queued = queue.count(TaskStatus::Queued).unwrap();
            if queued > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(queued, 1);

        scheduler.stop();
        // Wake the select loop so it sees the shutdown flag.
        let _ = trigger_tx.send(());
        handle.join().expect("scheduler thread panicked");
    }
}
