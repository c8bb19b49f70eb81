use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, info};

use crate::error::WorkerError;

use super::store::{TaskOutcome, TaskQueue};
use super::task::{Task, TaskKind, TaskStatus};

/// Executes the body of a claimed task.
pub trait TaskHandler: Send + Sync {
    fn handle(&self, task: &Task) -> TaskOutcome;
}

/// Summary of one settled delivery, sent to whoever drains the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub task_id: String,
    pub kind: TaskKind,
    pub attempt: u32,
    pub status: TaskStatus,
    pub outcome: TaskOutcome,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub worker_count: usize,
    pub lease: Duration,
    pub poll_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            lease: Duration::from_secs(900),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Worker threads that claim tasks from the queue, run them one at a time
/// and settle them.
pub struct WorkerPool {
    report_receiver: Receiver<TaskReport>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn start(
        queue: TaskQueue,
        handler: Arc<dyn TaskHandler>,
        settings: PoolSettings,
    ) -> Result<Self, WorkerError> {
        if settings.worker_count == 0 {
            return Err(WorkerError::SpawnFailed(
                "worker_count must be > 0".to_string(),
            ));
        }
        let (report_sender, report_receiver) = bounded::<TaskReport>(settings.worker_count * 16);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(settings.worker_count);
        for index in 0..settings.worker_count {
            let worker = Worker {
                name: format!("worker-{}-{}", std::process::id(), index),
                queue: queue.clone(),
                handler: Arc::clone(&handler),
                reports: report_sender.clone(),
                shutdown: Arc::clone(&shutdown),
                settings,
            };
            let handle = thread::Builder::new()
                .name(format!("docflow-worker-{}", index))
                .spawn(move || worker.run())
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
            workers.push(handle);
        }

        info!("Started {} workers", settings.worker_count);

        Ok(Self {
            report_receiver,
            workers,
            shutdown,
        })
    }

    pub fn recv_report_timeout(&self, timeout: Duration) -> Option<TaskReport> {
        self.report_receiver.recv_timeout(timeout).ok()
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Waits for every worker to finish its current task and exit.
    pub fn wait(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }
        info!("All workers have stopped");
    }
}

struct Worker {
    name: String,
    queue: TaskQueue,
    handler: Arc<dyn TaskHandler>,
    reports: Sender<TaskReport>,
    shutdown: Arc<AtomicBool>,
    settings: PoolSettings,
}

impl Worker {
    fn run(self) {
        debug!("{} started", self.name);

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.queue.claim(&self.name, self.settings.lease) {
                Ok(Some(task)) => self.process(task),
                Ok(None) => self.idle(),
                Err(e) => {
                    error!("{} failed to claim a task: {}", self.name, e);
                    self.idle();
                }
            }
        }

        debug!("{} stopped", self.name);
    }

    fn process(&self, task: Task) {
        debug!("{} processing task {} ({})", self.name, task.id, task.kind);
        let outcome = self.handler.handle(&task);

        let status = match self.queue.settle(&task, &outcome) {
            Ok(status) => status,
            Err(e) => {
                // The lease will lapse and the task is redelivered.
                error!("{} could not settle task {}: {}", self.name, task.id, e);
                return;
            }
        };

        let report = TaskReport {
            task_id: task.id,
            kind: task.kind,
            attempt: task.attempts,
            status,
            outcome,
        };
        if let Err(TrySendError::Full(report)) = self.reports.try_send(report) {
            debug!("Report channel full, dropping report for {}", report.task_id);
        }
    }

    /// Sleeps one poll interval in short steps so shutdown stays responsive.
    fn idle(&self) {
        let step = Duration::from_millis(50).min(self.settings.poll_interval);
        let mut waited = Duration::ZERO;
        while waited < self.settings.poll_interval && !self.shutdown.load(Ordering::Relaxed) {
            thread::sleep(step);
            waited += step;
        }
    }
}
