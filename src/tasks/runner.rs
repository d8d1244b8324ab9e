//! Task scheduling under named locks

use super::{Task, TaskContext};
use crate::error::{RelayerError, RelayerResult};
use crate::tx::NonceLock;

use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct Registered {
    task: Arc<dyn Task>,
    context: TaskContext,
}

/// Runs registered tasks on their schedules
pub struct TaskRunner {
    /// Lock over the `tasks` namespace
    lock: Arc<NonceLock>,
    tasks: Vec<Registered>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRunner {
    pub fn new(lock: Arc<NonceLock>) -> Self {
        Self {
            lock,
            tasks: Vec::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn register_task(&mut self, task: Arc<dyn Task>) -> RelayerResult<()> {
        if self.tasks.iter().any(|r| r.task.name() == task.name()) {
            return Err(RelayerError::Task(format!(
                "task {} is already registered",
                task.name()
            )));
        }

        info!("Registered task {} ({})", task.name(), task.schedule());
        let context = TaskContext::new(task.name(), task.schedule());
        self.tasks.push(Registered { task, context });
        Ok(())
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.iter().map(|r| r.task.name().to_string()).collect()
    }

    /// Start the schedule loop of every registered task.
    ///
    /// The first run of each task waits for its schedule's first delay.
    pub async fn start_tasks(&self) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            warn!("Tasks already started");
            return;
        }

        for registered in &self.tasks {
            // Restart tasks that stopped themselves in a previous session
            if registered.context.schedule().is_none() {
                registered.context.set_schedule(registered.task.schedule());
            }

            let lock = self.lock.clone();
            let task = registered.task.clone();
            let context = registered.context.clone();
            handles.push(tokio::spawn(schedule_loop(lock, task, context)));
        }

        info!("Started {} tasks", handles.len());
    }

    /// Stop every schedule loop, waiting for runs in progress to finish
    pub async fn stop_tasks(&self) {
        for registered in &self.tasks {
            registered.context.stop();
        }

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Task loop ended abnormally: {}", e);
            }
        }

        info!("All tasks stopped");
    }

    /// Execute one locked run of the task named `name` now
    pub async fn run_once(&self, name: &str) -> RelayerResult<String> {
        let registered = self
            .tasks
            .iter()
            .find(|r| r.task.name() == name)
            .ok_or_else(|| RelayerError::Task(format!("unknown task {}", name)))?;

        run_locked(&self.lock, registered.task.as_ref(), &registered.context).await
    }
}

async fn schedule_loop(lock: Arc<NonceLock>, task: Arc<dyn Task>, context: TaskContext) {
    let mut updates = context.subscribe();

    loop {
        let next = updates
            .borrow_and_update()
            .as_ref()
            .map(|schedule| schedule.next_delay(Utc::now()));
        let delay = match next {
            Some(Some(delay)) => delay,
            Some(None) => {
                info!("Schedule of {} has no further runs", task.name());
                break;
            }
            None => break,
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                // Rescheduled or stopped while waiting
                continue;
            }
        }

        // Outcome is logged by run_locked
        let _ = run_locked(&lock, task.as_ref(), &context).await;
    }

    debug!("Schedule loop for {} exited", task.name());
}

/// Run `task` once while holding its named lock.
///
/// The lock is released on every exit path, including a panic inside the task.
async fn run_locked(lock: &NonceLock, task: &dyn Task, context: &TaskContext) -> RelayerResult<String> {
    let name = task.name();
    let guard = lock.lock_named(name).await?;
    info!("Running task {} (run #{})", name, guard.nonce() + 1);

    let started = Instant::now();
    let lease = guard.keep_alive();
    let result = match AssertUnwindSafe(task.execute(context)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(RelayerError::Task(format!(
            "task {} panicked: {}",
            name,
            panic_message(panic.as_ref())
        ))),
    };

    drop(lease);
    if let Err(e) = guard.release().await {
        error!("Failed to release lock of task {}: {}", name, e);
    }

    let elapsed = started.elapsed();
    crate::metrics::record_task_run(name, result.is_ok());
    match &result {
        Ok(message) => info!("Task {} finished in {:?}: {}", name, elapsed, message),
        Err(e) => error!("Task {} failed after {:?}: {}", name, elapsed, e),
    }

    result
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
