// src/state/runner.rs

//! Ensure loop
//!
//! A single background worker drives pending tasks forward. Each pass
//! collects runnable tasks under the state lock, releases it, dispatches
//! the registered handlers on the blocking pool, then re-acquires the lock
//! to record outcomes. Handlers observe only the dependency order; whether
//! a pass runs one task or many is not part of the contract.
//!
//! Handlers must be idempotent with respect to their recorded side-effects:
//! after a crash, tasks found in Doing/Undoing are simply re-dispatched.

use super::task::Status;
use super::StateStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Outcome a handler reports for one invocation
#[derive(Debug)]
pub enum TaskError {
    /// Transient failure; the task stays in flight and is re-dispatched
    /// after a backoff
    Retry { after: Option<Duration> },
    /// Terminal failure; the task goes to Error and the change backs out
    Fail(String),
}

/// Handler view of a running task.
///
/// The context deliberately does not hold the state lock: handlers take it
/// for short reads and writes and drop it around blocking work.
#[derive(Clone)]
pub struct TaskCtx {
    store: StateStore,
    task_id: String,
    kill: Arc<AtomicBool>,
    observer: Option<Observer>,
}

impl TaskCtx {
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Poll the cooperative abort flag; cheap, lock-free
    pub fn aborted(&self) -> bool {
        self.kill.load(Ordering::Relaxed)
    }

    /// Update the task's progress counters
    pub fn set_progress(&self, label: &str, done: usize, total: usize) {
        let mut change_id = None;
        {
            let mut st = self.store.lock();
            if let Some(task) = st.task_mut(&self.task_id) {
                task.progress = Some(super::Progress {
                    label: label.to_string(),
                    done,
                    total,
                });
                change_id = task.change.clone();
            }
        }
        if let Some(obs) = &self.observer {
            obs(EnsureEvent::TaskProgress {
                task_id: self.task_id.clone(),
                change_id: change_id.unwrap_or_default(),
                label: label.to_string(),
                done,
                total,
            });
        }
    }

    /// Append a line to the task log
    pub fn log(&self, msg: &str) {
        let mut st = self.store.lock();
        if let Some(task) = st.task_mut(&self.task_id) {
            task.log_line("INFO", msg);
        }
    }

    /// Typed read from the task's data bag
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> crate::Result<T> {
        let st = self.store.lock();
        let task = st
            .task(&self.task_id)
            .ok_or_else(|| crate::Error::NotFound(format!("task {}", self.task_id)))?;
        task.get(key)
    }

    /// Write into the task's data bag
    pub fn set<T: serde::Serialize>(&self, key: &str, value: T) {
        let mut st = self.store.lock();
        if let Some(task) = st.task_mut(&self.task_id) {
            task.set(key, value);
        }
    }

    /// Id of the owning change
    pub fn change_id(&self) -> Option<String> {
        let st = self.store.lock();
        st.task(&self.task_id).and_then(|t| t.change.clone())
    }
}

/// Events surfaced to the daemon's event hub
#[derive(Debug, Clone)]
pub enum EnsureEvent {
    ChangeUpdate {
        change_id: String,
        kind: String,
        summary: String,
        status: String,
        ready: bool,
    },
    TaskProgress {
        task_id: String,
        change_id: String,
        label: String,
        done: usize,
        total: usize,
    },
}

pub type Observer = Arc<dyn Fn(EnsureEvent) + Send + Sync>;

type Handler = Arc<dyn Fn(&TaskCtx) -> Result<(), TaskError> + Send + Sync>;

struct HandlerPair {
    do_fn: Handler,
    undo_fn: Option<Handler>,
}

/// Default periodic poll interval between ensure passes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Base and cap of the exponential retry backoff
const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_CAP: Duration = Duration::from_secs(30);

/// Registry of task handlers plus the worker that dispatches them
pub struct TaskRunner {
    store: StateStore,
    handlers: Mutex<HashMap<String, HandlerPair>>,
    observer: Mutex<Option<Observer>>,
    poll_interval: Duration,
}

impl TaskRunner {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            handlers: Mutex::new(HashMap::new()),
            observer: Mutex::new(None),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Register the `(do, undo)` pair for a task kind
    pub fn add_handler<F, U>(&self, kind: &str, do_fn: F, undo_fn: Option<U>)
    where
        F: Fn(&TaskCtx) -> Result<(), TaskError> + Send + Sync + 'static,
        U: Fn(&TaskCtx) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        self.handlers.lock().insert(
            kind.to_string(),
            HandlerPair {
                do_fn: Arc::new(do_fn),
                undo_fn: undo_fn.map(|f| Arc::new(f) as Handler),
            },
        );
    }

    /// Subscribe to change/task events
    pub fn set_observer(&self, observer: Observer) {
        *self.observer.lock() = Some(observer);
    }

    /// Re-examine tasks left over from a previous run.
    ///
    /// Tasks found mid-flight revert to their pending status and will be
    /// dispatched again.
    pub fn recover(&self) {
        let mut st = self.store.lock();
        let ids: Vec<String> = st.tasks.keys().cloned().collect();
        let mut reverted = 0;
        for id in ids {
            if let Some(task) = st.task_mut(&id) {
                match task.status {
                    Status::Doing => {
                        task.status = Status::Do;
                        reverted += 1;
                    }
                    Status::Undoing => {
                        task.status = Status::Undo;
                        reverted += 1;
                    }
                    _ => {}
                }
            }
        }
        if reverted > 0 {
            tracing::info!("re-examining {} interrupted tasks", reverted);
            self.store.ensure_before(Duration::ZERO);
        }
    }

    /// One ensure pass. Returns true if any task was dispatched or any
    /// status changed, so the caller can loop to a fixed point.
    pub async fn ensure(&self) -> bool {
        let mut progressed = false;

        // Resolve abort markers for tasks that never started.
        {
            let mut st = self.store.lock();
            let ids: Vec<String> = st.tasks.keys().cloned().collect();
            for id in ids {
                if let Some(task) = st.task_mut(&id) {
                    if task.status == Status::Abort {
                        task.set_status(Status::Hold);
                        progressed = true;
                    }
                }
            }
        }

        let runnable = self.collect_runnable();
        for (task_id, undoing) in runnable {
            if self.dispatch(&task_id, undoing).await {
                progressed = true;
            }
        }

        self.finalize_changes();
        progressed
    }

    /// Run ensure passes until the daemon shuts down
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.store.consume_wake();
            while self.ensure().await {
                if *shutdown.borrow() {
                    return;
                }
            }
            let deadline = self.store.next_wake(self.poll_interval);
            tokio::select! {
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                _ = self.store.wake_requested() => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Collect tasks whose dependencies are satisfied, in id order
    fn collect_runnable(&self) -> Vec<(String, bool)> {
        let st = self.store.lock();
        let mut out = Vec::new();
        let mut ids: Vec<&String> = st.tasks.keys().collect();
        ids.sort_by_key(|id| id.parse::<u64>().unwrap_or(0));

        let now = std::time::Instant::now();
        for id in ids {
            let task = &st.tasks[id];
            if task.not_before.map_or(false, |t| t > now) {
                continue;
            }
            match task.status {
                // Doing/Undoing at collection time are retry leftovers: the
                // runner is serial, so nothing is actually in flight here.
                Status::Do | Status::Doing => {
                    if task.aborted() {
                        continue;
                    }
                    let waits_done = task
                        .wait_tasks
                        .iter()
                        .all(|w| st.tasks.get(w).map(|t| t.status) == Some(Status::Done));
                    if waits_done {
                        out.push((id.clone(), false));
                    }
                }
                Status::Undo | Status::Undoing => {
                    let halts_settled = task.halt_tasks.iter().all(|h| {
                        !matches!(
                            st.tasks.get(h).map(|t| t.status),
                            Some(Status::Done)
                                | Some(Status::Doing)
                                | Some(Status::Undoing)
                                | Some(Status::Undo)
                        )
                    });
                    if halts_settled {
                        out.push((id.clone(), true));
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Dispatch one task handler and record its outcome
    async fn dispatch(&self, task_id: &str, undoing: bool) -> bool {
        let (handler, ctx, attempts) = {
            let mut st = self.store.lock();
            let task = match st.task_mut(task_id) {
                Some(t) => t,
                None => return false,
            };
            // Status may have moved since collection (abort, for one).
            match (undoing, task.status) {
                (false, Status::Do) | (false, Status::Doing) => {}
                (true, Status::Undo) | (true, Status::Undoing) => {}
                _ => return false,
            }
            task.set_status(if undoing { Status::Undoing } else { Status::Doing });
            task.attempts += 1;
            task.not_before = None;
            let attempts = task.attempts;
            let kind = task.kind.clone();
            let kill = task.killed.clone();

            let pair = self.handlers.lock();
            let handler = match pair.get(&kind) {
                Some(p) if undoing => match &p.undo_fn {
                    Some(u) => u.clone(),
                    None => {
                        // No undo registered: undoing is a no-op.
                        task.set_status(Status::Undone);
                        return true;
                    }
                },
                Some(p) => p.do_fn.clone(),
                None => {
                    task.log_line("ERROR", &format!("no handler for task kind {:?}", kind));
                    task.set_status(Status::Error);
                    return true;
                }
            };
            drop(pair);

            let ctx = TaskCtx {
                store: self.store.clone(),
                task_id: task_id.to_string(),
                kill,
                observer: self.observer.lock().clone(),
            };
            (handler, ctx, attempts)
        };

        // Run the handler outside the state lock.
        let result = {
            let handler = handler.clone();
            let ctx = ctx.clone();
            tokio::task::spawn_blocking(move || handler(&ctx))
                .await
                .unwrap_or_else(|e| Err(TaskError::Fail(format!("handler panicked: {}", e))))
        };

        let mut st = self.store.lock();
        let aborted_mid_flight = st
            .task(task_id)
            .map(|t| t.status == Status::Abort)
            .unwrap_or(false);
        let change_id = st.task(task_id).and_then(|t| t.change.clone());

        match result {
            Ok(()) => {
                if let Some(task) = st.task_mut(task_id) {
                    if undoing {
                        task.set_status(Status::Undone);
                    } else if aborted_mid_flight || task.aborted() {
                        // Completed while the change was being aborted: the
                        // recorded side-effects must be backed out.
                        task.status = Status::Undo;
                    } else {
                        task.set_status(Status::Done);
                    }
                }
            }
            Err(TaskError::Retry { after }) => {
                let backoff = after.unwrap_or_else(|| retry_backoff(attempts));
                if let Some(task) = st.task_mut(task_id) {
                    task.log_line("INFO", &format!("will retry in {:?}", backoff));
                    task.not_before = Some(std::time::Instant::now() + backoff);
                }
                drop(st);
                self.store.ensure_before(backoff);
                // Not progress: the fixed-point loop must not spin on the
                // backoff window.
                return false;
            }
            Err(TaskError::Fail(msg)) => {
                if let Some(task) = st.task_mut(task_id) {
                    task.log_line("ERROR", &msg);
                    task.set_status(Status::Error);
                }
                if !undoing {
                    if let Some(cid) = &change_id {
                        propagate_error(&mut st, cid, task_id);
                    }
                }
                tracing::warn!(task = task_id, "task failed: {}", msg);
            }
        }
        true
    }

    /// Stamp ready changes and surface their transitions
    fn finalize_changes(&self) {
        let observer = self.observer.lock().clone();
        let mut events = Vec::new();
        {
            let mut st = self.store.lock();
            let ids: Vec<String> = st.changes.keys().cloned().collect();
            for id in ids {
                if st.finalize_change(&id) {
                    let status = st.change_status(&id);
                    if let Some(chg) = st.change(&id) {
                        events.push(EnsureEvent::ChangeUpdate {
                            change_id: id.clone(),
                            kind: chg.kind.clone(),
                            summary: chg.summary.clone(),
                            status: status.to_string(),
                            ready: true,
                        });
                    }
                }
            }
        }
        if let Some(obs) = observer {
            for ev in events {
                obs(ev);
            }
        }
    }
}

/// Exponential backoff for transient task failures
fn retry_backoff(attempts: u32) -> Duration {
    let factor = 1u32 << attempts.saturating_sub(1).min(6);
    std::cmp::min(RETRY_BASE * factor, RETRY_CAP)
}

/// Back out a change after a terminal task failure: pending tasks are held,
/// completed ones are scheduled to undo in reverse dependency order.
fn propagate_error(st: &mut super::State, change_id: &str, failed_task: &str) {
    let task_ids = match st.change(change_id) {
        Some(c) => c.task_ids.clone(),
        None => return,
    };
    for id in task_ids {
        if id == failed_task {
            continue;
        }
        if let Some(task) = st.task_mut(&id) {
            match task.status {
                Status::Do | Status::Abort => task.set_status(Status::Hold),
                Status::Done => task.status = Status::Undo,
                _ => {}
            }
        }
    }
}
