// src/state/mod.rs

//! State store
//!
//! A rooted tree of JSON-serialisable entries plus the Change/Task graph,
//! guarded by one mutex and persisted as a single document. Every read and
//! write goes through [`StateStore::lock`]; dropping the guard after a
//! mutation rewrites the snapshot atomically (write-to-temp, then rename).
//!
//! Helpers that operate on already-locked state take `&mut State`, so the
//! same API serves callers that hold the guard and callers that take it
//! themselves; the borrow checker enforces that no Change or Task is
//! touched without the lock.

pub mod change;
pub mod runner;
pub mod task;

pub use change::Change;
pub use runner::{TaskCtx, TaskError, TaskRunner};
pub use task::{Progress, Status, Task, TaskSet};

use crate::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// The in-memory state tree and task graph
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct State {
    /// Opaque data entries keyed by dotted path
    #[serde(default)]
    pub(crate) data: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub(crate) changes: BTreeMap<String, Change>,
    #[serde(default)]
    pub(crate) tasks: BTreeMap<String, Task>,
    #[serde(default, rename = "last-change-id")]
    last_change_id: u64,
    #[serde(default, rename = "last-task-id")]
    last_task_id: u64,
    /// Assertion database; shares the state lock but is not part of the
    /// persisted document
    #[serde(skip)]
    pub(crate) assert_db: crate::asserts::Database,
}

impl State {
    /// Typed read of a data entry; absent paths yield [`Error::NoState`]
    pub fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = self
            .data
            .get(path)
            .ok_or_else(|| Error::NoState(path.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|e| Error::DecodeError {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    /// Write a data entry
    pub fn set<T: Serialize>(&mut self, path: &str, value: T) {
        if let Ok(v) = serde_json::to_value(value) {
            self.data.insert(path.to_string(), v);
        }
    }

    /// Remove a data entry
    pub fn unset(&mut self, path: &str) {
        self.data.remove(path);
    }

    /// Create a new change with a monotonic id
    pub fn new_change(&mut self, kind: &str, summary: &str) -> String {
        self.last_change_id += 1;
        let id = self.last_change_id.to_string();
        self.changes
            .insert(id.clone(), Change::new(id.clone(), kind, summary));
        id
    }

    /// Create a new task with a monotonic id
    pub fn new_task(&mut self, kind: &str, summary: &str) -> String {
        self.last_task_id += 1;
        let id = self.last_task_id.to_string();
        self.tasks
            .insert(id.clone(), Task::new(id.clone(), kind, summary));
        id
    }

    pub fn change(&self, id: &str) -> Option<&Change> {
        self.changes.get(id)
    }

    pub fn change_mut(&mut self, id: &str) -> Option<&mut Change> {
        self.changes.get_mut(id)
    }

    /// All changes, in id order
    pub fn all_changes(&self) -> Vec<&Change> {
        let mut chgs: Vec<&Change> = self.changes.values().collect();
        chgs.sort_by_key(|c| c.id.parse::<u64>().unwrap_or(0));
        chgs
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Attach a task-set to a change, rejecting dependency cycles
    pub fn add_all(&mut self, change_id: &str, ts: &TaskSet) -> Result<()> {
        for id in ts.ids() {
            if let Some(task) = self.tasks.get_mut(id) {
                task.change = Some(change_id.to_string());
            }
        }
        if let Some(chg) = self.changes.get_mut(change_id) {
            for id in ts.ids() {
                if !chg.task_ids.contains(id) {
                    chg.task_ids.push(id.clone());
                }
            }
        }
        self.check_acyclic(ts.ids())
    }

    /// Add wait edges from every task in `ts` to every task in `other`
    pub fn wait_all(&mut self, ts: &TaskSet, other: &TaskSet) {
        for id in ts.ids() {
            if let Some(task) = self.tasks.get_mut(id) {
                for dep in other.ids() {
                    if !task.wait_tasks.contains(dep) {
                        task.wait_tasks.push(dep.clone());
                    }
                }
            }
        }
        for dep in other.ids() {
            if let Some(task) = self.tasks.get_mut(dep) {
                for id in ts.ids() {
                    if !task.halt_tasks.contains(id) {
                        task.halt_tasks.push(id.clone());
                    }
                }
            }
        }
    }

    /// Depth-first cycle check over wait edges starting from `roots`
    fn check_acyclic(&self, roots: &[String]) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Visited,
        }
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        fn visit<'a>(
            st: &'a State,
            id: &'a str,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<()> {
            match marks.get(id) {
                Some(Mark::Visited) => return Ok(()),
                Some(Mark::Visiting) => return Err(Error::TaskCycle(id.to_string())),
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            if let Some(task) = st.tasks.get(id) {
                for dep in &task.wait_tasks {
                    visit(st, dep, marks)?;
                }
            }
            marks.insert(id, Mark::Visited);
            Ok(())
        }

        for id in roots {
            visit(self, id, &mut marks)?;
        }
        Ok(())
    }
}

struct StoreInner {
    state: Mutex<State>,
    path: Option<PathBuf>,
    ensure: Notify,
    next_ensure: Mutex<Option<Instant>>,
}

/// Handle to the locked, persistent state
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl StateStore {
    /// Open the store, loading the snapshot at `path` if one exists.
    ///
    /// A corrupt snapshot is fatal and reported; an absent one starts
    /// fresh. Passing `None` keeps the store purely in memory.
    pub fn open(path: Option<PathBuf>) -> Result<Self> {
        let state = match &path {
            Some(p) if p.exists() => {
                let raw = std::fs::read(p)
                    .map_err(|e| Error::IoError(format!("cannot read state file: {}", e)))?;
                serde_json::from_slice(&raw).map_err(|e| {
                    Error::IoError(format!("state file {:?} is corrupt: {}", p, e))
                })?
            }
            _ => State::default(),
        };
        Ok(Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(state),
                path,
                ensure: Notify::new(),
                next_ensure: Mutex::new(None),
            }),
        })
    }

    /// Acquire the state lock
    pub fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            guard: self.inner.state.lock(),
            inner: &self.inner,
            dirty: false,
        }
    }

    /// Wake the ensure loop no later than `after` from now
    pub fn ensure_before(&self, after: Duration) {
        let deadline = Instant::now() + after;
        {
            let mut next = self.inner.next_ensure.lock();
            match *next {
                Some(current) if current <= deadline => {}
                _ => *next = Some(deadline),
            }
        }
        self.inner.ensure.notify_one();
    }

    /// Next wake time for the ensure loop given its periodic interval
    pub(crate) fn next_wake(&self, poll_interval: Duration) -> Instant {
        let periodic = Instant::now() + poll_interval;
        match *self.inner.next_ensure.lock() {
            Some(requested) if requested < periodic => requested,
            _ => periodic,
        }
    }

    /// Clear any pending wake request; called when an ensure pass starts
    pub(crate) fn consume_wake(&self) {
        *self.inner.next_ensure.lock() = None;
    }

    /// Await an external [`StateStore::ensure_before`] request
    pub(crate) async fn wake_requested(&self) {
        self.inner.ensure.notified().await;
    }

}

/// Guard over the locked state; dropping it flushes a snapshot if the
/// state was mutated while held
pub struct StateGuard<'a> {
    guard: MutexGuard<'a, State>,
    inner: &'a StoreInner,
    dirty: bool,
}

impl Deref for StateGuard<'_> {
    type Target = State;

    fn deref(&self) -> &State {
        &self.guard
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut State {
        self.dirty = true;
        &mut self.guard
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if !self.dirty {
            return;
        }
        if let Some(path) = &self.inner.path {
            match serde_json::to_vec(&*self.guard) {
                Ok(doc) => {
                    if let Err(e) = write_snapshot(path, &doc) {
                        tracing::error!("cannot persist state to {:?}: {}", path, e);
                    }
                }
                Err(e) => tracing::error!("cannot serialize state: {}", e),
            }
        }
    }
}

/// Atomically write `path` from a serialized document
fn write_snapshot(path: &Path, doc: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, doc)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
