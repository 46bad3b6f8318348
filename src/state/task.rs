// src/state/task.rs

//! Tasks and task-sets
//!
//! A Task is the atomic unit of work inside a Change. Tasks carry a status,
//! a bounded log, progress counters and an opaque JSON data bag. Dependency
//! edges are recorded both ways: `wait_tasks` must be Done before a task
//! runs, `halt_tasks` is the inverse and drives undo ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Maximum number of log entries retained per task
const MAX_LOG_ENTRIES: usize = 10;

/// Task (and derived Change) status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Waiting to run
    Do,
    /// Handler is running
    Doing,
    /// Completed successfully
    Done,
    /// Scheduled to run its undo handler
    Undo,
    /// Undo handler is running
    Undoing,
    /// Undo completed
    Undone,
    /// Paused or skipped; will not run
    Hold,
    /// Failed terminally
    Error,
    /// Marked for abort; the ensure loop resolves it to Hold or Undo
    Abort,
}

impl Status {
    /// Terminal statuses: the task will not transition further
    pub fn is_ready(self) -> bool {
        matches!(self, Status::Done | Status::Undone | Status::Hold | Status::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Do => "Do",
            Status::Doing => "Doing",
            Status::Done => "Done",
            Status::Undo => "Undo",
            Status::Undoing => "Undoing",
            Status::Undone => "Undone",
            Status::Hold => "Hold",
            Status::Error => "Error",
            Status::Abort => "Abort",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress counters reported by a running handler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    pub label: String,
    pub done: usize,
    pub total: usize,
}

/// An atomic unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: String,
    pub summary: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    pub spawn_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_time: Option<DateTime<Utc>>,
    /// Per-task JSON bag
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub data: serde_json::Map<String, serde_json::Value>,
    /// Tasks that must be Done before this one runs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wait_tasks: Vec<String>,
    /// Tasks that wait on this one (inverse of `wait_tasks`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub halt_tasks: Vec<String>,
    /// Owning change, set when the task-set is attached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<String>,
    /// Dispatch attempts, drives the retry backoff
    #[serde(default)]
    pub attempts: u32,
    /// Earliest next dispatch after a transient failure; not persisted
    #[serde(skip)]
    pub not_before: Option<std::time::Instant>,
    /// Cooperative abort flag polled by handlers; not persisted
    #[serde(skip, default = "new_kill_flag")]
    pub killed: Arc<AtomicBool>,
}

fn new_kill_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

impl Task {
    pub fn new(id: String, kind: &str, summary: &str) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            status: Status::Do,
            log: Vec::new(),
            progress: None,
            spawn_time: Utc::now(),
            ready_time: None,
            data: serde_json::Map::new(),
            wait_tasks: Vec::new(),
            halt_tasks: Vec::new(),
            change: None,
            attempts: 0,
            not_before: None,
            killed: new_kill_flag(),
        }
    }

    /// Append a log line, keeping only the most recent entries
    pub fn log_line(&mut self, level: &str, msg: &str) {
        let line = format!("{} {} {}", Utc::now().to_rfc3339(), level, msg);
        self.log.push(line);
        if self.log.len() > MAX_LOG_ENTRIES {
            let drop = self.log.len() - MAX_LOG_ENTRIES;
            self.log.drain(0..drop);
        }
    }

    /// Last log message with timestamp and level stripped, for error reports
    pub fn last_log_message(&self) -> Option<&str> {
        self.log.last().map(|line| {
            match line.splitn(3, ' ').nth(2) {
                Some(msg) => msg,
                None => line.as_str(),
            }
        })
    }

    /// Progress as the API reports it; defaults to 0/1 for an idle task
    pub fn progress(&self) -> (String, usize, usize) {
        match &self.progress {
            Some(p) => (p.label.clone(), p.done, p.total),
            None => (String::new(), 0, 1),
        }
    }

    /// Set the status, stamping `ready_time` on the transition to terminal
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
        if status.is_ready() && self.ready_time.is_none() {
            self.ready_time = Some(Utc::now());
        }
    }

    /// Whether the abort flag has been raised
    pub fn aborted(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }

    /// Typed read from the task's data bag
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> crate::Result<T> {
        let value = self
            .data
            .get(key)
            .ok_or_else(|| crate::Error::NoState(format!("task {} {}", self.id, key)))?;
        serde_json::from_value(value.clone()).map_err(|e| crate::Error::DecodeError {
            path: format!("task {} {}", self.id, key),
            reason: e.to_string(),
        })
    }

    /// Write into the task's data bag
    pub fn set<T: Serialize>(&mut self, key: &str, value: T) {
        if let Ok(v) = serde_json::to_value(value) {
            self.data.insert(key.to_string(), v);
        }
    }
}

/// A transient builder grouping tasks being added together
#[derive(Debug, Clone, Default)]
pub struct TaskSet {
    ids: Vec<String>,
}

impl TaskSet {
    pub fn new(ids: Vec<String>) -> Self {
        Self { ids }
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn push(&mut self, id: String) {
        self.ids.push(id);
    }
}
