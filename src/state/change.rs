// src/state/change.rs

//! Changes
//!
//! A Change is the durable, user-visible unit of long-running work. It owns
//! a set of tasks; its status is derived from theirs. The derivation and
//! the abort rules live here, next to the data they read.

use super::task::Status;
use super::State;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A durable unit of user-visible work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub kind: String,
    pub summary: String,
    pub spawn_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_time: Option<DateTime<Utc>>,
    /// Explicit status, used only when the change has no tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    /// Opaque key→JSON data attached by the API layer
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_ids: Vec<String>,
}

impl Change {
    pub fn new(id: String, kind: &str, summary: &str) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            spawn_time: Utc::now(),
            ready_time: None,
            status: None,
            data: serde_json::Map::new(),
            task_ids: Vec::new(),
        }
    }

    /// Typed read from the change's data bag
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> crate::Result<T> {
        let value = self
            .data
            .get(key)
            .ok_or_else(|| crate::Error::NoState(format!("change {} {}", self.id, key)))?;
        serde_json::from_value(value.clone()).map_err(|e| crate::Error::DecodeError {
            path: format!("change {} {}", self.id, key),
            reason: e.to_string(),
        })
    }

    /// Write into the change's data bag
    pub fn set<T: Serialize>(&mut self, key: &str, value: T) {
        if let Ok(v) = serde_json::to_value(value) {
            self.data.insert(key.to_string(), v);
        }
    }
}

impl State {
    /// Derive a change's status from its tasks
    pub fn change_status(&self, change_id: &str) -> Status {
        let chg = match self.changes.get(change_id) {
            Some(c) => c,
            None => return Status::Hold,
        };
        if chg.task_ids.is_empty() {
            return chg.status.unwrap_or(Status::Hold);
        }

        let statuses: Vec<Status> = chg
            .task_ids
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .map(|t| t.status)
            .collect();

        if statuses.iter().all(|s| *s == Status::Do) {
            return Status::Do;
        }
        if statuses
            .iter()
            .any(|s| matches!(s, Status::Doing | Status::Undoing))
        {
            return Status::Doing;
        }
        if !statuses.iter().all(|s| s.is_ready()) {
            // mixed pending and terminal tasks: work is still in flight
            return Status::Doing;
        }
        if statuses.iter().any(|s| *s == Status::Error) {
            return Status::Error;
        }
        if statuses.iter().any(|s| *s == Status::Undone) {
            return Status::Undone;
        }
        if statuses.iter().all(|s| *s == Status::Hold) {
            return Status::Hold;
        }
        Status::Done
    }

    /// Whether every task of the change is terminal
    pub fn change_ready(&self, change_id: &str) -> bool {
        self.change_status(change_id).is_ready()
    }

    /// First error summary of the change, if any task failed
    pub fn change_err(&self, change_id: &str) -> Option<String> {
        let chg = self.changes.get(change_id)?;
        let mut lines = Vec::new();
        for id in &chg.task_ids {
            if let Some(task) = self.tasks.get(id) {
                if task.status == Status::Error {
                    let detail = task.last_log_message().unwrap_or("task failed");
                    lines.push(format!("- {} ({})", task.summary, detail));
                }
            }
        }
        if lines.is_empty() {
            return None;
        }
        Some(format!(
            "cannot perform the following tasks:\n{}",
            lines.join("\n")
        ))
    }

    /// Mark every non-terminal task of the change for abort.
    ///
    /// Done tasks are scheduled to Undo; pending ones become Abort and the
    /// ensure loop resolves them to Hold. Running handlers see the raised
    /// kill flag at their next poll.
    pub fn abort_change(&mut self, change_id: &str) {
        let task_ids = match self.changes.get(change_id) {
            Some(c) => c.task_ids.clone(),
            None => return,
        };
        for id in task_ids {
            if let Some(task) = self.tasks.get_mut(&id) {
                match task.status {
                    Status::Do => task.set_status(Status::Abort),
                    Status::Doing => {
                        task.set_status(Status::Abort);
                        task.killed.store(true, std::sync::atomic::Ordering::Relaxed);
                    }
                    Status::Done => task.set_status(Status::Undo),
                    _ => {}
                }
            }
        }
    }

    /// Stamp `ready_time` once every task has reached a terminal status
    pub fn finalize_change(&mut self, change_id: &str) -> bool {
        if !self.change_ready(change_id) {
            return false;
        }
        if let Some(chg) = self.changes.get_mut(change_id) {
            if chg.ready_time.is_none() {
                chg.ready_time = Some(Utc::now());
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::task::TaskSet;

    fn state_with_change() -> (State, String, Vec<String>) {
        let mut st = State::default();
        let chg = st.new_change("install-snap", "Install \"foo\" snap");
        let t1 = st.new_task("download-snap", "Download foo");
        let t2 = st.new_task("link-snap", "Link foo");
        let ts = TaskSet::new(vec![t1.clone(), t2.clone()]);
        st.add_all(&chg, &ts).unwrap();
        (st, chg, vec![t1, t2])
    }

    #[test]
    fn test_status_all_do() {
        let (st, chg, _) = state_with_change();
        assert_eq!(st.change_status(&chg), Status::Do);
        assert!(!st.change_ready(&chg));
    }

    #[test]
    fn test_status_doing_and_done() {
        let (mut st, chg, tasks) = state_with_change();
        st.tasks.get_mut(&tasks[0]).unwrap().set_status(Status::Doing);
        assert_eq!(st.change_status(&chg), Status::Doing);

        st.tasks.get_mut(&tasks[0]).unwrap().set_status(Status::Done);
        assert_eq!(st.change_status(&chg), Status::Doing);

        st.tasks.get_mut(&tasks[1]).unwrap().set_status(Status::Done);
        assert_eq!(st.change_status(&chg), Status::Done);
        assert!(st.change_ready(&chg));
    }

    #[test]
    fn test_status_error_wins_when_ready() {
        let (mut st, chg, tasks) = state_with_change();
        st.tasks.get_mut(&tasks[0]).unwrap().set_status(Status::Error);
        st.tasks.get_mut(&tasks[1]).unwrap().set_status(Status::Hold);
        assert_eq!(st.change_status(&chg), Status::Error);
        assert!(st.change_ready(&chg));
    }

    #[test]
    fn test_change_err_collects_failures() {
        let (mut st, chg, tasks) = state_with_change();
        {
            let t = st.tasks.get_mut(&tasks[0]).unwrap();
            t.log_line("ERROR", "download timed out");
            t.set_status(Status::Error);
        }
        st.tasks.get_mut(&tasks[1]).unwrap().set_status(Status::Hold);

        let err = st.change_err(&chg).unwrap();
        assert!(err.starts_with("cannot perform the following tasks:"));
        assert!(err.contains("Download foo (download timed out)"));
    }

    #[test]
    fn test_abort_marks_tasks() {
        let (mut st, chg, tasks) = state_with_change();
        st.tasks.get_mut(&tasks[0]).unwrap().set_status(Status::Done);
        st.abort_change(&chg);

        assert_eq!(st.tasks[&tasks[0]].status, Status::Undo);
        assert_eq!(st.tasks[&tasks[1]].status, Status::Abort);
    }

    #[test]
    fn test_empty_change_uses_explicit_status() {
        let mut st = State::default();
        let chg = st.new_change("refresh-snap", "Refresh all snaps in the system");
        st.changes.get_mut(&chg).unwrap().status = Some(Status::Done);
        assert_eq!(st.change_status(&chg), Status::Done);
        assert!(st.change_ready(&chg));
    }
}
