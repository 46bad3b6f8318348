// src/configstate.rs

//! Per-snap configuration
//!
//! Configuration lives in the state tree under `config` as one map per
//! snap. Reads are synchronous; writes go through a change with a single
//! run-configure task so they serialize with other operations and are
//! visible in the change log.

use crate::state::{State, TaskCtx, TaskError, TaskRunner, TaskSet};
use crate::{Error, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const CONFIG_PATH: &str = "config";

fn all_config(st: &State) -> BTreeMap<String, Map<String, Value>> {
    st.get(CONFIG_PATH).unwrap_or_default()
}

/// Read one configuration option of a snap
pub fn get(st: &State, snap: &str, key: &str) -> Result<Value> {
    all_config(st)
        .get(snap)
        .and_then(|conf| conf.get(key))
        .cloned()
        .ok_or_else(|| {
            Error::ConfigError(format!(
                "snap {:?} has no {:?} configuration option",
                snap, key
            ))
        })
}

/// Build the change applying a configuration patch.
///
/// Patching a key to null removes it.
pub fn change(st: &mut State, snap: &str, patch: Map<String, Value>) -> TaskSet {
    let id = st.new_task(
        "run-configure",
        &format!("Run configure hook of {:?} snap", snap),
    );
    if let Some(task) = st.task_mut(&id) {
        task.set("snap-name", snap);
        task.set("patch", Value::Object(patch));
    }
    TaskSet::new(vec![id])
}

/// Register the run-configure handler
pub fn register(runner: &TaskRunner) {
    runner.add_handler(
        "run-configure",
        |ctx| {
            if ctx.aborted() {
                return Ok(());
            }
            let snap: String = ctx
                .get("snap-name")
                .map_err(|e| TaskError::Fail(e.to_string()))?;
            let patch: Map<String, Value> = ctx
                .get("patch")
                .map_err(|e| TaskError::Fail(e.to_string()))?;

            let mut st = ctx.store().lock();
            let mut config = all_config(&st);
            let conf = config.entry(snap.clone()).or_default();
            let old = conf.clone();
            for (key, value) in patch {
                if value.is_null() {
                    conf.remove(&key);
                } else {
                    conf.insert(key, value);
                }
            }
            st.set(CONFIG_PATH, config);
            drop(st);
            ctx.set("old-config", Value::Object(old));
            Ok(())
        },
        Some(|ctx: &TaskCtx| {
            let snap: String = ctx
                .get("snap-name")
                .map_err(|e| TaskError::Fail(e.to_string()))?;
            let old: Map<String, Value> = match ctx.get("old-config") {
                Ok(old) => old,
                // do never ran, nothing to restore
                Err(_) => return Ok(()),
            };
            let mut st = ctx.store().lock();
            let mut config = all_config(&st);
            config.insert(snap, old);
            st.set(CONFIG_PATH, config);
            Ok(())
        }),
    );
}
