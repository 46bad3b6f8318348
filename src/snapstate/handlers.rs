// src/snapstate/handlers.rs

//! Task handlers for snap operations
//!
//! Every handler is paired with an undo and records its side-effects in
//! the state tree, so re-running after a crash is safe: each one checks
//! what is already recorded before acting.

use super::{SnapSetup, SnapState};
use crate::state::{TaskCtx, TaskError, TaskRunner};
use crate::store::{RemoteSnap, Store, StoreError};
use std::collections::BTreeMap;
use std::sync::Arc;

/// State path recording mounted revisions
const MOUNTS_PATH: &str = "mounts";

/// Read the operation's work order: from this task, or from the task it
/// points at via `snap-setup-task`.
pub fn snap_setup(ctx: &TaskCtx) -> Result<SnapSetup, TaskError> {
    if let Ok(setup) = ctx.get::<SnapSetup>("snap-setup") {
        return Ok(setup);
    }
    let owner: String = ctx
        .get("snap-setup-task")
        .map_err(|e| TaskError::Fail(format!("internal: no snap-setup: {}", e)))?;
    let st = ctx.store().lock();
    st.task(&owner)
        .ok_or_else(|| TaskError::Fail(format!("internal: snap-setup task {} vanished", owner)))?
        .get("snap-setup")
        .map_err(|e| TaskError::Fail(format!("internal: no snap-setup: {}", e)))
}

/// Write the (possibly resolved) work order back where it lives
fn update_snap_setup(ctx: &TaskCtx, setup: &SnapSetup) {
    let owner = match ctx.get::<String>("snap-setup-task") {
        Ok(owner) => owner,
        Err(_) => ctx.task_id().to_string(),
    };
    let mut st = ctx.store().lock();
    if let Some(task) = st.task_mut(&owner) {
        task.set("snap-setup", setup);
    }
}

fn remote_from_setup(setup: &SnapSetup) -> RemoteSnap {
    RemoteSnap {
        name: setup.name.clone(),
        snap_id: setup.snap_id.clone(),
        version: setup.version.clone(),
        revision: setup.revision,
        channel: setup.channel.clone(),
        developer: setup.developer.clone(),
        summary: String::new(),
        description: String::new(),
        prices: BTreeMap::new(),
    }
}

fn store_failure(err: StoreError) -> TaskError {
    match err {
        StoreError::Unavailable(msg) => {
            tracing::debug!("store not reachable, will retry: {}", msg);
            TaskError::Retry { after: None }
        }
        other => TaskError::Fail(other.to_string()),
    }
}

/// Register the snap operation handlers with the runner
pub fn register(runner: &TaskRunner, store: Arc<dyn Store>) {
    // prepare-snap: resolve the snap against the store
    {
        let store = store.clone();
        runner.add_handler(
            "prepare-snap",
            move |ctx| {
                if ctx.aborted() {
                    return Ok(());
                }
                let mut setup = snap_setup(ctx)?;
                if setup.sideloaded || !setup.version.is_empty() {
                    return Ok(());
                }
                let remote = store
                    .snap(&setup.name, &setup.channel)
                    .map_err(store_failure)?;
                setup.snap_id = remote.snap_id;
                setup.version = remote.version;
                setup.developer = remote.developer;
                if setup.revision == 0 {
                    setup.revision = remote.revision;
                }
                update_snap_setup(ctx, &setup);
                ctx.log(&format!(
                    "resolved {:?} to revision {}",
                    setup.name, setup.revision
                ));
                Ok(())
            },
            None::<fn(&TaskCtx) -> Result<(), TaskError>>,
        );
    }

    // download-snap: fetch the snap file
    {
        let store = store.clone();
        runner.add_handler(
            "download-snap",
            move |ctx| {
                if ctx.aborted() {
                    return Ok(());
                }
                let mut setup = snap_setup(ctx)?;
                if setup.snap_path.is_some() {
                    return Ok(());
                }
                ctx.set_progress(&format!("Downloading {}", setup.name), 0, 1);
                let path = store
                    .download(&remote_from_setup(&setup))
                    .map_err(store_failure)?;
                ctx.set_progress(&format!("Downloading {}", setup.name), 1, 1);
                setup.snap_path = Some(path);
                update_snap_setup(ctx, &setup);
                Ok(())
            },
            Some(|ctx: &TaskCtx| {
                let setup = snap_setup(ctx)?;
                if let Some(path) = &setup.snap_path {
                    let _ = std::fs::remove_file(path);
                }
                Ok(())
            }),
        );
    }

    // mount-snap: record the revision as mounted
    runner.add_handler(
        "mount-snap",
        |ctx| {
            if ctx.aborted() {
                return Ok(());
            }
            let setup = snap_setup(ctx)?;
            let mut st = ctx.store().lock();
            let mut mounts: BTreeMap<String, i64> = st.get(MOUNTS_PATH).unwrap_or_default();
            mounts.insert(setup.name.clone(), setup.revision);
            st.set(MOUNTS_PATH, mounts);
            Ok(())
        },
        Some(|ctx: &TaskCtx| {
            let setup = snap_setup(ctx)?;
            let mut st = ctx.store().lock();
            let mut mounts: BTreeMap<String, i64> = st.get(MOUNTS_PATH).unwrap_or_default();
            mounts.remove(&setup.name);
            st.set(MOUNTS_PATH, mounts);
            Ok(())
        }),
    );

    // link-snap: make the snap's new state current
    runner.add_handler(
        "link-snap",
        |ctx| {
            if ctx.aborted() {
                return Ok(());
            }
            let setup = snap_setup(ctx)?;
            let mut st = ctx.store().lock();
            let old = super::get(&st, &setup.name).ok();
            let snap_state = SnapState {
                snap_id: setup.snap_id.clone(),
                channel: setup.channel.clone(),
                revision: setup.revision,
                version: setup.version.clone(),
                developer: setup.developer.clone(),
                active: true,
                devmode: setup.flags.devmode,
                jailmode: setup.flags.jailmode,
                sideloaded: setup.sideloaded,
                prev_revision: old.as_ref().map(|o| o.revision),
            };
            super::set(&mut st, &setup.name, &snap_state);
            drop(st);
            ctx.set("old-snap-state", &old);
            Ok(())
        },
        Some(|ctx: &TaskCtx| {
            let setup = snap_setup(ctx)?;
            let old: Option<SnapState> = ctx.get("old-snap-state").unwrap_or(None);
            let mut st = ctx.store().lock();
            match old {
                Some(old) => super::set(&mut st, &setup.name, &old),
                None => super::remove_state(&mut st, &setup.name),
            }
            Ok(())
        }),
    );

    // unlink-snap: deactivate without removing
    runner.add_handler(
        "unlink-snap",
        |ctx| {
            if ctx.aborted() {
                return Ok(());
            }
            let setup = snap_setup(ctx)?;
            let mut st = ctx.store().lock();
            let mut snap = super::get(&st, &setup.name)
                .map_err(|e| TaskError::Fail(e.to_string()))?;
            ctx_set_under(&mut st, ctx, "was-active", snap.active);
            snap.active = false;
            super::set(&mut st, &setup.name, &snap);
            Ok(())
        },
        Some(|ctx: &TaskCtx| {
            let setup = snap_setup(ctx)?;
            let was_active: bool = ctx.get("was-active").unwrap_or(true);
            let mut st = ctx.store().lock();
            if let Ok(mut snap) = super::get(&st, &setup.name) {
                snap.active = was_active;
                super::set(&mut st, &setup.name, &snap);
            }
            Ok(())
        }),
    );

    // discard-snap: drop the snap from the system
    runner.add_handler(
        "discard-snap",
        |ctx| {
            if ctx.aborted() {
                return Ok(());
            }
            let setup = snap_setup(ctx)?;
            let mut st = ctx.store().lock();
            let old = super::get(&st, &setup.name).ok();
            super::remove_state(&mut st, &setup.name);
            let mut mounts: BTreeMap<String, i64> = st.get(MOUNTS_PATH).unwrap_or_default();
            mounts.remove(&setup.name);
            st.set(MOUNTS_PATH, mounts);
            drop(st);
            ctx.set("old-snap-state", &old);
            Ok(())
        },
        Some(|ctx: &TaskCtx| {
            let setup = snap_setup(ctx)?;
            let old: Option<SnapState> = ctx.get("old-snap-state").unwrap_or(None);
            if let Some(old) = old {
                let mut st = ctx.store().lock();
                super::set(&mut st, &setup.name, &old);
            }
            Ok(())
        }),
    );

    // revert-snap: swap current and previous revisions
    runner.add_handler(
        "revert-snap",
        |ctx| {
            if ctx.aborted() {
                return Ok(());
            }
            let setup = snap_setup(ctx)?;
            let mut st = ctx.store().lock();
            let mut snap = super::get(&st, &setup.name)
                .map_err(|e| TaskError::Fail(e.to_string()))?;
            let prev = snap
                .prev_revision
                .ok_or_else(|| TaskError::Fail("no revision to revert to".to_string()))?;
            snap.prev_revision = Some(snap.revision);
            snap.revision = prev;
            snap.devmode = setup.flags.devmode;
            snap.jailmode = setup.flags.jailmode;
            super::set(&mut st, &setup.name, &snap);
            Ok(())
        },
        Some(|ctx: &TaskCtx| {
            let setup = snap_setup(ctx)?;
            let mut st = ctx.store().lock();
            if let Ok(mut snap) = super::get(&st, &setup.name) {
                if let Some(prev) = snap.prev_revision {
                    snap.prev_revision = Some(snap.revision);
                    snap.revision = prev;
                    super::set(&mut st, &setup.name, &snap);
                }
            }
            Ok(())
        }),
    );

    // enable-snap / disable-snap: toggle availability
    runner.add_handler(
        "enable-snap",
        |ctx| set_active(ctx, true),
        Some(|ctx: &TaskCtx| set_active(ctx, false)),
    );
    runner.add_handler(
        "disable-snap",
        |ctx| set_active(ctx, false),
        Some(|ctx: &TaskCtx| set_active(ctx, true)),
    );
}

fn set_active(ctx: &TaskCtx, active: bool) -> Result<(), TaskError> {
    if ctx.aborted() {
        return Ok(());
    }
    let setup = snap_setup(ctx)?;
    let mut st = ctx.store().lock();
    let mut snap =
        super::get(&st, &setup.name).map_err(|e| TaskError::Fail(e.to_string()))?;
    snap.active = active;
    super::set(&mut st, &setup.name, &snap);
    Ok(())
}

/// Record a value in the task's data bag while the state lock is held
fn ctx_set_under<T: serde::Serialize>(
    st: &mut crate::state::State,
    ctx: &TaskCtx,
    key: &str,
    value: T,
) {
    if let Some(task) = st.task_mut(ctx.task_id()) {
        task.set(key, value);
    }
}
