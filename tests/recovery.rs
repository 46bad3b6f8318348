// tests/recovery.rs

//! Persistence and restart behavior: the state document round-trips, and
//! tasks found mid-flight after a restart are re-examined.

mod common;

use common::{setup, Client};
use serde_json::json;
use snapd::daemon::Daemon;
use snapd::state::Status;

#[tokio::test]
async fn test_state_round_trips_across_restart() {
    let t = setup();

    // queue an install but do not run it
    let (status, body) = t
        .request(
            "POST",
            "/v2/snaps/foo",
            Some(json!({"action": "install"})),
            &Client::root(),
        )
        .await;
    assert_eq!(status, 202);
    let change_id = body["change"].as_str().unwrap().to_string();

    // simulate a crash mid-flight: one task is Doing when the daemon dies
    {
        let mut st = t.daemon.store.lock();
        let task_ids = st.change(&change_id).unwrap().task_ids.clone();
        st.task_mut(&task_ids[0]).unwrap().status = Status::Doing;
    }

    let config = t.daemon.config.clone();
    let snap_store = t.snap_store.clone();
    drop(t.daemon);

    // restart against the same state file
    let daemon = Daemon::with_collaborators(
        config,
        snap_store,
        std::sync::Arc::new(snapd::osutil::RecordingUserAdder::new()),
        std::sync::Arc::new(snapd::hookstate::NullHookRunner),
    )
    .unwrap();

    {
        let st = daemon.store.lock();
        let chg = st.change(&change_id).expect("change survived restart");
        assert_eq!(chg.kind, "install-snap");
        // the interrupted task reverted to Do
        for id in &chg.task_ids {
            assert!(matches!(
                st.task(id).unwrap().status,
                Status::Do | Status::Undo
            ));
        }
    }

    // the restarted ensure loop completes the work
    while daemon.runner.ensure().await {}
    let st = daemon.store.lock();
    assert_eq!(st.change_status(&change_id), Status::Done);
    assert!(snapd::snapstate::get(&st, "foo").unwrap().active);
}

#[tokio::test]
async fn test_identical_graph_after_reload() {
    let t = setup();

    let (_, body) = t
        .request(
            "POST",
            "/v2/snaps/foo",
            Some(json!({"action": "install"})),
            &Client::root(),
        )
        .await;
    let change_id = body["change"].as_str().unwrap().to_string();
    t.settle().await;

    let before = {
        let st = t.daemon.store.lock();
        let chg = st.change(&change_id).unwrap().clone();
        let tasks: Vec<_> = chg
            .task_ids
            .iter()
            .map(|id| {
                let task = st.task(id).unwrap();
                (
                    task.id.clone(),
                    task.kind.clone(),
                    task.status,
                    task.wait_tasks.clone(),
                    task.halt_tasks.clone(),
                )
            })
            .collect();
        (chg.kind.clone(), chg.summary.clone(), chg.task_ids.clone(), tasks)
    };

    let state_path = t.daemon.config.state_path.clone().unwrap();
    let reloaded = snapd::StateStore::open(Some(state_path)).unwrap();
    let st = reloaded.lock();
    let chg = st.change(&change_id).unwrap();
    assert_eq!(chg.kind, before.0);
    assert_eq!(chg.summary, before.1);
    assert_eq!(chg.task_ids, before.2);
    for (id, kind, status, waits, halts) in before.3 {
        let task = st.task(&id).unwrap();
        assert_eq!(task.kind, kind);
        assert_eq!(task.status, status);
        assert_eq!(task.wait_tasks, waits);
        assert_eq!(task.halt_tasks, halts);
    }
    assert_eq!(st.change_status(&change_id), Status::Done);
}

#[tokio::test]
async fn test_corrupt_state_file_is_fatal() {
    let dir = tempfile::TempDir::new().unwrap();
    let state_path = dir.path().join("state.json");
    std::fs::write(&state_path, b"{\"data\": [not json").unwrap();

    let config = snapd::DaemonConfig::default().with_state_path(state_path.clone());
    assert!(Daemon::new(config).is_err());
}
