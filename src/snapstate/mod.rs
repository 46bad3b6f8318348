// src/snapstate/mod.rs

//! Snap operations
//!
//! Translates the API's operation vocabulary into task-sets against the
//! state: install, refresh, remove, revert, enable, disable, try and the
//! multi-snap variants. Builders run under the state lock and only
//! construct the task graph; the handlers in [`handlers`] do the work.

pub mod handlers;

use crate::state::{State, TaskSet};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The platform base snap every other snap depends on
pub const BASE_SNAP: &str = "core";

/// State path holding the installed-snaps map
const SNAPS_PATH: &str = "snaps";

/// Per-snap install state, kept under the `snaps` entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapState {
    #[serde(rename = "snap-id", default)]
    pub snap_id: String,
    pub channel: String,
    pub revision: i64,
    pub version: String,
    #[serde(default)]
    pub developer: String,
    pub active: bool,
    #[serde(default)]
    pub devmode: bool,
    #[serde(default)]
    pub jailmode: bool,
    #[serde(default)]
    pub sideloaded: bool,
    /// Previous revision, kept for revert
    #[serde(rename = "prev-revision", default, skip_serializing_if = "Option::is_none")]
    pub prev_revision: Option<i64>,
}

/// Mode flags accepted by mutating operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    #[serde(default)]
    pub devmode: bool,
    #[serde(default)]
    pub jailmode: bool,
}

/// Validate and combine the mode flags.
///
/// devmode and jailmode are mutually exclusive; on a force-devmode system
/// jailmode cannot be honoured at all.
pub fn mode_flags(devmode: bool, jailmode: bool, force_devmode: bool) -> Result<Flags> {
    if jailmode {
        if force_devmode {
            return Err(Error::Conflict(
                "this system cannot honour the jailmode flag".to_string(),
            ));
        }
        if devmode {
            return Err(Error::Conflict(
                "cannot use devmode and jailmode flags together".to_string(),
            ));
        }
    }
    Ok(Flags {
        devmode: devmode || force_devmode,
        jailmode,
    })
}

/// Identity of a snap file, derived from assertions or declared unsafe
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SideInfo {
    pub name: String,
    #[serde(rename = "snap-id", default)]
    pub snap_id: String,
    #[serde(default)]
    pub revision: i64,
    #[serde(default)]
    pub developer: String,
}

/// Work order carried by the first task of an operation; the following
/// tasks reference it through `snap-setup-task`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapSetup {
    pub name: String,
    #[serde(default)]
    pub channel: String,
    /// Requested revision; 0 means "whatever the store resolves"
    #[serde(default)]
    pub revision: i64,
    #[serde(default)]
    pub flags: Flags,
    #[serde(rename = "snap-id", default)]
    pub snap_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub developer: String,
    #[serde(rename = "snap-path", default, skip_serializing_if = "Option::is_none")]
    pub snap_path: Option<PathBuf>,
    #[serde(default)]
    pub sideloaded: bool,
}

/// All installed snaps
pub fn all(st: &State) -> BTreeMap<String, SnapState> {
    st.get(SNAPS_PATH).unwrap_or_default()
}

/// State of one installed snap
pub fn get(st: &State, name: &str) -> Result<SnapState> {
    all(st)
        .remove(name)
        .ok_or_else(|| Error::NoState(format!("snaps.{}", name)))
}

/// Write one snap's state back
pub fn set(st: &mut State, name: &str, snap_state: &SnapState) {
    let mut snaps = all(st);
    snaps.insert(name.to_string(), snap_state.clone());
    st.set(SNAPS_PATH, snaps);
}

/// Remove one snap's state entry
pub fn remove_state(st: &mut State, name: &str) {
    let mut snaps = all(st);
    snaps.remove(name);
    st.set(SNAPS_PATH, snaps);
}

fn chain(st: &mut State, specs: &[(&str, String)], setup: &SnapSetup) -> Result<TaskSet> {
    let mut all_ids = Vec::new();
    let mut prev: Option<TaskSet> = None;
    for (i, (kind, summary)) in specs.iter().enumerate() {
        let id = st.new_task(kind, summary);
        if i == 0 {
            if let Some(task) = st.task_mut(&id) {
                task.set("snap-setup", setup);
            }
        } else if let Some(task) = st.task_mut(&id) {
            task.set("snap-setup-task", &all_ids[0]);
        }
        let ts = TaskSet::new(vec![id.clone()]);
        if let Some(p) = &prev {
            st.wait_all(&ts, p);
        }
        prev = Some(ts);
        all_ids.push(id);
    }
    Ok(TaskSet::new(all_ids))
}

/// Build the install task chain for one snap
pub fn install(
    st: &mut State,
    name: &str,
    channel: &str,
    revision: Option<i64>,
    flags: Flags,
) -> Result<TaskSet> {
    if get(st, name).is_ok() {
        return Err(Error::Conflict(format!(
            "snap {:?} is already installed",
            name
        )));
    }
    let setup = SnapSetup {
        name: name.to_string(),
        channel: channel.to_string(),
        revision: revision.unwrap_or(0),
        flags,
        ..Default::default()
    };
    chain(
        st,
        &[
            ("prepare-snap", format!("Prepare snap {:?}", name)),
            ("download-snap", format!("Download snap {:?}", name)),
            ("mount-snap", format!("Mount snap {:?}", name)),
            (
                "link-snap",
                format!("Make snap {:?} available to the system", name),
            ),
        ],
        &setup,
    )
}

/// Build the refresh task chain for one installed snap
pub fn update(
    st: &mut State,
    name: &str,
    channel: &str,
    revision: Option<i64>,
    flags: Flags,
) -> Result<TaskSet> {
    let current = get(st, name)?;
    let channel = if channel.is_empty() {
        current.channel.clone()
    } else {
        channel.to_string()
    };
    let setup = SnapSetup {
        name: name.to_string(),
        channel,
        revision: revision.unwrap_or(0),
        flags,
        snap_id: current.snap_id.clone(),
        ..Default::default()
    };
    chain(
        st,
        &[
            ("prepare-snap", format!("Prepare snap {:?}", name)),
            ("download-snap", format!("Download snap {:?}", name)),
            ("mount-snap", format!("Mount snap {:?}", name)),
            (
                "link-snap",
                format!("Make snap {:?} available to the system", name),
            ),
        ],
        &setup,
    )
}

/// Build the remove task chain
pub fn remove(st: &mut State, name: &str, revision: Option<i64>) -> Result<TaskSet> {
    let current = get(st, name)?;
    if let Some(rev) = revision {
        if rev != current.revision {
            return Err(Error::NotFound(format!(
                "revision {} of snap {:?} is not installed",
                rev, name
            )));
        }
    }
    let setup = SnapSetup {
        name: name.to_string(),
        revision: current.revision,
        ..Default::default()
    };
    chain(
        st,
        &[
            (
                "unlink-snap",
                format!("Make snap {:?} unavailable to the system", name),
            ),
            (
                "discard-snap",
                format!("Remove snap {:?} from the system", name),
            ),
        ],
        &setup,
    )
}

/// Build the revert task
pub fn revert(st: &mut State, name: &str, flags: Flags) -> Result<TaskSet> {
    let current = get(st, name)?;
    if current.prev_revision.is_none() {
        return Err(Error::Conflict(format!(
            "no revision of snap {:?} to revert to",
            name
        )));
    }
    let setup = SnapSetup {
        name: name.to_string(),
        flags,
        ..Default::default()
    };
    chain(
        st,
        &[(
            "revert-snap",
            format!("Revert snap {:?} to its previous revision", name),
        )],
        &setup,
    )
}

/// Build the enable task
pub fn enable(st: &mut State, name: &str) -> Result<TaskSet> {
    let current = get(st, name)?;
    if current.active {
        return Err(Error::Conflict(format!(
            "snap {:?} is already enabled",
            name
        )));
    }
    let setup = SnapSetup {
        name: name.to_string(),
        ..Default::default()
    };
    chain(st, &[("enable-snap", format!("Enable snap {:?}", name))], &setup)
}

/// Build the disable task
pub fn disable(st: &mut State, name: &str) -> Result<TaskSet> {
    let current = get(st, name)?;
    if !current.active {
        return Err(Error::Conflict(format!(
            "snap {:?} is already disabled",
            name
        )));
    }
    let setup = SnapSetup {
        name: name.to_string(),
        ..Default::default()
    };
    chain(
        st,
        &[("disable-snap", format!("Disable snap {:?}", name))],
        &setup,
    )
}

/// Build the task chain installing a local snap file
pub fn install_path(
    st: &mut State,
    side_info: &SideInfo,
    path: &Path,
    flags: Flags,
) -> Result<TaskSet> {
    let setup = SnapSetup {
        name: side_info.name.clone(),
        revision: side_info.revision,
        flags,
        snap_id: side_info.snap_id.clone(),
        developer: side_info.developer.clone(),
        snap_path: Some(path.to_path_buf()),
        sideloaded: true,
        ..Default::default()
    };
    chain(
        st,
        &[
            ("mount-snap", format!("Mount snap {:?}", side_info.name)),
            (
                "link-snap",
                format!("Make snap {:?} available to the system", side_info.name),
            ),
        ],
        &setup,
    )
}

/// Build the task chain for trying a snap directory
pub fn try_path(st: &mut State, name: &str, dir: &Path, flags: Flags) -> Result<TaskSet> {
    let setup = SnapSetup {
        name: name.to_string(),
        flags,
        snap_path: Some(dir.to_path_buf()),
        sideloaded: true,
        ..Default::default()
    };
    chain(
        st,
        &[
            ("mount-snap", format!("Mount snap {:?}", name)),
            (
                "link-snap",
                format!("Make snap {:?} available to the system", name),
            ),
        ],
        &setup,
    )
}

/// Install several snaps; per-snap options are not accepted here
pub fn install_many(st: &mut State, names: &[String]) -> Result<(Vec<String>, Vec<TaskSet>)> {
    let mut installed = Vec::new();
    let mut tasksets = Vec::new();
    for name in names {
        let ts = install(st, name, "stable", None, Flags::default())?;
        installed.push(name.clone());
        tasksets.push(ts);
    }
    Ok((installed, tasksets))
}

/// Refresh several snaps, or every installed snap when `names` is empty
pub fn update_many(st: &mut State, names: &[String]) -> Result<(Vec<String>, Vec<TaskSet>)> {
    let targets: Vec<String> = if names.is_empty() {
        all(st).keys().cloned().collect()
    } else {
        names.to_vec()
    };
    let mut updated = Vec::new();
    let mut tasksets = Vec::new();
    for name in &targets {
        if names.is_empty() && get(st, name).is_err() {
            continue;
        }
        let ts = update(st, name, "", None, Flags::default())?;
        updated.push(name.clone());
        tasksets.push(ts);
    }
    Ok((updated, tasksets))
}

/// Remove several snaps
pub fn remove_many(st: &mut State, names: &[String]) -> Result<(Vec<String>, Vec<TaskSet>)> {
    let mut removed = Vec::new();
    let mut tasksets = Vec::new();
    for name in names {
        let ts = remove(st, name, None)?;
        removed.push(name.clone());
        tasksets.push(ts);
    }
    Ok((removed, tasksets))
}

/// Prepend a base-snap install unless the base is the target or already
/// present; the caller's task-set waits on it.
pub fn with_ensure_base<F>(st: &mut State, target: &str, build: F) -> Result<Vec<TaskSet>>
where
    F: FnOnce(&mut State) -> Result<TaskSet>,
{
    let base_ts = if target != BASE_SNAP && get(st, BASE_SNAP).is_err() {
        Some(install(st, BASE_SNAP, "stable", None, Flags::default())?)
    } else {
        None
    };

    let ts = build(st)?;

    match base_ts {
        Some(base) => {
            st.wait_all(&ts, &base);
            Ok(vec![base, ts])
        }
        None => Ok(vec![ts]),
    }
}

/// Derive a snap file's identity from the assertion database: its digest
/// must have a snap-revision assertion, whose snap-id must have a
/// snap-declaration.
pub fn derive_side_info(path: &Path, db: &crate::asserts::Database) -> Result<SideInfo> {
    let content = std::fs::read(path)?;
    let digest = Sha256::digest(&content);
    let mut sha256 = String::with_capacity(64);
    for byte in digest {
        sha256.push_str(&format!("{:02x}", byte));
    }

    let revision = db.find("snap-revision", &[("snap-sha256", sha256.as_str())])?;
    let snap_id = revision.header_str("snap-id").unwrap_or_default().to_string();
    let declarations = db.find_many("snap-declaration", &[("snap-id", snap_id.as_str())])?;

    Ok(SideInfo {
        name: declarations[0]
            .header_str("snap-name")
            .unwrap_or_default()
            .to_string(),
        snap_id,
        revision: revision
            .header_str("snap-revision")
            .and_then(|r| r.parse().ok())
            .unwrap_or(0),
        developer: revision
            .header_str("developer-id")
            .unwrap_or_default()
            .to_string(),
    })
}

/// Last-resort identity for an unasserted snap file: the file stem up to
/// the first underscore. Only reachable behind the dangerous/devmode
/// sideload flags.
pub fn unsafe_read_side_info(path: &Path) -> Result<SideInfo> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::IoError(format!("cannot read snap file name from {:?}", path)))?;
    let name = stem.split('_').next().unwrap_or(stem).to_string();
    if name.is_empty() {
        return Err(Error::IoError(format!(
            "cannot derive snap name from {:?}",
            path
        )));
    }
    Ok(SideInfo {
        name,
        ..Default::default()
    })
}

/// Installed (name, revision) pairs, as the refresh lookup wants them
pub fn installed_revisions(st: &State) -> Vec<(String, i64)> {
    all(st)
        .into_iter()
        .map(|(name, snap)| (name, snap.revision))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed(st: &mut State, name: &str, revision: i64, active: bool) {
        set(
            st,
            name,
            &SnapState {
                snap_id: format!("{}-id", name),
                channel: "stable".to_string(),
                revision,
                version: "1.0".to_string(),
                active,
                ..Default::default()
            },
        );
    }

    #[test]
    fn test_mode_flags() {
        assert_eq!(
            mode_flags(true, false, false).unwrap(),
            Flags {
                devmode: true,
                jailmode: false
            }
        );
        let err = mode_flags(true, true, false).unwrap_err();
        assert!(err.to_string().contains("devmode and jailmode"));

        let err = mode_flags(false, true, true).unwrap_err();
        assert!(err.to_string().contains("cannot honour the jailmode flag"));

        // force-devmode systems implicitly get devmode
        assert!(mode_flags(false, false, true).unwrap().devmode);
    }

    #[test]
    fn test_install_builds_chain() {
        let mut st = State::default();
        let ts = install(&mut st, "foo", "stable", None, Flags::default()).unwrap();
        assert_eq!(ts.ids().len(), 4);

        let kinds: Vec<String> = ts
            .ids()
            .iter()
            .map(|id| st.task(id).unwrap().kind.clone())
            .collect();
        assert_eq!(
            kinds,
            vec!["prepare-snap", "download-snap", "mount-snap", "link-snap"]
        );

        // each task waits on its predecessor
        let download = st.task(&ts.ids()[1]).unwrap();
        assert_eq!(download.wait_tasks, vec![ts.ids()[0].clone()]);

        // only the first task carries the full setup
        let setup: SnapSetup = st.task(&ts.ids()[0]).unwrap().get("snap-setup").unwrap();
        assert_eq!(setup.name, "foo");
        let backref: String = st.task(&ts.ids()[3]).unwrap().get("snap-setup-task").unwrap();
        assert_eq!(backref, ts.ids()[0]);
    }

    #[test]
    fn test_install_rejects_installed() {
        let mut st = State::default();
        installed(&mut st, "foo", 7, true);
        let err = install(&mut st, "foo", "stable", None, Flags::default()).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_remove_requires_installed() {
        let mut st = State::default();
        assert!(matches!(
            remove(&mut st, "ghost", None),
            Err(Error::NoState(_))
        ));

        installed(&mut st, "foo", 7, true);
        let ts = remove(&mut st, "foo", None).unwrap();
        assert_eq!(ts.ids().len(), 2);
    }

    #[test]
    fn test_revert_needs_previous_revision() {
        let mut st = State::default();
        installed(&mut st, "foo", 7, true);
        assert!(matches!(
            revert(&mut st, "foo", Flags::default()),
            Err(Error::Conflict(_))
        ));

        let mut snap = get(&st, "foo").unwrap();
        snap.prev_revision = Some(6);
        set(&mut st, "foo", &snap);
        assert!(revert(&mut st, "foo", Flags::default()).is_ok());
    }

    #[test]
    fn test_enable_disable_guards() {
        let mut st = State::default();
        installed(&mut st, "foo", 7, true);
        assert!(matches!(enable(&mut st, "foo"), Err(Error::Conflict(_))));
        assert!(disable(&mut st, "foo").is_ok());

        installed(&mut st, "bar", 3, false);
        assert!(matches!(disable(&mut st, "bar"), Err(Error::Conflict(_))));
        assert!(enable(&mut st, "bar").is_ok());
    }

    #[test]
    fn test_ensure_base_prepended() {
        let mut st = State::default();
        let tsets = with_ensure_base(&mut st, "foo", |st| {
            install(st, "foo", "stable", None, Flags::default())
        })
        .unwrap();
        assert_eq!(tsets.len(), 2);

        // the user's first task waits on every base task
        let user_first = st.task(&tsets[1].ids()[0]).unwrap();
        for base_id in tsets[0].ids() {
            assert!(user_first.wait_tasks.contains(base_id));
        }

        // base present: no bootstrap
        let mut st2 = State::default();
        installed(&mut st2, BASE_SNAP, 1, true);
        let tsets = with_ensure_base(&mut st2, "foo", |st| {
            install(st, "foo", "stable", None, Flags::default())
        })
        .unwrap();
        assert_eq!(tsets.len(), 1);

        // installing the base itself: no bootstrap either
        let mut st3 = State::default();
        let tsets = with_ensure_base(&mut st3, BASE_SNAP, |st| {
            install(st, BASE_SNAP, "stable", None, Flags::default())
        })
        .unwrap();
        assert_eq!(tsets.len(), 1);
    }

    #[test]
    fn test_update_many_skips_nothing_explicit() {
        let mut st = State::default();
        installed(&mut st, "foo", 7, true);
        installed(&mut st, "bar", 3, true);

        let (updated, tsets) = update_many(&mut st, &[]).unwrap();
        assert_eq!(updated.len(), 2);
        assert_eq!(tsets.len(), 2);

        let err = update_many(&mut st, &["ghost".to_string()]).unwrap_err();
        assert!(matches!(err, Error::NoState(_)));
    }

    #[test]
    fn test_unsafe_read_side_info() {
        let info = unsafe_read_side_info(Path::new("/tmp/foo_7.snap")).unwrap();
        assert_eq!(info.name, "foo");
        assert_eq!(info.revision, 0);
    }
}
