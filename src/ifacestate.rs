// src/ifacestate.rs

//! Interface connections
//!
//! Plugs and slots declared by installed snaps live in the state tree;
//! connect and disconnect are ordinary changes with a single task each.
//! The connect handler consults the assertion database: a snap-declaration
//! may constrain which slot attributes a plug is allowed to connect to.

use crate::asserts::AttributeConstraints;
use crate::state::{State, TaskCtx, TaskError, TaskRunner, TaskSet};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const IFACES_PATH: &str = "ifaces";
const CONNS_PATH: &str = "conns";

/// A plug as declared by a snap
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlugInfo {
    pub snap: String,
    pub plug: String,
    pub interface: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, Value>,
}

/// A slot as declared by a snap
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlotInfo {
    pub snap: String,
    pub slot: String,
    pub interface: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Registry {
    #[serde(default)]
    plugs: Vec<PlugInfo>,
    #[serde(default)]
    slots: Vec<SlotInfo>,
}

/// An established connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnState {
    pub interface: String,
}

fn registry(st: &State) -> Registry {
    st.get(IFACES_PATH).unwrap_or_default()
}

fn connections(st: &State) -> BTreeMap<String, ConnState> {
    st.get(CONNS_PATH).unwrap_or_default()
}

fn conn_key(plug_snap: &str, plug: &str, slot_snap: &str, slot: &str) -> String {
    format!("{}:{} {}:{}", plug_snap, plug, slot_snap, slot)
}

/// Declare a plug; replaces any previous declaration of the same name
pub fn add_plug(st: &mut State, plug: PlugInfo) {
    let mut reg = registry(st);
    reg.plugs.retain(|p| !(p.snap == plug.snap && p.plug == plug.plug));
    reg.plugs.push(plug);
    st.set(IFACES_PATH, reg);
}

/// Declare a slot; replaces any previous declaration of the same name
pub fn add_slot(st: &mut State, slot: SlotInfo) {
    let mut reg = registry(st);
    reg.slots.retain(|s| !(s.snap == slot.snap && s.slot == slot.slot));
    reg.slots.push(slot);
    st.set(IFACES_PATH, reg);
}

/// Wire view of a plug, with its current connections
#[derive(Debug, Serialize)]
pub struct PlugJson {
    pub snap: String,
    pub plug: String,
    pub interface: String,
    pub label: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<SlotRef>,
}

/// Wire view of a slot, with its current connections
#[derive(Debug, Serialize)]
pub struct SlotJson {
    pub snap: String,
    pub slot: String,
    pub interface: String,
    pub label: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<PlugRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlotRef {
    pub snap: String,
    pub slot: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlugRef {
    pub snap: String,
    pub plug: String,
}

/// All plugs and slots with their connections, for the interfaces listing
#[derive(Debug, Serialize)]
pub struct Interfaces {
    pub plugs: Vec<PlugJson>,
    pub slots: Vec<SlotJson>,
}

pub fn interfaces(st: &State) -> Interfaces {
    let reg = registry(st);
    let conns = connections(st);

    let plugs = reg
        .plugs
        .iter()
        .map(|p| {
            let connections = conns
                .keys()
                .filter_map(|key| parse_conn_key(key))
                .filter(|(ps, pn, _, _)| ps == &p.snap && pn == &p.plug)
                .map(|(_, _, ss, sn)| SlotRef { snap: ss, slot: sn })
                .collect();
            PlugJson {
                snap: p.snap.clone(),
                plug: p.plug.clone(),
                interface: p.interface.clone(),
                label: p.label.clone(),
                attrs: p.attrs.clone(),
                connections,
            }
        })
        .collect();

    let slots = reg
        .slots
        .iter()
        .map(|s| {
            let connections = conns
                .keys()
                .filter_map(|key| parse_conn_key(key))
                .filter(|(_, _, ss, sn)| ss == &s.snap && sn == &s.slot)
                .map(|(ps, pn, _, _)| PlugRef { snap: ps, plug: pn })
                .collect();
            SlotJson {
                snap: s.snap.clone(),
                slot: s.slot.clone(),
                interface: s.interface.clone(),
                label: s.label.clone(),
                attrs: s.attrs.clone(),
                connections,
            }
        })
        .collect();

    Interfaces { plugs, slots }
}

fn parse_conn_key(key: &str) -> Option<(String, String, String, String)> {
    let (plug_part, slot_part) = key.split_once(' ')?;
    let (ps, pn) = plug_part.split_once(':')?;
    let (ss, sn) = slot_part.split_once(':')?;
    Some((ps.to_string(), pn.to_string(), ss.to_string(), sn.to_string()))
}

fn find_plug<'a>(reg: &'a Registry, snap: &str, plug: &str) -> Result<&'a PlugInfo> {
    reg.plugs
        .iter()
        .find(|p| p.snap == snap && p.plug == plug)
        .ok_or_else(|| Error::NotFound(format!("snap {:?} has no plug {:?}", snap, plug)))
}

fn find_slot<'a>(reg: &'a Registry, snap: &str, slot: &str) -> Result<&'a SlotInfo> {
    reg.slots
        .iter()
        .find(|s| s.snap == snap && s.slot == slot)
        .ok_or_else(|| Error::NotFound(format!("snap {:?} has no slot {:?}", snap, slot)))
}

/// Build the connect task-set
pub fn connect(
    st: &mut State,
    plug_snap: &str,
    plug: &str,
    slot_snap: &str,
    slot: &str,
) -> Result<TaskSet> {
    let reg = registry(st);
    let plug_info = find_plug(&reg, plug_snap, plug)?;
    let slot_info = find_slot(&reg, slot_snap, slot)?;
    if plug_info.interface != slot_info.interface {
        return Err(Error::Conflict(format!(
            "cannot connect {}:{} ({:?} interface) to {}:{} ({:?} interface)",
            plug_snap, plug, plug_info.interface, slot_snap, slot, slot_info.interface
        )));
    }

    let id = st.new_task(
        "connect",
        &format!("Connect {}:{} to {}:{}", plug_snap, plug, slot_snap, slot),
    );
    if let Some(task) = st.task_mut(&id) {
        task.set("plug", PlugRef { snap: plug_snap.to_string(), plug: plug.to_string() });
        task.set("slot", SlotRef { snap: slot_snap.to_string(), slot: slot.to_string() });
    }
    Ok(TaskSet::new(vec![id]))
}

/// Build the disconnect task-set
pub fn disconnect(
    st: &mut State,
    plug_snap: &str,
    plug: &str,
    slot_snap: &str,
    slot: &str,
) -> Result<TaskSet> {
    let key = conn_key(plug_snap, plug, slot_snap, slot);
    if !connections(st).contains_key(&key) {
        return Err(Error::NotFound(format!(
            "cannot disconnect {}:{} from {}:{}, it is not connected",
            plug_snap, plug, slot_snap, slot
        )));
    }

    let id = st.new_task(
        "disconnect",
        &format!("Disconnect {}:{} from {}:{}", plug_snap, plug, slot_snap, slot),
    );
    if let Some(task) = st.task_mut(&id) {
        task.set("plug", PlugRef { snap: plug_snap.to_string(), plug: plug.to_string() });
        task.set("slot", SlotRef { snap: slot_snap.to_string(), slot: slot.to_string() });
    }
    Ok(TaskSet::new(vec![id]))
}

/// Check a connection against the plug snap's declaration constraints.
///
/// A snap-declaration may carry `plugs.<interface>.allow-connection`
/// attribute constraints matched against the slot's attributes.
fn check_declaration(st: &State, plug: &PlugInfo, slot: &SlotInfo) -> Result<()> {
    let declarations = match st
        .assert_db
        .find_many("snap-declaration", &[("snap-name", plug.snap.as_str())])
    {
        Ok(d) => d,
        Err(Error::AssertNotFound) => return Ok(()),
        Err(e) => return Err(e),
    };
    let decl = declarations[0];
    let constraint = decl
        .header("plugs")
        .and_then(|p| p.get(&plug.interface))
        .and_then(|rules| rules.get("allow-connection"));
    if let Some(constraint) = constraint {
        let compiled = AttributeConstraints::compile(constraint)?;
        compiled
            .check(&Value::Object(slot.attrs.clone()))
            .map_err(|e| {
                Error::AssertConsistency(format!(
                    "connection not allowed by plug declaration of snap {:?}: {}",
                    plug.snap, e
                ))
            })?;
    }
    Ok(())
}

fn task_refs(ctx: &TaskCtx) -> std::result::Result<(PlugRef, SlotRef), TaskError> {
    let plug: PlugRef = ctx
        .get("plug")
        .map_err(|e| TaskError::Fail(e.to_string()))?;
    let slot: SlotRef = ctx
        .get("slot")
        .map_err(|e| TaskError::Fail(e.to_string()))?;
    Ok((plug, slot))
}

/// Register the connect/disconnect handlers
pub fn register(runner: &TaskRunner) {
    runner.add_handler(
        "connect",
        |ctx| {
            if ctx.aborted() {
                return Ok(());
            }
            let (plug_ref, slot_ref) = task_refs(ctx)?;
            let mut st = ctx.store().lock();
            let reg = registry(&st);
            let plug = find_plug(&reg, &plug_ref.snap, &plug_ref.plug)
                .map_err(|e| TaskError::Fail(e.to_string()))?
                .clone();
            let slot = find_slot(&reg, &slot_ref.snap, &slot_ref.slot)
                .map_err(|e| TaskError::Fail(e.to_string()))?
                .clone();
            check_declaration(&st, &plug, &slot).map_err(|e| TaskError::Fail(e.to_string()))?;

            let mut conns = connections(&st);
            conns.insert(
                conn_key(&plug.snap, &plug.plug, &slot.snap, &slot.slot),
                ConnState {
                    interface: plug.interface.clone(),
                },
            );
            st.set(CONNS_PATH, conns);
            Ok(())
        },
        Some(|ctx: &TaskCtx| {
            let (plug_ref, slot_ref) = task_refs(ctx)?;
            let mut st = ctx.store().lock();
            let mut conns = connections(&st);
            conns.remove(&conn_key(
                &plug_ref.snap,
                &plug_ref.plug,
                &slot_ref.snap,
                &slot_ref.slot,
            ));
            st.set(CONNS_PATH, conns);
            Ok(())
        }),
    );

    runner.add_handler(
        "disconnect",
        |ctx| {
            if ctx.aborted() {
                return Ok(());
            }
            let (plug_ref, slot_ref) = task_refs(ctx)?;
            let mut st = ctx.store().lock();
            let key = conn_key(&plug_ref.snap, &plug_ref.plug, &slot_ref.snap, &slot_ref.slot);
            let mut conns = connections(&st);
            match conns.remove(&key) {
                Some(old) => {
                    st.set(CONNS_PATH, conns);
                    drop(st);
                    ctx.set("old-conn", old);
                    Ok(())
                }
                None => Ok(()),
            }
        },
        Some(|ctx: &TaskCtx| {
            let (plug_ref, slot_ref) = task_refs(ctx)?;
            let old: Option<ConnState> = ctx.get("old-conn").ok();
            if let Some(old) = old {
                let mut st = ctx.store().lock();
                let mut conns = connections(&st);
                conns.insert(
                    conn_key(&plug_ref.snap, &plug_ref.plug, &slot_ref.snap, &slot_ref.slot),
                    old,
                );
                st.set(CONNS_PATH, conns);
            }
            Ok(())
        }),
    );
}
