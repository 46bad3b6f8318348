// src/hookstate.rs

//! Hook helper contract
//!
//! Packages call back into the daemon through `/v2/snapctl` while one of
//! their hooks runs. The daemon validates the request and hands the
//! context id and arguments to this trait; interpreting the command is the
//! hook subsystem's business, not ours.

use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Output of a snapctl invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookOutput {
    pub stdout: String,
    pub stderr: String,
}

/// The hook execution surface the daemon relies on
pub trait HookRunner: Send + Sync {
    fn run(&self, context_id: &str, args: &[String]) -> Result<HookOutput, String>;
}

/// Default runner for daemons without a hook subsystem wired up
pub struct NullHookRunner;

impl HookRunner for NullHookRunner {
    fn run(&self, context_id: &str, _args: &[String]) -> Result<HookOutput, String> {
        Err(format!("no hook context {:?}", context_id))
    }
}

/// Test double: canned replies per context id, with call recording
#[derive(Default)]
pub struct MemoryHookRunner {
    replies: Mutex<BTreeMap<String, HookOutput>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl MemoryHookRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_context(&self, context_id: &str, reply: HookOutput) {
        self.replies.lock().insert(context_id.to_string(), reply);
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().clone()
    }
}

impl HookRunner for MemoryHookRunner {
    fn run(&self, context_id: &str, args: &[String]) -> Result<HookOutput, String> {
        self.calls
            .lock()
            .push((context_id.to_string(), args.to_vec()));
        self.replies
            .lock()
            .get(context_id)
            .cloned()
            .ok_or_else(|| format!("no hook context {:?}", context_id))
    }
}
