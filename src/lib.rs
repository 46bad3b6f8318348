// src/lib.rs

//! snapd - control-plane daemon for the snap package platform
//!
//! The daemon installs, upgrades, removes and wires together snaps on a
//! host. Clients talk to it over a unix socket with a REST API; mutating
//! requests become changes made of dependency-ordered tasks that a single
//! ensure loop drives to completion.
//!
//! # Architecture
//!
//! - State-first: one locked, JSON-persisted tree holds everything
//! - Changes: durable units of work, derived from their tasks
//! - Assertions: a content-addressed store of signed statements
//! - Narrow contracts: store, user provisioning and hook execution are
//!   consumed through traits

pub mod asserts;
pub mod configstate;
pub mod daemon;
mod error;
pub mod hookstate;
pub mod ifacestate;
pub mod osutil;
pub mod snapstate;
pub mod state;
pub mod store;

pub use asserts::{Assertion, AttributeConstraints, Batch, Database, KeyPair, PublicKey};
pub use daemon::{Daemon, DaemonConfig};
pub use error::{Error, Result};
pub use state::{Change, State, StateStore, Status, Task, TaskCtx, TaskError, TaskRunner, TaskSet};
