// src/osutil.rs

//! Host user provisioning contract
//!
//! `create-user` provisions a login account on the host. The daemon only
//! decides usernames and options; the actual account creation goes through
//! this trait. `SystemUserAdder` shells out to useradd; `RecordingUserAdder`
//! captures calls for tests.

use parking_lot::Mutex;
use std::process::Command;

/// Options for creating a host user
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddUserOptions {
    pub ssh_keys: Vec<String>,
    /// Gecos field, `email,identifier` verbatim
    pub gecos: String,
    pub sudoer: bool,
    /// Crypted password from a system-user assertion, if any
    pub password: Option<String>,
    /// Create under the extrausers database (non-classic systems)
    pub extra_users: bool,
}

/// The provisioning surface the daemon relies on
pub trait UserAdder: Send + Sync {
    fn add_user(&self, username: &str, opts: &AddUserOptions) -> Result<(), String>;
}

/// Provisions real accounts via useradd
pub struct SystemUserAdder;

impl UserAdder for SystemUserAdder {
    fn add_user(&self, username: &str, opts: &AddUserOptions) -> Result<(), String> {
        let mut cmd = Command::new("useradd");
        cmd.arg("--create-home").arg("--comment").arg(&opts.gecos);
        if opts.extra_users {
            cmd.arg("--extrausers");
        }
        if let Some(password) = &opts.password {
            cmd.arg("--password").arg(password);
        }
        if opts.sudoer {
            cmd.arg("--groups").arg("sudo");
        }
        cmd.arg(username);

        let output = cmd
            .output()
            .map_err(|e| format!("cannot run useradd: {}", e))?;
        if !output.status.success() {
            return Err(format!(
                "useradd failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        tracing::info!(user = username, "created host user");
        Ok(())
    }
}

/// Records provisioning calls instead of touching the host
#[derive(Default)]
pub struct RecordingUserAdder {
    calls: Mutex<Vec<(String, AddUserOptions)>>,
}

impl RecordingUserAdder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, AddUserOptions)> {
        self.calls.lock().clone()
    }
}

impl UserAdder for RecordingUserAdder {
    fn add_user(&self, username: &str, opts: &AddUserOptions) -> Result<(), String> {
        self.calls.lock().push((username.to_string(), opts.clone()));
        Ok(())
    }
}
