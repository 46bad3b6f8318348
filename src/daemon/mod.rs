// src/daemon/mod.rs

//! snapd daemon - REST API for snap operations
//!
//! The daemon owns the state store, the ensure loop and the assertion
//! database, and serves the REST API over a unix socket. Requests carry
//! peer credentials read off the socket; long-running work is returned as
//! a change the client polls.
//!
//! ```text
//! client                                 snapd
//!   │                                      │
//!   ├─ POST /v2/snaps/foo ────────────────►│ builds task-sets under
//!   │                                      │ the state lock
//!   │◄──── 202 {"change":"42"} ────────────┤
//!   │                                      │ ensure loop drives tasks
//!   ├─ GET /v2/changes/42 ────────────────►│
//!   │◄──── {"status":"Done","ready":true} ─┤
//! ```

pub mod api;
pub mod auth;
pub mod events;
pub mod response;
pub mod ucrednet;

pub use api::{router, SharedDaemon};
pub use auth::{AccessFlags, UserState};
pub use events::Hub;
pub use ucrednet::{RemoteAddr, Ucred};

use crate::hookstate::{HookRunner, NullHookRunner};
use crate::osutil::{SystemUserAdder, UserAdder};
use crate::state::{StateStore, TaskRunner};
use crate::store::{OfflineStore, Store};
use crate::{configstate, ifacestate, snapstate, Result};
use axum::Extension;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path of the unix socket the API listens on
    pub socket_path: PathBuf,
    /// Socket file mode
    pub socket_mode: u32,
    /// Optional group ownership for the socket
    pub socket_group: Option<String>,
    /// Socket path that identifies hook-helper callers (snap-ok routes)
    pub snap_socket_path: String,
    /// Persisted state document; `None` keeps state in memory
    pub state_path: Option<PathBuf>,
    /// Directory snaps are mounted under
    pub snap_mount_dir: PathBuf,
    /// Where sideloaded uploads are spooled
    pub sideload_dir: Option<PathBuf>,
    /// Platform series the daemon reports and validates against
    pub series: String,
    pub os_release_id: String,
    pub os_release_version_id: String,
    pub on_classic: bool,
    /// Whether this platform can only run snaps in devmode
    pub force_devmode: bool,
    /// Store id advertised in system-info
    pub store_id: Option<String>,
    /// Periodic ensure interval
    pub poll_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/snapd/snapd.sock"),
            socket_mode: 0o666,
            socket_group: None,
            snap_socket_path: "/run/snapd/snapd-snap.sock".to_string(),
            state_path: Some(PathBuf::from("/var/lib/snapd/state.json")),
            snap_mount_dir: PathBuf::from("/snap"),
            sideload_dir: None,
            series: "16".to_string(),
            os_release_id: "generic".to_string(),
            os_release_version_id: "1".to_string(),
            on_classic: true,
            force_devmode: false,
            store_id: None,
            poll_interval: Duration::from_secs(30),
        }
    }
}

impl DaemonConfig {
    pub fn with_socket_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_state_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.state_path = Some(path.into());
        self
    }

    /// Keep all state in memory; used by tests
    pub fn in_memory(mut self) -> Self {
        self.state_path = None;
        self
    }

    pub fn with_snap_mount_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.snap_mount_dir = dir.into();
        self
    }

    pub fn with_store_id(mut self, id: &str) -> Self {
        self.store_id = Some(id.to_string());
        self
    }

    pub fn with_force_devmode(mut self, force: bool) -> Self {
        self.force_devmode = force;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// The assembled daemon
pub struct Daemon {
    pub version: &'static str,
    pub config: DaemonConfig,
    pub store: StateStore,
    pub runner: Arc<TaskRunner>,
    pub hub: Hub,
    pub snap_store: Arc<dyn Store>,
    pub user_adder: Arc<dyn UserAdder>,
    pub hook_runner: Arc<dyn HookRunner>,
}

impl Daemon {
    /// Assemble a daemon with the default collaborators
    pub fn new(config: DaemonConfig) -> Result<Arc<Self>> {
        Self::with_collaborators(
            config,
            Arc::new(OfflineStore),
            Arc::new(SystemUserAdder),
            Arc::new(NullHookRunner),
        )
    }

    /// Assemble a daemon with explicit collaborators
    pub fn with_collaborators(
        config: DaemonConfig,
        snap_store: Arc<dyn Store>,
        user_adder: Arc<dyn UserAdder>,
        hook_runner: Arc<dyn HookRunner>,
    ) -> Result<Arc<Self>> {
        let store = StateStore::open(config.state_path.clone())?;
        let runner = Arc::new(
            TaskRunner::new(store.clone()).with_poll_interval(config.poll_interval),
        );
        let hub = Hub::new();
        runner.set_observer(hub.observer());

        snapstate::handlers::register(&runner, snap_store.clone());
        ifacestate::register(&runner);
        configstate::register(&runner);

        // Tasks interrupted by a previous shutdown are re-examined.
        runner.recover();

        Ok(Arc::new(Self {
            version: env!("CARGO_PKG_VERSION"),
            config,
            store,
            runner,
            hub,
            snap_store,
            user_adder,
            hook_runner,
        }))
    }

    /// Seed trust-root assertions into the database
    pub fn trust(&self, assertions: Vec<crate::asserts::Assertion>) {
        let mut st = self.store.lock();
        st.assert_db = crate::asserts::Database::with_trusted(assertions);
    }

    /// Run until a shutdown signal arrives
    pub async fn run(self: Arc<Self>) -> Result<()> {
        use hyper::server::conn::http1;
        use hyper_util::rt::TokioIo;
        use hyper_util::service::TowerToHyperService;

        tracing::info!("starting snapd version {}", self.version);

        let listener = self.bind_socket()?;
        let socket_path = self.config.socket_path.display().to_string();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner_task = tokio::spawn(self.runner.clone().run(shutdown_rx));

        let app = api::router(self.clone());

        tracing::info!("daemon ready, accepting connections");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let remote = ucrednet::peer_credentials(&stream)
                                .map(|(pid, uid)| ucrednet::encode(pid, uid, &socket_path))
                                .unwrap_or_default();
                            let svc = app.clone().layer(Extension(RemoteAddr(remote)));
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = TowerToHyperService::new(svc);
                                if let Err(err) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    tracing::warn!("error serving connection: {:?}", err);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received shutdown signal");
                    break;
                }
            }
        }

        // The ensure loop finishes in-flight handlers before exiting.
        let _ = shutdown_tx.send(true);
        let _ = runner_task.await;

        if self.config.socket_path.exists() {
            let _ = std::fs::remove_file(&self.config.socket_path);
        }
        tracing::info!("daemon shut down");
        Ok(())
    }

    fn bind_socket(&self) -> Result<tokio::net::UnixListener> {
        let path = &self.config.socket_path;
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = tokio::net::UnixListener::bind(path).map_err(|e| {
            crate::Error::IoError(format!("failed to bind unix socket at {:?}: {}", path, e))
        })?;

        let perms = std::fs::Permissions::from_mode(self.config.socket_mode);
        std::fs::set_permissions(path, perms)?;

        if let Some(group) = &self.config.socket_group {
            set_socket_group(path, group)?;
        }

        tracing::info!(
            "listening on unix socket {:?} (mode {:o})",
            path,
            self.config.socket_mode
        );
        Ok(listener)
    }
}

/// Set group ownership on the socket file
fn set_socket_group(path: &std::path::Path, group_name: &str) -> Result<()> {
    use nix::unistd::{chown, Gid};
    use std::ffi::CString;

    let group_cstr = CString::new(group_name)
        .map_err(|_| crate::Error::ConfigError(format!("invalid group name: {}", group_name)))?;

    let gid = unsafe {
        let grp = libc::getgrnam(group_cstr.as_ptr());
        if grp.is_null() {
            tracing::warn!("group {:?} not found, leaving socket ownership alone", group_name);
            return Ok(());
        }
        (*grp).gr_gid
    };

    chown(path, None, Some(Gid::from_raw(gid)))
        .map_err(|e| crate::Error::IoError(format!("failed to set socket group: {}", e)))?;
    Ok(())
}
