// tests/common/mod.rs

//! Shared fixtures for the daemon integration tests.

#![allow(dead_code)]

use axum::Router;
use serde_json::Value;
use snapd::daemon::{ucrednet, Daemon, DaemonConfig, RemoteAddr};
use snapd::hookstate::MemoryHookRunner;
use snapd::osutil::RecordingUserAdder;
use snapd::store::{MemoryStore, RemoteSnap};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

/// A daemon wired with in-process doubles and a temp state file.
///
/// Keep the TempDir alive to prevent cleanup.
pub struct TestDaemon {
    pub daemon: Arc<Daemon>,
    pub app: Router,
    pub snap_store: Arc<MemoryStore>,
    pub user_adder: Arc<RecordingUserAdder>,
    pub hooks: Arc<MemoryHookRunner>,
    pub dir: TempDir,
}

/// A store-side snap record
pub fn remote_snap(name: &str, revision: i64) -> RemoteSnap {
    RemoteSnap {
        name: name.to_string(),
        snap_id: format!("{}-id", name),
        version: "1.0".to_string(),
        revision,
        channel: "stable".to_string(),
        developer: "dev".to_string(),
        summary: format!("The {} snap", name),
        description: String::new(),
        prices: BTreeMap::new(),
    }
}

/// Daemon with "foo" available in the store and one login account
pub fn setup() -> TestDaemon {
    let dir = TempDir::new().unwrap();

    let mut config = DaemonConfig::default()
        .with_state_path(dir.path().join("state.json"))
        .with_snap_mount_dir(dir.path().join("snap"));
    config.sideload_dir = Some(dir.path().to_path_buf());

    let snap_store = Arc::new(MemoryStore::new());
    snap_store.add_snap(remote_snap("foo", 7));
    snap_store.add_snap(remote_snap("core", 1));
    snap_store.add_account("user@example.com", "secret", None);
    snap_store.set_download_dir(dir.path().to_path_buf());
    snap_store.set_payment_methods(vec!["credit-card".to_string()]);

    let user_adder = Arc::new(RecordingUserAdder::new());
    let hooks = Arc::new(MemoryHookRunner::new());

    let daemon = Daemon::with_collaborators(
        config,
        snap_store.clone(),
        user_adder.clone(),
        hooks.clone(),
    )
    .unwrap();
    let app = snapd::daemon::router(daemon.clone());

    TestDaemon {
        daemon,
        app,
        snap_store,
        user_adder,
        hooks,
        dir,
    }
}

/// How a test request reaches the daemon
pub struct Client {
    pub uid: Option<u32>,
    pub socket: String,
    pub auth: Option<String>,
}

impl Client {
    pub fn root() -> Self {
        Self {
            uid: Some(0),
            socket: "/run/snapd/snapd.sock".to_string(),
            auth: None,
        }
    }

    pub fn user(uid: u32) -> Self {
        Self {
            uid: Some(uid),
            socket: "/run/snapd/snapd.sock".to_string(),
            auth: None,
        }
    }

    /// A connection with no usable peer credentials
    pub fn anonymous() -> Self {
        Self {
            uid: None,
            socket: String::new(),
            auth: None,
        }
    }

    /// A snap calling through the hook helper socket
    pub fn snap_hook(uid: u32) -> Self {
        Self {
            uid: Some(uid),
            socket: "/run/snapd/snapd-snap.sock".to_string(),
            auth: None,
        }
    }

    pub fn with_macaroon(mut self, macaroon: &str, discharges: &[String]) -> Self {
        let mut header = format!("Macaroon root=\"{}\"", macaroon);
        for discharge in discharges {
            header.push_str(&format!(", discharge=\"{}\"", discharge));
        }
        self.auth = Some(header);
        self
    }
}

impl TestDaemon {
    /// Send one request through the router, returning status and body
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
        client: &Client,
    ) -> (u16, Value) {
        let (content_type, bytes) = match &body {
            Some(value) => ("application/json", value.to_string().into_bytes()),
            None => ("application/json", Vec::new()),
        };
        self.raw_request(method, path, content_type, bytes, client)
            .await
    }

    /// Send a request with full control over content type and body
    pub async fn raw_request(
        &self,
        method: &str,
        path: &str,
        content_type: &str,
        body: Vec<u8>,
        client: &Client,
    ) -> (u16, Value) {
        let mut builder = axum::http::Request::builder()
            .method(method)
            .uri(path)
            .header(axum::http::header::CONTENT_TYPE, content_type);
        if let Some(auth) = &client.auth {
            builder = builder.header(axum::http::header::AUTHORIZATION, auth);
        }
        let mut request = builder.body(axum::body::Body::from(body)).unwrap();
        if let Some(uid) = client.uid {
            request
                .extensions_mut()
                .insert(RemoteAddr(ucrednet::encode(100, uid, &client.socket)));
        }

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status().as_u16();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::String(
                String::from_utf8_lossy(&bytes).to_string(),
            ))
        };
        (status, value)
    }

    /// Run the ensure loop to its fixed point
    pub async fn settle(&self) {
        while self.daemon.runner.ensure().await {}
    }

    /// Log in and return an authenticated client
    pub async fn login(&self, uid: u32, username: &str, password: &str) -> Client {
        let (status, body) = self
            .request(
                "POST",
                "/v2/login",
                Some(serde_json::json!({"username": username, "password": password})),
                &Client::root(),
            )
            .await;
        assert_eq!(status, 200, "login failed: {}", body);
        let macaroon = body["result"]["macaroon"].as_str().unwrap().to_string();
        let discharges: Vec<String> = body["result"]["discharges"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d.as_str().unwrap().to_string())
            .collect();
        Client::user(uid).with_macaroon(&macaroon, &discharges)
    }
}
