// src/daemon/api.rs

//! REST API
//!
//! The route table is fixed at startup: each command declares its path
//! and access flags, and a middleware layer checks peer credentials and
//! macaroons against them before any handler runs. Mutating handlers
//! build task-sets under the state lock, wrap them in a change and return
//! an async envelope; reads answer from state directly.

use super::auth::{self, Access, AccessFlags, UserState};
use super::events::EventStream;
use super::response::*;
use super::ucrednet::{self, RemoteAddr, Ucred};
use super::Daemon;
use crate::asserts::Batch;
use crate::state::{State, Status, TaskSet};
use crate::store::{BuyOptions, Search, StoreError};
use crate::{configstate, ifacestate, snapstate};
use axum::body::Bytes;
use axum::extract::{FromRequest, Multipart, Path, Query, State as AxumState};
use axum::http::{header, HeaderMap, Request};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Router};
use tower_http::catch_panic::CatchPanicLayer;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

pub type SharedDaemon = Arc<Daemon>;

/// Authenticated user attached to the request by the access middleware
#[derive(Clone)]
pub struct AuthUser(pub Option<UserState>);

/// One row of the route table: access flags for reads and for mutations.
/// Unset flags mean root-only.
pub struct Command {
    pub path: &'static str,
    pub read_flags: AccessFlags,
    pub write_flags: AccessFlags,
}

const GUEST: AccessFlags = AccessFlags {
    guest_ok: true,
    user_ok: false,
    snap_ok: false,
};
const USER: AccessFlags = AccessFlags {
    guest_ok: false,
    user_ok: true,
    snap_ok: false,
};
const ROOT: AccessFlags = AccessFlags {
    guest_ok: false,
    user_ok: false,
    snap_ok: false,
};
const SNAP: AccessFlags = AccessFlags {
    guest_ok: false,
    user_ok: false,
    snap_ok: true,
};

const fn cmd(path: &'static str, read_flags: AccessFlags, write_flags: AccessFlags) -> Command {
    Command {
        path,
        read_flags,
        write_flags,
    }
}

/// The fixed route table
pub static COMMANDS: &[Command] = &[
    cmd("/", GUEST, ROOT),
    cmd("/v2/system-info", GUEST, ROOT),
    cmd("/v2/login", ROOT, ROOT),
    cmd("/v2/logout", USER, USER),
    cmd("/v2/icons/:name/icon", USER, ROOT),
    cmd("/v2/find", USER, ROOT),
    cmd("/v2/snaps", USER, ROOT),
    cmd("/v2/snaps/:name", USER, ROOT),
    cmd("/v2/snaps/:name/conf", ROOT, ROOT),
    cmd("/v2/interfaces", USER, ROOT),
    cmd("/v2/assertions", ROOT, ROOT),
    cmd("/v2/assertions/:assert_type", USER, ROOT),
    cmd("/v2/events", ROOT, ROOT),
    cmd("/v2/changes", USER, ROOT),
    cmd("/v2/changes/:id", USER, ROOT),
    cmd("/v2/create-user", ROOT, ROOT),
    cmd("/v2/buy", ROOT, ROOT),
    cmd("/v2/buy/ready", ROOT, ROOT),
    cmd("/v2/buy/methods", ROOT, ROOT),
    cmd("/v2/snapctl", SNAP, SNAP),
];

fn command_for(path: &str) -> Option<&'static Command> {
    COMMANDS.iter().find(|c| c.path == path)
}

/// Build the daemon router
pub fn router(d: SharedDaemon) -> Router {
    Router::new()
        .route("/", get(root).fallback(bad_method))
        .route("/v2/system-info", get(sys_info).fallback(bad_method))
        .route("/v2/login", post(login).fallback(bad_method))
        .route("/v2/logout", post(logout).fallback(bad_method))
        .route("/v2/icons/:name/icon", get(app_icon).fallback(bad_method))
        .route("/v2/find", get(find).fallback(bad_method))
        .route("/v2/snaps", get(snaps_info).post(post_snaps).fallback(bad_method))
        .route("/v2/snaps/:name", get(snap_info).post(post_snap).fallback(bad_method))
        .route(
            "/v2/snaps/:name/conf",
            get(snap_conf).put(set_snap_conf).fallback(bad_method),
        )
        .route(
            "/v2/interfaces",
            get(interfaces).post(change_interfaces).fallback(bad_method),
        )
        .route("/v2/assertions", post(do_assert).fallback(bad_method))
        .route(
            "/v2/assertions/:assert_type",
            get(assert_find_many).fallback(bad_method),
        )
        .route("/v2/events", get(events).fallback(bad_method))
        .route("/v2/changes", get(changes).fallback(bad_method))
        .route(
            "/v2/changes/:id",
            get(change_info).post(abort_change).fallback(bad_method),
        )
        .route("/v2/create-user", post(create_user).fallback(bad_method))
        .route("/v2/buy", post(buy_snap).fallback(bad_method))
        .route("/v2/buy/ready", get(ready_to_buy).fallback(bad_method))
        .route("/v2/buy/methods", get(payment_methods).fallback(bad_method))
        .route("/v2/snapctl", post(run_snapctl).fallback(bad_method))
        .fallback(fallback_not_found)
        .layer(middleware::from_fn_with_state(d.clone(), access_middleware))
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(d)
}

/// A panicking handler answers 500; the daemon itself stays up
fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> axum::response::Response {
    let detail = err
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| err.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "handler panicked".to_string());
    tracing::error!("handler panicked: {}", detail);
    internal_error(detail).into_response()
}

async fn fallback_not_found() -> Response {
    not_found("not found")
}

async fn bad_method() -> Response {
    method_not_allowed()
}

/// Authenticate, authorize, and annotate the request
async fn access_middleware(
    AxumState(d): AxumState<SharedDaemon>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> axum::response::Response {
    let matched = req
        .extensions()
        .get::<axum::extract::MatchedPath>()
        .map(|m| m.as_str().to_string());

    let ucred: Option<Ucred> = req
        .extensions()
        .get::<RemoteAddr>()
        .and_then(|addr| ucrednet::parse(&addr.0));

    let user = {
        let st = d.store.lock();
        auth::user_from_request(&st, req.headers()).ok()
    };

    if let Some(command) = matched.as_deref().and_then(command_for) {
        let method = req.method();
        let flags = if method == axum::http::Method::GET || method == axum::http::Method::HEAD {
            command.read_flags
        } else {
            command.write_flags
        };
        let access = auth::can_access(
            flags,
            ucred.as_ref(),
            user.as_ref(),
            &d.config.snap_socket_path,
        );
        match access {
            Access::Allowed => {}
            Access::Unauthorized => {
                return unauthorized("access denied").into_response();
            }
            Access::Forbidden => {
                return forbidden("access denied").into_response();
            }
        }
    }

    req.extensions_mut().insert(AuthUser(user));
    if let Some(ucred) = ucred {
        req.extensions_mut().insert(ucred);
    }
    next.run(req).await
}

// ---------------------------------------------------------------------------
// Root and system info

async fn root() -> Response {
    sync_response(json!(["TBD"]))
}

async fn sys_info(AxumState(d): AxumState<SharedDaemon>) -> Response {
    let mut result = json!({
        "series": d.config.series,
        "version": d.version,
        "os-release": {
            "id": d.config.os_release_id,
            "version-id": d.config.os_release_version_id,
        },
        "on-classic": d.config.on_classic,
    });
    if let Some(store_id) = &d.config.store_id {
        result["store"] = json!(store_id);
    }
    sync_response(result)
}

// ---------------------------------------------------------------------------
// Login and logout

#[derive(Deserialize, Default)]
#[serde(default)]
struct LoginData {
    username: String,
    password: String,
    otp: String,
}

fn emailish(username: &str) -> bool {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r".@.*\..").expect("static regex"))
        .is_match(username)
}

async fn login(AxumState(d): AxumState<SharedDaemon>, body: Bytes) -> Response {
    let data: LoginData = match serde_json::from_slice(&body) {
        Ok(data) => data,
        Err(e) => {
            return bad_request(format!("cannot decode login data from request body: {}", e))
        }
    };

    // the username needs to look a lot like an email address
    if !emailish(&data.username) {
        return error_response_kind(
            400,
            ErrorKind::InvalidAuthData,
            "please use a valid email address.",
            Some(json!({"email": ["invalid"]})),
        );
    }

    let otp = if data.otp.is_empty() {
        None
    } else {
        Some(data.otp.as_str())
    };
    let (macaroon, discharges) = match d.snap_store.login(&data.username, &data.password, otp) {
        Ok(result) => result,
        Err(StoreError::TwoFactorRequired) => {
            return error_response_kind(
                401,
                ErrorKind::TwoFactorRequired,
                StoreError::TwoFactorRequired.to_string(),
                None,
            )
        }
        Err(StoreError::TwoFactorFailed) => {
            return error_response_kind(
                401,
                ErrorKind::TwoFactorFailed,
                StoreError::TwoFactorFailed.to_string(),
                None,
            )
        }
        Err(StoreError::InvalidAuthData(msg)) => {
            return error_response_kind(400, ErrorKind::InvalidAuthData, msg, None)
        }
        Err(e) => return unauthorized(e.to_string()),
    };

    {
        let mut st = d.store.lock();
        auth::new_user(&mut st, &data.username, &macaroon, discharges.clone());
    }

    sync_response(json!({
        "macaroon": macaroon,
        "discharges": discharges,
    }))
}

async fn logout(
    AxumState(d): AxumState<SharedDaemon>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Response {
    let user = match user {
        Some(user) => user,
        None => return bad_request("not logged in"),
    };
    let mut st = d.store.lock();
    match auth::remove_user(&mut st, user.id) {
        Ok(()) => sync_response(Value::Null),
        Err(e) => internal_error(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Snap listings

fn map_local(name: &str, snap: &snapstate::SnapState) -> Value {
    json!({
        "name": name,
        "snap-id": snap.snap_id,
        "version": snap.version,
        "revision": snap.revision,
        "channel": snap.channel,
        "developer": snap.developer,
        "status": if snap.active { "active" } else { "installed" },
        "devmode": snap.devmode,
        "jailmode": snap.jailmode,
        "type": "app",
        "resource": format!("/v2/snaps/{}", name),
    })
}

fn map_remote(snap: &crate::store::RemoteSnap) -> Value {
    let mut v = json!({
        "name": snap.name,
        "snap-id": snap.snap_id,
        "version": snap.version,
        "revision": snap.revision,
        "channel": snap.channel,
        "developer": snap.developer,
        "summary": snap.summary,
        "description": snap.description,
        "status": "available",
        "type": "app",
        "resource": format!("/v2/snaps/{}", snap.name),
    });
    if !snap.prices.is_empty() {
        v["prices"] = json!(snap.prices);
    }
    v
}

async fn snaps_info(
    AxumState(d): AxumState<SharedDaemon>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    // legacy: ?q= or ?sources=store jumps to find
    if query.contains_key("q")
        || query
            .get("sources")
            .map_or(false, |s| s.contains("store"))
    {
        tracing::debug!("redirecting legacy snap listing to find");
        return find_impl(d, user, &query);
    }

    let st = d.store.lock();
    let results: Vec<Value> = snapstate::all(&st)
        .iter()
        .map(|(name, snap)| map_local(name, snap))
        .collect();
    sync_response_meta(
        results,
        Meta {
            sources: Some(vec!["local".to_string()]),
            suggested_currency: None,
        },
    )
}

async fn snap_info(
    AxumState(d): AxumState<SharedDaemon>,
    Path(name): Path<String>,
) -> Response {
    let st = d.store.lock();
    match snapstate::get(&st, &name) {
        Ok(snap) => sync_response(map_local(&name, &snap)),
        Err(_) => not_found(format!("cannot find snap {:?}", name)),
    }
}

// ---------------------------------------------------------------------------
// Store search

async fn find(
    AxumState(d): AxumState<SharedDaemon>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    find_impl(d, user, &query)
}

fn find_impl(
    d: SharedDaemon,
    user: Option<UserState>,
    query: &HashMap<String, String>,
) -> Response {
    let mut q = query.get("q").cloned().unwrap_or_default();
    let name = query.get("name").cloned().unwrap_or_default();
    let mut prefix = false;
    let mut private = false;

    if !name.is_empty() {
        if !q.is_empty() {
            return bad_request("cannot use 'q' and 'name' together");
        }
        if let Some(stripped) = name.strip_suffix('*') {
            prefix = true;
            q = stripped.to_string();
        } else {
            q = name.clone();
        }
    }

    match query.get("select").map(String::as_str) {
        Some("refresh") => {
            if prefix {
                return bad_request("cannot use 'name' with 'select=refresh'");
            }
            if !q.is_empty() {
                return bad_request("cannot use 'q' with 'select=refresh'");
            }
            return store_updates(&d);
        }
        Some("private") => {
            if user.is_none() {
                return unauthorized("you need to be logged in to view your private snaps");
            }
            private = true;
        }
        _ => {}
    }

    let search = Search {
        query: q,
        prefix,
        private,
    };
    let found = match d.snap_store.find(&search, user.as_ref()) {
        Ok(found) => found,
        Err(StoreError::EmptyQuery) => return bad_request(StoreError::EmptyQuery.to_string()),
        Err(StoreError::InvalidCredentials) => {
            return unauthorized(StoreError::InvalidCredentials.to_string())
        }
        Err(e) => return internal_error(e.to_string()),
    };

    let results: Vec<Value> = found.iter().map(map_remote).collect();
    sync_response_meta(
        results,
        Meta {
            sources: Some(vec!["store".to_string()]),
            suggested_currency: Some(d.snap_store.suggested_currency()),
        },
    )
}

fn store_updates(d: &SharedDaemon) -> Response {
    let installed = {
        let st = d.store.lock();
        snapstate::installed_revisions(&st)
    };
    let updates = match d.snap_store.refresh_candidates(&installed) {
        Ok(updates) => updates,
        Err(e) => return internal_error(format!("cannot list updates: {}", e)),
    };
    let results: Vec<Value> = updates.iter().map(map_remote).collect();
    sync_response_meta(
        results,
        Meta {
            sources: Some(vec!["store".to_string()]),
            suggested_currency: None,
        },
    )
}

// ---------------------------------------------------------------------------
// Snap operations

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct SnapInstruction {
    action: String,
    channel: String,
    revision: Option<i64>,
    devmode: bool,
    jailmode: bool,
    snaps: Vec<String>,
}

fn quoted_list(names: &[String]) -> String {
    let quoted: Vec<String> = names.iter().map(|n| format!("{:?}", n)).collect();
    quoted.join(", ")
}

/// Create a change from task-sets, stamping the affected snap names
fn new_change(
    st: &mut State,
    kind: &str,
    summary: &str,
    tsets: &[TaskSet],
    snap_names: &[String],
) -> crate::Result<String> {
    let chg = st.new_change(kind, summary);
    for ts in tsets {
        st.add_all(&chg, ts)?;
    }
    if let Some(change) = st.change_mut(&chg) {
        change.set("snap-names", snap_names);
        change.set("api-data", json!({ "snap-names": snap_names }));
    }
    Ok(chg)
}

fn single_summary(action: &str, name: &str, channel: &str) -> String {
    let verb = match action {
        "install" => "Install",
        "refresh" => "Refresh",
        "remove" => "Remove",
        "revert" => "Revert",
        "enable" => "Enable",
        "disable" => "Disable",
        _ => action,
    };
    if (action == "install" || action == "refresh")
        && !channel.is_empty()
        && channel != "stable"
    {
        format!("{} {:?} snap from {:?} channel", verb, name, channel)
    } else {
        format!("{} {:?} snap", verb, name)
    }
}

async fn post_snap(
    AxumState(d): AxumState<SharedDaemon>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let inst: SnapInstruction = match serde_json::from_slice(&body) {
        Ok(inst) => inst,
        Err(e) => {
            return bad_request(format!(
                "cannot decode request body into snap instruction: {}",
                e
            ))
        }
    };

    let flags = match snapstate::mode_flags(inst.devmode, inst.jailmode, d.config.force_devmode)
    {
        Ok(flags) => flags,
        Err(e) => return bad_request(e.to_string()),
    };

    let channel = if inst.channel.is_empty() {
        "stable".to_string()
    } else {
        inst.channel.clone()
    };

    let mut st = d.store.lock();
    let built: crate::Result<Vec<TaskSet>> = match inst.action.as_str() {
        "install" => snapstate::with_ensure_base(&mut st, &name, |st| {
            snapstate::install(st, &name, &channel, inst.revision, flags)
        }),
        "refresh" => {
            snapstate::update(&mut st, &name, &inst.channel, inst.revision, flags)
                .map(|ts| vec![ts])
        }
        "remove" => snapstate::remove(&mut st, &name, inst.revision).map(|ts| vec![ts]),
        "revert" => snapstate::revert(&mut st, &name, flags).map(|ts| vec![ts]),
        "enable" => {
            if inst.revision.is_some() {
                return bad_request("enable takes no revision");
            }
            snapstate::enable(&mut st, &name).map(|ts| vec![ts])
        }
        "disable" => {
            if inst.revision.is_some() {
                return bad_request("disable takes no revision");
            }
            snapstate::disable(&mut st, &name).map(|ts| vec![ts])
        }
        other => return bad_request(format!("unknown action {}", other)),
    };

    let tsets = match built {
        Ok(tsets) => tsets,
        Err(e) => {
            return bad_request(format!("cannot {} {:?}: {}", inst.action, name, e));
        }
    };

    let summary = single_summary(&inst.action, &name, &inst.channel);
    let chg = match new_change(
        &mut st,
        &format!("{}-snap", inst.action),
        &summary,
        &tsets,
        &[name.clone()],
    ) {
        Ok(chg) => chg,
        Err(e) => return internal_error(e.to_string()),
    };
    drop(st);

    d.store.ensure_before(Duration::ZERO);
    async_response(&chg)
}

async fn post_snaps(
    AxumState(d): AxumState<SharedDaemon>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    headers: HeaderMap,
    req: Request<axum::body::Body>,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if content_type.starts_with("application/json") {
        let body = match axum::body::to_bytes(req.into_body(), MAX_READ_LEN).await {
            Ok(body) => body,
            Err(e) => return bad_request(format!("cannot read request body: {}", e)),
        };
        return snaps_op(&d, &body);
    }

    if !content_type.starts_with("multipart/") {
        return bad_request(format!("unknown content type: {}", content_type));
    }

    let multipart = match Multipart::from_request(req, &d).await {
        Ok(multipart) => multipart,
        Err(e) => return bad_request(format!("cannot parse POST body: {}", e)),
    };
    sideload_snap(&d, user, multipart).await
}

const MAX_READ_LEN: usize = 1024 * 1024;

fn snaps_op(d: &SharedDaemon, body: &[u8]) -> Response {
    let inst: SnapInstruction = match serde_json::from_slice(body) {
        Ok(inst) => inst,
        Err(e) => {
            return bad_request(format!(
                "cannot decode request body into snap instruction: {}",
                e
            ))
        }
    };

    if !inst.channel.is_empty() || inst.revision.is_some() || inst.devmode || inst.jailmode {
        return bad_request("unsupported option provided for multi-snap operation");
    }

    let mut st = d.store.lock();
    let (verb, result) = match inst.action.as_str() {
        "install" => {
            if inst.snaps.is_empty() {
                return bad_request("cannot install zero snaps");
            }
            ("Install", snapstate::install_many(&mut st, &inst.snaps))
        }
        "refresh" => ("Refresh", snapstate::update_many(&mut st, &inst.snaps)),
        "remove" => {
            if inst.snaps.is_empty() {
                return bad_request("cannot remove zero snaps");
            }
            ("Remove", snapstate::remove_many(&mut st, &inst.snaps))
        }
        other => {
            return bad_request(format!("unsupported multi-snap operation {:?}", other))
        }
    };

    let (affected, tsets) = match result {
        Ok(r) => r,
        Err(e) => {
            return internal_error(format!(
                "cannot {} {:?}: {}",
                inst.action, inst.snaps, e
            ))
        }
    };

    let summary = match (inst.action.as_str(), inst.snaps.len()) {
        ("refresh", 0) => "Refresh all snaps in the system".to_string(),
        (_, 1) => format!("{} snap {:?}", verb, inst.snaps[0]),
        _ => format!("{} snaps {}", verb, quoted_list(&inst.snaps)),
    };

    let kind = format!("{}-snap", inst.action);
    let chg = if tsets.is_empty() {
        let chg = st.new_change(&kind, &summary);
        if let Some(change) = st.change_mut(&chg) {
            change.status = Some(Status::Done);
            change.set("api-data", json!({ "snap-names": affected }));
        }
        chg
    } else {
        match new_change(&mut st, &kind, &summary, &tsets, &affected) {
            Ok(chg) => chg,
            Err(e) => return internal_error(e.to_string()),
        }
    };
    drop(st);

    d.store.ensure_before(Duration::ZERO);
    async_response(&chg)
}

/// Handle a multipart sideload: an uploaded snap file, or a try request
async fn sideload_snap(
    d: &SharedDaemon,
    _user: Option<UserState>,
    mut multipart: Multipart,
) -> Response {
    let mut dangerous = false;
    let mut devmode = false;
    let mut jailmode = false;
    let mut action = String::new();
    let mut snap_path_field = String::new();
    let mut uploaded: Option<(std::path::PathBuf, String)> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return bad_request(format!("cannot read POST form: {}", e)),
        };
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "dangerous" | "devmode" | "jailmode" | "action" | "snap-path" => {
                let text = match field.text().await {
                    Ok(text) => text,
                    Err(e) => return bad_request(format!("cannot read POST form: {}", e)),
                };
                match field_name.as_str() {
                    "dangerous" => dangerous = text == "true",
                    "devmode" => devmode = text == "true",
                    "jailmode" => jailmode = text == "true",
                    "action" => action = text,
                    "snap-path" => snap_path_field = text,
                    _ => unreachable!(),
                }
            }
            "snap" => {
                let orig_name = field.file_name().unwrap_or_default().to_string();
                let bytes = match field.bytes().await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        return bad_request(format!(
                            "cannot open uploaded \"snap\" file: {}",
                            e
                        ))
                    }
                };
                let dir = d
                    .config
                    .sideload_dir
                    .clone()
                    .unwrap_or_else(std::env::temp_dir);
                let path = dir.join(format!("snapd-sideload-pkg-{}", uuid::Uuid::new_v4()));
                let mut file = match std::fs::File::create(&path) {
                    Ok(file) => file,
                    Err(e) => {
                        return internal_error(format!("cannot create temporary file: {}", e))
                    }
                };
                if let Err(e) = file.write_all(&bytes).and_then(|_| file.sync_all()) {
                    let _ = std::fs::remove_file(&path);
                    return internal_error(format!(
                        "cannot copy request into temporary file: {}",
                        e
                    ));
                }
                uploaded = Some((path, orig_name));
            }
            _ => {}
        }
    }

    let flags = match snapstate::mode_flags(devmode, jailmode, d.config.force_devmode) {
        Ok(flags) => flags,
        Err(e) => return bad_request(e.to_string()),
    };

    if action == "try" {
        if snap_path_field.is_empty() {
            return bad_request("need 'snap-path' value in form");
        }
        return try_snap(d, &snap_path_field, flags);
    }

    let (temp_path, orig_path) = match uploaded {
        Some((path, orig)) => (path, orig),
        None => {
            return bad_request(
                "cannot find \"snap\" file field in provided multipart/form-data payload",
            )
        }
    };

    let mut st = d.store.lock();

    let side_info = if dangerous {
        None
    } else {
        match snapstate::derive_side_info(&temp_path, &st.assert_db) {
            Ok(info) => Some(info),
            Err(crate::Error::AssertNotFound) => {
                if !devmode {
                    let mut msg = "cannot find signatures with metadata for snap".to_string();
                    if !orig_path.is_empty() {
                        msg = format!("{} {:?}", msg, orig_path);
                    }
                    return bad_request(msg);
                }
                None
            }
            Err(e) => return bad_request(e.to_string()),
        }
    };

    let side_info = match side_info {
        Some(info) => info,
        None => {
            // dangerous or devmode: fall back to the uploaded file's name
            let name_source = if orig_path.is_empty() {
                temp_path.clone()
            } else {
                std::path::PathBuf::from(&orig_path)
            };
            match snapstate::unsafe_read_side_info(&name_source) {
                Ok(info) => info,
                Err(e) => return internal_error(format!("cannot read snap file: {}", e)),
            }
        }
    };

    let snap_name = side_info.name.clone();
    let summary = if orig_path.is_empty() {
        format!("Install {:?} snap from file", snap_name)
    } else {
        format!("Install {:?} snap from file {:?}", snap_name, orig_path)
    };

    let built = snapstate::with_ensure_base(&mut st, &snap_name, |st| {
        snapstate::install_path(st, &side_info, &temp_path, flags)
    });
    let tsets = match built {
        Ok(tsets) => tsets,
        Err(e) => return internal_error(format!("cannot install snap file: {}", e)),
    };

    let chg = match new_change(
        &mut st,
        "install-snap",
        &summary,
        &tsets,
        &[snap_name.clone()],
    ) {
        Ok(chg) => chg,
        Err(e) => return internal_error(e.to_string()),
    };
    if let Some(change) = st.change_mut(&chg) {
        change.set("api-data", json!({ "snap-name": snap_name }));
    }
    drop(st);

    d.store.ensure_before(Duration::ZERO);
    async_response(&chg)
}

fn try_snap(d: &SharedDaemon, trydir: &str, flags: snapstate::Flags) -> Response {
    let dir = std::path::Path::new(trydir);
    if !dir.is_absolute() {
        return bad_request(format!("cannot try {:?}: need an absolute path", trydir));
    }
    if !dir.is_dir() {
        return bad_request(format!("cannot try {:?}: not a snap directory", trydir));
    }
    let name = match snapstate::unsafe_read_side_info(dir) {
        Ok(info) => info.name,
        Err(e) => return bad_request(format!("cannot read snap info for {}: {}", trydir, e)),
    };

    let mut st = d.store.lock();
    let ts = match snapstate::try_path(&mut st, &name, dir, flags) {
        Ok(ts) => ts,
        Err(e) => return bad_request(format!("cannot try {}: {}", trydir, e)),
    };
    let summary = format!("Try {:?} snap from {:?}", name, trydir);
    let chg = match new_change(&mut st, "try-snap", &summary, &[ts], &[name.clone()]) {
        Ok(chg) => chg,
        Err(e) => return internal_error(e.to_string()),
    };
    if let Some(change) = st.change_mut(&chg) {
        change.set("api-data", json!({ "snap-name": name }));
    }
    drop(st);

    d.store.ensure_before(Duration::ZERO);
    async_response(&chg)
}

// ---------------------------------------------------------------------------
// Configuration

async fn snap_conf(
    AxumState(d): AxumState<SharedDaemon>,
    Path(name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let keys: Vec<&str> = query
        .get("keys")
        .map(|k| k.split(',').filter(|k| !k.is_empty()).collect())
        .unwrap_or_default();
    if keys.is_empty() {
        return bad_request("cannot obtain configuration: no keys supplied");
    }

    let st = d.store.lock();
    let mut values = Map::new();
    for key in keys {
        match configstate::get(&st, &name, key) {
            Ok(value) => {
                values.insert(key.to_string(), value);
            }
            Err(e) => return bad_request(e.to_string()),
        }
    }
    sync_response(Value::Object(values))
}

async fn set_snap_conf(
    AxumState(d): AxumState<SharedDaemon>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let patch: Map<String, Value> = match serde_json::from_slice(&body) {
        Ok(patch) => patch,
        Err(e) => {
            return bad_request(format!(
                "cannot decode request body into patch values: {}",
                e
            ))
        }
    };

    let mut st = d.store.lock();
    let ts = configstate::change(&mut st, &name, patch);
    let summary = format!("Change configuration of {:?} snap", name);
    let chg = match new_change(&mut st, "configure-snap", &summary, &[ts], &[name.clone()]) {
        Ok(chg) => chg,
        Err(e) => return internal_error(e.to_string()),
    };
    drop(st);

    d.store.ensure_before(Duration::ZERO);
    async_response(&chg)
}

// ---------------------------------------------------------------------------
// Interfaces

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct InterfaceAction {
    action: String,
    plugs: Vec<ifacestate::PlugRef>,
    slots: Vec<ifacestate::SlotRef>,
}

async fn interfaces(AxumState(d): AxumState<SharedDaemon>) -> Response {
    let st = d.store.lock();
    sync_response(ifacestate::interfaces(&st))
}

async fn change_interfaces(AxumState(d): AxumState<SharedDaemon>, body: Bytes) -> Response {
    let action: InterfaceAction = match serde_json::from_slice(&body) {
        Ok(action) => action,
        Err(e) => {
            return bad_request(format!(
                "cannot decode request body into an interface action: {}",
                e
            ))
        }
    };

    if action.action.is_empty() {
        return bad_request("interface action not specified");
    }
    if action.plugs.len() > 1 || action.slots.len() > 1 {
        return not_implemented("many-to-many operations are not implemented");
    }
    if action.action != "connect" && action.action != "disconnect" {
        return bad_request(format!("unsupported interface action: {:?}", action.action));
    }
    if action.plugs.is_empty() || action.slots.is_empty() {
        return bad_request("at least one plug and slot is required");
    }

    let plug = &action.plugs[0];
    let slot = &action.slots[0];

    let mut st = d.store.lock();
    let (summary, built) = match action.action.as_str() {
        "connect" => (
            format!(
                "Connect {}:{} to {}:{}",
                plug.snap, plug.plug, slot.snap, slot.slot
            ),
            ifacestate::connect(&mut st, &plug.snap, &plug.plug, &slot.snap, &slot.slot),
        ),
        _ => (
            format!(
                "Disconnect {}:{} from {}:{}",
                plug.snap, plug.plug, slot.snap, slot.slot
            ),
            ifacestate::disconnect(&mut st, &plug.snap, &plug.plug, &slot.snap, &slot.slot),
        ),
    };
    let ts = match built {
        Ok(ts) => ts,
        Err(e) => return bad_request(e.to_string()),
    };

    let snap_names = vec![plug.snap.clone(), slot.snap.clone()];
    let chg = match new_change(
        &mut st,
        &format!("{}-snap", action.action),
        &summary,
        &[ts],
        &snap_names,
    ) {
        Ok(chg) => chg,
        Err(e) => return internal_error(e.to_string()),
    };
    drop(st);

    d.store.ensure_before(Duration::ZERO);
    async_response(&chg)
}

// ---------------------------------------------------------------------------
// Assertions

async fn do_assert(AxumState(d): AxumState<SharedDaemon>, body: Bytes) -> Response {
    let mut batch = Batch::new();
    if let Err(e) = batch.add_stream(&body) {
        return bad_request(format!("cannot decode request body into assertions: {}", e));
    }

    let mut st = d.store.lock();
    let mut db = st.assert_db.clone();
    if let Err(e) = batch.commit(&mut db) {
        return bad_request(format!("assert failed: {}", e));
    }
    st.assert_db = db;
    sync_response(Value::Null)
}

async fn assert_find_many(
    AxumState(d): AxumState<SharedDaemon>,
    Path(assert_type): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if crate::asserts::types::type_by_name(&assert_type).is_none() {
        return bad_request(format!("invalid assert type: {:?}", assert_type));
    }

    let headers: Vec<(&str, &str)> = query
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let st = d.store.lock();
    let bundle = match st.assert_db.find_many(&assert_type, &headers) {
        Ok(found) => found.iter().map(|a| a.encode()).collect(),
        Err(crate::Error::AssertNotFound) => Vec::new(),
        Err(e) => return internal_error(format!("searching assertions failed: {}", e)),
    };
    Response::Assertions { bundle }
}

// ---------------------------------------------------------------------------
// Events

async fn events(AxumState(d): AxumState<SharedDaemon>) -> EventStream {
    EventStream::new(d.hub.subscribe())
}

// ---------------------------------------------------------------------------
// Changes

fn task_json(st: &State, task_id: &str) -> Option<Value> {
    let task = st.task(task_id)?;
    let (label, done, total) = task.progress();
    let mut v = json!({
        "id": task.id,
        "kind": task.kind,
        "summary": task.summary,
        "status": task.status.to_string(),
        "progress": {"label": label, "done": done, "total": total},
        "spawn-time": task.spawn_time,
    });
    if !task.log.is_empty() {
        v["log"] = json!(task.log);
    }
    if let Some(ready_time) = task.ready_time {
        v["ready-time"] = json!(ready_time);
    }
    Some(v)
}

fn change_json(st: &State, change_id: &str) -> Option<Value> {
    let chg = st.change(change_id)?;
    let status = st.change_status(change_id);
    let tasks: Vec<Value> = chg
        .task_ids
        .iter()
        .filter_map(|id| task_json(st, id))
        .collect();

    let mut v = json!({
        "id": chg.id,
        "kind": chg.kind,
        "summary": chg.summary,
        "status": status.to_string(),
        "ready": status.is_ready(),
        "spawn-time": chg.spawn_time,
    });
    if !tasks.is_empty() {
        v["tasks"] = json!(tasks);
    }
    if let Some(ready_time) = chg.ready_time {
        v["ready-time"] = json!(ready_time);
    }
    if let Some(err) = st.change_err(change_id) {
        v["err"] = json!(err);
    }
    if let Ok(data) = chg.get::<Value>("api-data") {
        v["data"] = data;
    }
    Some(v)
}

async fn changes(
    AxumState(d): AxumState<SharedDaemon>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let select = query
        .get("select")
        .map(String::as_str)
        .unwrap_or("in-progress");
    if !matches!(select, "all" | "in-progress" | "ready") {
        return bad_request("select should be one of: all,in-progress,ready");
    }
    let wanted = query.get("for").cloned();

    let st = d.store.lock();
    let mut infos = Vec::new();
    for chg in st.all_changes() {
        let ready = st.change_ready(&chg.id);
        let keep = match select {
            "all" => true,
            "in-progress" => !ready,
            _ => ready,
        };
        if !keep {
            continue;
        }
        if let Some(wanted) = &wanted {
            let names: Vec<String> = chg.get("snap-names").unwrap_or_default();
            if !names.iter().any(|n| n == wanted) {
                continue;
            }
        }
        if let Some(info) = change_json(&st, &chg.id) {
            infos.push(info);
        }
    }
    sync_response(infos)
}

async fn change_info(
    AxumState(d): AxumState<SharedDaemon>,
    Path(id): Path<String>,
) -> Response {
    let st = d.store.lock();
    match change_json(&st, &id) {
        Some(info) => sync_response(info),
        None => not_found(format!("cannot find change with id {:?}", id)),
    }
}

async fn abort_change(
    AxumState(d): AxumState<SharedDaemon>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    #[derive(Deserialize)]
    struct ChangeAction {
        action: String,
    }

    let action: ChangeAction = match serde_json::from_slice(&body) {
        Ok(action) => action,
        Err(e) => return bad_request(format!("cannot decode data from request body: {}", e)),
    };
    if action.action != "abort" {
        return bad_request(format!("change action {:?} is unsupported", action.action));
    }

    let mut st = d.store.lock();
    if st.change(&id).is_none() {
        return not_found(format!("cannot find change with id {:?}", id));
    }
    if st.change_ready(&id) {
        return bad_request(format!("cannot abort change {} with nothing pending", id));
    }

    st.abort_change(&id);
    let info = change_json(&st, &id).unwrap_or(Value::Null);
    drop(st);

    d.store.ensure_before(Duration::ZERO);
    sync_response(info)
}

// ---------------------------------------------------------------------------
// User provisioning

/// Identity of this device, kept in the state tree
#[derive(Debug, Clone, Default, serde::Serialize, Deserialize)]
pub struct DeviceIdentity {
    #[serde(rename = "brand-id", default)]
    pub brand_id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub series: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CreateUserData {
    email: String,
    sudoer: bool,
    known: bool,
}

fn user_details_from_assertion(
    st: &State,
    email: &str,
) -> Result<(String, crate::osutil::AddUserOptions), String> {
    let prefix = format!("cannot add system-user {:?}: ", email);

    let device: DeviceIdentity = st
        .get("device")
        .map_err(|e| format!("{}cannot get device identity: {}", prefix, e))?;
    let model = st
        .assert_db
        .find(
            "model",
            &[
                ("series", device.series.as_str()),
                ("brand-id", device.brand_id.as_str()),
                ("model", device.model.as_str()),
            ],
        )
        .map_err(|e| format!("{}cannot get model assertion: {}", prefix, e))?;

    let su = st
        .assert_db
        .find(
            "system-user",
            &[
                ("brand-id", device.brand_id.as_str()),
                ("email", email),
            ],
        )
        .map_err(|e| format!("{}{}", prefix, e))?;

    let series = su.header_list("series").unwrap_or_default();
    let models = su.header_list("models").unwrap_or_default();
    if !series.is_empty() && !series.contains(&device.series) {
        return Err(format!(
            "{}{:?} not in series {:?}",
            prefix, email, device.series
        ));
    }
    let model_name = model.header_str("model").unwrap_or_default();
    if !models.is_empty() && !models.iter().any(|m| m.as_str() == model_name) {
        return Err(format!(
            "{}{:?} not in models {:?}",
            prefix, device.model, models
        ));
    }
    if !crate::asserts::types::system_user_valid_at(su, chrono::Utc::now()) {
        return Err(format!("{}assertion not valid anymore", prefix));
    }

    let name = su.header_str("name").unwrap_or_default();
    let opts = crate::osutil::AddUserOptions {
        ssh_keys: su.header_list("ssh-keys").unwrap_or_default(),
        gecos: format!("{},{}", email, name),
        sudoer: false,
        password: su.header_str("password").map(String::from),
        extra_users: false,
    };
    Ok((
        su.header_str("username").unwrap_or_default().to_string(),
        opts,
    ))
}

async fn create_user(
    AxumState(d): AxumState<SharedDaemon>,
    ucred: Option<Extension<Ucred>>,
    body: Bytes,
) -> Response {
    let ucred = match ucred {
        Some(Extension(ucred)) => ucred,
        None => return bad_request("cannot get peer credentials"),
    };
    if ucred.uid != 0 {
        return bad_request("cannot use create-user as non-root");
    }

    let data: CreateUserData = match serde_json::from_slice(&body) {
        Ok(data) => data,
        Err(e) => {
            return bad_request(format!(
                "cannot decode create-user data from request body: {}",
                e
            ))
        }
    };
    if data.email.is_empty() {
        return bad_request("cannot create user: 'email' field is empty");
    }

    let (username, mut opts) = if data.known {
        let st = d.store.lock();
        match user_details_from_assertion(&st, &data.email) {
            Ok(details) => details,
            Err(msg) => return bad_request(msg),
        }
    } else {
        match d.snap_store.user_info(&data.email) {
            Ok(info) => {
                if info.ssh_keys.is_empty() {
                    return bad_request(format!(
                        "cannot create user for {:?}: no ssh keys found",
                        data.email
                    ));
                }
                let gecos = format!("{},{}", data.email, info.openid_identifier);
                (
                    info.username,
                    crate::osutil::AddUserOptions {
                        ssh_keys: info.ssh_keys,
                        gecos,
                        sudoer: false,
                        password: None,
                        extra_users: false,
                    },
                )
            }
            Err(e) => {
                return bad_request(format!("cannot create user {:?}: {}", data.email, e))
            }
        }
    };

    opts.sudoer = data.sudoer;
    opts.extra_users = !d.config.on_classic;

    if let Err(e) = d.user_adder.add_user(&username, &opts) {
        return bad_request(format!("cannot create user {}: {}", username, e));
    }

    sync_response(json!({
        "username": username,
        "ssh-keys": opts.ssh_keys,
        "ssh-key-count": opts.ssh_keys.len(),
    }))
}

// ---------------------------------------------------------------------------
// Payment flow

async fn buy_snap(
    AxumState(d): AxumState<SharedDaemon>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    body: Bytes,
) -> Response {
    let user = match user {
        Some(user) => user,
        None => {
            return error_response_kind(
                400,
                ErrorKind::LoginRequired,
                "you need to log in first",
                None,
            )
        }
    };
    let options: BuyOptions = match serde_json::from_slice(&body) {
        Ok(options) => options,
        Err(e) => {
            return bad_request(format!("cannot decode buy options from request body: {}", e))
        }
    };

    match d.snap_store.buy(&options, &user) {
        Ok(result) => sync_response(result),
        Err(e) => buy_flow_error(e),
    }
}

async fn ready_to_buy(
    AxumState(d): AxumState<SharedDaemon>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Response {
    let user = match user {
        Some(user) => user,
        None => {
            return error_response_kind(
                400,
                ErrorKind::LoginRequired,
                "you need to log in first",
                None,
            )
        }
    };
    match d.snap_store.ready_to_buy(&user) {
        Ok(()) => sync_response(json!(true)),
        Err(e) => buy_flow_error(e),
    }
}

async fn payment_methods(
    AxumState(d): AxumState<SharedDaemon>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Response {
    let user = match user {
        Some(user) => user,
        None => {
            return error_response_kind(
                400,
                ErrorKind::LoginRequired,
                "you need to log in first",
                None,
            )
        }
    };
    match d.snap_store.payment_methods(&user) {
        Ok(methods) => sync_response(json!(methods)),
        Err(e) => buy_flow_error(e),
    }
}

fn buy_flow_error(err: StoreError) -> Response {
    match err {
        StoreError::InvalidCredentials => unauthorized(err.to_string()),
        StoreError::TermsNotAccepted => {
            error_response_kind(400, ErrorKind::TermsNotAccepted, err.to_string(), None)
        }
        StoreError::NoPaymentMethods => {
            error_response_kind(400, ErrorKind::NoPaymentMethods, err.to_string(), None)
        }
        other => internal_error(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Hook helper and icons

#[derive(Deserialize, Default)]
#[serde(default)]
struct SnapctlOptions {
    #[serde(rename = "context-id")]
    context_id: String,
    args: Vec<String>,
}

async fn run_snapctl(AxumState(d): AxumState<SharedDaemon>, body: Bytes) -> Response {
    let options: SnapctlOptions = match serde_json::from_slice(&body) {
        Ok(options) => options,
        Err(e) => return bad_request(format!("cannot decode snapctl request: {}", e)),
    };
    if options.args.is_empty() {
        return bad_request("snapctl cannot run without args");
    }

    match d.hook_runner.run(&options.context_id, &options.args) {
        Ok(output) => sync_response(json!({
            "stdout": output.stdout,
            "stderr": output.stderr,
        })),
        Err(e) => bad_request(format!("error running snapctl: {}", e)),
    }
}

async fn app_icon(
    AxumState(d): AxumState<SharedDaemon>,
    Path(name): Path<String>,
) -> Response {
    let st = d.store.lock();
    let snap = match snapstate::get(&st, &name) {
        Ok(snap) => snap,
        Err(_) => return not_found(format!("cannot find snap {:?}", name)),
    };
    drop(st);

    let path = d
        .config
        .snap_mount_dir
        .join(&name)
        .join(snap.revision.to_string())
        .join("meta")
        .join("gui")
        .join("icon.svg");
    if !path.starts_with(&d.config.snap_mount_dir) {
        return bad_request("requested icon is not in snap path");
    }
    Response::File { path }
}

