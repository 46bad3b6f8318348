// src/daemon/auth.rs

//! Users and authorization
//!
//! A user record is created at login and persisted in the state tree; it
//! holds the capability macaroon and its discharges. Requests authenticate
//! with `Authorization: Macaroon root="…", discharge="…"` and routes are
//! gated by their access flags plus the peer's uid.

use super::ucrednet::Ucred;
use crate::state::State;
use crate::{Error, Result};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

const AUTH_PATH: &str = "auth";

/// A logged-in user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserState {
    pub id: u64,
    pub username: String,
    pub macaroon: String,
    pub discharges: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AuthData {
    #[serde(rename = "last-id", default)]
    last_id: u64,
    #[serde(default)]
    users: Vec<UserState>,
}

fn auth_data(st: &State) -> AuthData {
    st.get(AUTH_PATH).unwrap_or_default()
}

/// Create and persist a user record
pub fn new_user(
    st: &mut State,
    username: &str,
    macaroon: &str,
    discharges: Vec<String>,
) -> UserState {
    let mut data = auth_data(st);
    data.last_id += 1;
    let user = UserState {
        id: data.last_id,
        username: username.to_string(),
        macaroon: macaroon.to_string(),
        discharges,
    };
    data.users.push(user.clone());
    st.set(AUTH_PATH, data);
    user
}

/// Remove a user record
pub fn remove_user(st: &mut State, id: u64) -> Result<()> {
    let mut data = auth_data(st);
    let before = data.users.len();
    data.users.retain(|u| u.id != id);
    if data.users.len() == before {
        return Err(Error::NotFound(format!("no user with id {}", id)));
    }
    st.set(AUTH_PATH, data);
    Ok(())
}

/// Find the user matching a macaroon and its discharges
pub fn check_macaroon(st: &State, macaroon: &str, discharges: &[String]) -> Result<UserState> {
    auth_data(st)
        .users
        .into_iter()
        .find(|u| {
            u.macaroon == macaroon && u.discharges.iter().all(|d| discharges.contains(d))
        })
        .ok_or_else(|| Error::NotFound("invalid authentication".to_string()))
}

/// Parse the Authorization header into (macaroon, discharges)
fn parse_authorization(header: &str) -> Result<(String, Vec<String>)> {
    let mut parts = header.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let rest = parts
        .next()
        .ok_or_else(|| Error::NotFound("invalid authorization header".to_string()))?;
    if scheme != "Macaroon" {
        return Err(Error::NotFound(
            "authorization header misses Macaroon prefix".to_string(),
        ));
    }

    let mut macaroon = String::new();
    let mut discharges = Vec::new();
    for field in rest.split(',') {
        let field = field.trim();
        if let Some(value) = field.strip_prefix("root=\"") {
            macaroon = value.trim_end_matches('"').to_string();
        } else if let Some(value) = field.strip_prefix("discharge=\"") {
            discharges.push(value.trim_end_matches('"').to_string());
        }
    }

    if macaroon.is_empty() || discharges.is_empty() {
        return Err(Error::NotFound("invalid authorization header".to_string()));
    }
    Ok((macaroon, discharges))
}

/// Authenticate a request against the persisted users.
///
/// Requires the state lock to be held by the caller.
pub fn user_from_request(st: &State, headers: &HeaderMap) -> Result<UserState> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::NotFound("no authorization header".to_string()))?;
    let (macaroon, discharges) = parse_authorization(header)?;
    check_macaroon(st, &macaroon, &discharges)
}

/// Access flags of one route; unset flags mean root-only
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessFlags {
    /// No authentication required at all
    pub guest_ok: bool,
    /// Any authenticated user may call
    pub user_ok: bool,
    /// Callable by a snap through the hook helper socket
    pub snap_ok: bool,
}

/// Outcome of the access check
#[derive(Debug, Clone, PartialEq)]
pub enum Access {
    Allowed,
    Unauthorized,
    Forbidden,
}

/// Decide whether a request may reach its handler
pub fn can_access(
    flags: AccessFlags,
    ucred: Option<&Ucred>,
    user: Option<&UserState>,
    snap_socket: &str,
) -> Access {
    if flags.guest_ok {
        return Access::Allowed;
    }
    if flags.user_ok && user.is_some() {
        return Access::Allowed;
    }
    match ucred {
        Some(ucred) => {
            if ucred.uid == 0 {
                return Access::Allowed;
            }
            if flags.snap_ok && !snap_socket.is_empty() && ucred.socket == snap_socket {
                return Access::Allowed;
            }
            if user.is_some() {
                // authenticated, but the route wants root
                Access::Forbidden
            } else {
                Access::Unauthorized
            }
        }
        None => Access::Unauthorized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    fn ucred(uid: u32) -> Ucred {
        Ucred {
            pid: 100,
            uid,
            socket: "/run/snapd/snapd.sock".to_string(),
        }
    }

    #[test]
    fn test_user_lifecycle() {
        let mut st = State::default();
        let user = new_user(
            &mut st,
            "dev@example.com",
            "macaroon-1",
            vec!["discharge-1".to_string()],
        );
        assert_eq!(user.id, 1);

        let found =
            check_macaroon(&st, "macaroon-1", &["discharge-1".to_string()]).unwrap();
        assert_eq!(found, user);

        assert!(check_macaroon(&st, "macaroon-1", &[]).is_err());
        assert!(check_macaroon(&st, "other", &["discharge-1".to_string()]).is_err());

        remove_user(&mut st, user.id).unwrap();
        assert!(check_macaroon(&st, "macaroon-1", &["discharge-1".to_string()]).is_err());
        assert!(remove_user(&mut st, user.id).is_err());
    }

    #[test]
    fn test_user_ids_monotonic() {
        let mut st = State::default();
        let first = new_user(&mut st, "a@example.com", "m1", vec!["d".to_string()]);
        remove_user(&mut st, first.id).unwrap();
        let second = new_user(&mut st, "b@example.com", "m2", vec!["d".to_string()]);
        assert_eq!(second.id, 2);
    }

    #[test]
    fn test_authorization_parsing() {
        let mut st = State::default();
        let user = new_user(
            &mut st,
            "dev@example.com",
            "mac",
            vec!["d1".to_string(), "d2".to_string()],
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            "Macaroon root=\"mac\", discharge=\"d1\", discharge=\"d2\""
                .parse()
                .unwrap(),
        );
        assert_eq!(user_from_request(&st, &headers).unwrap(), user);

        let mut bad = HeaderMap::new();
        bad.insert(AUTHORIZATION, "Basic Zm9vOmJhcg==".parse().unwrap());
        assert!(user_from_request(&st, &bad).is_err());

        let mut partial = HeaderMap::new();
        partial.insert(AUTHORIZATION, "Macaroon root=\"mac\"".parse().unwrap());
        assert!(user_from_request(&st, &partial).is_err());
    }

    #[test]
    fn test_access_rules() {
        let guest = AccessFlags {
            guest_ok: true,
            ..Default::default()
        };
        let user_ok = AccessFlags {
            user_ok: true,
            ..Default::default()
        };
        let root_only = AccessFlags::default();
        let snap_ok = AccessFlags {
            snap_ok: true,
            ..Default::default()
        };

        let user = UserState {
            id: 1,
            username: "dev".to_string(),
            macaroon: "m".to_string(),
            discharges: vec![],
        };

        assert_eq!(can_access(guest, None, None, ""), Access::Allowed);
        assert_eq!(can_access(user_ok, None, None, ""), Access::Unauthorized);
        assert_eq!(
            can_access(user_ok, Some(&ucred(1000)), Some(&user), ""),
            Access::Allowed
        );
        assert_eq!(
            can_access(root_only, Some(&ucred(0)), None, ""),
            Access::Allowed
        );
        assert_eq!(
            can_access(root_only, Some(&ucred(1000)), Some(&user), ""),
            Access::Forbidden
        );
        assert_eq!(
            can_access(root_only, Some(&ucred(1000)), None, ""),
            Access::Unauthorized
        );

        let mut hook = ucred(1000);
        hook.socket = "/run/snapd/snapd-snap.sock".to_string();
        assert_eq!(
            can_access(snap_ok, Some(&hook), None, "/run/snapd/snapd-snap.sock"),
            Access::Allowed
        );
        assert_eq!(
            can_access(
                snap_ok,
                Some(&ucred(1000)),
                None,
                "/run/snapd/snapd-snap.sock"
            ),
            Access::Unauthorized
        );
    }
}
