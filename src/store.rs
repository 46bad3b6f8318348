// src/store.rs

//! Remote store contract
//!
//! The daemon consumes the store through this narrow trait: search,
//! authentication, downloads, the payment flow and user details. The HTTP
//! client behind it lives outside this crate; `MemoryStore` is the
//! in-process double used by tests and demos.

use crate::daemon::auth::UserState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// A store search request
#[derive(Debug, Clone, Default)]
pub struct Search {
    pub query: String,
    pub prefix: bool,
    pub private: bool,
}

/// A snap as the store describes it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSnap {
    pub name: String,
    #[serde(rename = "snap-id")]
    pub snap_id: String,
    pub version: String,
    pub revision: i64,
    pub channel: String,
    pub developer: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
    /// Price per currency; absent for free snaps
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub prices: BTreeMap<String, f64>,
}

/// Options for a purchase
#[derive(Debug, Clone, Deserialize)]
pub struct BuyOptions {
    #[serde(rename = "snap-id")]
    pub snap_id: String,
    #[serde(rename = "snap-name", default)]
    pub snap_name: String,
    pub price: f64,
    pub currency: String,
}

/// Result of a purchase
#[derive(Debug, Clone, Serialize)]
pub struct BuyResult {
    pub state: String,
}

/// Store-side details of a user, for host account provisioning
#[derive(Debug, Clone)]
pub struct StoreUserInfo {
    pub username: String,
    pub ssh_keys: Vec<String>,
    pub openid_identifier: String,
}

/// Errors of the store contract; several map onto user-flow error kinds
/// in the API envelope
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("two factor authentication required")]
    TwoFactorRequired,
    #[error("two factor authentication failed")]
    TwoFactorFailed,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("cannot authenticate: {0}")]
    InvalidAuthData(String),
    #[error("terms of service not accepted")]
    TermsNotAccepted,
    #[error("no payment methods")]
    NoPaymentMethods,
    #[error("empty query")]
    EmptyQuery,
    #[error("cannot find snap {0:?}")]
    NotFound(String),
    #[error("store is unavailable: {0}")]
    Unavailable(String),
}

/// The store surface the daemon relies on
pub trait Store: Send + Sync {
    /// Exchange credentials for a capability token and its discharges
    fn login(
        &self,
        username: &str,
        password: &str,
        otp: Option<&str>,
    ) -> Result<(String, Vec<String>), StoreError>;

    /// Search the store
    fn find(&self, search: &Search, user: Option<&UserState>)
        -> Result<Vec<RemoteSnap>, StoreError>;

    /// Resolve one snap by name and channel
    fn snap(&self, name: &str, channel: &str) -> Result<RemoteSnap, StoreError>;

    /// Fetch the snap file, returning its local path
    fn download(&self, snap: &RemoteSnap) -> Result<PathBuf, StoreError>;

    /// Updates available for the given installed (name, revision) pairs
    fn refresh_candidates(
        &self,
        installed: &[(String, i64)],
    ) -> Result<Vec<RemoteSnap>, StoreError>;

    fn suggested_currency(&self) -> String {
        "USD".to_string()
    }

    fn buy(&self, options: &BuyOptions, user: &UserState) -> Result<BuyResult, StoreError>;

    fn ready_to_buy(&self, user: &UserState) -> Result<(), StoreError>;

    fn payment_methods(&self, user: &UserState) -> Result<Vec<String>, StoreError>;

    /// Store-side user details for host account provisioning
    fn user_info(&self, email: &str) -> Result<StoreUserInfo, StoreError>;
}

/// Store backend used when the daemon has no network configuration
pub struct OfflineStore;

impl Store for OfflineStore {
    fn login(
        &self,
        _username: &str,
        _password: &str,
        _otp: Option<&str>,
    ) -> Result<(String, Vec<String>), StoreError> {
        Err(StoreError::Unavailable("no store configured".to_string()))
    }

    fn find(
        &self,
        _search: &Search,
        _user: Option<&UserState>,
    ) -> Result<Vec<RemoteSnap>, StoreError> {
        Err(StoreError::Unavailable("no store configured".to_string()))
    }

    fn snap(&self, name: &str, _channel: &str) -> Result<RemoteSnap, StoreError> {
        Err(StoreError::NotFound(name.to_string()))
    }

    fn download(&self, snap: &RemoteSnap) -> Result<PathBuf, StoreError> {
        Err(StoreError::NotFound(snap.name.clone()))
    }

    fn refresh_candidates(
        &self,
        _installed: &[(String, i64)],
    ) -> Result<Vec<RemoteSnap>, StoreError> {
        Ok(Vec::new())
    }

    fn buy(&self, _options: &BuyOptions, _user: &UserState) -> Result<BuyResult, StoreError> {
        Err(StoreError::Unavailable("no store configured".to_string()))
    }

    fn ready_to_buy(&self, _user: &UserState) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("no store configured".to_string()))
    }

    fn payment_methods(&self, _user: &UserState) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Unavailable("no store configured".to_string()))
    }

    fn user_info(&self, email: &str) -> Result<StoreUserInfo, StoreError> {
        Err(StoreError::InvalidAuthData(format!(
            "cannot look up {:?} without a store",
            email
        )))
    }
}

/// Credentials accepted by [`MemoryStore::login`]
#[derive(Debug, Clone)]
pub struct MemoryAccount {
    pub password: String,
    pub otp: Option<String>,
}

/// In-memory store double for tests and demos
#[derive(Default)]
pub struct MemoryStore {
    snaps: Mutex<Vec<RemoteSnap>>,
    accounts: Mutex<BTreeMap<String, MemoryAccount>>,
    users: Mutex<BTreeMap<String, StoreUserInfo>>,
    download_dir: Mutex<Option<PathBuf>>,
    tos_accepted: Mutex<bool>,
    payment_methods: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tos_accepted: Mutex::new(true),
            ..Default::default()
        }
    }

    pub fn add_snap(&self, snap: RemoteSnap) {
        self.snaps.lock().push(snap);
    }

    pub fn add_account(&self, username: &str, password: &str, otp: Option<&str>) {
        self.accounts.lock().insert(
            username.to_string(),
            MemoryAccount {
                password: password.to_string(),
                otp: otp.map(String::from),
            },
        );
    }

    pub fn add_user_info(&self, email: &str, info: StoreUserInfo) {
        self.users.lock().insert(email.to_string(), info);
    }

    pub fn set_download_dir(&self, dir: PathBuf) {
        *self.download_dir.lock() = Some(dir);
    }

    pub fn set_tos_accepted(&self, accepted: bool) {
        *self.tos_accepted.lock() = accepted;
    }

    pub fn set_payment_methods(&self, methods: Vec<String>) {
        *self.payment_methods.lock() = methods;
    }
}

impl Store for MemoryStore {
    fn login(
        &self,
        username: &str,
        password: &str,
        otp: Option<&str>,
    ) -> Result<(String, Vec<String>), StoreError> {
        let accounts = self.accounts.lock();
        let account = accounts
            .get(username)
            .ok_or(StoreError::InvalidCredentials)?;
        if account.password != password {
            return Err(StoreError::InvalidCredentials);
        }
        if let Some(expected) = &account.otp {
            match otp {
                None => return Err(StoreError::TwoFactorRequired),
                Some(given) if given != expected => return Err(StoreError::TwoFactorFailed),
                Some(_) => {}
            }
        }
        let macaroon = uuid::Uuid::new_v4().to_string();
        let discharge = uuid::Uuid::new_v4().to_string();
        Ok((macaroon, vec![discharge]))
    }

    fn find(
        &self,
        search: &Search,
        _user: Option<&UserState>,
    ) -> Result<Vec<RemoteSnap>, StoreError> {
        let snaps = self.snaps.lock();
        let found = snaps
            .iter()
            .filter(|s| {
                if search.query.is_empty() {
                    true
                } else if search.prefix {
                    s.name.starts_with(&search.query)
                } else {
                    s.name.contains(&search.query)
                }
            })
            .cloned()
            .collect();
        Ok(found)
    }

    fn snap(&self, name: &str, channel: &str) -> Result<RemoteSnap, StoreError> {
        let snaps = self.snaps.lock();
        snaps
            .iter()
            .filter(|s| s.name == name)
            .find(|s| channel.is_empty() || s.channel == channel || channel == "stable")
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn download(&self, snap: &RemoteSnap) -> Result<PathBuf, StoreError> {
        let dir = self
            .download_dir
            .lock()
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let path = dir.join(format!("{}_{}.snap", snap.name, snap.revision));
        std::fs::write(&path, format!("{} {}", snap.snap_id, snap.revision))
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(path)
    }

    fn refresh_candidates(
        &self,
        installed: &[(String, i64)],
    ) -> Result<Vec<RemoteSnap>, StoreError> {
        let snaps = self.snaps.lock();
        let mut out = Vec::new();
        for (name, revision) in installed {
            if let Some(candidate) = snaps
                .iter()
                .filter(|s| &s.name == name && s.revision > *revision)
                .max_by_key(|s| s.revision)
            {
                out.push(candidate.clone());
            }
        }
        Ok(out)
    }

    fn buy(&self, options: &BuyOptions, user: &UserState) -> Result<BuyResult, StoreError> {
        self.ready_to_buy(user)?;
        if options.currency.is_empty() {
            return Err(StoreError::InvalidAuthData("currency required".to_string()));
        }
        Ok(BuyResult {
            state: "Complete".to_string(),
        })
    }

    fn ready_to_buy(&self, _user: &UserState) -> Result<(), StoreError> {
        if !*self.tos_accepted.lock() {
            return Err(StoreError::TermsNotAccepted);
        }
        if self.payment_methods.lock().is_empty() {
            return Err(StoreError::NoPaymentMethods);
        }
        Ok(())
    }

    fn payment_methods(&self, user: &UserState) -> Result<Vec<String>, StoreError> {
        self.ready_to_buy(user)?;
        Ok(self.payment_methods.lock().clone())
    }

    fn user_info(&self, email: &str) -> Result<StoreUserInfo, StoreError> {
        self.users
            .lock()
            .get(email)
            .cloned()
            .ok_or_else(|| StoreError::InvalidAuthData(format!("unknown email {:?}", email)))
    }
}
