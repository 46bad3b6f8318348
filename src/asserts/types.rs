// src/asserts/types.rs

//! Assertion type registry
//!
//! Each type is a table entry: mandatory headers, the primary-key tuple,
//! an assemble step validating the parsed headers, and a cross-assertion
//! consistency check run against the database after signature
//! verification. Dispatch is a flat lookup, not a class hierarchy.

use super::database::Database;
use super::keys::PublicKey;
use super::{attrs::AttributeConstraints, Assertion};
use crate::{Error, Result};
use chrono::{DateTime, Utc};

/// Descriptor of one assertion type
pub struct AssertionType {
    pub name: &'static str,
    pub mandatory: &'static [&'static str],
    pub primary_key: &'static [&'static str],
    pub assemble: fn(&Assertion) -> Result<()>,
    pub check_consistency: fn(&Assertion, &Database, Option<&Assertion>) -> Result<()>,
}

impl std::fmt::Debug for AssertionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssertionType")
            .field("name", &self.name)
            .finish()
    }
}

pub static TYPES: &[AssertionType] = &[
    AssertionType {
        name: "account",
        mandatory: &["display-name"],
        primary_key: &["account-id"],
        assemble: assemble_nothing,
        check_consistency: check_nothing,
    },
    AssertionType {
        name: "account-key",
        mandatory: &["account-id", "public-key"],
        primary_key: &["public-key-id"],
        assemble: assemble_account_key,
        check_consistency: check_account_key,
    },
    AssertionType {
        name: "model",
        mandatory: &["architecture", "gadget", "kernel", "timestamp"],
        primary_key: &["series", "brand-id", "model"],
        assemble: assemble_model,
        check_consistency: check_nothing,
    },
    AssertionType {
        name: "serial",
        mandatory: &["device-key", "device-key-id", "timestamp"],
        primary_key: &["brand-id", "model", "serial"],
        assemble: assemble_serial,
        check_consistency: check_nothing,
    },
    AssertionType {
        name: "serial-request",
        mandatory: &["device-key", "request-id"],
        primary_key: &["brand-id", "model", "request-id"],
        assemble: assemble_serial_request,
        check_consistency: check_nothing,
    },
    AssertionType {
        name: "device-session-request",
        mandatory: &["timestamp"],
        primary_key: &["brand-id", "model", "serial", "nonce"],
        assemble: assemble_device_session_request,
        check_consistency: check_nothing,
    },
    AssertionType {
        name: "snap-declaration",
        mandatory: &["snap-name", "publisher-id"],
        primary_key: &["series", "snap-id"],
        assemble: assemble_snap_declaration,
        check_consistency: check_snap_declaration,
    },
    AssertionType {
        name: "snap-revision",
        mandatory: &["snap-id", "snap-revision", "developer-id"],
        primary_key: &["snap-sha256"],
        assemble: assemble_snap_revision,
        check_consistency: check_snap_revision,
    },
    AssertionType {
        name: "system-user",
        mandatory: &["series", "models", "name", "username", "password", "since", "until"],
        primary_key: &["brand-id", "email"],
        assemble: assemble_system_user,
        check_consistency: check_nothing,
    },
];

/// Look up a type descriptor by name
pub fn type_by_name(name: &str) -> Option<&'static AssertionType> {
    TYPES.iter().find(|t| t.name == name)
}

// ---------------------------------------------------------------------------
// Assemble steps

fn assemble_nothing(_a: &Assertion) -> Result<()> {
    Ok(())
}

fn check_nothing(_a: &Assertion, _db: &Database, _acck: Option<&Assertion>) -> Result<()> {
    Ok(())
}

/// Brand-subject types are expected to be signed by the brand itself
fn check_authority_matches_brand(a: &Assertion) -> Result<()> {
    let brand = a.header_str("brand-id").unwrap_or_default();
    if brand != a.authority_id() {
        return Err(Error::AssertParse(format!(
            "authority-id and brand-id must match, {} assertions are expected to be signed by \
             the brand: {:?} != {:?}",
            a.type_name(),
            a.authority_id(),
            brand
        )));
    }
    Ok(())
}

fn check_timestamp(a: &Assertion, name: &str) -> Result<DateTime<Utc>> {
    let raw = a
        .header_str(name)
        .ok_or_else(|| Error::AssertParse(format!("{:?} header is mandatory", name)))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| Error::AssertParse(format!("{:?} is not an RFC3339 date: {:?}", name, raw)))
}

fn check_string_list(a: &Assertion, name: &str) -> Result<Option<Vec<String>>> {
    match a.header(name) {
        None => Ok(None),
        Some(v) if v.is_array() => match a.header_list(name) {
            Some(list) => Ok(Some(list)),
            None => Err(Error::AssertParse(format!(
                "{:?} must be a list of strings",
                name
            ))),
        },
        Some(_) => Err(Error::AssertParse(format!(
            "{:?} must be a list of strings",
            name
        ))),
    }
}

fn assemble_account_key(a: &Assertion) -> Result<()> {
    let key = PublicKey::decode(a.header_str("public-key").unwrap_or_default())?;
    let declared = a.header_str("public-key-id").unwrap_or_default();
    if key.id() != declared {
        return Err(Error::AssertParse(
            "public key does not match provided key id".to_string(),
        ));
    }
    Ok(())
}

fn assemble_model(a: &Assertion) -> Result<()> {
    check_authority_matches_brand(a)?;
    check_timestamp(a, "timestamp")?;
    check_string_list(a, "required-snaps")?;
    if let Some(store) = a.header("store") {
        if !store.is_string() {
            return Err(Error::AssertParse("\"store\" must be a string".to_string()));
        }
    }
    Ok(())
}

fn assemble_serial(a: &Assertion) -> Result<()> {
    check_authority_matches_brand(a)?;
    let key = PublicKey::decode(a.header_str("device-key").unwrap_or_default())?;
    if key.id() != a.header_str("device-key-id").unwrap_or_default() {
        return Err(Error::AssertParse(
            "device key does not match provided key id".to_string(),
        ));
    }
    check_timestamp(a, "timestamp")?;
    Ok(())
}

fn assemble_serial_request(a: &Assertion) -> Result<()> {
    let key = PublicKey::decode(a.header_str("device-key").unwrap_or_default())?;
    if key.id() != a.sign_key_id() {
        return Err(Error::AssertParse(
            "device key does not match included signing key id".to_string(),
        ));
    }
    Ok(())
}

fn assemble_device_session_request(a: &Assertion) -> Result<()> {
    check_timestamp(a, "timestamp")?;
    Ok(())
}

fn assemble_snap_declaration(a: &Assertion) -> Result<()> {
    // Plug and slot constraints compile once here; a declaration with an
    // uncompilable constraint never enters the database.
    for side in ["plugs", "slots"] {
        if let Some(map) = a.header(side) {
            let map = map.as_object().ok_or_else(|| {
                Error::AssertParse(format!("{:?} must map interface names to constraints", side))
            })?;
            for (iface, rules) in map {
                let rules = rules.as_object().ok_or_else(|| {
                    Error::AssertParse(format!("constraints for interface {:?} must be a map", iface))
                })?;
                for (rule, constraint) in rules {
                    AttributeConstraints::compile(constraint).map_err(|e| {
                        Error::AssertParse(format!("{} {} {}: {}", side, iface, rule, e))
                    })?;
                }
            }
        }
    }
    Ok(())
}

fn assemble_snap_revision(a: &Assertion) -> Result<()> {
    let raw = a.header_str("snap-revision").unwrap_or_default();
    let rev: i64 = raw
        .parse()
        .map_err(|_| Error::AssertParse(format!("invalid snap-revision: {:?}", raw)))?;
    if rev < 1 {
        return Err(Error::AssertParse(format!(
            "snap-revision must be positive: {}",
            rev
        )));
    }
    Ok(())
}

fn assemble_system_user(a: &Assertion) -> Result<()> {
    check_authority_matches_brand(a)?;
    for name in ["series", "models"] {
        if check_string_list(a, name)?.is_none() {
            return Err(Error::AssertParse(format!(
                "{:?} must be a list of strings",
                name
            )));
        }
    }
    let since = check_timestamp(a, "since")?;
    let until = check_timestamp(a, "until")?;
    if until < since {
        return Err(Error::AssertParse(
            "\"until\" must be later than \"since\"".to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Consistency checks

fn check_account_key(a: &Assertion, db: &Database, _acck: Option<&Assertion>) -> Result<()> {
    let account_id = a.header_str("account-id").unwrap_or_default();
    if db
        .find("account", &[("account-id", account_id)])
        .is_err()
    {
        return Err(Error::AssertConsistency(format!(
            "account-key for unknown account {:?}",
            account_id
        )));
    }
    Ok(())
}

fn check_snap_declaration(a: &Assertion, db: &Database, _acck: Option<&Assertion>) -> Result<()> {
    let publisher = a.header_str("publisher-id").unwrap_or_default();
    if db.find("account", &[("account-id", publisher)]).is_err() {
        return Err(Error::AssertConsistency(format!(
            "snap-declaration for unknown publisher {:?}",
            publisher
        )));
    }
    Ok(())
}

fn check_snap_revision(a: &Assertion, db: &Database, _acck: Option<&Assertion>) -> Result<()> {
    let snap_id = a.header_str("snap-id").unwrap_or_default();
    if db
        .find_many("snap-declaration", &[("snap-id", snap_id)])
        .is_err()
    {
        return Err(Error::AssertConsistency(format!(
            "snap-revision for snap-id {:?} without a snap-declaration",
            snap_id
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Typed helpers used by the API layer

/// Whether a system-user assertion is valid at `at`
pub fn system_user_valid_at(a: &Assertion, at: DateTime<Utc>) -> bool {
    let since = check_timestamp(a, "since");
    let until = check_timestamp(a, "until");
    match (since, until) {
        (Ok(since), Ok(until)) => since <= at && at < until,
        _ => false,
    }
}
