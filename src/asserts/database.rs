// src/asserts/database.rs

//! Assertion database
//!
//! A content-addressed, indexed store keyed by (type, primary key) with a
//! secondary index by signing key. `add` verifies the signature against
//! the signing key's account-key assertion, applies the revision rule and
//! runs the type's consistency check. `Batch` stages a set of assertions
//! and commits them all-or-nothing.

use super::keys::PublicKey;
use super::Assertion;
use crate::{Error, Result};
use std::collections::HashMap;

type PrimaryKey = (String, Vec<String>);

/// The assertion store
#[derive(Debug, Default, Clone)]
pub struct Database {
    assertions: HashMap<PrimaryKey, Assertion>,
    /// Secondary index: signing key id → assertion keys
    by_sign_key: HashMap<String, Vec<PrimaryKey>>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the database with trust-root assertions (typically an account
    /// and its account-key), bypassing signature verification.
    pub fn with_trusted(trusted: Vec<Assertion>) -> Self {
        let mut db = Self::default();
        for a in trusted {
            db.insert(a);
        }
        db
    }

    /// Number of stored assertions
    pub fn len(&self) -> usize {
        self.assertions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assertions.is_empty()
    }

    /// Add one assertion: verify its signature, enforce the revision rule
    /// and run the type's consistency check. On error the database is
    /// unchanged.
    pub fn add(&mut self, assertion: Assertion) -> Result<()> {
        let account_key = self.verify_signature(&assertion)?;

        let key = (
            assertion.type_name().to_string(),
            assertion.primary_key(),
        );
        if let Some(current) = self.assertions.get(&key) {
            if assertion.revision() <= current.revision() {
                return Err(Error::AssertRevision {
                    new: assertion.revision(),
                    current: current.revision(),
                });
            }
        }

        (assertion.assertion_type().check_consistency)(
            &assertion,
            self,
            account_key.as_ref(),
        )?;

        self.insert(assertion);
        Ok(())
    }

    /// Find the single assertion matching `type` and the given headers.
    ///
    /// The headers must cover the type's full primary key; any extra
    /// headers must match as well.
    pub fn find(&self, type_name: &str, headers: &[(&str, &str)]) -> Result<&Assertion> {
        let atype = super::types::type_by_name(type_name)
            .ok_or_else(|| Error::AssertUnknownType(type_name.to_string()))?;

        let lookup: HashMap<&str, &str> = headers.iter().copied().collect();
        let mut pk = Vec::with_capacity(atype.primary_key.len());
        for name in atype.primary_key {
            match lookup.get(name) {
                Some(v) => pk.push(v.to_string()),
                None => {
                    return Err(Error::AssertParse(format!(
                        "find requires the {:?} primary key header",
                        name
                    )));
                }
            }
        }

        let assertion = self
            .assertions
            .get(&(type_name.to_string(), pk))
            .ok_or(Error::AssertNotFound)?;
        if header_filter_matches(assertion, headers) {
            Ok(assertion)
        } else {
            Err(Error::AssertNotFound)
        }
    }

    /// Find every assertion of `type` whose headers match the filter
    pub fn find_many(&self, type_name: &str, headers: &[(&str, &str)]) -> Result<Vec<&Assertion>> {
        super::types::type_by_name(type_name)
            .ok_or_else(|| Error::AssertUnknownType(type_name.to_string()))?;

        let mut found: Vec<&Assertion> = self
            .assertions
            .iter()
            .filter(|((t, _), _)| t == type_name)
            .map(|(_, a)| a)
            .filter(|a| header_filter_matches(a, headers))
            .collect();
        if found.is_empty() {
            return Err(Error::AssertNotFound);
        }
        found.sort_by_key(|a| a.primary_key());
        Ok(found)
    }

    /// Assertions signed by the given key
    pub fn signed_by(&self, key_id: &str) -> Vec<&Assertion> {
        self.by_sign_key
            .get(key_id)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| self.assertions.get(k))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolve the public key an assertion must verify against.
    ///
    /// Normally the signing key's account-key assertion; serial-requests
    /// are self-signed with their embedded device key.
    fn verify_signature(&self, assertion: &Assertion) -> Result<Option<Assertion>> {
        if assertion.type_name() == "serial-request" {
            let key = PublicKey::decode(assertion.header_str("device-key").unwrap_or_default())?;
            key.verify(assertion.signed_content(), assertion.signature())?;
            return Ok(None);
        }

        let account_key = self
            .find("account-key", &[("public-key-id", assertion.sign_key_id())])
            .map_err(|_| {
                Error::AssertSignature(format!(
                    "no matching account-key for signing key {:?}",
                    assertion.sign_key_id()
                ))
            })?
            .clone();
        let key = PublicKey::decode(account_key.header_str("public-key").unwrap_or_default())?;
        key.verify(assertion.signed_content(), assertion.signature())?;
        Ok(Some(account_key))
    }

    fn insert(&mut self, assertion: Assertion) {
        let key = (
            assertion.type_name().to_string(),
            assertion.primary_key(),
        );
        let sign_key = assertion.sign_key_id().to_string();
        if let Some(old) = self.assertions.insert(key.clone(), assertion) {
            if let Some(keys) = self.by_sign_key.get_mut(old.sign_key_id()) {
                keys.retain(|k| k != &key);
            }
        }
        self.by_sign_key.entry(sign_key).or_default().push(key);
    }
}

fn header_filter_matches(assertion: &Assertion, headers: &[(&str, &str)]) -> bool {
    headers
        .iter()
        .all(|(name, value)| assertion.header_str(name) == Some(*value))
}

/// Commit precedence: signing keys land before the assertions they sign
fn type_precedence(type_name: &str) -> u8 {
    match type_name {
        "account" => 0,
        "account-key" => 1,
        "snap-declaration" => 2,
        _ => 3,
    }
}

/// A transactional batch of assertions
#[derive(Debug, Default)]
pub struct Batch {
    assertions: Vec<Assertion>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a wire stream of assertions into the batch, returning how
    /// many were read
    pub fn add_stream(&mut self, data: &[u8]) -> Result<usize> {
        let parsed = Assertion::parse_stream(data)?;
        let n = parsed.len();
        self.assertions.extend(parsed);
        Ok(n)
    }

    pub fn add(&mut self, assertion: Assertion) {
        self.assertions.push(assertion);
    }

    pub fn is_empty(&self) -> bool {
        self.assertions.is_empty()
    }

    /// Add the batch to the database in dependency order. Either every
    /// assertion passes or the database is left unchanged and the first
    /// offending assertion's error is returned.
    pub fn commit(self, db: &mut Database) -> Result<()> {
        let mut ordered = self.assertions;
        ordered.sort_by_key(|a| type_precedence(a.type_name()));

        let mut staged = db.clone();
        for assertion in ordered {
            // Re-adding an assertion the database already has is not an
            // error for a batch; skip it.
            match staged.add(assertion) {
                Ok(()) => {}
                Err(Error::AssertRevision { new, current }) if new == current => {}
                Err(e) => return Err(e),
            }
        }
        *db = staged;
        Ok(())
    }
}
