// src/asserts/mod.rs

//! Signed assertions
//!
//! An assertion is an immutable signed statement with a declared type, an
//! ordered header block, an optional opaque body and a detached ed25519
//! signature. The wire form is
//!
//! ```text
//! header-block
//!
//! [body
//!
//! ]signature
//! ```
//!
//! where the header block is `key: value` lines; list values render one
//! `- item` per line and nested maps indent by two spaces. The signature
//! covers the exact header-block bytes plus the body separator and body,
//! so canonicalisation is byte-exact by construction: parsing captures the
//! signed bytes verbatim and encoding replays them.

pub mod attrs;
pub mod database;
pub mod keys;
pub mod types;

pub use attrs::AttributeConstraints;
pub use database::{Batch, Database};
pub use keys::{KeyPair, PublicKey};
pub use types::AssertionType;

use crate::{Error, Result};
use serde_json::{Map, Value};

/// A parsed, signed statement
#[derive(Debug, Clone)]
pub struct Assertion {
    atype: &'static AssertionType,
    headers: Map<String, Value>,
    body: Option<Vec<u8>>,
    signature: String,
    /// Exact bytes covered by the signature
    signed: Vec<u8>,
}

impl Assertion {
    /// Parse one assertion from the front of `text`, returning it and the
    /// number of bytes consumed (including the trailing separator).
    pub fn parse(text: &str) -> Result<(Assertion, usize)> {
        let header_end = text
            .find("\n\n")
            .ok_or_else(|| Error::AssertParse("missing header/body separator".to_string()))?;
        let header_block = &text[..header_end];
        let headers = parse_headers(header_block)?;

        let type_name = header_string(&headers, "type")
            .ok_or_else(|| Error::AssertParse("assertion has no type header".to_string()))?;
        let atype = types::type_by_name(&type_name)
            .ok_or_else(|| Error::AssertUnknownType(type_name.clone()))?;

        let body_length: usize = match header_string(&headers, "body-length") {
            Some(s) => s
                .parse()
                .map_err(|_| Error::AssertParse(format!("invalid body-length {:?}", s)))?,
            None => 0,
        };

        let mut cursor = header_end + 2;
        let body = if body_length > 0 {
            if text.len() < cursor + body_length || !text.is_char_boundary(cursor + body_length) {
                return Err(Error::AssertParse("body shorter than body-length".to_string()));
            }
            let body = text[cursor..cursor + body_length].as_bytes().to_vec();
            cursor += body_length;
            if !text[cursor..].starts_with("\n\n") {
                return Err(Error::AssertParse("missing body/signature separator".to_string()));
            }
            cursor += 2;
            Some(body)
        } else {
            None
        };

        let signed_end = cursor - 2;
        let signed = text[..signed_end].as_bytes().to_vec();

        let rest = &text[cursor..];
        let sig_end = rest.find("\n\n").unwrap_or(rest.len());
        let signature = rest[..sig_end].trim().to_string();
        if signature.is_empty() {
            return Err(Error::AssertParse("assertion has no signature".to_string()));
        }
        let consumed = cursor + sig_end + if sig_end < rest.len() { 2 } else { 0 };

        for name in ["authority-id", "sign-key-id"] {
            if header_string(&headers, name).map_or(true, |v| v.is_empty()) {
                return Err(Error::AssertParse(format!("{:?} header is mandatory", name)));
            }
        }
        if let Some(rev) = headers.get("revision") {
            let ok = rev
                .as_str()
                .map_or(false, |s| s.parse::<i64>().map_or(false, |n| n >= 0));
            if !ok {
                return Err(Error::AssertParse(format!("invalid revision: {}", rev)));
            }
        }
        for name in atype.mandatory.iter().copied().chain(atype.primary_key.iter().copied()) {
            if header_string(&headers, name).map_or(true, |v| v.is_empty()) {
                return Err(Error::AssertParse(format!(
                    "{:?} header is mandatory for {} assertions",
                    name, atype.name
                )));
            }
        }

        let assertion = Assertion {
            atype,
            headers,
            body,
            signature,
            signed,
        };
        (atype.assemble)(&assertion)?;
        Ok((assertion, consumed))
    }

    /// Parse a stream of assertions separated by blank lines
    pub fn parse_stream(data: &[u8]) -> Result<Vec<Assertion>> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::AssertParse("assertion stream is not UTF-8".to_string()))?;
        let mut out = Vec::new();
        let mut rest = text;
        loop {
            let trimmed = rest.trim_start_matches('\n');
            if trimmed.trim().is_empty() {
                break;
            }
            let (assertion, consumed) = Assertion::parse(trimmed)?;
            out.push(assertion);
            rest = &trimmed[consumed..];
        }
        Ok(out)
    }

    /// Build and sign an assertion. Headers are serialized in map order;
    /// `sign-key-id` and `body-length` are filled in.
    pub fn sign(
        mut headers: Map<String, Value>,
        body: Option<Vec<u8>>,
        signer: &KeyPair,
    ) -> Result<Assertion> {
        headers.insert(
            "sign-key-id".to_string(),
            Value::String(signer.public_key().id().to_string()),
        );
        if let Some(body) = &body {
            headers.insert(
                "body-length".to_string(),
                Value::String(body.len().to_string()),
            );
        }

        let mut signed = encode_headers(&headers)?.into_bytes();
        if let Some(body) = &body {
            signed.extend_from_slice(b"\n\n");
            signed.extend_from_slice(body);
        }
        let signature = signer.sign(&signed);

        // the wire form is textual; a non-UTF-8 body cannot be framed
        let signed_text = String::from_utf8(signed)
            .map_err(|_| Error::AssertParse("assertion body is not UTF-8".to_string()))?;
        let text = format!("{}\n\n{}", signed_text, signature);
        let (assertion, _) = Assertion::parse(&text)?;
        Ok(assertion)
    }

    /// The canonical wire encoding
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.signed.clone();
        out.extend_from_slice(b"\n\n");
        out.extend_from_slice(self.signature.as_bytes());
        out.push(b'\n');
        out
    }

    pub fn assertion_type(&self) -> &'static AssertionType {
        self.atype
    }

    pub fn type_name(&self) -> &'static str {
        self.atype.name
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    /// Header value as a string, if it is one
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.as_str())
    }

    /// Header value as a list of strings
    pub fn header_list(&self, name: &str) -> Option<Vec<String>> {
        let list = self.headers.get(name)?.as_array()?;
        list.iter()
            .map(|v| v.as_str().map(|s| s.to_string()))
            .collect()
    }

    pub fn headers(&self) -> &Map<String, Value> {
        &self.headers
    }

    pub fn authority_id(&self) -> &str {
        self.header_str("authority-id").unwrap_or_default()
    }

    pub fn sign_key_id(&self) -> &str {
        self.header_str("sign-key-id").unwrap_or_default()
    }

    /// Revision for the regression rule; defaults to 0
    pub fn revision(&self) -> i64 {
        self.header_str("revision")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Bytes covered by the signature
    pub fn signed_content(&self) -> &[u8] {
        &self.signed
    }

    /// Primary-key tuple identifying this assertion within its type
    pub fn primary_key(&self) -> Vec<String> {
        self.atype
            .primary_key
            .iter()
            .map(|h| self.header_str(h).unwrap_or_default().to_string())
            .collect()
    }
}

fn header_string(headers: &Map<String, Value>, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.as_str()).map(String::from)
}

// ---------------------------------------------------------------------------
// Header block grammar

const INDENT: usize = 2;

fn parse_headers(block: &str) -> Result<Map<String, Value>> {
    let lines: Vec<&str> = block.lines().collect();
    let mut pos = 0;
    let map = parse_map(&lines, &mut pos, 0)?;
    if pos != lines.len() {
        return Err(Error::AssertParse(format!(
            "unexpected header line {:?}",
            lines[pos]
        )));
    }
    if map.is_empty() {
        return Err(Error::AssertParse("empty header block".to_string()));
    }
    Ok(map)
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

fn parse_map(lines: &[&str], pos: &mut usize, level: usize) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    while *pos < lines.len() {
        let line = lines[*pos];
        let indent = indent_of(line);
        if indent < level * INDENT {
            break;
        }
        if indent != level * INDENT {
            return Err(Error::AssertParse(format!("bad indentation in {:?}", line)));
        }
        let content = &line[indent..];
        if content.starts_with('-') {
            break;
        }
        let colon = content
            .find(':')
            .ok_or_else(|| Error::AssertParse(format!("header line {:?} has no colon", line)))?;
        let key = content[..colon].to_string();
        let rest = &content[colon + 1..];
        *pos += 1;

        let value = if rest.is_empty() {
            parse_nested(lines, pos, level + 1)?
        } else if let Some(text) = rest.strip_prefix(' ') {
            Value::String(text.to_string())
        } else {
            return Err(Error::AssertParse(format!(
                "header line {:?} missing space after colon",
                line
            )));
        };
        if map.insert(key.clone(), value).is_some() {
            return Err(Error::AssertParse(format!("repeated header {:?}", key)));
        }
    }
    Ok(map)
}

fn parse_nested(lines: &[&str], pos: &mut usize, level: usize) -> Result<Value> {
    if *pos >= lines.len() {
        return Err(Error::AssertParse("header block ends mid-entry".to_string()));
    }
    let line = lines[*pos];
    if indent_of(line) != level * INDENT {
        return Err(Error::AssertParse(format!(
            "expected nested entry, got {:?}",
            line
        )));
    }
    if line[level * INDENT..].starts_with('-') {
        parse_list(lines, pos, level)
    } else {
        Ok(Value::Object(parse_map(lines, pos, level)?))
    }
}

fn parse_list(lines: &[&str], pos: &mut usize, level: usize) -> Result<Value> {
    let mut items = Vec::new();
    while *pos < lines.len() {
        let line = lines[*pos];
        if indent_of(line) != level * INDENT {
            break;
        }
        let content = &line[level * INDENT..];
        if let Some(text) = content.strip_prefix("- ") {
            items.push(Value::String(text.to_string()));
            *pos += 1;
        } else if content == "-" {
            *pos += 1;
            items.push(parse_nested(lines, pos, level + 1)?);
        } else {
            break;
        }
    }
    Ok(Value::Array(items))
}

/// Render a header map in its canonical line form
pub fn encode_headers(headers: &Map<String, Value>) -> Result<String> {
    let mut out = String::new();
    encode_map(headers, 0, &mut out)?;
    // drop the trailing newline; the separator supplies it
    if out.ends_with('\n') {
        out.pop();
    }
    Ok(out)
}

fn encode_map(map: &Map<String, Value>, level: usize, out: &mut String) -> Result<()> {
    for (key, value) in map {
        out.push_str(&" ".repeat(level * INDENT));
        out.push_str(key);
        out.push(':');
        match value {
            Value::String(s) => {
                out.push(' ');
                out.push_str(s);
                out.push('\n');
            }
            Value::Object(nested) => {
                out.push('\n');
                encode_map(nested, level + 1, out)?;
            }
            Value::Array(items) => {
                out.push('\n');
                encode_list(items, level + 1, out)?;
            }
            other => {
                return Err(Error::AssertParse(format!(
                    "header {:?} has unsupported value {}",
                    key, other
                )));
            }
        }
    }
    Ok(())
}

fn encode_list(items: &[Value], level: usize, out: &mut String) -> Result<()> {
    for item in items {
        out.push_str(&" ".repeat(level * INDENT));
        match item {
            Value::String(s) => {
                out.push_str("- ");
                out.push_str(s);
                out.push('\n');
            }
            Value::Object(nested) => {
                out.push_str("-\n");
                encode_map(nested, level + 1, out)?;
            }
            Value::Array(nested) => {
                out.push_str("-\n");
                encode_list(nested, level + 1, out)?;
            }
            other => {
                return Err(Error::AssertParse(format!(
                    "list entry has unsupported value {}",
                    other
                )));
            }
        }
    }
    Ok(())
}
