// src/daemon/response.rs

//! Response envelope
//!
//! Every JSON reply has the same shape: type (sync, async or error), the
//! HTTP status text and code, a result payload, and for async replies the
//! id of the change to poll. Responses are one tagged variant with a
//! single render path, not a hierarchy.

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;

/// Machine-readable error discriminators for the user-facing flows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    InvalidAuthData,
    TwoFactorRequired,
    TwoFactorFailed,
    TermsNotAccepted,
    NoPaymentMethods,
    LoginRequired,
}

/// Error payload carried in the envelope's result field
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResult {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Metadata attached to sync responses
#[derive(Debug, Clone, Default)]
pub struct Meta {
    pub sources: Option<Vec<String>>,
    pub suggested_currency: Option<String>,
}

/// A rendered API response
#[derive(Debug)]
pub enum Response {
    Sync {
        status: u16,
        result: Value,
        meta: Meta,
    },
    Async {
        change: String,
    },
    Error {
        status: u16,
        result: ErrorResult,
    },
    /// Raw file contents (icons)
    File {
        path: PathBuf,
    },
    /// An assertion bundle in wire encoding
    Assertions {
        bundle: Vec<Vec<u8>>,
    },
}

/// A 200 sync response
pub fn sync_response<T: Serialize>(result: T) -> Response {
    sync_response_meta(result, Meta::default())
}

/// A sync response with metadata
pub fn sync_response_meta<T: Serialize>(result: T, meta: Meta) -> Response {
    Response::Sync {
        status: 200,
        result: serde_json::to_value(result).unwrap_or(Value::Null),
        meta,
    }
}

/// A 202 async response pointing at a change
pub fn async_response(change_id: &str) -> Response {
    Response::Async {
        change: change_id.to_string(),
    }
}

/// An error envelope with just a message
pub fn error_response(status: u16, message: impl Into<String>) -> Response {
    Response::Error {
        status,
        result: ErrorResult {
            message: message.into(),
            kind: None,
            value: None,
        },
    }
}

/// An error envelope with a machine-readable kind
pub fn error_response_kind(
    status: u16,
    kind: ErrorKind,
    message: impl Into<String>,
    value: Option<Value>,
) -> Response {
    Response::Error {
        status,
        result: ErrorResult {
            message: message.into(),
            kind: Some(kind),
            value,
        },
    }
}

pub fn bad_request(message: impl Into<String>) -> Response {
    error_response(400, message)
}

pub fn unauthorized(message: impl Into<String>) -> Response {
    error_response(401, message)
}

pub fn forbidden(message: impl Into<String>) -> Response {
    error_response(403, message)
}

pub fn not_found(message: impl Into<String>) -> Response {
    error_response(404, message)
}

pub fn method_not_allowed() -> Response {
    error_response(405, "method not allowed")
}

pub fn conflict(message: impl Into<String>) -> Response {
    error_response(409, message)
}

pub fn internal_error(message: impl Into<String>) -> Response {
    error_response(500, message)
}

pub fn not_implemented(message: impl Into<String>) -> Response {
    error_response(501, message)
}

/// Canonical reason phrase for the status codes the API uses
pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        _ => "",
    }
}

fn envelope(rtype: &str, status: u16, result: Value, change: Option<&str>, meta: &Meta) -> Value {
    let mut body = json!({
        "type": rtype,
        "status": status_text(status),
        "status_code": status,
        "result": result,
    });
    if let Some(change) = change {
        body["change"] = json!(change);
    }
    if let Some(sources) = &meta.sources {
        body["sources"] = json!(sources);
    }
    if let Some(currency) = &meta.suggested_currency {
        body["suggested-currency"] = json!(currency);
    }
    body
}

impl IntoResponse for Response {
    fn into_response(self) -> axum::response::Response {
        match self {
            Response::Sync {
                status,
                result,
                meta,
            } => json_body(status, envelope("sync", status, result, None, &meta)),
            Response::Async { change } => json_body(
                202,
                envelope("async", 202, Value::Null, Some(&change), &Meta::default()),
            ),
            Response::Error { status, result } => {
                let result = serde_json::to_value(&result).unwrap_or(Value::Null);
                json_body(status, envelope("error", status, result, None, &Meta::default()))
            }
            Response::File { path } => match std::fs::read(&path) {
                Ok(bytes) => (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/octet-stream")],
                    bytes,
                )
                    .into_response(),
                Err(_) => not_found(format!("cannot read {:?}", path)).into_response(),
            },
            Response::Assertions { bundle } => {
                let count = bundle.len().to_string();
                let mut body = Vec::new();
                for (i, assertion) in bundle.iter().enumerate() {
                    if i > 0 {
                        body.push(b'\n');
                    }
                    body.extend_from_slice(assertion);
                }
                (
                    StatusCode::OK,
                    [
                        (header::CONTENT_TYPE, "application/x.snapd.assertion; bundle=y"),
                        (
                            header::HeaderName::from_static("x-assertions-count"),
                            count.as_str(),
                        ),
                    ],
                    body,
                )
                    .into_response()
            }
        }
    }
}

fn json_body(status: u16, body: Value) -> axum::response::Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_of(response: Response) -> (u16, Value) {
        match response {
            Response::Sync {
                status,
                result,
                meta,
            } => (status, envelope("sync", status, result, None, &meta)),
            Response::Async { change } => (
                202,
                envelope("async", 202, Value::Null, Some(&change), &Meta::default()),
            ),
            Response::Error { status, result } => (
                status,
                envelope(
                    "error",
                    status,
                    serde_json::to_value(&result).unwrap(),
                    None,
                    &Meta::default(),
                ),
            ),
            other => panic!("not an envelope response: {:?}", other),
        }
    }

    #[test]
    fn test_sync_envelope() {
        let (status, body) = body_of(sync_response(json!({"series": "16"})));
        assert_eq!(status, 200);
        assert_eq!(body["type"], "sync");
        assert_eq!(body["status"], "OK");
        assert_eq!(body["status_code"], 200);
        assert_eq!(body["result"]["series"], "16");
    }

    #[test]
    fn test_async_envelope() {
        let (status, body) = body_of(async_response("42"));
        assert_eq!(status, 202);
        assert_eq!(body["type"], "async");
        assert_eq!(body["status"], "Accepted");
        assert_eq!(body["change"], "42");
    }

    #[test]
    fn test_error_kind_envelope() {
        let (status, body) = body_of(error_response_kind(
            400,
            ErrorKind::InvalidAuthData,
            "please use a valid email address.",
            Some(json!({"email": ["invalid"]})),
        ));
        assert_eq!(status, 400);
        assert_eq!(body["result"]["kind"], "invalid-auth-data");
        assert_eq!(body["result"]["value"]["email"][0], "invalid");
    }

    #[test]
    fn test_meta_fields() {
        let meta = Meta {
            sources: Some(vec!["store".to_string()]),
            suggested_currency: Some("GBP".to_string()),
        };
        let (_, body) = body_of(sync_response_meta(json!([]), meta));
        assert_eq!(body["sources"][0], "store");
        assert_eq!(body["suggested-currency"], "GBP");
    }
}
