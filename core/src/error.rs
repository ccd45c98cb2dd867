//! Structured, cross-boundary application errors.
//!
//! Every error that crosses a service boundary is an [`AppError`]: a stable
//! numeric code plus its HTTP and RPC presentations, a message, optional
//! causes and free-form metadata. Definitions ([`ErrorDef`]) live in a static
//! registry keyed by code, so the code alone is enough to rebuild the
//! protocol-specific presentation on the other side of a boundary.
//!
//! # Code ranges
//!
//! | range | owner |
//! |---|---|
//! | 0–999 | common errors |
//! | 1000–1999 | platform and messaging |
//! | 2000–2999 | sales (reserved) |
//! | 3000–3999 | core (reserved) |
//!
//! # Example
//!
//! ```
//! use relay_core::error::{self, AppError, PLATFORM_VALIDATION};
//!
//! let err = AppError::new(PLATFORM_VALIDATION)
//!     .with_metadata("field", "name")
//!     .wrap(std::io::Error::other("name is empty"));
//!
//! assert_eq!(err.code(), 1001);
//! assert_eq!(err.http_status().as_u16(), 400);
//! assert!(err.to_string().starts_with("[1001]: VALIDATION_ERROR - "));
//!
//! // The numeric code is enough to rebuild the definition elsewhere.
//! let rebuilt = error::lookup(1001).map(|e| e.http_status());
//! assert_eq!(rebuilt, Some(err.http_status()));
//! assert!(error::lookup(4242).is_none());
//! ```

use http::StatusCode;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::error::Error as StdError;
use std::fmt;

/// A boxed error usable as a cause.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Message header carrying an [`AppError`] code on broker records.
pub const ERROR_CODE_HEADER: &str = "x-error-code";

/// RPC status codes (the canonical gRPC code set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[allow(missing_docs)]
pub enum RpcStatus {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl From<RpcStatus> for i32 {
    fn from(status: RpcStatus) -> Self {
        status as Self
    }
}

impl TryFrom<i32> for RpcStatus {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Ok,
            1 => Self::Cancelled,
            2 => Self::Unknown,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            other => return Err(format!("unknown rpc status code {other}")),
        })
    }
}

/// Definition of an error and its presentation in each protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorDef {
    /// Unique code, also written to the [`ERROR_CODE_HEADER`] of broker records.
    pub code: u32,
    /// HTTP status.
    pub http: StatusCode,
    /// RPC status.
    pub rpc: RpcStatus,
    /// Default human-readable message.
    pub message: &'static str,
}

impl ErrorDef {
    /// Create a definition.
    #[must_use]
    pub const fn new(code: u32, http: StatusCode, rpc: RpcStatus, message: &'static str) -> Self {
        Self {
            code,
            http,
            rpc,
            message,
        }
    }
}

// common errors: 0-999
/// Unknown error.
pub const COMMON_UNKNOWN: ErrorDef =
    ErrorDef::new(0, StatusCode::INTERNAL_SERVER_ERROR, RpcStatus::Unknown, "UNKNOWN_ERROR");
/// Internal error.
pub const COMMON_INTERNAL: ErrorDef =
    ErrorDef::new(1, StatusCode::INTERNAL_SERVER_ERROR, RpcStatus::Internal, "INTERNAL_ERROR");
/// Timeout.
pub const COMMON_TIMEOUT: ErrorDef =
    ErrorDef::new(2, StatusCode::GATEWAY_TIMEOUT, RpcStatus::DeadlineExceeded, "TIMEOUT_ERROR");

// platform: 1000-1999
/// Request failed structural validation.
pub const PLATFORM_VALIDATION: ErrorDef =
    ErrorDef::new(1001, StatusCode::BAD_REQUEST, RpcStatus::InvalidArgument, "VALIDATION_ERROR");
/// Malformed input.
pub const PLATFORM_INVALID_FORMAT: ErrorDef =
    ErrorDef::new(1002, StatusCode::BAD_REQUEST, RpcStatus::InvalidArgument, "INVALID_FORMAT");
/// User not found.
pub const PLATFORM_USER_NOT_FOUND: ErrorDef =
    ErrorDef::new(1003, StatusCode::NOT_FOUND, RpcStatus::NotFound, "USER_NOT_FOUND");
/// User already exists.
pub const PLATFORM_USER_ALREADY_EXISTS: ErrorDef =
    ErrorDef::new(1004, StatusCode::CONFLICT, RpcStatus::AlreadyExists, "USER_ALREADY_EXISTS");
/// Missing or invalid credentials.
pub const PLATFORM_UNAUTHORIZED: ErrorDef =
    ErrorDef::new(1005, StatusCode::UNAUTHORIZED, RpcStatus::Unauthenticated, "UNAUTHORIZED");
/// Expired token.
pub const PLATFORM_TOKEN_EXPIRED: ErrorDef =
    ErrorDef::new(1006, StatusCode::UNAUTHORIZED, RpcStatus::Unauthenticated, "TOKEN_EXPIRED");
/// Database unreachable.
pub const PLATFORM_DB_CONNECTION: ErrorDef = ErrorDef::new(
    1007,
    StatusCode::SERVICE_UNAVAILABLE,
    RpcStatus::Unavailable,
    "DB_CONNECTION_ERROR",
);

// notification gateways
/// Message could not be sent.
pub const MSG_SEND_FAILED: ErrorDef =
    ErrorDef::new(1008, StatusCode::SERVICE_UNAVAILABLE, RpcStatus::Unavailable, "MSG_SEND_FAILED");
/// Gateway authentication failed.
pub const MSG_AUTH_FAILED: ErrorDef =
    ErrorDef::new(1009, StatusCode::UNAUTHORIZED, RpcStatus::Unauthenticated, "MSG_AUTH_FAILED");
/// Gateway rejected the request.
pub const MSG_INVALID_REQUEST: ErrorDef =
    ErrorDef::new(1010, StatusCode::BAD_REQUEST, RpcStatus::InvalidArgument, "MSG_INVALID_REQUEST");
/// Delivery status could not be checked.
pub const MSG_STATUS_CHECK_FAILED: ErrorDef = ErrorDef::new(
    1011,
    StatusCode::SERVICE_UNAVAILABLE,
    RpcStatus::Unavailable,
    "MSG_STATUS_CHECK_FAILED",
);
/// Gateway provider unavailable.
pub const MSG_PROVIDER_UNAVAILABLE: ErrorDef = ErrorDef::new(
    1012,
    StatusCode::SERVICE_UNAVAILABLE,
    RpcStatus::Unavailable,
    "MSG_PROVIDER_UNAVAILABLE",
);
/// Message content rejected.
pub const MSG_CONTENT_INVALID: ErrorDef =
    ErrorDef::new(1013, StatusCode::BAD_REQUEST, RpcStatus::InvalidArgument, "MSG_CONTENT_INVALID");
/// Gateway session expired.
pub const MSG_SESSION_EXPIRED: ErrorDef =
    ErrorDef::new(1014, StatusCode::UNAUTHORIZED, RpcStatus::Unauthenticated, "MSG_SESSION_EXPIRED");

const DEFINITIONS: &[ErrorDef] = &[
    COMMON_UNKNOWN,
    COMMON_INTERNAL,
    COMMON_TIMEOUT,
    PLATFORM_VALIDATION,
    PLATFORM_INVALID_FORMAT,
    PLATFORM_USER_NOT_FOUND,
    PLATFORM_USER_ALREADY_EXISTS,
    PLATFORM_UNAUTHORIZED,
    PLATFORM_TOKEN_EXPIRED,
    PLATFORM_DB_CONNECTION,
    MSG_SEND_FAILED,
    MSG_AUTH_FAILED,
    MSG_INVALID_REQUEST,
    MSG_STATUS_CHECK_FAILED,
    MSG_PROVIDER_UNAVAILABLE,
    MSG_CONTENT_INVALID,
    MSG_SESSION_EXPIRED,
];

// Keyed by each definition's own code.
static REGISTRY: Lazy<HashMap<u32, ErrorDef>> =
    Lazy::new(|| DEFINITIONS.iter().map(|def| (def.code, *def)).collect());

/// Look up the definition registered for `code`.
#[must_use]
pub fn definition(code: u32) -> Option<ErrorDef> {
    REGISTRY.get(&code).copied()
}

/// Build a fresh [`AppError`] for `code`, or `None` if the code is not registered.
#[must_use]
pub fn lookup(code: u32) -> Option<AppError> {
    definition(code).map(AppError::new)
}

/// All registered definitions, in code order.
#[must_use]
pub fn definitions() -> Vec<ErrorDef> {
    let mut defs: Vec<ErrorDef> = REGISTRY.values().copied().collect();
    defs.sort_by_key(|d| d.code);
    defs
}

/// Several causes joined into one.
#[derive(Debug)]
pub struct JoinedError {
    errors: Vec<BoxError>,
}

impl JoinedError {
    /// The joined causes, oldest first.
    pub fn errors(&self) -> impl Iterator<Item = &(dyn StdError + Send + Sync + 'static)> {
        self.errors.iter().map(AsRef::as_ref)
    }
}

impl fmt::Display for JoinedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl StdError for JoinedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.errors.first().map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

/// Structured application error.
#[derive(Debug)]
pub struct AppError {
    def: ErrorDef,
    message: String,
    cause: Option<BoxError>,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl AppError {
    /// Create an error from its definition.
    #[must_use]
    pub fn new(def: ErrorDef) -> Self {
        Self {
            def,
            message: def.message.to_string(),
            cause: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Replace the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach a cause. A second cause is joined with the first rather than replacing it.
    #[must_use]
    pub fn wrap(mut self, cause: impl Into<BoxError>) -> Self {
        let cause = cause.into();
        let combined: BoxError = match self.cause.take() {
            None => cause,
            Some(existing) => match existing.downcast::<JoinedError>() {
                Ok(mut joined) => {
                    joined.errors.push(cause);
                    joined
                }
                Err(existing) => Box::new(JoinedError {
                    errors: vec![existing, cause],
                }),
            },
        };
        self.cause = Some(combined);
        self
    }

    /// The definition this error was built from.
    #[must_use]
    pub const fn definition(&self) -> &ErrorDef {
        &self.def
    }

    /// Stable numeric code.
    #[must_use]
    pub const fn code(&self) -> u32 {
        self.def.code
    }

    /// HTTP presentation.
    #[must_use]
    pub const fn http_status(&self) -> StatusCode {
        self.def.http
    }

    /// RPC presentation.
    #[must_use]
    pub const fn rpc_status(&self) -> RpcStatus {
        self.def.rpc
    }

    /// Message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Metadata entries.
    #[must_use]
    pub const fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    /// The attached cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Whether this error or any error nested in its causes carries `def`'s code.
    #[must_use]
    pub fn is(&self, def: &ErrorDef) -> bool {
        let mut found = false;
        walk(self, &mut |err| {
            if let Some(app) = err.downcast_ref::<Self>() {
                found |= app.def.code == def.code;
            }
            found
        });
        found
    }

    /// Find the first cause of concrete type `E` anywhere in the cause tree.
    #[must_use]
    pub fn find_cause<E: StdError + 'static>(&self) -> Option<&E> {
        let mut result: Option<&E> = None;
        if let Some(cause) = self.cause.as_deref() {
            walk(cause, &mut |err| {
                if result.is_none() {
                    result = err.downcast_ref::<E>();
                }
                result.is_some()
            });
        }
        result
    }

    /// Interchange form of this error.
    #[must_use]
    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.def.code,
            http_status: self.def.http.as_u16(),
            rpc_status: self.def.rpc,
            message: self.message.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Rebuild an error received from another service.
    ///
    /// The protocol presentation comes from the local registry; the message and
    /// metadata come from the payload. Returns `None` for unregistered codes.
    #[must_use]
    pub fn from_payload(payload: ErrorPayload) -> Option<Self> {
        let mut err = lookup(payload.code)?.with_message(payload.message);
        err.metadata = payload.metadata;
        Some(err)
    }

    /// Header entry announcing this error's code on a broker record.
    #[must_use]
    pub fn header(&self) -> (String, String) {
        (ERROR_CODE_HEADER.to_string(), self.def.code.to_string())
    }

    /// Rebuild an error from the [`ERROR_CODE_HEADER`] of a record's headers.
    #[must_use]
    pub fn from_headers(headers: &HashMap<String, String>) -> Option<Self> {
        headers
            .get(ERROR_CODE_HEADER)
            .and_then(|code| code.parse().ok())
            .and_then(lookup)
    }
}

impl From<ErrorDef> for AppError {
    fn from(def: ErrorDef) -> Self {
        Self::new(def)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "[{}]: {} - {cause}", self.def.code, self.message),
            None => write!(f, "[{}]: {}", self.def.code, self.message),
        }
    }
}

impl StdError for AppError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_deref().map(|e| e as &(dyn StdError + 'static))
    }
}

/// Serializable interchange form of an [`AppError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Stable code.
    pub code: u32,
    /// HTTP status.
    pub http_status: u16,
    /// RPC status.
    pub rpc_status: RpcStatus,
    /// Message.
    pub message: String,
    /// Metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Depth-first walk over an error, its source chain and joined causes.
///
/// `visit` returns `true` to stop the walk.
fn walk<'a>(err: &'a (dyn StdError + 'static), visit: &mut dyn FnMut(&'a (dyn StdError + 'static)) -> bool) -> bool {
    if visit(err) {
        return true;
    }
    if let Some(joined) = err.downcast_ref::<JoinedError>() {
        return joined
            .errors
            .iter()
            .any(|child| walk(child.as_ref() as &(dyn StdError + 'static), visit));
    }
    err.source().is_some_and(|source| walk(source, visit))
}

/// Find the first [`AppError`] in `err`'s cause tree (including `err` itself).
#[must_use]
pub fn find_app_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a AppError> {
    let mut result: Option<&'a AppError> = None;
    walk(err, &mut |e| {
        result = e.downcast_ref::<AppError>();
        result.is_some()
    });
    result
}

/// Whether the first [`AppError`] found in `err`'s cause tree carries `def`'s code.
#[must_use]
pub fn is_error_code(err: &(dyn StdError + 'static), def: &ErrorDef) -> bool {
    find_app_error(err).is_some_and(|app| app.code() == def.code)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, thiserror::Error)]
    #[error("row not found")]
    struct RowNotFound;

    #[test]
    fn display_with_and_without_cause() {
        let plain = AppError::new(COMMON_TIMEOUT);
        assert_eq!(plain.to_string(), "[2]: TIMEOUT_ERROR");

        let wrapped = AppError::new(COMMON_TIMEOUT).wrap(RowNotFound);
        assert_eq!(wrapped.to_string(), "[2]: TIMEOUT_ERROR - row not found");
    }

    #[test]
    fn registry_is_keyed_by_each_definitions_code() {
        for def in definitions() {
            assert_eq!(definition(def.code), Some(def));
        }
        assert_eq!(definition(0).unwrap().message, "UNKNOWN_ERROR");
        assert_eq!(definition(1).unwrap().message, "INTERNAL_ERROR");
    }

    #[test]
    fn unknown_code_is_not_found() {
        assert!(lookup(999).is_none());
        assert!(definition(5000).is_none());
    }

    #[test]
    fn second_cause_is_joined() {
        let err = AppError::new(MSG_SEND_FAILED)
            .wrap(RowNotFound)
            .wrap(AppError::new(PLATFORM_DB_CONNECTION));

        assert!(err.find_cause::<RowNotFound>().is_some());
        assert!(err.is(&PLATFORM_DB_CONNECTION));
        assert!(err.is(&MSG_SEND_FAILED));
        assert!(!err.is(&PLATFORM_USER_NOT_FOUND));
    }

    #[test]
    fn nested_codes_are_found_through_many_layers() {
        let innermost = AppError::new(PLATFORM_USER_NOT_FOUND).wrap(RowNotFound);
        let middle = AppError::new(COMMON_INTERNAL).wrap(innermost);
        let outer = AppError::new(MSG_SEND_FAILED).wrap(middle);

        assert!(outer.is(&PLATFORM_USER_NOT_FOUND));
        assert!(outer.find_cause::<RowNotFound>().is_some());

        // `is_error_code` looks at the first AppError only.
        assert!(is_error_code(&outer, &MSG_SEND_FAILED));
        assert!(!is_error_code(&outer, &PLATFORM_USER_NOT_FOUND));
    }

    #[test]
    fn find_app_error_through_foreign_wrapper() {
        #[derive(Debug, thiserror::Error)]
        #[error("use case failed")]
        struct UseCase(#[source] AppError);

        let err = UseCase(AppError::new(PLATFORM_UNAUTHORIZED));
        let found = find_app_error(&err).unwrap();
        assert_eq!(found.code(), 1005);
        assert!(is_error_code(&err, &PLATFORM_UNAUTHORIZED));
    }

    #[test]
    fn payload_rebuilds_presentation_from_code() {
        let err = AppError::new(PLATFORM_TOKEN_EXPIRED)
            .with_message("token expired at noon")
            .with_metadata("user", "u-1");

        let json = serde_json::to_string(&err.payload()).unwrap();
        assert!(json.contains("\"httpStatus\":401"));
        assert!(json.contains("\"rpcStatus\":16"));

        let payload: ErrorPayload = serde_json::from_str(&json).unwrap();
        let rebuilt = AppError::from_payload(payload).unwrap();
        assert_eq!(rebuilt.code(), 1006);
        assert_eq!(rebuilt.message(), "token expired at noon");
        assert_eq!(rebuilt.rpc_status(), RpcStatus::Unauthenticated);
        assert_eq!(rebuilt.metadata()["user"], "u-1");
    }

    #[test]
    fn header_round_trip() {
        let (key, value) = AppError::new(MSG_CONTENT_INVALID).header();
        let headers = HashMap::from([(key, value)]);
        assert_eq!(AppError::from_headers(&headers).unwrap().code(), 1013);
        assert!(AppError::from_headers(&HashMap::new()).is_none());
    }

    proptest! {
        #[test]
        fn lookup_agrees_with_registry(code in 0u32..5000) {
            let registered = DEFINITIONS.iter().any(|d| d.code == code);
            prop_assert_eq!(lookup(code).is_some(), registered);
            if let Some(err) = lookup(code) {
                prop_assert_eq!(err.code(), code);
            }
        }
    }
}
