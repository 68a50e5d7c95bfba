//! Error types and JSON error responses for the management API

use crate::proxy::ProxyState;
use crate::service::Protocol;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::net::SocketAddr;
use thiserror::Error;

/// Failure to obtain a backend set from the discovery source
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("label selector is empty")]
    EmptySelector,

    #[error("discovery request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("discovery source returned status {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("malformed discovery payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Failure to reach a backend for one connection
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to connect to backend {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to backend {addr}")]
    DialTimeout { addr: String },
}

/// Lifecycle errors of a single service proxy
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol {0} is not supported")]
    UnsupportedProtocol(Protocol),

    #[error("cannot {op} proxy in state {state}")]
    InvalidState { op: &'static str, state: ProxyState },
}

/// Outcomes of registry operations other than success
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("service {0} already exists")]
    AlreadyExists(String),

    #[error("service {0} not found")]
    NotFound(String),

    #[error("invalid service spec: {0}")]
    InvalidSpec(String),

    #[error("failed to start service {id}: {source}")]
    Start {
        id: String,
        #[source]
        source: ProxyError,
    },

    #[error("failed to stop service {id}: {source}")]
    Stop {
        id: String,
        #[source]
        source: ProxyError,
    },

    #[error("failed to refresh service {id}: {source}")]
    Refresh {
        id: String,
        #[source]
        source: DiscoveryError,
    },

    #[error("stop task for service {id} failed: {source}")]
    StopTask {
        id: String,
        #[source]
        source: tokio::task::JoinError,
    },
}

impl RegistryError {
    /// Map to the error code reported by the management API
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            RegistryError::NotFound(_) => ErrorCode::NotFound,
            RegistryError::InvalidSpec(_) => ErrorCode::InvalidSpec,
            RegistryError::Refresh { .. } => ErrorCode::DiscoveryFailed,
            RegistryError::StopTask { .. } => ErrorCode::InternalError,
            RegistryError::Start { source, .. } | RegistryError::Stop { source, .. } => {
                match source {
                    // The selector comes from the caller
                    ProxyError::Discovery(DiscoveryError::EmptySelector) => ErrorCode::InvalidSpec,
                    ProxyError::Discovery(_) => ErrorCode::DiscoveryFailed,
                    ProxyError::Bind { .. } => ErrorCode::BindFailed,
                    ProxyError::UnsupportedProtocol(_) => ErrorCode::UnsupportedProtocol,
                    ProxyError::InvalidState { .. } => ErrorCode::InternalError,
                }
            }
        }
    }
}

/// Error codes for management API errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A service with the same id is registered
    AlreadyExists,
    /// No service with that id, or unknown route
    NotFound,
    /// Request body is not a valid service spec
    InvalidSpec,
    /// Discovery source unreachable or returned garbage
    DiscoveryFailed,
    /// Listener could not be created
    BindFailed,
    /// Protocol other than tcp requested
    UnsupportedProtocol,
    /// Missing or wrong bearer token
    Unauthorized,
    /// Anything else
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::AlreadyExists => StatusCode::CONFLICT,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InvalidSpec => StatusCode::BAD_REQUEST,
            ErrorCode::DiscoveryFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::BindFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::UnsupportedProtocol => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidSpec => "INVALID_SPEC",
            ErrorCode::DiscoveryFailed => "DISCOVERY_FAILED",
            ErrorCode::BindFailed => "BIND_FAILED",
            ErrorCode::UnsupportedProtocol => "UNSUPPORTED_PROTOCOL",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);
    Response::builder()
        .status(code.status_code())
        .header("content-type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}
