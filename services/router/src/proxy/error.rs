use std::io;

use http::StatusCode;
use thiserror::Error;

use crate::route_service::SignatureError;

/// Failure to obtain a usable backend connection.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("connect timed out")]
    Timeout,

    #[error("connect failed: {0}")]
    Io(#[from] io::Error),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("HTTP handshake failed: {0}")]
    Handshake(#[from] hyper::Error),
}

/// Reasons a request could not be proxied.
///
/// Each variant maps to exactly one status code returned to the client.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Missing or malformed `Host`, or an unparseable request target.
    #[error("bad request: {0}")]
    BadRequest(&'static str),

    /// No pool matches the request.
    #[error("no route registered for {0}")]
    NoRoute(String),

    /// Every attempt to connect to a backend failed.
    #[error("backend dial failed: {0}")]
    BackendDialFailure(#[source] DialError),

    /// Connecting to the backend exceeded the dial timeout.
    #[error("backend connect timed out")]
    BackendTimeout,

    /// The backend accepted the request but did not answer in time.
    #[error("backend response timed out")]
    ResponseTimeout,

    /// The backend answered with something unusable.
    #[error("upstream protocol error: {0}")]
    UpstreamProtocolError(String),

    /// The route service signature on a returning request was rejected.
    #[error("route service request rejected: {0}")]
    RouteServiceAuthFailure(#[from] SignatureError),

    /// All endpoints are at their connection cap.
    #[error("backends at connection limit")]
    NoCapacity,
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::NoRoute(_) => StatusCode::NOT_FOUND,
            DispatchError::BackendDialFailure(_) => StatusCode::BAD_GATEWAY,
            DispatchError::BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::ResponseTimeout => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::UpstreamProtocolError(_) => StatusCode::BAD_GATEWAY,
            DispatchError::RouteServiceAuthFailure(_) => StatusCode::BAD_GATEWAY,
            DispatchError::NoCapacity => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Short machine-readable name for access records.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::BadRequest(_) => "bad_request",
            DispatchError::NoRoute(_) => "no_route",
            DispatchError::BackendDialFailure(_) => "backend_dial_failure",
            DispatchError::BackendTimeout => "backend_timeout",
            DispatchError::ResponseTimeout => "response_timeout",
            DispatchError::UpstreamProtocolError(_) => "upstream_protocol_error",
            DispatchError::RouteServiceAuthFailure(_) => "route_service_auth_failure",
            DispatchError::NoCapacity => "no_capacity",
        }
    }
}

impl From<DialError> for DispatchError {
    fn from(err: DialError) -> Self {
        match err {
            DialError::Timeout => DispatchError::BackendTimeout,
            other => DispatchError::BackendDialFailure(other),
        }
    }
}
