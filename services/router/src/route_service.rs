//! Route service request signing.
//!
//! A request for a route bound to a route service is first sent to that
//! service with two extra headers: the URL the client asked for and a
//! signature over it. When the service sends the request back through the
//! router, the signature proves the request already passed the service and
//! is forwarded to the application instead of looping.
//!
//! Signature format: `<unix-seconds>.<base64url(HMAC-SHA256(secret, "<unix-seconds>\n<url>"))>`.
//! Verification accepts the current secret and, during rotation, the
//! previous one.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::registry::normalize_host;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-route-service-signature";
pub const FORWARDED_URL_HEADER: &str = "x-route-service-forwarded-url";

/// Clock skew tolerated for signatures dated in the future.
const MAX_FUTURE_SKEW: Duration = Duration::from_secs(30);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// Route services are disabled: no signing secret is configured.
    #[error("route services are not enabled")]
    Disabled,

    /// The forwarded URL header is absent.
    #[error("missing forwarded URL header")]
    MissingForwardedUrl,

    /// The header does not have the `<seconds>.<mac>` shape.
    #[error("malformed signature")]
    Malformed,

    /// The signature is older than the route service timeout.
    #[error("signature expired")]
    Expired,

    /// The signed URL targets a different host than the request.
    #[error("forwarded URL does not match request host {0}")]
    HostMismatch(String),

    /// Neither the current nor the previous secret produced this MAC.
    #[error("signature does not verify")]
    InvalidMac,
}

#[derive(Clone)]
pub struct RouteServiceSigner {
    current: Option<Vec<u8>>,
    previous: Option<Vec<u8>>,
    timeout: Duration,
}

impl std::fmt::Debug for RouteServiceSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteServiceSigner")
            .field("enabled", &self.enabled())
            .field("has_previous", &self.previous.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RouteServiceSigner {
    pub fn new(current: Option<String>, previous: Option<String>, timeout: Duration) -> Self {
        let secret = |s: Option<String>| s.filter(|s| !s.is_empty()).map(String::into_bytes);
        Self {
            current: secret(current),
            previous: secret(previous),
            timeout,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, None, Duration::ZERO)
    }

    pub fn enabled(&self) -> bool {
        self.current.is_some()
    }

    /// Signature header value for `forwarded_url` at `now`.
    pub fn sign(&self, forwarded_url: &str, now: SystemTime) -> Result<String, SignatureError> {
        let secret = self.current.as_deref().ok_or(SignatureError::Disabled)?;
        let timestamp = unix_seconds(now);
        let mac = compute_mac(secret, timestamp, forwarded_url)?;
        Ok(format!("{timestamp}.{}", URL_SAFE_NO_PAD.encode(mac)))
    }

    /// Check a returning request's signature.
    ///
    /// `request_host` is the normalized host the returning request was
    /// routed on; the signed URL must name the same host.
    pub fn verify(
        &self,
        signature: &str,
        forwarded_url: Option<&str>,
        request_host: &str,
        now: SystemTime,
    ) -> Result<(), SignatureError> {
        let current = self.current.as_deref().ok_or(SignatureError::Disabled)?;
        let forwarded_url = forwarded_url.ok_or(SignatureError::MissingForwardedUrl)?;

        let (timestamp, encoded) = signature
            .trim()
            .split_once('.')
            .ok_or(SignatureError::Malformed)?;
        let timestamp: u64 = timestamp.parse().map_err(|_| SignatureError::Malformed)?;
        let provided = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| SignatureError::Malformed)?;

        let now_secs = unix_seconds(now);
        if timestamp > now_secs + MAX_FUTURE_SKEW.as_secs() {
            return Err(SignatureError::Malformed);
        }
        if now_secs.saturating_sub(timestamp) > self.timeout.as_secs() {
            return Err(SignatureError::Expired);
        }

        let signed_host = url_host(forwarded_url).ok_or(SignatureError::Malformed)?;
        if signed_host != request_host {
            return Err(SignatureError::HostMismatch(request_host.to_string()));
        }

        let secrets = std::iter::once(current).chain(self.previous.as_deref());
        for secret in secrets {
            let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::InvalidMac)?;
            mac.update(&message(timestamp, forwarded_url));
            if mac.verify_slice(&provided).is_ok() {
                return Ok(());
            }
        }
        Err(SignatureError::InvalidMac)
    }
}

fn compute_mac(secret: &[u8], timestamp: u64, url: &str) -> Result<Vec<u8>, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::InvalidMac)?;
    mac.update(&message(timestamp, url));
    Ok(mac.finalize().into_bytes().to_vec())
}

fn message(timestamp: u64, url: &str) -> Vec<u8> {
    format!("{timestamp}\n{url}").into_bytes()
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Normalized host of an absolute URL.
fn url_host(url: &str) -> Option<String> {
    let uri: http::Uri = url.parse().ok()?;
    normalize_host(uri.authority()?.as_str())
}
