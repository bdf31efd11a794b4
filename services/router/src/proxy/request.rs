//! Request classification and header rewriting.

use std::net::SocketAddr;

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request};

use crate::registry::normalize_host;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Headers that describe a single hop and are never forwarded as-is.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

/// Protocol requested by an `Upgrade` handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeProtocol {
    WebSocket,
    Tcp,
}

impl UpgradeProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradeProtocol::WebSocket => "websocket",
            UpgradeProtocol::Tcp => "tcp",
        }
    }
}

/// How the dispatcher treats an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Load-balancer probe answered by the router itself.
    HealthCheck,
    Upgrade(UpgradeProtocol),
    Plain,
}

/// Scheme of the listener a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

pub fn classify<B>(req: &Request<B>, health_check_user_agent: &str) -> RequestKind {
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok());
    if user_agent == Some(health_check_user_agent) {
        return RequestKind::HealthCheck;
    }

    match upgrade_protocol(req.headers()) {
        Some(protocol) => RequestKind::Upgrade(protocol),
        None => RequestKind::Plain,
    }
}

fn upgrade_protocol(headers: &HeaderMap) -> Option<UpgradeProtocol> {
    let wants_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !wants_upgrade {
        return None;
    }

    let protocol = headers.get(header::UPGRADE)?.to_str().ok()?.trim();
    if protocol.eq_ignore_ascii_case("websocket") {
        Some(UpgradeProtocol::WebSocket)
    } else if protocol.eq_ignore_ascii_case("tcp") {
        Some(UpgradeProtocol::Tcp)
    } else {
        None
    }
}

/// Normalized routing host: the `Host` header, else the URI authority.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = match req.headers().get(header::HOST) {
        Some(value) => value.to_str().ok()?.to_string(),
        None => req.uri().authority()?.as_str().to_string(),
    };
    normalize_host(&raw)
}

/// Value of the affinity cookie, if present and non-empty.
pub fn affinity_id(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

/// Drop hop-by-hop headers, including any named in `Connection`.
///
/// With `keep_upgrade` the `Connection` and `Upgrade` headers survive, as an
/// upgrade handshake needs them end to end.
pub fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .filter(|name| !(keep_upgrade && *name == header::UPGRADE))
        .collect();
    for name in named {
        headers.remove(&name);
    }

    for name in HOP_BY_HOP.iter() {
        if keep_upgrade && *name == header::CONNECTION {
            continue;
        }
        headers.remove(name);
    }
    if !keep_upgrade {
        headers.remove(header::UPGRADE);
    }
}

/// Append the client to `X-Forwarded-For` and set proto and request id.
pub fn add_forwarding_headers(
    headers: &mut HeaderMap,
    peer: SocketAddr,
    scheme: Scheme,
    request_id: &str,
) {
    let client_ip = peer.ip().to_string();
    let forwarded_for = match headers
        .get(&X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) if !existing.trim().is_empty() => format!("{existing}, {client_ip}"),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if !headers.contains_key(&X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme.as_str()));
    }

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
}

/// Framing the router cannot relay safely: conflicting `Content-Length`
/// values, or `Content-Length` together with `Transfer-Encoding`.
pub fn has_conflicting_framing(headers: &HeaderMap) -> bool {
    let lengths: Vec<&[u8]> = headers
        .get_all(header::CONTENT_LENGTH)
        .iter()
        .map(|v| v.as_bytes())
        .collect();

    if lengths.windows(2).any(|pair| pair[0] != pair[1]) {
        return true;
    }
    !lengths.is_empty() && headers.contains_key(header::TRANSFER_ENCODING)
}

/// Methods safe to retry on a different endpoint.
pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
    )
}
