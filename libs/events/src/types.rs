//! Bus message definitions.
//!
//! Registration messages are published by backend instances on a heartbeat
//! interval. A router treats every `router.register` as "this endpoint is
//! alive right now" and every `router.unregister` as an immediate removal.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Subjects
// =============================================================================

/// All subject names as constants.
pub mod subjects {
    pub const REGISTER: &str = "router.register";
    pub const UNREGISTER: &str = "router.unregister";
    pub const GREET: &str = "router.greet";
    pub const START: &str = "router.start";
}

// =============================================================================
// Registration
// =============================================================================

/// Payload of `router.register` and `router.unregister`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryMessage {
    pub host: String,
    pub port: u16,
    /// Port serving TLS, when the instance expects TLS from the router.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_port: Option<u16>,
    pub uris: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub private_instance_id: String,
    /// Name expected in the backend's certificate when `tls_port` is used.
    #[serde(default)]
    pub server_cert_domain_san: String,
    #[serde(default)]
    pub stale_threshold_in_seconds: u64,
    #[serde(default)]
    pub route_service_url: String,
    #[serde(default)]
    pub isolation_segment: String,
    /// Publisher wall-clock time of this heartbeat, nanoseconds since epoch.
    #[serde(default, alias = "endpoint_updated_at_ns")]
    pub updated_at_ns: i64,
}

impl RegistryMessage {
    /// Decode and validate a message body.
    pub fn from_slice(payload: &[u8]) -> Result<Self, EventError> {
        let message: RegistryMessage = serde_json::from_slice(payload)?;
        message.validate()?;
        Ok(message)
    }

    /// Check the fields a registration needs to be routable.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.host.trim().is_empty() {
            return Err(EventError::InvalidPayload("host is empty".to_string()));
        }
        if self.port == 0 && self.tls_port.unwrap_or(0) == 0 {
            return Err(EventError::InvalidPayload("port is zero".to_string()));
        }
        if self.uris.iter().all(|u| u.trim().is_empty()) {
            return Err(EventError::InvalidPayload("no uris".to_string()));
        }
        Ok(())
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, EventError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Per-endpoint stale threshold override, if the publisher set one.
    pub fn stale_threshold(&self) -> Option<Duration> {
        match self.stale_threshold_in_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn route_service_url(&self) -> Option<&str> {
        non_empty(&self.route_service_url)
    }

    pub fn isolation_segment(&self) -> Option<&str> {
        non_empty(&self.isolation_segment)
    }

    pub fn private_instance_id(&self) -> Option<&str> {
        non_empty(&self.private_instance_id)
    }

    pub fn server_cert_domain_san(&self) -> Option<&str> {
        non_empty(&self.server_cert_domain_san)
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

// =============================================================================
// Greeting
// =============================================================================

/// Which registrations a router keeps in its routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShardingMode {
    /// Every registration.
    #[default]
    #[serde(rename = "all")]
    All,
    /// Only registrations tagged with one of the router's isolation segments.
    #[serde(rename = "segments")]
    Segments,
    /// Untagged registrations plus the router's isolation segments.
    #[serde(rename = "shared-and-segments")]
    SharedAndSegments,
}

impl ShardingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardingMode::All => "all",
            ShardingMode::Segments => "segments",
            ShardingMode::SharedAndSegments => "shared-and-segments",
        }
    }

    /// Whether a registration with the given isolation segment belongs in
    /// this router's table.
    pub fn accepts(&self, segment: Option<&str>, router_segments: &[String]) -> bool {
        match (self, segment) {
            (ShardingMode::All, _) => true,
            (ShardingMode::Segments, None) => false,
            (ShardingMode::SharedAndSegments, None) => true,
            (_, Some(seg)) => router_segments.iter().any(|s| s == seg),
        }
    }
}

impl fmt::Display for ShardingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShardingMode {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "all" => Ok(ShardingMode::All),
            "segments" => Ok(ShardingMode::Segments),
            "shared-and-segments" => Ok(ShardingMode::SharedAndSegments),
            other => Err(EventError::UnknownShardingMode(other.to_string())),
        }
    }
}

/// Router identity, answered to `router.greet` and announced on `router.start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterGreeting {
    pub id: String,
    pub hosts: Vec<String>,
    #[serde(default)]
    pub isolation_segments: Vec<String>,
    #[serde(default)]
    pub routing_table_sharding_mode: ShardingMode,
    #[serde(rename = "minimumRegisterIntervalInSeconds")]
    pub minimum_register_interval_secs: u64,
    #[serde(rename = "pruneThresholdInSeconds")]
    pub prune_threshold_secs: u64,
}

impl RouterGreeting {
    pub fn to_vec(&self) -> Result<Vec<u8>, EventError> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_registry_message_defaults() {
        let raw = br#"{"host":"10.0.0.1","port":8080,"uris":["demo.example.test"]}"#;
        let msg = RegistryMessage::from_slice(raw).unwrap();

        assert_eq!(msg.host, "10.0.0.1");
        assert_eq!(msg.port, 8080);
        assert!(msg.tags.is_empty());
        assert!(msg.stale_threshold().is_none());
        assert!(msg.route_service_url().is_none());
        assert!(msg.isolation_segment().is_none());
        assert_eq!(msg.updated_at_ns, 0);
    }

    #[test]
    fn test_registry_message_full_payload() {
        let raw = br#"{
            "host": "10.0.0.2",
            "port": 61001,
            "tls_port": 61002,
            "uris": ["a.example.test", "b.example.test/api"],
            "tags": {"component": "web"},
            "app": "app-guid",
            "private_instance_id": "inst-1",
            "server_cert_domain_san": "inst-1.internal",
            "stale_threshold_in_seconds": 30,
            "route_service_url": "https://rs.example.test",
            "isolation_segment": "is1",
            "endpoint_updated_at_ns": 1700000000000000000
        }"#;
        let msg = RegistryMessage::from_slice(raw).unwrap();

        assert_eq!(msg.tls_port, Some(61002));
        assert_eq!(msg.uris.len(), 2);
        assert_eq!(msg.tags.get("component").map(String::as_str), Some("web"));
        assert_eq!(msg.stale_threshold(), Some(Duration::from_secs(30)));
        assert_eq!(msg.route_service_url(), Some("https://rs.example.test"));
        assert_eq!(msg.isolation_segment(), Some("is1"));
        assert_eq!(msg.private_instance_id(), Some("inst-1"));
        assert_eq!(msg.server_cert_domain_san(), Some("inst-1.internal"));
        assert_eq!(msg.updated_at_ns, 1_700_000_000_000_000_000);
    }

    #[test]
    fn test_registry_message_rejects_missing_host() {
        let raw = br#"{"host":"","port":8080,"uris":["demo.example.test"]}"#;
        assert!(matches!(
            RegistryMessage::from_slice(raw),
            Err(EventError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_registry_message_rejects_no_uris() {
        let raw = br#"{"host":"10.0.0.1","port":8080,"uris":[]}"#;
        assert!(matches!(
            RegistryMessage::from_slice(raw),
            Err(EventError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_registry_message_rejects_garbage() {
        assert!(matches!(
            RegistryMessage::from_slice(b"not json"),
            Err(EventError::Serialization(_))
        ));
    }

    #[test]
    fn test_sharding_mode_parse() {
        assert_eq!("all".parse::<ShardingMode>().unwrap(), ShardingMode::All);
        assert_eq!(
            "Shared-And-Segments".parse::<ShardingMode>().unwrap(),
            ShardingMode::SharedAndSegments
        );
        assert!("sometimes".parse::<ShardingMode>().is_err());
    }

    #[test]
    fn test_sharding_mode_accepts() {
        let segments = vec!["is1".to_string(), "is2".to_string()];

        assert!(ShardingMode::All.accepts(None, &segments));
        assert!(ShardingMode::All.accepts(Some("other"), &segments));

        assert!(!ShardingMode::Segments.accepts(None, &segments));
        assert!(ShardingMode::Segments.accepts(Some("is1"), &segments));
        assert!(!ShardingMode::Segments.accepts(Some("other"), &segments));

        assert!(ShardingMode::SharedAndSegments.accepts(None, &segments));
        assert!(ShardingMode::SharedAndSegments.accepts(Some("is2"), &segments));
        assert!(!ShardingMode::SharedAndSegments.accepts(Some("other"), &segments));
    }

    #[test]
    fn test_greeting_wire_names() {
        let greeting = RouterGreeting {
            id: "router-1".to_string(),
            hosts: vec!["10.0.0.9".to_string()],
            isolation_segments: vec!["is1".to_string(), "is2".to_string()],
            routing_table_sharding_mode: ShardingMode::All,
            minimum_register_interval_secs: 20,
            prune_threshold_secs: 120,
        };

        let json = String::from_utf8(greeting.to_vec().unwrap()).unwrap();
        assert!(json.contains("\"isolation_segments\":[\"is1\",\"is2\"]"));
        assert!(json.contains("\"routing_table_sharding_mode\":\"all\""));
        assert!(json.contains("\"minimumRegisterIntervalInSeconds\":20"));
        assert!(json.contains("\"pruneThresholdInSeconds\":120"));
    }

    proptest! {
        #[test]
        fn prop_stale_threshold_zero_means_unset(secs in 0u64..100_000) {
            let msg = RegistryMessage {
                host: "10.0.0.1".to_string(),
                port: 80,
                tls_port: None,
                uris: vec!["x.example.test".to_string()],
                tags: BTreeMap::new(),
                app: String::new(),
                private_instance_id: String::new(),
                server_cert_domain_san: String::new(),
                stale_threshold_in_seconds: secs,
                route_service_url: String::new(),
                isolation_segment: String::new(),
                updated_at_ns: 0,
            };
            prop_assert_eq!(msg.stale_threshold().is_none(), secs == 0);
        }
    }
}
