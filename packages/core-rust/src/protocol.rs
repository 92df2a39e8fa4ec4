//! Control-plane payloads of the `$SRV` introspection protocol.
//!
//! Field names follow the community convention exactly (`snake_case`,
//! `type` discriminator strings) so existing inspection tooling can read
//! the replies unmodified. Extra fields are optional and skipped when empty.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const PING_RESPONSE_TYPE: &str = "io.nats.micro.v1.ping_response";
pub const INFO_RESPONSE_TYPE: &str = "io.nats.micro.v1.info_response";
pub const STATS_RESPONSE_TYPE: &str = "io.nats.micro.v1.stats_response";
pub const CLIENT_DISCONNECT_TYPE: &str = "io.nats.server.advisory.v1.client_disconnect";

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Fields shared by every introspection reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    pub name: String,
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Transport identity of the connection an instance runs on.
///
/// Carried in info replies so monitors can correlate instances with
/// disconnect advisories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub client_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub identity: ServiceIdentity,
}

impl PingResponse {
    #[must_use]
    pub fn new(identity: ServiceIdentity) -> Self {
        Self {
            kind: PING_RESPONSE_TYPE.to_string(),
            identity,
        }
    }
}

/// Static description of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub name: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_group: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Reply to `$SRV.INFO`, and the body of every announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoResponse {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub identity: ServiceIdentity,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionInfo>,
}

impl InfoResponse {
    #[must_use]
    pub fn new(
        identity: ServiceIdentity,
        description: String,
        endpoints: Vec<EndpointInfo>,
        connection: Option<ConnectionInfo>,
    ) -> Self {
        Self {
            kind: INFO_RESPONSE_TYPE.to_string(),
            identity,
            description,
            endpoints,
            connection,
        }
    }
}

/// Live counters of one endpoint. Times are in nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub name: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_group: Option<String>,
    pub num_requests: u64,
    pub num_errors: u64,
    #[serde(default)]
    pub last_error: String,
    pub processing_time: u64,
    pub average_processing_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsResponse {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub identity: ServiceIdentity,
    pub started: DateTime<Utc>,
    #[serde(default)]
    pub endpoints: Vec<EndpointStats>,
}

impl StatsResponse {
    #[must_use]
    pub fn new(
        identity: ServiceIdentity,
        started: DateTime<Utc>,
        endpoints: Vec<EndpointStats>,
    ) -> Self {
        Self {
            kind: STATS_RESPONSE_TYPE.to_string(),
            identity,
            started,
            endpoints,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error payload sent back when a call fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub code: String,
    pub message: String,
}

impl ErrorDescriptor {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// ---------------------------------------------------------------------------
// System advisories
// ---------------------------------------------------------------------------

/// Client block of a system advisory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Advisory published on `$SYS.ACCOUNT.<account>.DISCONNECT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectAdvisory {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub client: ClientInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DisconnectAdvisory {
    #[must_use]
    pub fn new(client: ClientInfo, reason: Option<String>) -> Self {
        Self {
            kind: CLIENT_DISCONNECT_TYPE.to_string(),
            id: None,
            timestamp: Some(Utc::now()),
            client,
            reason,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn identity() -> ServiceIdentity {
        ServiceIdentity {
            name: "echo".to_string(),
            id: "abc".to_string(),
            version: "1.0.0".to_string(),
            metadata: HashMap::from([("region".to_string(), "eu".to_string())]),
        }
    }

    #[test]
    fn ping_response_wire_shape() {
        let value = serde_json::to_value(PingResponse::new(identity())).unwrap();
        assert_eq!(
            value,
            json!({
                "type": PING_RESPONSE_TYPE,
                "name": "echo",
                "id": "abc",
                "version": "1.0.0",
                "metadata": {"region": "eu"},
            })
        );
    }

    #[test]
    fn info_response_skips_absent_connection() {
        let info = InfoResponse::new(
            identity(),
            "echoes".to_string(),
            vec![EndpointInfo {
                name: "say".to_string(),
                subject: "echo.say".to_string(),
                queue_group: Some("echo".to_string()),
                metadata: HashMap::new(),
            }],
            None,
        );
        let value = serde_json::to_value(&info).unwrap();
        assert!(value.get("connection").is_none());
        assert_eq!(value["endpoints"][0]["queue_group"], "echo");
        assert_eq!(value["type"], INFO_RESPONSE_TYPE);
    }

    #[test]
    fn info_response_accepts_third_party_minimal_shape() {
        let raw = json!({
            "type": INFO_RESPONSE_TYPE,
            "name": "other",
            "id": "xyz",
            "version": "0.1.0",
        });
        let info: InfoResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(info.identity.name, "other");
        assert!(info.identity.metadata.is_empty());
        assert!(info.endpoints.is_empty());
        assert!(info.connection.is_none());
    }

    #[test]
    fn disconnect_advisory_parses_server_payload() {
        let raw = json!({
            "type": CLIENT_DISCONNECT_TYPE,
            "id": "evt1",
            "timestamp": "2024-01-01T00:00:00Z",
            "server": {"name": "n1"},
            "client": {"id": 17, "acc": "APP", "user": "svc", "host": "10.0.0.7"},
            "reason": "Client Closed",
        });
        let advisory: DisconnectAdvisory = serde_json::from_value(raw).unwrap();
        assert_eq!(advisory.client.id, 17);
        assert_eq!(advisory.client.acc.as_deref(), Some("APP"));
        assert_eq!(advisory.reason.as_deref(), Some("Client Closed"));
    }

    #[test]
    fn error_descriptor_display() {
        let err = ErrorDescriptor::new("500", "boom");
        assert_eq!(err.to_string(), "500: boom");
    }
}
