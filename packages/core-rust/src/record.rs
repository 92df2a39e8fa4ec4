//! Monitor-side description of one observed service instance.

use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::protocol::{ConnectionInfo, EndpointInfo, InfoResponse};

/// Cached view of a running instance, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub version: String,
    pub id: String,
    pub description: String,
    pub metadata: HashMap<String, String>,
    pub endpoints: Vec<EndpointInfo>,
    pub connection: Option<ConnectionInfo>,
    /// Milliseconds since the Unix epoch of the most recent sighting.
    pub last_seen: u64,
}

impl ServiceRecord {
    /// Builds a record from an info reply or announcement seen at `seen_at`.
    #[must_use]
    pub fn from_info(info: InfoResponse, seen_at: u64) -> Self {
        Self {
            name: info.identity.name,
            version: info.identity.version,
            id: info.identity.id,
            description: info.description,
            metadata: info.identity.metadata,
            endpoints: info.endpoints,
            connection: info.connection,
            last_seen: seen_at,
        }
    }

    /// Client id of the connection this instance runs on, if known.
    #[must_use]
    pub fn client_id(&self) -> Option<u64> {
        self.connection.as_ref().map(|c| c.client_id)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    let millis = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    millis
}
