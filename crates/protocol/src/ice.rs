//! TURN/STUN server descriptors.
//!
//! The same JSON shape appears in the `ICE_SERVERS` environment variable at
//! startup and in retained `server/ice-servers` broker updates.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerInfo {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerInfo {
    /// Parse a JSON array of server descriptors.
    pub fn parse_list(json: &str) -> Result<Vec<Self>, serde_json::Error> {
        serde_json::from_str(json)
    }
}
