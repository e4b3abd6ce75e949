//! Serde wire types for wg-feed draft-00.

use serde::{Deserialize, Serialize};

/// Display metadata attached to a feed or a feed tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayInfo {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

/// One tunnel declared by a feed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedTunnel {
    /// Feed-local tunnel id, unique within the document.
    pub id: String,
    /// Tunnel name; must match `^[A-Za-z][A-Za-z0-9-]*$`.
    pub name: String,
    pub display_info: DisplayInfo,
    /// Full tunnel configuration payload.
    pub wg_quick_config: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub forced: bool,
}

/// The feed document proper (the decrypted/plaintext payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedDocument {
    /// Feed id: UUID with RFC 4122 variant bits.
    pub id: String,
    /// Draft-00 required: list of HTTPS subscription URLs for this feed.
    /// Items MUST NOT include URL fragments.
    pub endpoints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_message: Option<String>,
    pub display_info: DisplayInfo,
    pub tunnels: Vec<FeedTunnel>,
}

/// Success envelope returned with HTTP 200 (and as SSE `feed` event data).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessEnvelope {
    pub version: String,
    pub success: bool,
    /// Opaque revision token used for conditional requests.
    pub revision: String,
    pub ttl_seconds: i64,
    #[serde(default)]
    pub supports_sse: bool,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<FeedDocument>,
}

/// Error envelope ideally carried by any non-200/304 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub version: String,
    pub success: bool,
    pub message: String,
    pub retriable: bool,
}
