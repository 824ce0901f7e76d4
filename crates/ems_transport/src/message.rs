//! JSON documents exchanged on the V2 protocol.

use serde::{Deserialize, Serialize};

/// Recognized IDENTIFY keys; everything is optional.
#[derive(Debug, Default, Deserialize)]
pub struct IdentifyBody {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub feature_negotiation: bool,
    /// ms; 0 keeps the default, -1 disables heartbeats.
    pub heartbeat_interval: Option<i64>,
    /// bytes; 0 keeps the default, -1 asks for unbuffered writes.
    pub output_buffer_size: Option<i64>,
    /// ms; 0 keeps the default.
    pub output_buffer_timeout: Option<i64>,
    #[serde(default)]
    pub tls_v1: bool,
    #[serde(default)]
    pub snappy: bool,
    #[serde(default)]
    pub deflate: bool,
    #[serde(default)]
    pub deflate_level: i32,
    /// Deliver only this percentage of messages to this client (0-99).
    pub sample_rate: Option<i32>,
    #[serde(default)]
    pub user_agent: String,
    /// ms per-delivery in-flight timeout.
    pub msg_timeout: Option<i64>,
}

/// Feature-negotiation reply to IDENTIFY.
#[derive(Debug, Serialize)]
pub struct IdentifyResponse {
    pub max_rdy_count: i64,
    pub version: &'static str,
    pub max_msg_timeout: i64,
    pub msg_timeout: i64,
    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: i32,
    pub max_deflate_level: i32,
    pub snappy: bool,
    pub sample_rate: i32,
    pub auth_required: bool,
    pub output_buffer_size: i64,
    pub output_buffer_timeout: i64,
}

/// Reply to a successful AUTH.
#[derive(Debug, Serialize)]
pub struct AuthReply {
    pub identity: String,
    pub identity_url: String,
    pub permission_count: usize,
}
