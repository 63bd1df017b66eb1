//! Serde types for the catalog wire format.
//!
//! Field names follow the catalog's JSON conventions (PascalCase), with
//! `#[serde(default)]` on everything optional so partial responses from
//! older catalog versions still decode.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Health status of a check or node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passing,
    Warning,
    Critical,
    #[serde(other)]
    Unknown,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Passing => "passing",
            CheckStatus::Warning => "warning",
            CheckStatus::Critical => "critical",
            CheckStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for CheckStatus {
    fn default() -> Self {
        CheckStatus::Unknown
    }
}

/// Response of `agent/self`, reduced to the fields the daemon reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSelf {
    #[serde(rename = "Config", default)]
    pub config: AgentSelfConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSelfConfig {
    #[serde(rename = "Version", default)]
    pub version: String,
    #[serde(rename = "NodeName", default)]
    pub node_name: String,
}

/// A service as known to a local agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentService {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Service", default)]
    pub service: String,
    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
    #[serde(rename = "Meta", default)]
    pub meta: HashMap<String, String>,
    #[serde(rename = "Port", default)]
    pub port: u16,
    #[serde(rename = "Address", default)]
    pub address: String,
}

/// Body for `agent/service/register`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Tags", default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(rename = "Meta", default, skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, String>,
    #[serde(rename = "Partition", default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
}

/// Body for `agent/check/register`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentCheckRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ServiceID", default, skip_serializing_if = "String::is_empty")]
    pub service_id: String,
    /// TTL duration string ("30s"). Set for TTL-style checks.
    #[serde(rename = "TTL", default, skip_serializing_if = "String::is_empty")]
    pub ttl: String,
    #[serde(rename = "Status", default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CheckStatus>,
    #[serde(rename = "Partition", default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
}

/// One entry of a `catalog/service/<name>` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogService {
    #[serde(rename = "Node", default)]
    pub node: String,
    #[serde(rename = "Address", default)]
    pub address: String,
    #[serde(rename = "ServiceID", default)]
    pub service_id: String,
    #[serde(rename = "ServiceName", default)]
    pub service_name: String,
    #[serde(rename = "ServiceTags", default)]
    pub service_tags: Vec<String>,
    #[serde(rename = "ServiceMeta", default)]
    pub service_meta: HashMap<String, String>,
}

/// One entry of a `catalog/nodes` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "Node", default)]
    pub node: String,
    #[serde(rename = "Address", default)]
    pub address: String,
    #[serde(rename = "Meta", default)]
    pub meta: HashMap<String, String>,
}

/// A health check as returned by the health endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(rename = "Node", default)]
    pub node: String,
    #[serde(rename = "CheckID", default)]
    pub check_id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Status", default)]
    pub status: CheckStatus,
    #[serde(rename = "Output", default)]
    pub output: String,
    #[serde(rename = "ServiceID", default)]
    pub service_id: String,
    #[serde(rename = "ServiceName", default)]
    pub service_name: String,
    #[serde(rename = "Type", default)]
    pub check_type: String,
    #[serde(rename = "Namespace", default)]
    pub namespace: String,
    #[serde(rename = "Partition", default)]
    pub partition: String,
    #[serde(rename = "Definition", default)]
    pub definition: HealthCheckDefinition,
    #[serde(rename = "ModifyIndex", default)]
    pub modify_index: u64,
}

/// Probe definition attached to a health check.
///
/// Durations are wire-encoded as readable strings ("10s"); use the accessor
/// methods to get parsed values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckDefinition {
    #[serde(rename = "HTTP", default, skip_serializing_if = "String::is_empty")]
    pub http: String,
    #[serde(rename = "TCP", default, skip_serializing_if = "String::is_empty")]
    pub tcp: String,
    #[serde(rename = "Interval", default, skip_serializing_if = "String::is_empty")]
    pub interval: String,
    #[serde(rename = "Timeout", default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    #[serde(rename = "TLSSkipVerify", default)]
    pub tls_skip_verify: bool,
    #[serde(rename = "Header", default, skip_serializing_if = "HashMap::is_empty")]
    pub header: HashMap<String, Vec<String>>,
}

impl HealthCheckDefinition {
    /// Parsed probe interval, if one is set and well-formed.
    pub fn interval(&self) -> Option<Duration> {
        humantime::parse_duration(&self.interval).ok()
    }

    /// Parsed probe timeout, if one is set and well-formed.
    pub fn timeout(&self) -> Option<Duration> {
        humantime::parse_duration(&self.timeout).ok()
    }
}

/// Body for `catalog/register`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogRegistration {
    #[serde(rename = "Node")]
    pub node: String,
    #[serde(rename = "Address", default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(rename = "NodeMeta", default, skip_serializing_if = "HashMap::is_empty")]
    pub node_meta: HashMap<String, String>,
    #[serde(rename = "Service", default, skip_serializing_if = "Option::is_none")]
    pub service: Option<AgentService>,
    #[serde(rename = "Checks", default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<HealthCheck>,
    /// Leave an existing node entry untouched when only adding a service
    /// or check to it.
    #[serde(rename = "SkipNodeUpdate", default)]
    pub skip_node_update: bool,
    #[serde(rename = "Partition", default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
}

/// Body for `catalog/deregister`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDeregistration {
    #[serde(rename = "Node")]
    pub node: String,
    #[serde(rename = "ServiceID", default, skip_serializing_if = "String::is_empty")]
    pub service_id: String,
    #[serde(rename = "CheckID", default, skip_serializing_if = "String::is_empty")]
    pub check_id: String,
    #[serde(rename = "Partition", default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
}

/// What the catalog does with session-held resources when the session
/// expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBehavior {
    /// Locks are released, entries stay.
    Release,
    /// Held KV entries and registrations are deleted.
    Delete,
}

impl Default for SessionBehavior {
    fn default() -> Self {
        SessionBehavior::Release
    }
}

/// A session, both as create-request body and list-response entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionEntry {
    #[serde(rename = "ID", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "Name", default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "Node", default, skip_serializing_if = "String::is_empty")]
    pub node: String,
    /// Lease TTL as a duration string ("30s").
    #[serde(rename = "TTL", default, skip_serializing_if = "String::is_empty")]
    pub ttl: String,
    #[serde(rename = "Behavior", default)]
    pub behavior: SessionBehavior,
    /// Node-level checks the session is bound to.
    #[serde(rename = "NodeChecks", default, skip_serializing_if = "Vec::is_empty")]
    pub node_checks: Vec<String>,
    /// Check IDs the session is bound to (legacy flat form).
    #[serde(rename = "Checks", default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<String>,
}

/// A KV entry. `value` is base64 on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvPair {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Value", default)]
    pub value: String,
    #[serde(rename = "Session", default, skip_serializing_if = "String::is_empty")]
    pub session: String,
    #[serde(rename = "ModifyIndex", default)]
    pub modify_index: u64,
}

impl KvPair {
    /// Decode the base64 value.
    pub fn decoded_value(&self) -> Option<Vec<u8>> {
        BASE64.decode(&self.value).ok()
    }

    /// Encode raw bytes into the wire value field.
    pub fn encode_value(bytes: &[u8]) -> String {
        BASE64.encode(bytes)
    }
}

/// Network coordinate of a node (Vivaldi model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coord {
    #[serde(rename = "Vec")]
    pub vec: Vec<f64>,
    #[serde(rename = "Error")]
    pub error: f64,
    #[serde(rename = "Adjustment")]
    pub adjustment: f64,
    #[serde(rename = "Height")]
    pub height: f64,
}

impl Default for Coord {
    fn default() -> Self {
        // Origin coordinate with the catalog's default dimensionality.
        Self {
            vec: vec![0.0; 8],
            error: 1.5,
            adjustment: 0.0,
            height: 1.0e-5,
        }
    }
}

/// Body for `coordinate/update`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinateEntry {
    #[serde(rename = "Node")]
    pub node: String,
    #[serde(rename = "Partition", default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    #[serde(rename = "Coord")]
    pub coord: Coord,
}

/// One entry of a `namespaces` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Namespace {
    #[serde(rename = "Name")]
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_status_round_trips_lowercase() {
        let s: CheckStatus = serde_json::from_str("\"passing\"").unwrap();
        assert_eq!(s, CheckStatus::Passing);
        assert_eq!(serde_json::to_string(&CheckStatus::Critical).unwrap(), "\"critical\"");
        // Anything unrecognized folds to Unknown rather than failing decode.
        let s: CheckStatus = serde_json::from_str("\"maintenance\"").unwrap();
        assert_eq!(s, CheckStatus::Unknown);
    }

    #[test]
    fn health_check_decodes_partial_response() {
        let json = r#"[{"ServiceMeta": {"version": "1.10.0"}}]"#;
        let services: Vec<CatalogService> = serde_json::from_str(json).unwrap();
        assert_eq!(services[0].service_meta["version"], "1.10.0");
        assert!(services[0].service_id.is_empty());
    }

    #[test]
    fn definition_durations_parse() {
        let def: HealthCheckDefinition = serde_json::from_str(
            r#"{"HTTP": "http://localhost/x", "Interval": "2s", "Timeout": "500ms"}"#,
        )
        .unwrap();
        assert_eq!(def.interval(), Some(Duration::from_secs(2)));
        assert_eq!(def.timeout(), Some(Duration::from_millis(500)));
        assert_eq!(HealthCheckDefinition::default().interval(), None);
    }

    #[test]
    fn kv_value_round_trips_base64() {
        let pair = KvPair {
            key: "agents/x".to_string(),
            value: KvPair::encode_value(b"{\"instance_id\":\"x\"}"),
            ..Default::default()
        };
        assert_eq!(pair.decoded_value().unwrap(), b"{\"instance_id\":\"x\"}");
    }
}
