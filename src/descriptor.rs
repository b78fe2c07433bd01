//! The registry entry data model: `ServerDescriptor` and everything it is
//! made of. Parsing is intentionally permissive — the registry is an
//! external collaborator and its documents vary in which optional fields
//! are present, so every field here defaults rather than requiring the
//! caller to special-case absence.

use crate::error::DescriptorError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputProperty {
    #[serde(default)]
    pub r#type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(default, rename = "type")]
    pub schema_type: Option<String>,
    #[serde(default)]
    pub properties: HashMap<String, InputProperty>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: InputSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMeta {
    #[serde(default)]
    pub invoke_context: HashMap<String, serde_json::Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub templates: HashMap<String, serde_json::Value>,
}

impl Default for ToolMeta {
    fn default() -> Self {
        Self {
            invoke_context: HashMap::new(),
            enabled: true,
            templates: HashMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, rename = "toolsMeta")]
    pub tools_meta: HashMap<String, ToolMeta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceRef {
    #[serde(default, rename = "namespaceId")]
    pub namespace_id: String,
    #[serde(default, rename = "groupName")]
    pub group_name: String,
    #[serde(default, rename = "serviceName")]
    pub service_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteServerConfig {
    #[serde(default, rename = "serviceRef")]
    pub service_ref: ServiceRef,
    #[serde(default, rename = "exportPath")]
    pub export_path: String,
    #[serde(default)]
    pub credentials: HashMap<String, serde_json::Value>,
}

/// Backend endpoint for a remote (non-stdio) server. `port = -1` is the
/// sentinel used when no endpoint data is available, matching the original
/// implementation's defensive default rather than making this field optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendEndpoint {
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_missing_port")]
    pub port: i64,
}

impl Default for BackendEndpoint {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: -1,
        }
    }
}

fn default_missing_port() -> i64 {
    -1
}

/// A single registry entry, as returned by `GET /nacos/v3/admin/ai/mcp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    pub protocol: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "remoteServerConfig")]
    pub remote_server_config: RemoteServerConfig,
    #[serde(default, rename = "localServerConfig")]
    pub local_server_config: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, rename = "backendEndpoints")]
    pub backend_endpoints: Vec<BackendEndpoint>,
    #[serde(default, rename = "toolSpec")]
    pub tool_spec: ToolSpec,

    /// The `mcpServers` config fragment synthesized for downstream session
    /// construction. Populated by `RegistryClient::get_by_name` for
    /// non-stdio protocols; for stdio protocols this stays whatever
    /// `localServerConfig` already carried.
    #[serde(default, rename = "agentConfig")]
    pub agent_config: serde_json::Map<String, serde_json::Value>,
}

impl ServerDescriptor {
    /// Parse a raw registry document, rejecting one missing either of the
    /// two fields this crate treats as mandatory even though the registry's
    /// own schema marks them optional.
    pub fn parse(value: serde_json::Value) -> Result<Self, DescriptorError> {
        if value.get("name").and_then(|v| v.as_str()).is_none() {
            return Err(DescriptorError::MissingField("name"));
        }
        if value.get("protocol").and_then(|v| v.as_str()).is_none() {
            return Err(DescriptorError::MissingField("protocol"));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// The text whose MD5 hash is the descriptor's change-detection digest:
    /// the top-level description followed by every tool's description,
    /// newline-joined. Tools with no description are skipped.
    pub fn tool_description(&self) -> String {
        let mut text = self.description.clone();
        for tool in &self.tool_spec.tools {
            if let Some(desc) = &tool.description {
                if !desc.is_empty() {
                    text.push('\n');
                    text.push_str(desc);
                }
            }
        }
        text
    }

    /// Names of tools whose metadata marks them as disabled.
    pub fn disabled_tool_names(&self) -> Vec<String> {
        self.tool_spec
            .tools_meta
            .iter()
            .filter(|(_, meta)| !meta.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn is_stdio(&self) -> bool {
        self.protocol == "stdio"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_descriptor() {
        let json = serde_json::json!({
            "name": "weather",
            "protocol": "stdio",
            "description": "weather tools",
        });
        let d: ServerDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(d.name, "weather");
        assert!(d.enabled);
        assert!(d.backend_endpoints.is_empty());
        assert_eq!(d.tool_spec.tools.len(), 0);
    }

    #[test]
    fn backend_endpoint_defaults_to_sentinel_port() {
        let e: BackendEndpoint = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(e.port, -1);
        assert_eq!(e.address, "");
    }

    #[test]
    fn tool_meta_defaults_enabled_true() {
        let m: ToolMeta = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(m.enabled);
    }

    #[test]
    fn tool_description_concatenates_in_order() {
        let json = serde_json::json!({
            "name": "weather",
            "protocol": "stdio",
            "description": "base",
            "toolSpec": {
                "tools": [
                    {"name": "a", "description": "first"},
                    {"name": "b", "description": null},
                    {"name": "c", "description": "third"},
                ]
            }
        });
        let d: ServerDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(d.tool_description(), "base\nfirst\nthird");
    }

    #[test]
    fn parse_rejects_missing_name_or_protocol() {
        let missing_name = serde_json::json!({"protocol": "stdio"});
        assert!(matches!(
            ServerDescriptor::parse(missing_name),
            Err(DescriptorError::MissingField("name"))
        ));

        let missing_protocol = serde_json::json!({"name": "weather"});
        assert!(matches!(
            ServerDescriptor::parse(missing_protocol),
            Err(DescriptorError::MissingField("protocol"))
        ));
    }

    #[test]
    fn disabled_tool_names_only_lists_explicitly_disabled() {
        let json = serde_json::json!({
            "name": "weather",
            "protocol": "stdio",
            "toolSpec": {
                "tools": [{"name": "a"}, {"name": "b"}],
                "toolsMeta": {
                    "a": {"enabled": false},
                    "b": {"enabled": true},
                }
            }
        });
        let d: ServerDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(d.disabled_tool_names(), vec!["a".to_string()]);
    }
}
