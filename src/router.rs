//! Router Façade: the single upstream MCP server the agent talks to.
//!
//! In router mode it exposes a fixed three-tool surface
//! (`search_mcp_server`, `add_mcp_server`, `use_tool`) backed by the
//! registry mirror and the session supervisor. In proxy mode it forwards
//! every call transparently to one fixed downstream session. Either way,
//! handlers never propagate failures as MCP protocol errors — every
//! failure becomes text content for the agent to read, per this crate's
//! error-handling posture.

use crate::mirror::{search_mcp_server as mirror_search, RegistryMirror};
use crate::session::{Protocol, Session, SessionConfig};
use rmcp::model::{CallToolResult, Content, JsonObject, Tool as McpTool};
use rmcp::{
    handler::server::ServerHandler,
    model::*,
    service::{RequestContext, RoleServer},
    ErrorData as McpError,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

const NOT_FOUND_MESSAGE: &str = "mcp server not found, use search_mcp_server to get mcp servers";
const UNHEALTHY_MESSAGE: &str = "mcp server is not healthy, use search_mcp_server to get mcp servers";

#[derive(Clone)]
pub enum RouterMode {
    Router,
    Proxy {
        proxied_name: String,
        /// When set, bypasses the registry lookup entirely and connects
        /// directly using this `{"mcpServers": {name: {...}}}` document.
        proxied_server_config: Option<serde_json::Value>,
    },
}

/// Shared router state: the mirror, and every installed downstream session.
pub struct Router {
    mode: RouterMode,
    mirror: Arc<RegistryMirror>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    auto_register_tools: bool,
}

impl Router {
    pub fn new(mode: RouterMode, mirror: Arc<RegistryMirror>) -> Arc<Self> {
        Self::with_auto_register(mode, mirror, true)
    }

    /// `auto_register_tools` controls whether `add_mcp_server` pushes the
    /// discovered tool list back to the registry via `update_tools`.
    pub fn with_auto_register(
        mode: RouterMode,
        mirror: Arc<RegistryMirror>,
        auto_register_tools: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            mode,
            mirror,
            sessions: RwLock::new(HashMap::new()),
            auto_register_tools,
        })
    }

    pub fn mirror(&self) -> &Arc<RegistryMirror> {
        &self.mirror
    }

    /// `search_mcp_server`: keyword search across comma-separated keywords,
    /// topped up with a semantic query on `task_description` if fewer than
    /// 5 results were found.
    pub async fn search_mcp_server(&self, task_description: &str, key_words: &str) -> String {
        let candidates = mirror_search(&self.mirror, task_description, key_words, 5).await;

        let result: serde_json::Map<String, serde_json::Value> = candidates
            .iter()
            .map(|d| {
                (
                    d.name.clone(),
                    serde_json::json!({"name": d.name, "description": d.description}),
                )
            })
            .collect();

        format!(
            "Found {} candidate mcp server(s). Call add_mcp_server with the chosen name to install it:\n{}",
            result.len(),
            serde_json::Value::Object(result)
        )
    }

    /// `add_mcp_server`: resolve the descriptor (falling back to the mirror
    /// cache if a live registry lookup comes back empty), install a session
    /// if one doesn't already exist, and push the (unfiltered) discovered
    /// tool list back to the registry.
    pub async fn add_mcp_server(&self, name: &str) -> String {
        let descriptor = match self.mirror.registry().get_by_name(name).await {
            Some(d) if !d.description.is_empty() => Some(d),
            _ => self.mirror.get_by_name(name).await,
        };

        let Some(descriptor) = descriptor else {
            return format!("{name} is not found, use search_mcp_server to get mcp servers");
        };

        let already_installed = self.sessions.read().await.contains_key(name);
        if !already_installed {
            let config = session_config_for(&descriptor, name).with_merged_default_env();
            let session = Session::spawn(name.to_string(), config);
            session.wait_for_initialization().await;

            if session.healthy().await {
                self.sessions.write().await.insert(name.to_string(), session);
            } else {
                warn!(server = %name, "newly created session did not become healthy");
                return format!("failed to install mcp server: {name}");
            }
        }

        let Some(session) = self.sessions.read().await.get(name).cloned() else {
            return format!("failed to install mcp server: {name}");
        };

        let tools = match session.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                warn!(server = %name, error = %e, "failed to list tools after install");
                return format!("failed to install mcp server: {name}");
            }
        };

        let unfiltered: Vec<crate::descriptor::ToolDefinition> = tools
            .iter()
            .map(|t| crate::descriptor::ToolDefinition {
                name: t.name.to_string(),
                description: t.description.as_ref().map(|d| d.to_string()),
                input_schema: Default::default(),
            })
            .collect();

        let tool_list: Vec<serde_json::Value> = apply_tool_overlay(&descriptor, tools)
            .into_iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": t.input_schema,
                })
            })
            .collect();

        if self.auto_register_tools {
            if let Err(e) = self
                .mirror
                .registry()
                .update_tools(name, &unfiltered, &descriptor)
                .await
            {
                warn!(server = %name, error = %e, "failed to push discovered tools back to registry");
            }
        }

        format!(
            "Installed mcp server `{name}`. Available tools:\n{}",
            serde_json::Value::Array(tool_list)
        )
    }

    /// `use_tool`: resolve the installed session, check liveness, execute
    /// with retry, and return the tool's response content as text.
    pub async fn use_tool(&self, name: &str, tool_name: &str, params: serde_json::Value) -> String {
        let Some(session) = self.sessions.read().await.get(name).cloned() else {
            return NOT_FOUND_MESSAGE.to_string();
        };

        if !session.healthy().await {
            self.sessions.write().await.remove(name);
            return UNHEALTHY_MESSAGE.to_string();
        }

        let args: JsonObject = match params {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => JsonObject::new(),
            other => {
                let mut map = JsonObject::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        match session.execute_tool(tool_name, args).await {
            Ok(content) => content
                .into_iter()
                .filter_map(|c| c.as_text().map(|t| t.text.clone()))
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => {
                warn!(server = %name, tool = %tool_name, error = %e, "tool execution failed");
                format!("failed to use tool: {tool_name}")
            }
        }
    }

    /// Proxy mode: ensure the single fixed session is installed. Fatal if it
    /// never becomes healthy, since a proxy with no downstream has nothing
    /// to serve.
    ///
    /// When `PROXIED_MCP_SERVER_CONFIG` was supplied, the connection is built
    /// straight from it and the registry is never consulted; otherwise this
    /// resolves the descriptor exactly like `add_mcp_server` does.
    pub async fn ensure_proxied_session(&self) -> anyhow::Result<()> {
        let RouterMode::Proxy {
            proxied_name,
            proxied_server_config,
        } = &self.mode
        else {
            return Ok(());
        };

        let config = if let Some(override_config) = proxied_server_config {
            session_config_from_mcp_servers(override_config, proxied_name)
                .ok_or_else(|| anyhow::anyhow!("PROXIED_MCP_SERVER_CONFIG has no entry for `{proxied_name}`"))?
        } else {
            self.mirror.refresh_one(proxied_name).await;
            let descriptor = self.mirror.get_by_name(proxied_name).await.ok_or_else(|| {
                anyhow::anyhow!("proxied server `{proxied_name}` not found in registry")
            })?;
            session_config_for(&descriptor, proxied_name)
        }
        .with_merged_default_env();

        let session = Session::spawn(proxied_name.clone(), config);
        session.wait_for_initialization().await;

        if !session.healthy().await {
            anyhow::bail!("proxied server `{proxied_name}` session failed to become healthy");
        }

        self.sessions
            .write()
            .await
            .insert(proxied_name.clone(), session);
        info!(server = %proxied_name, "proxy session ready");
        Ok(())
    }

    async fn proxied_session(&self) -> Option<Arc<Session>> {
        let RouterMode::Proxy { proxied_name, .. } = &self.mode else {
            return None;
        };
        self.sessions.read().await.get(proxied_name).cloned()
    }

    /// `listTools` in proxy mode forwards to the downstream session, then
    /// filters and overlays the result exactly like `add_mcp_server` does for
    /// a freshly installed server.
    pub async fn proxy_list_tools(&self) -> Vec<McpTool> {
        let RouterMode::Proxy { proxied_name, .. } = &self.mode else {
            return Vec::new();
        };
        let Some(session) = self.proxied_session().await else {
            return Vec::new();
        };
        let tools = session.list_tools().await.unwrap_or_default();

        match self.mirror.get_by_name(proxied_name).await {
            Some(descriptor) => apply_tool_overlay(&descriptor, tools),
            None => tools,
        }
    }

    pub async fn proxy_call_tool(&self, tool_name: &str, args: JsonObject) -> Result<Vec<Content>, String> {
        let Some(session) = self.proxied_session().await else {
            return Err("proxied mcp server has no active session".to_string());
        };
        session
            .execute_tool(tool_name, args)
            .await
            .map_err(|e| e.to_string())
    }

    /// Called from the graceful-shutdown hook: tear every installed session
    /// down cleanly.
    pub async fn shutdown(&self) {
        let sessions = self.sessions.write().await;
        for session in sessions.values() {
            session.cleanup().await;
        }
    }
}

/// Drops disabled tools and overlays the registry's own `description` /
/// `inputSchema` (from `toolSpec.tools`) over the server-reported ones,
/// for every tool name the descriptor has an entry for. Shared between
/// `add_mcp_server` and proxy mode's `listTools`, which surface a tool list
/// under identical rules.
fn apply_tool_overlay(descriptor: &crate::descriptor::ServerDescriptor, tools: Vec<McpTool>) -> Vec<McpTool> {
    let disabled = descriptor.disabled_tool_names();
    let disabled_set: std::collections::HashSet<&str> = disabled.iter().map(|s| s.as_str()).collect();

    let overlays: HashMap<&str, &crate::descriptor::ToolDefinition> = descriptor
        .tool_spec
        .tools
        .iter()
        .map(|t| (t.name.as_str(), t))
        .collect();

    tools
        .into_iter()
        .filter(|t| !disabled_set.contains(t.name.as_ref()))
        .map(|t| {
            let Some(overlay) = overlays.get(t.name.as_ref()) else {
                return t;
            };
            let description = overlay
                .description
                .clone()
                .map(std::borrow::Cow::Owned)
                .or_else(|| t.description.clone());
            let input_schema = input_schema_to_json_object(&overlay.input_schema)
                .map(Arc::new)
                .unwrap_or_else(|| t.input_schema.clone());
            McpTool {
                description,
                input_schema,
                ..t
            }
        })
        .collect()
}

/// Converts a registry `InputSchema` into the `JsonObject` shape `McpTool`
/// expects, or `None` when the descriptor carries no schema for this tool
/// (an empty type and no properties), so the server-reported schema wins.
fn input_schema_to_json_object(schema: &crate::descriptor::InputSchema) -> Option<JsonObject> {
    if schema.schema_type.is_none() && schema.properties.is_empty() {
        return None;
    }

    let mut obj = JsonObject::new();
    obj.insert(
        "type".to_string(),
        serde_json::json!(schema.schema_type.as_deref().unwrap_or("object")),
    );
    let properties: serde_json::Map<String, serde_json::Value> = schema
        .properties
        .iter()
        .map(|(name, prop)| {
            let mut entry = serde_json::Map::new();
            if let Some(ty) = &prop.r#type {
                entry.insert("type".to_string(), serde_json::json!(ty));
            }
            if let Some(desc) = &prop.description {
                entry.insert("description".to_string(), serde_json::json!(desc));
            }
            (name.clone(), serde_json::Value::Object(entry))
        })
        .collect();
    obj.insert("properties".to_string(), serde_json::Value::Object(properties));
    Some(obj)
}

fn session_config_for(descriptor: &crate::descriptor::ServerDescriptor, name: &str) -> SessionConfig {
    let protocol = Protocol::from_descriptor(&descriptor.protocol);

    let entry = descriptor
        .agent_config
        .get("mcpServers")
        .and_then(|v| v.get(name));

    let fallback_command = descriptor
        .local_server_config
        .get("command")
        .and_then(|v| v.as_str());

    session_config_from_entry(entry, protocol, fallback_command)
}

/// Builds a `SessionConfig` straight from a `{"mcpServers": {name: {...}}}`
/// document, as supplied directly via `PROXIED_MCP_SERVER_CONFIG` rather than
/// fetched from the registry. The protocol is inferred from the presence of
/// a `url` field since there is no registry descriptor to read it from.
fn session_config_from_mcp_servers(config: &serde_json::Value, name: &str) -> Option<SessionConfig> {
    let entry = config.get("mcpServers")?.get(name)?;

    let protocol = if entry.get("url").is_some() {
        Protocol::StreamableHttp
    } else {
        Protocol::Stdio
    };

    Some(session_config_from_entry(Some(entry), protocol, None))
}

fn session_config_from_entry(
    entry: Option<&serde_json::Value>,
    protocol: Protocol,
    fallback_command: Option<&str>,
) -> SessionConfig {
    match protocol {
        Protocol::Stdio => {
            let command = entry
                .and_then(|e| e.get("command"))
                .and_then(|v| v.as_str())
                .or(fallback_command)
                .map(|s| s.to_string());
            let args = entry
                .and_then(|e| e.get("args"))
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default();
            let env = entry
                .and_then(|e| e.get("env"))
                .and_then(|v| v.as_object())
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default();

            SessionConfig {
                protocol: Some(Protocol::Stdio),
                command,
                args,
                env,
                url: None,
                headers: HashMap::new(),
            }
        }
        Protocol::Sse | Protocol::StreamableHttp => {
            let url = entry
                .and_then(|e| e.get("url"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            let headers = entry
                .and_then(|e| e.get("headers"))
                .and_then(|v| v.as_object())
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default();

            SessionConfig {
                protocol: Some(protocol),
                command: None,
                args: Vec::new(),
                env: HashMap::new(),
                url,
                headers,
            }
        }
    }
}

/// `ServerHandler` implementation exposed to the upstream agent.
#[derive(Clone)]
pub struct RouterServer {
    router: Arc<Router>,
}

impl RouterServer {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

fn error_result(text: String) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(text)],
        structured_content: None,
        is_error: Some(true),
        meta: None,
    }
}

fn text_result(text: String) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(text)],
        structured_content: None,
        is_error: Some(false),
        meta: None,
    }
}

fn router_tools() -> Vec<McpTool> {
    vec![
        McpTool::new(
            "search_mcp_server",
            "Search for MCP servers that can accomplish a task, by keyword and/or natural-language description.",
            Arc::new(schema_object(&[
                ("task_description", "string", "Natural-language description of the task to accomplish."),
                ("key_words", "string", "Comma-separated keywords to search by (at most a couple)."),
            ], &["task_description", "key_words"])),
        ),
        McpTool::new(
            "add_mcp_server",
            "Install an MCP server discovered via search_mcp_server, making its tools available to use_tool.",
            Arc::new(schema_object(&[
                ("mcp_server_name", "string", "The name of the mcp server to install."),
            ], &["mcp_server_name"])),
        ),
        McpTool::new(
            "use_tool",
            "Invoke a tool on an installed mcp server.",
            Arc::new(schema_object(&[
                ("mcp_server_name", "string", "The name of the installed mcp server."),
                ("mcp_tool_name", "string", "The name of the tool to invoke."),
                ("params", "string", "JSON-encoded arguments for the tool."),
            ], &["mcp_server_name", "mcp_tool_name", "params"])),
        ),
    ]
}

fn schema_object(fields: &[(&str, &str, &str)], required: &[&str]) -> JsonObject {
    let mut properties = serde_json::Map::new();
    for (name, ty, description) in fields {
        properties.insert(
            name.to_string(),
            serde_json::json!({"type": ty, "description": description}),
        );
    }

    let mut schema = JsonObject::new();
    schema.insert("type".to_string(), serde_json::json!("object"));
    schema.insert("properties".to_string(), serde_json::Value::Object(properties));
    schema.insert("required".to_string(), serde_json::json!(required));
    schema
}

impl ServerHandler for RouterServer {
    fn ping(&self, _context: RequestContext<RoleServer>) -> impl Future<Output = Result<(), McpError>> + Send + '_ {
        std::future::ready(Ok(()))
    }

    fn initialize(
        &self,
        _request: InitializeRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<InitializeResult, McpError>> + Send + '_ {
        std::future::ready(Ok(InitializeResult {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Routes tool calls to MCP servers registered in a service registry. Use \
                 search_mcp_server to find candidates, add_mcp_server to install one, and \
                 use_tool to invoke its tools."
                    .to_string(),
            ),
        }))
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let router = self.router.clone();
        async move {
            let tools = match &router.mode {
                RouterMode::Router => router_tools(),
                RouterMode::Proxy { .. } => router.proxy_list_tools().await,
            };
            Ok(ListToolsResult {
                tools,
                next_cursor: None,
                ..Default::default()
            })
        }
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        let router = self.router.clone();
        let tool_name = request.name.to_string();
        let args = request.arguments.unwrap_or_default();

        async move {
            match &router.mode {
                RouterMode::Router => Ok(dispatch_router_tool(&router, &tool_name, args).await),
                RouterMode::Proxy { .. } => match router.proxy_call_tool(&tool_name, args).await {
                    Ok(content) => Ok(CallToolResult {
                        content,
                        structured_content: None,
                        is_error: Some(false),
                        meta: None,
                    }),
                    Err(e) => Ok(error_result(e)),
                },
            }
        }
    }

    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Routes tool calls to MCP servers registered in a service registry.".to_string(),
            ),
        }
    }
}

async fn dispatch_router_tool(router: &Arc<Router>, tool_name: &str, args: JsonObject) -> CallToolResult {
    match tool_name {
        "search_mcp_server" => {
            let task_description = args.get("task_description").and_then(|v| v.as_str()).unwrap_or("");
            let key_words = args.get("key_words").and_then(|v| v.as_str()).unwrap_or("");
            text_result(router.search_mcp_server(task_description, key_words).await)
        }
        "add_mcp_server" => {
            let Some(name) = args.get("mcp_server_name").and_then(|v| v.as_str()) else {
                return error_result("add_mcp_server requires `mcp_server_name`".to_string());
            };
            text_result(router.add_mcp_server(name).await)
        }
        "use_tool" => {
            let Some(name) = args.get("mcp_server_name").and_then(|v| v.as_str()) else {
                return error_result("use_tool requires `mcp_server_name`".to_string());
            };
            let Some(tool_name) = args.get("mcp_tool_name").and_then(|v| v.as_str()) else {
                return error_result("use_tool requires `mcp_tool_name`".to_string());
            };
            let params = match args.get("params").and_then(|v| v.as_str()) {
                Some(raw) => serde_json::from_str(raw).unwrap_or(serde_json::Value::Null),
                None => serde_json::Value::Null,
            };
            text_result(router.use_tool(name, tool_name, params).await)
        }
        other => error_result(format!("unknown tool: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry_client::{RegistryClient, RegistryClientConfig};

    fn test_router(mode: RouterMode) -> Arc<Router> {
        let registry = RegistryClient::new(RegistryClientConfig {
            addr: "127.0.0.1:8848".to_string(),
            username: "nacos".to_string(),
            password: String::new(),
            scheme: "http".to_string(),
        });
        let mirror = Arc::new(RegistryMirror::new(registry, None));
        Router::new(mode, mirror)
    }

    #[tokio::test]
    async fn use_tool_without_installed_session_returns_not_found() {
        let router = test_router(RouterMode::Router);
        let result = router
            .use_tool("weather", "get_forecast", serde_json::Value::Null)
            .await;
        assert!(result.starts_with("mcp server not found"));
    }

    #[test]
    fn router_tools_lists_exactly_the_fixed_three() {
        let tools = router_tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
        assert_eq!(names, vec!["search_mcp_server", "add_mcp_server", "use_tool"]);
    }
}
