//! Typed client for the registry's HTTP admin API
//! (`/nacos/v3/admin/ai/mcp`).
//!
//! Every call here fails soft: a transport error or a non-2xx response is
//! logged and turned into "no data" (an empty list, or `None`) rather than
//! propagated as an error, matching the rest of the router's "never crash
//! on an external collaborator's hiccup" posture.

use crate::descriptor::ServerDescriptor;
use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RegistryClientConfig {
    pub addr: String,
    pub username: String,
    pub password: String,
    pub scheme: String,
}

#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    config: RegistryClientConfig,
}

#[derive(Debug, Deserialize)]
struct NacosEnvelope<T> {
    #[allow(dead_code)]
    code: Option<i64>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ListPage {
    #[serde(default, rename = "totalCount")]
    total_count: u64,
    #[serde(default, rename = "pageItems")]
    page_items: Vec<ListPageItem>,
}

#[derive(Debug, Deserialize)]
struct ListPageItem {
    name: String,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

impl RegistryClient {
    pub fn new(config: RegistryClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("nacos-mcp-router/0.1.0")
            .build()
            .expect("building the registry HTTP client with static config cannot fail");

        Self { http, config }
    }

    fn base_url(&self) -> String {
        format!(
            "{}://{}/nacos/v3/admin/ai/mcp",
            self.config.scheme, self.config.addr
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("userName", &self.config.username)
            .header("password", &self.config.password)
    }

    /// Fetch the full detail for one named entry.
    ///
    /// For non-stdio protocols with at least one backend endpoint, synthesizes
    /// a transport URL and writes it into `agentConfig.mcpServers[name].url`.
    pub async fn get_by_name(&self, name: &str) -> Option<ServerDescriptor> {
        let response = match self
            .request(reqwest::Method::GET, &self.base_url())
            .header("Content-Type", "application/json;charset=utf-8")
            .query(&[("mcpName", name)])
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(server = %name, error = %e, "failed to reach registry for get_by_name");
                return None;
            }
        };

        if !response.status().is_success() {
            warn!(server = %name, status = %response.status(), "registry returned non-success for get_by_name");
            return None;
        }

        let envelope: NacosEnvelope<serde_json::Value> = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!(server = %name, error = %e, "failed to decode registry response for get_by_name");
                return None;
            }
        };

        let data = envelope.data?;
        let mut descriptor = match ServerDescriptor::parse(data) {
            Ok(d) => d,
            Err(e) => {
                warn!(server = %name, error = %e, "failed to parse ServerDescriptor");
                return None;
            }
        };

        if !descriptor.is_stdio() {
            self.synthesize_transport_url(&mut descriptor, name);
        }

        Some(descriptor)
    }

    fn synthesize_transport_url(&self, descriptor: &mut ServerDescriptor, searching_name: &str) {
        let Some(endpoint) = descriptor.backend_endpoints.first() else {
            return;
        };
        if endpoint.port < 0 {
            return;
        }

        let http_schema = if endpoint.port == 443 { "https" } else { "http" };
        let mut export_path = descriptor.remote_server_config.export_path.clone();
        if !export_path.starts_with('/') {
            export_path = format!("/{export_path}");
        }
        let url = format!(
            "{http_schema}://{}:{}{export_path}",
            endpoint.address, endpoint.port
        );

        let mcp_servers = descriptor
            .agent_config
            .entry("mcpServers".to_string())
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
        if let serde_json::Value::Object(map) = mcp_servers {
            map.insert(
                searching_name.to_string(),
                serde_json::json!({
                    "name": searching_name,
                    "description": "",
                    "url": url,
                }),
            );
        }
    }

    async fn list_page(&self, page_no: u64, page_size: u64) -> (u64, Vec<String>) {
        let url = format!("{}/list", self.base_url());

        let response = match self
            .request(reqwest::Method::GET, &url)
            .header("Content-Type", "application/json;charset=utf-8")
            .query(&[("pageNo", page_no), ("pageSize", page_size)])
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "failed to reach registry for list_page");
                return (0, Vec::new());
            }
        };

        if !response.status().is_success() {
            warn!(status = %response.status(), "registry returned non-success for list_page");
            return (0, Vec::new());
        }

        let envelope: NacosEnvelope<ListPage> = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to decode registry response for list_page");
                return (0, Vec::new());
            }
        };

        let Some(page) = envelope.data else {
            return (0, Vec::new());
        };

        let names = page
            .page_items
            .into_iter()
            .filter(|item| item.enabled)
            .map(|item| item.name)
            .collect();

        (page.total_count, names)
    }

    /// Fetch every enabled, non-empty-description entry in the registry.
    ///
    /// Pages are walked sequentially (page size 100) but the per-page detail
    /// fetches within a page are issued concurrently, matching the original
    /// implementation's `asyncio.gather` fan-out.
    pub async fn list_all(&self) -> Vec<ServerDescriptor> {
        let mut out = Vec::new();
        let mut page_no = 1;
        const PAGE_SIZE: u64 = 100;

        loop {
            let (total_count, names) = self.list_page(page_no, PAGE_SIZE).await;
            if total_count == 0 || names.is_empty() {
                break;
            }

            let details = futures::future::join_all(
                names.iter().map(|name| self.get_by_name(name)),
            )
            .await;

            for detail in details.into_iter().flatten() {
                if detail.description.is_empty() {
                    continue;
                }
                out.push(detail);
            }

            if out.len() as u64 >= total_count {
                break;
            }
            page_no += 1;
        }

        out
    }

    /// Splice `tools` into the entry's `toolSpec.tools` and push the whole
    /// document back to the registry.
    ///
    /// `backendEndpoints` is removed from the round-tripped server document
    /// unconditionally. `endpointSpecification` is populated only for
    /// non-stdio protocols; stdio entries send `{}`. Both asymmetries mirror
    /// the registry's own write contract rather than inventing new shape.
    pub async fn update_tools(
        &self,
        name: &str,
        tools: &[crate::descriptor::ToolDefinition],
        current: &ServerDescriptor,
    ) -> Result<bool> {
        let mut server_doc = serde_json::to_value(current)?;
        if let serde_json::Value::Object(map) = &mut server_doc {
            map.remove("backendEndpoints");
        }

        let endpoint_specification = if current.is_stdio() {
            serde_json::json!({})
        } else {
            serde_json::json!({
                "type": "REF",
                "data": current.remote_server_config.service_ref,
            })
        };

        let mut tool_spec = serde_json::to_value(&current.tool_spec)?;
        if let serde_json::Value::Object(map) = &mut tool_spec {
            map.insert("tools".to_string(), serde_json::to_value(tools)?);
        }

        let form = [
            ("mcpName", name.to_string()),
            ("serverSpecification", server_doc.to_string()),
            ("endpointSpecification", endpoint_specification.to_string()),
            ("toolSpecification", tool_spec.to_string()),
        ];

        let response = match self
            .request(reqwest::Method::PUT, &self.base_url())
            .form(&form)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(server = %name, error = %e, "failed to reach registry for update_tools");
                return Ok(false);
            }
        };

        if !response.status().is_success() {
            warn!(server = %name, status = %response.status(), "registry rejected update_tools");
            return Ok(false);
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_uses_configured_scheme_and_addr() {
        let client = RegistryClient::new(RegistryClientConfig {
            addr: "127.0.0.1:8848".to_string(),
            username: "nacos".to_string(),
            password: "".to_string(),
            scheme: "http".to_string(),
        });
        assert_eq!(
            client.base_url(),
            "http://127.0.0.1:8848/nacos/v3/admin/ai/mcp"
        );
    }

    #[test]
    fn synthesizes_https_url_for_port_443() {
        let client = RegistryClient::new(RegistryClientConfig {
            addr: "127.0.0.1:8848".to_string(),
            username: "nacos".to_string(),
            password: "".to_string(),
            scheme: "http".to_string(),
        });

        let mut descriptor: ServerDescriptor = serde_json::from_value(serde_json::json!({
            "name": "weather",
            "protocol": "mcp-sse",
            "remoteServerConfig": {"exportPath": "sse"},
            "backendEndpoints": [{"address": "h", "port": 443}],
        }))
        .unwrap();

        client.synthesize_transport_url(&mut descriptor, "weather");

        let url = descriptor.agent_config["mcpServers"]["weather"]["url"]
            .as_str()
            .unwrap();
        assert_eq!(url, "https://h:443/sse");
    }

    #[test]
    fn synthesizes_http_url_and_prefixes_export_path() {
        let client = RegistryClient::new(RegistryClientConfig {
            addr: "127.0.0.1:8848".to_string(),
            username: "nacos".to_string(),
            password: "".to_string(),
            scheme: "http".to_string(),
        });

        let mut descriptor: ServerDescriptor = serde_json::from_value(serde_json::json!({
            "name": "weather",
            "protocol": "mcp-streamable",
            "remoteServerConfig": {"exportPath": "mcp"},
            "backendEndpoints": [{"address": "h", "port": 8080}],
        }))
        .unwrap();

        client.synthesize_transport_url(&mut descriptor, "weather");

        let url = descriptor.agent_config["mcpServers"]["weather"]["url"]
            .as_str()
            .unwrap();
        assert_eq!(url, "http://h:8080/mcp");
    }

    #[test]
    fn skips_synthesis_when_no_endpoints() {
        let client = RegistryClient::new(RegistryClientConfig {
            addr: "127.0.0.1:8848".to_string(),
            username: "nacos".to_string(),
            password: "".to_string(),
            scheme: "http".to_string(),
        });

        let mut descriptor: ServerDescriptor = serde_json::from_value(serde_json::json!({
            "name": "weather",
            "protocol": "mcp-sse",
        }))
        .unwrap();

        client.synthesize_transport_url(&mut descriptor, "weather");
        assert!(descriptor.agent_config.get("mcpServers").is_none());
    }
}
