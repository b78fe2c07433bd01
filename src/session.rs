//! Per-downstream-server lifecycle manager ("Session Supervisor").
//!
//! One `Session` wraps exactly one MCP client connection: it picks a
//! transport, opens it, drives the MCP `initialize` handshake, and then sits
//! ready to serve `list_tools`/`execute_tool` calls until asked to shut down.
//! The state machine is NEW -> INITIALIZING -> READY -> UNHEALTHY -> SHUTDOWN,
//! with an INITIALIZING -> FAILED -> SHUTDOWN branch when the transport or
//! handshake itself fails.

use anyhow::{Context, Result};
use rmcp::model::{CallToolRequestParam, Content, InitializeResult, JsonObject, Tool};
use rmcp::service::{RoleClient, RunningService};
use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess};
use rmcp::ServiceExt;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tracing::{error, info, warn};

type McpClient = RunningService<RoleClient, ()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Initializing,
    Ready,
    Unhealthy,
    Failed,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Stdio,
    Sse,
    StreamableHttp,
}

impl Protocol {
    /// `mcp-sse` | `mcp-streamable` | anything else => stdio.
    pub fn from_descriptor(protocol: &str) -> Self {
        match protocol {
            "mcp-sse" => Protocol::Sse,
            "mcp-streamable" => Protocol::StreamableHttp,
            _ => Protocol::Stdio,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub protocol: Option<Protocol>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub url: Option<String>,
    pub headers: HashMap<String, String>,
}

impl SessionConfig {
    /// Merge the process's default environment with user-supplied `env`
    /// keys; the user's values win on conflict.
    pub fn with_merged_default_env(mut self) -> Self {
        let mut merged: HashMap<String, String> = std::env::vars().collect();
        merged.extend(self.env);
        self.env = merged;
        self
    }

    fn protocol(&self) -> Protocol {
        self.protocol.unwrap_or(Protocol::Stdio)
    }
}

/// A supervised MCP client session for one downstream server.
pub struct Session {
    name: String,
    config: SessionConfig,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    client: RwLock<Option<McpClient>>,
    initialized_response: RwLock<Option<InitializeResult>>,
    shutdown_requested: AtomicBool,
    shutdown_notify: Notify,
    cleanup_lock: Mutex<()>,
}

impl Session {
    /// Construct a session and immediately spawn its background lifecycle
    /// task — the transport begins opening the moment this returns, not
    /// lazily on first use.
    pub fn spawn(name: String, config: SessionConfig) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(SessionState::New);
        let session = Arc::new(Self {
            name,
            config,
            state_tx,
            state_rx,
            client: RwLock::new(None),
            initialized_response: RwLock::new(None),
            shutdown_requested: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            cleanup_lock: Mutex::new(()),
        });

        tokio::spawn({
            let session = session.clone();
            async move {
                session.lifecycle().await;
            }
        });

        session
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn set_state(&self, state: SessionState) {
        let _ = self.state_tx.send(state);
    }

    async fn lifecycle(self: Arc<Self>) {
        self.set_state(SessionState::Initializing);

        let client = match self.open_transport().await {
            Ok(client) => client,
            Err(e) => {
                error!(server = %self.name, error = %e, "failed to open transport; session failed");
                self.set_state(SessionState::Failed);
                self.shutdown_notify.notify_waiters();
                self.set_state(SessionState::Shutdown);
                return;
            }
        };

        *self.initialized_response.write().await = client.peer_info().cloned();
        *self.client.write().await = Some(client);
        self.set_state(SessionState::Ready);
        info!(server = %self.name, "session ready");

        self.shutdown_notify.notified().await;
        self.teardown().await;
        self.set_state(SessionState::Shutdown);
    }

    async fn open_transport(&self) -> Result<McpClient> {
        match self.config.protocol() {
            Protocol::Stdio => self.open_stdio().await,
            Protocol::Sse => self.open_sse().await,
            Protocol::StreamableHttp => self.open_streamable_http().await,
        }
    }

    async fn open_stdio(&self) -> Result<McpClient> {
        let command = self
            .config
            .command
            .as_ref()
            .context("stdio session requires a command")?;

        let mut cmd = Command::new(command);
        if !self.config.args.is_empty() {
            cmd.args(self.config.args.iter().cloned());
        }
        if !self.config.env.is_empty() {
            cmd.envs(self.config.env.iter());
        }

        // stdin/stdout are piped for the MCP transport; stderr inherits so a
        // misbehaving child server's diagnostics still reach this process's logs.
        let cmd = cmd.configure(|c| {
            c.stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::inherit());
        });

        let child = TokioChildProcess::new(cmd)?;
        let client = ().serve(child).await?;
        Ok(client)
    }

    async fn open_sse(&self) -> Result<McpClient> {
        let url = self.config.url.as_ref().context("sse session requires a url")?;

        let http_client = if self.config.headers.is_empty() {
            reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()?
        } else {
            let mut headers = reqwest::header::HeaderMap::new();
            for (k, v) in &self.config.headers {
                if let (Ok(name), Ok(value)) = (
                    reqwest::header::HeaderName::from_bytes(k.as_bytes()),
                    reqwest::header::HeaderValue::from_str(v),
                ) {
                    headers.insert(name, value);
                }
            }
            reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .default_headers(headers)
                .build()?
        };

        let cfg = SseClientConfig {
            sse_endpoint: url.clone().into(),
            ..Default::default()
        };

        let transport = SseClientTransport::start_with_client(http_client, cfg).await?;
        let client = ().serve(transport).await?;
        Ok(client)
    }

    async fn open_streamable_http(&self) -> Result<McpClient> {
        let url = self
            .config
            .url
            .as_ref()
            .context("streamable http session requires a url")?;

        let transport = if let Some(auth) = self.config.headers.get("Authorization") {
            let mut cfg = StreamableHttpClientTransportConfig::with_uri(url.as_str());
            cfg.auth_header = Some(auth.clone());
            StreamableHttpClientTransport::from_config(cfg)
        } else {
            StreamableHttpClientTransport::from_uri(url.as_str())
        };

        let client = ().serve(transport).await?;
        Ok(client)
    }

    /// Resolves once initialization has either succeeded (READY) or failed
    /// (FAILED); after this, `healthy()` is authoritative.
    pub async fn wait_for_initialization(&self) {
        let mut rx = self.state_rx.clone();
        loop {
            let state = *rx.borrow();
            if !matches!(state, SessionState::New | SessionState::Initializing) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn initialized(&self) -> bool {
        matches!(self.state(), SessionState::Ready)
    }

    /// Active liveness check: in addition to the state machine being in
    /// READY, issues a cheap `list_tools` probe with a 5 second timeout.
    /// Connection-reset / closed-channel style errors mark the session
    /// unhealthy; other errors are logged but not treated as fatal, since a
    /// transient decode hiccup shouldn't evict a session that will recover.
    pub async fn healthy(&self) -> bool {
        if self.state() != SessionState::Ready {
            return false;
        }
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return false;
        }

        let probe = {
            let guard = self.client.read().await;
            let Some(client) = guard.as_ref() else {
                return false;
            };
            tokio::time::timeout(Duration::from_secs(5), client.list_tools(Default::default())).await
        };

        match probe {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                let message = e.to_string();
                if is_disconnect_error(&message) {
                    warn!(server = %self.name, error = %message, "health probe detected disconnect");
                    self.set_state(SessionState::Unhealthy);
                    false
                } else {
                    warn!(server = %self.name, error = %message, "health probe failed but is not treated as fatal");
                    true
                }
            }
            Err(_) => {
                warn!(server = %self.name, "health probe timed out after 5s");
                self.set_state(SessionState::Unhealthy);
                false
            }
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let guard = self.client.read().await;
        let client = guard.as_ref().context("session has no active client")?;
        Ok(client.list_tools(Default::default()).await?.tools)
    }

    /// Attempts the call once; on failure, sleeps, reopens the transport and
    /// re-runs `initialize`, then retries exactly once more. The final
    /// failure is propagated.
    ///
    /// rmcp's client `RunningService` performs its MCP `initialize` as part
    /// of `serve()` rather than exposing a standalone re-initialize call, so
    /// "re-run initialize on the existing streams" is realized here as
    /// reopening the transport in place and replacing the stored client —
    /// observably the same recovery path, just without literal stream reuse.
    pub async fn execute_tool(&self, tool_name: &str, arguments: JsonObject) -> Result<Vec<Content>> {
        match self.call_tool_once(tool_name, arguments.clone()).await {
            Ok(content) => Ok(content),
            Err(first_err) => {
                warn!(server = %self.name, tool = %tool_name, error = %first_err, "tool call failed, retrying after reinitialize");
                tokio::time::sleep(Duration::from_secs(1)).await;

                if let Err(e) = self.reinitialize().await {
                    error!(server = %self.name, error = %e, "reinitialize failed during retry");
                    return Err(first_err);
                }

                self.call_tool_once(tool_name, arguments).await
            }
        }
    }

    async fn call_tool_once(&self, tool_name: &str, arguments: JsonObject) -> Result<Vec<Content>> {
        let guard = self.client.read().await;
        let client = guard.as_ref().context("session has no active client")?;
        let request = CallToolRequestParam {
            name: Cow::from(tool_name.to_string()),
            arguments: Some(arguments),
        };
        let response = client.call_tool(request).await?;
        Ok(response.content)
    }

    async fn reinitialize(&self) -> Result<()> {
        let new_client = self.open_transport().await?;
        *self.initialized_response.write().await = new_client.peer_info().cloned();
        *self.client.write().await = Some(new_client);
        Ok(())
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    /// Idempotent resource release, serialized so a concurrent shutdown and
    /// supervisor teardown never double-close the transport.
    pub async fn cleanup(&self) {
        let _guard = self.cleanup_lock.lock().await;
        self.request_shutdown();
        self.teardown().await;
    }

    async fn teardown(&self) {
        let mut guard = self.client.write().await;
        if let Some(client) = guard.take() {
            if let Err(e) = client.cancel().await {
                warn!(server = %self.name, error = ?e, "error while closing session transport");
            }
        }
    }
}

fn is_disconnect_error(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("connection reset")
        || m.contains("broken pipe")
        || m.contains("channel closed")
        || m.contains("connection closed")
        || m.contains("eof")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_from_descriptor_matches_exact_names() {
        assert_eq!(Protocol::from_descriptor("mcp-sse"), Protocol::Sse);
        assert_eq!(
            Protocol::from_descriptor("mcp-streamable"),
            Protocol::StreamableHttp
        );
        assert_eq!(Protocol::from_descriptor("stdio"), Protocol::Stdio);
        assert_eq!(Protocol::from_descriptor("anything-else"), Protocol::Stdio);
    }

    #[test]
    fn merged_env_prefers_user_supplied_values() {
        unsafe {
            std::env::set_var("SESSION_TEST_VAR", "default");
        }
        let mut config = SessionConfig::default();
        config
            .env
            .insert("SESSION_TEST_VAR".to_string(), "override".to_string());
        let merged = config.with_merged_default_env();
        assert_eq!(
            merged.env.get("SESSION_TEST_VAR"),
            Some(&"override".to_string())
        );
        unsafe {
            std::env::remove_var("SESSION_TEST_VAR");
        }
    }

    #[test]
    fn disconnect_error_detection() {
        assert!(is_disconnect_error("Connection reset by peer"));
        assert!(is_disconnect_error("channel closed"));
        assert!(!is_disconnect_error("invalid tool arguments"));
    }
}
