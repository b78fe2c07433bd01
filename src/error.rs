//! Structured error types for pieces of the router that branch on error kind.
//!
//! Most of the codebase propagates failures with `anyhow::Result` and a
//! `tracing::warn!`/`tracing::error!` at the point of failure, matching the
//! rest of this crate's style. These two enums exist only where a caller
//! needs to match on *why* something failed rather than just log it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid MODE `{0}`, expected `router` or `proxy`")]
    InvalidMode(String),

    #[error("invalid TRANSPORT_TYPE `{0}`, expected `stdio`, `sse`, or `streamable_http`")]
    InvalidTransport(String),

    #[error("MODE=proxy requires PROXIED_MCP_NAME to be set")]
    MissingProxiedName,

    #[error("PROXIED_MCP_SERVER_CONFIG is not valid JSON: {0}")]
    InvalidProxiedServerConfig(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("descriptor is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("failed to parse descriptor: {0}")]
    Malformed(#[from] serde_json::Error),
}
