//! Process configuration: reads the flat environment-variable surface
//! described in the system's external interfaces and turns it into a typed,
//! validated `Config`. Bad values are reported as a [`ConfigError`], never a
//! panic — the only thing this module may do on its own is apply the
//! documented defaults.

use crate::error::ConfigError;
use std::env;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Router,
    Proxy {
        proxied_name: String,
        /// Optional direct server-connection override, taken from
        /// `PROXIED_MCP_SERVER_CONFIG` rather than fetched from the
        /// registry. When absent, proxy mode resolves the descriptor via
        /// the mirror exactly like router mode's `add_mcp_server`.
        proxied_server_config: Option<serde_json::Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stdio,
    Sse,
    StreamableHttp,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub nacos_addr: String,
    pub nacos_username: String,
    pub nacos_password: String,
    pub nacos_namespace: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    pub nacos_scheme: String,
    pub mode: Mode,
    pub transport: Transport,
    pub auto_register_tools: bool,
    pub update_interval_secs: u64,
    pub port: u16,
    pub debug_mode: bool,
}

const MIN_UPDATE_INTERVAL_SECS: u64 = 10;

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let nacos_addr = env_or(env::var("NACOS_ADDR"), "127.0.0.1:8848");

        let mode = parse_mode()?;
        let transport = parse_transport()?;

        let update_interval_secs = env::var("UPDATE_INTERVAL")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60)
            .max(MIN_UPDATE_INTERVAL_SECS);

        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(8000);

        Ok(Self {
            nacos_addr,
            nacos_username: env_or(env::var("NACOS_USERNAME"), "nacos"),
            nacos_password: env::var("NACOS_PASSWORD").unwrap_or_default(),
            nacos_namespace: env::var("NACOS_NAMESPACE").unwrap_or_default(),
            access_key_id: env::var("ACCESS_KEY_ID").unwrap_or_default(),
            access_key_secret: env::var("ACCESS_KEY_SECRET").unwrap_or_default(),
            nacos_scheme: env_or(env::var("NACOS_SERVER_SCHEMA"), "http"),
            mode,
            transport,
            auto_register_tools: env::var("AUTO_REGISTER_TOOLS")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            update_interval_secs,
            port,
            debug_mode: env::var("DEBUG_MODE").is_ok(),
        })
    }
}

fn env_or(value: Result<String, env::VarError>, default: &str) -> String {
    match value {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn parse_mode() -> Result<Mode, ConfigError> {
    let raw = env_or(env::var("MODE"), "router");
    match raw.as_str() {
        "router" => Ok(Mode::Router),
        "proxy" => {
            let proxied_name = env::var("PROXIED_MCP_NAME")
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingProxiedName)?;

            let proxied_server_config = match env::var("PROXIED_MCP_SERVER_CONFIG") {
                Ok(raw) if !raw.is_empty() => Some(serde_json::from_str(&raw)?),
                _ => None,
            };

            Ok(Mode::Proxy {
                proxied_name,
                proxied_server_config,
            })
        }
        other => Err(ConfigError::InvalidMode(other.to_string())),
    }
}

fn parse_transport() -> Result<Transport, ConfigError> {
    let raw = env_or(env::var("TRANSPORT_TYPE"), "stdio");
    match raw.as_str() {
        "stdio" => Ok(Transport::Stdio),
        "sse" => Ok(Transport::Sse),
        "streamable_http" => Ok(Transport::StreamableHttp),
        other => Err(ConfigError::InvalidTransport(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // `Config::from_env` reads shared process environment, so tests that
    // touch env vars are serialized to avoid interfering with each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for var in [
            "MODE",
            "TRANSPORT_TYPE",
            "PROXIED_MCP_NAME",
            "PROXIED_MCP_SERVER_CONFIG",
            "UPDATE_INTERVAL",
            "NACOS_ADDR",
            "DEBUG_MODE",
        ] {
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    fn defaults_to_router_mode_and_stdio_transport() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let config = Config::from_env().unwrap();
        assert_eq!(config.mode, Mode::Router);
        assert_eq!(config.transport, Transport::Stdio);
        assert_eq!(config.nacos_addr, "127.0.0.1:8848");
        clear_all();
    }

    #[test]
    fn proxy_mode_requires_proxied_name() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe { env::set_var("MODE", "proxy") };
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingProxiedName));
        clear_all();
    }

    #[test]
    fn invalid_mode_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe { env::set_var("MODE", "bogus") };
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMode(m) if m == "bogus"));
        clear_all();
    }

    #[test]
    fn invalid_transport_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe { env::set_var("TRANSPORT_TYPE", "carrier-pigeon") };
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTransport(t) if t == "carrier-pigeon"));
        clear_all();
    }

    #[test]
    fn update_interval_is_clamped_to_minimum() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe { env::set_var("UPDATE_INTERVAL", "1") };
        let config = Config::from_env().unwrap();
        assert_eq!(config.update_interval_secs, MIN_UPDATE_INTERVAL_SECS);
        clear_all();
    }

    #[test]
    fn proxy_mode_parses_server_config_override() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe {
            env::set_var("MODE", "proxy");
            env::set_var("PROXIED_MCP_NAME", "weather");
            env::set_var(
                "PROXIED_MCP_SERVER_CONFIG",
                r#"{"mcpServers":{"weather":{"url":"http://h:1/sse"}}}"#,
            );
        }
        let config = Config::from_env().unwrap();
        match config.mode {
            Mode::Proxy {
                proxied_name,
                proxied_server_config,
            } => {
                assert_eq!(proxied_name, "weather");
                assert!(proxied_server_config.is_some());
            }
            _ => panic!("expected proxy mode"),
        }
        clear_all();
    }
}
