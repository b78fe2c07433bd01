use anyhow::Result;
use clap::Parser;
use nacos_mcp_router::{Config, Mode, RegistryClient, RegistryClientConfig, RegistryMirror, Router, RouterMode, VectorIndex};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Dynamic router and multiplexing proxy between an MCP agent and a fleet of
/// MCP tool servers registered in a Nacos registry.
///
/// Every setting besides log verbosity is read from the environment — see
/// `Config::from_env` — so this CLI exists to control logging and nothing
/// else.
#[derive(Parser)]
#[command(name = "nacos-mcp-router")]
struct Cli {
    /// Extra `tracing` filter directives, added on top of RUST_LOG.
    #[arg(long)]
    log: Option<String>,
}

fn init_tracing(extra: Option<&str>) -> Result<()> {
    let mut filter = EnvFilter::from_default_env()
        .add_directive("nacos_mcp_router=info".parse()?)
        .add_directive("rmcp=warn".parse()?);
    if let Some(extra) = extra {
        filter = filter.add_directive(extra.parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref())?;

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "router exited with error");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let registry = RegistryClient::new(RegistryClientConfig {
        addr: config.nacos_addr.clone(),
        username: config.nacos_username.clone(),
        password: config.nacos_password.clone(),
        scheme: config.nacos_scheme.clone(),
    });

    // The vector index is only useful in router mode, where semantic
    // search-by-description runs against a whole fleet of entries.
    let index = match &config.mode {
        Mode::Router => match VectorIndex::open_default().await {
            Ok(index) => Some(Arc::new(index)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to open vector index; semantic search top-up will be unavailable");
                None
            }
        },
        Mode::Proxy { .. } => None,
    };

    let mirror = Arc::new(RegistryMirror::new(registry, index));

    let mode = match &config.mode {
        Mode::Router => RouterMode::Router,
        Mode::Proxy {
            proxied_name,
            proxied_server_config,
        } => RouterMode::Proxy {
            proxied_name: proxied_name.clone(),
            proxied_server_config: proxied_server_config.clone(),
        },
    };

    let router = Router::with_auto_register(mode, mirror.clone(), config.auto_register_tools);

    match &config.mode {
        Mode::Router => {
            mirror.refresh_all().await;
            spawn_refresh_loop(mirror.clone(), config.update_interval_secs, config.debug_mode);
        }
        Mode::Proxy { .. } => {
            router.ensure_proxied_session().await?;
        }
    }

    let shutdown = {
        let router = router.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            router.shutdown().await;
        }
    };

    let addr = format!("0.0.0.0:{}", config.port);
    let serve = async {
        match config.transport {
            nacos_mcp_router::Transport::Stdio => {
                nacos_mcp_router::server::serve_stdio(router.clone()).await
            }
            nacos_mcp_router::Transport::Sse => {
                nacos_mcp_router::server::serve_sse(router.clone(), &addr).await
            }
            nacos_mcp_router::Transport::StreamableHttp => {
                nacos_mcp_router::server::serve_streamable_http(router.clone(), &addr).await
            }
        }
    };

    tokio::select! {
        result = serve => result,
        _ = shutdown => Ok(()),
    }
}

/// Background refresh loop driving `refresh_all` on an `interval_secs` cadence
/// (already clamped to at least 10 seconds by `Config::from_env`).
///
/// `DEBUG_MODE` disables the loop entirely after logging once — useful when
/// running against a registry snapshot that isn't expected to change.
fn spawn_refresh_loop(mirror: Arc<RegistryMirror>, interval_secs: u64, debug_mode: bool) {
    if debug_mode {
        tracing::info!("DEBUG_MODE set; background refresh loop disabled");
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.tick().await; // first tick fires immediately; the initial refresh already ran
        loop {
            ticker.tick().await;
            tracing::debug!("refreshing registry mirror");
            mirror.refresh_all().await;
        }
    });
}
