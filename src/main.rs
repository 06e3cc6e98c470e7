use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hass_command_mcp::config::{ConfigFile, DEFAULT_CONNECT_TIMEOUT};
use hass_command_mcp::{HomeAssistantClient, HomeAssistantConfig, HomeAssistantService};

#[derive(Parser)]
#[command(name = "hass-command-mcp")]
#[command(about = "Home Assistant MCP server for service calls and bulk control")]
#[command(version)]
struct Cli {
    /// Home Assistant URL (e.g., http://localhost:8123)
    #[arg(long = "url", env = "HASS_URL")]
    url: Option<String>,

    /// Home Assistant long-lived access token
    #[arg(long = "api-key", env = "HASS_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// YAML file with url, token, request_timeout_secs, connect_timeout_secs
    #[arg(long = "config", env = "HASS_CONFIG")]
    config: Option<PathBuf>,

    /// Per-request deadline in seconds (0 disables)
    #[arg(long = "request-timeout-secs", env = "HASS_REQUEST_TIMEOUT")]
    request_timeout_secs: Option<u64>,

    /// Deadline for connecting and authenticating, in seconds
    #[arg(long = "connect-timeout-secs", env = "HASS_CONNECT_TIMEOUT")]
    connect_timeout_secs: Option<u64>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<HomeAssistantConfig> {
        let file = match &self.config {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };

        let url = self
            .url
            .or(file.url)
            .context("Home Assistant URL missing: pass --url or set HASS_URL")?;
        let token = self
            .api_key
            .or(file.token)
            .context("access token missing: pass --api-key or set HASS_API_KEY")?;
        let request_timeout = self
            .request_timeout_secs
            .or(file.request_timeout_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let connect_timeout = self
            .connect_timeout_secs
            .or(file.connect_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        Ok(HomeAssistantConfig::new(url, token)
            .with_request_timeout(request_timeout)
            .with_connect_timeout(connect_timeout))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Cli::parse().into_config()?;
    let url = config.url.clone();
    let client = Arc::new(HomeAssistantClient::new(config)?);

    // Fail early on a bad URL or token.
    client.connect().await?;

    tracing::info!("🚀 Home Assistant MCP Server starting");
    tracing::info!("📡 Home Assistant URL: {}", url);

    let service = HomeAssistantService::new(Arc::clone(&client));
    let server_service = service
        .serve(stdio())
        .await
        .inspect_err(|error| tracing::error!(%error, "Error serving"))?;

    tokio::select! {
        quit = server_service.waiting() => { quit?; }
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted, shutting down"),
    }

    client.shutdown().await;
    Ok(())
}
