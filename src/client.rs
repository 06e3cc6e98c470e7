use std::sync::Arc;

use reqwest::Client;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display};

use crate::bulk::{BulkAggregator, BulkResult};
use crate::command::{Command, CommandExecutor, CommandResult};
use crate::config::HomeAssistantConfig;
use crate::connection::{Connection, ConnectionStatus};
use crate::correlator::Outcome;
use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, AsRefStr)]
#[schemars(title = "Home Assistant Registry")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Registry {
    AreaRegistry,
    DeviceRegistry,
    EntityRegistry,
    FloorRegistry,
    LabelRegistry,
}

/// One Home Assistant session: a single command connection plus the REST
/// client used for state queries.
pub struct HomeAssistantClient {
    config: Arc<HomeAssistantConfig>,
    http_client: Client,
    connection: Arc<Connection>,
    executor: CommandExecutor,
    bulk: BulkAggregator,
}

impl HomeAssistantClient {
    /// Builds the client without touching the network; the command channel is
    /// opened by [`connect`](Self::connect) or by the first command.
    pub fn new(config: HomeAssistantConfig) -> Result<Self, ClientError> {
        config.websocket_url()?;

        let config = Arc::new(config);
        let connection = Arc::new(Connection::new(Arc::clone(&config)));
        let executor = CommandExecutor::new(Arc::clone(&connection), config.request_timeout);
        let bulk = BulkAggregator::new(executor.clone());

        Ok(Self {
            config,
            http_client: Client::new(),
            connection,
            executor,
            bulk,
        })
    }

    pub fn config(&self) -> &HomeAssistantConfig {
        &self.config
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.connection.connect().await
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Disconnects and waits briefly for the close frame to reach the server.
    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn pending_count(&self) -> usize {
        self.connection.pending_count()
    }

    pub async fn call_service(&self, command: &Command) -> Outcome {
        self.executor.execute(command).await
    }

    pub async fn call_services(&self, commands: &[Command]) -> BulkResult {
        self.bulk.execute_bulk(commands).await
    }

    /// Runs a generic correlated command and unwraps its payload. A failure
    /// reported by Home Assistant becomes [`ClientError::Api`] here since
    /// these callers only want data.
    pub async fn websocket_command(
        &self,
        kind: &str,
        fields: serde_json::Map<String, Value>,
    ) -> Result<Value, ClientError> {
        match self.executor.send_command(kind, fields).await? {
            CommandResult::Success(value) => Ok(value),
            CommandResult::Failure(remote) => Err(ClientError::Api(format!(
                "{} failed ({}): {}",
                kind, remote.code, remote.message
            ))),
        }
    }

    pub async fn list_registry(&self, registry: Registry) -> Result<Value, ClientError> {
        self.websocket_command(&format!("config/{}/list", registry), serde_json::Map::new())
            .await
    }

    pub async fn rest_get(&self, endpoint: &str) -> Result<Value, ClientError> {
        let url = self.config.rest_url(endpoint)?;
        let response = self
            .http_client
            .get(url)
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    ClientError::Http(format!(
                        "Cannot connect to Home Assistant at '{}'. Please check the URL and ensure Home Assistant is running.",
                        self.config.url
                    ))
                } else if e.is_timeout() {
                    ClientError::Http(format!(
                        "Timeout connecting to Home Assistant at '{}'",
                        self.config.url
                    ))
                } else {
                    ClientError::Http(format!("Network error accessing {}: {}", endpoint, e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());

            let error_msg = match status.as_u16() {
                401 => "Authentication failed. Please check your HASS_API_KEY is valid and has not expired.".to_string(),
                403 => "Access forbidden. Your HASS_API_KEY may not have sufficient permissions.".to_string(),
                404 => format!("Home Assistant API endpoint not found: {}", endpoint),
                500..=599 => format!("Home Assistant server error ({}): {}", status, error_text),
                _ => format!("HTTP error {} accessing {}: {}", status, endpoint, error_text),
            };

            return Err(ClientError::Api(error_msg));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::Protocol(format!("Failed to parse JSON: {}", e)))
    }
}

impl Drop for HomeAssistantClient {
    fn drop(&mut self) {
        self.connection.disconnect();
    }
}
