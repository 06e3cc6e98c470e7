use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::Connection;
use crate::correlator::{Outcome, PendingHandle};
use crate::error::ClientError;
use crate::frame;

/// What a service call addresses. Home Assistant accepts a union of these on
/// the wire; a command here names exactly one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Target {
    #[serde(rename = "entity_id")]
    Entities(Vec<String>),
    #[serde(rename = "device_id")]
    Devices(Vec<String>),
    #[serde(rename = "area_id")]
    Areas(Vec<String>),
}

impl Target {
    pub fn ids(&self) -> &[String] {
        match self {
            Target::Entities(ids) | Target::Devices(ids) | Target::Areas(ids) => ids,
        }
    }
}

/// A single service call, immutable once handed to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub domain: String,
    pub service: String,
    pub target: Option<Target>,
    pub service_data: Option<serde_json::Map<String, Value>>,
    pub return_response: bool,
}

impl Command {
    pub fn new(domain: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            target: None,
            service_data: None,
            return_response: false,
        }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_data(mut self, data: serde_json::Map<String, Value>) -> Self {
        self.service_data = Some(data);
        self
    }

    pub fn returning_response(mut self) -> Self {
        self.return_response = true;
        self
    }

    pub fn turn_on(entity_id: &str) -> Self {
        Self::for_entity(entity_id, "turn_on")
    }

    pub fn turn_off(entity_id: &str) -> Self {
        Self::for_entity(entity_id, "turn_off")
    }

    fn for_entity(entity_id: &str, service: &str) -> Self {
        let domain = entity_id.split('.').next().unwrap_or_default();
        Self::new(domain, service).with_target(Target::Entities(vec![entity_id.to_string()]))
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.domain.trim().is_empty() {
            return Err(ClientError::InvalidCommand("domain is required".into()));
        }
        if self.service.trim().is_empty() {
            return Err(ClientError::InvalidCommand("service is required".into()));
        }
        if let Some(target) = &self.target {
            if target.ids().is_empty() {
                return Err(ClientError::InvalidCommand(
                    "target must name at least one id".into(),
                ));
            }
            if target.ids().iter().any(|id| id.trim().is_empty()) {
                return Err(ClientError::InvalidCommand("target ids must not be empty".into()));
            }
        }
        Ok(())
    }

    /// Short human-readable label, e.g. `light.turn_on -> light.kitchen`.
    pub fn describe(&self) -> String {
        match &self.target {
            Some(target) => format!("{}.{} -> {}", self.domain, self.service, target.ids().join(", ")),
            None => format!("{}.{}", self.domain, self.service),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Outcome of one command as reported by Home Assistant.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Success(Value),
    Failure(RemoteError),
}

impl CommandResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandResult::Success(_))
    }
}

/// Runs commands over the shared connection, one correlated round trip each.
#[derive(Clone)]
pub struct CommandExecutor {
    connection: Arc<Connection>,
    request_timeout: Option<Duration>,
}

impl CommandExecutor {
    pub fn new(connection: Arc<Connection>, request_timeout: Option<Duration>) -> Self {
        Self {
            connection,
            request_timeout,
        }
    }

    /// Executes one service call. A failure reported by Home Assistant is an
    /// `Ok(CommandResult::Failure)`; only local faults are returned as `Err`.
    pub async fn execute(&self, command: &Command) -> Outcome {
        let handle = self.dispatch(command).await?;
        self.wait(handle).await
    }

    /// Sends a service call without waiting for its response. Frames
    /// dispatched one after another reach the wire in that order.
    pub async fn dispatch(&self, command: &Command) -> Result<PendingHandle, ClientError> {
        command.validate()?;
        tracing::debug!(command = %command.describe(), "dispatching command");
        self.submit(|id| frame::call_service_frame(id, command)).await
    }

    pub async fn wait(&self, handle: PendingHandle) -> Outcome {
        self.connection
            .correlator()
            .wait(handle, self.request_timeout)
            .await
    }

    /// Sends an arbitrary correlated command such as `config/device_registry/list`.
    pub async fn send_command(
        &self,
        kind: &str,
        fields: serde_json::Map<String, Value>,
    ) -> Outcome {
        if kind.trim().is_empty() {
            return Err(ClientError::InvalidCommand("command type is required".into()));
        }
        let handle = self
            .submit(|id| Ok(frame::command_frame(id, kind, fields)))
            .await?;
        self.wait(handle).await
    }

    async fn submit<F>(&self, build: F) -> Result<PendingHandle, ClientError>
    where
        F: FnOnce(u64) -> Result<Value, ClientError>,
    {
        self.connection.ensure_ready().await?;

        let correlator = self.connection.correlator();
        let id = correlator.next_id();
        let frame = build(id)?;
        let handle = correlator.register(id)?;

        if let Err(e) = self.connection.send(frame).await {
            correlator.reject(id, e.clone());
            return Err(e);
        }
        Ok(handle)
    }
}
