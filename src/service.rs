use std::sync::Arc;

use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, ErrorData as McpError, Implementation,
    JsonObject, ListToolsResult, PaginatedRequestParam, ProtocolVersion, ServerCapabilities,
    ServerInfo, Tool,
};
use rmcp::service::RequestContext;
use rmcp::{RoleServer, ServerHandler};
use schemars::{JsonSchema, SchemaGenerator};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::client::{HomeAssistantClient, Registry};
use crate::command::{Command, CommandResult, Target};
use crate::error::ClientError;

fn schema_for_type<T: JsonSchema>() -> Arc<JsonObject> {
    let schema = SchemaGenerator::default().into_root_schema_for::<T>();
    match serde_json::to_value(schema) {
        Ok(Value::Object(object)) => Arc::new(object),
        _ => Arc::new(JsonObject::new()),
    }
}

// =============================================================================
// Tool Arguments
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CallServiceArgs {
    /// Service domain (e.g., light, switch, climate)
    pub domain: String,
    /// Service name (e.g., turn_on, toggle, set_temperature)
    pub service: String,
    /// Target entity IDs
    #[serde(default)]
    pub entity_id: Option<Vec<String>>,
    /// Target device IDs
    #[serde(default)]
    pub device_id: Option<Vec<String>>,
    /// Target area IDs
    #[serde(default)]
    pub area_id: Option<Vec<String>>,
    /// Service data (e.g., {"brightness": 128})
    #[serde(default)]
    pub data: Option<serde_json::Map<String, Value>>,
    /// Ask Home Assistant to return the service response
    #[serde(default)]
    pub return_response: bool,
}

impl CallServiceArgs {
    pub fn into_command(self) -> Result<Command, ClientError> {
        let targets: Vec<Target> = [
            self.entity_id.map(Target::Entities),
            self.device_id.map(Target::Devices),
            self.area_id.map(Target::Areas),
        ]
        .into_iter()
        .flatten()
        .collect();

        if targets.len() > 1 {
            return Err(ClientError::InvalidCommand(
                "specify only one of entity_id, device_id or area_id".into(),
            ));
        }

        let mut command = Command::new(self.domain, self.service);
        command.target = targets.into_iter().next();
        command.service_data = self.data;
        command.return_response = self.return_response;
        command.validate()?;
        Ok(command)
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct BulkControlArgs {
    /// Service calls to run together
    pub operations: Vec<CallServiceArgs>,
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct GetStatesArgs {
    /// Domain filter (e.g., light)
    #[serde(default)]
    pub domain: Option<String>,
    /// Fuzzy search over entity IDs and friendly names
    #[serde(default)]
    pub search: Option<String>,
    /// Include entity attributes
    #[serde(default)]
    pub include_attributes: bool,
    /// Maximum number of entities to return
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GetEntityStateArgs {
    /// Entity ID
    pub entity_id: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ListServicesArgs {
    /// Domain filter
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RegistryListArgs {
    /// Registry to list
    pub registry: Registry,
    /// Maximum number of items to return
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionStatusArgs {}

const DEFAULT_LIMIT: usize = 50;

/// Applies domain filter, fuzzy search and limit to an `api/states` payload.
/// Search results are ordered best match first.
pub fn filter_states(states: &[Value], args: &GetStatesArgs) -> Vec<Value> {
    let domain_prefix = args.domain.as_ref().map(|d| format!("{}.", d));
    let in_domain = |state: &&Value| match &domain_prefix {
        Some(prefix) => state
            .get("entity_id")
            .and_then(|id| id.as_str())
            .map(|id| id.starts_with(prefix.as_str()))
            .unwrap_or(false),
        None => true,
    };

    let mut selected: Vec<&Value> = match &args.search {
        Some(pattern) => {
            let matcher = SkimMatcherV2::default();
            let mut scored: Vec<(i64, &Value)> = states
                .iter()
                .filter(in_domain)
                .filter_map(|state| {
                    let entity_id = state.get("entity_id").and_then(|v| v.as_str())?;
                    let name = state
                        .pointer("/attributes/friendly_name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    let score = matcher
                        .fuzzy_match(entity_id, pattern)
                        .max(matcher.fuzzy_match(name, pattern))?;
                    Some((score, state))
                })
                .collect();
            scored.sort_by(|a, b| b.0.cmp(&a.0));
            scored.into_iter().map(|(_, state)| state).collect()
        }
        None => states.iter().filter(in_domain).collect(),
    };
    selected.truncate(args.limit.unwrap_or(DEFAULT_LIMIT));

    selected
        .into_iter()
        .map(|state| {
            if args.include_attributes {
                state.clone()
            } else {
                json!({
                    "entity_id": state.get("entity_id"),
                    "state": state.get("state"),
                    "friendly_name": state.pointer("/attributes/friendly_name"),
                    "last_changed": state.get("last_changed"),
                })
            }
        })
        .collect()
}

fn parse_args<T: DeserializeOwned>(
    tool: &str,
    arguments: JsonObject,
    expected: &str,
) -> Result<T, McpError> {
    serde_json::from_value(Value::Object(arguments)).map_err(|e| {
        McpError::invalid_params(
            format!("{}: Invalid arguments - {}. Expected: {}", tool, e, expected),
            None,
        )
    })
}

// =============================================================================
// Service Layer
// =============================================================================

#[derive(Clone)]
pub struct HomeAssistantService {
    client: Arc<HomeAssistantClient>,
}

impl HomeAssistantService {
    pub fn new(client: Arc<HomeAssistantClient>) -> Self {
        Self { client }
    }

    fn format_json_result(&self, data: &Value) -> Result<CallToolResult, McpError> {
        let pretty_json = serde_json::to_string_pretty(data)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(pretty_json)]))
    }

    async fn call_service(&self, args: CallServiceArgs) -> Result<CallToolResult, McpError> {
        let command = args.into_command()?;
        match self.client.call_service(&command).await? {
            CommandResult::Success(result) => self.format_json_result(&json!({
                "success": true,
                "command": command.describe(),
                "result": result,
            })),
            CommandResult::Failure(remote) => Ok(CallToolResult::error(vec![Content::text(
                format!(
                    "{} failed ({}): {}",
                    command.describe(),
                    remote.code,
                    remote.message
                ),
            )])),
        }
    }

    async fn bulk_control(&self, args: BulkControlArgs) -> Result<CallToolResult, McpError> {
        let commands = args
            .operations
            .into_iter()
            .enumerate()
            .map(|(index, op)| {
                op.into_command().map_err(|e| {
                    McpError::invalid_params(format!("operations[{}]: {}", index, e), None)
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let result = self.client.call_services(&commands).await;
        let data = serde_json::to_value(&result)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        self.format_json_result(&json!({
            "summary": result.summary(),
            "total": result.total,
            "succeeded": result.succeeded(),
            "failed_count": result.failed_count(),
            "details": data,
        }))
    }

    async fn get_states(&self, args: GetStatesArgs) -> Result<CallToolResult, McpError> {
        let states = self.client.rest_get("api/states").await?;
        let empty_vec = vec![];
        let filtered = filter_states(states.as_array().unwrap_or(&empty_vec), &args);
        self.format_json_result(&Value::Array(filtered))
    }

    async fn get_entity_state(&self, args: GetEntityStateArgs) -> Result<CallToolResult, McpError> {
        if !args.entity_id.contains('.') {
            return Err(McpError::invalid_params(
                format!("'{}' is not an entity ID (expected domain.object_id)", args.entity_id),
                None,
            ));
        }
        let state = self
            .client
            .rest_get(&format!("api/states/{}", args.entity_id))
            .await?;
        self.format_json_result(&state)
    }

    async fn list_services(&self, args: ListServicesArgs) -> Result<CallToolResult, McpError> {
        let mut services = self.client.rest_get("api/services").await?;
        if let (Some(domain), Some(array)) = (&args.domain, services.as_array_mut()) {
            array.retain(|entry| entry.get("domain").and_then(|d| d.as_str()) == Some(domain));
        }
        self.format_json_result(&services)
    }

    async fn registry_list(&self, args: RegistryListArgs) -> Result<CallToolResult, McpError> {
        let mut result = self.client.list_registry(args.registry).await?;
        if let Some(array) = result.as_array_mut() {
            array.truncate(args.limit.unwrap_or(DEFAULT_LIMIT));
        }
        self.format_json_result(&result)
    }

    async fn connection_status(&self) -> Result<CallToolResult, McpError> {
        let status = serde_json::to_value(self.client.status())
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        self.format_json_result(&status)
    }
}

impl ServerHandler for HomeAssistantService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "This server controls Home Assistant through service calls over a persistent WebSocket connection.".into(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let tools = vec![
            Tool::new(
                "call_service",
                "Call a Home Assistant service on entities, devices or areas",
                schema_for_type::<CallServiceArgs>(),
            ),
            Tool::new(
                "bulk_control",
                "Run several service calls at once and report which succeeded and which failed. One failure never stops the others.",
                schema_for_type::<BulkControlArgs>(),
            ),
            Tool::new(
                "get_states",
                "Get current entity states, optionally filtered by domain or fuzzy search",
                schema_for_type::<GetStatesArgs>(),
            ),
            Tool::new(
                "get_entity_state",
                "Get the full state object of one entity",
                schema_for_type::<GetEntityStateArgs>(),
            ),
            Tool::new(
                "list_services",
                "List available services, optionally for one domain",
                schema_for_type::<ListServicesArgs>(),
            ),
            Tool::new(
                "registry_list",
                "List items from a Home Assistant registry",
                schema_for_type::<RegistryListArgs>(),
            ),
            Tool::new(
                "connection_status",
                "Show the state of the command connection to Home Assistant",
                schema_for_type::<ConnectionStatusArgs>(),
            ),
        ];

        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let arguments = request.arguments.unwrap_or_default();

        match request.name.as_ref() {
            "call_service" => {
                let args = parse_args(
                    "call_service",
                    arguments,
                    r#"{"domain": "string", "service": "string", "entity_id": ["string"] (optional), "data": object (optional)}"#,
                )?;
                self.call_service(args).await
            }
            "bulk_control" => {
                let args = parse_args(
                    "bulk_control",
                    arguments,
                    r#"{"operations": [{"domain": "string", "service": "string", "entity_id": ["string"]}]}"#,
                )?;
                self.bulk_control(args).await
            }
            "get_states" => {
                let args = parse_args(
                    "get_states",
                    arguments,
                    r#"{"domain": "string (optional)", "search": "string (optional)", "limit": number (optional)}"#,
                )?;
                self.get_states(args).await
            }
            "get_entity_state" => {
                let args = parse_args("get_entity_state", arguments, r#"{"entity_id": "string"}"#)?;
                self.get_entity_state(args).await
            }
            "list_services" => {
                let args =
                    parse_args("list_services", arguments, r#"{"domain": "string (optional)"}"#)?;
                self.list_services(args).await
            }
            "registry_list" => {
                let args = parse_args(
                    "registry_list",
                    arguments,
                    r#"{"registry": "area_registry|device_registry|entity_registry|floor_registry|label_registry", "limit": number (optional)}"#,
                )?;
                self.registry_list(args).await
            }
            "connection_status" => self.connection_status().await,
            unknown_tool => Err(McpError::invalid_params(
                format!(
                    "Unknown tool: '{}'. Available tools: call_service, bulk_control, get_states, get_entity_state, list_services, registry_list, connection_status",
                    unknown_tool
                ),
                None,
            )),
        }
    }
}
