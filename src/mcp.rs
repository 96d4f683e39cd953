//! Purpose: Provide the transport-agnostic MCP JSON-RPC pipeline for the gateway.
//! Key exports: `McpDispatcher`, `ClientMessage`, `Implementation`, request/response envelopes.
//! Role: Shared protocol adapter every transport is bound to; consults the `Registry`.
//! Invariants: JSON-RPC envelopes stay stable and method routing is deterministic.
//! Invariants: Unknown methods and malformed request shapes map to protocol errors.
//! Invariants: Capability failures are returned as successful `result.isError`, not as
//! protocol errors.
//! Invariants: Notifications (no `id`) never produce a response.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::registry::{CapabilityEntry, CapabilityKind, Peer, Registry};

pub const JSON_RPC_VERSION: &str = "2.0";
pub const LATEST_PROTOCOL_VERSION: &str = "2025-11-25";
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &["2025-11-25", "2025-06-18", "2025-03-26", "2024-11-05"];

pub const PARSE_ERROR_CODE: i32 = -32700;
pub const INVALID_REQUEST_CODE: i32 = -32600;
pub const METHOD_NOT_FOUND_CODE: i32 = -32601;
pub const INVALID_PARAMS_CODE: i32 = -32602;
pub const INTERNAL_ERROR_CODE: i32 = -32603;
pub const RESOURCE_NOT_FOUND_CODE: i32 = -32002;
pub const SESSION_ERROR_CODE: i32 = -32000;
pub const SESSION_TERMINATED_CODE: i32 = -32001;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    String(String),
    Number(i64),
    Null,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: JsonRpcId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: JsonRpcId, result: Value) -> Self {
        Self {
            jsonrpc: JSON_RPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: JsonRpcId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSON_RPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR_CODE, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST_CODE, message)
    }

    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self::new(METHOD_NOT_FOUND_CODE, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS_CODE, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR_CODE, message)
    }

    pub fn resource_not_found(uri: &str) -> Self {
        Self {
            code: RESOURCE_NOT_FOUND_CODE,
            message: "resource not found".to_string(),
            data: Some(json!({ "uri": uri })),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DispatchOutcome {
    Response(JsonRpcResponse),
    NoResponse,
}

/// Name and version the gateway reports to peers. Set once, never mutated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Implementation {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl Default for Implementation {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: Implementation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    pub tools: ListChangedCapability,
    pub resources: ResourcesCapability,
    pub prompts: ListChangedCapability,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListChangedCapability {
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesCapability {
    pub subscribe: bool,
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct McpResource {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct McpPrompt {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub arguments: Vec<PromptArgument>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub required: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCallRequest {
    pub name: String,
    pub arguments: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub content: Vec<Value>,
    #[serde(rename = "isError", default, skip_serializing_if = "is_false")]
    pub is_error: bool,
    #[serde(rename = "structuredContent", skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

impl ToolCallResult {
    pub fn success(content: Vec<Value>) -> Self {
        Self {
            content,
            is_error: false,
            structured_content: None,
        }
    }

    /// Strings become one text item; anything else is rendered as JSON text
    /// and echoed as `structuredContent`.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(text) => Self::success(vec![text_content(text)]),
            other => Self {
                content: vec![text_content(other.to_string())],
                is_error: false,
                structured_content: Some(other),
            },
        }
    }

    pub fn execution_error_text(message: impl Into<String>) -> Self {
        Self {
            content: vec![text_content(message.into())],
            is_error: true,
            structured_content: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceReadRequest {
    pub uri: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceReadResult {
    pub contents: Vec<ResourceContent>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceContent {
    pub uri: String,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptGetRequest {
    pub name: String,
    pub arguments: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromptGetResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: Value,
}

/// Every exchange kind the gateway understands, validated before routing.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    Initialize { protocol_version: Option<String> },
    Ping,
    ListTools,
    CallTool(ToolCallRequest),
    ListResources,
    ReadResource(ResourceReadRequest),
    ListPrompts,
    GetPrompt(PromptGetRequest),
    Notification(String),
}

impl ClientMessage {
    pub fn parse(request: &JsonRpcRequest) -> Result<Self, JsonRpcError> {
        let params = request.params.as_ref();
        if request.id.is_none() {
            ensure_object_or_absent(params)?;
            return Ok(ClientMessage::Notification(request.method.clone()));
        }
        match request.method.as_str() {
            "initialize" => {
                ensure_object_or_absent(params)?;
                let protocol_version = params
                    .and_then(|params| params.get("protocolVersion"))
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                Ok(ClientMessage::Initialize { protocol_version })
            }
            "ping" => {
                ensure_object_or_absent(params)?;
                Ok(ClientMessage::Ping)
            }
            "tools/list" => {
                ensure_object_or_absent(params)?;
                Ok(ClientMessage::ListTools)
            }
            "tools/call" => {
                let params = require_object_params(params, "tools/call requires object params")?;
                parse_tool_call_params(params).map(ClientMessage::CallTool)
            }
            "resources/list" => {
                ensure_object_or_absent(params)?;
                Ok(ClientMessage::ListResources)
            }
            "resources/read" => {
                let params =
                    require_object_params(params, "resources/read requires object params")?;
                parse_resource_read_params(params).map(ClientMessage::ReadResource)
            }
            "prompts/list" => {
                ensure_object_or_absent(params)?;
                Ok(ClientMessage::ListPrompts)
            }
            "prompts/get" => {
                let params = require_object_params(params, "prompts/get requires object params")?;
                parse_prompt_get_params(params).map(ClientMessage::GetPrompt)
            }
            _ => Err(JsonRpcError::method_not_found(format!(
                "method not found: {}",
                request.method
            ))),
        }
    }
}

/// The capability-dispatch pipeline transports are bound to.
#[derive(Clone, Debug)]
pub struct McpDispatcher {
    implementation: Implementation,
    registry: Arc<Registry>,
}

impl McpDispatcher {
    pub fn new(implementation: Implementation, registry: Arc<Registry>) -> Self {
        Self {
            implementation,
            registry,
        }
    }

    pub async fn dispatch_value(&self, value: Value) -> DispatchOutcome {
        self.dispatch_value_from(value, &Peer::detached()).await
    }

    /// Dispatches one message on behalf of `peer`, which handlers may notify.
    pub async fn dispatch_value_from(&self, value: Value, peer: &Peer) -> DispatchOutcome {
        match parse_jsonrpc_request(value) {
            Ok(request) => self.dispatch_request(request, peer).await,
            Err(response) => DispatchOutcome::Response(response),
        }
    }

    pub async fn dispatch_request(
        &self,
        request: JsonRpcRequest,
        peer: &Peer,
    ) -> DispatchOutcome {
        debug!(method = %request.method, "dispatching");
        let id = request.id.clone();
        let route_result = match ClientMessage::parse(&request) {
            Ok(message) => self.route(message, peer).await,
            Err(error) => Err(error),
        };
        match id {
            Some(response_id) => match route_result {
                Ok(result) => {
                    DispatchOutcome::Response(JsonRpcResponse::success(response_id, result))
                }
                Err(error) => DispatchOutcome::Response(JsonRpcResponse::error(response_id, error)),
            },
            None => DispatchOutcome::NoResponse,
        }
    }

    async fn route(&self, message: ClientMessage, peer: &Peer) -> Result<Value, JsonRpcError> {
        match message {
            ClientMessage::Initialize { protocol_version } => {
                to_value(self.initialize_result(protocol_version.as_deref()))
            }
            ClientMessage::Ping | ClientMessage::Notification(_) => Ok(json!({})),
            ClientMessage::ListTools => {
                let tools = self
                    .registry
                    .list(CapabilityKind::Tool)
                    .map(tool_descriptor)
                    .collect::<Vec<_>>();
                Ok(json!({ "tools": tools }))
            }
            ClientMessage::CallTool(call) => {
                let result = match self
                    .registry
                    .dispatch_with_peer(
                        CapabilityKind::Tool,
                        &call.name,
                        call.arguments,
                        peer.clone(),
                    )
                    .await
                {
                    Ok(value) => ToolCallResult::from_value(value),
                    Err(err) => {
                        debug!(tool = %call.name, error = %err, "tool call failed");
                        ToolCallResult::execution_error_text(error_text(&err))
                    }
                };
                to_value(result)
            }
            ClientMessage::ListResources => {
                let resources = self
                    .registry
                    .list(CapabilityKind::Resource)
                    .map(resource_descriptor)
                    .collect::<Vec<_>>();
                Ok(json!({ "resources": resources }))
            }
            ClientMessage::ReadResource(read) => self.read_resource(read, peer).await,
            ClientMessage::ListPrompts => {
                let prompts = self
                    .registry
                    .list(CapabilityKind::Prompt)
                    .map(prompt_descriptor)
                    .collect::<Vec<_>>();
                Ok(json!({ "prompts": prompts }))
            }
            ClientMessage::GetPrompt(get) => self.get_prompt(get, peer).await,
        }
    }

    async fn read_resource(
        &self,
        read: ResourceReadRequest,
        peer: &Peer,
    ) -> Result<Value, JsonRpcError> {
        let entry = self
            .registry
            .resource_by_uri(&read.uri)
            .ok_or_else(|| JsonRpcError::resource_not_found(&read.uri))?;
        let mime_type = entry.mime_type().map(ToString::to_string);
        let value = self
            .registry
            .dispatch_with_peer(
                CapabilityKind::Resource,
                entry.name(),
                Map::new(),
                peer.clone(),
            )
            .await
            .map_err(|err| JsonRpcError::internal_error(error_text(&err)))?;
        let text = match value {
            Value::String(text) => text,
            other => other.to_string(),
        };
        to_value(ResourceReadResult {
            contents: vec![ResourceContent {
                uri: read.uri,
                mime_type,
                text: Some(text),
                blob: None,
            }],
        })
    }

    async fn get_prompt(&self, get: PromptGetRequest, peer: &Peer) -> Result<Value, JsonRpcError> {
        let description = self
            .registry
            .get(CapabilityKind::Prompt, &get.name)
            .map(|entry| entry.description().to_string());
        let value = self
            .registry
            .dispatch_with_peer(
                CapabilityKind::Prompt,
                &get.name,
                get.arguments,
                peer.clone(),
            )
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound | ErrorKind::InvalidArguments => {
                    JsonRpcError::invalid_params(error_text(&err))
                }
                _ => JsonRpcError::internal_error(error_text(&err)),
            })?;
        let text = match value {
            Value::String(text) => text,
            other => other.to_string(),
        };
        to_value(PromptGetResult {
            description,
            messages: vec![PromptMessage {
                role: "user".to_string(),
                content: text_content(text),
            }],
        })
    }

    fn initialize_result(&self, requested: Option<&str>) -> InitializeResult {
        InitializeResult {
            protocol_version: negotiate_protocol_version(requested).to_string(),
            capabilities: ServerCapabilities {
                tools: ListChangedCapability {
                    list_changed: false,
                },
                resources: ResourcesCapability {
                    subscribe: false,
                    list_changed: false,
                },
                prompts: ListChangedCapability {
                    list_changed: false,
                },
            },
            server_info: self.implementation.clone(),
        }
    }
}

pub fn negotiate_protocol_version(requested: Option<&str>) -> &'static str {
    requested
        .and_then(|requested| {
            SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .find(|supported| **supported == requested)
                .copied()
        })
        .unwrap_or(LATEST_PROTOCOL_VERSION)
}

/// True when `value` is a JSON-RPC `initialize` request (not a notification).
pub fn is_initialize_request(value: &Value) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };
    object.get("jsonrpc").and_then(Value::as_str) == Some(JSON_RPC_VERSION)
        && object.get("method").and_then(Value::as_str) == Some("initialize")
        && object.get("id").is_some_and(|id| !id.is_null())
}

/// Parses one framed message. Bytes that are not UTF-8 JSON are a parse error.
pub fn parse_jsonrpc_message(bytes: &[u8]) -> Result<Value, JsonRpcError> {
    serde_json::from_slice::<Value>(bytes).map_err(|_| JsonRpcError::parse_error("invalid JSON"))
}

fn parse_jsonrpc_request(value: Value) -> Result<JsonRpcRequest, JsonRpcResponse> {
    let mut object = match value {
        Value::Object(object) => object,
        _ => {
            return Err(JsonRpcResponse::error(
                JsonRpcId::Null,
                JsonRpcError::invalid_request("request must be a JSON object"),
            ));
        }
    };

    let mut id: Option<JsonRpcId> = None;
    if let Some(raw_id) = object.remove("id") {
        let parsed_id = parse_jsonrpc_id(raw_id)
            .map_err(|error| JsonRpcResponse::error(JsonRpcId::Null, error))?;
        id = Some(parsed_id);
    }
    let error_id = id.clone().unwrap_or(JsonRpcId::Null);

    let jsonrpc = object
        .remove("jsonrpc")
        .and_then(|value| value.as_str().map(ToString::to_string))
        .ok_or_else(|| {
            JsonRpcResponse::error(
                error_id.clone(),
                JsonRpcError::invalid_request("missing jsonrpc field"),
            )
        })?;
    if jsonrpc != JSON_RPC_VERSION {
        return Err(JsonRpcResponse::error(
            error_id,
            JsonRpcError::invalid_request("jsonrpc must be \"2.0\""),
        ));
    }

    let method = object
        .remove("method")
        .and_then(|value| value.as_str().map(ToString::to_string))
        .ok_or_else(|| {
            JsonRpcResponse::error(
                error_id.clone(),
                JsonRpcError::invalid_request("missing method field"),
            )
        })?;

    let params = object.remove("params");
    Ok(JsonRpcRequest {
        jsonrpc,
        id,
        method,
        params,
    })
}

fn parse_jsonrpc_id(value: Value) -> Result<JsonRpcId, JsonRpcError> {
    match value {
        Value::String(value) => Ok(JsonRpcId::String(value)),
        Value::Number(value) => value
            .as_i64()
            .map(JsonRpcId::Number)
            .ok_or_else(|| JsonRpcError::invalid_request("id must be an integer number")),
        Value::Null => Ok(JsonRpcId::Null),
        _ => Err(JsonRpcError::invalid_request(
            "id must be a string, integer number, or null",
        )),
    }
}

fn require_object_params<'a>(
    params: Option<&'a Value>,
    message: &'static str,
) -> Result<&'a Map<String, Value>, JsonRpcError> {
    match params {
        Some(Value::Object(map)) => Ok(map),
        _ => Err(JsonRpcError::invalid_params(message)),
    }
}

fn ensure_object_or_absent(params: Option<&Value>) -> Result<(), JsonRpcError> {
    match params {
        None | Some(Value::Null) | Some(Value::Object(_)) => Ok(()),
        _ => Err(JsonRpcError::invalid_params(
            "params must be an object when provided",
        )),
    }
}

fn parse_named_arguments(
    params: &Map<String, Value>,
    method: &str,
) -> Result<(String, Map<String, Value>), JsonRpcError> {
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            JsonRpcError::invalid_params(format!("{method} requires string param `name`"))
        })?
        .to_string();

    let arguments = match params.get("arguments") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(arguments)) => arguments.clone(),
        Some(_) => {
            return Err(JsonRpcError::invalid_params(format!(
                "{method} `arguments` must be an object"
            )));
        }
    };
    Ok((name, arguments))
}

fn parse_tool_call_params(params: &Map<String, Value>) -> Result<ToolCallRequest, JsonRpcError> {
    let (name, arguments) = parse_named_arguments(params, "tools/call")?;
    Ok(ToolCallRequest { name, arguments })
}

fn parse_prompt_get_params(params: &Map<String, Value>) -> Result<PromptGetRequest, JsonRpcError> {
    let (name, arguments) = parse_named_arguments(params, "prompts/get")?;
    Ok(PromptGetRequest { name, arguments })
}

fn parse_resource_read_params(
    params: &Map<String, Value>,
) -> Result<ResourceReadRequest, JsonRpcError> {
    let uri = params
        .get("uri")
        .and_then(Value::as_str)
        .ok_or_else(|| JsonRpcError::invalid_params("resources/read requires string param `uri`"))?
        .to_string();
    Ok(ResourceReadRequest { uri })
}

fn tool_descriptor(entry: &CapabilityEntry) -> McpTool {
    McpTool {
        name: entry.name().to_string(),
        description: entry.description().to_string(),
        input_schema: entry.input_schema().clone(),
    }
}

fn resource_descriptor(entry: &CapabilityEntry) -> McpResource {
    McpResource {
        uri: entry.uri().unwrap_or_default().to_string(),
        name: entry.name().to_string(),
        description: non_empty(entry.description()),
        mime_type: entry.mime_type().map(ToString::to_string),
    }
}

fn prompt_descriptor(entry: &CapabilityEntry) -> McpPrompt {
    let schema = entry.input_schema();
    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect::<Vec<_>>())
        .unwrap_or_default();
    let arguments = schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|properties| {
            properties
                .iter()
                .map(|(name, property)| PromptArgument {
                    name: name.clone(),
                    description: property
                        .get("description")
                        .and_then(Value::as_str)
                        .map(ToString::to_string),
                    required: required.contains(&name.as_str()),
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    McpPrompt {
        name: entry.name().to_string(),
        description: non_empty(entry.description()),
        arguments,
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn text_content(text: String) -> Value {
    json!({
        "type": "text",
        "text": text,
    })
}

fn error_text(err: &Error) -> String {
    err.message()
        .map(ToString::to_string)
        .unwrap_or_else(|| err.to_string())
}

fn to_value<T: Serialize>(value: T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|_| JsonRpcError::internal_error("failed to encode result"))
}

fn is_false(value: &bool) -> bool {
    !*value
}
