//! One client connection
//!
//! A session owns the connection's [`Protocol`], remembers what the client
//! negotiated, and answers MCP methods against the server's shared registry.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{McpError, Result};
use crate::mcp::prompts::{check_required_arguments, PromptProvider};
use crate::mcp::protocol::{Protocol, RequestContext, RequestHandler, RequestOptions};
use crate::mcp::resources::ResourceProvider;
use crate::mcp::server::ServerShared;
use crate::mcp::tools::ToolContext;
use crate::mcp::types::*;

#[derive(Debug, Default)]
struct SessionState {
    initialize_received: bool,
    initialized: bool,
    protocol_version: Option<String>,
    client_info: Option<Implementation>,
    client_capabilities: ClientCapabilities,
    log_level: Option<LoggingLevel>,
    subscriptions: HashSet<String>,
}

pub struct Session {
    id: String,
    shared: Arc<ServerShared>,
    protocol: Protocol,
    state: RwLock<SessionState>,
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> std::result::Result<T, JsonRpcError> {
    serde_json::from_value(params.unwrap_or_else(|| json!({})))
        .map_err(|e| JsonRpcError::invalid_params(format!("Invalid params: {}", e)))
}

fn to_result<T: Serialize>(value: &T) -> std::result::Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal_error(e.to_string()))
}

impl Session {
    pub(crate) fn new(id: String, shared: Arc<ServerShared>, protocol: Protocol) -> Self {
        Self {
            id,
            shared,
            protocol,
            state: RwLock::new(SessionState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Feed one message from the transport
    pub async fn receive(self: &Arc<Self>, message: JsonRpcMessage) {
        let handler: Arc<dyn RequestHandler> = self.clone();
        self.protocol.handle_message(message, handler).await;
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.read().await.initialized
    }

    pub async fn client_info(&self) -> Option<Implementation> {
        self.state.read().await.client_info.clone()
    }

    pub async fn client_capabilities(&self) -> ClientCapabilities {
        self.state.read().await.client_capabilities.clone()
    }

    pub async fn protocol_version(&self) -> Option<String> {
        self.state.read().await.protocol_version.clone()
    }

    pub async fn log_level(&self) -> Option<LoggingLevel> {
        self.state.read().await.log_level
    }

    /// Skip the handshake; used for transient stateless HTTP sessions
    pub(crate) async fn assume_initialized(&self) {
        let mut state = self.state.write().await;
        state.initialize_received = true;
        state.initialized = true;
    }

    pub async fn is_subscribed(&self, uri: &str) -> bool {
        self.state.read().await.subscriptions.contains(uri)
    }

    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        Ok(self.protocol.notify(method, params, None)?)
    }

    /// Send `notifications/message` unless the client asked for a higher threshold
    pub async fn send_log(&self, level: LoggingLevel, logger: Option<&str>, data: Value) -> Result<bool> {
        if self.log_level().await.is_some_and(|min| level < min) {
            return Ok(false);
        }
        let params = LoggingMessageParams {
            level,
            logger: logger.map(str::to_string),
            data,
        };
        self.notify(methods::LOG_MESSAGE, Some(serde_json::to_value(&params)?))?;
        Ok(true)
    }

    /// Server-to-client request, checked against what the client advertised
    pub async fn request(&self, method: &str, params: Option<Value>, options: RequestOptions) -> Result<Value> {
        self.assert_client_capability(method).await?;
        Ok(self.protocol.request(method, params, options).await?)
    }

    async fn assert_client_capability(&self, method: &str) -> std::result::Result<(), McpError> {
        let caps = self.client_capabilities().await;
        let missing = match method {
            methods::ELICIT if caps.elicitation.is_none() => Some("elicitation"),
            "sampling/createMessage" if caps.sampling.is_none() => Some("sampling"),
            "roots/list" if caps.roots.is_none() => Some("roots"),
            _ => None,
        };
        match missing {
            Some(capability) => Err(McpError::CapabilityNotSupported {
                capability: capability.to_string(),
                method: method.to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn close(&self) {
        self.protocol.close();
    }

    // ==================== Handlers ====================

    async fn handle_initialize(&self, params: Option<Value>) -> std::result::Result<Value, JsonRpcError> {
        let params: InitializeParams = parse_params(params)?;
        let version = negotiate_protocol_version(&params.protocol_version);
        info!(
            session = %self.id,
            client = %params.client_info.name,
            client_version = %params.client_info.version,
            requested = %params.protocol_version,
            negotiated = version,
            "initializing session"
        );

        {
            let mut state = self.state.write().await;
            state.initialize_received = true;
            state.protocol_version = Some(version.to_string());
            state.client_info = Some(params.client_info);
            state.client_capabilities = params.capabilities;
        }

        to_result(&InitializeResult {
            protocol_version: version.to_string(),
            capabilities: self.shared.capabilities(),
            server_info: self.shared.implementation(),
            instructions: self.shared.config.instructions.clone(),
        })
    }

    async fn handle_call_tool(
        &self,
        params: Option<Value>,
        ctx: RequestContext,
    ) -> std::result::Result<Value, JsonRpcError> {
        let params: CallToolParams = parse_params(params)?;
        let supports_elicitation = self
            .state
            .read()
            .await
            .client_capabilities
            .elicitation
            .is_some();
        let tool_ctx = ToolContext::for_request(
            ctx,
            self.id.clone(),
            supports_elicitation,
            self.shared.config.request_timeout(),
        );

        debug!(session = %self.id, tool = %params.name, "calling tool");
        let result = self
            .shared
            .tools
            .call(&params.name, params.arguments, tool_ctx)
            .await;
        to_result(&result)
    }

    fn resources(&self, method: &str) -> std::result::Result<&Arc<dyn ResourceProvider>, JsonRpcError> {
        self.shared
            .resources
            .as_ref()
            .ok_or_else(|| JsonRpcError::method_not_found(method))
    }

    fn prompts(&self, method: &str) -> std::result::Result<&Arc<dyn PromptProvider>, JsonRpcError> {
        self.shared
            .prompts
            .as_ref()
            .ok_or_else(|| JsonRpcError::method_not_found(method))
    }

    async fn handle_resources(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> std::result::Result<Value, JsonRpcError> {
        let provider = self.resources(method)?;
        match method {
            methods::LIST_RESOURCES => {
                let resources = provider.list().await.map_err(|e| e.to_rpc_error())?;
                to_result(&ListResourcesResult { resources })
            }
            methods::LIST_RESOURCE_TEMPLATES => {
                let resource_templates = provider.templates().await.map_err(|e| e.to_rpc_error())?;
                to_result(&ListResourceTemplatesResult { resource_templates })
            }
            methods::READ_RESOURCE => {
                let ResourceUriParams { uri } = parse_params(params)?;
                match provider.read(&uri).await.map_err(|e| e.to_rpc_error())? {
                    Some(contents) => to_result(&ReadResourceResult { contents }),
                    None => Err(McpError::ResourceNotFound { uri }.to_rpc_error()),
                }
            }
            methods::SUBSCRIBE => {
                let ResourceUriParams { uri } = parse_params(params)?;
                debug!(session = %self.id, %uri, "subscribed to resource");
                self.state.write().await.subscriptions.insert(uri);
                Ok(json!({}))
            }
            methods::UNSUBSCRIBE => {
                let ResourceUriParams { uri } = parse_params(params)?;
                self.state.write().await.subscriptions.remove(&uri);
                Ok(json!({}))
            }
            _ => Err(JsonRpcError::method_not_found(method)),
        }
    }

    async fn handle_prompts(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> std::result::Result<Value, JsonRpcError> {
        let provider = self.prompts(method)?;
        let prompts = provider.list().await.map_err(|e| e.to_rpc_error())?;
        if method == methods::LIST_PROMPTS {
            return to_result(&ListPromptsResult { prompts });
        }

        let params: GetPromptParams = parse_params(params)?;
        let prompt = prompts
            .iter()
            .find(|p| p.name == params.name)
            .ok_or_else(|| {
                McpError::PromptNotFound {
                    name: params.name.clone(),
                }
                .to_rpc_error()
            })?;
        check_required_arguments(prompt, &params.arguments)
            .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;

        match provider
            .get(&params.name, &params.arguments)
            .await
            .map_err(|e| e.to_rpc_error())?
        {
            Some(result) => to_result(&result),
            None => Err(McpError::PromptNotFound { name: params.name }.to_rpc_error()),
        }
    }
}

#[async_trait]
impl RequestHandler for Session {
    async fn handle_request(
        &self,
        request: JsonRpcRequest,
        ctx: RequestContext,
    ) -> std::result::Result<Value, JsonRpcError> {
        debug!(session = %self.id, method = %request.method, id = %request.id, "handling request");
        let method = request.method.as_str();

        match method {
            methods::INITIALIZE => return self.handle_initialize(request.params).await,
            methods::PING => return Ok(json!({})),
            _ => {}
        }

        let state = self.state.read().await;
        let handshake_seen = state.initialize_received || state.initialized;
        drop(state);
        // pipelined input can deliver `initialized` before the initialize task has run
        if !handshake_seen {
            return Err(JsonRpcError::invalid_request("Server not initialized"));
        }

        match method {
            methods::LIST_TOOLS => to_result(&ListToolsResult {
                tools: self.shared.tools.definitions(),
            }),
            methods::CALL_TOOL => self.handle_call_tool(request.params, ctx).await,
            methods::LIST_RESOURCES
            | methods::LIST_RESOURCE_TEMPLATES
            | methods::READ_RESOURCE
            | methods::SUBSCRIBE
            | methods::UNSUBSCRIBE => self.handle_resources(method, request.params).await,
            methods::LIST_PROMPTS | methods::GET_PROMPT => {
                self.handle_prompts(method, request.params).await
            }
            methods::SET_LEVEL => {
                let SetLevelParams { level } = parse_params(request.params)?;
                info!(session = %self.id, ?level, "client set log level");
                self.state.write().await.log_level = Some(level);
                Ok(json!({}))
            }
            _ => Err(JsonRpcError::method_not_found(method)),
        }
    }

    async fn handle_notification(&self, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            methods::INITIALIZED => {
                self.state.write().await.initialized = true;
                info!(session = %self.id, "client initialized");
            }
            methods::ROOTS_LIST_CHANGED => {
                debug!(session = %self.id, "client roots changed");
            }
            other => debug!(session = %self.id, method = other, "ignoring notification"),
        }
    }
}
