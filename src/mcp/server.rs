//! MCP Server implementation
//!
//! [`McpServer`] owns the registries and the set of live sessions. Transports
//! call [`McpServer::connect`] for each client and pump messages through the
//! returned [`Session`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{PackageInfo, RemoteInfo, Repository, ServerConfig};
use crate::error::{McpError, Result};
use crate::mcp::prompts::PromptProvider;
use crate::mcp::protocol::{Outbound, Protocol};
use crate::mcp::resources::ResourceProvider;
use crate::mcp::session::Session;
use crate::mcp::tools::{Agent, AgentTool, Tool, ToolContext, ToolKind, ToolRegistry, Workflow, WorkflowTool};
use crate::mcp::types::*;
use crate::transport::http::HttpOptions;
use crate::transport::{http, shutdown_signal, sse, stdio};

/// State every session of a server reads from
pub struct ServerShared {
    pub(crate) config: ServerConfig,
    pub(crate) id: String,
    pub(crate) release_date: String,
    pub(crate) tools: ToolRegistry,
    pub(crate) resources: Option<Arc<dyn ResourceProvider>>,
    pub(crate) prompts: Option<Arc<dyn PromptProvider>>,
}

impl ServerShared {
    pub(crate) fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            experimental: None,
            logging: Some(serde_json::Map::new()),
            tools: Some(ToolsCapability { list_changed: None }),
            resources: self.resources.as_ref().map(|_| ResourcesCapability {
                subscribe: true,
                list_changed: true,
            }),
            prompts: self.prompts.as_ref().map(|_| PromptsCapability { list_changed: true }),
        }
    }

    pub(crate) fn implementation(&self) -> Implementation {
        Implementation {
            name: self.config.name.clone(),
            version: self.config.version.clone(),
        }
    }
}

// ==================== Info ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionDetail {
    pub version: String,
    pub release_date: String,
    pub is_latest: bool,
}

/// Registry-style summary of the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<Repository>,
    pub version_detail: VersionDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDetail {
    #[serde(flatten)]
    pub info: ServerInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_canonical: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub packages: Vec<PackageInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub remotes: Vec<RemoteInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    pub tool_type: ToolKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolListInfo {
    pub tools: Vec<ToolInfo>,
}

// ==================== Builder ====================

/// Collects tools and providers; names are checked for collisions on `build`
pub struct McpServerBuilder {
    config: ServerConfig,
    entries: Vec<(ToolKind, Result<Arc<dyn Tool>>)>,
    resources: Option<Arc<dyn ResourceProvider>>,
    prompts: Option<Arc<dyn PromptProvider>>,
}

impl McpServerBuilder {
    pub fn tool<T: Tool + 'static>(self, tool: T) -> Self {
        self.shared_tool(Arc::new(tool))
    }

    pub fn shared_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.entries.push((ToolKind::Tool, Ok(tool)));
        self
    }

    /// Expose an agent as `ask_<key>`
    pub fn agent(mut self, key: &str, agent: Arc<dyn Agent>) -> Self {
        let tool = AgentTool::new(key, agent).map(|t| Arc::new(t) as Arc<dyn Tool>);
        self.entries.push((ToolKind::Agent, tool));
        self
    }

    /// Expose a workflow as `run_<key>`
    pub fn workflow(mut self, key: &str, workflow: Arc<dyn Workflow>) -> Self {
        let tool = WorkflowTool::new(key, workflow).map(|t| Arc::new(t) as Arc<dyn Tool>);
        self.entries.push((ToolKind::Workflow, tool));
        self
    }

    pub fn resources(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
        self.resources = Some(provider);
        self
    }

    pub fn prompts(mut self, provider: Arc<dyn PromptProvider>) -> Self {
        self.prompts = Some(provider);
        self
    }

    pub fn build(self) -> Result<McpServer> {
        let mut tools = ToolRegistry::new();
        for (kind, tool) in self.entries {
            tools.register(kind, tool?)?;
        }

        let id = self.config.resolved_id();
        let release_date = self
            .config
            .release_date
            .clone()
            .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());
        info!(server = %id, tools = tools.len(), "built MCP server");

        Ok(McpServer {
            shared: Arc::new(ServerShared {
                config: self.config,
                id,
                release_date,
                tools,
                resources: self.resources,
                prompts: self.prompts,
            }),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        })
    }
}

// ==================== Server ====================

type SessionMap = HashMap<String, Arc<Session>>;

/// MCP server exposing tools, agents and workflows over any transport
#[derive(Clone)]
pub struct McpServer {
    shared: Arc<ServerShared>,
    sessions: Arc<RwLock<SessionMap>>,
}

impl McpServer {
    pub fn builder(config: ServerConfig) -> McpServerBuilder {
        McpServerBuilder {
            config,
            entries: Vec::new(),
            resources: None,
            prompts: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn capabilities(&self) -> ServerCapabilities {
        self.shared.capabilities()
    }

    pub fn server_info(&self) -> ServerInfo {
        let config = &self.shared.config;
        ServerInfo {
            id: self.shared.id.clone(),
            name: config.name.clone(),
            description: config.description.clone(),
            repository: config.repository.clone(),
            version_detail: VersionDetail {
                version: config.version.clone(),
                release_date: self.shared.release_date.clone(),
                is_latest: config.is_latest,
            },
        }
    }

    pub fn server_detail(&self) -> ServerDetail {
        let config = &self.shared.config;
        ServerDetail {
            info: self.server_info(),
            package_canonical: config.package_canonical.clone(),
            packages: config.packages.clone(),
            remotes: config.remotes.clone(),
        }
    }

    pub fn tool_list_info(&self) -> ToolListInfo {
        ToolListInfo {
            tools: self
                .shared
                .tools
                .iter()
                .map(|(_, entry)| tool_info(entry.kind, entry.tool.definition()))
                .collect(),
        }
    }

    pub fn tool_info(&self, id: &str) -> Option<ToolInfo> {
        self.shared
            .tools
            .get(id)
            .map(|entry| tool_info(entry.kind, entry.tool.definition()))
    }

    /// Run a tool directly, outside any client session
    pub async fn execute_tool(&self, id: &str, arguments: Value) -> Result<CallToolResult> {
        let entry = self.shared.tools.get(id).ok_or_else(|| McpError::UnknownTool {
            name: id.to_string(),
        })?;
        debug!(tool = id, "executing tool directly");
        entry.tool.execute(arguments, ToolContext::detached()).await
    }

    // ==================== Sessions ====================

    /// A session that is not tracked by the server
    pub(crate) fn transient_session(&self) -> (Arc<Session>, mpsc::UnboundedReceiver<Outbound>) {
        let (protocol, rx) = Protocol::channel();
        let session = Arc::new(Session::new(
            Uuid::new_v4().to_string(),
            self.shared.clone(),
            protocol,
        ));
        (session, rx)
    }

    /// Open a session; the transport drains the receiver toward the client
    pub fn connect(&self) -> (Arc<Session>, mpsc::UnboundedReceiver<Outbound>) {
        let (session, rx) = self.transient_session();
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id().to_string(), session.clone());
        info!(session = %session.id(), "session connected");
        (session, rx)
    }

    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Close and forget a session; returns false if it was unknown
    pub fn disconnect(&self, id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match removed {
            Some(session) => {
                session.close();
                info!(session = id, "session disconnected");
                true
            }
            None => false,
        }
    }

    fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn require_resources(&self, method: &str) -> Result<()> {
        if self.shared.resources.is_none() {
            return Err(McpError::CapabilityNotSupported {
                capability: "resources".to_string(),
                method: method.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Tell sessions subscribed to `uri` that it changed; returns how many were notified
    pub async fn notify_resource_updated(&self, uri: &str) -> Result<usize> {
        self.require_resources(methods::RESOURCE_UPDATED)?;
        let mut notified = 0;
        for session in self.all_sessions() {
            if session.is_subscribed(uri).await
                && session
                    .notify(methods::RESOURCE_UPDATED, Some(json!({ "uri": uri })))
                    .is_ok()
            {
                notified += 1;
            }
        }
        Ok(notified)
    }

    pub async fn notify_resource_list_changed(&self) -> Result<usize> {
        self.require_resources(methods::RESOURCE_LIST_CHANGED)?;
        Ok(self.broadcast(methods::RESOURCE_LIST_CHANGED).await)
    }

    pub async fn notify_prompt_list_changed(&self) -> Result<usize> {
        if self.shared.prompts.is_none() {
            return Err(McpError::CapabilityNotSupported {
                capability: "prompts".to_string(),
                method: methods::PROMPT_LIST_CHANGED.to_string(),
            }
            .into());
        }
        Ok(self.broadcast(methods::PROMPT_LIST_CHANGED).await)
    }

    async fn broadcast(&self, method: &str) -> usize {
        let mut notified = 0;
        for session in self.all_sessions() {
            if session.is_initialized().await && session.notify(method, None).is_ok() {
                notified += 1;
            }
        }
        notified
    }

    /// Send `notifications/message` to every session whose level admits it
    pub async fn send_log(&self, level: LoggingLevel, logger: Option<&str>, data: Value) -> usize {
        let mut sent = 0;
        for session in self.all_sessions() {
            if let Ok(true) = session.send_log(level, logger, data.clone()).await {
                sent += 1;
            }
        }
        sent
    }

    /// Disconnect every session
    pub fn close(&self) {
        let sessions: Vec<_> = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, session) in sessions {
            session.close();
        }
        info!(server = %self.shared.id, "server closed");
    }

    // ==================== Entry points ====================

    /// Serve one client over stdin/stdout until EOF
    pub async fn start_stdio(&self) -> Result<()> {
        stdio::serve_stdio(self.clone()).await
    }

    /// Router for the legacy HTTP+SSE transport
    pub fn sse_router(&self) -> axum::Router {
        sse::router(self.clone())
    }

    /// Router for the streamable HTTP transport
    pub fn http_router(&self, options: HttpOptions) -> axum::Router {
        http::router(self.clone(), options)
    }

    pub async fn start_sse(&self, addr: SocketAddr) -> Result<()> {
        self.serve_router(addr, self.sse_router(), "sse").await
    }

    pub async fn start_http(&self, addr: SocketAddr, options: HttpOptions) -> Result<()> {
        self.serve_router(addr, self.http_router(options), "http").await
    }

    async fn serve_router(&self, addr: SocketAddr, router: axum::Router, transport: &str) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, transport, server = %self.shared.id, "listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        self.close();
        Ok(())
    }
}

fn tool_info(kind: ToolKind, definition: ToolDefinition) -> ToolInfo {
    ToolInfo {
        id: definition.name.clone(),
        name: definition.name,
        description: definition.description,
        input_schema: definition.input_schema,
        output_schema: definition.output_schema,
        tool_type: kind,
    }
}
