//! MCP Tool definitions and handlers
//!
//! Plain tools, agents and workflows all surface to clients as MCP tools.
//! Agents become `ask_<key>` and workflows become `run_<key>`.

use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ConfigError, McpError, Result, ToolError};
use crate::mcp::elicitation;
use crate::mcp::protocol::RequestContext;
use crate::mcp::types::{CallToolResult, ElicitRequestParams, ElicitResult, RequestId, ToolDefinition};

/// Where a registered tool came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Tool,
    Agent,
    Workflow,
}

/// Something a client can call through `tools/call`
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, arguments: Value, ctx: ToolContext) -> Result<CallToolResult>;
}

/// What a tool can see of the call it is serving
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    request: Option<RequestContext>,
    session_id: Option<String>,
    client_supports_elicitation: bool,
    request_timeout: Duration,
}

impl ToolContext {
    /// Context for calls made outside any client session
    pub fn detached() -> Self {
        Self::default()
    }

    pub(crate) fn for_request(
        request: RequestContext,
        session_id: String,
        client_supports_elicitation: bool,
        request_timeout: Duration,
    ) -> Self {
        Self {
            request: Some(request),
            session_id: Some(session_id),
            client_supports_elicitation,
            request_timeout,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.request.as_ref().map(|r| &r.request_id)
    }

    pub fn is_cancelled(&self) -> bool {
        self.request
            .as_ref()
            .is_some_and(|r| r.cancellation.is_cancelled())
    }

    /// Cancelled when the client cancels the call or the session closes
    pub fn cancellation(&self) -> CancellationToken {
        self.request
            .as_ref()
            .map(|r| r.cancellation.clone())
            .unwrap_or_default()
    }

    /// Report progress to the caller; a no-op if it did not ask for progress
    pub fn report_progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Result<()> {
        match &self.request {
            Some(request) => Ok(request.notify_progress(progress, total, message)?),
            None => Ok(()),
        }
    }

    /// Ask the user for structured input through the client
    pub async fn elicit(
        &self,
        message: impl Into<String>,
        requested_schema: Value,
    ) -> Result<ElicitResult> {
        let Some(request) = &self.request else {
            return Err(McpError::ProtocolError {
                message: "elicitation requires an active client session".to_string(),
            }
            .into());
        };
        if !self.client_supports_elicitation {
            return Err(McpError::CapabilityNotSupported {
                capability: "elicitation".to_string(),
                method: crate::mcp::types::methods::ELICIT.to_string(),
            }
            .into());
        }
        let params = ElicitRequestParams {
            message: message.into(),
            requested_schema,
        };
        elicitation::send_request(request, params, self.request_timeout).await
    }
}

/// Deserialize tool arguments, treating a missing argument object as `{}`
pub fn parse_arguments<A: DeserializeOwned>(tool: &str, arguments: Value) -> Result<A> {
    let arguments = if arguments.is_null() {
        json!({})
    } else {
        arguments
    };
    serde_json::from_value::<A>(arguments.clone()).map_err(|e| {
        ToolError::InvalidArguments {
            tool: tool.to_string(),
            message: format!("{}\n\nProvided arguments: {}", e, arguments),
        }
        .into()
    })
}

/// JSON Schema for an argument type, without the draft header
pub fn input_schema_for<A: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(A);
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| json!({"type": "object"}));
    if let Value::Object(map) = &mut value {
        map.remove("$schema");
        map.remove("title");
    }
    value
}

/// Tool built from a closure over a typed argument struct
pub struct TypedTool<A, F> {
    name: String,
    description: String,
    input_schema: Value,
    handler: F,
    _args: PhantomData<fn() -> A>,
}

impl<A, F, Fut> TypedTool<A, F>
where
    A: DeserializeOwned + JsonSchema,
    F: Fn(A, ToolContext) -> Fut,
    Fut: Future<Output = Result<CallToolResult>>,
{
    pub fn new(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: input_schema_for::<A>(),
            handler,
            _args: PhantomData,
        }
    }
}

#[async_trait]
impl<A, F, Fut> Tool for TypedTool<A, F>
where
    A: DeserializeOwned + JsonSchema + Send + 'static,
    F: Fn(A, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CallToolResult>> + Send + 'static,
{
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: Some(self.description.clone()),
            input_schema: self.input_schema.clone(),
            output_schema: None,
        }
    }

    async fn execute(&self, arguments: Value, ctx: ToolContext) -> Result<CallToolResult> {
        let args: A = match parse_arguments(&self.name, arguments) {
            Ok(args) => args,
            Err(e) => return Ok(CallToolResult::error(e.to_string())),
        };
        (self.handler)(args, ctx).await
    }
}

// ==================== Agents ====================

/// Reply produced by an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentReply {
    pub text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl AgentReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: None,
        }
    }
}

/// A conversational agent exposed as `ask_<key>`
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn generate(&self, message: &str, ctx: &ToolContext) -> Result<AgentReply>;
}

#[derive(Deserialize, JsonSchema)]
struct AskArgs {
    /// The question or input for the agent.
    message: String,
}

/// Adapter presenting an [`Agent`] as a tool
pub struct AgentTool {
    tool_name: String,
    agent: Arc<dyn Agent>,
}

impl AgentTool {
    pub fn new(key: &str, agent: Arc<dyn Agent>) -> Result<Self> {
        if agent.description().trim().is_empty() {
            return Err(ConfigError::MissingDescription {
                kind: "Agent".to_string(),
                name: agent.name().to_string(),
            }
            .into());
        }
        Ok(Self {
            tool_name: format!("ask_{}", key),
            agent,
        })
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.tool_name.clone(),
            description: Some(format!(
                "Ask agent '{}' a question. Agent description: {}",
                self.agent.name(),
                self.agent.description()
            )),
            input_schema: input_schema_for::<AskArgs>(),
            output_schema: None,
        }
    }

    async fn execute(&self, arguments: Value, ctx: ToolContext) -> Result<CallToolResult> {
        let args: AskArgs = match parse_arguments(&self.tool_name, arguments) {
            Ok(args) => args,
            Err(e) => return Ok(CallToolResult::error(e.to_string())),
        };
        let reply = self.agent.generate(&args.message, &ctx).await?;
        let mut result = CallToolResult::text(reply.text.clone());
        if reply.metadata.is_some() {
            result.structured_content = Some(serde_json::to_value(&reply)?);
        }
        Ok(result)
    }
}

// ==================== Workflows ====================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
    Suspended,
}

/// Outcome of one workflow run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub run_id: String,

    pub status: RunStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowRun {
    pub fn success(run_id: impl Into<String>, result: Value) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Success,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(run_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Failed,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// A multi-step process exposed as `run_<key>`
#[async_trait]
pub trait Workflow: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn input_schema(&self) -> Value;

    async fn run(&self, input: Value, ctx: &ToolContext) -> Result<WorkflowRun>;
}

/// Adapter presenting a [`Workflow`] as a tool
pub struct WorkflowTool {
    tool_name: String,
    workflow: Arc<dyn Workflow>,
}

impl WorkflowTool {
    pub fn new(key: &str, workflow: Arc<dyn Workflow>) -> Result<Self> {
        if workflow.description().trim().is_empty() {
            return Err(ConfigError::MissingDescription {
                kind: "Workflow".to_string(),
                name: workflow.name().to_string(),
            }
            .into());
        }
        Ok(Self {
            tool_name: format!("run_{}", key),
            workflow,
        })
    }
}

#[async_trait]
impl Tool for WorkflowTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.tool_name.clone(),
            description: Some(format!(
                "Run workflow '{}'. Workflow description: {}",
                self.workflow.name(),
                self.workflow.description()
            )),
            input_schema: self.workflow.input_schema(),
            output_schema: None,
        }
    }

    async fn execute(&self, arguments: Value, ctx: ToolContext) -> Result<CallToolResult> {
        let input = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        let run = self.workflow.run(input, &ctx).await?;
        let failed = run.status == RunStatus::Failed;
        let mut result = CallToolResult::json(serde_json::to_value(&run)?);
        result.is_error = failed;
        Ok(result)
    }
}

// ==================== Registry ====================

pub struct RegisteredTool {
    pub kind: ToolKind,
    pub tool: Arc<dyn Tool>,
}

/// Name-keyed set of everything the server exposes
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ToolKind, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.definition().name;
        if self.tools.contains_key(&name) {
            return Err(ConfigError::DuplicateTool { name }.into());
        }
        self.tools.insert(name, RegisteredTool { kind, tool });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RegisteredTool)> {
        self.tools.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    /// Definitions for `tools/list`
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.tool.definition()).collect()
    }

    /// Call a tool by name; failures come back as `isError` results
    pub async fn call(&self, name: &str, arguments: Value, ctx: ToolContext) -> CallToolResult {
        let Some(entry) = self.get(name) else {
            return CallToolResult::error(format!("Unknown tool: {}", name));
        };
        match entry.tool.execute(arguments, ctx).await {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = name, error = %e, "tool execution failed");
                CallToolResult::error(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize, JsonSchema)]
    struct GreetArgs {
        name: String,
        #[serde(default)]
        shout: bool,
    }

    async fn greet(args: GreetArgs, _ctx: ToolContext) -> Result<CallToolResult> {
        let text = format!("Hello, {}", args.name);
        Ok(CallToolResult::text(if args.shout {
            text.to_uppercase()
        } else {
            text
        }))
    }

    fn greet_tool() -> Arc<dyn Tool> {
        Arc::new(TypedTool::new("greet", "Greets someone", greet))
    }

    struct Oracle {
        description: &'static str,
    }

    #[async_trait]
    impl Agent for Oracle {
        fn name(&self) -> &str {
            "Oracle"
        }

        fn description(&self) -> &str {
            self.description
        }

        async fn generate(&self, message: &str, _ctx: &ToolContext) -> Result<AgentReply> {
            Ok(AgentReply::text(format!("You asked: {}", message)))
        }
    }

    struct Flaky;

    #[async_trait]
    impl Workflow for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn description(&self) -> &str {
            "Always fails"
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }

        async fn run(&self, _input: Value, _ctx: &ToolContext) -> Result<WorkflowRun> {
            Ok(WorkflowRun::failed("run-1", "step two exploded"))
        }
    }

    #[test]
    fn test_typed_tool_schema() {
        let def = greet_tool().definition();
        assert_eq!(def.name, "greet");
        assert_eq!(def.input_schema["type"], "object");
        assert!(def.input_schema["properties"]["name"].is_object());
        assert!(def.input_schema.get("$schema").is_none());
    }

    #[tokio::test]
    async fn test_typed_tool_execution() {
        let result = greet_tool()
            .execute(json!({"name": "Ada", "shout": true}), ToolContext::detached())
            .await
            .unwrap();
        assert_eq!(result.first_text(), Some("HELLO, ADA"));
    }

    #[tokio::test]
    async fn test_typed_tool_rejects_bad_arguments() {
        let result = greet_tool()
            .execute(json!({"shout": "loud"}), ToolContext::detached())
            .await
            .unwrap();
        assert!(result.is_error);
        let text = result.first_text().unwrap();
        assert!(text.contains("Tool validation failed"));
        assert!(text.contains("Provided arguments"));
    }

    #[tokio::test]
    async fn test_agent_adapter() {
        let tool = AgentTool::new(
            "oracle",
            Arc::new(Oracle {
                description: "Answers questions",
            }),
        )
        .unwrap();
        let def = tool.definition();
        assert_eq!(def.name, "ask_oracle");
        assert!(def.description.unwrap().contains("Answers questions"));

        let result = tool
            .execute(json!({"message": "why?"}), ToolContext::detached())
            .await
            .unwrap();
        assert_eq!(result.first_text(), Some("You asked: why?"));
    }

    #[test]
    fn test_agent_requires_description() {
        let err = AgentTool::new("oracle", Arc::new(Oracle { description: "  " }))
            .err()
            .unwrap();
        assert!(err.to_string().contains("non-empty description"));
    }

    #[tokio::test]
    async fn test_failed_workflow_is_error_result() {
        let tool = WorkflowTool::new("flaky", Arc::new(Flaky)).unwrap();
        assert_eq!(tool.definition().name, "run_flaky");

        let result = tool.execute(Value::Null, ToolContext::detached()).await.unwrap();
        assert!(result.is_error);
        assert_eq!(result.structured_content.unwrap()["status"], "failed");
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicates_and_unknown_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolKind::Tool, greet_tool()).unwrap();
        assert!(registry.register(ToolKind::Tool, greet_tool()).is_err());
        assert_eq!(registry.len(), 1);

        let result = registry
            .call("missing", json!({}), ToolContext::detached())
            .await;
        assert!(result.is_error);
        assert_eq!(result.first_text(), Some("Error: Unknown tool: missing"));
    }

    #[tokio::test]
    async fn test_detached_context_cannot_elicit() {
        let err = ToolContext::detached()
            .elicit("Continue?", json!({"type": "object", "properties": {}}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("active client session"));
    }
}
