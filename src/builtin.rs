//! Built-in toolset served by the binary
//!
//! Small, dependency-free tools that exercise every kind of thing the server
//! can expose: plain tools, an elicitation round-trip, an agent, a workflow
//! with progress, resources and a prompt.

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::{Result, ToolError};
use crate::mcp::prompts::StaticPrompts;
use crate::mcp::resources::StaticResources;
use crate::mcp::server::McpServer;
use crate::mcp::tools::{Agent, AgentReply, ToolContext, TypedTool, Workflow, WorkflowRun};
use crate::mcp::types::{CallToolResult, ElicitAction, Prompt, PromptArgument};

// ==================== Tools ====================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EchoArgs {
    /// Text to send back
    pub text: String,
}

async fn echo(args: EchoArgs, _ctx: ToolContext) -> Result<CallToolResult> {
    Ok(CallToolResult::text(args.text))
}

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CalculateArgs {
    pub a: f64,
    pub b: f64,
    pub operation: Operation,
}

async fn calculate(args: CalculateArgs, _ctx: ToolContext) -> Result<CallToolResult> {
    let value = match args.operation {
        Operation::Add => args.a + args.b,
        Operation::Subtract => args.a - args.b,
        Operation::Multiply => args.a * args.b,
        Operation::Divide => {
            if args.b == 0.0 {
                return Err(ToolError::ExecutionFailed {
                    message: "division by zero".to_string(),
                }
                .into());
            }
            args.a / args.b
        }
    };
    Ok(CallToolResult::json(json!({ "result": value })))
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ConfirmArgs {
    /// What the user is asked to confirm
    pub action: String,
}

async fn confirm_action(args: ConfirmArgs, ctx: ToolContext) -> Result<CallToolResult> {
    let schema = json!({
        "type": "object",
        "properties": {
            "confirm": {"type": "boolean", "description": "Go ahead?"},
            "note": {"type": "string", "maxLength": 200}
        },
        "required": ["confirm"]
    });
    let answer = ctx
        .elicit(format!("Please confirm: {}", args.action), schema)
        .await?;

    let text = match answer.action {
        ElicitAction::Accept => {
            let content = answer.content.unwrap_or_default();
            let confirmed = content.get("confirm").and_then(Value::as_bool) == Some(true);
            let note = content
                .get("note")
                .and_then(Value::as_str)
                .map(|n| format!(" ({})", n))
                .unwrap_or_default();
            if confirmed {
                format!("Confirmed: {}{}", args.action, note)
            } else {
                format!("Not confirmed: {}{}", args.action, note)
            }
        }
        ElicitAction::Decline => format!("User declined: {}", args.action),
        ElicitAction::Cancel => format!("User cancelled: {}", args.action),
    };
    Ok(CallToolResult::text(text))
}

// ==================== Agent ====================

/// Restates the question it was asked
pub struct ReflectAgent;

#[async_trait]
impl Agent for ReflectAgent {
    fn name(&self) -> &str {
        "Reflect"
    }

    fn description(&self) -> &str {
        "Restates the message it receives and counts its words"
    }

    async fn generate(&self, message: &str, _ctx: &ToolContext) -> Result<AgentReply> {
        let words = message.split_whitespace().count();
        Ok(AgentReply {
            text: format!("You said: {}", message.trim()),
            metadata: Some(json!({ "words": words })),
        })
    }
}

// ==================== Workflow ====================

/// Counts characters, words and lines, reporting progress after each step
pub struct TextStatsWorkflow;

#[async_trait]
impl Workflow for TextStatsWorkflow {
    fn name(&self) -> &str {
        "Text statistics"
    }

    fn description(&self) -> &str {
        "Counts characters, words and lines of a text"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {"type": "string", "description": "Text to analyse"}
            },
            "required": ["text"]
        })
    }

    async fn run(&self, input: Value, ctx: &ToolContext) -> Result<WorkflowRun> {
        let run_id = Uuid::new_v4().to_string();
        let Some(text) = input.get("text").and_then(Value::as_str) else {
            return Ok(WorkflowRun::failed(run_id, "input must contain a string 'text'"));
        };
        debug!(%run_id, "text stats run started");

        let steps: [(&str, fn(&str) -> usize); 3] = [
            ("characters", |t| t.chars().count()),
            ("words", |t| t.split_whitespace().count()),
            ("lines", |t| t.lines().count()),
        ];
        let mut stats = serde_json::Map::new();
        for (done, (name, step)) in steps.iter().enumerate() {
            if ctx.is_cancelled() {
                return Err(ToolError::Cancelled.into());
            }
            stats.insert(name.to_string(), json!(step(text)));
            ctx.report_progress(
                (done + 1) as f64,
                Some(steps.len() as f64),
                Some(format!("counted {}", name)),
            )?;
            tokio::task::yield_now().await;
        }
        Ok(WorkflowRun::success(run_id, Value::Object(stats)))
    }
}

// ==================== Resources and prompts ====================

pub fn resources(config: &ServerConfig) -> StaticResources {
    StaticResources::new()
        .with_text(
            "toolhost://about",
            "About",
            Some("What this server is"),
            format!(
                "{} {} exposes example tools, an agent and a workflow over MCP.",
                config.name, config.version
            ),
        )
        .with_json(
            "toolhost://transport",
            "Transport settings",
            Some("Listener configuration of this server"),
            &json!({
                "host": config.transport.host,
                "port": config.transport.port,
                "ssePath": config.transport.sse_path,
                "httpPath": config.transport.http_path,
            }),
        )
}

pub fn prompts() -> StaticPrompts {
    StaticPrompts::new().with_prompt(
        Prompt {
            name: "summarize".to_string(),
            description: Some("Summarize a text".to_string()),
            arguments: vec![
                PromptArgument {
                    name: "text".to_string(),
                    description: Some("Text to summarize".to_string()),
                    required: true,
                },
                PromptArgument {
                    name: "style".to_string(),
                    description: Some("Tone of the summary, e.g. 'bullet points'".to_string()),
                    required: false,
                },
            ],
        },
        "Summarize the following text. Style: {{style}}\n\n{{text}}",
    )
}

/// Server with every built-in registered
pub fn server(config: ServerConfig) -> Result<McpServer> {
    let resources = Arc::new(resources(&config));
    McpServer::builder(config)
        .tool(TypedTool::new("echo", "Echo the given text back", echo))
        .tool(TypedTool::new(
            "calculate",
            "Apply an arithmetic operation to two numbers",
            calculate,
        ))
        .tool(TypedTool::new(
            "confirm_action",
            "Ask the user to confirm an action before it happens",
            confirm_action,
        ))
        .agent("reflect", Arc::new(ReflectAgent))
        .workflow("text_stats", Arc::new(TextStatsWorkflow))
        .resources(resources)
        .prompts(Arc::new(prompts()))
        .build()
}
