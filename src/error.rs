//! Error types for the MCP tool host
//!
//! This module defines the error hierarchy for all operations in the server.

use serde_json::Value;
use thiserror::Error;

use crate::mcp::types::{error_codes, JsonRpcError};

/// Main error type for the MCP tool host
#[derive(Error, Debug)]
pub enum ToolhostError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// MCP protocol errors
    #[error("MCP protocol error: {0}")]
    Mcp(#[from] McpError),

    /// Tool execution errors
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML configuration parse errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Tool with name '{name}' is already registered")]
    DuplicateTool { name: String },

    #[error("{kind} '{name}' must have a non-empty description to be exposed as a tool")]
    MissingDescription { kind: String, name: String },
}

/// Validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid elicitation schema: {message}")]
    InvalidElicitationSchema { message: String },

    #[error("Elicitation response does not match the requested schema: {}", .errors.join("; "))]
    ElicitationContent { errors: Vec<String> },
}

/// MCP protocol errors
#[derive(Error, Debug)]
pub enum McpError {
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Request '{method}' timed out after {timeout_ms} ms")]
    RequestTimeout { method: String, timeout_ms: u64 },

    #[error("Request cancelled: {reason}")]
    RequestCancelled { reason: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Peer returned error {code}: {message}")]
    Remote {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("Peer does not support {capability} (required for {method})")]
    CapabilityNotSupported { capability: String, method: String },

    #[error("Resource not found: {uri}")]
    ResourceNotFound { uri: String },

    #[error("Prompt not found: {name}")]
    PromptNotFound { name: String },
}

/// Tool execution errors
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool validation failed for '{tool}'. Please fix the following errors and try again:\n- {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("Execution failed: {message}")]
    ExecutionFailed { message: String },

    #[error("Execution cancelled")]
    Cancelled,
}

/// Result type alias for tool host operations
pub type Result<T> = std::result::Result<T, ToolhostError>;

impl McpError {
    /// Map onto a JSON-RPC error object
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            McpError::UnknownTool { .. } | McpError::PromptNotFound { .. } => {
                JsonRpcError::invalid_params(self.to_string())
            }
            McpError::ResourceNotFound { uri } => JsonRpcError::resource_not_found(uri),
            McpError::RequestTimeout { .. } => {
                JsonRpcError::new(error_codes::REQUEST_TIMEOUT, self.to_string())
            }
            McpError::ConnectionClosed => {
                JsonRpcError::new(error_codes::CONNECTION_CLOSED, self.to_string())
            }
            McpError::Remote {
                code,
                message,
                data,
            } => JsonRpcError {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            _ => JsonRpcError::internal_error(self.to_string()),
        }
    }
}

impl ToolhostError {
    /// Map onto a JSON-RPC error object
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            ToolhostError::Mcp(err) => err.to_rpc_error(),
            ToolhostError::Validation(err) => JsonRpcError::invalid_params(err.to_string()),
            _ => JsonRpcError::internal_error(self.to_string()),
        }
    }
}
