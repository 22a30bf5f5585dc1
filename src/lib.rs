//! MCP Tool Host Library
//!
//! A Model Context Protocol (MCP) server that exposes tools, agents and
//! workflows to MCP clients over stdio, legacy SSE, or streamable HTTP.

pub mod builtin;
pub mod config;
pub mod error;
pub mod mcp;
pub mod transport;
pub mod utils;

pub use config::ServerConfig;
pub use error::{Result, ToolhostError};
pub use mcp::server::{McpServer, McpServerBuilder};
pub use transport::http::HttpOptions;
