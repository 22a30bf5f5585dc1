//! MCP (Model Context Protocol) module
//!
//! Wire types, the JSON-RPC correlation layer, sessions, and the server
//! exposing tools, agents, workflows, resources and prompts.

pub mod elicitation;
pub mod prompts;
pub mod protocol;
pub mod resources;
pub mod server;
pub mod session;
pub mod tools;
pub mod types;
