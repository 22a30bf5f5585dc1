//! Transports carrying MCP messages between clients and an [`McpServer`](crate::mcp::server::McpServer)
//!
//! Every transport does the same three things: open a session, feed parsed
//! client messages into it, and drain its outbound queue to the client.

pub mod http;
pub mod sse;
pub mod stdio;

use axum::http::StatusCode;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::mcp::server::McpServer;
use crate::mcp::types::{error_codes, JsonRpcError, JsonRpcMessage};

/// SSE `message` event carrying one JSON-RPC message
pub(crate) fn message_event(message: &JsonRpcMessage) -> Event {
    match serde_json::to_string(message) {
        Ok(data) => Event::default().event("message").data(data),
        Err(e) => {
            warn!(error = %e, "failed to serialize outbound message");
            Event::default().comment("unserializable message dropped")
        }
    }
}

/// HTTP error with a JSON-RPC error body and a null id
#[derive(Debug)]
pub(crate) struct HttpError {
    status: StatusCode,
    error: JsonRpcError,
}

impl HttpError {
    pub(crate) fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            error: JsonRpcError::new(error_codes::CONNECTION_CLOSED, message),
        }
    }

    /// 400 carrying the parse or classification error itself
    pub(crate) fn bad_message(error: JsonRpcError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = json!({
            "jsonrpc": "2.0",
            "error": self.error,
            "id": null,
        });
        (self.status, Json(body)).into_response()
    }
}

/// Disconnects a session when the stream serving it is dropped
pub(crate) struct SessionGuard {
    server: McpServer,
    session_id: String,
}

impl SessionGuard {
    pub(crate) fn new(server: McpServer, session_id: impl Into<String>) -> Self {
        Self {
            server,
            session_id: session_id.into(),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.server.disconnect(&self.session_id) {
            debug!(session = %self.session_id, "stream closed, session dropped");
        }
    }
}

/// Resolves on Ctrl+C
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
