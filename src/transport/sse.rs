//! Legacy HTTP+SSE transport
//!
//! `GET <sse_path>` opens an event stream whose first event names the URL the
//! client POSTs its messages to. Everything the server sends arrives on the
//! stream as `message` events.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use crate::mcp::server::McpServer;
use crate::mcp::types::JsonRpcMessage;
use crate::transport::{message_event, HttpError, SessionGuard};

#[derive(Clone)]
struct SseState {
    server: McpServer,
    message_path: String,
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// Routes for the configured `sse_path` and `message_path`
pub fn router(server: McpServer) -> Router {
    let transport = server.config().transport.clone();
    let state = SseState {
        server,
        message_path: transport.message_path.clone(),
    };
    Router::new()
        .route(&transport.sse_path, get(open_stream))
        .route(&transport.message_path, post(post_message))
        .with_state(state)
}

async fn open_stream(
    State(state): State<SseState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (session, outbound) = state.server.connect();
    let session_id = session.id().to_string();
    let closed = session.protocol().closed_token();
    info!(session = %session_id, "SSE stream opened");

    let endpoint = format!("{}?sessionId={}", state.message_path, session_id);
    let first = stream::once(async move {
        Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint))
    });

    let guard = SessionGuard::new(state.server.clone(), session_id);
    let messages = UnboundedReceiverStream::new(outbound)
        .take_until(async move { closed.cancelled().await })
        .map(move |out| {
            let _guard = &guard;
            Ok::<_, Infallible>(message_event(&out.message))
        });

    Sse::new(first.chain(messages)).keep_alive(KeepAlive::default())
}

async fn post_message(
    State(state): State<SseState>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> Result<StatusCode, HttpError> {
    let session_id = query
        .session_id
        .ok_or_else(|| HttpError::new(StatusCode::BAD_REQUEST, "Missing sessionId query parameter"))?;
    let session = state
        .server
        .session(&session_id)
        .ok_or_else(|| HttpError::new(StatusCode::NOT_FOUND, "Session not found"))?;

    let message = JsonRpcMessage::parse(&body).map_err(HttpError::bad_message)?;
    debug!(session = %session_id, "message posted");
    session.receive(message).await;
    Ok(StatusCode::ACCEPTED)
}
