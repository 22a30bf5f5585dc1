//! Streamable HTTP transport
//!
//! A single endpoint handles everything:
//! - `POST` carries client messages. Responses to the requests in a body,
//!   plus whatever the server sends while serving them, come back on that
//!   POST either as an SSE stream or as one JSON document.
//! - `GET` opens the session's standalone stream for messages not tied to a
//!   request.
//! - `DELETE` ends the session.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::mcp::protocol::Outbound;
use crate::mcp::server::McpServer;
use crate::mcp::session::Session;
use crate::mcp::types::{
    JsonRpcError, JsonRpcMessage, JsonRpcResponse, RequestId, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::transport::{message_event, HttpError};

pub const SESSION_ID_HEADER: &str = "mcp-session-id";
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

const JSON_MIME: &str = "application/json";
const EVENT_STREAM_MIME: &str = "text/event-stream";

/// Streamable HTTP behavior switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HttpOptions {
    /// No session ids; every POST is served by a fresh, pre-initialized session
    pub stateless: bool,

    /// Answer POSTs with a JSON body instead of an SSE stream
    pub json_response: bool,
}

impl HttpOptions {
    pub fn from_config(transport: &TransportConfig) -> Self {
        Self {
            stateless: transport.stateless,
            json_response: transport.json_response,
        }
    }
}

type Route = mpsc::UnboundedSender<JsonRpcMessage>;

/// Where outbound messages of one session go
#[derive(Default)]
struct Routes {
    /// Open POST streams keyed by the request ids they wait for
    by_request: HashMap<RequestId, Route>,

    /// The GET stream, if one is open
    standalone: Option<Route>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Routes {
    fn deliver(&mut self, out: Outbound) {
        let key = out
            .related_request
            .clone()
            .or_else(|| out.message.response_id().cloned());
        let is_response = matches!(out.message, JsonRpcMessage::Response(_));

        if let Some(key) = key {
            if let Some(route) = self.by_request.get(&key) {
                let _ = route.send(out.message);
                if is_response {
                    self.by_request.remove(&key);
                }
                return;
            }
        }
        self.send_standalone(out.message);
    }

    fn send_standalone(&mut self, message: JsonRpcMessage) {
        match &self.standalone {
            Some(route) => {
                if route.send(message).is_err() {
                    self.standalone = None;
                }
            }
            None => debug!("no stream open for outbound message, dropping it"),
        }
    }
}

struct HttpSession {
    session: Arc<Session>,
    routes: Arc<Mutex<Routes>>,
}

impl HttpSession {
    fn spawn(session: Arc<Session>, outbound: mpsc::UnboundedReceiver<Outbound>) -> Arc<Self> {
        let routes = Arc::new(Mutex::new(Routes::default()));
        tokio::spawn(pump(
            outbound,
            routes.clone(),
            session.protocol().closed_token(),
        ));
        Arc::new(Self { session, routes })
    }
}

/// Move outbound messages onto whichever stream is waiting for them
async fn pump(
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    routes: Arc<Mutex<Routes>>,
    closed: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            next = outbound.recv() => next,
            _ = closed.cancelled() => None,
        };
        let Some(out) = next else { break };
        lock(&routes).deliver(out);
    }
    while let Ok(out) = outbound.try_recv() {
        lock(&routes).deliver(out);
    }
    // dropping every route ends the streams still open on this session
    *lock(&routes) = Routes::default();
}

#[derive(Clone)]
struct HttpState {
    server: McpServer,
    options: HttpOptions,
    sessions: Arc<Mutex<HashMap<String, Arc<HttpSession>>>>,
}

impl HttpState {
    fn lookup(&self, headers: &HeaderMap) -> Result<Arc<HttpSession>, HttpError> {
        let id = session_header(headers)?.ok_or_else(|| {
            HttpError::new(
                StatusCode::BAD_REQUEST,
                "Bad Request: Mcp-Session-Id header is required",
            )
        })?;
        let mut sessions = lock(&self.sessions);
        match sessions.get(&id) {
            Some(found) if !found.session.protocol().is_closed() => Ok(found.clone()),
            Some(_) => {
                sessions.remove(&id);
                Err(HttpError::new(StatusCode::NOT_FOUND, "Session not found"))
            }
            None => Err(HttpError::new(StatusCode::NOT_FOUND, "Session not found")),
        }
    }
}

/// Router serving the configured `http_path`
pub fn router(server: McpServer, options: HttpOptions) -> Router {
    let path = server.config().transport.http_path.clone();
    let state = HttpState {
        server,
        options,
        sessions: Arc::new(Mutex::new(HashMap::new())),
    };
    Router::new()
        .route(
            &path,
            get(open_standalone_stream)
                .post(handle_post)
                .delete(close_session),
        )
        .with_state(state)
}

// ==================== Header checks ====================

fn session_header(headers: &HeaderMap) -> Result<Option<String>, HttpError> {
    match headers.get(SESSION_ID_HEADER) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|v| Some(v.to_string()))
            .map_err(|_| HttpError::new(StatusCode::BAD_REQUEST, "Invalid Mcp-Session-Id header")),
    }
}

fn accepts(headers: &HeaderMap, mime: &str) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains(mime))
}

fn check_protocol_version(headers: &HeaderMap) -> Result<(), HttpError> {
    let Some(value) = headers.get(PROTOCOL_VERSION_HEADER) else {
        return Ok(());
    };
    let version = value.to_str().unwrap_or("");
    if SUPPORTED_PROTOCOL_VERSIONS.contains(&version) {
        Ok(())
    } else {
        Err(HttpError::new(
            StatusCode::BAD_REQUEST,
            format!(
                "Bad Request: Unsupported protocol version (supported versions: {})",
                SUPPORTED_PROTOCOL_VERSIONS.join(", ")
            ),
        ))
    }
}

fn with_session_header(mut response: Response, session_id: Option<&str>) -> Response {
    if let Some(id) = session_id {
        match HeaderValue::from_str(id) {
            Ok(value) => {
                response.headers_mut().insert(SESSION_ID_HEADER, value);
            }
            Err(e) => warn!(error = %e, "session id is not a valid header value"),
        }
    }
    response
}

/// Decode a single message or a batch
fn parse_body(body: &[u8]) -> Result<(Vec<JsonRpcMessage>, bool), HttpError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| HttpError::bad_message(JsonRpcError::parse_error(e.to_string())))?;
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(HttpError::bad_message(JsonRpcError::invalid_request(
                    "Empty batch",
                )));
            }
            let messages = items
                .into_iter()
                .map(JsonRpcMessage::from_value)
                .collect::<Result<Vec<_>, _>>()
                .map_err(HttpError::bad_message)?;
            Ok((messages, true))
        }
        other => {
            let message = JsonRpcMessage::from_value(other).map_err(HttpError::bad_message)?;
            Ok((vec![message], false))
        }
    }
}

// ==================== Handlers ====================

/// Closes a stateless session once the response that needed it is gone
struct TransientSession(Option<Arc<Session>>);

impl Drop for TransientSession {
    fn drop(&mut self) {
        if let Some(session) = self.0.take() {
            session.close();
        }
    }
}

async fn handle_post(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HttpError> {
    if !(accepts(&headers, JSON_MIME) && accepts(&headers, EVENT_STREAM_MIME)) {
        return Err(HttpError::new(
            StatusCode::NOT_ACCEPTABLE,
            "Not Acceptable: Client must accept both application/json and text/event-stream",
        ));
    }
    check_protocol_version(&headers)?;
    let (messages, is_batch) = parse_body(&body)?;

    let initialize_count = messages.iter().filter(|m| m.is_initialize()).count();
    let (http_session, session_id) = if state.options.stateless {
        let (session, outbound) = state.server.transient_session();
        session.assume_initialized().await;
        (HttpSession::spawn(session, outbound), None)
    } else if initialize_count > 0 {
        if session_header(&headers)?.is_some() {
            return Err(HttpError::bad_message(JsonRpcError::invalid_request(
                "Invalid Request: Server already initialized",
            )));
        }
        if initialize_count > 1 || messages.len() > 1 {
            return Err(HttpError::bad_message(JsonRpcError::invalid_request(
                "Invalid Request: Only one initialization request is allowed",
            )));
        }
        let (session, outbound) = state.server.connect();
        let id = session.id().to_string();
        let http_session = HttpSession::spawn(session, outbound);
        lock(&state.sessions).insert(id.clone(), http_session.clone());
        info!(session = %id, "streamable HTTP session created");
        (http_session, Some(id))
    } else {
        let http_session = state.lookup(&headers)?;
        let id = http_session.session.id().to_string();
        (http_session, Some(id))
    };

    let transient = TransientSession(
        state
            .options
            .stateless
            .then(|| http_session.session.clone()),
    );
    let request_ids: Vec<RequestId> = messages
        .iter()
        .filter_map(|m| m.request_id().cloned())
        .collect();

    if request_ids.is_empty() {
        for message in messages {
            http_session.session.receive(message).await;
        }
        drop(transient);
        let response = StatusCode::ACCEPTED.into_response();
        return Ok(with_session_header(response, session_id.as_deref()));
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    {
        let mut routes = lock(&http_session.routes);
        for id in &request_ids {
            routes.by_request.insert(id.clone(), tx.clone());
        }
    }
    drop(tx);
    debug!(requests = request_ids.len(), batch = is_batch, "serving POST");
    for message in messages {
        http_session.session.receive(message).await;
    }

    if state.options.json_response {
        let mut responses: Vec<JsonRpcResponse> = Vec::new();
        while let Some(message) = rx.recv().await {
            match message {
                JsonRpcMessage::Response(response) => responses.push(response),
                other => lock(&http_session.routes).send_standalone(other),
            }
        }
        drop(transient);

        let body = if !is_batch && responses.len() == 1 {
            serde_json::to_value(&responses[0])
        } else {
            serde_json::to_value(&responses)
        }
        .map_err(|e| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        return Ok(with_session_header(
            Json(body).into_response(),
            session_id.as_deref(),
        ));
    }

    let stream = UnboundedReceiverStream::new(rx).map(move |message| {
        let _transient = &transient;
        Ok::<_, Infallible>(message_event(&message))
    });
    let response = Sse::new(stream).into_response();
    Ok(with_session_header(response, session_id.as_deref()))
}

async fn open_standalone_stream(
    State(state): State<HttpState>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    if state.options.stateless {
        return Err(HttpError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed in stateless mode",
        ));
    }
    if !accepts(&headers, EVENT_STREAM_MIME) {
        return Err(HttpError::new(
            StatusCode::NOT_ACCEPTABLE,
            "Not Acceptable: Client must accept text/event-stream",
        ));
    }
    check_protocol_version(&headers)?;
    let http_session = state.lookup(&headers)?;

    let (tx, rx) = mpsc::unbounded_channel();
    {
        let mut routes = lock(&http_session.routes);
        if routes.standalone.as_ref().is_some_and(|r| !r.is_closed()) {
            return Err(HttpError::new(
                StatusCode::CONFLICT,
                "Conflict: Only one SSE stream is allowed per session",
            ));
        }
        routes.standalone = Some(tx);
    }
    let session_id = http_session.session.id().to_string();
    debug!(session = %session_id, "standalone stream opened");

    let stream = UnboundedReceiverStream::new(rx)
        .map(|message| Ok::<_, Infallible>(message_event(&message)));
    let response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    Ok(with_session_header(response, Some(&session_id)))
}

async fn close_session(
    State(state): State<HttpState>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    if state.options.stateless {
        return Err(HttpError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed in stateless mode",
        ));
    }
    check_protocol_version(&headers)?;
    let http_session = state.lookup(&headers)?;
    let id = http_session.session.id().to_string();

    lock(&state.sessions).remove(&id);
    state.server.disconnect(&id);
    info!(session = %id, "streamable HTTP session terminated");
    Ok(StatusCode::OK.into_response())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::mcp::types::{JsonRpcNotification, JsonRpcRequest};

    fn response(id: i64) -> Outbound {
        Outbound {
            message: JsonRpcMessage::Response(JsonRpcResponse::success(
                RequestId::Number(id),
                json!({}),
            )),
            related_request: None,
        }
    }

    #[test]
    fn test_routes_follow_request_ids() {
        let mut routes = Routes::default();
        let (post_tx, mut post_rx) = mpsc::unbounded_channel();
        let (get_tx, mut get_rx) = mpsc::unbounded_channel();
        routes.by_request.insert(RequestId::Number(1), post_tx);
        routes.standalone = Some(get_tx);

        routes.deliver(Outbound {
            message: JsonRpcMessage::Notification(JsonRpcNotification::new(
                "notifications/progress",
                None,
            )),
            related_request: Some(RequestId::Number(1)),
        });
        routes.deliver(Outbound {
            message: JsonRpcMessage::Request(JsonRpcRequest::new(
                RequestId::Number(0),
                "ping",
                None,
            )),
            related_request: None,
        });
        routes.deliver(response(1));

        assert!(matches!(post_rx.try_recv(), Ok(JsonRpcMessage::Notification(_))));
        assert!(matches!(post_rx.try_recv(), Ok(JsonRpcMessage::Response(_))));
        // the response removed the last sender
        assert!(post_rx.try_recv().is_err());
        assert!(routes.by_request.is_empty());
        assert!(matches!(get_rx.try_recv(), Ok(JsonRpcMessage::Request(_))));
    }

    #[test]
    fn test_parse_batch() {
        let body = br#"[{"jsonrpc":"2.0","id":1,"method":"ping"},{"jsonrpc":"2.0","method":"notifications/initialized"}]"#;
        let (messages, batch) = parse_body(body).unwrap();
        assert!(batch);
        assert_eq!(messages.len(), 2);

        assert!(parse_body(b"[]").is_err());
        assert!(parse_body(b"{not json").is_err());
    }

    #[test]
    fn test_accept_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        assert!(accepts(&headers, JSON_MIME));
        assert!(accepts(&headers, EVENT_STREAM_MIME));

        headers.insert(PROTOCOL_VERSION_HEADER, HeaderValue::from_static("1999-01-01"));
        assert!(check_protocol_version(&headers).is_err());
        headers.insert(PROTOCOL_VERSION_HEADER, HeaderValue::from_static("2025-03-26"));
        assert!(check_protocol_version(&headers).is_ok());
    }
}
