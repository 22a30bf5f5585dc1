//! JSON-RPC correlation layer
//!
//! Tracks outgoing requests until their responses arrive, times them out,
//! cancels them, routes progress notifications, and runs incoming requests
//! on their own tasks so the peer can cancel them. Transports only move
//! [`Outbound`] records and feed parsed messages back in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::McpError;
use crate::mcp::types::*;

/// Default time to wait for a response
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A message on its way to the peer
#[derive(Debug, Clone)]
pub struct Outbound {
    pub message: JsonRpcMessage,

    /// Incoming request this message was produced while serving
    pub related_request: Option<RequestId>,
}

/// Knobs for a single outgoing request
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub timeout: Duration,
    pub reset_timeout_on_progress: bool,
    pub max_total_timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    pub on_progress: Option<mpsc::UnboundedSender<ProgressParams>>,
    pub related_request: Option<RequestId>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            reset_timeout_on_progress: false,
            max_total_timeout: None,
            cancel: None,
            on_progress: None,
            related_request: None,
        }
    }
}

impl RequestOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// Receives what the peer sends us
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(
        &self,
        request: JsonRpcRequest,
        ctx: RequestContext,
    ) -> Result<Value, JsonRpcError>;

    async fn handle_notification(&self, notification: JsonRpcNotification);
}

/// Per-request view handed to a [`RequestHandler`]
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub progress_token: Option<ProgressToken>,
    pub cancellation: CancellationToken,
    pub protocol: Protocol,
}

impl RequestContext {
    /// Send `notifications/progress` if the caller supplied a token
    pub fn notify_progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Result<(), McpError> {
        let Some(token) = self.progress_token.clone() else {
            return Ok(());
        };
        let params = ProgressParams {
            progress_token: token,
            progress,
            total,
            message,
        };
        self.notify(methods::PROGRESS, Some(to_params(&params)?))
    }

    /// Notification tied to this request
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.protocol
            .notify(method, params, Some(self.request_id.clone()))
    }

    /// Request to the peer tied to this request; aborted if this request is cancelled
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        mut options: RequestOptions,
    ) -> Result<Value, McpError> {
        options.related_request = Some(self.request_id.clone());
        if options.cancel.is_none() {
            options.cancel = Some(self.cancellation.child_token());
        }
        self.protocol.request(method, params, options).await
    }
}

struct PendingRequest {
    responder: oneshot::Sender<Result<Value, JsonRpcError>>,
    progress: mpsc::UnboundedSender<ProgressParams>,
}

struct Inner {
    outbound: mpsc::UnboundedSender<Outbound>,
    next_id: AtomicI64,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
    handlers: TaskTracker,
    closed: CancellationToken,
}

/// Cloneable handle onto one connection's correlation state
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn to_params<T: serde::Serialize>(value: &T) -> Result<Value, McpError> {
    serde_json::to_value(value).map_err(|e| McpError::ProtocolError {
        message: e.to_string(),
    })
}

impl Protocol {
    pub fn new(outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            inner: Arc::new(Inner {
                outbound,
                next_id: AtomicI64::new(0),
                pending: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                handlers: TaskTracker::new(),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Protocol plus the receiving end a transport drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Token cancelled once [`Protocol::close`] runs
    pub fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Number of incoming requests whose handlers have not finished
    pub fn in_flight_count(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }

    /// Wait until every spawned request handler has sent its response.
    ///
    /// Returns `false` if `grace` ran out first. Handlers spawned afterwards
    /// are still tracked.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.inner.handlers.close();
        let finished = tokio::time::timeout(grace, self.inner.handlers.wait())
            .await
            .is_ok();
        self.inner.handlers.reopen();
        finished
    }

    pub fn send(&self, outbound: Outbound) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(McpError::ConnectionClosed);
        }
        self.inner
            .outbound
            .send(outbound)
            .map_err(|_| McpError::ConnectionClosed)
    }

    pub fn send_error(&self, id: Option<RequestId>, error: JsonRpcError) -> Result<(), McpError> {
        self.send(Outbound {
            message: JsonRpcMessage::Response(JsonRpcResponse::error(id, error)),
            related_request: None,
        })
    }

    pub fn notify(
        &self,
        method: &str,
        params: Option<Value>,
        related_request: Option<RequestId>,
    ) -> Result<(), McpError> {
        self.send(Outbound {
            message: JsonRpcMessage::Notification(JsonRpcNotification::new(method, params)),
            related_request,
        })
    }

    /// Send a request and wait for the matching response
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, McpError> {
        if self.is_closed() {
            return Err(McpError::ConnectionClosed);
        }

        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let params = if options.on_progress.is_some() {
            Some(with_progress_token(params, &id))
        } else {
            params
        };

        let (responder, mut response) = oneshot::channel();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        lock(&self.inner.pending).insert(
            id.clone(),
            PendingRequest {
                responder,
                progress: progress_tx,
            },
        );

        let request = JsonRpcRequest::new(id.clone(), method, params);
        if let Err(e) = self.send(Outbound {
            message: JsonRpcMessage::Request(request),
            related_request: options.related_request.clone(),
        }) {
            lock(&self.inner.pending).remove(&id);
            return Err(e);
        }
        debug!(request_id = %id, method, "sent request");

        let started = Instant::now();
        let hard_deadline = options.max_total_timeout.map(|max| started + max);
        let cap = |deadline: Instant| match hard_deadline {
            Some(hard) if hard < deadline => hard,
            _ => deadline,
        };
        let mut deadline = cap(started + options.timeout);
        let cancel = options.cancel.clone().unwrap_or_default();

        loop {
            tokio::select! {
                outcome = &mut response => {
                    return match outcome {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(error)) => Err(McpError::Remote {
                            code: error.code,
                            message: error.message,
                            data: error.data,
                        }),
                        Err(_) => Err(McpError::ConnectionClosed),
                    };
                }
                Some(progress) = progress_rx.recv() => {
                    if let Some(on_progress) = &options.on_progress {
                        let _ = on_progress.send(progress);
                    }
                    if options.reset_timeout_on_progress {
                        deadline = cap(Instant::now() + options.timeout);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let elapsed = started.elapsed();
                    self.abandon(&id, "Request timed out");
                    warn!(request_id = %id, method, ?elapsed, "request timed out");
                    return Err(McpError::RequestTimeout {
                        method: method.to_string(),
                        timeout_ms: elapsed.as_millis() as u64,
                    });
                }
                _ = cancel.cancelled() => {
                    self.abandon(&id, "Request cancelled");
                    return Err(McpError::RequestCancelled {
                        reason: format!("{} was cancelled by the caller", method),
                    });
                }
            }
        }
    }

    /// Forget a pending request and tell the peer to stop working on it
    fn abandon(&self, id: &RequestId, reason: &str) {
        if lock(&self.inner.pending).remove(id).is_none() {
            return;
        }
        let params = CancelledParams {
            request_id: id.clone(),
            reason: Some(reason.to_string()),
        };
        if let Ok(params) = to_params(&params) {
            let _ = self.notify(methods::CANCELLED, Some(params), None);
        }
    }

    /// Route one incoming message
    pub async fn handle_message(&self, message: JsonRpcMessage, handler: Arc<dyn RequestHandler>) {
        match message {
            JsonRpcMessage::Request(request) => self.spawn_request(request, handler),
            JsonRpcMessage::Response(response) => self.handle_response(response),
            JsonRpcMessage::Notification(notification) => match notification.method.as_str() {
                methods::CANCELLED => self.handle_cancelled(notification.params),
                methods::PROGRESS => self.handle_progress(notification.params),
                _ => handler.handle_notification(notification).await,
            },
        }
    }

    fn spawn_request(&self, request: JsonRpcRequest, handler: Arc<dyn RequestHandler>) {
        let id = request.id.clone();
        let token = self.inner.closed.child_token();
        lock(&self.inner.in_flight).insert(id.clone(), token.clone());

        let ctx = RequestContext {
            request_id: id.clone(),
            progress_token: request.progress_token(),
            cancellation: token.clone(),
            protocol: self.clone(),
        };
        let protocol = self.clone();

        self.inner.handlers.spawn(async move {
            let method = request.method.clone();
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = handler.handle_request(request, ctx) => Some(result),
            };
            lock(&protocol.inner.in_flight).remove(&id);

            let response = match outcome {
                Some(Ok(result)) => JsonRpcResponse::success(id.clone(), result),
                Some(Err(error)) => {
                    debug!(request_id = %id, %method, code = error.code, "request failed");
                    JsonRpcResponse::error(Some(id.clone()), error)
                }
                None => {
                    debug!(request_id = %id, %method, "request cancelled, dropping response");
                    return;
                }
            };
            if protocol
                .send(Outbound {
                    message: JsonRpcMessage::Response(response),
                    related_request: None,
                })
                .is_err()
            {
                debug!(request_id = %id, "connection closed before response was sent");
            }
        });
    }

    fn handle_response(&self, response: JsonRpcResponse) {
        let Some(id) = response.id.clone() else {
            warn!(error = ?response.error, "received response without id");
            return;
        };
        let Some(pending) = lock(&self.inner.pending).remove(&id) else {
            warn!(request_id = %id, "received response for unknown request");
            return;
        };
        let outcome = match response.error {
            Some(error) => Err(error),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = pending.responder.send(outcome);
    }

    fn handle_cancelled(&self, params: Option<Value>) {
        let params: CancelledParams = match params.map(serde_json::from_value) {
            Some(Ok(p)) => p,
            _ => {
                warn!("ignoring malformed cancellation notification");
                return;
            }
        };
        match lock(&self.inner.in_flight).get(&params.request_id) {
            Some(token) => {
                debug!(request_id = %params.request_id, reason = ?params.reason, "peer cancelled request");
                token.cancel();
            }
            None => debug!(request_id = %params.request_id, "cancellation for request not in flight"),
        }
    }

    fn handle_progress(&self, params: Option<Value>) {
        let params: ProgressParams = match params.map(serde_json::from_value) {
            Some(Ok(p)) => p,
            _ => {
                warn!("ignoring malformed progress notification");
                return;
            }
        };
        match lock(&self.inner.pending).get(&params.progress_token) {
            Some(pending) => {
                let _ = pending.progress.send(params);
            }
            None => debug!(token = %params.progress_token, "progress for unknown token"),
        }
    }

    /// Cancel in-flight handlers and fail pending requests
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.inner.closed.cancel();
        let dropped: Vec<_> = lock(&self.inner.pending).drain().collect();
        lock(&self.inner.in_flight).clear();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "failing pending requests on close");
        }
    }
}

fn with_progress_token(params: Option<Value>, id: &RequestId) -> Value {
    let mut params = match params {
        Some(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    let meta = params
        .entry("_meta")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if let Value::Object(meta) = meta {
        meta.insert("progressToken".to_string(), json!(id));
    }
    Value::Object(params)
}
