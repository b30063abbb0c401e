//! JSON-RPC 2.0 peer over newline-delimited JSON.
//!
//! Reads one JSON object per line from the reader, writes the same to the
//! writer (production wiring: this process's stdin/stdout, with the editor
//! on the far side). Supports request/response correlation, notifications,
//! and incoming-request handlers. Incoming requests are served on their own
//! tasks: a `session/prompt` can run for minutes while cancellations keep
//! flowing through the read loop.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

/// Default request timeout (120 seconds).
const DEFAULT_TIMEOUT_MS: u64 = 120_000;

/// Error returned from a request handler, serialized as a JSON-RPC error.
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: -32001,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: -32603,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

/// Handler for notification messages from the peer.
pub type NotificationHandler = Box<dyn Fn(String, Value) + Send + Sync>;

/// Handler for incoming JSON-RPC requests. Receives the params and returns
/// the result value or an error to serialize back.
pub type RequestHandler = Arc<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>> + Send + Sync,
>;

struct PendingRequest {
    resolve: oneshot::Sender<Result<Value, String>>,
}

enum WriteCmd {
    Send(String),
    Close,
}

pub struct RpcPeer {
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, PendingRequest>>>,
    request_handlers: Arc<Mutex<HashMap<String, RequestHandler>>>,
    notification_handler: Arc<Mutex<Option<NotificationHandler>>>,
    write_tx: Mutex<Option<mpsc::UnboundedSender<WriteCmd>>>,
    protocol_error: Arc<Mutex<Option<String>>>,
    closed: Arc<Notify>,
    closed_flag: Arc<AtomicBool>,
    _tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcPeer {
    /// Wire up a peer over an arbitrary reader/writer pair.
    pub fn new<R, W>(reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<WriteCmd>();

        let peer = Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            request_handlers: Arc::new(Mutex::new(HashMap::new())),
            notification_handler: Arc::new(Mutex::new(None)),
            write_tx: Mutex::new(Some(write_tx)),
            protocol_error: Arc::new(Mutex::new(None)),
            closed: Arc::new(Notify::new()),
            closed_flag: Arc::new(AtomicBool::new(false)),
            _tasks: Mutex::new(Vec::new()),
        });

        let writer_handle = {
            let mut writer = writer;
            tokio::spawn(async move {
                while let Some(cmd) = write_rx.recv().await {
                    match cmd {
                        WriteCmd::Send(payload) => {
                            if writer.write_all(payload.as_bytes()).await.is_err() {
                                break;
                            }
                            let _ = writer.flush().await;
                        }
                        WriteCmd::Close => break,
                    }
                }
                let _ = writer.shutdown().await;
            })
        };

        let reader_handle = {
            let p = peer.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        p.handle_line(trimmed).await;
                    }
                }
                debug!("[rpc] reader ended, peer went away");
                p.reject_all_pending("peer disconnected").await;
                p.mark_closed();
            })
        };

        let p2 = peer.clone();
        tokio::spawn(async move {
            let mut tasks = p2._tasks.lock().await;
            tasks.push(writer_handle);
            tasks.push(reader_handle);
        });

        peer
    }

    fn mark_closed(&self) {
        self.closed_flag.store(true, Ordering::SeqCst);
        self.closed.notify_waiters();
    }

    /// Resolves once the peer disconnects (reader EOF or protocol error).
    pub async fn wait_closed(&self) {
        let notified = self.closed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.closed_flag.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }

    pub async fn on_notification<F>(&self, handler: F)
    where
        F: Fn(String, Value) + Send + Sync + 'static,
    {
        *self.notification_handler.lock().await = Some(Box::new(handler));
    }

    pub async fn register_request_handler(&self, method: &str, handler: RequestHandler) {
        self.request_handlers
            .lock()
            .await
            .insert(method.to_string(), handler);
    }

    pub async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout_ms: u64,
    ) -> Result<Value, String> {
        if let Some(err) = self.protocol_error.lock().await.as_ref() {
            return Err(err.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(id, PendingRequest { resolve: tx });

        self.write_payload(&payload).await;

        if timeout_ms == u64::MAX {
            return rx.await.unwrap_or(Err("channel closed".to_string()));
        }

        let effective_timeout = if timeout_ms == 0 {
            DEFAULT_TIMEOUT_MS
        } else {
            timeout_ms
        };

        match tokio::time::timeout(std::time::Duration::from_millis(effective_timeout), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err("channel closed".to_string()),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(format!(
                    "Request '{}' timed out after {}ms",
                    method, effective_timeout
                ))
            }
        }
    }

    /// Send a request with no timeout. Permission round-trips can sit as
    /// long as the user does.
    pub async fn send_request_untimed(&self, method: &str, params: Value) -> Result<Value, String> {
        self.send_request(method, params, u64::MAX).await
    }

    pub async fn send_notification(&self, method: &str, params: Value) {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_payload(&payload).await;
    }

    pub async fn close(&self) {
        if let Some(tx) = self.write_tx.lock().await.take() {
            let _ = tx.send(WriteCmd::Close);
        }
        self.reject_all_pending("transport closed").await;
        self.mark_closed();
    }

    async fn write_payload(&self, payload: &Value) {
        let serialized = format!("{}\n", serde_json::to_string(payload).unwrap_or_default());
        if let Some(tx) = self.write_tx.lock().await.as_ref() {
            let _ = tx.send(WriteCmd::Send(serialized));
        }
    }

    async fn handle_line(&self, line: &str) {
        if self.protocol_error.lock().await.is_some() {
            return;
        }

        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                let err_msg = "failed to parse JSON-RPC from peer".to_string();
                *self.protocol_error.lock().await = Some(err_msg.clone());
                debug!("[rpc] unparseable line: {}", line);
                self.reject_all_pending(&err_msg).await;
                if let Some(tx) = self.write_tx.lock().await.take() {
                    let _ = tx.send(WriteCmd::Close);
                }
                self.mark_closed();
                return;
            }
        };

        if !parsed.is_object() {
            debug!("[rpc] ignoring non-object message");
            return;
        }

        if parsed.get("method").is_some()
            && let Some(id) = parsed.get("id")
            && !id.is_null()
        {
            self.handle_incoming_request(&parsed).await;
            return;
        }
        if parsed.get("method").is_some() {
            let method = parsed["method"].as_str().unwrap_or("").to_string();
            let params = parsed.get("params").cloned().unwrap_or(Value::Null);
            let handler = self.notification_handler.lock().await;
            if let Some(h) = handler.as_ref() {
                h(method, params);
            }
            return;
        }

        if parsed.get("id").is_some() {
            self.handle_response(&parsed).await;
        }
    }

    async fn handle_incoming_request(&self, request: &Value) {
        let method = request["method"].as_str().unwrap_or("").to_string();
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        let id = request.get("id").cloned().unwrap_or(Value::Null);

        let handler = {
            let handlers = self.request_handlers.lock().await;
            handlers.get(&method).cloned()
        };

        match handler {
            Some(h) => {
                // Serve on a separate task so slow methods never stall the
                // read loop.
                let write_tx = self.write_tx.lock().await.clone();
                tokio::spawn(async move {
                    let response = match h(params).await {
                        Ok(result) => serde_json::json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "result": result,
                        }),
                        Err(err) => serde_json::json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": {
                                "code": err.code,
                                "message": err.message,
                            },
                        }),
                    };
                    let serialized =
                        format!("{}\n", serde_json::to_string(&response).unwrap_or_default());
                    if let Some(tx) = write_tx {
                        let _ = tx.send(WriteCmd::Send(serialized));
                    }
                });
            }
            None => {
                let response = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": -32601,
                        "message": format!("Method not found: {}", method),
                    },
                });
                self.write_payload(&response).await;
            }
        }
    }

    async fn handle_response(&self, response: &Value) {
        let id = match response.get("id").and_then(|v| v.as_u64()) {
            Some(id) => id,
            None => {
                debug!("[rpc] response without numeric id");
                return;
            }
        };

        let pending = self.pending.lock().await.remove(&id);
        match pending {
            Some(p) => {
                if let Some(err) = response.get("error") {
                    let msg = err
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("Unknown error")
                        .to_string();
                    let _ = p.resolve.send(Err(msg));
                } else {
                    let result = response.get("result").cloned().unwrap_or(Value::Null);
                    let _ = p.resolve.send(Ok(result));
                }
            }
            None => {
                debug!("[rpc] response with no pending request: {}", id);
            }
        }
    }

    async fn reject_all_pending(&self, message: &str) {
        let mut pending = self.pending.lock().await;
        for (_, p) in pending.drain() {
            let _ = p.resolve.send(Err(message.to_string()));
        }
    }
}
