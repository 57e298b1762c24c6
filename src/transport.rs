//! Downstream transports: subprocess stdio, streamable HTTP, and SSE.
//!
//! All three carry line-oriented JSON-RPC 2.0 (see [`crate::rpc`]); the
//! [`Transport`] enum gives the connection layer one surface over the three
//! concrete mechanisms. Each transport shares a [`FaultSignal`] with its
//! owning connection: the first unexpected closure or stream error fires it
//! exactly once, no matter how many internal paths observe the fault.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::debug;

use crate::endpoint::EndpointDescriptor;
use crate::rpc::{self, Request, Response};

/// Errors produced while establishing or using a downstream transport.
#[derive(Debug)]
pub enum TransportError {
    /// Child process could not be spawned (missing command, permissions).
    Spawn(String),
    /// HTTP-level failure (connection refused, non-2xx status, TLS).
    Http(String),
    /// Stdio read/write failure.
    Io(String),
    /// The downstream server returned a JSON-RPC error object.
    Rpc { code: i64, message: String },
    /// The response could not be interpreted.
    Protocol(String),
    /// The transport is gone (process exited, stream ended).
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Spawn(msg) => write!(f, "spawn failed: {msg}"),
            TransportError::Http(msg) => write!(f, "http request failed: {msg}"),
            TransportError::Io(msg) => write!(f, "io error: {msg}"),
            TransportError::Rpc { code, message } => write!(f, "server error ({code}): {message}"),
            TransportError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            TransportError::Closed => write!(f, "transport closed"),
        }
    }
}

// ─── Fault signal ────────────────────────────────────────────────────────────

/// One-shot closure/error signal shared between a transport and its
/// connection. Both an "error" and a "close" observation can occur for the
/// same underlying fault; the armed/fired guard lets only the first through.
pub struct FaultSignal {
    fired: AtomicBool,
    tx: std::sync::Mutex<Option<oneshot::Sender<String>>>,
}

impl FaultSignal {
    /// Create a signal and the receiver its owning connection listens on.
    pub fn pair() -> (Arc<Self>, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                fired: AtomicBool::new(false),
                tx: std::sync::Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Fire the signal with a reason. Every call after the first is a no-op.
    pub fn fire(&self, reason: String) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut guard) = self.tx.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(reason);
            }
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

// ─── Transport enum ──────────────────────────────────────────────────────────

/// One live transport to a downstream endpoint.
pub enum Transport {
    Stdio(StdioTransport),
    HttpStream(HttpStreamTransport),
    Sse(SseTransport),
}

impl Transport {
    /// Send a JSON-RPC request and wait for the matching response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Response, TransportError> {
        match self {
            Transport::Stdio(t) => t.request(method, params).await,
            Transport::HttpStream(t) => t.request(method, params).await,
            Transport::Sse(t) => t.request(method, params).await,
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        match self {
            Transport::Stdio(t) => t.notify(method, params).await,
            Transport::HttpStream(t) => t.notify(method, params).await,
            Transport::Sse(t) => t.notify(method, params).await,
        }
    }

    /// Tear down the transport. Best-effort; close errors are swallowed.
    pub async fn close(&self) {
        match self {
            Transport::Stdio(t) => t.close(),
            Transport::HttpStream(t) => t.close().await,
            Transport::Sse(t) => t.close().await,
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            Transport::Stdio(_) => "subprocess",
            Transport::HttpStream(_) => "http-stream",
            Transport::Sse(_) => "server-sent-events",
        }
    }
}

// ─── Subprocess stdio ────────────────────────────────────────────────────────

/// Line-delimited JSON-RPC over a child process's stdin/stdout. A stdout
/// reader task routes responses to pending requests by JSON-RPC id, so
/// concurrent calls on the same endpoint never consume each other's replies.
pub struct StdioTransport {
    writer: Mutex<ChildStdin>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>,
    shutdown: Arc<Notify>,
}

impl StdioTransport {
    /// Spawn the endpoint's command with its extra environment merged over
    /// the agent's own. A monitor task fires the fault signal if the child
    /// exits on its own.
    pub fn spawn(
        descriptor: &EndpointDescriptor,
        fault: Arc<FaultSignal>,
    ) -> Result<Self, TransportError> {
        let command = descriptor
            .command
            .as_deref()
            .ok_or_else(|| TransportError::Spawn("descriptor has no command".into()))?;

        let mut cmd = Command::new(command);
        cmd.args(&descriptor.args)
            .envs(&descriptor.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Spawn(format!("{command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn("failed to capture stdout".into()))?;

        // Drain stderr into the log so server diagnostics aren't lost
        if let Some(stderr) = child.stderr.take() {
            let endpoint_id = descriptor.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(endpoint = %endpoint_id, "server stderr: {line}");
                }
            });
        }

        let shutdown = Arc::new(Notify::new());
        let monitor_shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let reason = match status {
                        Ok(s) => format!("process exited ({s})"),
                        Err(e) => format!("process wait failed: {e}"),
                    };
                    fault.fire(reason);
                }
                _ = monitor_shutdown.notified() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        });

        // One reader owns stdout and routes responses by id; servers may
        // answer interleaved requests in any order.
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = Arc::clone(&pending);
        let endpoint_id = descriptor.id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Response>(trimmed) {
                    Ok(resp) => {
                        if let Some(id) = resp.id {
                            if let Some(tx) = reader_pending.lock().await.remove(&id) {
                                let _ = tx.send(resp);
                            }
                        }
                    }
                    Err(_) => {
                        debug!(endpoint = %endpoint_id, "skipping non-response stdout line")
                    }
                }
            }
            // Stdout is gone; wake any waiters instead of leaving them hung
            reader_pending.lock().await.clear();
        });

        Ok(Self {
            writer: Mutex::new(stdin),
            pending,
            shutdown,
        })
    }

    async fn write_line(&self, payload: String) -> Result<(), TransportError> {
        let mut line = payload;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Io(format!("write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::Io(format!("flush stdin: {e}")))
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Response, TransportError> {
        let id = rpc::next_request_id();
        let req = Request::new(id, method, params);
        let payload = serde_json::to_string(&req)
            .map_err(|e| TransportError::Protocol(format!("serialize request: {e}")))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        if let Err(e) = self.write_line(payload).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        // The stdout reader delivers the matching response; if the child
        // dies the pending senders are dropped and recv fails.
        rx.await.map_err(|_| TransportError::Closed)
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        let payload = serde_json::to_string(&rpc::notification(method, params))
            .map_err(|e| TransportError::Protocol(format!("serialize notification: {e}")))?;
        self.write_line(payload).await
    }

    /// Ask the monitor task to kill and reap the child.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }
}

// ─── Streamable HTTP ─────────────────────────────────────────────────────────

/// Streamable-HTTP MCP transport: one POST per request, responses returned
/// either as plain JSON or as a one-shot SSE body. The `Mcp-Session-Id`
/// header from `initialize` is echoed on every later request.
pub struct HttpStreamTransport {
    http: reqwest::Client,
    url: String,
    session_id: std::sync::Mutex<Option<String>>,
    fault: Arc<FaultSignal>,
}

impl HttpStreamTransport {
    pub fn new(
        descriptor: &EndpointDescriptor,
        fault: Arc<FaultSignal>,
    ) -> Result<Self, TransportError> {
        let url = descriptor
            .url
            .clone()
            .ok_or_else(|| TransportError::Http("descriptor has no url".into()))?;
        Ok(Self {
            http: build_http_client(&descriptor.headers)?,
            url,
            session_id: std::sync::Mutex::new(None),
            fault,
        })
    }

    fn session_header(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|g| g.clone())
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Response, TransportError> {
        let id = rpc::next_request_id();
        let req = Request::new(id, method, params);

        let mut builder = self
            .http
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(&req);
        if let Some(sid) = self.session_header() {
            builder = builder.header("Mcp-Session-Id", sid);
        }

        let resp = builder.send().await.map_err(|e| {
            // Network-level failure counts as losing the transport
            self.fault.fire(format!("http request failed: {e}"));
            TransportError::Http(e.to_string())
        })?;

        if let Some(sid) = resp
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut guard) = self.session_id.lock() {
                *guard = Some(sid.to_string());
            }
        }

        let status = resp.status();
        let streaming = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let reason = format!("HTTP {status}: {body}");
            // A rejected request means the session is dead (expired id,
            // server restart); treat it like losing the transport so the
            // connection reconnects instead of failing every call forever.
            self.fault.fire(reason.clone());
            return Err(TransportError::Http(reason));
        }

        if streaming {
            self.read_streamed_response(resp, id).await
        } else {
            let body = resp
                .text()
                .await
                .map_err(|e| TransportError::Http(format!("read body: {e}")))?;
            serde_json::from_str(&body)
                .map_err(|e| TransportError::Protocol(format!("invalid JSON response: {e}")))
        }
    }

    /// Consume a one-shot SSE response body until the message matching `id`
    /// arrives.
    async fn read_streamed_response(
        &self,
        mut resp: reqwest::Response,
        id: u64,
    ) -> Result<Response, TransportError> {
        let mut parser = SseParser::new();
        loop {
            let chunk = match resp.chunk().await {
                Ok(Some(c)) => c,
                Ok(None) => return Err(TransportError::Protocol("stream ended before response".into())),
                Err(e) => return Err(TransportError::Http(format!("stream error: {e}"))),
            };
            for event in parser.push(&String::from_utf8_lossy(&chunk)) {
                if !matches!(event.name.as_str(), "" | "message") {
                    continue;
                }
                if let Ok(parsed) = serde_json::from_str::<Response>(&event.data) {
                    if parsed.id == Some(id) {
                        return Ok(parsed);
                    }
                }
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        let mut builder = self
            .http
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(&rpc::notification(method, params));
        if let Some(sid) = self.session_header() {
            builder = builder.header("Mcp-Session-Id", sid);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Http(format!("HTTP {}", resp.status())))
        }
    }

    /// Terminate the server-side session, if one was established. This also
    /// runs when the streaming-POST attempt loses the fallback race, so the
    /// abandoned attempt cannot leak a session or fire late.
    pub async fn close(&self) {
        if let Some(sid) = self.session_header() {
            let _ = self
                .http
                .delete(&self.url)
                .header("Mcp-Session-Id", sid)
                .send()
                .await;
        }
    }
}

// ─── Server-sent events ──────────────────────────────────────────────────────

/// Legacy HTTP+SSE transport: a persistent GET stream delivers responses;
/// requests are POSTed to the URL announced by the stream's first `endpoint`
/// event.
pub struct SseTransport {
    http: reqwest::Client,
    post_url: String,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>,
    reader: tokio::task::JoinHandle<()>,
}

impl SseTransport {
    /// Open the GET stream and wait for the `endpoint` event announcing the
    /// POST URL.
    pub async fn connect(
        descriptor: &EndpointDescriptor,
        fault: Arc<FaultSignal>,
    ) -> Result<Self, TransportError> {
        let url = descriptor
            .url
            .clone()
            .ok_or_else(|| TransportError::Http("descriptor has no url".into()))?;
        let http = build_http_client(&descriptor.headers)?;

        let resp = http
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (endpoint_tx, endpoint_rx) = oneshot::channel();

        let reader = tokio::spawn(sse_reader(
            resp,
            Arc::clone(&pending),
            fault,
            Some(endpoint_tx),
        ));

        // The server must announce the message URL before we can send anything
        let announced = endpoint_rx.await.map_err(|_| TransportError::Closed)?;
        let post_url = resolve_post_url(&url, &announced)?;

        Ok(Self {
            http,
            post_url,
            pending,
            reader,
        })
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Response, TransportError> {
        let id = rpc::next_request_id();
        let req = Request::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let post = self
            .http
            .post(&self.post_url)
            .json(&req)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()));
        match post {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                self.pending.lock().await.remove(&id);
                return Err(TransportError::Http(format!("HTTP {}", resp.status())));
            }
            Err(e) => {
                self.pending.lock().await.remove(&id);
                return Err(e);
            }
        }

        // Response arrives over the GET stream; if the reader dies, the
        // sender is dropped and recv fails.
        rx.await.map_err(|_| TransportError::Closed)
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        let resp = self
            .http
            .post(&self.post_url)
            .json(&rpc::notification(method, params))
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Http(format!("HTTP {}", resp.status())))
        }
    }

    pub async fn close(&self) {
        self.reader.abort();
        self.pending.lock().await.clear();
    }
}

/// Read the persistent SSE stream, routing `message` events to pending
/// requests by JSON-RPC id. Fires the fault signal when the stream ends.
async fn sse_reader(
    mut resp: reqwest::Response,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>,
    fault: Arc<FaultSignal>,
    mut endpoint_tx: Option<oneshot::Sender<String>>,
) {
    let mut parser = SseParser::new();
    loop {
        let chunk = match resp.chunk().await {
            Ok(Some(c)) => c,
            Ok(None) => {
                fault.fire("event stream ended".into());
                break;
            }
            Err(e) => {
                fault.fire(format!("event stream error: {e}"));
                break;
            }
        };
        for event in parser.push(&String::from_utf8_lossy(&chunk)) {
            match event.name.as_str() {
                "endpoint" => {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(event.data);
                    }
                }
                "" | "message" => {
                    if let Ok(parsed) = serde_json::from_str::<Response>(&event.data) {
                        if let Some(id) = parsed.id {
                            if let Some(tx) = pending.lock().await.remove(&id) {
                                let _ = tx.send(parsed);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
    // Drop any waiters so their recv fails instead of hanging
    pending.lock().await.clear();
}

/// Resolve the `endpoint` event's URL (absolute or server-relative) against
/// the stream URL.
fn resolve_post_url(base: &str, announced: &str) -> Result<String, TransportError> {
    if announced.starts_with("http://") || announced.starts_with("https://") {
        return Ok(announced.to_string());
    }
    let base = reqwest::Url::parse(base)
        .map_err(|e| TransportError::Protocol(format!("invalid base url: {e}")))?;
    base.join(announced)
        .map(|u| u.to_string())
        .map_err(|e| TransportError::Protocol(format!("invalid endpoint url '{announced}': {e}")))
}

/// Build a reqwest client with the endpoint's extra headers as defaults.
fn build_http_client(headers: &HashMap<String, String>) -> Result<reqwest::Client, TransportError> {
    let mut default_headers = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::Http(format!("invalid header name '{name}': {e}")))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|e| TransportError::Http(format!("invalid header value for '{name:?}': {e}")))?;
        default_headers.insert(name, value);
    }
    reqwest::Client::builder()
        .default_headers(default_headers)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| TransportError::Http(format!("failed to build HTTP client: {e}")))
}

// ─── SSE parsing ─────────────────────────────────────────────────────────────

/// One parsed server-sent event. `name` is empty for bare `data:` events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub name: String,
    pub data: String,
}

/// Incremental SSE line parser; chunks may split lines and events anywhere.
pub struct SseParser {
    buf: String,
    event: String,
    data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self {
            buf: String::new(),
            event: String::new(),
            data: String::new(),
        }
    }

    /// Feed a chunk; returns every event completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buf.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if !self.data.is_empty() {
                    let mut data = std::mem::take(&mut self.data);
                    data.pop(); // trailing newline from the last data line
                    events.push(SseEvent {
                        name: std::mem::take(&mut self.event),
                        data,
                    });
                } else {
                    self.event.clear();
                }
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
                self.data.push('\n');
            } else if let Some(rest) = line.strip_prefix("event:") {
                self.event = rest.trim_start().to_string();
            } else if line.starts_with(':') {
                // comment / keep-alive
            }
        }
        events
    }
}
