//! Downstream connection lifecycle.
//!
//! A [`DownstreamConnection`] owns the (at most one) live transport to a
//! single endpoint: it selects the transport, runs the MCP handshake and
//! tool discovery, watches for unexpected closure, and reconnects with a
//! bounded backoff. Status and tool-list changes are reported to the
//! orchestrator as [`ConnectionEvent`]s.
//!
//! Connections are independent — a stalled or retrying endpoint never
//! affects its siblings. Once `disconnect()` has run, the object is dead
//! for good: no state change or reconnect can revive it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::endpoint::{ConnectionStatus, EndpointDescriptor, ToolDescriptor, TransportKind};
use crate::rpc::{self, MCP_PROTOCOL_VERSION};
use crate::transport::{
    FaultSignal, HttpStreamTransport, SseTransport, StdioTransport, Transport, TransportError,
};

/// Reconnect delay schedule, indexed by `min(attempt, 4)`. The delay grows
/// across consecutive failures and then holds at the final value forever.
pub const RECONNECT_SCHEDULE_SECS: [u64; 5] = [1, 2, 5, 10, 30];

pub fn delay_for_attempt(attempt: u32) -> Duration {
    Duration::from_secs(RECONNECT_SCHEDULE_SECS[attempt.min(4) as usize])
}

/// State/tool change notification flowing from a connection to the
/// orchestrator (and from there to the control channel).
#[derive(Debug)]
pub enum ConnectionEvent {
    StatusChanged {
        endpoint_id: String,
        status: ConnectionStatus,
        error: Option<String>,
    },
    ToolsChanged {
        endpoint_id: String,
        tools: Vec<ToolDescriptor>,
    },
}

struct ConnState {
    status: ConnectionStatus,
    last_error: Option<String>,
    transport: Option<Arc<Transport>>,
    tools: Vec<ToolDescriptor>,
    reconnect_attempt: u32,
    reconnect_timer: Option<tokio::task::JoinHandle<()>>,
    fault_watch: Option<tokio::task::JoinHandle<()>>,
}

/// Runtime object bound 1:1 to an endpoint descriptor.
pub struct DownstreamConnection {
    descriptor: EndpointDescriptor,
    state: Mutex<ConnState>,
    destroyed: AtomicBool,
    events: mpsc::Sender<ConnectionEvent>,
}

impl DownstreamConnection {
    pub fn new(
        descriptor: EndpointDescriptor,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            state: Mutex::new(ConnState {
                status: ConnectionStatus::Disconnected,
                last_error: None,
                transport: None,
                tools: Vec::new(),
                reconnect_attempt: 0,
                reconnect_timer: None,
                fault_watch: None,
            }),
            destroyed: AtomicBool::new(false),
            events,
        })
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.lock().await.status
    }

    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        self.state.lock().await.tools.clone()
    }

    pub async fn reconnect_attempt(&self) -> u32 {
        self.state.lock().await.reconnect_attempt
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Establish the transport, discover tools, and go connected. On any
    /// failure: record the error and schedule a reconnect. No-op once
    /// destroyed. Not reentrant — callers (lifecycle and the reconnect
    /// timer) never overlap invocations on the same instance.
    ///
    /// Boxed: the reconnect timer awaits this future from inside the future
    /// itself, which an unboxed async fn cannot express.
    pub fn connect(self: Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(self.connect_inner())
    }

    async fn connect_inner(self: Arc<Self>) {
        if self.is_destroyed() {
            return;
        }

        {
            let mut st = self.state.lock().await;
            st.status = ConnectionStatus::Connecting;
            st.last_error = None;
        }
        self.emit_status(ConnectionStatus::Connecting, None).await;
        info!(
            endpoint = %self.descriptor.id,
            kind = self.descriptor.transport_kind.as_str(),
            "connecting"
        );

        match establish(&self.descriptor).await {
            Ok((transport, tools, fault_rx)) => {
                let transport = Arc::new(transport);
                let label = transport.kind_label();
                {
                    let mut st = self.state.lock().await;
                    if self.is_destroyed() {
                        // Destroyed while the connect was in flight
                        drop(st);
                        transport.close().await;
                        return;
                    }
                    st.transport = Some(Arc::clone(&transport));
                    st.tools = tools.clone();
                    st.status = ConnectionStatus::Connected;
                    st.last_error = None;
                    st.reconnect_attempt = 0;

                    let conn = Arc::clone(&self);
                    st.fault_watch = Some(tokio::spawn(async move {
                        if let Ok(reason) = fault_rx.await {
                            conn.handle_transport_fault(reason).await;
                        }
                    }));
                }
                info!(
                    endpoint = %self.descriptor.id,
                    "connected via {label}, {} tool(s) discovered",
                    tools.len()
                );
                self.emit_tools(tools).await;
                self.emit_status(ConnectionStatus::Connected, None).await;
            }
            Err(e) => {
                let msg = e.to_string();
                warn!(endpoint = %self.descriptor.id, "connect failed: {msg}");
                {
                    let mut st = self.state.lock().await;
                    st.status = ConnectionStatus::Error;
                    st.last_error = Some(msg.clone());
                }
                self.emit_status(ConnectionStatus::Error, Some(msg)).await;
                self.schedule_reconnect().await;
            }
        }
    }

    /// React to the transport's one-shot fault signal. Only acts while
    /// connected — a fault racing a disconnect or a failed connect has
    /// already been handled.
    async fn handle_transport_fault(self: Arc<Self>, reason: String) {
        if self.is_destroyed() {
            return;
        }
        {
            let mut st = self.state.lock().await;
            if st.status != ConnectionStatus::Connected {
                return;
            }
            st.transport = None;
            st.tools.clear();
            st.status = ConnectionStatus::Error;
            st.last_error = Some(reason.clone());
        }
        warn!(endpoint = %self.descriptor.id, "transport lost: {reason}");
        self.emit_tools(Vec::new()).await;
        self.emit_status(ConnectionStatus::Error, Some(reason)).await;
        self.schedule_reconnect().await;
    }

    /// Arm the reconnect timer for the current attempt and bump the counter.
    /// Skipped entirely when destroyed — at schedule time here, and again at
    /// fire time inside the timer.
    async fn schedule_reconnect(self: Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        let mut st = self.state.lock().await;
        let delay = delay_for_attempt(st.reconnect_attempt);
        st.reconnect_attempt += 1;
        debug!(
            endpoint = %self.descriptor.id,
            "reconnect in {}s (attempt {})",
            delay.as_secs(),
            st.reconnect_attempt
        );
        let conn = Arc::clone(&self);
        st.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if conn.is_destroyed() {
                return;
            }
            Arc::clone(&conn).connect().await;
        }));
    }

    /// Invoke a tool on the endpoint. Valid only while a transport is live;
    /// otherwise fails immediately without queueing or waiting. Returns the
    /// raw MCP result, or the downstream failure as a message.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<Value, String> {
        let transport = {
            let st = self.state.lock().await;
            match (&st.transport, st.status) {
                (Some(t), ConnectionStatus::Connected) => Arc::clone(t),
                _ => {
                    return Err(format!(
                        "endpoint '{}' is {}",
                        self.descriptor.id, st.status
                    ))
                }
            }
        };
        let resp = transport
            .request("tools/call", Some(json!({ "name": name, "arguments": args })))
            .await
            .map_err(|e| e.to_string())?;
        rpc::extract_result(resp).map_err(|e| e.to_string())
    }

    /// Destroy the connection: cancel any pending reconnect, close the
    /// transport best-effort, and report disconnected. Terminal — repeat
    /// calls (and later `connect()` calls) are silent no-ops.
    pub async fn disconnect(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transport = {
            let mut st = self.state.lock().await;
            if let Some(timer) = st.reconnect_timer.take() {
                timer.abort();
            }
            if let Some(watch) = st.fault_watch.take() {
                watch.abort();
            }
            st.tools.clear();
            st.status = ConnectionStatus::Disconnected;
            st.last_error = None;
            st.transport.take()
        };
        if let Some(t) = transport {
            t.close().await;
        }
        info!(endpoint = %self.descriptor.id, "disconnected");
        self.emit_status(ConnectionStatus::Disconnected, None).await;
    }

    async fn emit_status(&self, status: ConnectionStatus, error: Option<String>) {
        let _ = self
            .events
            .send(ConnectionEvent::StatusChanged {
                endpoint_id: self.descriptor.id.clone(),
                status,
                error,
            })
            .await;
    }

    async fn emit_tools(&self, tools: Vec<ToolDescriptor>) {
        let _ = self
            .events
            .send(ConnectionEvent::ToolsChanged {
                endpoint_id: self.descriptor.id.clone(),
                tools,
            })
            .await;
    }
}

/// Build a transport for the descriptor, run the MCP handshake, and discover
/// tools. Returns the transport, its tool list, and the fault receiver for
/// closure detection.
///
/// http-stream endpoints try the streaming-POST protocol first; not every
/// server implements it, so on any failure that attempt is explicitly closed
/// and the same url/headers are retried over SSE. If the fallback fails too,
/// its failure is the one propagated.
async fn establish(
    descriptor: &EndpointDescriptor,
) -> Result<(Transport, Vec<ToolDescriptor>, oneshot::Receiver<String>), TransportError> {
    match descriptor.transport_kind {
        TransportKind::Subprocess => {
            let (fault, fault_rx) = FaultSignal::pair();
            let transport = Transport::Stdio(StdioTransport::spawn(descriptor, fault)?);
            match handshake(&transport, descriptor).await {
                Ok(tools) => Ok((transport, tools, fault_rx)),
                Err(e) => {
                    transport.close().await;
                    Err(e)
                }
            }
        }
        TransportKind::Sse => {
            let (fault, fault_rx) = FaultSignal::pair();
            let transport = Transport::Sse(SseTransport::connect(descriptor, fault).await?);
            match handshake(&transport, descriptor).await {
                Ok(tools) => Ok((transport, tools, fault_rx)),
                Err(e) => {
                    transport.close().await;
                    Err(e)
                }
            }
        }
        TransportKind::HttpStream => {
            // Each attempt gets its own fault signal so a failure in the
            // abandoned first attempt cannot masquerade as a fault on the
            // fallback transport.
            let (fault, fault_rx) = FaultSignal::pair();
            let post = Transport::HttpStream(HttpStreamTransport::new(descriptor, fault)?);
            match handshake(&post, descriptor).await {
                Ok(tools) => return Ok((post, tools, fault_rx)),
                Err(first) => {
                    debug!(
                        endpoint = %descriptor.id,
                        "streaming POST rejected ({first}), falling back to SSE"
                    );
                    post.close().await;
                }
            }
            let (fault, fault_rx) = FaultSignal::pair();
            let sse = Transport::Sse(SseTransport::connect(descriptor, fault).await?);
            match handshake(&sse, descriptor).await {
                Ok(tools) => Ok((sse, tools, fault_rx)),
                Err(e) => {
                    sse.close().await;
                    Err(e)
                }
            }
        }
    }
}

/// `initialize` → `notifications/initialized` → `tools/list`. The endpoint's
/// namespace identifies this agent as the MCP client.
async fn handshake(
    transport: &Transport,
    descriptor: &EndpointDescriptor,
) -> Result<Vec<ToolDescriptor>, TransportError> {
    let init_params = json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": descriptor.namespace,
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let resp = transport.request("initialize", Some(init_params)).await?;
    rpc::extract_result(resp)?;
    transport.notify("notifications/initialized", None).await?;

    let resp = transport.request("tools/list", None).await?;
    let result = rpc::extract_result(resp)?;
    match result.get("tools") {
        Some(tools) => serde_json::from_value(tools.clone())
            .map_err(|e| TransportError::Protocol(format!("invalid tools/list payload: {e}"))),
        None => Ok(Vec::new()),
    }
}
