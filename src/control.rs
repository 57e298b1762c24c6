//! Control channel: the single persistent link to the remote control plane.
//!
//! The channel dials out over WebSocket, authenticates with the configured
//! credential, and announces itself with a `join` message — the control plane
//! only starts pushing endpoint state after seeing the join, not on the bare
//! transport connect. Inbound messages become typed [`ControlEvent`]s for the
//! orchestrator; outbound sends are fire-and-forget and never block or fail
//! observably to their caller.
//!
//! The connection retries forever: 1s initial delay, doubling to a 30s cap,
//! reset after every successful connect. Only `disconnect()` stops it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::endpoint::{ConnectionStatus, EndpointDescriptor, ToolDescriptor};

/// Agent protocol revision presented during authentication.
pub const AGENT_PROTOCOL_VERSION: &str = "1";

const CONTROL_RETRY_CAP_SECS: u64 = 30;
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Typed control-plane instruction, decoded from the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    EndpointsReplaced(Vec<EndpointDescriptor>),
    EndpointAdded(EndpointDescriptor),
    EndpointRemoved {
        endpoint_id: String,
    },
    EndpointToggled {
        endpoint_id: String,
        is_enabled: bool,
    },
    EndpointUpdated(EndpointDescriptor),
    EndpointRefresh {
        endpoint_id: String,
    },
    ToolCall {
        call_id: String,
        endpoint_id: String,
        tool_name: String,
        args: Value,
    },
}

/// Handle to the control-plane session. Cheap to clone; all clones feed the
/// same underlying connection.
#[derive(Clone)]
pub struct ControlChannel {
    outbound: mpsc::Sender<Value>,
    stopped: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl ControlChannel {
    /// Start the session task and return its handle. The task connects,
    /// joins, and keeps reconnecting until `disconnect()`.
    pub fn connect(config: &AgentConfig, events: mpsc::Sender<ControlEvent>) -> Self {
        let (outbound, out_rx) = mpsc::channel(64);
        let channel = Self {
            outbound,
            stopped: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        };

        let url = build_control_url(&config.server_url, &config.agent_name, &config.credential);
        let stopped = Arc::clone(&channel.stopped);
        let shutdown = Arc::clone(&channel.shutdown);
        tokio::spawn(async move {
            let url = match url {
                Ok(u) => u,
                Err(e) => {
                    error!("cannot build control url: {e}");
                    return;
                }
            };
            run_session(url, events, out_rx, stopped, shutdown).await;
        });
        channel
    }

    /// Send the endpoint's tool list, trimmed to name/description/inputSchema.
    pub async fn announce_tools(&self, endpoint_id: &str, tools: &[ToolDescriptor]) {
        let trimmed: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": t.input_schema,
                })
            })
            .collect();
        self.send(json!({
            "type": "toolsAnnounce",
            "endpointId": endpoint_id,
            "tools": trimmed,
        }))
        .await;
    }

    pub async fn send_tool_result(&self, call_id: &str, result: Value) {
        self.send(json!({
            "type": "toolResult",
            "callId": call_id,
            "result": result,
        }))
        .await;
    }

    pub async fn send_tool_error(&self, call_id: &str, message: &str) {
        self.send(json!({
            "type": "toolResult",
            "callId": call_id,
            "error": message,
        }))
        .await;
    }

    pub async fn send_status_update(
        &self,
        endpoint_id: &str,
        status: ConnectionStatus,
        error: Option<&str>,
    ) {
        let mut msg = json!({
            "type": "statusUpdate",
            "endpointId": endpoint_id,
            "status": status.as_str(),
        });
        if let Some(e) = error {
            msg["error"] = Value::String(e.to_string());
        }
        self.send(msg).await;
    }

    /// Fire-and-forget: if the session is gone or the queue is full the
    /// message is dropped, never blocking the caller.
    async fn send(&self, msg: Value) {
        if let Err(e) = self.outbound.try_send(msg) {
            debug!("dropping outbound control message: {e}");
        }
    }

    /// Stop the session for good. Idempotent, safe before the first connect.
    pub fn disconnect(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_one();
        info!("control channel stopped");
    }

    #[cfg(test)]
    pub(crate) fn stub() -> (Self, mpsc::Receiver<Value>) {
        let (outbound, rx) = mpsc::channel(64);
        (
            Self {
                outbound,
                stopped: Arc::new(AtomicBool::new(false)),
                shutdown: Arc::new(Notify::new()),
            },
            rx,
        )
    }
}

/// Connect/join/pump loop. Owns the outbound queue receiver so queued sends
/// survive a reconnect.
async fn run_session(
    url: String,
    events: mpsc::Sender<ControlEvent>,
    mut out_rx: mpsc::Receiver<Value>,
    stopped: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    let mut delay = 1u64;
    loop {
        if stopped.load(Ordering::SeqCst) {
            return;
        }
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!("control channel connected");
                delay = 1;
                let (mut sink, mut stream) = ws.split();

                if let Err(e) = sink
                    .send(Message::Text(json!({ "type": "join" }).to_string()))
                    .await
                {
                    warn!("failed to send join: {e}");
                } else {
                    let mut heartbeat =
                        tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
                    heartbeat.tick().await; // first tick is immediate

                    loop {
                        tokio::select! {
                            msg = stream.next() => match msg {
                                Some(Ok(Message::Text(text))) => {
                                    if !handle_inbound(&text, &events).await {
                                        return;
                                    }
                                }
                                Some(Ok(Message::Ping(payload))) => {
                                    let _ = sink.send(Message::Pong(payload)).await;
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    warn!("control channel closed by server");
                                    break;
                                }
                                Some(Err(e)) => {
                                    warn!("control channel error: {e}");
                                    break;
                                }
                                Some(Ok(_)) => {}
                            },
                            out = out_rx.recv() => match out {
                                Some(msg) => {
                                    if let Err(e) = sink.send(Message::Text(msg.to_string())).await {
                                        warn!("control send failed: {e}");
                                        break;
                                    }
                                }
                                None => return,
                            },
                            _ = heartbeat.tick() => {
                                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                                    break;
                                }
                            }
                            _ = shutdown.notified() => {
                                let _ = sink.send(Message::Close(None)).await;
                                return;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!("control connect failed: {e}");
            }
        }

        if stopped.load(Ordering::SeqCst) {
            return;
        }
        debug!("control reconnect in {delay}s");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
            _ = shutdown.notified() => return,
        }
        delay = (delay * 2).min(CONTROL_RETRY_CAP_SECS);
    }
}

/// Decode one inbound frame and forward it. Returns false when the event
/// receiver is gone and the session should end.
async fn handle_inbound(text: &str, events: &mpsc::Sender<ControlEvent>) -> bool {
    let msg: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("unparseable control message: {e}");
            return true;
        }
    };
    if msg["type"] == "join_ack" {
        if msg["status"] == "error" {
            error!("control plane rejected join: {msg}");
        } else {
            debug!("join acknowledged");
        }
        return true;
    }
    match parse_control_message(&msg) {
        Some(event) => events.send(event).await.is_ok(),
        None => {
            debug!("ignoring control message: {msg}");
            true
        }
    }
}

/// Decode a server→agent message into a [`ControlEvent`]. Returns `None` for
/// unknown types or malformed payloads.
fn parse_control_message(msg: &Value) -> Option<ControlEvent> {
    let endpoint_id = |msg: &Value| {
        msg.get("endpointId")
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    match msg.get("type")?.as_str()? {
        "endpoints" => {
            let list = serde_json::from_value(msg.get("endpoints")?.clone()).ok()?;
            Some(ControlEvent::EndpointsReplaced(list))
        }
        "endpoint_add" => {
            let endpoint = serde_json::from_value(msg.get("endpoint")?.clone()).ok()?;
            Some(ControlEvent::EndpointAdded(endpoint))
        }
        "endpoint_remove" => Some(ControlEvent::EndpointRemoved {
            endpoint_id: endpoint_id(msg)?,
        }),
        "endpoint_toggle" => Some(ControlEvent::EndpointToggled {
            endpoint_id: endpoint_id(msg)?,
            is_enabled: msg.get("isEnabled")?.as_bool()?,
        }),
        "endpoint_update" => {
            let endpoint = serde_json::from_value(msg.get("endpoint")?.clone()).ok()?;
            Some(ControlEvent::EndpointUpdated(endpoint))
        }
        "endpoint_refresh" => Some(ControlEvent::EndpointRefresh {
            endpoint_id: endpoint_id(msg)?,
        }),
        "tool_call" => Some(ControlEvent::ToolCall {
            call_id: msg.get("callId")?.as_str()?.to_string(),
            endpoint_id: endpoint_id(msg)?,
            tool_name: msg.get("toolName")?.as_str()?.to_string(),
            args: msg.get("args").cloned().unwrap_or_else(|| json!({})),
        }),
        _ => None,
    }
}

/// Rewrite the configured http(s) URL to ws(s) and attach the auth query.
fn build_control_url(
    server_url: &str,
    agent_name: &str,
    credential: &str,
) -> Result<String, String> {
    let ws_base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if server_url.starts_with("ws://") || server_url.starts_with("wss://") {
        server_url.to_string()
    } else {
        return Err(format!("unsupported server url scheme: {server_url}"));
    };

    let base = format!("{}/agent", ws_base.trim_end_matches('/'));
    let mut url =
        reqwest::Url::parse(&base).map_err(|e| format!("invalid server url '{server_url}': {e}"))?;
    url.query_pairs_mut()
        .append_pair("credential", credential)
        .append_pair("agent", agent_name)
        .append_pair("agentProtocolVersion", AGENT_PROTOCOL_VERSION);
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::TransportKind;

    #[test]
    fn control_url_rewrites_scheme_and_auth() {
        let url = build_control_url("https://control.example.com/", "edge-1", "s3cret").unwrap();
        assert!(url.starts_with("wss://control.example.com/agent?"));
        assert!(url.contains("credential=s3cret"));
        assert!(url.contains("agent=edge-1"));
        assert!(url.contains("agentProtocolVersion=1"));
    }

    #[test]
    fn control_url_encodes_query_values() {
        let url = build_control_url("http://localhost:9000", "edge one", "a&b=c").unwrap();
        assert!(url.starts_with("ws://localhost:9000/agent?"));
        assert!(url.contains("agent=edge+one"));
        assert!(!url.contains("a&b=c"));
    }

    #[test]
    fn control_url_rejects_unknown_scheme() {
        assert!(build_control_url("ftp://x", "a", "c").is_err());
    }

    #[test]
    fn parse_full_replace() {
        let msg = json!({
            "type": "endpoints",
            "endpoints": [{
                "id": "fs", "name": "FS", "namespace": "uplink",
                "transportKind": "subprocess", "command": "mcp-fs"
            }]
        });
        match parse_control_message(&msg) {
            Some(ControlEvent::EndpointsReplaced(list)) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].id, "fs");
                assert_eq!(list[0].transport_kind, TransportKind::Subprocess);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_add_and_update_carry_descriptors() {
        let endpoint = json!({
            "id": "web", "name": "Web", "namespace": "uplink",
            "transportKind": "http-stream", "url": "http://localhost:3000/mcp"
        });
        let add = parse_control_message(&json!({ "type": "endpoint_add", "endpoint": endpoint }));
        assert!(matches!(add, Some(ControlEvent::EndpointAdded(d)) if d.id == "web"));
        let upd =
            parse_control_message(&json!({ "type": "endpoint_update", "endpoint": endpoint }));
        assert!(matches!(upd, Some(ControlEvent::EndpointUpdated(d)) if d.id == "web"));
    }

    #[test]
    fn parse_remove_toggle_refresh() {
        assert_eq!(
            parse_control_message(&json!({ "type": "endpoint_remove", "endpointId": "a" })),
            Some(ControlEvent::EndpointRemoved {
                endpoint_id: "a".into()
            })
        );
        assert_eq!(
            parse_control_message(
                &json!({ "type": "endpoint_toggle", "endpointId": "a", "isEnabled": false })
            ),
            Some(ControlEvent::EndpointToggled {
                endpoint_id: "a".into(),
                is_enabled: false
            })
        );
        assert_eq!(
            parse_control_message(&json!({ "type": "endpoint_refresh", "endpointId": "a" })),
            Some(ControlEvent::EndpointRefresh {
                endpoint_id: "a".into()
            })
        );
    }

    #[test]
    fn parse_tool_call_defaults_args() {
        let msg = json!({
            "type": "tool_call",
            "callId": "c-1",
            "endpointId": "fs",
            "toolName": "read_file"
        });
        match parse_control_message(&msg) {
            Some(ControlEvent::ToolCall {
                call_id,
                endpoint_id,
                tool_name,
                args,
            }) => {
                assert_eq!(call_id, "c-1");
                assert_eq!(endpoint_id, "fs");
                assert_eq!(tool_name, "read_file");
                assert_eq!(args, json!({}));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_unknown_and_malformed() {
        assert!(parse_control_message(&json!({ "type": "reboot" })).is_none());
        assert!(parse_control_message(&json!({ "type": "endpoint_remove" })).is_none());
        assert!(parse_control_message(&json!({ "no_type": true })).is_none());
        assert!(
            parse_control_message(&json!({ "type": "endpoint_toggle", "endpointId": "a" }))
                .is_none()
        );
    }

    #[tokio::test]
    async fn outbound_helpers_shape_messages() {
        let (channel, mut rx) = ControlChannel::stub();

        let tools = vec![ToolDescriptor {
            name: "read_file".into(),
            description: "Read a file".into(),
            input_schema: json!({"type": "object"}),
        }];
        channel.announce_tools("fs", &tools).await;
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg["type"], "toolsAnnounce");
        assert_eq!(msg["endpointId"], "fs");
        assert_eq!(msg["tools"][0]["name"], "read_file");
        assert_eq!(msg["tools"][0]["inputSchema"]["type"], "object");

        channel.send_tool_result("c-1", json!({"content": []})).await;
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg["type"], "toolResult");
        assert_eq!(msg["callId"], "c-1");
        assert!(msg.get("error").is_none());

        channel.send_tool_error("c-2", "boom").await;
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg["callId"], "c-2");
        assert_eq!(msg["error"], "boom");

        channel
            .send_status_update("fs", ConnectionStatus::Error, Some("spawn failed"))
            .await;
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg["type"], "statusUpdate");
        assert_eq!(msg["status"], "error");
        assert_eq!(msg["error"], "spawn failed");

        channel
            .send_status_update("fs", ConnectionStatus::Connected, None)
            .await;
        let msg = rx.try_recv().unwrap();
        assert!(msg.get("error").is_none());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (channel, _rx) = ControlChannel::stub();
        channel.disconnect();
        channel.disconnect();
        assert!(channel.stopped.load(Ordering::SeqCst));
    }
}
