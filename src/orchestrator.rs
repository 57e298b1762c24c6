//! Orchestrator: owns the endpoint-id → connection map.
//!
//! Reconciles the map against control-plane events (replace, add, remove,
//! toggle, update, refresh), routes tool calls to the right connection, and
//! relays connection status and tool-list changes back upstream. All map
//! mutation happens in this task; connections only report back through the
//! event channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionEvent, DownstreamConnection};
use crate::control::{ControlChannel, ControlEvent};
use crate::endpoint::{ConnectionStatus, EndpointDescriptor};

pub struct Orchestrator {
    connections: HashMap<String, Arc<DownstreamConnection>>,
    channel: ControlChannel,
    conn_events: mpsc::Sender<ConnectionEvent>,
}

impl Orchestrator {
    /// Build the orchestrator and the connection-event receiver that
    /// [`run`](Self::run) consumes.
    pub fn new(channel: ControlChannel) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (conn_events, conn_rx) = mpsc::channel(64);
        (
            Self {
                connections: HashMap::new(),
                channel,
                conn_events,
            },
            conn_rx,
        )
    }

    /// Event loop: control-plane instructions on one side, connection
    /// reports on the other. Returns after the control event stream ends
    /// (i.e. the control channel was disconnected), having torn everything
    /// down.
    pub async fn run(
        mut self,
        mut control_rx: mpsc::Receiver<ControlEvent>,
        mut conn_rx: mpsc::Receiver<ConnectionEvent>,
    ) {
        loop {
            tokio::select! {
                event = control_rx.recv() => match event {
                    Some(ev) => self.handle_control_event(ev).await,
                    None => break,
                },
                Some(ev) = conn_rx.recv() => self.handle_connection_event(ev).await,
            }
        }
        self.stop().await;
    }

    async fn handle_control_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::EndpointsReplaced(list) => self.replace_endpoints(list).await,
            ControlEvent::EndpointAdded(desc) => self.add_endpoint(desc).await,
            ControlEvent::EndpointRemoved { endpoint_id } => {
                self.remove_endpoint(&endpoint_id).await
            }
            ControlEvent::EndpointToggled {
                endpoint_id,
                is_enabled,
            } => self.toggle_endpoint(&endpoint_id, is_enabled).await,
            ControlEvent::EndpointUpdated(desc) => self.update_endpoint(desc).await,
            ControlEvent::EndpointRefresh { endpoint_id } => {
                self.refresh_endpoint(&endpoint_id).await
            }
            ControlEvent::ToolCall {
                call_id,
                endpoint_id,
                tool_name,
                args,
            } => self.route_tool_call(call_id, endpoint_id, tool_name, args).await,
        }
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StatusChanged {
                endpoint_id,
                status,
                error,
            } => {
                self.channel
                    .send_status_update(&endpoint_id, status, error.as_deref())
                    .await;
            }
            ConnectionEvent::ToolsChanged { endpoint_id, tools } => {
                self.channel.announce_tools(&endpoint_id, &tools).await;
            }
        }
    }

    /// Reconcile against a full descriptor list: drop tracked ids absent
    /// from it, add enabled ids not yet tracked. Ids present on both sides
    /// keep their existing connection untouched even if descriptor fields
    /// differ — field changes only apply through an explicit update event.
    pub async fn replace_endpoints(&mut self, incoming: Vec<EndpointDescriptor>) {
        let incoming_ids: HashSet<&str> = incoming.iter().map(|d| d.id.as_str()).collect();
        let stale: Vec<String> = self
            .connections
            .keys()
            .filter(|id| !incoming_ids.contains(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            if let Some(conn) = self.connections.remove(&id) {
                info!(endpoint = %id, "endpoint no longer configured, removing");
                conn.disconnect().await;
            }
        }
        for desc in incoming {
            if !desc.is_enabled || self.connections.contains_key(&desc.id) {
                continue;
            }
            self.spawn_connection(desc).await;
        }
    }

    /// Disabled descriptors are skipped; an existing entry for the id is
    /// fully torn down before the new connection starts.
    async fn add_endpoint(&mut self, desc: EndpointDescriptor) {
        if !desc.is_enabled {
            debug!(endpoint = %desc.id, "endpoint is disabled, not connecting");
            return;
        }
        if let Some(old) = self.connections.remove(&desc.id) {
            old.disconnect().await;
        }
        self.spawn_connection(desc).await;
    }

    async fn remove_endpoint(&mut self, endpoint_id: &str) {
        if let Some(conn) = self.connections.remove(endpoint_id) {
            info!(endpoint = %endpoint_id, "removing endpoint");
            conn.disconnect().await;
        }
    }

    async fn toggle_endpoint(&mut self, endpoint_id: &str, is_enabled: bool) {
        if is_enabled {
            if !self.connections.contains_key(endpoint_id) {
                // No descriptor to connect with; the control plane follows
                // up with a refresh or update carrying the full descriptor.
                self.channel
                    .send_status_update(endpoint_id, ConnectionStatus::Connecting, None)
                    .await;
            }
        } else {
            self.remove_endpoint(endpoint_id).await;
        }
    }

    /// Always a full teardown/rebuild, never an in-place field patch.
    async fn update_endpoint(&mut self, desc: EndpointDescriptor) {
        if let Some(old) = self.connections.remove(&desc.id) {
            old.disconnect().await;
        }
        if desc.is_enabled {
            self.spawn_connection(desc).await;
        }
    }

    /// Force-reconnect using the descriptor already on file.
    async fn refresh_endpoint(&mut self, endpoint_id: &str) {
        match self.connections.remove(endpoint_id) {
            Some(old) => {
                info!(endpoint = %endpoint_id, "refreshing endpoint");
                let desc = old.descriptor().clone();
                old.disconnect().await;
                self.spawn_connection(desc).await;
            }
            None => debug!(endpoint = %endpoint_id, "refresh for unknown endpoint, ignoring"),
        }
    }

    /// Track the descriptor and start connecting in the background. Connect
    /// failures surface as status updates, never as orchestrator errors.
    async fn spawn_connection(&mut self, desc: EndpointDescriptor) {
        if let Err(e) = desc.validate() {
            warn!("rejecting endpoint: {e}");
            self.channel
                .send_status_update(&desc.id, ConnectionStatus::Error, Some(&e))
                .await;
            return;
        }
        let conn = DownstreamConnection::new(desc, self.conn_events.clone());
        self.connections
            .insert(conn.descriptor().id.clone(), Arc::clone(&conn));
        tokio::spawn(conn.connect());
    }

    /// Route a tool call to its endpoint's connection. Untracked or
    /// not-connected endpoints fail the call immediately; a live call runs
    /// in its own task so a slow downstream never stalls the event loop.
    async fn route_tool_call(
        &mut self,
        call_id: String,
        endpoint_id: String,
        tool_name: String,
        args: Value,
    ) {
        let Some(conn) = self.connections.get(&endpoint_id) else {
            warn!(endpoint = %endpoint_id, "tool call for untracked endpoint");
            self.channel
                .send_tool_error(
                    &call_id,
                    &format!("no local client for endpoint '{endpoint_id}'"),
                )
                .await;
            return;
        };
        let conn = Arc::clone(conn);
        let channel = self.channel.clone();
        tokio::spawn(async move {
            match conn.call_tool(&tool_name, args).await {
                Ok(result) => channel.send_tool_result(&call_id, result).await,
                Err(e) => channel.send_tool_error(&call_id, &e).await,
            }
        });
    }

    /// Tear down every connection, then the control channel. Idempotent.
    pub async fn stop(&mut self) {
        for (_, conn) in self.connections.drain() {
            conn.disconnect().await;
        }
        self.channel.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{ToolDescriptor, TransportKind};
    use serde_json::json;
    use std::collections::HashMap as Map;
    use std::time::Duration;

    fn descriptor(id: &str, command: &str, enabled: bool) -> EndpointDescriptor {
        EndpointDescriptor {
            id: id.into(),
            name: id.into(),
            namespace: "uplink-test".into(),
            transport_kind: TransportKind::Subprocess,
            url: None,
            command: Some(command.into()),
            args: vec![],
            env: Map::new(),
            headers: Map::new(),
            is_enabled: enabled,
        }
    }

    fn tracked_ids(orch: &Orchestrator) -> Vec<String> {
        let mut ids: Vec<String> = orch.connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn harness() -> (Orchestrator, mpsc::Receiver<Value>, mpsc::Receiver<ConnectionEvent>) {
        let (channel, out_rx) = ControlChannel::stub();
        let (orch, conn_rx) = Orchestrator::new(channel);
        (orch, out_rx, conn_rx)
    }

    fn drain_outbound(rx: &mut mpsc::Receiver<Value>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn replace_tracks_only_enabled_endpoints() {
        let (mut orch, _out, _conn) = harness();
        orch.replace_endpoints(vec![
            descriptor("a", "/bin/nope", true),
            descriptor("b", "/bin/nope", false),
        ])
        .await;
        assert_eq!(tracked_ids(&orch), vec!["a"]);
    }

    #[tokio::test]
    async fn replace_reconciles_removed_ids() {
        let (mut orch, _out, _conn) = harness();
        orch.replace_endpoints(vec![
            descriptor("a", "/bin/nope", true),
            descriptor("b", "/bin/nope", true),
        ])
        .await;
        orch.replace_endpoints(vec![descriptor("b", "/bin/nope", true)])
            .await;
        assert_eq!(tracked_ids(&orch), vec!["b"]);
    }

    #[tokio::test]
    async fn replace_does_not_diff_surviving_descriptors() {
        let (mut orch, _out, _conn) = harness();
        orch.replace_endpoints(vec![descriptor("a", "/bin/old", true)])
            .await;
        let before = Arc::clone(&orch.connections["a"]);

        // Same id, different fields: the existing connection survives as-is
        orch.replace_endpoints(vec![descriptor("a", "/bin/new", true)])
            .await;
        let after = &orch.connections["a"];
        assert!(Arc::ptr_eq(&before, after));
        assert_eq!(after.descriptor().command.as_deref(), Some("/bin/old"));
    }

    #[tokio::test]
    async fn add_replaces_existing_entry() {
        let (mut orch, _out, _conn) = harness();
        orch.add_endpoint(descriptor("a", "/bin/old", true)).await;
        let before = Arc::clone(&orch.connections["a"]);

        orch.add_endpoint(descriptor("a", "/bin/new", true)).await;
        let after = &orch.connections["a"];
        assert!(!Arc::ptr_eq(&before, after));
        assert!(before.is_destroyed());
        assert_eq!(after.descriptor().command.as_deref(), Some("/bin/new"));
    }

    #[tokio::test]
    async fn add_skips_disabled() {
        let (mut orch, _out, _conn) = harness();
        orch.add_endpoint(descriptor("a", "/bin/nope", false)).await;
        assert!(orch.connections.is_empty());
    }

    #[tokio::test]
    async fn remove_then_route_fails_with_no_local_client() {
        let (mut orch, mut out, _conn) = harness();
        orch.replace_endpoints(vec![descriptor("a", "/bin/nope", true)])
            .await;
        orch.remove_endpoint("a").await;
        assert!(orch.connections.is_empty());

        orch.route_tool_call("c-1".into(), "a".into(), "read".into(), json!({}))
            .await;
        let msgs = drain_outbound(&mut out);
        let result = msgs
            .iter()
            .find(|m| m["type"] == "toolResult")
            .expect("missing toolResult");
        assert_eq!(result["callId"], "c-1");
        assert!(result["error"]
            .as_str()
            .unwrap()
            .contains("no local client for endpoint 'a'"));
    }

    #[tokio::test]
    async fn route_to_tracked_but_unconnected_names_status() {
        let (mut orch, mut out, _conn) = harness();
        orch.replace_endpoints(vec![descriptor("a", "/nonexistent/server", true)])
            .await;
        orch.route_tool_call("c-2".into(), "a".into(), "read".into(), json!({}))
            .await;

        // The call runs in a spawned task; give it a moment to settle
        tokio::time::sleep(Duration::from_millis(100)).await;
        let msgs = drain_outbound(&mut out);
        let result = msgs
            .iter()
            .find(|m| m["type"] == "toolResult")
            .expect("missing toolResult");
        assert!(result["error"].as_str().unwrap().contains("endpoint 'a' is"));
    }

    #[tokio::test]
    async fn toggle_disable_drops_and_reports_disconnected() {
        let (mut orch, _out, mut conn_rx) = harness();
        orch.replace_endpoints(vec![descriptor("x", "/bin/nope", true)])
            .await;
        orch.toggle_endpoint("x", false).await;
        assert!(orch.connections.is_empty());

        let disconnects = {
            let mut n = 0;
            while let Ok(ev) = conn_rx.try_recv() {
                if matches!(
                    ev,
                    ConnectionEvent::StatusChanged {
                        status: ConnectionStatus::Disconnected,
                        ..
                    }
                ) {
                    n += 1;
                }
            }
            n
        };
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn toggle_enable_untracked_only_reports_connecting() {
        let (mut orch, mut out, _conn) = harness();
        orch.toggle_endpoint("ghost", true).await;
        assert!(orch.connections.is_empty());

        let msgs = drain_outbound(&mut out);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["type"], "statusUpdate");
        assert_eq!(msgs[0]["endpointId"], "ghost");
        assert_eq!(msgs[0]["status"], "connecting");
    }

    #[tokio::test]
    async fn update_is_full_teardown_rebuild() {
        let (mut orch, _out, _conn) = harness();
        orch.replace_endpoints(vec![descriptor("a", "/bin/old", true)])
            .await;
        let before = Arc::clone(&orch.connections["a"]);

        orch.update_endpoint(descriptor("a", "/bin/new", true)).await;
        assert!(before.is_destroyed());
        assert_eq!(
            orch.connections["a"].descriptor().command.as_deref(),
            Some("/bin/new")
        );

        orch.update_endpoint(descriptor("a", "/bin/new", false)).await;
        assert!(orch.connections.is_empty());
    }

    #[tokio::test]
    async fn refresh_reuses_known_descriptor() {
        let (mut orch, _out, _conn) = harness();
        orch.replace_endpoints(vec![descriptor("a", "/bin/original", true)])
            .await;
        let before = Arc::clone(&orch.connections["a"]);

        orch.refresh_endpoint("a").await;
        let after = &orch.connections["a"];
        assert!(!Arc::ptr_eq(&before, after));
        assert_eq!(after.descriptor().command.as_deref(), Some("/bin/original"));

        // Refresh of an unknown id changes nothing
        orch.refresh_endpoint("ghost").await;
        assert_eq!(tracked_ids(&orch), vec!["a"]);
    }

    #[tokio::test]
    async fn event_sequence_keeps_map_consistent() {
        let (mut orch, _out, _conn) = harness();
        orch.replace_endpoints(vec![
            descriptor("a", "/bin/nope", true),
            descriptor("b", "/bin/nope", true),
        ])
        .await;
        orch.add_endpoint(descriptor("c", "/bin/nope", true)).await;
        orch.remove_endpoint("a").await;
        orch.toggle_endpoint("b", false).await;
        orch.add_endpoint(descriptor("d", "/bin/nope", false)).await;
        assert_eq!(tracked_ids(&orch), vec!["c"]);
    }

    #[tokio::test]
    async fn connection_events_are_relayed_upstream() {
        let (mut orch, mut out, _conn) = harness();
        orch.handle_connection_event(ConnectionEvent::StatusChanged {
            endpoint_id: "a".into(),
            status: ConnectionStatus::Error,
            error: Some("spawn failed".into()),
        })
        .await;
        orch.handle_connection_event(ConnectionEvent::ToolsChanged {
            endpoint_id: "a".into(),
            tools: vec![ToolDescriptor {
                name: "read".into(),
                description: String::new(),
                input_schema: json!({}),
            }],
        })
        .await;

        let msgs = drain_outbound(&mut out);
        assert_eq!(msgs[0]["type"], "statusUpdate");
        assert_eq!(msgs[0]["error"], "spawn failed");
        assert_eq!(msgs[1]["type"], "toolsAnnounce");
        assert_eq!(msgs[1]["tools"][0]["name"], "read");
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (mut orch, _out, mut conn_rx) = harness();
        orch.replace_endpoints(vec![descriptor("a", "/bin/nope", true)])
            .await;
        orch.stop().await;
        orch.stop().await;
        assert!(orch.connections.is_empty());

        let mut disconnects = 0;
        while let Ok(ev) = conn_rx.try_recv() {
            if matches!(
                ev,
                ConnectionEvent::StatusChanged {
                    status: ConnectionStatus::Disconnected,
                    ..
                }
            ) {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
    }
}
