use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::commands::{CommandFacade, ServerDirectory};
use crate::config::Config;
use crate::correlator::{CommandCorrelator, CommandReply};
use crate::events::{AgentEvent, EventBus};
use crate::protocol::{self, WireMessage};
use crate::registry::{AgentHandle, ConnectionRegistry, SessionState};

const MISSED_HEARTBEAT_LIMIT: u32 = 3;

/// Shared state for the gateway: registry, correlator, event bus and façade,
/// explicitly constructed once and injected everywhere (no globals).
#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<ConnectionRegistry>,
    pub correlator: Arc<CommandCorrelator>,
    pub events: Arc<EventBus>,
    pub facade: Arc<CommandFacade>,
    pub config: Arc<Config>,
    token_digest: String,
}

fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl GatewayState {
    pub fn new(config: Config, directory: Arc<dyn ServerDirectory>) -> anyhow::Result<Self> {
        let token = config
            .agent_token
            .clone()
            .ok_or_else(|| anyhow::anyhow!("agent auth token is not configured"))?;
        let registry = Arc::new(ConnectionRegistry::new());
        let correlator = Arc::new(CommandCorrelator::new(
            registry.clone(),
            config.command_timeout,
        ));
        let events = Arc::new(EventBus::new(config.event_buffer));
        let facade = Arc::new(CommandFacade::new(correlator.clone(), directory));
        Ok(Self {
            registry,
            correlator,
            events,
            facade,
            config: Arc::new(config),
            token_digest: token_digest(&token),
        })
    }

    pub fn verify_token(&self, presented: &str) -> bool {
        token_digest(presented) == self.token_digest
    }
}

/// WebSocket upgrade handler for `/ws/agent`.
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

/// Per-connection lifecycle: handshake, registration, read loop, teardown.
async fn handle_socket(socket: WebSocket, state: GatewayState, remote_addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WireMessage>();

    // Writer task: the only writer of this socket. A failed write drops the
    // sink, which closes the transport and ends the read loop.
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match protocol::encode(&message) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(%err, "failed to serialize outbound frame"),
            }
        }
    });

    let (agent_id, version) = match await_hello(&state, &mut receiver, remote_addr).await {
        Some(hello) => hello,
        None => return,
    };

    let handle = AgentHandle::new(agent_id.clone(), tx.clone());
    handle.set_state(SessionState::Authenticated);
    admit(&state, &handle);
    let _ = handle.send(WireMessage::HelloOk {
        agent_id: agent_id.clone(),
    });
    info!(
        agent = %agent_id,
        connection = %handle.connection_id,
        %remote_addr,
        version = version.as_deref().unwrap_or("unknown"),
        "agent connected"
    );

    let heartbeat = tokio::spawn(heartbeat_loop(state.clone(), handle.clone()));
    let reason = read_loop(&state, &handle, &mut receiver).await;
    heartbeat.abort();
    teardown(&state, &handle, reason);
}

/// Wait for the opening `hello`. Silence past the grace period, a bad token
/// or any other first frame aborts the connection before it ever touches the
/// registry.
async fn await_hello(
    state: &GatewayState,
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    remote_addr: SocketAddr,
) -> Option<(String, Option<String>)> {
    let first = match timeout(state.config.handshake_timeout, receiver.next()).await {
        Ok(Some(Ok(frame))) => frame,
        Ok(Some(Err(err))) => {
            warn!(%remote_addr, %err, "transport error before handshake");
            return None;
        }
        Ok(None) => {
            debug!(%remote_addr, "connection closed before handshake");
            return None;
        }
        Err(_) => {
            warn!(%remote_addr, "no handshake within grace period, closing");
            return None;
        }
    };
    let text = match frame_text(first) {
        Some(text) => text,
        None => {
            warn!(%remote_addr, "handshake was not a text frame, closing");
            return None;
        }
    };
    match protocol::decode(&text) {
        Ok(WireMessage::Hello {
            agent_id,
            token,
            version,
        }) => {
            if !state.verify_token(&token) {
                warn!(%remote_addr, agent = %agent_id, "handshake rejected: invalid token");
                return None;
            }
            Some((agent_id, version))
        }
        Ok(other) => {
            warn!(%remote_addr, frame = ?other, "first frame was not a hello, closing");
            None
        }
        Err(err) => {
            warn!(%remote_addr, %err, "undecodable handshake frame, closing");
            None
        }
    }
}

/// Make a freshly authenticated connection the one the registry serves.
/// If an older connection for the same agent exists it is superseded: its
/// in-flight commands fail before the new connection can carry traffic, and
/// its session is told to shut down.
fn admit(state: &GatewayState, handle: &AgentHandle) {
    if let Some(previous) = state.registry.register(handle.clone()) {
        warn!(
            agent = %handle.agent_id,
            superseded = %previous.connection_id,
            by = %handle.connection_id,
            "newer connection supersedes the existing one"
        );
        previous.set_state(SessionState::Closing);
        state
            .correlator
            .fail_all_for(previous.connection_id, "superseded by a newer connection");
        previous.signal_shutdown("superseded by a newer connection");
    }
}

/// Exactly-once teardown: fail in-flight commands, drop the registry entry.
/// Safe to call from any path; later calls are no-ops.
fn teardown(state: &GatewayState, handle: &AgentHandle, default_reason: &'static str) {
    if !handle.begin_teardown() {
        return;
    }
    handle.set_state(SessionState::Closing);
    let reason = handle.close_reason().unwrap_or(default_reason);
    let failed = state.correlator.fail_all_for(handle.connection_id, reason);
    let removed = state.registry.unregister(&handle.agent_id, handle.connection_id);
    handle.set_state(SessionState::Closed);
    info!(
        agent = %handle.agent_id,
        connection = %handle.connection_id,
        failed_commands = failed,
        removed_from_registry = removed,
        %reason,
        "agent disconnected"
    );
}

/// Periodic ping plus liveness check. Any inbound traffic counts as a beat;
/// three consecutive silent intervals force the session closed.
async fn heartbeat_loop(state: GatewayState, handle: AgentHandle) {
    let period = state.config.heartbeat_interval;
    let grace = period + state.config.heartbeat_timeout;
    let mut ticker = tokio::time::interval(period);
    let mut missed = 0u32;
    loop {
        ticker.tick().await;
        if handle.send(WireMessage::Ping).is_err() {
            handle.signal_shutdown("transport write failed");
            return;
        }
        if handle.heartbeat_age().await > grace {
            missed += 1;
            warn!(agent = %handle.agent_id, missed, "missed heartbeat");
        } else {
            missed = 0;
        }
        if missed >= MISSED_HEARTBEAT_LIMIT {
            warn!(agent = %handle.agent_id, "heartbeat ceiling exceeded, closing connection");
            handle.signal_shutdown("heartbeat timeout");
            return;
        }
    }
}

enum FrameDisposition {
    Continue,
    PeerClosed,
    ProtocolLimit,
}

/// Frames are processed strictly in arrival order within one connection.
async fn read_loop(
    state: &GatewayState,
    handle: &AgentHandle,
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> &'static str {
    let mut malformed = 0u32;
    loop {
        tokio::select! {
            _ = handle.wait_shutdown() => {
                return handle.close_reason().unwrap_or("connection closed");
            }
            frame = receiver.next() => match frame {
                None => return "transport closed by peer",
                Some(Err(err)) => {
                    debug!(agent = %handle.agent_id, %err, "transport error");
                    return "transport error";
                }
                Some(Ok(message)) => {
                    match handle_frame(state, handle, message, &mut malformed).await {
                        FrameDisposition::Continue => {}
                        FrameDisposition::PeerClosed => return "transport closed by peer",
                        FrameDisposition::ProtocolLimit => return "malformed frame limit exceeded",
                    }
                }
            }
        }
    }
}

async fn handle_frame(
    state: &GatewayState,
    handle: &AgentHandle,
    message: Message,
    malformed: &mut u32,
) -> FrameDisposition {
    match message {
        Message::Text(text) => process_frame(state, handle, &text, malformed).await,
        // Tolerate JSON arriving in binary frames.
        Message::Binary(data) => match String::from_utf8(data) {
            Ok(text) => process_frame(state, handle, &text, malformed).await,
            Err(_) => {
                warn!(agent = %handle.agent_id, "discarding non-UTF8 binary frame");
                violation(state, handle, malformed)
            }
        },
        Message::Ping(_) | Message::Pong(_) => {
            handle.mark_heartbeat().await;
            FrameDisposition::Continue
        }
        Message::Close(_) => FrameDisposition::PeerClosed,
    }
}

async fn process_frame(
    state: &GatewayState,
    handle: &AgentHandle,
    text: &str,
    malformed: &mut u32,
) -> FrameDisposition {
    let message = match protocol::decode(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(agent = %handle.agent_id, %err, "discarding undecodable frame");
            return violation(state, handle, malformed);
        }
    };
    // A valid frame ends the burst and counts as liveness.
    *malformed = 0;
    handle.mark_heartbeat().await;

    match message {
        WireMessage::Response {
            id,
            success,
            data,
            error,
            ..
        } => {
            state.correlator.resolve(
                &id,
                CommandReply {
                    success,
                    data,
                    error,
                },
            );
        }
        WireMessage::Event {
            event,
            data,
            timestamp,
            ..
        } => {
            state.events.publish(AgentEvent {
                agent_id: handle.agent_id.clone(),
                name: event,
                data,
                timestamp,
            });
        }
        WireMessage::Pong => {
            if handle.state() == SessionState::Authenticated {
                handle.set_state(SessionState::Active);
                debug!(agent = %handle.agent_id, "heartbeat established, session active");
            }
        }
        WireMessage::Ping => {
            let _ = handle.send(WireMessage::Pong);
        }
        WireMessage::Hello { .. } | WireMessage::HelloOk { .. } => {
            warn!(agent = %handle.agent_id, "unexpected handshake frame after admission");
            return violation(state, handle, malformed);
        }
        WireMessage::Command { action, .. } => {
            warn!(agent = %handle.agent_id, %action, "agents may not issue commands, dropping frame");
            return violation(state, handle, malformed);
        }
    }
    FrameDisposition::Continue
}

fn violation(state: &GatewayState, handle: &AgentHandle, malformed: &mut u32) -> FrameDisposition {
    *malformed += 1;
    if *malformed >= state.config.malformed_frame_limit {
        warn!(
            agent = %handle.agent_id,
            count = *malformed,
            "malformed frame burst, closing connection"
        );
        FrameDisposition::ProtocolLimit
    } else {
        FrameDisposition::Continue
    }
}

fn frame_text(frame: Message) -> Option<String> {
    match frame {
        Message::Text(text) => Some(text),
        Message::Binary(data) => String::from_utf8(data).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::StaticDirectory;
    use crate::correlator::CommandError;
    use chrono::Utc;
    use futures_util::stream;
    use serde_json::Map;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_state() -> GatewayState {
        let config = Config {
            agent_token: Some("secret".to_string()),
            command_timeout: Duration::from_millis(500),
            malformed_frame_limit: 3,
            ..Config::default()
        };
        GatewayState::new(config, Arc::new(StaticDirectory::empty())).expect("state")
    }

    fn connect(state: &GatewayState, agent_id: &str) -> (AgentHandle, UnboundedReceiver<WireMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = AgentHandle::new(agent_id.to_string(), tx);
        handle.set_state(SessionState::Authenticated);
        admit(state, &handle);
        (handle, rx)
    }

    fn response_frame(id: &str, success: bool) -> String {
        format!(
            r#"{{"type":"response","id":"{id}","timestamp":"{}","success":{success},"data":{{"status":"running"}}}}"#,
            Utc::now().to_rfc3339()
        )
    }

    fn pending_command_id(outbound: &mut UnboundedReceiver<WireMessage>) -> String {
        match outbound.try_recv().expect("command frame") {
            WireMessage::Command { id, .. } => id,
            other => panic!("expected command, got {other:?}"),
        }
    }

    fn test_addr() -> SocketAddr {
        "203.0.113.9:52000".parse().expect("addr")
    }

    fn hello_stream(frame: &str) -> impl StreamExt<Item = Result<Message, axum::Error>> + Unpin {
        stream::iter(vec![Ok(Message::Text(frame.to_string()))])
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_never_enters_the_registry() {
        let state = test_state();
        let mut frames = stream::pending::<Result<Message, axum::Error>>();

        let hello = await_hello(&state, &mut frames, test_addr()).await;

        assert!(hello.is_none());
        assert_eq!(state.registry.len(), 0);
    }

    #[tokio::test]
    async fn hello_with_a_bad_token_is_rejected() {
        let state = test_state();
        let mut frames = hello_stream(r#"{"type":"hello","agentId":"node-1","token":"wrong"}"#);

        let hello = await_hello(&state, &mut frames, test_addr()).await;

        assert!(hello.is_none());
        assert_eq!(state.registry.len(), 0);
    }

    #[tokio::test]
    async fn valid_hello_yields_the_agent_identity() {
        let state = test_state();
        let mut frames = hello_stream(
            r#"{"type":"hello","agentId":"node-1","token":"secret","version":"agent/1.2.0"}"#,
        );

        let (agent_id, version) = await_hello(&state, &mut frames, test_addr())
            .await
            .expect("admitted");
        assert_eq!(agent_id, "node-1");
        assert_eq!(version.as_deref(), Some("agent/1.2.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_agent_is_closed_after_three_missed_beats() {
        let state = test_state();
        let (handle, mut outbound) = connect(&state, "node-1");

        // The loop returns once it has given up on the connection.
        tokio::spawn(heartbeat_loop(state.clone(), handle.clone()))
            .await
            .expect("join");

        assert_eq!(handle.close_reason(), Some("heartbeat timeout"));
        assert!(matches!(outbound.try_recv(), Ok(WireMessage::Ping)));
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_traffic_resets_the_missed_beat_count() {
        let state = test_state();
        let (handle, _outbound) = connect(&state, "node-1");
        let started = tokio::time::Instant::now();

        // With a 30s interval and 15s timeout, silence closes the session at
        // t=150s. A single beat partway through must start the count over.
        let beat = {
            let handle = handle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(95)).await;
                handle.mark_heartbeat().await;
            })
        };
        tokio::spawn(heartbeat_loop(state.clone(), handle.clone()))
            .await
            .expect("join");
        beat.await.expect("join");

        assert_eq!(handle.close_reason(), Some("heartbeat timeout"));
        assert!(started.elapsed() > Duration::from_secs(180));
    }

    #[test]
    fn token_verification() {
        let state = test_state();
        assert!(state.verify_token("secret"));
        assert!(!state.verify_token("wrong"));
        assert!(!state.verify_token(""));
    }

    #[tokio::test]
    async fn response_frame_resolves_the_pending_command() {
        let state = test_state();
        let (handle, mut outbound) = connect(&state, "node-1");

        let task = {
            let correlator = state.correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send("node-1", "get_status", Some("srv-42"), Map::new())
                    .await
            })
        };
        tokio::task::yield_now().await;
        let id = pending_command_id(&mut outbound);

        let mut malformed = 0;
        let disposition =
            process_frame(&state, &handle, &response_frame(&id, true), &mut malformed).await;
        assert!(matches!(disposition, FrameDisposition::Continue));

        let reply = task.await.expect("join").expect("resolved");
        assert!(reply.success);
    }

    #[tokio::test]
    async fn event_frame_reaches_subscribers() {
        let state = test_state();
        let (handle, _outbound) = connect(&state, "node-1");
        let mut subscription = state.events.subscribe();

        let text = r#"{
            "type": "event",
            "timestamp": "2026-01-05T10:00:00Z",
            "event": "console_output",
            "data": { "serverId": "srv-42", "line": "[INFO] server started" }
        }"#;
        let mut malformed = 0;
        process_frame(&state, &handle, text, &mut malformed).await;

        let event = subscription.recv().await.expect("event");
        assert_eq!(event.agent_id, "node-1");
        assert_eq!(event.name, "console_output");
    }

    #[tokio::test]
    async fn agent_ping_is_answered_with_pong() {
        let state = test_state();
        let (handle, mut outbound) = connect(&state, "node-1");

        let mut malformed = 0;
        process_frame(&state, &handle, r#"{"type":"ping"}"#, &mut malformed).await;
        assert_eq!(outbound.try_recv().expect("pong"), WireMessage::Pong);
    }

    #[tokio::test]
    async fn first_pong_promotes_the_session_to_active() {
        let state = test_state();
        let (handle, _outbound) = connect(&state, "node-1");
        assert_eq!(handle.state(), SessionState::Authenticated);

        let mut malformed = 0;
        process_frame(&state, &handle, r#"{"type":"pong"}"#, &mut malformed).await;
        assert_eq!(handle.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn single_garbled_frame_is_tolerated() {
        let state = test_state();
        let (handle, _outbound) = connect(&state, "node-1");

        let mut malformed = 0;
        assert!(matches!(
            process_frame(&state, &handle, "{garbage", &mut malformed).await,
            FrameDisposition::Continue
        ));
        assert_eq!(malformed, 1);

        // A valid frame resets the burst counter.
        process_frame(&state, &handle, r#"{"type":"pong"}"#, &mut malformed).await;
        assert_eq!(malformed, 0);
    }

    #[tokio::test]
    async fn malformed_burst_closes_the_connection() {
        let state = test_state();
        let (handle, _outbound) = connect(&state, "node-1");

        let mut malformed = 0;
        assert!(matches!(
            process_frame(&state, &handle, "{garbage", &mut malformed).await,
            FrameDisposition::Continue
        ));
        assert!(matches!(
            process_frame(&state, &handle, "not json", &mut malformed).await,
            FrameDisposition::Continue
        ));
        assert!(matches!(
            process_frame(&state, &handle, "[]", &mut malformed).await,
            FrameDisposition::ProtocolLimit
        ));
    }

    #[tokio::test]
    async fn supersession_fails_old_pending_and_swaps_the_registry_entry() {
        let state = test_state();
        let (old_handle, mut old_outbound) = connect(&state, "node-1");

        let pending = {
            let correlator = state.correlator.clone();
            tokio::spawn(
                async move { correlator.send("node-1", "get_status", None, Map::new()).await },
            )
        };
        tokio::task::yield_now().await;
        let _ = pending_command_id(&mut old_outbound);

        let (new_handle, _new_outbound) = connect(&state, "node-1");

        // The old connection's command fails immediately, not via its deadline.
        let outcome = pending.await.expect("join");
        assert!(matches!(outcome, Err(CommandError::Disconnected(_))));

        // Registry serves the new connection; the old one was told to close.
        let current = state.registry.lookup("node-1").expect("registered");
        assert_eq!(current.connection_id, new_handle.connection_id);
        assert_eq!(
            old_handle.close_reason(),
            Some("superseded by a newer connection")
        );
    }

    #[tokio::test]
    async fn teardown_fails_pending_commands_and_unregisters_once() {
        let state = test_state();
        let (handle, mut outbound) = connect(&state, "node-1");

        let pending = {
            let correlator = state.correlator.clone();
            tokio::spawn(
                async move { correlator.send("node-1", "start_server", None, Map::new()).await },
            )
        };
        tokio::task::yield_now().await;
        let _ = pending_command_id(&mut outbound);
        assert_eq!(state.correlator.pending_total(), 1);

        teardown(&state, &handle, "transport closed by peer");
        assert!(matches!(
            pending.await.expect("join"),
            Err(CommandError::Disconnected(_))
        ));
        assert_eq!(state.correlator.pending_total(), 0);
        assert!(state.registry.lookup("node-1").is_none());
        assert_eq!(handle.state(), SessionState::Closed);

        // Second teardown is a no-op.
        teardown(&state, &handle, "heartbeat timeout");
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn stale_teardown_does_not_touch_a_newer_connection() {
        let state = test_state();
        let (old_handle, _old_outbound) = connect(&state, "node-1");
        let (new_handle, mut new_outbound) = connect(&state, "node-1");

        let pending = {
            let correlator = state.correlator.clone();
            tokio::spawn(
                async move { correlator.send("node-1", "get_status", None, Map::new()).await },
            )
        };
        tokio::task::yield_now().await;
        let id = pending_command_id(&mut new_outbound);

        // The superseded session finishing its teardown must not unregister
        // the new connection or fail its in-flight command.
        teardown(&state, &old_handle, "connection closed");
        assert_eq!(
            state.registry.lookup("node-1").expect("still registered").connection_id,
            new_handle.connection_id
        );
        assert_eq!(state.correlator.pending_total(), 1);

        state.correlator.resolve(
            &id,
            CommandReply {
                success: true,
                data: None,
                error: None,
            },
        );
        assert!(pending.await.expect("join").is_ok());
    }
}
