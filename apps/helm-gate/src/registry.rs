use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::protocol::WireMessage;

/// Lifecycle of one agent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Authenticated,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Authenticated,
            2 => SessionState::Active,
            3 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Non-owning handle to a live agent connection.
///
/// The session task that accepted the socket owns the transport; everything
/// else (registry, correlator) goes through this handle, which can only
/// enqueue outbound frames and signal shutdown. Cloning is cheap.
#[derive(Clone)]
pub struct AgentHandle {
    pub agent_id: String,
    /// Distinguishes this connection from any later one for the same agent,
    /// so a stale session can never unregister its successor.
    pub connection_id: Uuid,
    pub connected_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<WireMessage>,
    last_heartbeat: Arc<RwLock<Instant>>,
    state: Arc<AtomicU8>,
    shutdown: Arc<Notify>,
    close_reason: Arc<parking_lot::Mutex<Option<&'static str>>>,
    torn_down: Arc<AtomicBool>,
}

impl AgentHandle {
    pub fn new(agent_id: String, outbound: mpsc::UnboundedSender<WireMessage>) -> Self {
        Self {
            agent_id,
            connection_id: Uuid::new_v4(),
            connected_at: Utc::now(),
            outbound,
            last_heartbeat: Arc::new(RwLock::new(Instant::now())),
            state: Arc::new(AtomicU8::new(0)),
            shutdown: Arc::new(Notify::new()),
            close_reason: Arc::new(parking_lot::Mutex::new(None)),
            torn_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Enqueue an outbound frame for this connection's writer task.
    pub fn send(
        &self,
        message: WireMessage,
    ) -> Result<(), mpsc::error::SendError<WireMessage>> {
        self.outbound.send(message)
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub async fn mark_heartbeat(&self) {
        *self.last_heartbeat.write().await = Instant::now();
    }

    /// Time since the last inbound frame (any traffic counts as liveness).
    pub async fn heartbeat_age(&self) -> std::time::Duration {
        self.last_heartbeat.read().await.elapsed()
    }

    /// Ask the owning session to close, recording why. The first recorded
    /// reason wins.
    pub fn signal_shutdown(&self, reason: &'static str) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.shutdown.notify_one();
    }

    pub async fn wait_shutdown(&self) {
        self.shutdown.notified().await;
    }

    pub fn close_reason(&self) -> Option<&'static str> {
        *self.close_reason.lock()
    }

    /// Returns true exactly once; later callers see the teardown already done.
    pub fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::SeqCst)
    }
}

/// Single source of truth mapping `agentId -> AgentHandle`.
///
/// DashMap gives per-key atomic insert/remove, which is all the supersession
/// path needs; orchestration of what happens to a displaced connection lives
/// with the session handler.
pub struct ConnectionRegistry {
    agents: DashMap<String, AgentHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }

    /// Store a handle, returning the connection it displaced (if any).
    pub fn register(&self, handle: AgentHandle) -> Option<AgentHandle> {
        self.agents.insert(handle.agent_id.clone(), handle)
    }

    pub fn lookup(&self, agent_id: &str) -> Option<AgentHandle> {
        self.agents.get(agent_id).map(|entry| entry.value().clone())
    }

    /// Remove the mapping only if it still belongs to the given connection.
    pub fn unregister(&self, agent_id: &str, connection_id: Uuid) -> bool {
        self.agents
            .remove_if(agent_id, |_, handle| handle.connection_id == connection_id)
            .is_some()
    }

    pub fn list_active(&self) -> Vec<AgentHandle> {
        self.agents
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
