use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{generate_command_id, RemoteErrorBody, WireMessage};
use crate::registry::ConnectionRegistry;

/// Terminal outcome of a command as reported by the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<RemoteErrorBody>,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("agent {0} is not connected")]
    AgentOffline(String),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("agent disconnected while command was in flight: {0}")]
    Disconnected(String),
    #[error("agent reported {code}: {message}")]
    Remote { code: String, message: String },
    #[error("no agent is mapped for server {0}")]
    UnknownServer(String),
}

impl CommandError {
    /// Stable code surfaced to callers of the command façade.
    pub fn code(&self) -> &str {
        match self {
            CommandError::AgentOffline(_) => "AGENT_OFFLINE",
            CommandError::Timeout(_) => "COMMAND_TIMEOUT",
            CommandError::Disconnected(_) => "AGENT_DISCONNECTED",
            CommandError::Remote { code, .. } => code,
            CommandError::UnknownServer(_) => "UNKNOWN_SERVER",
        }
    }
}

struct PendingCommand {
    agent_id: String,
    connection_id: Uuid,
    issued_at: Instant,
    reply: oneshot::Sender<Result<CommandReply, CommandError>>,
}

#[derive(Default)]
struct PendingTable {
    commands: HashMap<String, PendingCommand>,
    /// In-flight ids per connection, so teardown can fail exactly the
    /// commands addressed to the connection that died.
    by_connection: HashMap<Uuid, HashSet<String>>,
}

impl PendingTable {
    fn insert(&mut self, id: String, pending: PendingCommand) {
        self.by_connection
            .entry(pending.connection_id)
            .or_default()
            .insert(id.clone());
        self.commands.insert(id, pending);
    }

    fn remove(&mut self, id: &str) -> Option<PendingCommand> {
        let pending = self.commands.remove(id)?;
        if let Some(ids) = self.by_connection.get_mut(&pending.connection_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_connection.remove(&pending.connection_id);
            }
        }
        Some(pending)
    }

    fn drain_connection(&mut self, connection_id: Uuid) -> Vec<PendingCommand> {
        let ids = self.by_connection.remove(&connection_id).unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.commands.remove(id))
            .collect()
    }
}

/// Turns a fire-and-forget frame send into an awaitable call with a deadline.
///
/// Sole owner of the pending-command table: entries are removed on exactly
/// one of response arrival, deadline expiry, or connection teardown, so no
/// command ever hangs and no waiter resolves twice.
pub struct CommandCorrelator {
    registry: Arc<ConnectionRegistry>,
    default_timeout: Duration,
    pending: Mutex<PendingTable>,
}

impl CommandCorrelator {
    pub fn new(registry: Arc<ConnectionRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
            pending: Mutex::new(PendingTable::default()),
        }
    }

    pub async fn send(
        &self,
        agent_id: &str,
        action: &str,
        server_id: Option<&str>,
        payload: Map<String, Value>,
    ) -> Result<CommandReply, CommandError> {
        self.send_with_timeout(agent_id, action, server_id, payload, self.default_timeout)
            .await
    }

    pub async fn send_with_timeout(
        &self,
        agent_id: &str,
        action: &str,
        server_id: Option<&str>,
        payload: Map<String, Value>,
        deadline: Duration,
    ) -> Result<CommandReply, CommandError> {
        let handle = self
            .registry
            .lookup(agent_id)
            .ok_or_else(|| CommandError::AgentOffline(agent_id.to_string()))?;

        let id = generate_command_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut table = self.pending.lock();
            table.insert(
                id.clone(),
                PendingCommand {
                    agent_id: agent_id.to_string(),
                    connection_id: handle.connection_id,
                    issued_at: Instant::now(),
                    reply: reply_tx,
                },
            );
        }

        // A teardown running between the lookup and the insert drains the
        // table before this entry exists, which would leave the command
        // waiting out its full deadline. Re-checking after the insert closes
        // that window: once the entry is visible, any later teardown fails it.
        if !self.connection_is_current(agent_id, handle.connection_id) {
            self.pending.lock().remove(&id);
            return Err(CommandError::Disconnected(
                "connection closed while dispatching".to_string(),
            ));
        }

        let message = WireMessage::Command {
            id: id.clone(),
            timestamp: Utc::now(),
            agent_id: agent_id.to_string(),
            action: action.to_string(),
            server_id: server_id.map(str::to_string),
            payload,
        };
        debug!(agent = %agent_id, command = %id, %action, "dispatching command");

        if handle.send(message).is_err() {
            self.pending.lock().remove(&id);
            return Err(CommandError::Disconnected(
                "transport closed before send".to_string(),
            ));
        }

        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            // The sender was dropped without a terminal outcome; only possible
            // if the correlator itself went away mid-flight.
            Ok(Err(_)) => Err(CommandError::Disconnected(
                "correlator dropped the waiter".to_string(),
            )),
            Err(_) => {
                self.pending.lock().remove(&id);
                warn!(agent = %agent_id, command = %id, ?deadline, "command timed out");
                Err(CommandError::Timeout(deadline))
            }
        }
    }

    fn connection_is_current(&self, agent_id: &str, connection_id: Uuid) -> bool {
        self.registry
            .lookup(agent_id)
            .map_or(false, |current| current.connection_id == connection_id)
    }

    /// Complete the waiter for `id`, if it is still pending. Late and
    /// duplicate responses are discarded with a log line, never an error.
    pub fn resolve(&self, id: &str, reply: CommandReply) {
        let pending = self.pending.lock().remove(id);
        match pending {
            Some(entry) => {
                debug!(
                    agent = %entry.agent_id,
                    command = %id,
                    elapsed_ms = entry.issued_at.elapsed().as_millis() as u64,
                    success = reply.success,
                    "command resolved"
                );
                let _ = entry.reply.send(Ok(reply));
            }
            None => {
                debug!(command = %id, "discarding response with no pending command (late or duplicate)");
            }
        }
    }

    /// Fail every command still in flight on the given connection. Returns
    /// how many waiters were completed.
    pub fn fail_all_for(&self, connection_id: Uuid, reason: &str) -> usize {
        let drained = self.pending.lock().drain_connection(connection_id);
        let count = drained.len();
        for entry in drained {
            warn!(
                agent = %entry.agent_id,
                connection = %connection_id,
                %reason,
                "failing in-flight command on teardown"
            );
            let _ = entry
                .reply
                .send(Err(CommandError::Disconnected(reason.to_string())));
        }
        count
    }

    pub fn pending_total(&self) -> usize {
        self.pending.lock().commands.len()
    }

    pub fn pending_for(&self, agent_id: &str) -> usize {
        self.pending
            .lock()
            .commands
            .values()
            .filter(|entry| entry.agent_id == agent_id)
            .count()
    }
}
