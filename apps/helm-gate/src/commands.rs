use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::correlator::{CommandCorrelator, CommandError};
use crate::protocol::RemoteErrorBody;

/// Resolves which agent hosts a given game server. Implemented by the
/// panel's persistence layer; the gateway only consumes the contract.
#[async_trait]
pub trait ServerDirectory: Send + Sync {
    async fn agent_for_server(&self, server_id: &str) -> Option<String>;
}

/// Fixed `serverId -> agentId` routing table, parsed from configuration.
/// Standalone deployments use this; an embedding panel injects its own
/// [`ServerDirectory`] instead.
pub struct StaticDirectory {
    routes: HashMap<String, String>,
}

impl StaticDirectory {
    /// Parse "srv-1=node-1,srv-2=node-2" style entries. Malformed entries
    /// are skipped.
    pub fn parse(raw: &str) -> Self {
        let routes = raw
            .split(',')
            .filter_map(|entry| {
                let (server, agent) = entry.split_once('=')?;
                let (server, agent) = (server.trim(), agent.trim());
                if server.is_empty() || agent.is_empty() {
                    return None;
                }
                Some((server.to_string(), agent.to_string()))
            })
            .collect();
        Self { routes }
    }

    pub fn empty() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}

#[async_trait]
impl ServerDirectory for StaticDirectory {
    async fn agent_for_server(&self, server_id: &str) -> Option<String> {
        self.routes.get(server_id).cloned()
    }
}

/// The single call surface the rest of the panel uses to control a game
/// server. Each method resolves the owning agent and issues one correlated
/// command; failures come back as distinct [`CommandError`] variants so
/// callers can tell "agent is gone" from "agent rejected the request".
pub struct CommandFacade {
    correlator: Arc<CommandCorrelator>,
    directory: Arc<dyn ServerDirectory>,
}

impl CommandFacade {
    pub fn new(correlator: Arc<CommandCorrelator>, directory: Arc<dyn ServerDirectory>) -> Self {
        Self {
            correlator,
            directory,
        }
    }

    pub async fn start_server(&self, server_id: &str) -> Result<Value, CommandError> {
        self.dispatch(server_id, "start_server", Map::new()).await
    }

    pub async fn stop_server(
        &self,
        server_id: &str,
        signal: &str,
        timeout_seconds: u64,
    ) -> Result<Value, CommandError> {
        let mut payload = Map::new();
        payload.insert("signal".into(), json!(signal));
        payload.insert("timeoutSeconds".into(), json!(timeout_seconds));
        self.dispatch(server_id, "stop_server", payload).await
    }

    pub async fn restart_server(&self, server_id: &str) -> Result<Value, CommandError> {
        self.dispatch(server_id, "restart_server", Map::new()).await
    }

    pub async fn get_status(&self, server_id: &str) -> Result<Value, CommandError> {
        self.dispatch(server_id, "get_status", Map::new()).await
    }

    /// Forward a console line to the game server's stdin.
    pub async fn send_command(&self, server_id: &str, command: &str) -> Result<Value, CommandError> {
        let mut payload = Map::new();
        payload.insert("command".into(), json!(command));
        self.dispatch(server_id, "send_command", payload).await
    }

    pub async fn read_file(&self, server_id: &str, path: &str) -> Result<Value, CommandError> {
        let mut payload = Map::new();
        payload.insert("path".into(), json!(path));
        self.dispatch(server_id, "read_file", payload).await
    }

    pub async fn write_file(
        &self,
        server_id: &str,
        path: &str,
        content: &str,
    ) -> Result<Value, CommandError> {
        let mut payload = Map::new();
        payload.insert("path".into(), json!(path));
        payload.insert("content".into(), json!(content));
        self.dispatch(server_id, "write_file", payload).await
    }

    async fn dispatch(
        &self,
        server_id: &str,
        action: &str,
        payload: Map<String, Value>,
    ) -> Result<Value, CommandError> {
        let agent_id = self
            .directory
            .agent_for_server(server_id)
            .await
            .ok_or_else(|| CommandError::UnknownServer(server_id.to_string()))?;

        let reply = self
            .correlator
            .send(&agent_id, action, Some(server_id), payload)
            .await?;

        if reply.success {
            Ok(reply.data.unwrap_or(Value::Null))
        } else {
            let RemoteErrorBody { code, message } = reply.error.unwrap_or(RemoteErrorBody {
                code: "UNKNOWN".to_string(),
                message: "agent reported failure without detail".to_string(),
            });
            Err(CommandError::Remote { code, message })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::CommandReply;
    use crate::protocol::WireMessage;
    use crate::registry::{AgentHandle, ConnectionRegistry};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn setup() -> (
        Arc<CommandCorrelator>,
        CommandFacade,
        mpsc::UnboundedReceiver<WireMessage>,
    ) {
        let registry = Arc::new(ConnectionRegistry::new());
        let correlator = Arc::new(CommandCorrelator::new(
            registry.clone(),
            Duration::from_millis(500),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(AgentHandle::new("node-1".to_string(), tx));
        let directory = Arc::new(StaticDirectory::parse("srv-42=node-1"));
        let facade = CommandFacade::new(correlator.clone(), directory);
        (correlator, facade, rx)
    }

    #[test]
    fn static_directory_skips_malformed_entries() {
        let directory = StaticDirectory::parse("srv-1=node-1, srv-2 = node-2 ,broken,=x,y=");
        assert_eq!(directory.len(), 2);
    }

    #[tokio::test]
    async fn start_server_sends_the_right_action() {
        let (correlator, facade, mut outbound) = setup();

        let task = tokio::spawn(async move { facade.start_server("srv-42").await });

        match outbound.recv().await.expect("command frame") {
            WireMessage::Command {
                id,
                agent_id,
                action,
                server_id,
                ..
            } => {
                assert_eq!(agent_id, "node-1");
                assert_eq!(action, "start_server");
                assert_eq!(server_id.as_deref(), Some("srv-42"));
                correlator.resolve(
                    &id,
                    CommandReply {
                        success: true,
                        data: Some(json!({"containerId": "abc123"})),
                        error: None,
                    },
                );
            }
            other => panic!("expected command, got {other:?}"),
        }

        let data = task.await.expect("join").expect("success");
        assert_eq!(data["containerId"], json!("abc123"));
    }

    #[tokio::test]
    async fn stop_server_carries_signal_and_timeout() {
        let (correlator, facade, mut outbound) = setup();

        let task = tokio::spawn(async move { facade.stop_server("srv-42", "SIGTERM", 30).await });

        match outbound.recv().await.expect("command frame") {
            WireMessage::Command { id, payload, .. } => {
                assert_eq!(payload["signal"], json!("SIGTERM"));
                assert_eq!(payload["timeoutSeconds"], json!(30));
                correlator.resolve(
                    &id,
                    CommandReply {
                        success: true,
                        data: None,
                        error: None,
                    },
                );
            }
            other => panic!("expected command, got {other:?}"),
        }

        assert_eq!(task.await.expect("join").expect("success"), Value::Null);
    }

    #[tokio::test]
    async fn remote_failure_surfaces_code_and_message() {
        let (correlator, facade, mut outbound) = setup();

        let task = tokio::spawn(async move { facade.get_status("srv-42").await });

        match outbound.recv().await.expect("command frame") {
            WireMessage::Command { id, .. } => correlator.resolve(
                &id,
                CommandReply {
                    success: false,
                    data: None,
                    error: Some(RemoteErrorBody {
                        code: "CONTAINER_NOT_FOUND".into(),
                        message: "container srv-42 does not exist".into(),
                    }),
                },
            ),
            other => panic!("expected command, got {other:?}"),
        }

        let err = task.await.expect("join").unwrap_err();
        assert_eq!(err.code(), "CONTAINER_NOT_FOUND");
        assert!(matches!(err, CommandError::Remote { .. }));
    }

    #[tokio::test]
    async fn unknown_server_is_distinct_from_offline_agent() {
        let (_correlator, facade, _outbound) = setup();
        let err = facade.start_server("srv-unknown").await.unwrap_err();
        assert!(matches!(err, CommandError::UnknownServer(_)));
        assert_eq!(err.code(), "UNKNOWN_SERVER");
    }
}
