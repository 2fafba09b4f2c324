use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::protocol::{self, RemoteErrorBody, WireMessage};

#[derive(Parser, Debug)]
#[command(name = "helm-gate")]
#[command(about = "Helm agent gateway and debug agent simulator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a running gateway as a simulated agent. Handshakes,
    /// answers heartbeats, and acknowledges every command — useful for
    /// smoke-testing the panel side without a real node.
    Agent {
        /// Gateway URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Agent identity to claim
        #[arg(short, long, default_value = "debug-node")]
        agent_id: String,

        /// Bearer token for the handshake
        #[arg(short, long)]
        token: String,

        /// Reject every command with this error code instead of succeeding
        #[arg(long)]
        fail_with: Option<String>,
    },
}

pub async fn run_debug_agent(
    url: String,
    agent_id: String,
    token: String,
    fail_with: Option<String>,
) -> Result<()> {
    let ws_url = format!("{}/ws/agent", url.trim_end_matches('/'));
    debug!("connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(err)) => {
            return Err(anyhow::anyhow!("connection to {} failed: {}", ws_url, err));
        }
        Err(_) => {
            return Err(anyhow::anyhow!(
                "connection timeout - is the gateway running at {}?",
                url
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let hello = WireMessage::Hello {
        agent_id: agent_id.clone(),
        token,
        version: Some(format!("helm-gate-sim/{}", env!("CARGO_PKG_VERSION"))),
    };
    write
        .send(Message::Text(protocol::encode(&hello)?.into()))
        .await?;

    // The gateway acknowledges a valid handshake before anything else.
    let admitted = timeout(Duration::from_secs(5), async {
        while let Some(frame) = read.next().await {
            if let Message::Text(text) = frame? {
                match protocol::decode(&text) {
                    Ok(WireMessage::HelloOk { agent_id }) => {
                        return Ok::<_, anyhow::Error>(agent_id)
                    }
                    Ok(other) => debug!("ignoring {:?} while waiting for hello_ok", other),
                    Err(err) => warn!("undecodable frame during handshake: {}", err),
                }
            }
        }
        Err(anyhow::anyhow!("connection closed during handshake"))
    })
    .await;

    match admitted {
        Ok(Ok(id)) => info!("admitted as agent {}", id),
        Ok(Err(err)) => return Err(err),
        Err(_) => {
            return Err(anyhow::anyhow!(
                "no handshake acknowledgement - was the token rejected?"
            ));
        }
    }

    while let Some(frame) = read.next().await {
        let frame = frame?;
        let text = match frame {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => {
                info!("gateway closed the connection");
                break;
            }
            _ => continue,
        };

        match protocol::decode(&text) {
            Ok(WireMessage::Ping) => {
                write
                    .send(Message::Text(protocol::encode(&WireMessage::Pong)?.into()))
                    .await?;
            }
            Ok(WireMessage::Command {
                id,
                action,
                server_id,
                payload,
                ..
            }) => {
                info!(
                    "command {}: action={} server={} payload={}",
                    id,
                    action,
                    server_id.as_deref().unwrap_or("-"),
                    serde_json::to_string(&payload)?
                );
                let response = match &fail_with {
                    Some(code) => WireMessage::Response {
                        id,
                        timestamp: Utc::now(),
                        success: false,
                        agent_id: Some(agent_id.clone()),
                        data: None,
                        error: Some(RemoteErrorBody {
                            code: code.clone(),
                            message: format!("simulated failure for {action}"),
                        }),
                    },
                    None => {
                        let mut data = serde_json::Map::new();
                        data.insert("action".into(), json!(action));
                        data.insert("echo".into(), json!(payload));
                        WireMessage::Response {
                            id,
                            timestamp: Utc::now(),
                            success: true,
                            agent_id: Some(agent_id.clone()),
                            data: Some(json!(data)),
                            error: None,
                        }
                    }
                };
                write
                    .send(Message::Text(protocol::encode(&response)?.into()))
                    .await?;
            }
            Ok(other) => debug!("ignoring frame {:?}", other),
            Err(err) => warn!("undecodable frame from gateway: {}", err),
        }
    }

    Ok(())
}
