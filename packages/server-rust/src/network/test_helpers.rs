//! In-memory fake editor process for exercising the session without sockets.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use gateway_core::{RemoteCommand, RemoteReply};
use serde_json::json;

use super::config::RemoteConfig;
use super::connection::ConnectionManager;
use super::transport::{frame, Connector, FramedTransport, RemoteStream};
use crate::service::{GatewayConfig, OperationGateway};

/// What the fake editor does with one command.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// Success carrying `{"type": .., "params": ..}` of the command.
    Echo,
    Value(serde_json::Value),
    Error(String),
    Pong,
    /// Read the command and never answer.
    Silent,
    /// Close the stream.
    Hangup,
    /// Wait, then act.
    After(Duration, Box<Reply>),
}

pub(crate) type Handler = Arc<dyn Fn(&RemoteCommand) -> Reply + Send + Sync>;

/// Answers pings with pong and echoes everything else.
pub(crate) fn responsive() -> Handler {
    Arc::new(|cmd: &RemoteCommand| {
        if cmd.command_type == gateway_core::wire::PING {
            Reply::Pong
        } else {
            Reply::Echo
        }
    })
}

/// Answers pings, handles every other command with `f`.
pub(crate) fn with_commands<F>(f: F) -> Handler
where
    F: Fn(&RemoteCommand) -> Reply + Send + Sync + 'static,
{
    Arc::new(move |cmd: &RemoteCommand| {
        if cmd.command_type == gateway_core::wire::PING {
            Reply::Pong
        } else {
            f(cmd)
        }
    })
}

/// Connector whose first `refusals` attempts fail, after which each attempt
/// gets a fresh fake editor driven by `handler`.
pub(crate) struct ScriptedConnector {
    refusals: AtomicU32,
    attempts: AtomicU32,
    handler: Handler,
}

impl ScriptedConnector {
    pub(crate) fn new(handler: Handler) -> Self {
        Self::refusing(0, handler)
    }

    pub(crate) fn refusing(refusals: u32, handler: Handler) -> Self {
        Self {
            refusals: AtomicU32::new(refusals),
            attempts: AtomicU32::new(0),
            handler,
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> io::Result<Box<dyn RemoteStream>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "editor not listening",
            ));
        }
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(frame(Box::new(server), 1 << 20), Arc::clone(&self.handler)));
        Ok(Box::new(client))
    }

    fn endpoint(&self) -> String {
        "fake-editor".to_string()
    }
}

/// Gateway over the default catalog talking to a fake editor run by `handler`.
pub(crate) fn gateway(handler: Handler) -> Arc<OperationGateway> {
    gateway_with_config(GatewayConfig::default(), handler)
}

pub(crate) fn gateway_with_config(config: GatewayConfig, handler: Handler) -> Arc<OperationGateway> {
    let connection = Arc::new(ConnectionManager::new(
        RemoteConfig::default(),
        Arc::new(ScriptedConnector::new(handler)),
    ));
    Arc::new(OperationGateway::new(
        config,
        gateway_core::catalog::default_registry().unwrap(),
        connection,
    ))
}

async fn serve(mut transport: FramedTransport, handler: Handler) {
    while let Some(Ok(bytes)) = transport.next().await {
        let Ok(cmd) = serde_json::from_slice::<RemoteCommand>(&bytes) else {
            return;
        };
        let mut reply = handler(&cmd);
        loop {
            let out = match reply {
                Reply::After(delay, next) => {
                    tokio::time::sleep(delay).await;
                    reply = *next;
                    continue;
                }
                Reply::Silent => None,
                Reply::Hangup => return,
                Reply::Pong => Some(RemoteReply::pong(cmd.id)),
                Reply::Echo => Some(RemoteReply::Success {
                    id: cmd.id,
                    result: json!({"type": cmd.command_type, "params": cmd.params}),
                }),
                Reply::Value(result) => Some(RemoteReply::Success { id: cmd.id, result }),
                Reply::Error(error) => Some(RemoteReply::Error { id: cmd.id, error }),
            };
            if let Some(out) = out {
                let Ok(payload) = out.encode() else { return };
                if transport.send(Bytes::from(payload)).await.is_err() {
                    return;
                }
            }
            break;
        }
    }
}
