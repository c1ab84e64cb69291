//! Presence command server
//!
//! Accepts connections on a Unix socket and speaks the presence subset of
//! the ActionCable protocol, one JSON message per line in each direction.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::actioncable::{self, ClientCommand, PresenceData, ServerMessage};
use crate::hub::Hub;
use crate::presence::{Member, PresenceInfo, PresenceRegistry};
use crate::session::{Session, SessionHooks, SessionPresence};
use crate::streams;

/// Outgoing message buffer per connection
const OUTGOING_CAPACITY: usize = 256;

/// Serves presence commands for many connections
pub struct Server {
    presence: Arc<SessionPresence>,
    hub: Arc<Hub>,
    hooks: Vec<Arc<dyn SessionHooks>>,
    next_conn_id: AtomicU64,
}

impl Server {
    /// Create a server; session presence is registered as the first session hook
    pub fn new(registry: PresenceRegistry, hub: Arc<Hub>) -> Self {
        let presence = Arc::new(SessionPresence::new(registry));
        let hooks: Vec<Arc<dyn SessionHooks>> = vec![presence.clone()];

        Self {
            presence,
            hub,
            hooks,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Register an additional session hook
    pub fn with_hook(mut self, hook: Arc<dyn SessionHooks>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve<F>(
        self: Arc<Self>,
        listener: UnixListener,
        shutdown: F,
    ) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            error!(error = %e, "Accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            warn!(error = %e, "Connection closed with error");
                        }
                    });
                }
            }
        }

        Ok(())
    }

    /// Run one connection until the peer closes it
    pub async fn handle_connection<S>(&self, stream: S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let mut session = Session::new(conn_id);
        let (reader, mut writer) = tokio::io::split(stream);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(OUTGOING_CAPACITY);

        let writer_handle = tokio::spawn(async move {
            while let Some(mut payload) = outgoing_rx.recv().await {
                payload.push(b'\n');
                if let Err(e) = writer.write_all(&payload).await {
                    debug!(conn_id, error = %e, "Write failed");
                    break;
                }
            }
        });

        debug!(conn_id, sid = %session.sid, "Connection opened");
        send(
            &outgoing_tx,
            &ServerMessage::Welcome {
                sid: session.sid.clone(),
            },
        )
        .await;
        for hook in &self.hooks {
            hook.on_open(&session);
        }

        let mut lines = BufReader::new(reader).lines();
        let result = loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(e) => break Err(anyhow::Error::from(e)),
            };
            if line.trim().is_empty() {
                continue;
            }

            match actioncable::parse_command(line.as_bytes()) {
                Ok(command) => {
                    debug!(conn_id, identifier = command.identifier(), "Command received");
                    self.handle_command(&mut session, &command, &outgoing_tx)
                        .await;
                    for hook in &self.hooks {
                        hook.after_command(&session, &command);
                    }
                }
                Err(e) => {
                    warn!(conn_id, error = %e, "Invalid command");
                    send(
                        &outgoing_tx,
                        &ServerMessage::Error {
                            reason: e.to_string(),
                        },
                    )
                    .await;
                }
            }
        };

        for hook in &self.hooks {
            hook.on_close(&session);
        }
        self.hub.remove_connection(conn_id);
        drop(outgoing_tx);
        let _ = writer_handle.await;

        debug!(conn_id, streams = self.hub.stream_count(), "Connection closed");
        result
    }

    async fn handle_command(
        &self,
        session: &mut Session,
        command: &ClientCommand,
        outgoing: &mpsc::Sender<Vec<u8>>,
    ) {
        let conn_id = session.conn_id;

        match command {
            ClientCommand::Subscribe { identifier } => {
                let stream = match streams::resolve(identifier) {
                    Ok(stream) => stream,
                    Err(e) => {
                        reject(outgoing, identifier, &e.to_string()).await;
                        return;
                    }
                };

                self.hub.subscribe(conn_id, &stream, outgoing.clone());
                session.subscribe(identifier.clone(), stream);
                send(
                    outgoing,
                    &ServerMessage::ConfirmSubscription {
                        identifier: identifier.clone(),
                    },
                )
                .await;
            }
            ClientCommand::Unsubscribe { identifier } => {
                let Some(stream) = session.unsubscribe(identifier) else {
                    debug!(conn_id, identifier, "Unsubscribe for unknown subscription");
                    return;
                };
                if session.is_subscribed_to_stream(&stream) {
                    return;
                }

                self.hub.unsubscribe(conn_id, &stream);
                if let Some(id) = session.take_presence(&stream)
                    && let Err(e) = self.presence.leave(conn_id, &stream, &id, None)
                {
                    debug!(
                        conn_id,
                        stream,
                        error = %e,
                        "Presence leave on unsubscribe skipped"
                    );
                }
            }
            ClientCommand::Join {
                identifier,
                presence,
            } => {
                let Some(stream) = session.stream_for(identifier).map(str::to_string) else {
                    warn!(conn_id, identifier, "Join for unknown subscription");
                    reject(outgoing, identifier, "not subscribed").await;
                    return;
                };

                // Fall back to the session ID when no presence ID is given
                let (id, info) = match presence {
                    Some(PresenceData { id, info }) => (
                        id.clone()
                            .filter(|id| !id.is_empty())
                            .unwrap_or_else(|| session.sid.clone()),
                        info.clone().unwrap_or(serde_json::Value::Null),
                    ),
                    None => (session.sid.clone(), serde_json::Value::Null),
                };

                match self.presence.join(conn_id, &stream, &id, info) {
                    Ok(outcome) => {
                        if let Some(previous) = session.set_presence(&stream, &id) {
                            let _ = self.presence.leave(
                                conn_id,
                                &stream,
                                &previous,
                                Some(Duration::ZERO),
                            );
                        }
                        send_info(outgoing, identifier, &outcome.members).await;
                    }
                    Err(e) => {
                        reject(outgoing, identifier, &e.to_string()).await;
                    }
                }
            }
            ClientCommand::Leave { identifier } => {
                let Some(stream) = session.stream_for(identifier).map(str::to_string) else {
                    warn!(conn_id, identifier, "Leave for unknown subscription");
                    return;
                };

                if let Some(id) = session.take_presence(&stream)
                    && let Err(e) = self
                        .presence
                        .leave(conn_id, &stream, &id, Some(Duration::ZERO))
                {
                    reject(outgoing, identifier, &e.to_string()).await;
                }
            }
            ClientCommand::Presence { identifier } => {
                let Some(stream) = session.stream_for(identifier).map(str::to_string) else {
                    warn!(conn_id, identifier, "Presence query for unknown subscription");
                    reject(outgoing, identifier, "not subscribed").await;
                    return;
                };

                let registry = self.presence.registry();
                if !registry.is_enabled() {
                    reject(outgoing, identifier, "presence is disabled").await;
                    return;
                }

                let members = registry.members_of(&stream);
                send_info(outgoing, identifier, &members).await;
            }
        }
    }
}

async fn send(outgoing: &mpsc::Sender<Vec<u8>>, msg: &ServerMessage) {
    match actioncable::encode(msg) {
        Ok(payload) => {
            if outgoing.send(payload).await.is_err() {
                debug!("Connection writer gone");
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode message"),
    }
}

async fn reject(outgoing: &mpsc::Sender<Vec<u8>>, identifier: &str, reason: &str) {
    send(
        outgoing,
        &ServerMessage::RejectSubscription {
            identifier: identifier.to_string(),
            reason: reason.to_string(),
        },
    )
    .await;
}

async fn send_info(outgoing: &mpsc::Sender<Vec<u8>>, identifier: &str, members: &[Member]) {
    let info = PresenceInfo::from_members(members);
    send(
        outgoing,
        &ServerMessage::Presence {
            identifier: identifier.to_string(),
            message: json!(info),
        },
    )
    .await;
}
