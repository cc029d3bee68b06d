//! Per-connection protocol handling, independent of the transport
//!
//! The transport feeds [`Inbound`] messages in and drains [`Outbound`]
//! messages out. [`Connection::accept`] runs the handshake; a failed
//! handshake sends nothing, and the transport should just close.
//!
//! The outbound channel is bounded by [`crate::SessionConfig::outbound_capacity`].
//! A client that stops draining it is closed with a transport error.

use std::fmt;
use std::sync::Arc;

use folio_core::{DocumentId, Role, SessionKey, UserId};
use folio_sync::{Frame, SyncMessage};
use serde::Deserialize;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::{SessionError, SessionResult};
use crate::manager::SessionManager;
use crate::session::{ConnId, DocumentEvent, Outbound, Session, UpdateOrigin};

/// Query parameters of a connection request
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub document_id: DocumentId,
    /// Clock the client last synced against
    pub clock: u64,
    #[serde(default)]
    pub is_app: bool,
    #[serde(default)]
    pub viewer_id: Option<UserId>,
}

/// Message from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Encoded [`Frame`]
    Frame(Vec<u8>),
    Pong,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    ClientClosed,
    KeepaliveTimeout,
    RoleRevoked,
    StaleClock,
    Removed,
    Protocol,
    Transport,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CloseReason::ClientClosed => "client closed",
            CloseReason::KeepaliveTimeout => "missed pong",
            CloseReason::RoleRevoked => "access revoked",
            CloseReason::StaleClock => "session clock changed",
            CloseReason::Removed => "removed by session",
            CloseReason::Protocol => "protocol error",
            CloseReason::Transport => "transport gone or backed up",
        };
        f.write_str(reason)
    }
}

/// One accepted client connection
pub struct Connection {
    manager: Arc<SessionManager>,
    session: Arc<Session>,
    conn_id: ConnId,
    user: UserId,
    role: Role,
    outbound: mpsc::Sender<Outbound>,
    overflow: Arc<Notify>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", self.session.key())
            .field("conn_id", &self.conn_id)
            .field("user", &self.user)
            .field("role", &self.role)
            .finish()
    }
}

impl Connection {
    /// Authorize `user`, attach to the session and send the greeting
    ///
    /// The greeting is a sync step 1 followed by the known presence states.
    #[instrument(skip_all, fields(document_id = %params.document_id, user = %user))]
    pub async fn accept(
        manager: &Arc<SessionManager>,
        user: UserId,
        params: ConnectParams,
        outbound: mpsc::Sender<Outbound>,
    ) -> SessionResult<Self> {
        let ctx = manager.context();
        let document_id = &params.document_id;

        let Some(role) = ctx.roles.role(&user, document_id).await? else {
            return Err(SessionError::unauthorized(format!("{user} has no access to {document_id}")));
        };
        if ctx.store.get_document(document_id).await?.is_none() {
            return Err(SessionError::not_found(format!("document {document_id}")));
        }
        if let Some(viewer) = &params.viewer_id {
            if *viewer != user {
                return Err(SessionError::unauthorized("viewer id does not match the user"));
            }
        }

        let key = if params.is_app {
            let Some(app) = ctx.store.latest_app(document_id).await? else {
                return Err(SessionError::not_found(format!("published app of {document_id}")));
            };
            SessionKey::app(document_id.clone(), app.id, params.viewer_id.clone())
        } else {
            SessionKey::document(document_id.clone())
        };

        let pinned = manager.pin(&key).await?;
        let session = pinned.session().clone();
        let clock = session.clock();
        if params.clock != clock {
            let durable = session.persistor().current_clock().await?.unwrap_or(0);
            if durable == params.clock {
                session.fast_forward(durable);
            } else {
                warn!(key = %key, client = params.clock, server = clock, durable, "Client clock is stale");
                ctx.emit(DocumentEvent::ResyncRequired {
                    key,
                    user,
                });
                return Err(SessionError::ClockMismatch {
                    client: params.clock,
                    server: clock,
                });
            }
        }

        let (conn_id, overflow) = session.add_connection(outbound.clone(), params.clock);
        drop(pinned);

        let connection = Self {
            manager: manager.clone(),
            session,
            conn_id,
            user,
            role,
            outbound,
            overflow,
        };
        if let Err(e) = connection.greet().await {
            connection.session.remove_connection(conn_id).await;
            return Err(e);
        }
        info!(key = %key, conn_id, role = %role, "Connection accepted");
        Ok(connection)
    }

    async fn greet(&self) -> SessionResult<()> {
        self.send(Outbound::Frame(self.session.sync_step1().await?))?;
        if let Some(frame) = self.session.awareness_frame().await? {
            self.send(Outbound::Frame(frame))?;
        }
        Ok(())
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn send(&self, message: Outbound) -> SessionResult<()> {
        self.outbound
            .try_send(message)
            .map_err(|_| SessionError::closed("connection transport"))
    }

    /// Serve the connection until it closes
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        let config = self.manager.config().clone();
        let mut keepalive = interval_at(
            Instant::now() + config.keepalive_interval,
            config.keepalive_interval,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut role_refresh = interval_at(
            Instant::now() + config.role_refresh_interval,
            config.role_refresh_interval,
        );
        role_refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_received = true;
        let overflow = self.overflow.clone();

        let reason = loop {
            tokio::select! {
                _ = overflow.notified() => break CloseReason::Transport,
                message = inbound.recv() => match message {
                    Some(Inbound::Frame(bytes)) => {
                        if let Err(reason) = self.handle_frame(&bytes).await {
                            break reason;
                        }
                    }
                    Some(Inbound::Pong) => pong_received = true,
                    Some(Inbound::Closed) | None => break CloseReason::ClientClosed,
                },
                _ = keepalive.tick() => {
                    if !pong_received {
                        break CloseReason::KeepaliveTimeout;
                    }
                    pong_received = false;
                    if self.send(Outbound::Ping).is_err() {
                        break CloseReason::Transport;
                    }
                }
                _ = role_refresh.tick() => {
                    if !self.refresh_role().await {
                        break CloseReason::RoleRevoked;
                    }
                }
            }
        };

        debug!(key = %self.session.key(), conn_id = self.conn_id, reason = %reason, "Closing connection");
        self.session.remove_connection(self.conn_id).await;
    }

    /// Returns false once the user lost access
    async fn refresh_role(&mut self) -> bool {
        let ctx = self.manager.context();
        match ctx.roles.role(&self.user, self.session.key().document_id()).await {
            Ok(Some(role)) => {
                if role != self.role {
                    debug!(conn_id = self.conn_id, from = %self.role, to = %role, "Role changed");
                    self.role = role;
                }
                true
            }
            Ok(None) => {
                info!(key = %self.session.key(), user = %self.user, "User lost access");
                false
            }
            Err(e) => {
                warn!(user = %self.user, error = %e, "Failed to refresh role, keeping the previous one");
                true
            }
        }
    }

    async fn handle_frame(&self, bytes: &[u8]) -> Result<(), CloseReason> {
        match self.session.connection_clock(self.conn_id) {
            None => return Err(CloseReason::Removed),
            Some(clock) if clock != self.session.clock() => return Err(CloseReason::StaleClock),
            Some(_) => {}
        }

        let frame = Frame::decode(bytes).map_err(|e| {
            warn!(conn_id = self.conn_id, error = %e, "Malformed frame");
            CloseReason::Protocol
        })?;

        match frame {
            Frame::Sync(SyncMessage::Step1 { heads }) => {
                let reply = self.session.sync_step2(&heads).await.map_err(|e| {
                    error!(conn_id = self.conn_id, error = %e, "Failed to answer sync step 1");
                    CloseReason::Protocol
                })?;
                self.send(Outbound::Frame(reply))
                    .map_err(|_| CloseReason::Transport)?;
            }
            Frame::Sync(SyncMessage::Step2 { update } | SyncMessage::Update { update }) => {
                self.handle_update(&update).await?;
            }
            Frame::Awareness(update) => {
                self.session
                    .apply_awareness(self.conn_id, &update)
                    .await
                    .map_err(|e| {
                        warn!(conn_id = self.conn_id, error = %e, "Malformed awareness update");
                        CloseReason::Protocol
                    })?;
            }
        }
        Ok(())
    }

    async fn handle_update(&self, update: &[u8]) -> Result<(), CloseReason> {
        if update.is_empty() {
            return Ok(());
        }
        if !self.session.can_write(self.role, update).await {
            warn!(
                key = %self.session.key(),
                conn_id = self.conn_id,
                user = %self.user,
                role = %self.role,
                "Dropping unauthorized update"
            );
            return Ok(());
        }

        match self
            .session
            .apply_update(update, UpdateOrigin::Connection(self.conn_id))
            .await
        {
            Ok(changed) => {
                trace!(conn_id = self.conn_id, changed, bytes = update.len(), "Update applied");
                Ok(())
            }
            Err(SessionError::Sync(e)) => {
                warn!(conn_id = self.conn_id, error = %e, "Malformed update");
                Err(CloseReason::Protocol)
            }
            Err(e) => {
                error!(key = %self.session.key(), conn_id = self.conn_id, error = %e, "Update applied but not persisted");
                Ok(())
            }
        }
    }
}
