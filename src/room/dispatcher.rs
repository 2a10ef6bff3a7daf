//! Per-connection behavior of the three room channels.
//!
//! The channel is fixed at connect time from the room identity:
//! - `sharing`: owner only, one collaborator roster snapshot, then pushed events
//! - `permissions`: one capability snapshot from the injected context, then pushed events
//! - `sync`: full document on join, incremental change frames in both directions

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{Channel, Connection, ConnectionMultiplexer, Outbound};
use crate::auth::{AuthContext, PermissionResolver, Role};
use crate::sync::protocol::{close_codes, close_socket, to_message, PermissionPayload, ServerMessage, SharingSnapshot};
use crate::sync::{SyncError, SyncRoom, SyncServer};

/// Error code sent once to a read-only sync connection that writes
pub const READ_ONLY_ERROR: &str = "read_only";
/// Error code sent when a change frame cannot be merged
pub const INVALID_UPDATE_ERROR: &str = "invalid_update";

#[derive(Clone)]
pub struct Dispatcher {
    multiplexer: Arc<ConnectionMultiplexer>,
    sync: Arc<SyncServer>,
    resolver: PermissionResolver,
}

impl Dispatcher {
    pub fn new(multiplexer: Arc<ConnectionMultiplexer>, sync: Arc<SyncServer>, resolver: PermissionResolver) -> Self {
        Self {
            multiplexer,
            sync,
            resolver,
        }
    }

    /// Drive an accepted socket until either side goes away
    pub async fn serve(self, socket: WebSocket, ctx: AuthContext) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Connection::from_context(&ctx, tx));
        let document_id = ctx.document_id;

        let room = match ctx.channel {
            Channel::Sharing => {
                if ctx.grant.role != Role::Owner {
                    info!(user_id = %ctx.user_id, %document_id, "Sharing channel refused for non-owner");
                    close_socket(socket, close_codes::OWNER_ONLY, "sharing channel is owner only".into()).await;
                    return;
                }
                let collaborators = match self.resolver.collaborators(document_id).await {
                    Ok(collaborators) => collaborators,
                    Err(e) => {
                        error!(%document_id, error = %e, "Failed to load collaborators");
                        close_socket(socket, close_codes::INTERNAL, "failed to load collaborators".into()).await;
                        return;
                    }
                };
                let snapshot = ServerMessage::SharingSnapshot(SharingSnapshot {
                    document_id,
                    collaborators,
                });
                if !self.send_message(&connection, &snapshot) {
                    close_socket(socket, close_codes::INTERNAL, "failed to encode snapshot".into()).await;
                    return;
                }
                self.multiplexer.register(connection.clone());
                None
            }
            Channel::Permissions => {
                let snapshot = ServerMessage::PermissionsSnapshot(PermissionPayload::from(&ctx));
                if !self.send_message(&connection, &snapshot) {
                    close_socket(socket, close_codes::INTERNAL, "failed to encode snapshot".into()).await;
                    return;
                }
                self.multiplexer.register(connection.clone());
                None
            }
            Channel::Sync => {
                let room = match self.sync.open(document_id).await {
                    Ok(room) => room,
                    Err(e) => {
                        error!(%document_id, error = %e, "Failed to open document");
                        close_socket(socket, close_codes::INTERNAL, "failed to open document".into()).await;
                        return;
                    }
                };
                // Registration happens under the document lock so no change
                // can land between the snapshot and the first relayed frame.
                room.with_snapshot(|bytes| {
                    connection.send(Outbound::Binary(Bytes::from(bytes)));
                    self.multiplexer.register(connection.clone());
                });
                Some(room)
            }
        };

        info!(
            user_id = %ctx.user_id,
            room = %connection.room_key(),
            role = ctx.grant.role.as_str(),
            read_only = !ctx.grant.can_edit,
            "Connection opened"
        );

        self.pump(socket, connection.clone(), rx, room.clone(), ctx.grant.can_edit)
            .await;

        self.multiplexer.unregister(&connection.room_key(), connection.id);
        if let Some(room) = room {
            self.sync.release(room);
        }
        info!(user_id = %ctx.user_id, room = %connection.room_key(), "Connection closed");
    }

    fn send_message(&self, connection: &Connection, message: &ServerMessage) -> bool {
        match message.to_frame() {
            Ok(frame) => connection.send(frame),
            Err(e) => {
                error!(error = %e, "Failed to encode message");
                false
            }
        }
    }

    async fn pump(
        &self,
        socket: WebSocket,
        connection: Arc<Connection>,
        mut rx: mpsc::UnboundedReceiver<Outbound>,
        room: Option<Arc<SyncRoom>>,
        can_edit: bool,
    ) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let connection_id = connection.id;

        // Task to forward queued frames to the socket
        let mut send_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let closing = matches!(frame, Outbound::Close { .. });
                if ws_sender.send(to_message(frame)).await.is_err() || closing {
                    break;
                }
            }
            debug!("Send task ended for connection {}", connection_id);
        });

        // Task to handle incoming frames
        let this = self.clone();
        let mut recv_task = tokio::spawn(async move {
            let mut warned = false;
            while let Some(Ok(msg)) = ws_receiver.next().await {
                match msg {
                    Message::Binary(data) => match &room {
                        Some(room) => this.handle_sync_frame(room, &connection, can_edit, data, &mut warned),
                        None => debug!("Ignoring binary frame on {}", connection.room_key()),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            debug!("Receive task ended for connection {}", connection_id);
        });

        tokio::select! {
            _ = &mut send_task => {
                recv_task.abort();
                let _ = recv_task.await;
            }
            _ = &mut recv_task => {
                send_task.abort();
                let _ = send_task.await;
            }
        }
    }

    /// Merge and relay one change frame
    pub fn handle_sync_frame(
        &self,
        room: &SyncRoom,
        connection: &Connection,
        can_edit: bool,
        data: Vec<u8>,
        warned: &mut bool,
    ) {
        match room.apply_from(can_edit, &data) {
            Ok(_) => {
                let relayed = self.multiplexer.broadcast(
                    &connection.room_key(),
                    &Outbound::Binary(Bytes::from(data)),
                    Some(connection.id),
                );
                debug!(relayed, "Relayed sync frame for {}", room.document_id());
            }
            Err(SyncError::ReadOnly) => {
                if !*warned {
                    *warned = true;
                    self.send_message(
                        connection,
                        &ServerMessage::error(READ_ONLY_ERROR, "this connection cannot edit the document"),
                    );
                }
            }
            Err(e) => {
                warn!(document_id = %room.document_id(), error = %e, "Rejected sync frame");
                self.send_message(connection, &ServerMessage::error(INVALID_UPDATE_ERROR, e.to_string()));
            }
        }
    }
}
