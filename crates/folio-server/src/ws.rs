//! Bridge between an axum websocket and a session [`Connection`]

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use folio_core::UserId;
use folio_session::{
    ConnectParams, Connection, Inbound, Outbound, SessionError, SessionManager,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Websocket close code for a failed handshake
pub fn close_code(error: &SessionError) -> u16 {
    match error {
        SessionError::Unauthorized(_) => 4403,
        SessionError::NotFound(_) => 4404,
        // The client must refetch the document before reconnecting
        SessionError::ClockMismatch { .. } => 4409,
        SessionError::ShuttingDown => 1012,
        _ => 1011,
    }
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// Serve one client until either side closes
pub async fn serve_socket(
    mut socket: WebSocket,
    manager: Arc<SessionManager>,
    user: UserId,
    params: ConnectParams,
) {
    let (out_tx, mut out_rx) = mpsc::channel(manager.config().outbound_capacity.max(1));
    let connection = match Connection::accept(&manager, user.clone(), params, out_tx).await {
        Ok(connection) => connection,
        Err(e) => {
            info!(user = %user, error = %e, "Handshake refused");
            let _ = socket.send(close_message(close_code(&e), &e.to_string())).await;
            return;
        }
    };
    let conn_id = connection.conn_id();

    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let mut task = tokio::spawn(connection.run(in_rx));
    let mut finished = false;

    loop {
        tokio::select! {
            // Covers a connection dropped for falling behind, whose queue is full
            result = &mut task => {
                finished = true;
                if let Err(e) = result {
                    warn!(conn_id, error = %e, "Connection task failed");
                }
                let _ = socket.send(close_message(1000, "closed")).await;
                break;
            }
            outbound = out_rx.recv() => {
                let message = match outbound {
                    Some(Outbound::Frame(frame)) => Message::Binary(Bytes::from(frame)),
                    Some(Outbound::Ping) => Message::Ping(Bytes::new()),
                    Some(Outbound::Close) | None => {
                        let _ = socket.send(close_message(1000, "closed")).await;
                        break;
                    }
                };
                if socket.send(message).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Binary(bytes))) => {
                    if in_tx.send(Inbound::Frame(bytes.to_vec())).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    let _ = in_tx.send(Inbound::Pong);
                }
                Some(Ok(Message::Text(_))) => {
                    warn!(conn_id, "Ignoring text message");
                }
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(conn_id, error = %e, "Websocket error");
                    break;
                }
            },
        }
    }

    if !finished {
        let _ = in_tx.send(Inbound::Closed);
        if let Err(e) = task.await {
            warn!(conn_id, error = %e, "Connection task failed");
        }
    }
    debug!(conn_id, user = %user, "Websocket closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes() {
        assert_eq!(close_code(&SessionError::unauthorized("no")), 4403);
        assert_eq!(close_code(&SessionError::not_found("doc")), 4404);
        assert_eq!(
            close_code(&SessionError::ClockMismatch {
                client: 3,
                server: 5
            }),
            4409
        );
        assert_eq!(close_code(&SessionError::ShuttingDown), 1012);
        assert_eq!(close_code(&SessionError::execution("boom")), 1011);
    }
}
