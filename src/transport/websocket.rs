//! WebSocket transport
//!
//! This file implements the WebSocket server in front of the relay:
//! - Accept TCP/WebSocket connections, reading `offset` and `session_id`
//!   from the request query during the upgrade
//! - Run `Relay::connect` so the session is resumed or replayed before any
//!   live traffic, then announce the session id to the client
//! - Forward `submit` frames to the relay and acknowledge them once the
//!   message is in the log (new or duplicate alike)
//! - Detach the session from the relay when the connection ends
//!
//! A submission the store could not take is not acknowledged. The client is
//! expected to resend it with the same token.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::Event;
use crate::broker::registry::EventSender;
use crate::broker::Relay;
use crate::session::Handshake;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::TransportError;

pub async fn start_websocket_server(addr: String, relay: Arc<Relay>) -> Result<(), TransportError> {
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| TransportError::Bind {
            addr: addr.clone(),
            source,
        })?;

    info!("WebSocket server listening on ws://{addr}");
    serve(listener, relay).await;
    Ok(())
}

/// Accept connections on `listener` until the task is cancelled.
pub async fn serve(listener: TcpListener, relay: Arc<Relay>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {e}");
                continue;
            }
        };

        let relay = relay.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, relay).await {
                debug!("Connection from {peer} ended: {e}");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, relay: Arc<Relay>) -> Result<(), TransportError> {
    let mut query = None;
    let ws_stream = accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            query = req.uri().query().map(str::to_owned);
            Ok(resp)
        },
    )
    .await?;
    let handshake = Handshake::from_query(query.as_deref());

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

    let session = relay.connect(&handshake, tx.clone()).await;
    let session_id = session.id.clone();

    let greeting = ServerMessage::Session {
        session_id: session.id.clone(),
        recovered: session.recovered,
    };
    if let Err(e) = ws_sender.send(greeting.to_ws()?).await {
        relay.disconnect(&session_id);
        return Err(e.into());
    }

    let send_loop = {
        let session_id = session_id.clone();
        spawn(async move {
            while let Some(event) = rx.recv().await {
                let frame = match ServerMessage::from(event).to_ws() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Failed to serialize event for {session_id}: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(frame).await {
                    debug!("Failed to send message to {session_id}: {e}");
                    break;
                }
            }
            debug!("Send loop closed for {session_id}");
        })
    };

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                handle_client_message(&relay, &tx, &session_id, text.as_str()).await;
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Read error from {session_id}: {e}");
                break;
            }
        }
    }

    info!("{session_id} disconnected");
    relay.disconnect(&session_id);
    send_loop.abort();
    Ok(())
}

/// Handle one text frame from a session.
///
/// Acks and rejections are queued on `tx`, behind any broadcast the frame
/// itself caused.
pub async fn handle_client_message(relay: &Relay, tx: &EventSender, session_id: &str, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Submit {
            content,
            client_token,
            sender_name,
        }) => {
            if content.is_empty() {
                warn!("{session_id} submitted an empty message");
                let _ = tx.send(Event::Rejected {
                    reason: "content must not be empty".to_string(),
                    client_token: Some(client_token),
                });
                return;
            }

            // StoreUnavailable is logged by the relay; no ack means the client retries
            if relay
                .submit(&sender_name, &content, &client_token)
                .await
                .is_ok()
            {
                let _ = tx.send(Event::Acknowledged { client_token });
            }
        }
        Err(err) => {
            warn!(
                "Invalid client message from {session_id}: {err} | {}",
                &text.chars().take(100).collect::<String>()
            );
            let _ = tx.send(Event::Rejected {
                reason: format!("invalid message: {err}"),
                client_token: None,
            });
        }
    }
}
