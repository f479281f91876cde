use std::collections::VecDeque;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{Duration, Instant, timeout_at};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use tungstenite::protocol::Message as WsMessage;
use url::Url;
use uuid::Uuid;

use crate::broker::message::{Delivery, MessageId};
use crate::session::{Handshake, SessionId};
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

pub struct RelayClient {
    stream: WsStream,
    session_id: SessionId,
    recovered: bool,
    last_seen_id: MessageId,
    pending: VecDeque<Delivery>,
    ack_timeout: Duration,
    max_attempts: u32,
}

impl RelayClient {
    /// Connect to `base_url` (e.g. `ws://127.0.0.1:3000`) and wait for the
    /// server to announce the session.
    pub async fn connect(base_url: &str, handshake: Handshake) -> Result<Self, TransportError> {
        let mut url = Url::parse(base_url)?;
        url.set_query(Some(&handshake.to_query()));

        let (mut stream, _response) = connect_async(url.as_str()).await?;

        match read_server_message(&mut stream).await? {
            ServerMessage::Session {
                session_id,
                recovered,
            } => Ok(Self {
                stream,
                session_id,
                recovered,
                last_seen_id: handshake.offset,
                pending: VecDeque::new(),
                ack_timeout: DEFAULT_ACK_TIMEOUT,
                max_attempts: DEFAULT_MAX_ATTEMPTS,
            }),
            other => Err(TransportError::Protocol(format!(
                "expected session frame, got {other:?}"
            ))),
        }
    }

    pub fn with_retry(mut self, ack_timeout: Duration, max_attempts: u32) -> Self {
        self.ack_timeout = ack_timeout;
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn recovered(&self) -> bool {
        self.recovered
    }

    /// The offset to hand the server on the next connect.
    pub fn last_seen_id(&self) -> MessageId {
        self.last_seen_id
    }

    /// Handshake that asks to resume this session, falling back to a replay
    /// from `last_seen_id` if the server no longer has it.
    pub fn resume_handshake(&self) -> Handshake {
        Handshake {
            session_id: Some(self.session_id.clone()),
            offset: self.last_seen_id,
        }
    }

    /// Submit a message under a fresh token. Returns the token once the
    /// server has acknowledged it.
    pub async fn submit(
        &mut self,
        sender_name: &str,
        content: &str,
    ) -> Result<String, TransportError> {
        let token = Uuid::new_v4().to_string();
        self.submit_with_token(sender_name, content, &token).await?;
        Ok(token)
    }

    /// Send the submission and resend it, unchanged, until an ack for
    /// `client_token` arrives or the attempts run out.
    pub async fn submit_with_token(
        &mut self,
        sender_name: &str,
        content: &str,
        client_token: &str,
    ) -> Result<(), TransportError> {
        if content.is_empty() {
            return Err(TransportError::Protocol(
                "content must not be empty".to_string(),
            ));
        }

        let frame = serde_json::to_string(&ClientMessage::Submit {
            content: content.to_string(),
            client_token: client_token.to_string(),
            sender_name: sender_name.to_string(),
        })?;

        for attempt in 1..=self.max_attempts {
            self.stream.send(WsMessage::text(frame.clone())).await?;
            if self.await_ack(client_token).await? {
                return Ok(());
            }
            debug!(attempt, client_token, "no ack yet, resending");
        }

        Err(TransportError::Protocol(format!(
            "no ack for {client_token} after {} attempts",
            self.max_attempts
        )))
    }

    /// Wait up to `ack_timeout` for the ack, queueing deliveries seen on the
    /// way. Ok(false) means the wait timed out. Only an error frame naming
    /// `client_token` fails the wait.
    async fn await_ack(&mut self, client_token: &str) -> Result<bool, TransportError> {
        let deadline = Instant::now() + self.ack_timeout;
        loop {
            let Ok(msg) = timeout_at(deadline, read_server_message(&mut self.stream)).await else {
                return Ok(false);
            };

            match msg? {
                ServerMessage::Ack { client_token: acked } if acked == client_token => {
                    return Ok(true);
                }
                ServerMessage::Message {
                    content,
                    id,
                    sender_name,
                } => self.pending.push_back(Delivery {
                    content,
                    id,
                    sender_name,
                }),
                ServerMessage::Error {
                    message,
                    client_token: Some(refused),
                } if refused == client_token => {
                    return Err(TransportError::Protocol(message));
                }
                ServerMessage::Error { message, .. } => {
                    debug!(client_token, "ignoring unrelated error frame: {message}");
                }
                // acks for earlier submissions, stray session frames
                _ => {}
            }
        }
    }

    /// Next delivered message, replayed or live.
    pub async fn next_delivery(&mut self) -> Result<Delivery, TransportError> {
        let delivery = match self.pending.pop_front() {
            Some(delivery) => delivery,
            None => loop {
                if let ServerMessage::Message {
                    content,
                    id,
                    sender_name,
                } = read_server_message(&mut self.stream).await?
                {
                    break Delivery {
                        content,
                        id,
                        sender_name,
                    };
                }
            },
        };

        self.last_seen_id = self.last_seen_id.max(delivery.id);
        Ok(delivery)
    }

    /// Like `next_delivery`, but gives up after `wait`.
    pub async fn next_delivery_within(
        &mut self,
        wait: Duration,
    ) -> Result<Option<Delivery>, TransportError> {
        match tokio::time::timeout(wait, self.next_delivery()).await {
            Ok(delivery) => delivery.map(Some),
            Err(_) => Ok(None),
        }
    }

    pub async fn close(mut self) -> Result<(), TransportError> {
        self.stream.close(None).await?;
        Ok(())
    }
}

async fn read_server_message(stream: &mut WsStream) -> Result<ServerMessage, TransportError> {
    loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => return Ok(serde_json::from_str(text.as_str())?),
            Some(Ok(WsMessage::Close(_))) | None => return Err(TransportError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}
