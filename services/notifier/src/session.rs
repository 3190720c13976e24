//! One STOMP-over-WebSocket session against the realtime endpoint.
//!
//! # Protocol
//! 1. WebSocket upgrade against `<base>/ws/websocket` (optional bearer token)
//! 2. Send `CONNECT`; expect `CONNECTED` as the first frame
//! 3. Send `SUBSCRIBE` for the identity-scoped queue, id `sub-<identity>`
//! 4. Optionally publish a diagnostic frame to `/app/test`
//! 5. Forward each `MESSAGE` body, decoded, to the registered sink
//! 6. On teardown: `UNSUBSCRIBE` every tracked id, `DISCONNECT`, close

use std::time::Duration;

use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use hs_protocol::stomp::{self, Command, Frame, FrameError};
use hs_protocol::{ConnectionTest, NotificationRecord, decode_notification};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::transport::Identity;

pub type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsError = tokio_tungstenite::tungstenite::Error;

pub const CONNECTION_TEST_DESTINATION: &str = "/app/test";
pub const TEST_NOTIFICATION_DESTINATION: &str = "/app/notify";
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("WS: {0}")]
    Ws(#[from] WsError),
    #[error("STOMP: {0}")]
    Frame(#[from] FrameError),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid request: {0}")]
    Request(String),
    #[error("broker error: {0}")]
    Broker(String),
    #[error("unexpected {0} frame")]
    UnexpectedFrame(Command),
    #[error("connection closed")]
    ConnectionClosed,
}

/// Everything needed to open one session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub url: String,
    pub token: Option<String>,
    pub destination: String,
    pub identity: Identity,
    pub send_connection_test: bool,
}

/// Outbound work handed to a running session.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    Publish { destination: String, body: String },
}

/// How a session loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Local shutdown; subscriptions were torn down.
    Shutdown,
    /// The broker closed the connection.
    Closed,
}

pub struct Session<S> {
    pub ws: S,
    pub subscription_ids: Vec<String>,
}

pub fn subscription_id(identity: Identity) -> String {
    format!("sub-{identity}")
}

/// Expand `{identity}` in a destination template.
pub fn resolve_destination(template: &str, identity: Identity) -> String {
    template.replace("{identity}", &identity.to_string())
}

pub fn build_ws_request(url: &str, token: Option<&str>) -> Result<Request, SessionError> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .map_err(|e| SessionError::Request(format!("invalid URL '{}': {}", url, e)))?;

    if let Some(token) = token {
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", token).parse().map_err(
                |e: tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue| {
                    SessionError::Request(format!("invalid auth header: {}", e))
                },
            )?,
        );
    }

    Ok(request)
}

/// Open the socket and run the STOMP handshake.
pub async fn connect(params: &SessionParams) -> Result<Session<WsStream>, SessionError> {
    let request = build_ws_request(&params.url, params.token.as_deref())?;
    let host = request.uri().host().unwrap_or("localhost").to_owned();
    info!(url = %params.url, identity = %params.identity, "connecting");
    let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
    handshake(ws, &host, params).await
}

/// STOMP handshake over an already-upgraded socket.
pub async fn handshake<S>(
    mut ws: S,
    host: &str,
    params: &SessionParams,
) -> Result<Session<S>, SessionError>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    send_frame(&mut ws, &Frame::connect(host)).await?;
    let first = next_frame(&mut ws).await?;
    match first.command {
        Command::Connected => {
            debug!(version = ?first.header("version"), "STOMP connected");
        }
        Command::Error => {
            return Err(SessionError::Broker(
                first.header("message").unwrap_or("unspecified").to_owned(),
            ));
        }
        other => return Err(SessionError::UnexpectedFrame(other)),
    }

    let sub_id = subscription_id(params.identity);
    send_frame(&mut ws, &Frame::subscribe(&sub_id, &params.destination)).await?;
    info!(id = %sub_id, destination = %params.destination, "subscribed");

    if params.send_connection_test {
        let test = ConnectionTest {
            user_id: params.identity.get(),
            message: "Connection test".to_owned(),
            timestamp: Utc::now().to_rfc3339(),
        };
        let body = serde_json::to_string(&test)?;
        send_frame(&mut ws, &Frame::send(CONNECTION_TEST_DESTINATION, body)).await?;
    }

    Ok(Session {
        ws,
        subscription_ids: vec![sub_id],
    })
}

/// Pump inbound frames into `sink` until shutdown, close or error.
///
/// On shutdown the subscriptions are torn down before returning, including
/// while waiting for room in a full `sink`.
pub async fn run_session_loop<S>(
    ws: &mut S,
    subscription_ids: &[String],
    sink: &mpsc::Sender<NotificationRecord>,
    commands: &mut mpsc::Receiver<SessionCommand>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SessionEnd, SessionError>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    if *shutdown.borrow() {
        teardown(ws, subscription_ids).await?;
        return Ok(SessionEnd::Shutdown);
    }

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    teardown(ws, subscription_ids).await?;
                    return Ok(SessionEnd::Shutdown);
                }
            }
            Some(cmd) = commands.recv() => {
                let SessionCommand::Publish { destination, body } = cmd;
                send_frame(ws, &Frame::send(&destination, body)).await?;
                debug!(%destination, "published");
            }
            msg = ws.next() => {
                let text = match msg {
                    None => return Ok(SessionEnd::Closed),
                    Some(Err(e)) => return Err(SessionError::Ws(e)),
                    Some(Ok(Message::Text(t))) => t.as_str().to_owned(),
                    Some(Ok(Message::Binary(b))) => match String::from_utf8(b.to_vec()) {
                        Ok(t) => t,
                        Err(_) => {
                            warn!("dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) => return Ok(SessionEnd::Closed),
                    Some(Ok(Message::Ping(d))) => {
                        let _ = ws.send(Message::Pong(d)).await;
                        continue;
                    }
                    Some(Ok(_)) => continue,
                };

                let frame = match stomp::decode(&text) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(error = %e, "dropping malformed STOMP frame");
                        continue;
                    }
                };

                match frame.command {
                    Command::Message => {
                        let sub = frame.header("subscription").unwrap_or_default();
                        if !subscription_ids.iter().any(|id| id == sub) {
                            debug!(subscription = sub, "ignoring message for untracked subscription");
                            continue;
                        }
                        match decode_notification(&frame.body) {
                            Ok(record) => {
                                debug!(id = %record.id, "notification received");
                                // A full sink must not keep shutdown from being seen.
                                let permit = loop {
                                    tokio::select! {
                                        biased;
                                        changed = shutdown.changed() => {
                                            if changed.is_err() || *shutdown.borrow() {
                                                debug!(id = %record.id, "shutdown while sink full, dropping");
                                                teardown(ws, subscription_ids).await?;
                                                return Ok(SessionEnd::Shutdown);
                                            }
                                        }
                                        permit = sink.reserve() => break permit,
                                    }
                                };
                                match permit {
                                    Ok(permit) => permit.send(record),
                                    Err(_) => {
                                        info!("notification sink closed, ending session");
                                        teardown(ws, subscription_ids).await?;
                                        return Ok(SessionEnd::Shutdown);
                                    }
                                }
                            }
                            Err(e) => warn!(error = %e, "dropping undecodable notification"),
                        }
                    }
                    Command::Error => {
                        let message = frame.header("message").unwrap_or("unspecified").to_owned();
                        warn!(%message, "broker sent ERROR");
                        return Err(SessionError::Broker(message));
                    }
                    other => debug!(command = %other, "ignoring frame"),
                }
            }
        }
    }
}

/// Unsubscribe every tracked id, disconnect with a receipt, and close.
pub async fn teardown<S>(ws: &mut S, subscription_ids: &[String]) -> Result<(), SessionError>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    for id in subscription_ids {
        send_frame(ws, &Frame::unsubscribe(id)).await?;
    }
    let receipt = format!("disconnect-{}", uuid::Uuid::new_v4());
    send_frame(ws, &Frame::disconnect(&receipt)).await?;

    let wait_receipt = async {
        loop {
            match next_frame(ws).await {
                Ok(frame)
                    if frame.command == Command::Receipt
                        && frame.header("receipt-id") == Some(receipt.as_str()) =>
                {
                    return;
                }
                Ok(_) => continue,
                Err(_) => return,
            }
        }
    };
    if tokio::time::timeout(RECEIPT_TIMEOUT, wait_receipt).await.is_err() {
        debug!("no DISCONNECT receipt before timeout");
    }

    let _ = ws.send(Message::Close(None)).await;
    info!(count = subscription_ids.len(), "session torn down");
    Ok(())
}

async fn send_frame<S>(ws: &mut S, frame: &Frame) -> Result<(), SessionError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    ws.send(Message::Text(frame.encode().into())).await?;
    Ok(())
}

/// Next non-heartbeat frame. Pings are answered along the way.
async fn next_frame<S>(ws: &mut S) -> Result<Frame, SessionError>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    loop {
        match ws.next().await {
            None | Some(Ok(Message::Close(_))) => return Err(SessionError::ConnectionClosed),
            Some(Err(e)) => return Err(SessionError::Ws(e)),
            Some(Ok(Message::Text(t))) => {
                if let Some(frame) = stomp::decode(&t)? {
                    return Ok(frame);
                }
            }
            Some(Ok(Message::Ping(d))) => {
                let _ = ws.send(Message::Pong(d)).await;
            }
            Some(Ok(_)) => {}
        }
    }
}
