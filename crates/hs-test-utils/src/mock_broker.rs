// mock_broker: A mock STOMP-over-WebSocket broker for testing the realtime
// transport.
//
// Accepts connections on ws://127.0.0.1:<port>, answers CONNECT with
// CONNECTED, tracks SUBSCRIBE/UNSUBSCRIBE per connection, records SEND
// frames, and lets the test push MESSAGE frames to every live subscription.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hs_protocol::stomp::{self, Command, Frame};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

/// A subscription currently registered on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSubscription {
    pub connection: u64,
    pub id: String,
    pub destination: String,
}

struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    subscriptions: HashMap<String, String>,
}

#[derive(Default)]
struct BrokerState {
    accepted: usize,
    connections: HashMap<u64, Connection>,
    connect_frames: Vec<Frame>,
    received: Vec<Frame>,
    reject_connect: bool,
}

/// A mock STOMP broker for integration testing.
///
/// Binds to port 0 (random) and exposes the actual bound port. Each test
/// spins up its own isolated broker.
pub struct MockStompBroker {
    addr: SocketAddr,
    state: Arc<Mutex<BrokerState>>,
    next_message_id: AtomicU64,
    /// Handle to the background accept loop; dropped when the broker is dropped.
    _task: tokio::task::JoinHandle<()>,
}

impl MockStompBroker {
    /// Start the broker, binding to a random available port.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(BrokerState::default()));

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            Self::accept_loop(listener, accept_state).await;
        });

        Ok(Self {
            addr,
            state,
            next_message_id: AtomicU64::new(1),
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL to hand to the transport (`ws://host:port`).
    pub fn base_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Total WebSocket connections accepted since start.
    pub fn connections_accepted(&self) -> usize {
        self.lock().accepted
    }

    /// Connections still open.
    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn active_subscriptions(&self) -> Vec<ActiveSubscription> {
        let state = self.lock();
        let mut subs: Vec<ActiveSubscription> = state
            .connections
            .iter()
            .flat_map(|(conn_id, conn)| {
                conn.subscriptions
                    .iter()
                    .map(move |(id, destination)| ActiveSubscription {
                        connection: *conn_id,
                        id: id.clone(),
                        destination: destination.clone(),
                    })
            })
            .collect();
        subs.sort_by(|a, b| a.connection.cmp(&b.connection).then(a.id.cmp(&b.id)));
        subs
    }

    /// Every CONNECT/STOMP frame seen, in arrival order.
    pub fn connect_frames(&self) -> Vec<Frame> {
        self.lock().connect_frames.clone()
    }

    /// Every SEND frame seen, in arrival order.
    pub fn received_sends(&self) -> Vec<Frame> {
        self.lock().received.clone()
    }

    /// Answer subsequent CONNECT frames with ERROR and close.
    pub fn set_reject_connect(&self, reject: bool) {
        self.lock().reject_connect = reject;
    }

    /// Deliver `body` as a MESSAGE to every active subscription.
    ///
    /// Returns the number of frames queued.
    pub fn push(&self, body: &str) -> usize {
        let state = self.lock();
        let mut delivered = 0;
        for conn in state.connections.values() {
            for (sub_id, destination) in &conn.subscriptions {
                let message_id = format!(
                    "msg-{}",
                    self.next_message_id.fetch_add(1, Ordering::Relaxed)
                );
                let frame = Frame::message(destination, sub_id, &message_id, body);
                if conn.outbound.send(Message::Text(frame.encode().into())).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Send raw text to every open connection, bypassing STOMP framing.
    pub fn push_raw(&self, text: &str) {
        let state = self.lock();
        for conn in state.connections.values() {
            let _ = conn.outbound.send(Message::Text(text.to_owned().into()));
        }
    }

    /// Close every open connection from the server side.
    pub fn drop_all_connections(&self) {
        let state = self.lock();
        for conn in state.connections.values() {
            let _ = conn.outbound.send(Message::Close(None));
        }
    }

    /// Poll until `n` subscriptions are active or the deadline passes.
    pub async fn wait_for_subscriptions(&self, n: usize, within: Duration) -> bool {
        self.wait_until(within, |b| b.active_subscriptions().len() == n)
            .await
    }

    /// Poll until `n` connections have been accepted or the deadline passes.
    pub async fn wait_for_connections(&self, n: usize, within: Duration) -> bool {
        self.wait_until(within, |b| b.connections_accepted() >= n).await
    }

    async fn wait_until(&self, within: Duration, cond: impl Fn(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if cond(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().expect("broker state poisoned")
    }

    // -- internal --

    async fn accept_loop(listener: TcpListener, state: Arc<Mutex<BrokerState>>) {
        let mut next_id = 0u64;
        while let Ok((stream, _peer)) = listener.accept().await {
            next_id += 1;
            let conn_id = next_id;
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                // Client drops are expected in tests; swallow errors.
                let _ = Self::handle_connection(stream, conn_id, Arc::clone(&state)).await;
                if let Ok(mut s) = state.lock() {
                    s.connections.remove(&conn_id);
                }
            });
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        conn_id: u64,
        state: Arc<Mutex<BrokerState>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        {
            let mut s = state.lock().map_err(|_| "broker state poisoned")?;
            s.accepted += 1;
            s.connections.insert(
                conn_id,
                Connection {
                    outbound: tx,
                    subscriptions: HashMap::new(),
                },
            );
        }

        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(Message::Close(frame)) => {
                        let _ = write.send(Message::Close(frame)).await;
                        break;
                    }
                    Some(msg) => write.send(msg).await?,
                    None => break,
                },
                incoming = read.next() => {
                    let text = match incoming {
                        None | Some(Err(_)) => break,
                        Some(Ok(Message::Text(t))) => t,
                        Some(Ok(Message::Close(_))) => break,
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(_)) => continue,
                    };

                    let frame = match stomp::decode(&text) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => continue,
                        Err(e) => {
                            let err = Frame::error("malformed frame", e.to_string());
                            write.send(Message::Text(err.encode().into())).await?;
                            continue;
                        }
                    };

                    match frame.command {
                        Command::Connect | Command::Stomp => {
                            let reject = {
                                let mut s = state.lock().map_err(|_| "broker state poisoned")?;
                                s.connect_frames.push(frame.clone());
                                s.reject_connect
                            };
                            if reject {
                                let err = Frame::error("connection rejected", "");
                                write.send(Message::Text(err.encode().into())).await?;
                                let _ = write.send(Message::Close(None)).await;
                                break;
                            }
                            let connected = Frame::connected("1.2");
                            write.send(Message::Text(connected.encode().into())).await?;
                        }
                        Command::Subscribe => {
                            if let (Some(id), Some(dest)) = (frame.header("id"), frame.header("destination")) {
                                let mut s = state.lock().map_err(|_| "broker state poisoned")?;
                                if let Some(conn) = s.connections.get_mut(&conn_id) {
                                    conn.subscriptions.insert(id.to_owned(), dest.to_owned());
                                }
                            }
                        }
                        Command::Unsubscribe => {
                            if let Some(id) = frame.header("id") {
                                let mut s = state.lock().map_err(|_| "broker state poisoned")?;
                                if let Some(conn) = s.connections.get_mut(&conn_id) {
                                    conn.subscriptions.remove(id);
                                }
                            }
                        }
                        Command::Send => {
                            let mut s = state.lock().map_err(|_| "broker state poisoned")?;
                            s.received.push(frame);
                        }
                        Command::Disconnect => {
                            if let Some(receipt) = frame.header("receipt") {
                                let reply = Frame::receipt(receipt);
                                write.send(Message::Text(reply.encode().into())).await?;
                            }
                        }
                        // Other client frames are not needed by these tests.
                        _ => {}
                    }
                }
            }
        }

        Ok(())
    }
}

/// A TCP endpoint that accepts and immediately drops every connection.
///
/// Every WebSocket handshake against it fails, which makes it a cheap way to
/// drive the reconnect policy to exhaustion while counting attempts.
pub struct RefusingEndpoint {
    addr: SocketAddr,
    accepted: Arc<AtomicU64>,
    _task: tokio::task::JoinHandle<()>,
}

impl RefusingEndpoint {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let accepted = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&accepted);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });
        Ok(Self {
            addr,
            accepted,
            _task: task,
        })
    }

    pub fn base_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn attempts(&self) -> u64 {
        self.accepted.load(Ordering::SeqCst)
    }
}
