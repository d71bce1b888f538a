//! FriendHub Client
//!
//! Logs in to a hub, keeps the session alive with heartbeats and reads
//! friend status notifications.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::Transport;
use crate::protocol::{
    decode, encode, CodecError, Command, HeartbeatRequest, LineFramer, LoginRequest, Message,
    StatusChangeNotification, UserId, MAX_DATAGRAM_SIZE,
};

/// Default heartbeat period, well below the hub's timeout
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Shortest accepted heartbeat period; `tokio::time::interval` panics on zero
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// Bound on establishing a TCP connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Invalid login payload: {0}")]
    InvalidLogin(serde_json::Error),

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Parse a login payload such as `{"user_id":1, "friends": [2, 3]}`
pub fn parse_login(payload: &str) -> ClientResult<LoginRequest> {
    serde_json::from_str(payload).map_err(ClientError::InvalidLogin)
}

/// Write side, shared with the heartbeat task
#[derive(Clone)]
enum Sender {
    Stream(Arc<Mutex<OwnedWriteHalf>>),
    Datagram(Arc<UdpSocket>),
}

impl Sender {
    async fn send<T: Serialize>(&self, command: Command, payload: &T) -> ClientResult<()> {
        let bytes = encode(command, payload)?;
        match self {
            Sender::Stream(writer) => {
                let mut writer = writer.lock().await;
                writer.write_all(&bytes).await?;
                writer.flush().await?;
            }
            Sender::Datagram(socket) => {
                socket.send(&bytes).await?;
            }
        }
        Ok(())
    }
}

enum Receiver {
    Stream {
        reader: OwnedReadHalf,
        framer: LineFramer,
        buf: BytesMut,
    },
    Datagram {
        socket: Arc<UdpSocket>,
        buf: Vec<u8>,
    },
}

impl Receiver {
    /// Next message from the hub, or None once the stream has ended
    async fn next_message(&mut self) -> ClientResult<Option<Message>> {
        match self {
            Receiver::Stream { reader, framer, buf } => loop {
                if let Some(line) = framer.next_line(buf)? {
                    return Ok(Some(decode(&line)));
                }

                buf.reserve(4096);
                if reader.read_buf(buf).await? == 0 {
                    return Ok(framer.finish(buf).map(|line| decode(&line)));
                }
            },
            Receiver::Datagram { socket, buf } => {
                let n = socket.recv(buf).await?;
                Ok(Some(decode(&buf[..n])))
            }
        }
    }
}

/// FriendHub Client
pub struct Client {
    user_id: UserId,
    server_addr: SocketAddr,
    sender: Sender,
    receiver: Receiver,
    heartbeat: Option<JoinHandle<()>>,
}

impl Client {
    /// Connect to a hub and log in
    pub async fn connect(
        transport: Transport,
        server_addr: SocketAddr,
        login: &LoginRequest,
    ) -> ClientResult<Self> {
        tracing::info!("Connecting to {} over {}", server_addr, transport);

        let (sender, receiver) = match transport {
            Transport::Tcp => {
                let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(server_addr)).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => return Err(ClientError::Io(e)),
                    Err(_) => return Err(ClientError::Timeout),
                };
                let (reader, writer) = stream.into_split();
                (
                    Sender::Stream(Arc::new(Mutex::new(writer))),
                    Receiver::Stream {
                        reader,
                        framer: LineFramer::new(),
                        buf: BytesMut::with_capacity(4096),
                    },
                )
            }
            Transport::Udp => {
                let local = if server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(server_addr).await?;
                let socket = Arc::new(socket);
                (
                    Sender::Datagram(socket.clone()),
                    Receiver::Datagram {
                        socket,
                        buf: vec![0u8; MAX_DATAGRAM_SIZE],
                    },
                )
            }
        };

        // Over UDP there is no way to tell whether the login arrived; a lost
        // one shows up as missing notifications.
        sender.send(Command::Login, login).await?;
        tracing::info!("User {} logged in to {}", login.user_id, server_addr);

        Ok(Self {
            user_id: login.user_id,
            server_addr,
            sender,
            receiver,
            heartbeat: None,
        })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Start sending heartbeats every `interval` in the background. Send
    /// failures are logged and the loop keeps going.
    pub fn spawn_heartbeat(&mut self, interval: Duration) {
        let sender = self.sender.clone();
        let request = HeartbeatRequest { user_id: self.user_id };

        if let Some(previous) = self.heartbeat.take() {
            previous.abort();
        }

        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_HEARTBEAT_INTERVAL));
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if let Err(e) = sender.send(Command::Heartbeat, &request).await {
                    tracing::error!("Could not send heartbeat: {}", e);
                }
            }
        }));
    }

    /// Wait for the next status change of a friend. Returns None when the
    /// hub has closed the connection.
    pub async fn next_status(&mut self) -> ClientResult<Option<StatusChangeNotification>> {
        loop {
            let Some(message) = self.receiver.next_message().await? else {
                return Ok(None);
            };

            match message.command {
                Command::StatusChange => return Ok(Some(message.parse()?)),
                other => tracing::debug!("Ignoring {:?} from hub", other),
            }
        }
    }

    /// Stop heartbeating and close the connection
    pub async fn close(&mut self) -> ClientResult<()> {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }

        if let Sender::Stream(writer) = &self.sender {
            writer.lock().await.shutdown().await?;
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}
