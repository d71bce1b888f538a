//! FriendHub listeners
//!
//! Both listeners decode incoming messages and pass each one, together with
//! a [`ConnectionHandle`] for replying, to a single registered handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use super::connection::{ConnectionHandle, StreamConnection, WRITE_DEADLINE};
use super::Transport;
use crate::protocol::{decode, CodecError, LineFramer, Message, MAX_DATAGRAM_SIZE};

/// Initial read buffer size for stream connections
const READ_BUFFER_SIZE: usize = 4096;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Handler is not registered")]
    HandlerNotRegistered,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Accept failed: {0}")]
    Accept(std::io::Error),

    #[error("Receive failed: {0}")]
    Receive(std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Receives every decoded message along with a handle back to its sender
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, conn: ConnectionHandle, message: Message);
}

/// Common contract of the TCP and UDP listeners
#[async_trait]
pub trait Listener: Send + Sync {
    /// Register the handler. Must be called before serving.
    fn handle(&mut self, handler: Arc<dyn MessageHandler>);

    /// Bind and serve until a fatal error occurs
    async fn listen_and_serve(&self, addr: &str) -> ServerResult<()>;
}

/// Create a listener for the given transport
pub fn new_listener(transport: Transport, write_deadline: Duration) -> Box<dyn Listener> {
    match transport {
        Transport::Tcp => Box::new(StreamListener::new().with_write_deadline(write_deadline)),
        Transport::Udp => Box::new(DatagramListener::new().with_write_deadline(write_deadline)),
    }
}

/// TCP listener, one reader task per connection
pub struct StreamListener {
    handler: Option<Arc<dyn MessageHandler>>,
    write_deadline: Duration,
}

impl StreamListener {
    pub fn new() -> Self {
        Self {
            handler: None,
            write_deadline: WRITE_DEADLINE,
        }
    }

    pub fn with_write_deadline(mut self, write_deadline: Duration) -> Self {
        self.write_deadline = write_deadline;
        self
    }

    /// Accept connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> ServerResult<()> {
        let handler = self.handler.clone().ok_or(ServerError::HandlerNotRegistered)?;

        let local_addr = listener.local_addr()?;
        tracing::info!("TCP listener accepting on {}", local_addr);

        loop {
            let (stream, addr) = listener.accept().await.map_err(|e| {
                tracing::error!("Failed to accept new connection: {}", e);
                ServerError::Accept(e)
            })?;
            tracing::debug!("New connection from {}", addr);

            let handler = handler.clone();
            let write_deadline = self.write_deadline;

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, handler, write_deadline).await {
                    tracing::debug!("Connection {} ended: {}", addr, e);
                }
            });
        }
    }
}

impl Default for StreamListener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Listener for StreamListener {
    fn handle(&mut self, handler: Arc<dyn MessageHandler>) {
        self.handler = Some(handler);
    }

    async fn listen_and_serve(&self, addr: &str) -> ServerResult<()> {
        if self.handler.is_none() {
            return Err(ServerError::HandlerNotRegistered);
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(format!("Failed to bind to {}: {}", addr, e)))?;

        self.serve(listener).await
    }
}

/// Read lines from one client until it goes away or the hub closes it.
/// The hub is not told when this returns.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handler: Arc<dyn MessageHandler>,
    write_deadline: Duration,
) -> ServerResult<()> {
    let (mut reader, writer) = stream.into_split();
    let conn = StreamConnection::new(writer, addr);
    let mut closed = conn.subscribe_close();

    let mut framer = LineFramer::new();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        while let Some(line) = framer.next_line(&mut buf)? {
            let handle = ConnectionHandle::stream(conn.clone()).with_write_deadline(write_deadline);
            handler.handle(handle, decode(&line)).await;
        }

        if conn.is_closed() {
            return Ok(());
        }

        buf.reserve(READ_BUFFER_SIZE);
        let n = tokio::select! {
            read = reader.read_buf(&mut buf) => read?,
            _ = closed.changed() => {
                tracing::debug!("Connection {} closed by hub", addr);
                return Ok(());
            }
        };

        if n == 0 {
            if let Some(line) = framer.finish(&mut buf) {
                let handle = ConnectionHandle::stream(conn.clone()).with_write_deadline(write_deadline);
                handler.handle(handle, decode(&line)).await;
            }
            tracing::debug!("Connection {} reached end of stream", addr);
            return Ok(());
        }
    }
}

/// UDP listener over one shared socket. Packets are handled in-line, so a
/// slow handler delays the next read.
pub struct DatagramListener {
    handler: Option<Arc<dyn MessageHandler>>,
    write_deadline: Duration,
}

impl DatagramListener {
    pub fn new() -> Self {
        Self {
            handler: None,
            write_deadline: WRITE_DEADLINE,
        }
    }

    pub fn with_write_deadline(mut self, write_deadline: Duration) -> Self {
        self.write_deadline = write_deadline;
        self
    }

    /// Read packets from an already bound socket
    pub async fn serve(&self, socket: UdpSocket) -> ServerResult<()> {
        let handler = self.handler.clone().ok_or(ServerError::HandlerNotRegistered)?;

        let socket = Arc::new(socket);
        tracing::info!("UDP listener receiving on {}", socket.local_addr()?);

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, addr) = socket.recv_from(&mut buf).await.map_err(|e| {
                tracing::error!("Could not read packets: {}", e);
                ServerError::Receive(e)
            })?;

            let handle = ConnectionHandle::datagram(socket.clone(), addr)
                .with_write_deadline(self.write_deadline);
            handler.handle(handle, decode(&buf[..n])).await;
        }
    }
}

impl Default for DatagramListener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Listener for DatagramListener {
    fn handle(&mut self, handler: Arc<dyn MessageHandler>) {
        self.handler = Some(handler);
    }

    async fn listen_and_serve(&self, addr: &str) -> ServerResult<()> {
        if self.handler.is_none() {
            return Err(ServerError::HandlerNotRegistered);
        }

        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(format!("Failed to bind to {}: {}", addr, e)))?;

        self.serve(socket).await
    }
}
