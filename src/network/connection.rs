//! Connection handling for FriendHub
//!
//! A [`ConnectionHandle`] lets the hub write to a client without knowing
//! whether it sits behind its own TCP connection or shares the server's
//! UDP socket.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};

/// Default bound on a single write
pub const WRITE_DEADLINE: Duration = Duration::from_secs(3);

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Write timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    Closed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Write side of one accepted TCP connection, shared by every handle the
/// listener creates for it.
pub struct StreamConnection {
    peer_addr: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    /// Flipped to true once; wakes the connection's reader task
    closed: watch::Sender<bool>,
}

impl StreamConnection {
    pub fn new(writer: OwnedWriteHalf, peer_addr: SocketAddr) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            peer_addr,
            writer: Mutex::new(writer),
            closed,
        })
    }

    /// Receiver that changes when the connection is closed
    pub fn subscribe_close(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn write(&self, bytes: &[u8]) -> ConnectionResult<()> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) -> ConnectionResult<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }

        tracing::debug!("Closing connection to {}", self.peer_addr);
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

enum Link {
    Stream(Arc<StreamConnection>),
    Datagram(Arc<UdpSocket>),
}

/// Write/close access to one client, whatever the transport
pub struct ConnectionHandle {
    link: Link,
    peer_addr: SocketAddr,
    write_deadline: Duration,
}

impl ConnectionHandle {
    /// Handle bound to an exclusive TCP connection
    pub fn stream(conn: Arc<StreamConnection>) -> Self {
        let peer_addr = conn.peer_addr;
        Self {
            link: Link::Stream(conn),
            peer_addr,
            write_deadline: WRITE_DEADLINE,
        }
    }

    /// Handle bound to the shared UDP socket and one remote address
    pub fn datagram(socket: Arc<UdpSocket>, peer_addr: SocketAddr) -> Self {
        Self {
            link: Link::Datagram(socket),
            peer_addr,
            write_deadline: WRITE_DEADLINE,
        }
    }

    pub fn with_write_deadline(mut self, write_deadline: Duration) -> Self {
        self.write_deadline = write_deadline;
        self
    }

    /// Remote address of the client
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether closing this handle releases a connection
    pub fn is_exclusive(&self) -> bool {
        matches!(self.link, Link::Stream(_))
    }

    /// Whether both handles reach the client through the same connection
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        match (&self.link, &other.link) {
            (Link::Stream(a), Link::Stream(b)) => Arc::ptr_eq(a, b),
            (Link::Datagram(a), Link::Datagram(b)) => {
                Arc::ptr_eq(a, b) && self.peer_addr == other.peer_addr
            }
            _ => false,
        }
    }

    /// Write bytes to the client. Gives up with [`ConnectionError::Timeout`]
    /// once the write deadline passes; never retries.
    pub async fn write(&self, bytes: &[u8]) -> ConnectionResult<()> {
        let write = async {
            match &self.link {
                Link::Stream(conn) => conn.write(bytes).await,
                Link::Datagram(socket) => {
                    socket.send_to(bytes, self.peer_addr).await?;
                    Ok::<(), ConnectionError>(())
                }
            }
        };

        match tokio::time::timeout(self.write_deadline, write).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(self.write_deadline)),
        }
    }

    /// Close the connection. Does nothing for UDP since the socket is
    /// shared by every datagram client.
    pub async fn close(&self) -> ConnectionResult<()> {
        match &self.link {
            Link::Stream(conn) => conn.close().await,
            Link::Datagram(_) => Ok(()),
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.link {
            Link::Stream(_) => "tcp",
            Link::Datagram(_) => "udp",
        };
        f.debug_struct("ConnectionHandle")
            .field("transport", &kind)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_test::assert_ok;

    async fn stream_pair() -> (Arc<StreamConnection>, tokio::net::tcp::OwnedReadHalf, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, addr) = listener.accept().await.unwrap();
        let (reader, writer) = server.into_split();
        (StreamConnection::new(writer, addr), reader, client)
    }

    #[tokio::test]
    async fn test_stream_write_and_close() {
        let (conn, _reader, mut client) = stream_pair().await;
        let mut closed = conn.subscribe_close();
        let handle = ConnectionHandle::stream(conn.clone());
        assert!(handle.is_exclusive());

        assert_ok!(handle.write(b"hello\n").await);
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");

        assert_ok!(handle.close().await);
        assert!(conn.is_closed());
        assert_ok!(closed.changed().await);

        // Peer sees end of stream
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        assert!(matches!(handle.write(b"late\n").await, Err(ConnectionError::Closed)));
        // Closing twice is fine
        assert_ok!(handle.close().await);
    }

    #[tokio::test]
    async fn test_datagram_write_and_close() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let handle = ConnectionHandle::datagram(server.clone(), peer.local_addr().unwrap());
        assert!(!handle.is_exclusive());

        assert_ok!(handle.write(b"ping\n").await);
        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping\n");
        assert_eq!(from, server.local_addr().unwrap());

        // Close leaves the shared socket usable
        assert_ok!(handle.close().await);
        assert_ok!(handle.write(b"again\n").await);
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"again\n");
    }

    #[tokio::test]
    async fn test_same_connection() {
        let (conn, _reader, _client) = stream_pair().await;
        let a = ConnectionHandle::stream(conn.clone());
        let b = ConnectionHandle::stream(conn);
        assert!(a.same_connection(&b));

        let (other, _reader2, _client2) = stream_pair().await;
        let c = ConnectionHandle::stream(other);
        assert!(!a.same_connection(&c));

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let d = ConnectionHandle::datagram(socket.clone(), addr);
        let e = ConnectionHandle::datagram(socket.clone(), addr);
        let f = ConnectionHandle::datagram(socket, "127.0.0.1:4001".parse().unwrap());
        assert!(d.same_connection(&e));
        assert!(!d.same_connection(&f));
        assert!(!a.same_connection(&d));
    }

    #[tokio::test]
    async fn test_write_deadline() {
        let (conn, _reader, _client) = stream_pair().await;
        let handle = ConnectionHandle::stream(conn).with_write_deadline(Duration::from_millis(50));

        // The peer never reads, so the socket buffers eventually fill up
        let chunk = vec![0u8; 1024 * 1024];
        let mut result = Ok(());
        for _ in 0..256 {
            result = handle.write(&chunk).await;
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(ConnectionError::Timeout(_))));
    }
}
