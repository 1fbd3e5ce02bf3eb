//! NBNS over TCP: each message is preceded by a 2-byte big-endian length.

use crate::error::Result;
use crate::helpers::apply_tcp_keepalive;
use crate::nbns::handler::PacketHandler;
use crate::nbns::packet::Packet;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_TCP_MESSAGE: usize = 65535;

pub struct TcpServer {
    listener: TcpListener,
    handler: Arc<PacketHandler>,
    timeout: Duration,
    max_message: usize,
    connections: Arc<DashMap<SocketAddr, AbortHandle>>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl TcpServer {
    pub async fn bind(addr: SocketAddr, handler: Arc<PacketHandler>) -> Result<TcpServer> {
        let listener = TcpListener::bind(addr).await?;
        let (close_tx, _) = watch::channel(false);
        Ok(TcpServer {
            listener,
            handler,
            timeout: DEFAULT_TCP_TIMEOUT,
            max_message: MAX_TCP_MESSAGE,
            connections: Arc::new(DashMap::new()),
            closed: AtomicBool::new(false),
            close_tx,
        })
    }

    /// Per-message read and write deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Length prefixes above this terminate the connection
    pub fn with_max_message(mut self, max: usize) -> Self {
        self.max_message = max.min(MAX_TCP_MESSAGE);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of connections currently being served
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Accept connections until `close`.
    pub async fn run(&self) -> Result<()> {
        let mut closed = self.close_tx.subscribe();
        info!(listen = %self.local_addr()?, "NBNS TCP server started");

        loop {
            let (stream, peer) = tokio::select! {
                _ = closed.wait_for(|c| *c) => break,
                res = self.listener.accept() => match res {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "NBNS TCP accept failed");
                        continue;
                    }
                },
            };
            if let Err(e) = apply_tcp_keepalive(&stream, self.timeout) {
                debug!(client = %peer, error = %e, "NBNS TCP keepalive not applied");
            }

            let handler = Arc::clone(&self.handler);
            let connections = Arc::clone(&self.connections);
            let (timeout, max_message) = (self.timeout, self.max_message);
            let (registered_tx, registered_rx) = oneshot::channel::<()>();

            let task = tokio::spawn(async move {
                // Wait until tracked so the removal below cannot precede the insert
                let _ = registered_rx.await;
                serve_connection(stream, peer, &handler, timeout, max_message).await;
                connections.remove(&peer);
            });
            self.connections.insert(peer, task.abort_handle());
            let _ = registered_tx.send(());
        }

        self.abort_connections();
        info!("NBNS TCP server stopped");
        Ok(())
    }

    /// Stop accepting and drop every open connection. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_tx.send_replace(true);
            self.abort_connections();
        }
    }

    fn abort_connections(&self) {
        self.connections.retain(|peer, handle| {
            debug!(client = %peer, "NBNS TCP closing connection");
            handle.abort();
            false
        });
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: &PacketHandler,
    timeout: Duration,
    max_message: usize,
) {
    debug!(client = %peer, "NBNS TCP connection opened");
    loop {
        let message = match tokio::time::timeout(timeout, read_frame(&mut stream, max_message)).await {
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                debug!(client = %peer, error = %e, "NBNS TCP read failed");
                break;
            }
            Err(_) => {
                debug!(client = %peer, "NBNS TCP read timed out");
                break;
            }
        };

        let request = match Packet::decode(&message) {
            Ok(p) => p,
            Err(e) => {
                debug!(client = %peer, error = %e, "NBNS TCP dropped malformed packet");
                continue;
            }
        };
        let Some(response) = handler.handle(&request, peer).await else {
            continue;
        };
        let bytes = match response.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!(client = %peer, error = %e, "NBNS failed to encode response");
                continue;
            }
        };

        match tokio::time::timeout(timeout, write_frame(&mut stream, &bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(client = %peer, error = %e, "NBNS TCP write failed");
                break;
            }
            Err(_) => {
                debug!(client = %peer, "NBNS TCP write timed out");
                break;
            }
        }
    }
    debug!(client = %peer, "NBNS TCP connection closed");
}

/// Read one length-prefixed message; `None` on clean end of stream
async fn read_frame(stream: &mut TcpStream, max_message: usize) -> std::io::Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; 2];
    match stream.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = usize::from(u16::from_be_bytes(prefix));
    if len > max_message {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("message length {} exceeds {}", len, max_message),
        ));
    }
    let mut message = vec![0u8; len];
    stream.read_exact(&mut message).await?;
    Ok(Some(message))
}

async fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> std::io::Result<()> {
    let len = u16::try_from(bytes.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "response exceeds 65535 bytes")
    })?;
    let mut frame = Vec::with_capacity(bytes.len() + 2);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(bytes);
    stream.write_all(&frame).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nbns::name::NetBiosName;
    use crate::nbns::registry::{NameType, Registry};
    use std::net::Ipv4Addr;

    async fn start(max_message: usize) -> (Arc<TcpServer>, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        let handler = Arc::new(PacketHandler::new(Arc::clone(&registry)));
        let server = Arc::new(
            TcpServer::bind("127.0.0.1:0".parse().unwrap(), handler)
                .await
                .unwrap()
                .with_max_message(max_message),
        );
        let running = Arc::clone(&server);
        tokio::spawn(async move { running.run().await });
        (server, registry)
    }

    #[tokio::test]
    async fn test_query_over_tcp() {
        let (server, registry) = start(MAX_TCP_MESSAGE).await;
        let name = NetBiosName::new("TCPHOST", None).unwrap();
        registry
            .register(&name, NameType::Unique, Ipv4Addr::new(10, 0, 0, 8), Duration::from_secs(60))
            .unwrap();

        let mut stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        let query = Packet::new_query(0x0707, name).encode().unwrap();
        write_frame(&mut stream, &query).await.unwrap();

        let reply = read_frame(&mut stream, MAX_TCP_MESSAGE).await.unwrap().unwrap();
        let response = Packet::decode(&reply).unwrap();
        assert_eq!(response.transaction_id, 0x0707);
        assert_eq!(response.answers[0].rdata, vec![10, 0, 0, 8]);

        server.close();
    }

    #[tokio::test]
    async fn test_oversized_prefix_drops_connection() {
        let (server, _) = start(64).await;
        let mut stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        stream.write_all(&[0x01, 0x00]).await.unwrap();

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        server.close();
    }

    #[tokio::test]
    async fn test_close_aborts_connections() {
        let (server, _) = start(MAX_TCP_MESSAGE).await;
        let mut stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();

        for _ in 0..100 {
            if server.connection_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.connection_count(), 1);

        server.close();
        server.close();
        assert_eq!(server.connection_count(), 0);

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}
