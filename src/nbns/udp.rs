//! NBNS over UDP (RFC 1002 §4.2.1).

use crate::error::Result;
use crate::helpers::bind_udp_reuse;
use crate::nbns::handler::PacketHandler;
use crate::nbns::packet::{Packet, FLAG_TRUNCATED};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Largest datagram read or sent (minimum reassembly buffer, RFC 1001)
pub const MAX_UDP_PACKET: usize = 576;
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct UdpServer {
    socket: Arc<UdpSocket>,
    handler: Arc<PacketHandler>,
    read_timeout: Duration,
    write_timeout: Duration,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl UdpServer {
    pub async fn bind(addr: SocketAddr, handler: Arc<PacketHandler>) -> Result<UdpServer> {
        let socket = bind_udp_reuse(addr)?;
        let (close_tx, _) = watch::channel(false);
        Ok(UdpServer {
            socket: Arc::new(socket),
            handler,
            read_timeout: DEFAULT_UDP_TIMEOUT,
            write_timeout: DEFAULT_UDP_TIMEOUT,
            closed: AtomicBool::new(false),
            close_tx,
        })
    }

    pub fn with_timeouts(mut self, read: Duration, write: Duration) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Read datagrams until `close`; each request is handled on its own task.
    pub async fn run(&self) -> Result<()> {
        let mut closed = self.close_tx.subscribe();
        let mut buf = vec![0u8; MAX_UDP_PACKET];
        info!(listen = %self.local_addr()?, "NBNS UDP server started");

        loop {
            let received = tokio::select! {
                _ = closed.wait_for(|c| *c) => break,
                res = tokio::time::timeout(self.read_timeout, self.socket.recv_from(&mut buf)) => res,
            };
            let (len, src) = match received {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => {
                    debug!(error = %e, "NBNS UDP receive failed");
                    continue;
                }
                // Idle deadline, not an error
                Err(_) => continue,
            };

            let request = match Packet::decode(&buf[..len]) {
                Ok(p) => p,
                Err(e) => {
                    debug!(client = %src, bytes = len, error = %e, "NBNS UDP dropped malformed packet");
                    continue;
                }
            };

            let socket = Arc::clone(&self.socket);
            let handler = Arc::clone(&self.handler);
            let write_timeout = self.write_timeout;
            tokio::spawn(async move {
                let Some(response) = handler.handle(&request, src).await else {
                    return;
                };
                let bytes = match encode_for_udp(&response) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!(client = %src, error = %e, "NBNS failed to encode response");
                        return;
                    }
                };
                match tokio::time::timeout(write_timeout, socket.send_to(&bytes, src)).await {
                    Ok(Ok(_)) => debug!(client = %src, bytes = bytes.len(), "NBNS UDP response sent"),
                    Ok(Err(e)) => debug!(client = %src, error = %e, "NBNS UDP send failed"),
                    Err(_) => debug!(client = %src, "NBNS UDP send timed out"),
                }
            });
        }

        info!("NBNS UDP server stopped");
        Ok(())
    }

    /// Stop the read loop. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_tx.send_replace(true);
        }
    }
}

/// Encode `response`, marking it truncated and cutting it to 576 bytes when
/// it does not fit in one datagram.
pub fn encode_for_udp(response: &Packet) -> std::result::Result<Vec<u8>, crate::error::WireError> {
    let mut bytes = response.encode()?;
    if bytes.len() > MAX_UDP_PACKET {
        let flags = u16::from_be_bytes([bytes[2], bytes[3]]) | FLAG_TRUNCATED;
        bytes[2..4].copy_from_slice(&flags.to_be_bytes());
        bytes.truncate(MAX_UDP_PACKET);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nbns::name::NetBiosName;
    use crate::nbns::packet::ResourceRecord;
    use crate::nbns::registry::Registry;
    use std::net::Ipv4Addr;

    #[test]
    fn test_small_response_untouched() {
        let packet = Packet::new_query(1, NetBiosName::new("HOST", None).unwrap());
        let bytes = encode_for_udp(&packet).unwrap();
        assert_eq!(bytes, packet.encode().unwrap());
    }

    #[test]
    fn test_large_response_truncated() {
        let name = NetBiosName::new("BIG", None).unwrap();
        let mut packet = Packet::new_query(1, name.clone());
        for i in 0..20u8 {
            packet
                .answers
                .push(ResourceRecord::nb(name.clone(), 60, Ipv4Addr::new(10, 0, 0, i)));
        }
        assert!(packet.encode().unwrap().len() > MAX_UDP_PACKET);

        let bytes = encode_for_udp(&packet).unwrap();
        assert_eq!(bytes.len(), MAX_UDP_PACKET);
        assert_eq!(bytes[2] & 0x02, 0x02);
    }

    #[tokio::test]
    async fn test_close_stops_run() {
        let handler = Arc::new(PacketHandler::new(Arc::new(Registry::new())));
        let server = Arc::new(
            UdpServer::bind("127.0.0.1:0".parse().unwrap(), handler)
                .await
                .unwrap(),
        );
        let running = Arc::clone(&server);
        let task = tokio::spawn(async move { running.run().await });

        server.close();
        server.close();
        task.await.unwrap().unwrap();
    }
}
