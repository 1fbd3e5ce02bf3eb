//! LLMNR responder: joins the link-local multicast group and dispatches
//! each query through the handler chain on its own task.

use crate::error::{Error, Result};
use crate::helpers::bind_multicast;
use crate::llmnr::handler::{Handler, ResponseWriter};
use crate::llmnr::message::Message;
use crate::llmnr::{LLMNR_IPV4_GROUP, LLMNR_IPV6_GROUP, LLMNR_PORT};
use crate::logging::{dump, LogSink, TracingSink};
use parking_lot::RwLock;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info};

/// Largest datagram read from the socket
const MAX_DATAGRAM: usize = 9194;

/// Server lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    New,
    Listening,
    Closing,
    Closed,
}

const STATE_NEW: u8 = 0;
const STATE_LISTENING: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_NEW => ServerState::New,
            STATE_LISTENING => ServerState::Listening,
            STATE_CLOSING => ServerState::Closing,
            _ => ServerState::Closed,
        }
    }
}

struct ServerInner {
    network: String,
    port: u16,
    handlers: RwLock<Vec<Arc<dyn Handler>>>,
    state: AtomicU8,
    debug: AtomicBool,
    sink: RwLock<Arc<dyn LogSink>>,
    local_addr: RwLock<Option<SocketAddr>>,
    close_tx: watch::Sender<bool>,
}

/// LLMNR server for one address family. Cloning yields another handle to
/// the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

/// Multicast group for a network string ("udp4" or "udp6")
pub fn multicast_group(network: &str) -> Result<IpAddr> {
    match network {
        "udp4" | "udp" => Ok(IpAddr::V4(LLMNR_IPV4_GROUP)),
        "udp6" => Ok(IpAddr::V6(LLMNR_IPV6_GROUP)),
        other => Err(Error::UnknownNetwork(other.to_string())),
    }
}

impl Server {
    pub fn new(network: &str) -> Self {
        Self::with_port(network, LLMNR_PORT)
    }

    /// Same as `new` but listening on a non-standard port
    pub fn with_port(network: &str, port: u16) -> Self {
        let (close_tx, _) = watch::channel(false);
        Server {
            inner: Arc::new(ServerInner {
                network: network.to_string(),
                port,
                handlers: RwLock::new(Vec::new()),
                state: AtomicU8::new(STATE_NEW),
                debug: AtomicBool::new(false),
                sink: RwLock::new(Arc::new(TracingSink::new())),
                local_addr: RwLock::new(None),
                close_tx,
            }),
        }
    }

    pub fn network(&self) -> &str {
        &self.inner.network
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Address the server is reading from, once serving
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read()
    }

    /// Append a handler to the chain. Handlers should be registered before
    /// serving starts; later additions apply to subsequent datagrams.
    pub fn register_handler<H: Handler + 'static>(&self, handler: H) {
        self.inner.handlers.write().push(Arc::new(handler));
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.read().len()
    }

    /// Dump every accepted query through the logger sink
    pub fn set_debug(&self, enabled: bool) {
        self.inner.debug.store(enabled, Ordering::Relaxed);
    }

    pub fn set_sink(&self, sink: Arc<dyn LogSink>) {
        *self.inner.sink.write() = sink;
    }

    pub fn sink(&self) -> Arc<dyn LogSink> {
        self.inner.sink.read().clone()
    }

    /// Join the multicast group for the configured family and serve until
    /// `close` is called.
    pub async fn listen_and_serve(&self) -> Result<()> {
        if self.handler_count() == 0 {
            return Err(Error::NoHandlers);
        }
        let group = multicast_group(&self.inner.network)?;
        let socket = bind_multicast(group, self.inner.port)?;
        info!(network = %self.inner.network, group = %group, port = self.inner.port, "LLMNR server listening");
        self.serve(socket).await
    }

    /// Serve queries arriving on an already bound socket.
    pub async fn serve(&self, socket: UdpSocket) -> Result<()> {
        if self.handler_count() == 0 {
            return Err(Error::NoHandlers);
        }
        if let Err(current) = self.inner.state.compare_exchange(
            STATE_NEW,
            STATE_LISTENING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return match ServerState::from_u8(current) {
                ServerState::Listening => Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    "server is already listening",
                ))),
                _ => Err(Error::Closed),
            };
        }

        *self.inner.local_addr.write() = socket.local_addr().ok();
        let socket = Arc::new(socket);
        let mut closed = self.inner.close_tx.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, remote) = tokio::select! {
                _ = closed.wait_for(|c| *c) => break,
                res = socket.recv_from(&mut buf) => match res {
                    Ok(v) => v,
                    Err(e) => {
                        // ICMP unreachable from a previous send surfaces here on some platforms
                        debug!(error = %e, "LLMNR receive failed");
                        continue;
                    }
                },
            };

            let msg = match Message::decode(&buf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(client = %remote, bytes = len, error = %e, "LLMNR failed to decode datagram");
                    continue;
                }
            };
            if !msg.is_query() {
                debug!(client = %remote, id = msg.id, "LLMNR discarding non-query");
                continue;
            }
            if self.inner.debug.load(Ordering::Relaxed) {
                dump(
                    self.sink().as_ref(),
                    &format!("LLMNR query from {}", remote),
                    &msg.describe(),
                );
            }

            let server = self.clone();
            let writer = ResponseWriter::new(Arc::clone(&socket), remote, closed.clone());
            tokio::spawn(async move {
                server.dispatch(remote, &writer, msg);
            });
        }

        self.inner.state.store(STATE_CLOSED, Ordering::Release);
        info!(network = %self.inner.network, "LLMNR server stopped");
        Ok(())
    }

    /// Run the handler chain for one message, stopping at the first `false`
    pub fn dispatch(&self, remote: SocketAddr, writer: &ResponseWriter, mut msg: Message) {
        let handlers: Vec<Arc<dyn Handler>> = self.inner.handlers.read().clone();
        for handler in handlers {
            if !handler.run(self, remote, writer, &mut msg) {
                break;
            }
        }
    }

    /// Stop serving. Safe to call repeatedly and from any task.
    pub fn close(&self) {
        let previous = self.inner.state.swap(STATE_CLOSING, Ordering::AcqRel);
        match previous {
            STATE_LISTENING => {
                self.inner.close_tx.send_replace(true);
            }
            STATE_NEW | STATE_CLOSED => {
                self.inner.close_tx.send_replace(true);
                self.inner.state.store(STATE_CLOSED, Ordering::Release);
            }
            _ => {}
        }
    }
}
