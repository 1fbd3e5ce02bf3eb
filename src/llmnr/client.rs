//! LLMNR querier: one UDP socket, responses demultiplexed to waiting
//! callers by transaction ID.

use crate::error::{Error, Result, WireError};
use crate::llmnr::message::{Message, RecordType, FLAG_QR};
use crate::llmnr::{LLMNR_IPV4_GROUP, LLMNR_PORT};
use crate::txid::{IdSource, RandomIds};
use crate::wire::{read_u16, HEADER_SIZE};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::debug;

type Pending = DashMap<u16, mpsc::Sender<std::result::Result<Message, WireError>>>;

/// Default time a query waits for its first response
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

const MAX_DATAGRAM: usize = 9194;

pub struct Client {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    timeout: Duration,
    pending: Arc<Pending>,
    ids: Arc<dyn IdSource>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

/// Removes a pending entry when the query finishes, however it finishes.
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: u16,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl Client {
    /// Client sending to the IPv4 LLMNR group
    pub async fn new(timeout: Duration) -> Result<Client> {
        let target = SocketAddr::new(IpAddr::V4(LLMNR_IPV4_GROUP), LLMNR_PORT);
        Self::with_target(target, timeout).await
    }

    /// Client sending to an arbitrary address, e.g. a unicast responder
    pub async fn with_target(target: SocketAddr, timeout: Duration) -> Result<Client> {
        Self::with_options(target, timeout, Arc::new(RandomIds)).await
    }

    pub async fn with_options(
        target: SocketAddr,
        timeout: Duration,
        ids: Arc<dyn IdSource>,
    ) -> Result<Client> {
        let bind: SocketAddr = match target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let (close_tx, close_rx) = watch::channel(false);

        tokio::spawn(read_loop(
            Arc::clone(&socket),
            Arc::clone(&pending),
            close_rx,
        ));

        Ok(Client {
            socket,
            target,
            timeout,
            pending,
            ids,
            closed: AtomicBool::new(false),
            close_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of queries currently awaiting a response
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Query with the client's default timeout
    pub async fn query(&self, name: &str, qtype: RecordType) -> Result<Message> {
        self.query_timeout(name, qtype, self.timeout).await
    }

    /// Send one question and wait for the first response carrying its ID.
    ///
    /// Dropping the returned future cancels the query; the pending entry is
    /// removed on every exit path.
    pub async fn query_timeout(
        &self,
        name: &str,
        qtype: RecordType,
        timeout: Duration,
    ) -> Result<Message> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let (tx, mut rx) = mpsc::channel(1);
        let id = self.register(tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let request = Message::new_query(id, name, qtype).encode()?;
        self.socket.send_to(&request, self.target).await?;
        debug!(id = id, name = %name, qtype = %qtype, target = %self.target, "LLMNR query sent");

        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(Ok(msg))) => Ok(msg),
            Ok(Some(Err(e))) => Err(Error::Wire(e)),
            Ok(None) => Err(Error::Closed),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Insert `tx` under an ID not already in flight
    fn register(&self, tx: mpsc::Sender<std::result::Result<Message, WireError>>) -> u16 {
        loop {
            let id = self.ids.next_id();
            if let Entry::Vacant(slot) = self.pending.entry(id) {
                slot.insert(tx);
                return id;
            }
        }
    }

    /// Stop the reader and fail outstanding queries. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_tx.send_replace(true);
        self.pending.clear();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(socket: Arc<UdpSocket>, pending: Arc<Pending>, mut closed: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = tokio::select! {
            _ = closed.wait_for(|c| *c) => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok(v) => v,
                Err(e) => {
                    debug!(error = %e, "LLMNR client receive failed");
                    continue;
                }
            },
        };
        deliver(&pending, &buf[..len], from);
    }
}

/// Hand a datagram to the query waiting for its ID, never blocking
fn deliver(pending: &Pending, datagram: &[u8], from: SocketAddr) {
    match Message::decode(datagram) {
        Ok(msg) if msg.is_response() => match pending.get(&msg.id) {
            Some(tx) => {
                let id = msg.id;
                if tx.try_send(Ok(msg)).is_err() {
                    debug!(id = id, responder = %from, "LLMNR extra response dropped");
                }
            }
            None => debug!(id = msg.id, responder = %from, "LLMNR response for unknown ID"),
        },
        Ok(msg) => debug!(id = msg.id, responder = %from, "LLMNR client ignoring query"),
        Err(e) => {
            // Only a response that claims one of our IDs is worth reporting
            let claimed = datagram.len() >= HEADER_SIZE
                && read_u16(datagram, 2).is_some_and(|flags| flags & FLAG_QR != 0);
            let id = read_u16(datagram, 0).filter(|_| claimed);
            match id.and_then(|id| pending.get(&id)) {
                Some(tx) => {
                    let _ = tx.try_send(Err(e));
                }
                None => debug!(responder = %from, error = %e, "LLMNR client dropped malformed datagram"),
            }
        }
    }
}
