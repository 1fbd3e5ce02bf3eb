//! Handler chain for the LLMNR server and the per-request response writer.

use crate::error::{Error, Result};
use crate::llmnr::message::{Message, RecordType};
use crate::llmnr::server::Server;
use crate::logging::LogSink;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, warn};

/// A query processor in the server's handler chain.
///
/// Handlers run in registration order; returning `false` stops the chain
/// for that message. Each dispatch owns its decoded message, so handlers may
/// mutate it freely.
pub trait Handler: Send + Sync {
    fn run(
        &self,
        server: &Server,
        remote: SocketAddr,
        writer: &ResponseWriter,
        msg: &mut Message,
    ) -> bool;
}

impl<F> Handler for F
where
    F: Fn(&Server, SocketAddr, &ResponseWriter, &mut Message) -> bool + Send + Sync,
{
    fn run(
        &self,
        server: &Server,
        remote: SocketAddr,
        writer: &ResponseWriter,
        msg: &mut Message,
    ) -> bool {
        self(server, remote, writer, msg)
    }
}

/// Sends responses for one request back to its sender.
pub struct ResponseWriter {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    closed: watch::Receiver<bool>,
}

impl ResponseWriter {
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        closed: watch::Receiver<bool>,
    ) -> Self {
        ResponseWriter {
            socket,
            remote,
            closed,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Mark `msg` as a response, encode it, and send it as one datagram.
    ///
    /// The send never waits: when the socket buffer is full the response is
    /// dropped and the `WouldBlock` error returned, as with any other send
    /// failure.
    pub fn write_message(&self, msg: &mut Message) -> Result<()> {
        if *self.closed.borrow() {
            return Err(Error::Closed);
        }
        msg.set_response();
        let bytes = msg.encode()?;
        let sent = self.socket.try_send_to(&bytes, self.remote)?;
        debug!(client = %self.remote, id = msg.id, bytes = sent, "LLMNR response sent");
        Ok(())
    }
}

/// Answers A and AAAA questions for a fixed set of names.
///
/// Matching ignores case and a trailing dot. Questions for other names are
/// left to later handlers.
#[derive(Debug, Default)]
pub struct StaticHostHandler {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticHostHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration strings, skipping addresses that do not parse
    pub fn from_config(hosts: &std::collections::BTreeMap<String, Vec<String>>) -> Self {
        let mut handler = Self::new();
        for (name, addrs) in hosts {
            for addr in addrs {
                match addr.trim().parse::<IpAddr>() {
                    Ok(ip) => handler.add(name, ip),
                    Err(_) => {
                        warn!(name = %name, address = %addr, "Ignoring invalid host address")
                    }
                }
            }
        }
        handler
    }

    pub fn add(&mut self, name: &str, addr: IpAddr) {
        self.hosts.entry(normalize(name)).or_default().push(addr);
    }

    pub fn lookup(&self, name: &str) -> Option<&[IpAddr]> {
        self.hosts.get(&normalize(name)).map(Vec::as_slice)
    }

    /// Build the response for `request`, or `None` when nothing matches
    pub fn answer(&self, request: &Message) -> Option<Message> {
        let mut response = Message::new_response(request);
        for q in &request.questions {
            let Some(addrs) = self.lookup(&q.name) else {
                continue;
            };
            for addr in addrs {
                let added = match (q.qtype, addr) {
                    (RecordType::A | RecordType::ALL, IpAddr::V4(v4)) => {
                        response.add_answer_in_a(&q.name, &v4.to_string())
                    }
                    (RecordType::AAAA | RecordType::ALL, IpAddr::V6(v6)) => {
                        response.add_answer_in_aaaa(&q.name, &v6.to_string())
                    }
                    _ => continue,
                };
                if let Err(e) = added {
                    debug!(name = %q.name, error = %e, "LLMNR answer skipped");
                }
            }
        }
        if response.answers.is_empty() {
            None
        } else {
            Some(response)
        }
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

impl Handler for StaticHostHandler {
    fn run(
        &self,
        _server: &Server,
        remote: SocketAddr,
        writer: &ResponseWriter,
        msg: &mut Message,
    ) -> bool {
        if let Some(mut response) = self.answer(msg) {
            if let Err(e) = writer.write_message(&mut response) {
                warn!(client = %remote, error = %e, "LLMNR answer dropped");
            }
        }
        true
    }
}

/// Logs a timestamped one-line summary of every request and lets the chain
/// continue.
pub struct LogHandler {
    sink: Arc<dyn LogSink>,
}

impl LogHandler {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        LogHandler { sink }
    }
}

impl Handler for LogHandler {
    fn run(
        &self,
        _server: &Server,
        remote: SocketAddr,
        _writer: &ResponseWriter,
        msg: &mut Message,
    ) -> bool {
        let questions: Vec<String> = msg
            .questions
            .iter()
            .map(|q| format!("{} {}", q.name, q.qtype))
            .collect();
        self.sink.info_microseconds(&format!(
            "LLMNR request 0x{:04x} from {}: {}",
            msg.id,
            remote,
            questions.join(", ")
        ));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llmnr::message::FLAG_QR;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn hosts() -> StaticHostHandler {
        let mut handler = StaticHostHandler::new();
        handler.add("FileServer", IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)));
        handler.add("fileserver.", IpAddr::V6(Ipv6Addr::LOCALHOST));
        handler
    }

    #[test]
    fn test_static_host_case_insensitive() {
        let handler = hosts();
        assert_eq!(handler.lookup("FILESERVER").map(|a| a.len()), Some(2));
        assert!(handler.lookup("other").is_none());
    }

    #[test]
    fn test_static_host_answers_a() {
        let request = Message::new_query(5, "fileserver", RecordType::A);
        let response = hosts().answer(&request).unwrap();
        assert_eq!(response.id, 5);
        assert_eq!(response.flags & FLAG_QR, FLAG_QR);
        assert_eq!(response.questions.len(), 1);
        assert_eq!(response.answers.len(), 1);
        assert_eq!(response.answers[0].rdata, vec![192, 168, 1, 10]);
    }

    #[test]
    fn test_static_host_answers_aaaa() {
        let request = Message::new_query(6, "FileServer", RecordType::AAAA);
        let response = hosts().answer(&request).unwrap();
        assert_eq!(response.answers.len(), 1);
        assert_eq!(response.answers[0].rtype, RecordType::AAAA);
        assert_eq!(response.answers[0].rdata.len(), 16);
    }

    #[test]
    fn test_static_host_ignores_unknown() {
        let request = Message::new_query(7, "nobody", RecordType::A);
        assert!(hosts().answer(&request).is_none());
        let request = Message::new_query(8, "fileserver", RecordType::MX);
        assert!(hosts().answer(&request).is_none());
    }

    #[derive(Default)]
    struct RecordingSink {
        lines: parking_lot::Mutex<Vec<String>>,
    }

    impl LogSink for RecordingSink {
        fn debug(&self, msg: &str) {
            self.lines.lock().push(msg.to_string());
        }

        fn info_microseconds(&self, msg: &str) {
            self.lines.lock().push(msg.to_string());
        }

        fn lock(&self) -> crate::logging::SinkLock<'_> {
            crate::logging::SinkLock::unlocked()
        }
    }

    #[tokio::test]
    async fn test_log_handler_summarizes_and_continues() {
        let sink = Arc::new(RecordingSink::default());
        let handler = LogHandler::new(sink.clone());
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let remote = socket.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        let writer = ResponseWriter::new(socket, remote, rx);
        let mut msg = Message::new_query(0x00AB, "wpad", RecordType::A);

        assert!(handler.run(&Server::new("udp4"), remote, &writer, &mut msg));
        let lines = sink.lines.lock().clone();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("0x00ab"));
        assert!(lines[0].contains("wpad A"));
    }

    #[tokio::test]
    async fn test_writer_refuses_after_close() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let remote = socket.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let writer = ResponseWriter::new(socket, remote, rx);
        tx.send_replace(true);

        let mut msg = Message::new_query(1, "late", RecordType::A);
        assert!(matches!(writer.write_message(&mut msg), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_send_failure_is_reported_and_chain_continues() {
        // An IPv4 socket cannot reach an IPv6 peer
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let remote = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 5355);
        let (_tx, rx) = watch::channel(false);
        let writer = ResponseWriter::new(socket, remote, rx);

        let mut reply = Message::new_query(9, "fileserver", RecordType::A);
        assert!(matches!(writer.write_message(&mut reply), Err(Error::Io(_))));

        let mut msg = Message::new_query(9, "fileserver", RecordType::A);
        assert!(hosts().run(&Server::new("udp4"), remote, &writer, &mut msg));
    }

    #[test]
    fn test_from_config_skips_invalid() {
        let mut config = std::collections::BTreeMap::new();
        config.insert(
            "nas".to_string(),
            vec!["10.0.0.9".to_string(), "bogus".to_string()],
        );
        let handler = StaticHostHandler::from_config(&config);
        assert_eq!(handler.lookup("NAS").map(|a| a.len()), Some(1));
    }
}
