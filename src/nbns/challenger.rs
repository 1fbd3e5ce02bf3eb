//! Active ownership checks for unique names, and defence of names held in
//! the local registry against broadcast queries.

use crate::config::ChallengeConfig;
use crate::error::Result;
use crate::nbns::name::NetBiosName;
use crate::nbns::packet::{
    Packet, Rcode, ResourceRecord, FLAG_AUTHORITATIVE, FLAG_GROUP, FLAG_RESPONSE, TYPE_NB,
};
use crate::nbns::registry::{NameType, Registry};
use crate::nbns::{NAME_QUERY_TTL, NBNS_PORT};
use crate::txid::{IdSource, RandomIds};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

/// Upper bound on queries sent per challenge
pub const MAX_CHALLENGE_ATTEMPTS: u32 = 3;
pub const DEFAULT_CHALLENGE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Challenger {
    port: u16,
    timeout: Duration,
    attempts: u32,
    ids: Arc<dyn IdSource>,
}

impl Default for Challenger {
    fn default() -> Self {
        Challenger {
            port: NBNS_PORT,
            timeout: DEFAULT_CHALLENGE_TIMEOUT,
            attempts: MAX_CHALLENGE_ATTEMPTS,
            ids: Arc::new(RandomIds),
        }
    }
}

impl Challenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ChallengeConfig) -> Self {
        Challenger::new()
            .with_port(config.port)
            .with_timeout(Duration::from_millis(config.timeout_ms))
            .with_attempts(config.attempts)
    }

    /// Port queried on the putative owner
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Wait per attempt
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of sends, clamped to 1..=3
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.clamp(1, MAX_CHALLENGE_ATTEMPTS);
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdSource>) -> Self {
        self.ids = ids;
        self
    }

    /// Ask `owner` whether it still holds `name`.
    ///
    /// Returns `Ok(true)` only when the owner answers with its own address.
    /// A negative answer, a response without that address, or silence on
    /// every attempt all mean the name is free.
    pub async fn challenge_ownership(&self, name: &NetBiosName, owner: Ipv4Addr) -> Result<bool> {
        let target = SocketAddr::from((owner, self.port));
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
        socket.connect(target).await?;

        let id = self.ids.next_id();
        let request = Packet::new_query(id, name.clone()).encode()?;
        let mut buf = [0u8; 576];

        for attempt in 1..=self.attempts {
            socket.send(&request).await?;
            debug!(name = %name, owner = %owner, attempt = attempt, "NBNS challenge sent");

            let len = match tokio::time::timeout(self.timeout, socket.recv(&mut buf)).await {
                Ok(Ok(len)) => len,
                Ok(Err(e)) => {
                    debug!(owner = %owner, error = %e, "NBNS challenge receive failed");
                    continue;
                }
                Err(_) => continue,
            };

            let response = match Packet::decode(&buf[..len]) {
                Ok(response) => response,
                Err(e) => {
                    debug!(owner = %owner, error = %e, "NBNS challenge response malformed");
                    continue;
                }
            };
            if response.transaction_id != id {
                debug!(owner = %owner, expected = id, got = response.transaction_id, "NBNS challenge ID mismatch");
                continue;
            }
            if response.rcode() == Rcode::NameError as u16 {
                return Ok(false);
            }
            let claimed = response
                .answers
                .iter()
                .any(|rr| rr.address().is_ok_and(|addr| addr == owner));
            return Ok(claimed);
        }

        debug!(name = %name, owner = %owner, "NBNS challenge unanswered, assuming released");
        Ok(false)
    }
}

/// Answer the questions of `request` for names held in `registry`.
///
/// Fills `response` with one NB record per owner and returns whether any
/// name was defended.
pub fn defend_name(registry: &Registry, request: &Packet, response: &mut Packet) -> bool {
    let mut defended = false;
    response.transaction_id = request.transaction_id;
    response.flags = FLAG_RESPONSE | FLAG_AUTHORITATIVE;

    for question in &request.questions {
        if question.qtype != TYPE_NB {
            continue;
        }
        let Ok((owners, name_type)) = registry.query(&question.name) else {
            continue;
        };
        if name_type == NameType::Group {
            response.flags |= FLAG_GROUP;
        }
        response.answers.extend(
            owners
                .into_iter()
                .map(|owner| ResourceRecord::nb(question.name.clone(), NAME_QUERY_TTL, owner)),
        );
        defended = true;
    }
    defended
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txid::SequentialIds;

    fn name(n: &str) -> NetBiosName {
        NetBiosName::new(n, None).unwrap()
    }

    async fn fake_owner() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    fn challenger(port: u16) -> Challenger {
        Challenger::new()
            .with_port(port)
            .with_timeout(Duration::from_millis(100))
            .with_ids(Arc::new(SequentialIds::starting_at(500)))
    }

    #[tokio::test]
    async fn test_owner_confirms() {
        let (owner, port) = fake_owner().await;
        tokio::spawn(async move {
            let mut buf = [0u8; 576];
            let (len, from) = owner.recv_from(&mut buf).await.unwrap();
            let request = Packet::decode(&buf[..len]).unwrap();
            let mut response = Packet {
                transaction_id: request.transaction_id,
                flags: FLAG_RESPONSE | FLAG_AUTHORITATIVE,
                ..Default::default()
            };
            response.answers.push(ResourceRecord::nb(
                request.questions[0].name.clone(),
                300,
                Ipv4Addr::LOCALHOST,
            ));
            owner.send_to(&response.encode().unwrap(), from).await.unwrap();
        });

        let held = challenger(port)
            .challenge_ownership(&name("HOST"), Ipv4Addr::LOCALHOST)
            .await
            .unwrap();
        assert!(held);
    }

    #[tokio::test]
    async fn test_owner_denies_with_name_error() {
        let (owner, port) = fake_owner().await;
        tokio::spawn(async move {
            let mut buf = [0u8; 576];
            let (len, from) = owner.recv_from(&mut buf).await.unwrap();
            let request = Packet::decode(&buf[..len]).unwrap();
            let mut response = Packet {
                transaction_id: request.transaction_id,
                flags: FLAG_RESPONSE,
                ..Default::default()
            };
            response.set_rcode(Rcode::NameError);
            owner.send_to(&response.encode().unwrap(), from).await.unwrap();
        });

        let held = challenger(port)
            .challenge_ownership(&name("HOST"), Ipv4Addr::LOCALHOST)
            .await
            .unwrap();
        assert!(!held);
    }

    #[tokio::test]
    async fn test_mismatched_id_then_silence() {
        let (owner, port) = fake_owner().await;
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 576];
            let mut received = 0;
            while let Ok(Ok((len, from))) =
                tokio::time::timeout(Duration::from_millis(500), owner.recv_from(&mut buf)).await
            {
                received += 1;
                let request = Packet::decode(&buf[..len]).unwrap();
                let mut wrong = Packet::new_query(request.transaction_id ^ 0xFFFF, name("HOST"));
                wrong.flags = FLAG_RESPONSE;
                owner.send_to(&wrong.encode().unwrap(), from).await.unwrap();
            }
            received
        });

        let held = challenger(port)
            .challenge_ownership(&name("HOST"), Ipv4Addr::LOCALHOST)
            .await
            .unwrap();
        assert!(!held);
        assert_eq!(responder.await.unwrap(), 3);
    }

    #[test]
    fn test_attempts_are_clamped() {
        assert_eq!(Challenger::new().with_attempts(10).attempts, 3);
        assert_eq!(Challenger::new().with_attempts(0).attempts, 1);
    }

    #[test]
    fn test_defend_name() {
        let registry = Registry::new();
        registry
            .register(&name("SHARE"), NameType::Group, Ipv4Addr::new(10, 0, 0, 1), Duration::from_secs(60))
            .unwrap();
        registry
            .register(&name("SHARE"), NameType::Group, Ipv4Addr::new(10, 0, 0, 2), Duration::from_secs(60))
            .unwrap();

        let request = Packet::new_query(77, name("SHARE"));
        let mut response = Packet::default();
        assert!(defend_name(&registry, &request, &mut response));
        assert_eq!(response.transaction_id, 77);
        assert_eq!(response.flags, FLAG_RESPONSE | FLAG_AUTHORITATIVE | FLAG_GROUP);
        assert_eq!(response.answers.len(), 2);
        assert_eq!(response.answers[0].ttl, 86400);

        let unknown = Packet::new_query(78, name("NOBODY"));
        let mut response = Packet::default();
        assert!(!defend_name(&registry, &unknown, &mut response));
        assert!(response.answers.is_empty());
    }
}
