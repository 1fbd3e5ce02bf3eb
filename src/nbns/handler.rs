//! Request processing shared by the NBNS UDP and TCP servers.

use crate::error::RegistryError;
use crate::logging::{dump, LogSink, TracingSink};
use crate::nbns::challenger::{defend_name, Challenger};
use crate::nbns::name::NetBiosName;
use crate::nbns::packet::{
    Opcode, Packet, Rcode, ResourceRecord, FLAG_AUTHORITATIVE, FLAG_GROUP, FLAG_RESPONSE,
    TYPE_NB,
};
use crate::nbns::redirect::RedirectManager;
use crate::nbns::registry::{NameType, Registry};
use crate::nbns::NAME_QUERY_TTL;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifetime given to registrations that ask for TTL 0 ("infinite")
const ZERO_TTL_LIFETIME: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub struct PacketHandler {
    registry: Arc<Registry>,
    challenger: Option<Arc<Challenger>>,
    redirects: Option<Arc<RedirectManager>>,
    lenient_release: bool,
    debug: bool,
    sink: Arc<dyn LogSink>,
}

impl PacketHandler {
    pub fn new(registry: Arc<Registry>) -> Self {
        PacketHandler {
            registry,
            challenger: None,
            redirects: None,
            lenient_release: false,
            debug: false,
            sink: Arc::new(TracingSink::new()),
        }
    }

    /// Challenge the current owner before refusing a unique registration
    pub fn with_challenger(mut self, challenger: Arc<Challenger>) -> Self {
        self.challenger = Some(challenger);
        self
    }

    pub fn with_redirects(mut self, redirects: Arc<RedirectManager>) -> Self {
        self.redirects = Some(redirects);
        self
    }

    /// Treat release of an unknown name or owner as success
    pub fn with_lenient_release(mut self, lenient: bool) -> Self {
        self.lenient_release = lenient;
        self
    }

    /// Dump every request through `sink`
    pub fn with_debug(mut self, enabled: bool, sink: Arc<dyn LogSink>) -> Self {
        self.debug = enabled;
        self.sink = sink;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Process one decoded request. `None` means nothing should be sent.
    pub async fn handle(&self, request: &Packet, src: SocketAddr) -> Option<Packet> {
        if request.is_response() {
            debug!(client = %src, id = request.transaction_id, "NBNS ignoring response packet");
            return None;
        }
        if self.debug {
            dump(
                self.sink.as_ref(),
                &format!("NBNS {} from {}", request.opcode(), src),
                &request.describe(),
            );
        }

        let mut response = Packet {
            transaction_id: request.transaction_id,
            flags: FLAG_RESPONSE | FLAG_AUTHORITATIVE | request.opcode().bits(),
            questions: request.questions.clone(),
            ..Default::default()
        };

        match request.opcode() {
            Opcode::Query if request.is_broadcast() => {
                // Broadcast queries only get answers for names held here
                let mut defence = Packet::default();
                return defend_name(&self.registry, request, &mut defence).then_some(defence);
            }
            Opcode::Query => {
                if let Some(redirects) = &self.redirects {
                    if redirects.handle_redirect(request, &mut response) {
                        return Some(response);
                    }
                }
                self.answer_query(request, &mut response);
            }
            Opcode::Registration | Opcode::MultiHomedRegistration => {
                self.register(request, &mut response, src).await;
            }
            Opcode::Release => self.release(request, &mut response, src),
            Opcode::Refresh => self.refresh(request, &mut response, src),
            Opcode::Conflict => self.mark_conflicts(request, src),
            other => {
                debug!(client = %src, opcode = %other, "NBNS opcode not implemented");
                response.set_rcode(Rcode::NotImplemented);
            }
        }
        Some(response)
    }

    fn answer_query(&self, request: &Packet, response: &mut Packet) {
        for question in &request.questions {
            if question.qtype != TYPE_NB {
                response.set_rcode(Rcode::NotImplemented);
                continue;
            }
            match self.registry.query(&question.name) {
                Ok((owners, name_type)) => {
                    if name_type == NameType::Group {
                        response.flags |= FLAG_GROUP;
                    }
                    for owner in owners {
                        response.answers.push(ResourceRecord {
                            name: question.name.clone(),
                            rtype: question.qtype,
                            class: question.class,
                            ttl: NAME_QUERY_TTL,
                            rdata: owner.octets().to_vec(),
                        });
                    }
                }
                Err(_) => response.set_rcode(Rcode::NameError),
            }
        }
    }

    async fn register(&self, request: &Packet, response: &mut Packet, src: SocketAddr) {
        for rr in registration_records(request) {
            let owner = match rr.address() {
                Ok(owner) => owner,
                Err(e) => {
                    debug!(client = %src, name = %rr.name, error = %e, "NBNS registration without address");
                    response.set_rcode(Rcode::FormatError);
                    continue;
                }
            };
            let name_type = if request.is_group() || rr.nb_group_flag() == Some(true) {
                NameType::Group
            } else {
                NameType::Unique
            };
            let ttl = match rr.ttl {
                0 => ZERO_TTL_LIFETIME,
                secs => Duration::from_secs(u64::from(secs)),
            };

            let outcome = self.registry.register(&rr.name, name_type, owner, ttl);
            if matches!(outcome, Err(RegistryError::Conflict(_)))
                && name_type == NameType::Unique
                && self.take_over_unique(&rr.name, owner, ttl).await
            {
                info!(client = %src, name = %rr.name, owner = %owner, "NBNS name taken over after challenge");
                continue;
            }
            match outcome {
                Ok(()) => {
                    info!(client = %src, name = %rr.name, owner = %owner, kind = ?name_type, "NBNS name registered");
                }
                Err(e) => {
                    warn!(client = %src, name = %rr.name, owner = %owner, error = %e, "NBNS registration refused");
                    response.set_rcode(Rcode::Conflict);
                }
            }
        }
    }

    /// Challenge the holder of a unique name; move it to `owner` if the
    /// holder no longer claims it.
    async fn take_over_unique(&self, name: &NetBiosName, owner: Ipv4Addr, ttl: Duration) -> bool {
        let Some(challenger) = &self.challenger else {
            return false;
        };
        let Some(record) = self.registry.record(name) else {
            return false;
        };
        if record.name_type != NameType::Unique {
            return false;
        }
        let Some(&holder) = record.owners.first() else {
            return false;
        };

        match challenger.challenge_ownership(name, holder).await {
            Ok(true) => false,
            Ok(false) => self.registry.reassign(name, holder, owner, ttl).is_ok(),
            Err(e) => {
                warn!(name = %name, holder = %holder, error = %e, "NBNS challenge failed");
                false
            }
        }
    }

    fn release(&self, request: &Packet, response: &mut Packet, src: SocketAddr) {
        for rr in registration_records(request) {
            let result = rr
                .address()
                .map_err(|e| e.to_string())
                .and_then(|owner| {
                    self.registry
                        .release(&rr.name, owner)
                        .map_err(|e| e.to_string())
                        .or_else(|msg| {
                            if self.lenient_release {
                                Ok(())
                            } else {
                                Err(msg)
                            }
                        })
                });
            match result {
                Ok(()) => info!(client = %src, name = %rr.name, "NBNS name released"),
                Err(e) => {
                    warn!(client = %src, name = %rr.name, error = %e, "NBNS release failed");
                    response.set_rcode(Rcode::ServerError);
                }
            }
        }
    }

    fn refresh(&self, request: &Packet, response: &mut Packet, src: SocketAddr) {
        for rr in registration_records(request) {
            let result = rr
                .address()
                .map_err(|e| e.to_string())
                .and_then(|owner| {
                    self.registry
                        .refresh(&rr.name, owner)
                        .map_err(|e| e.to_string())
                });
            if let Err(e) = result {
                warn!(client = %src, name = %rr.name, error = %e, "NBNS refresh failed");
                response.set_rcode(Rcode::ServerError);
            }
        }
    }

    fn mark_conflicts(&self, request: &Packet, src: SocketAddr) {
        let names = request
            .questions
            .iter()
            .map(|q| &q.name)
            .chain(registration_records(request).iter().map(|rr| &rr.name));
        for name in names {
            match self.registry.mark_conflict(name) {
                Ok(()) => warn!(client = %src, name = %name, "NBNS name marked in conflict"),
                Err(e) => debug!(client = %src, error = %e, "NBNS conflict demand for unknown name"),
            }
        }
    }
}

/// Records carrying name/owner pairs: the answer section, or the additional
/// section as RFC 1002 clients send them.
fn registration_records(request: &Packet) -> &[ResourceRecord] {
    if request.answers.is_empty() {
        &request.additional
    } else {
        &request.answers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nbns::packet::{FLAG_BROADCAST, FLAG_TRUNCATED};

    fn name(n: &str) -> NetBiosName {
        NetBiosName::new(n, None).unwrap()
    }

    fn src() -> SocketAddr {
        "10.0.0.99:137".parse().unwrap()
    }

    fn request(opcode: Opcode, n: &str, owner: Ipv4Addr) -> Packet {
        Packet {
            transaction_id: 0x4242,
            flags: opcode.bits(),
            questions: vec![crate::nbns::packet::Question::nb(name(n))],
            additional: vec![ResourceRecord::nb(name(n), 3600, owner)],
            ..Default::default()
        }
    }

    fn handler() -> PacketHandler {
        PacketHandler::new(Arc::new(Registry::new()))
    }

    #[tokio::test]
    async fn test_registration_then_query() {
        let handler = handler();
        let owner = Ipv4Addr::new(10, 0, 0, 1);

        let response = handler
            .handle(&request(Opcode::Registration, "HOST", owner), src())
            .await
            .unwrap();
        assert_eq!(response.rcode(), 0);
        assert_eq!(response.transaction_id, 0x4242);
        assert!(response.is_response());
        assert_eq!(response.flags & FLAG_AUTHORITATIVE, FLAG_AUTHORITATIVE);

        let query = Packet::new_query(9, name("HOST"));
        let response = handler.handle(&query, src()).await.unwrap();
        assert_eq!(response.rcode(), 0);
        assert_eq!(response.questions.len(), 1);
        assert_eq!(response.answers.len(), 1);
        assert_eq!(response.answers[0].ttl, 86400);
        assert_eq!(response.answers[0].rdata, vec![10, 0, 0, 1]);
        assert!(!response.is_group());
    }

    #[tokio::test]
    async fn test_query_unknown_is_name_error() {
        let response = handler()
            .handle(&Packet::new_query(1, name("NOBODY")), src())
            .await
            .unwrap();
        assert_eq!(Rcode::from_flags(response.flags), Some(Rcode::NameError));
        assert!(response.answers.is_empty());
    }

    #[tokio::test]
    async fn test_unique_conflict_sets_rcode() {
        let handler = handler();
        handler
            .handle(&request(Opcode::Registration, "HOST", Ipv4Addr::new(10, 0, 0, 1)), src())
            .await;
        let response = handler
            .handle(&request(Opcode::Registration, "HOST", Ipv4Addr::new(10, 0, 0, 2)), src())
            .await
            .unwrap();
        assert_eq!(Rcode::from_flags(response.flags), Some(Rcode::Conflict));
    }

    #[tokio::test]
    async fn test_group_registration_sets_group_bit_on_query() {
        let handler = handler();
        for last in [1, 2] {
            let mut req = request(Opcode::Registration, "TEAM", Ipv4Addr::new(10, 0, 0, last));
            req.flags |= FLAG_GROUP;
            handler.handle(&req, src()).await;
        }
        let response = handler
            .handle(&Packet::new_query(3, name("TEAM")), src())
            .await
            .unwrap();
        assert!(response.is_group());
        assert_eq!(response.answers.len(), 2);
    }

    #[tokio::test]
    async fn test_six_byte_rdata_group_flag() {
        let handler = handler();
        let mut req = request(Opcode::MultiHomedRegistration, "TEAM", Ipv4Addr::UNSPECIFIED);
        req.additional[0].rdata = vec![0x80, 0x00, 10, 0, 0, 3];
        handler.handle(&req, src()).await;

        let (owners, kind) = handler.registry().query(&name("TEAM")).unwrap();
        assert_eq!(owners, vec![Ipv4Addr::new(10, 0, 0, 3)]);
        assert_eq!(kind, NameType::Group);
    }

    #[tokio::test]
    async fn test_release_and_refresh_errors() {
        let handler = handler();
        let owner = Ipv4Addr::new(10, 0, 0, 1);

        let response = handler
            .handle(&request(Opcode::Release, "HOST", owner), src())
            .await
            .unwrap();
        assert_eq!(Rcode::from_flags(response.flags), Some(Rcode::ServerError));

        let response = handler
            .handle(&request(Opcode::Refresh, "HOST", owner), src())
            .await
            .unwrap();
        assert_eq!(Rcode::from_flags(response.flags), Some(Rcode::ServerError));

        handler
            .handle(&request(Opcode::Registration, "HOST", owner), src())
            .await;
        let response = handler
            .handle(&request(Opcode::Refresh, "HOST", owner), src())
            .await
            .unwrap();
        assert_eq!(response.rcode(), 0);
        let response = handler
            .handle(&request(Opcode::Release, "HOST", owner), src())
            .await
            .unwrap();
        assert_eq!(response.rcode(), 0);
        assert!(handler.registry().is_empty());
    }

    #[tokio::test]
    async fn test_lenient_release() {
        let handler = handler().with_lenient_release(true);
        let response = handler
            .handle(&request(Opcode::Release, "HOST", Ipv4Addr::new(10, 0, 0, 1)), src())
            .await
            .unwrap();
        assert_eq!(response.rcode(), 0);
    }

    #[tokio::test]
    async fn test_conflict_demand_hides_name() {
        let handler = handler();
        let owner = Ipv4Addr::new(10, 0, 0, 1);
        handler
            .handle(&request(Opcode::Registration, "HOST", owner), src())
            .await;
        handler
            .handle(&request(Opcode::Conflict, "HOST", owner), src())
            .await;

        let response = handler
            .handle(&Packet::new_query(2, name("HOST")), src())
            .await
            .unwrap();
        assert_eq!(Rcode::from_flags(response.flags), Some(Rcode::NameError));
    }

    #[tokio::test]
    async fn test_unknown_opcode_not_implemented() {
        let mut req = Packet::new_query(1, name("HOST"));
        req.flags = Opcode::Wack.bits();
        let response = handler().handle(&req, src()).await.unwrap();
        assert_eq!(Rcode::from_flags(response.flags), Some(Rcode::NotImplemented));
        assert_eq!(response.flags & FLAG_TRUNCATED, 0);
    }

    #[tokio::test]
    async fn test_broadcast_query_only_defends() {
        let handler = handler();
        let mut query = Packet::new_query(1, name("NOBODY"));
        query.flags |= FLAG_BROADCAST;
        assert!(handler.handle(&query, src()).await.is_none());

        handler
            .handle(&request(Opcode::Registration, "HOST", Ipv4Addr::new(10, 0, 0, 1)), src())
            .await;
        let mut query = Packet::new_query(2, name("HOST"));
        query.flags |= FLAG_BROADCAST;
        let response = handler.handle(&query, src()).await.unwrap();
        assert_eq!(response.transaction_id, 2);
        assert_eq!(response.answers.len(), 1);
    }

    #[tokio::test]
    async fn test_responses_are_ignored() {
        let mut packet = Packet::new_query(1, name("HOST"));
        packet.flags |= FLAG_RESPONSE;
        assert!(handler().handle(&packet, src()).await.is_none());
    }

    #[tokio::test]
    async fn test_redirect_short_circuits_query() {
        let redirects = Arc::new(RedirectManager::new());
        redirects.add("corp", Ipv4Addr::new(10, 9, 9, 9), 137);
        let handler = handler().with_redirects(redirects);

        let query = Packet::new_query(4, NetBiosName::new("HOST", Some("corp")).unwrap());
        let response = handler.handle(&query, src()).await.unwrap();
        assert_eq!(response.opcode(), Opcode::Redirect);
        assert_eq!(response.additional[0].rdata, vec![10, 9, 9, 9, 0, 137]);
    }
}
