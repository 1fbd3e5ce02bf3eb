//! Scope-based redirection of name queries to another name server.

use crate::config::RedirectConfig;
use crate::error::{Error, Result};
use crate::nbns::packet::{
    Opcode, Packet, ResourceRecord, CLASS_IN, FLAG_RESPONSE, TYPE_NB,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::debug;

/// TTL of the redirect record
pub const REDIRECT_TTL: u32 = 600;

#[derive(Debug, Default)]
pub struct RedirectManager {
    targets: RwLock<HashMap<String, (Ipv4Addr, u16)>>,
}

impl RedirectManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(redirects: &[RedirectConfig]) -> Result<Self> {
        let manager = Self::new();
        for redirect in redirects {
            let server: Ipv4Addr = redirect
                .server
                .trim()
                .parse()
                .map_err(|_| Error::InvalidAddress(redirect.server.clone()))?;
            manager.add(&redirect.scope, server, redirect.port);
        }
        Ok(manager)
    }

    /// Redirect queries for names in `scope` (case-insensitive)
    pub fn add(&self, scope: &str, server: Ipv4Addr, port: u16) {
        self.targets
            .write()
            .insert(scope.to_ascii_lowercase(), (server, port));
    }

    pub fn remove(&self, scope: &str) -> bool {
        self.targets
            .write()
            .remove(&scope.to_ascii_lowercase())
            .is_some()
    }

    pub fn target(&self, scope: &str) -> Option<(Ipv4Addr, u16)> {
        self.targets
            .read()
            .get(&scope.to_ascii_lowercase())
            .copied()
    }

    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.read().is_empty()
    }

    /// Rewrite `response` into a redirect when the first question of a
    /// query carries a configured scope. Returns true when it did.
    pub fn handle_redirect(&self, request: &Packet, response: &mut Packet) -> bool {
        if request.opcode() != Opcode::Query {
            return false;
        }
        let Some(question) = request.questions.first() else {
            return false;
        };
        let Some(scope) = question.name.scope() else {
            return false;
        };
        let Some((server, port)) = self.target(scope) else {
            return false;
        };

        let mut rdata = server.octets().to_vec();
        rdata.extend_from_slice(&port.to_be_bytes());

        response.flags = FLAG_RESPONSE | Opcode::Redirect.bits();
        response.additional = vec![ResourceRecord {
            name: question.name.clone(),
            rtype: TYPE_NB,
            class: CLASS_IN,
            ttl: REDIRECT_TTL,
            rdata,
        }];
        debug!(name = %question.name, server = %server, port = port, "NBNS query redirected");
        true
    }
}
