//! Link-Local Multicast Name Resolution (RFC 4795).

pub mod client;
pub mod handler;
pub mod message;
pub mod server;

use std::net::{Ipv4Addr, Ipv6Addr};

/// UDP port for LLMNR queries and responses
pub const LLMNR_PORT: u16 = 5355;
/// IPv4 link-local multicast group
pub const LLMNR_IPV4_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 252);
/// IPv6 link-local multicast group
pub const LLMNR_IPV6_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 3);

pub use client::Client;
pub use handler::{Handler, LogHandler, ResponseWriter, StaticHostHandler};
pub use message::{Class, Message, Question, RecordType, ResourceRecord};
pub use server::{Server, ServerState};
