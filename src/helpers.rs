//! Helper functions for address conversion and socket setup.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};

/// Parse an IPv4 string into its 4 raw bytes
pub fn ipv4_to_rdata(addr: &str) -> Option<[u8; 4]> {
    addr.trim().parse::<Ipv4Addr>().ok().map(|ip| ip.octets())
}

/// Parse an IPv6 string into its 16 raw bytes
pub fn ipv6_to_rdata(addr: &str) -> Option<[u8; 16]> {
    addr.trim().parse::<Ipv6Addr>().ok().map(|ip| ip.octets())
}

/// Interpret RDATA as an IPv4 address (exactly 4 bytes)
pub fn rdata_to_ipv4(rdata: &[u8]) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = rdata.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

/// Bind a UDP socket on `port` for every address of the family and join `group`.
///
/// Address and port reuse are enabled so several responders (and the
/// operating system's own resolver) can share the well-known port.
pub fn bind_multicast(group: IpAddr, port: u16) -> std::io::Result<UdpSocket> {
    let (domain, bind_addr) = match group {
        IpAddr::V4(_) => (
            Domain::IPV4,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        ),
        IpAddr::V6(_) => (
            Domain::IPV6,
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        ),
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    if let IpAddr::V6(_) = group {
        socket.set_only_v6(true)?;
    }
    socket.bind(&bind_addr.into())?;

    // Interface selection is left to the operating system
    match group {
        IpAddr::V4(v4) => socket.join_multicast_v4(&v4, &Ipv4Addr::UNSPECIFIED)?,
        IpAddr::V6(v6) => socket.join_multicast_v6(&v6, 0)?,
    }

    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Bind a UDP socket with address reuse enabled (used for the NBNS port)
pub fn bind_udp_reuse(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(addr.is_ipv4())?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Apply TCP keep-alive to an accepted connection so dead peers are reaped
pub fn apply_tcp_keepalive(stream: &TcpStream, idle: Duration) -> std::io::Result<()> {
    let socket = SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(idle);
    socket.set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_specific_parsers() {
        assert_eq!(ipv4_to_rdata("10.0.0.1"), Some([10, 0, 0, 1]));
        assert!(ipv4_to_rdata("::1").is_none());
        assert!(ipv6_to_rdata("10.0.0.1").is_none());
        assert_eq!(ipv6_to_rdata("::1").map(|b| b[15]), Some(1));
        assert_eq!(ipv6_to_rdata("fe80::1").map(|b| [b[0], b[1]]), Some([0xfe, 0x80]));
        assert!(ipv4_to_rdata("300.1.1.1").is_none());
        assert!(ipv4_to_rdata("").is_none());
    }

    #[test]
    fn test_rdata_to_ipv4() {
        assert_eq!(
            rdata_to_ipv4(&[10, 0, 0, 2]),
            Some(Ipv4Addr::new(10, 0, 0, 2))
        );
        assert!(rdata_to_ipv4(&[10, 0, 0]).is_none());
        assert!(rdata_to_ipv4(&[0, 0, 10, 0, 0, 2]).is_none());
    }

    #[tokio::test]
    async fn test_bind_udp_reuse_loopback() {
        let socket = bind_udp_reuse("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
    }
}
