//! Stateless DCC helpers.
//!
//! Address conversion between the wire form and [`IpAddr`], the policy that
//! decides which address we announce to peers, and the listening-socket
//! factory used by both transfer directions.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::TcpStream;

use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::host::ServerLink;
use crate::transfer::ConnectionId;

/// Backlog for DCC listening sockets. Each socket serves one peer.
const LISTEN_BACKLOG: i32 = 1;

/// Converts an address to its DCC wire form.
///
/// IPv4 becomes the unsigned 32-bit decimal; IPv6 stays in text form.
#[must_use]
pub fn text_ip_to_numerical(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => u32::from(v4).to_string(),
        IpAddr::V6(v6) => v6.to_string(),
    }
}

/// Parses a DCC wire address.
///
/// Accepts the 32-bit decimal form, IPv6 text, and (leniently) dotted IPv4.
#[must_use]
pub fn numerical_ip_to_text(text: &str) -> Option<IpAddr> {
    let text = text.trim();
    if text.contains(':') || text.contains('.') {
        return text.parse().ok();
    }
    text.parse::<u32>().ok().map(|n| IpAddr::V4(Ipv4Addr::from(n)))
}

/// Picks the address to announce to a peer.
///
/// Order: the manual override, then the address the IRC server reported for
/// us (when enabled), then the address of the interface the IRC connection
/// uses, then whatever interface routes to the internet.
pub fn resolve_own_ip(
    network: &NetworkConfig,
    server: &dyn ServerLink,
    connection: Option<ConnectionId>,
) -> Option<IpAddr> {
    if let Some(ip) = network.own_ip {
        return Some(ip);
    }
    if let Some(connection) = connection {
        if network.use_server_reported_ip {
            if let Some(ip) = server.reported_own_ip(connection) {
                return Some(ip);
            }
        }
        if let Some(ip) = server.interface_ip(connection) {
            return Some(ip);
        }
    }
    local_interface_ip()
}

/// Address of the interface used for outbound traffic.
///
/// Connecting a UDP socket sends nothing; it only makes the OS choose a
/// route so the local address can be read back.
#[must_use]
pub fn local_interface_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// Binds a listening socket on every interface of the family of `own_ip`,
/// the address peers are told to connect to. IPv4 when unknown.
///
/// With a range, every port in it is tried in order and
/// [`Error::NoVacantPort`] is returned when all are taken. Without one the
/// OS picks a port.
pub fn bind_listener(
    own_ip: Option<IpAddr>,
    port_range: Option<(u16, u16)>,
) -> Result<std::net::TcpListener> {
    let any = match own_ip {
        Some(IpAddr::V6(_)) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    match port_range {
        Some((first, last)) => {
            for port in first..=last {
                match try_bind(SocketAddr::new(any, port)) {
                    Ok(listener) => return Ok(listener),
                    Err(e) => tracing::trace!(port, error = %e, "port unavailable"),
                }
            }
            Err(Error::NoVacantPort { first, last })
        }
        None => try_bind(SocketAddr::new(any, 0)).map_err(|e| Error::ListenFailed(e.to_string())),
    }
}

fn try_bind(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    #[cfg(unix)]
    socket.set_reuse_address(true)?;

    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Enables TCP keep-alive on a data socket.
pub(crate) fn configure_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    let socket_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));

    socket_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    tracing::debug!("TCP keep-alive enabled on socket");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DccMessage;

    struct NoServer;

    impl ServerLink for NoServer {
        fn send_dcc(&mut self, _: ConnectionId, _: &str, _: &DccMessage) -> Result<()> {
            Ok(())
        }
    }

    struct Reporting;

    impl ServerLink for Reporting {
        fn send_dcc(&mut self, _: ConnectionId, _: &str, _: &DccMessage) -> Result<()> {
            Ok(())
        }

        fn reported_own_ip(&self, _: ConnectionId) -> Option<IpAddr> {
            Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)))
        }

        fn interface_ip(&self, _: ConnectionId) -> Option<IpAddr> {
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)))
        }
    }

    #[test]
    fn test_ip_conversion() {
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(text_ip_to_numerical(ip), "3232235777");
        assert_eq!(numerical_ip_to_text("3232235777"), Some(ip));
        assert_eq!(numerical_ip_to_text("192.168.1.1"), Some(ip));

        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(text_ip_to_numerical(v6), "::1");
        assert_eq!(numerical_ip_to_text("::1"), Some(v6));

        assert_eq!(numerical_ip_to_text("4294967296"), None);
        assert_eq!(numerical_ip_to_text("host.example"), None);
    }

    #[test]
    fn test_own_ip_preference_order() {
        let mut network = NetworkConfig::default();
        let manual: IpAddr = "198.51.100.1".parse().unwrap();

        network.own_ip = Some(manual);
        assert_eq!(resolve_own_ip(&network, &Reporting, Some(1)), Some(manual));

        network.own_ip = None;
        assert_eq!(
            resolve_own_ip(&network, &Reporting, Some(1)),
            Some("203.0.113.9".parse().unwrap())
        );

        network.use_server_reported_ip = false;
        assert_eq!(
            resolve_own_ip(&network, &Reporting, Some(1)),
            Some("10.0.0.2".parse().unwrap())
        );

        // Falls through to the routing lookup, which may be unavailable offline.
        let fallback = resolve_own_ip(&network, &NoServer, Some(1));
        assert_eq!(fallback, local_interface_ip());
    }

    #[test]
    fn test_bind_listener_os_port() {
        let listener = bind_listener(None, None).expect("bind");
        let addr = listener.local_addr().expect("addr");
        assert_ne!(addr.port(), 0);
        assert!(addr.is_ipv4());
    }

    #[test]
    fn test_bind_listener_follows_own_address_family() {
        let v4 = bind_listener(Some("192.0.2.7".parse().unwrap()), None).expect("bind");
        assert!(v4.local_addr().expect("addr").is_ipv4());

        // Hosts without IPv6 cannot bind `::`; nothing to check there.
        if let Ok(v6) = bind_listener(Some(IpAddr::V6(Ipv6Addr::LOCALHOST)), None) {
            let addr = v6.local_addr().expect("addr");
            assert!(addr.is_ipv6());
            assert!(addr.ip().is_unspecified());
        }
    }

    #[test]
    fn test_bind_listener_range_exhausted() {
        let taken = bind_listener(None, None).expect("bind");
        let port = taken.local_addr().expect("addr").port();

        let result = bind_listener(None, Some((port, port)));
        assert!(matches!(
            result,
            Err(Error::NoVacantPort { first, last }) if first == port && last == port
        ));
    }
}
