//! Socket activation for inetd-type records.
//!
//! An inetd record in RUNNING state means its listening socket is registered
//! with the event loop; no process exists until traffic arrives. `nowait`
//! services get one child per accepted connection, `wait` services get the
//! listening socket itself and the record is re-armed when the child exits.
//! Built-in echo (RFC 862) and time (RFC 868) handlers run in-process.

use std::ffi::CString;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::AsRawFd;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::config::{IfaceRule, InetdConf, InetdProto};

/// Offset between the RFC 868 epoch (1900) and the Unix epoch (1970).
const RFC868_EPOCH_OFFSET: u32 = 2_208_988_800;

/// A bound inetd listening socket.
#[derive(Debug)]
pub enum InetdSocket {
    /// Stream listener.
    Tcp(TcpListener),
    /// Datagram socket.
    Udp(UdpSocket),
}

impl InetdSocket {
    /// Raw descriptor for event-loop registration.
    pub fn raw_fd(&self) -> i32 {
        match self {
            InetdSocket::Tcp(listener) => listener.as_raw_fd(),
            InetdSocket::Udp(socket) => socket.as_raw_fd(),
        }
    }
}

/// Binds the listening socket for an inetd record on the wildcard address.
pub fn open_socket(conf: &InetdConf) -> io::Result<InetdSocket> {
    let port = resolve_port(conf).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("unknown service '{}/{}'", conf.svc, conf.proto),
        )
    })?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = match conf.proto {
        InetdProto::Tcp => {
            let listener = TcpListener::bind(addr)?;
            listener.set_nonblocking(true)?;
            InetdSocket::Tcp(listener)
        }
        InetdProto::Udp => {
            let socket = UdpSocket::bind(addr)?;
            socket.set_nonblocking(true)?;
            InetdSocket::Udp(socket)
        }
    };
    debug!("inetd {}/{} bound to port {port}", conf.svc, conf.proto);
    Ok(socket)
}

/// Resolves the service field to a port: numeric first, then the system
/// services database.
pub fn resolve_port(conf: &InetdConf) -> Option<u16> {
    if let Some(port) = conf.port {
        return Some(port);
    }

    let name = CString::new(conf.svc.as_str()).ok()?;
    let proto = CString::new(conf.proto.to_string()).ok()?;
    // Safety: getservbyname returns a pointer into static libc storage that
    // is only read before the next call.
    let entry = unsafe { libc::getservbyname(name.as_ptr(), proto.as_ptr()) };
    if entry.is_null() {
        return None;
    }
    let port = unsafe { (*entry).s_port };
    Some(u16::from_be(port as u16))
}

/// Applies the allow/deny interface rules to the interface a connection
/// arrived on. Rules are checked in declaration order and the first match
/// wins; with no matching rule, the connection is accepted only when no
/// allow rules exist at all.
pub fn iface_allowed(filters: &[IfaceRule], iface: &str) -> bool {
    for rule in filters {
        if rule.iface == iface {
            return rule.allow;
        }
    }
    !filters.iter().any(|rule| rule.allow)
}

/// Maps the local address a connection was accepted on to the interface
/// that owns it.
pub fn local_iface(local: &SocketAddr) -> Option<String> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifaddr in addrs {
        let Some(storage) = ifaddr.address else {
            continue;
        };
        let matches = match local {
            SocketAddr::V4(v4) => storage
                .as_sockaddr_in()
                .is_some_and(|sin| sin.ip() == *v4.ip()),
            SocketAddr::V6(v6) => storage
                .as_sockaddr_in6()
                .is_some_and(|sin6| sin6.ip() == *v6.ip()),
        };
        if matches {
            return Some(ifaddr.interface_name);
        }
    }
    None
}

/// Whether a connection on `local` passes the record's filters.
pub fn accept_allowed(filters: &[IfaceRule], local: &SocketAddr) -> bool {
    if filters.is_empty() {
        return true;
    }
    match local_iface(local) {
        Some(iface) => iface_allowed(filters, &iface),
        // Interface unknown (e.g. address vanished mid-accept): treat like
        // an unmatched rule set.
        None => !filters.iter().any(|rule| rule.allow),
    }
}

/// Seconds since 1900 in network byte order, per RFC 868.
fn rfc868_now() -> [u8; 4] {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    unix.wrapping_add(RFC868_EPOCH_OFFSET).to_be_bytes()
}

/// Built-in handler for one accepted TCP connection.
pub fn serve_builtin_stream(svc: &str, mut stream: TcpStream) {
    let result = match svc {
        "echo" => {
            let mut buf = [0u8; 4096];
            match stream.read(&mut buf) {
                Ok(n) if n > 0 => stream.write_all(&buf[..n]),
                Ok(_) => Ok(()),
                Err(err) => Err(err),
            }
        }
        "time" => stream.write_all(&rfc868_now()),
        other => {
            warn!("no built-in inetd handler for '{other}'");
            Ok(())
        }
    };
    if let Err(err) = result {
        debug!("inetd builtin '{svc}' failed: {err}");
    }
}

/// Built-in handler for one UDP datagram.
pub fn serve_builtin_dgram(svc: &str, socket: &UdpSocket) {
    let mut buf = [0u8; 4096];
    let Ok((len, peer)) = socket.recv_from(&mut buf) else {
        return;
    };
    let result = match svc {
        "echo" => socket.send_to(&buf[..len], peer).map(|_| ()),
        "time" => socket.send_to(&rfc868_now(), peer).map(|_| ()),
        other => {
            warn!("no built-in inetd handler for '{other}'");
            Ok(())
        }
    };
    if let Err(err) = result {
        debug!("inetd builtin '{svc}' failed: {err}");
    }
}
