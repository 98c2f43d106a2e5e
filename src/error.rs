use std::fmt::Formatter;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};

/// Errors surfaced to callers of client and server operations.
///
/// Malformed or unexpected frames are never reported here, they are dropped.
/// A punch that simply does not get through is `Ok(None)`, not an error.
#[derive(Debug)]
pub enum Error {
    /// send/receive failure other than a timeout
    Io(std::io::Error),
    /// the transport accepted fewer bytes than a full frame
    SocketSend { sent: usize, expected: usize },
    /// only IPv4 endpoints take part in punching
    NotIpv4(IpAddr),
    /// no candidate rendezvous server was configured
    NoServers,
    /// a rendezvous server never acknowledged our registration
    ServerNotReachable(SocketAddrV4),
    /// the transport was closed or never bound
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "transport error: {}", err),
            Error::SocketSend { sent, expected } => {
                write!(f, "short send: {} of {} bytes", sent, expected)
            }
            Error::NotIpv4(addr) => write!(
                f,
                "{} is not IPv4, only IPv4 addresses can be punched",
                addr
            ),
            Error::NoServers => write!(f, "no IPv4 rendezvous server endpoint"),
            Error::ServerNotReachable(addr) => {
                write!(f, "rendezvous server {} did not respond", addr)
            }
            Error::Closed => write!(f, "transport closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<Error> for std::io::Error {
    fn from(val: Error) -> Self {
        match val {
            Error::Io(err) => err,
            Error::Closed => std::io::Error::from(std::io::ErrorKind::NotConnected),
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// Require an IPv4 endpoint.
pub(crate) fn ipv4(addr: SocketAddr) -> Result<SocketAddrV4> {
    match addr {
        SocketAddr::V4(addr) => Ok(addr),
        SocketAddr::V6(addr) => Err(Error::NotIpv4(IpAddr::V6(*addr.ip()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_roundtrip_keeps_kind() {
        let err: Error = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        let io: std::io::Error = err.into();
        assert_eq!(io.kind(), std::io::ErrorKind::PermissionDenied);

        let io: std::io::Error = Error::Closed.into();
        assert_eq!(io.kind(), std::io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_ipv6_rejected() {
        let v6: SocketAddr = "[::1]:6776".parse().unwrap();
        assert!(matches!(ipv4(v6), Err(Error::NotIpv4(_))));

        let v4: SocketAddr = "10.0.0.1:6776".parse().unwrap();
        assert_eq!(ipv4(v4).unwrap().port(), 6776);
    }
}
