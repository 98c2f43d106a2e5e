use super::Transport;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

// zero is rejected by set_read_timeout/set_write_timeout
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Blocking udp socket transport.
///
/// Sends and receives run on a clone of the socket handle, outside the lock,
/// so [`Transport::close`] never waits for them. Closing shuts the socket down,
/// which wakes a blocked receive.
#[derive(Default)]
pub struct UdpTransport {
    socket: RwLock<Option<Arc<UdpSocket>>>,
}

impl UdpTransport {
    pub fn new() -> Self {
        Default::default()
    }

    fn create_socket(local_addr: SocketAddr) -> Result<UdpSocket> {
        let socket = Socket::new(
            Domain::for_address(local_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&local_addr.into())?;

        Ok(socket.into())
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        self.socket.read().clone().ok_or(Error::Closed)
    }

    // a close or rebind while we were blocked
    fn replaced(&self, socket: &Arc<UdpSocket>) -> bool {
        !matches!(&*self.socket.read(), Some(cur) if Arc::ptr_eq(cur, socket))
    }
}

impl Transport for UdpTransport {
    fn bind(&self, local_addr: SocketAddr) -> Result<()> {
        let socket = Self::create_socket(local_addr)?;
        log::trace!("bound {}", socket.local_addr()?);
        *self.socket.write() = Some(Arc::new(socket));
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket()?.local_addr()?)
    }

    fn send_to(&self, buf: &[u8], timeout: Duration, dest: SocketAddrV4) -> Result<usize> {
        let socket = self.socket()?;
        socket.set_write_timeout(Some(timeout.max(MIN_TIMEOUT)))?;

        match socket.send_to(buf, dest) {
            Ok(n) => Ok(n),
            Err(_) if self.replaced(&socket) => Err(Error::Closed),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn recv_from(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<(usize, SocketAddr)>> {
        let socket = self.socket()?;
        socket.set_read_timeout(Some(timeout.max(MIN_TIMEOUT)))?;

        let r = socket.recv_from(buf);
        if self.replaced(&socket) {
            return Err(Error::Closed);
        }

        match r {
            Ok((n, addr)) => Ok(Some((n, addr))),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            // icmp unreachable from an earlier send, windows reports it on the next recv
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused) => {
                log::trace!("recv ignored {}", e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) {
        let socket = self.socket.write().take();
        if let Some(socket) = socket {
            // unconnected udp reports ENOTCONN but still wakes blocked readers
            if let Err(e) = SockRef::from(&*socket).shutdown(Shutdown::Both) {
                log::trace!("shutdown: {}", e);
            }
            log::trace!("transport closed");
        }
    }
}
