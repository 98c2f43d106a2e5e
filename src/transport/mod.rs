//! Datagram transport used by clients and the server.
//!
//! The punching logic only needs bind, send, receive with a timeout and close.
//! [`UdpTransport`] is the socket backed implementation.

use crate::error::Result;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

mod udp;
pub use udp::UdpTransport;

#[cfg(test)]
pub(crate) mod mock;

pub trait Transport: Send + Sync {
    /// Bind to a local endpoint, replacing any previous binding.
    fn bind(&self, local_addr: SocketAddr) -> Result<()>;

    fn local_addr(&self) -> Result<SocketAddr>;

    /// Send one datagram, returning the number of bytes written.
    fn send_to(&self, buf: &[u8], timeout: Duration, dest: SocketAddrV4) -> Result<usize>;

    /// Wait up to `timeout` for one datagram. `Ok(None)` on timeout.
    fn recv_from(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<(usize, SocketAddr)>>;

    /// Release the socket. Pending and later calls fail with `Error::Closed`.
    fn close(&self);
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn bind(&self, local_addr: SocketAddr) -> Result<()> {
        (**self).bind(local_addr)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        (**self).local_addr()
    }

    fn send_to(&self, buf: &[u8], timeout: Duration, dest: SocketAddrV4) -> Result<usize> {
        (**self).send_to(buf, timeout, dest)
    }

    fn recv_from(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<(usize, SocketAddr)>> {
        (**self).recv_from(buf, timeout)
    }

    fn close(&self) {
        (**self).close()
    }
}
