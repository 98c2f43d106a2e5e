//! Scripted in-memory transport for tests.

use super::Transport;
use crate::error::{Error, Result};
use crate::proto::Message;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::thread::sleep;
use std::time::Duration;

type Responder = Box<dyn FnMut(&Message, SocketAddrV4) -> Vec<(Message, SocketAddr)> + Send>;

pub(crate) struct MockTransport {
    local_addr: Mutex<SocketAddr>,
    inbox: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
    recv_errors: Mutex<VecDeque<io::ErrorKind>>,
    sent: Mutex<Vec<(Message, SocketAddrV4)>>,
    responder: Mutex<Option<Responder>>,
    closed: AtomicBool,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self {
            local_addr: Mutex::new("0.0.0.0:0".parse().unwrap()),
            inbox: Default::default(),
            recv_errors: Default::default(),
            sent: Default::default(),
            responder: Default::default(),
            closed: Default::default(),
        }
    }

    pub(crate) fn push(&self, msg: Message, from: SocketAddr) {
        self.push_raw(msg.encode().to_vec(), from);
    }

    pub(crate) fn push_raw(&self, buf: Vec<u8>, from: SocketAddr) {
        self.inbox.lock().push_back((buf, from));
    }

    /// Fail the next receive with an io error of `kind`.
    pub(crate) fn fail_recv(&self, kind: io::ErrorKind) {
        self.recv_errors.lock().push_back(kind);
    }

    /// Called for every sent frame, the returned frames are queued for receive.
    pub(crate) fn respond<F>(&self, f: F)
    where
        F: FnMut(&Message, SocketAddrV4) -> Vec<(Message, SocketAddr)> + Send + 'static,
    {
        *self.responder.lock() = Some(Box::new(f));
    }

    pub(crate) fn sent(&self) -> Vec<(Message, SocketAddrV4)> {
        self.sent.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Relaxed)
    }
}

impl Transport for MockTransport {
    fn bind(&self, local_addr: SocketAddr) -> Result<()> {
        self.closed.store(false, Relaxed);
        *self.local_addr.lock() = local_addr;
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(*self.local_addr.lock())
    }

    fn send_to(&self, buf: &[u8], _timeout: Duration, dest: SocketAddrV4) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let msg = Message::decode(buf).expect("sent frame must decode");
        self.sent.lock().push((msg.clone(), dest));

        if let Some(f) = self.responder.lock().as_mut() {
            for (reply, from) in f(&msg, dest) {
                self.push(reply, from);
            }
        }

        Ok(buf.len())
    }

    fn recv_from(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<(usize, SocketAddr)>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if let Some(kind) = self.recv_errors.lock().pop_front() {
            return Err(io::Error::from(kind).into());
        }

        match self.inbox.lock().pop_front() {
            Some((data, from)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(Some((n, from)))
            }
            None => {
                sleep(timeout.min(Duration::from_millis(2)));
                Ok(None)
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Relaxed);
    }
}
