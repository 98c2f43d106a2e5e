//! Port prediction punching.
//!
//! NATs tend to hand out external ports sequentially, so instead of the single
//! announced port we punch a window of `port_predictions` ports starting at it.
//! A punch from the peer arriving on a port outside that window reveals its
//! real mapping, which gets one corrective punch right away.

use super::RECV_BUFFER_SIZE;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::proto::{Message, Token, FRAME_SIZE};
use crate::transport::Transport;
use std::collections::HashSet;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::thread::sleep;
use std::time::{Duration, Instant};

/// Frame level view of a client transport for one operation.
pub(crate) struct Link<'a, T: Transport> {
    pub(crate) transport: &'a T,
    pub(crate) config: &'a ClientConfig,
    pub(crate) running: &'a AtomicBool,
}

impl<'a, T: Transport> Link<'a, T> {
    pub(crate) fn running(&self) -> bool {
        self.running.load(Relaxed)
    }

    pub(crate) fn send(&self, msg: &Message, to: SocketAddrV4) -> Result<()> {
        let buf = msg.encode();
        match self
            .transport
            .send_to(&buf, self.config.socket_send_timeout, to)
        {
            Ok(FRAME_SIZE) => Ok(()),
            Ok(sent) => Err(Error::SocketSend {
                sent,
                expected: FRAME_SIZE,
            }),
            Err(Error::Closed) if !self.running() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Wait one receive interval for a well formed frame from an IPv4 sender.
    ///
    /// Noise is dropped and reported as `None`, same as a timeout.
    pub(crate) fn recv(&self) -> Result<Option<(Message, SocketAddrV4)>> {
        let mut buf = [0; RECV_BUFFER_SIZE];
        let (size, addr) = match self
            .transport
            .recv_from(&mut buf, self.config.socket_receive_timeout)
        {
            Ok(Some(r)) => r,
            Ok(None) => return Ok(None),
            Err(Error::Closed) if !self.running() => return Ok(None),
            Err(e) => return Err(e),
        };

        let from = match addr {
            SocketAddr::V4(from) => from,
            SocketAddr::V6(_) => return Ok(None),
        };

        match Message::decode(&buf[..size]) {
            Ok(msg) => Ok(Some((msg, from))),
            Err(e) => {
                log::trace!("drop frame from {}: {}", from, e);
                Ok(None)
            }
        }
    }

    /// Sleep unless cancelled, returning whether we are still running.
    pub(crate) fn pause(&self, d: Duration) -> bool {
        let until = Instant::now() + d;
        let tick = self.config.socket_receive_timeout.max(Duration::from_millis(1));
        loop {
            if !self.running() {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            sleep(tick.min(until - now));
        }
    }
}

/// Ports of one burst. Stops at 65535 instead of wrapping.
pub(crate) fn burst_ports(port: u16, predictions: u16) -> impl Iterator<Item = u16> {
    (0..predictions).map_while(move |i| port.checked_add(i))
}

fn in_window(announced: u16, predictions: u16, port: u16) -> bool {
    port >= announced && u32::from(port - announced) < u32::from(predictions)
}

/// Send one `Punch` to every predicted port of `target`, in order.
pub(crate) fn send_burst<T: Transport>(link: &Link<T>, target: SocketAddrV4, token: Token) -> Result<()> {
    let punch = Message::Punch { token };
    for port in burst_ports(target.port(), link.config.port_predictions) {
        link.send(&punch, SocketAddrV4::new(*target.ip(), port))?;
    }
    Ok(())
}

/// Punch `target` until its `PunchSuccess` arrives or attempts run out.
///
/// Returns the endpoint the success came from, which may be outside the
/// predicted window. `None` on exhaustion or cancellation.
pub(crate) fn punch<T: Transport>(
    link: &Link<T>,
    target: SocketAddrV4,
    token: Token,
) -> Result<Option<SocketAddrV4>> {
    let config = link.config;
    let mut repunched = HashSet::new();

    for attempt in 0..config.max_punch_attempts.max(1) {
        if attempt > 0 && !link.pause(config.retry_delay) {
            break;
        }
        if !link.running() {
            break;
        }

        log::debug!("punch {} attempt {}", target, attempt + 1);
        send_burst(link, target, token)?;

        // noise never extends the window
        let deadline = Instant::now() + config.punch_response_timeout;
        while link.running() && Instant::now() < deadline {
            let (msg, from) = match link.recv()? {
                Some(r) => r,
                None => continue,
            };

            if from.ip() != target.ip() {
                log::trace!("ignore {:?} from {}", msg.message_type(), from);
                continue;
            }

            match msg {
                Message::PunchSuccess { token: t } if t == token => {
                    log::info!("punched through to {}", from);
                    return Ok(Some(from));
                }
                Message::Punch { token: t } if t == token => {
                    if !in_window(target.port(), config.port_predictions, from.port())
                        && repunched.insert(from.port())
                    {
                        log::debug!("peer punched from unpredicted port {}", from);
                        link.send(&Message::Punch { token }, from)?;
                    }
                }
                msg => log::trace!("ignore {:?} from {}", msg.message_type(), from),
            }
        }
    }

    log::info!("punch {} failed", target);
    Ok(None)
}
