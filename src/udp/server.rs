use super::registry::Registry;
use super::RECV_BUFFER_SIZE;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::proto::{ConnectRequest, ErrorCode, Message, RegisterParts, FRAME_SIZE};
use crate::transport::{Transport, UdpTransport};
use std::io::ErrorKind::Other;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::sync::{
    atomic::{AtomicBool, Ordering::Relaxed},
    Arc,
};
use std::thread::{sleep, spawn};
use std::time::{Duration, Instant};

// keeps a persistent socket error from spinning the loop
const ERROR_PAUSE: Duration = Duration::from_millis(10);

/// Udp rendezvous server
///
/// keep traces of listening peers by public address, and pair connectors with them.
pub struct Server<T: Transport = UdpTransport> {
    transport: T,
    registry: Arc<Registry>,
    config: ServerConfig,
    exit: Arc<AtomicBool>,
}

/// Ends a running [`Server`] from another thread.
#[derive(Clone)]
pub struct Stopper(Arc<AtomicBool>);

impl Stopper {
    pub fn stop(&self) {
        self.0.store(true, Relaxed);
    }
}

impl Server<UdpTransport> {
    pub fn new<A: ToSocketAddrs>(listen_addr: A) -> Result<Self> {
        let listen_addr = listen_addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(Other, "no addr"))?;

        Self::with_transport(UdpTransport::new(), listen_addr, Default::default())
    }

    /// Bind and serve forever.
    pub fn start<A: ToSocketAddrs>(listen_addr: A) -> Result<()> {
        Self::new(listen_addr)?.run()
    }
}

impl<T: Transport> Server<T> {
    pub fn with_transport(transport: T, listen_addr: SocketAddr, config: ServerConfig) -> Result<Self> {
        transport.bind(listen_addr)?;

        Ok(Self {
            transport,
            registry: Arc::new(Registry::new(config.expiry)),
            config,
            exit: Default::default(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn stopper(&self) -> Stopper {
        Stopper(self.exit.clone())
    }

    /// Receive and dispatch until stopped.
    ///
    /// Receive errors are logged and the loop goes on, only a closed
    /// transport ends it.
    pub fn run(self) -> Result<()> {
        log::info!("listening on {}", self.local_addr()?);
        self.spawn_sweeper();

        let mut buf = [0; RECV_BUFFER_SIZE];
        let result = loop {
            if self.exit.load(Relaxed) {
                break Ok(());
            }

            match self.transport.recv_from(&mut buf, self.config.receive_timeout) {
                Ok(Some((size, addr))) => self.handle_frame(&buf[..size], addr, Instant::now()),
                Ok(None) => {}
                Err(Error::Closed) if self.exit.load(Relaxed) => break Ok(()),
                Err(Error::Closed) => break Err(Error::Closed),
                Err(e) => {
                    log::warn!("receive failed: {}", e);
                    sleep(ERROR_PAUSE);
                }
            }
        };

        self.exit.store(true, Relaxed);
        self.transport.close();
        result
    }

    fn spawn_sweeper(&self) {
        let registry = self.registry.clone();
        let exit = self.exit.clone();
        let interval = self.config.sweep_interval;
        let tick = interval.min(Duration::from_millis(250));

        spawn(move || {
            let mut next_sweep = Instant::now() + interval;
            while !exit.load(Relaxed) {
                sleep(tick);
                let now = Instant::now();
                if now >= next_sweep {
                    let removed = registry.sweep_expired(now);
                    if removed > 0 {
                        log::debug!("swept {} listeners, {} left", removed, registry.len());
                    }
                    next_sweep = now + interval;
                }
            }
        });
    }

    /// Handle one datagram. Anything but a well formed `Register` is dropped
    /// without reply.
    pub(crate) fn handle_frame(&self, buf: &[u8], addr: SocketAddr, now: Instant) {
        let from = match addr {
            SocketAddr::V4(from) => from,
            SocketAddr::V6(_) => {
                log::trace!("drop ipv6 sender {}", addr);
                return;
            }
        };

        let parts = match RegisterParts::decode(buf) {
            Ok(Some(parts)) => parts,
            Ok(None) => {
                log::trace!("drop type {} from {}", buf[0], from);
                return;
            }
            Err(e) => {
                log::trace!("drop frame from {}: {}", from, e);
                return;
            }
        };

        // the listener half stands even when the connector half is malformed
        if parts.listener {
            self.registry
                .upsert_listener(from, parts.connector, true, now);
            self.send(&Message::Registered, from);
        }

        match parts.connect {
            Ok(Some(req)) => self.handle_connect(from, req),
            Ok(None) => {}
            Err(e) => log::trace!("drop connect request from {}: {}", from, e),
        }
    }

    fn handle_connect(&self, from: SocketAddrV4, req: ConnectRequest) {
        let ConnectRequest { target, token } = req;
        log::debug!("connect {} -> {}", from, target);

        match self
            .registry
            .lookup_listener(target)
            .filter(|r| r.is_listener)
        {
            Some(listener) => {
                self.send(
                    &Message::ConnectTo {
                        peer: listener.endpoint,
                        token,
                    },
                    from,
                );
                self.send(&Message::ConnectTo { peer: from, token }, listener.endpoint);
            }
            None => {
                log::debug!("target {} not found", target);
                self.send(
                    &Message::Error {
                        code: ErrorCode::ClientNotFound,
                    },
                    from,
                );
            }
        }
    }

    fn send(&self, msg: &Message, to: SocketAddrV4) {
        let buf = msg.encode();
        match self.transport.send_to(&buf, self.config.send_timeout, to) {
            Ok(FRAME_SIZE) => {}
            Ok(n) => log::warn!(
                "short send of {:?} to {}: {} bytes",
                msg.message_type(),
                to,
                n
            ),
            Err(e) => log::warn!("send {:?} to {} failed: {}", msg.message_type(), to, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Token;
    use crate::transport::mock::MockTransport;
    use std::net::Ipv4Addr;
    use std::thread;

    fn server() -> (Server<Arc<MockTransport>>, Arc<MockTransport>) {
        let t = Arc::new(MockTransport::new());
        let s = Server::with_transport(
            t.clone(),
            "0.0.0.0:6776".parse().unwrap(),
            Default::default(),
        )
        .unwrap();
        (s, t)
    }

    fn register(listener: bool, connect: Option<(Ipv4Addr, Token)>) -> [u8; FRAME_SIZE] {
        Message::Register {
            listener,
            connect: connect.map(|(target, token)| ConnectRequest { target, token }),
        }
        .encode()
    }

    const LISTENER: &str = "1.2.3.4:5000";
    const CONNECTOR: &str = "5.6.7.8:7000";

    fn v4(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_listener_registered() {
        let (s, t) = server();
        s.handle_frame(&register(true, None), addr(LISTENER), Instant::now());

        assert_eq!(t.sent(), vec![(Message::Registered, v4(LISTENER))]);
        let r = s.registry().lookup_listener(Ipv4Addr::new(1, 2, 3, 4)).unwrap();
        assert_eq!(r.endpoint, v4(LISTENER));
    }

    #[test]
    fn test_route_connect_to_both_sides() {
        let (s, t) = server();
        let token = Token::random();
        let now = Instant::now();
        s.handle_frame(&register(true, None), addr(LISTENER), now);
        s.handle_frame(
            &register(false, Some((Ipv4Addr::new(1, 2, 3, 4), token))),
            addr(CONNECTOR),
            now,
        );

        let sent = t.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(
            sent[1],
            (
                Message::ConnectTo {
                    peer: v4(LISTENER),
                    token
                },
                v4(CONNECTOR)
            )
        );
        assert_eq!(
            sent[2],
            (
                Message::ConnectTo {
                    peer: v4(CONNECTOR),
                    token
                },
                v4(LISTENER)
            )
        );
        // connectors are not registered
        assert!(s.registry().lookup_listener(Ipv4Addr::new(5, 6, 7, 8)).is_none());
    }

    #[test]
    fn test_client_not_found() {
        let (s, t) = server();
        s.handle_frame(
            &register(false, Some((Ipv4Addr::new(9, 9, 9, 9), Token::random()))),
            addr(CONNECTOR),
            Instant::now(),
        );

        assert_eq!(
            t.sent(),
            vec![(
                Message::Error {
                    code: ErrorCode::ClientNotFound
                },
                v4(CONNECTOR)
            )]
        );
    }

    #[test]
    fn test_listener_and_connector_in_one_frame() {
        let (s, t) = server();
        s.handle_frame(
            &register(true, Some((Ipv4Addr::new(9, 9, 9, 9), Token::random()))),
            addr(CONNECTOR),
            Instant::now(),
        );

        let sent: Vec<Message> = t.sent().into_iter().map(|(m, _)| m).collect();
        assert_eq!(
            sent,
            vec![
                Message::Registered,
                Message::Error {
                    code: ErrorCode::ClientNotFound
                }
            ]
        );
        let r = s.registry().lookup_listener(Ipv4Addr::new(5, 6, 7, 8)).unwrap();
        assert!(r.is_connector && r.is_listener);
    }

    #[test]
    fn test_drop_invalid_input() {
        let (s, t) = server();
        let from = addr(CONNECTOR);
        let now = Instant::now();

        let token = Token::random();
        s.handle_frame(&Message::Punch { token }.encode(), from, now);
        s.handle_frame(&Message::Registered.encode(), from, now);
        s.handle_frame(&register(true, None)[..FRAME_SIZE - 1], from, now);
        s.handle_frame(&[0u8; FRAME_SIZE + 1], from, now);

        let mut bad = register(false, Some((Ipv4Addr::new(1, 2, 3, 4), token)));
        bad[6] = 60;
        s.handle_frame(&bad, from, now);

        s.handle_frame(&register(true, None), "[::1]:5000".parse().unwrap(), now);

        assert!(t.sent().is_empty());
        assert!(s.registry().is_empty());
    }

    #[test]
    fn test_listener_kept_when_connect_half_malformed() {
        let (s, t) = server();
        let mut frame = register(true, Some((Ipv4Addr::new(1, 2, 3, 4), Token::random())));
        frame[6] = 60;
        s.handle_frame(&frame, addr(CONNECTOR), Instant::now());

        assert_eq!(t.sent(), vec![(Message::Registered, v4(CONNECTOR))]);
        let r = s.registry().lookup_listener(Ipv4Addr::new(5, 6, 7, 8)).unwrap();
        assert!(r.is_listener && r.is_connector);

        // connector only: nothing to keep, nothing sent
        let (s, t) = server();
        frame[1] = 1;
        s.handle_frame(&frame, addr(CONNECTOR), Instant::now());
        assert!(t.sent().is_empty());
        assert!(s.registry().is_empty());
    }

    #[test]
    fn test_run_survives_receive_error() {
        let t = Arc::new(MockTransport::new());
        let config = ServerConfig {
            receive_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let s = Server::with_transport(t.clone(), addr("0.0.0.0:6776"), config).unwrap();
        let registry = s.registry().clone();
        let stopper = s.stopper();

        t.fail_recv(std::io::ErrorKind::PermissionDenied);
        t.fail_recv(std::io::ErrorKind::Other);
        t.push(
            Message::Register {
                listener: true,
                connect: None,
            },
            addr(LISTENER),
        );
        let h = thread::spawn(move || s.run());

        let start = Instant::now();
        while registry.is_empty() && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(registry.len(), 1);

        stopper.stop();
        h.join().unwrap().unwrap();
    }

    #[test]
    fn test_run_ends_when_closed_underneath() {
        let t = Arc::new(MockTransport::new());
        let s = Server::with_transport(t.clone(), addr("0.0.0.0:6776"), Default::default()).unwrap();
        t.close();
        assert!(matches!(s.run(), Err(Error::Closed)));
    }

    #[test]
    fn test_run_sweeps_and_stops() {
        let t = Arc::new(MockTransport::new());
        let config = ServerConfig {
            expiry: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(20),
            receive_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let s = Server::with_transport(t.clone(), "0.0.0.0:6776".parse().unwrap(), config).unwrap();
        let registry = s.registry().clone();
        let stopper = s.stopper();

        t.push(
            Message::Register {
                listener: true,
                connect: None,
            },
            addr(LISTENER),
        );
        let h = thread::spawn(move || s.run());

        let start = Instant::now();
        while registry.is_empty() && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(registry.len(), 1);

        thread::sleep(Duration::from_millis(400));
        assert!(registry.is_empty());

        stopper.stop();
        h.join().unwrap().unwrap();
        assert!(t.is_closed());
    }
}
