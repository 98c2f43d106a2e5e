use super::punch::{self, Link};
use crate::config::ClientConfig;
use crate::error::{ipv4, Error, Result};
use crate::proto::{ConnectRequest, Message, Token};
use crate::transport::{Transport, UdpTransport};
use parking_lot::{Mutex, RwLock};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::sync::{
    atomic::{AtomicBool, Ordering::Relaxed},
    Arc,
};
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Where a client is in its current operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    Idle,
    /// `Register` sent, no acknowledgement yet
    Registering,
    /// listener registered with at least one server
    Listening,
    /// connector waiting for the server's `ConnectTo`
    AwaitingConnectTo,
    Punching,
    /// listener cancelled or failed
    Stopped,
    /// listener got its single punch
    Completed,
    Succeeded,
    Failed,
}

struct ServerStatus {
    addr: SocketAddrV4,
    waiting: bool,
    last_register: Instant,
}

/// Hole punching client.
///
/// A listener registers with the rendezvous servers and answers punches, a
/// connector asks a server to pair it with the listener at an address and
/// then punches through.
///
/// # example
/// ```no_run
/// use puncher::udp::Client;
///
/// let c = Client::new("rndz.example.org:6776").unwrap();
/// let peer = c.listen_for_single_punch("0.0.0.0:1234".parse().unwrap()).unwrap();
/// println!("punched by {:?}", peer);
/// ```
///
/// ```no_run
/// use puncher::udp::Client;
///
/// let c = Client::new("rndz.example.org:6776").unwrap();
/// match c.punch("203.0.113.7".parse().unwrap()).unwrap() {
///     Some(peer) => println!("reach peer at {}", peer),
///     None => println!("punch failed"),
/// }
/// ```
pub struct Client<T: Transport = UdpTransport> {
    transport: Arc<T>,
    servers: Vec<SocketAddrV4>,
    config: ClientConfig,
    running: Arc<AtomicBool>,
    state: Mutex<State>,
    last_registered: RwLock<Option<Instant>>,
    events: Mutex<Option<mpsc::Sender<SocketAddrV4>>>,
}

/// Cancels a blocked client operation from another thread.
pub struct Canceller<T: Transport = UdpTransport> {
    running: Arc<AtomicBool>,
    transport: Arc<T>,
}

impl<T: Transport> Canceller<T> {
    pub fn cancel(&self) {
        self.running.store(false, Relaxed);
        self.transport.close();
    }
}

impl<T: Transport> Clone for Canceller<T> {
    fn clone(&self) -> Self {
        Self {
            running: self.running.clone(),
            transport: self.transport.clone(),
        }
    }
}

impl<T: Transport> Drop for Client<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl Client<UdpTransport> {
    /// Resolve the rendezvous server, every IPv4 address becomes a candidate.
    pub fn new(server_addr: &str) -> Result<Self> {
        Self::with_config(server_addr, Default::default())
    }

    pub fn with_config(server_addr: &str, config: ClientConfig) -> Result<Self> {
        let servers: Vec<SocketAddr> = server_addr
            .to_socket_addrs()?
            .filter(|addr| addr.is_ipv4())
            .collect();

        Self::with_transport(UdpTransport::new(), &servers, config)
    }
}

impl<T: Transport> Client<T> {
    pub fn with_transport(transport: T, servers: &[SocketAddr], config: ClientConfig) -> Result<Self> {
        let servers = servers
            .iter()
            .map(|addr| ipv4(*addr))
            .collect::<Result<Vec<_>>>()?;

        if servers.is_empty() {
            return Err(Error::NoServers);
        }

        Ok(Self {
            transport: Arc::new(transport),
            servers,
            config,
            running: Default::default(),
            state: Mutex::new(State::Idle),
            last_registered: Default::default(),
            events: Default::default(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ClientConfig {
        &mut self.config
    }

    pub fn servers(&self) -> &[SocketAddrV4] {
        &self.servers
    }

    /// local address of the current operation
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn state(&self) -> State {
        *self.state.lock()
    }

    /// last `Registered` received from any server
    pub fn last_registered(&self) -> Option<Instant> {
        *self.last_registered.read()
    }

    /// Subscribe to connectors punching a [`Client::listen_for_punches`] listener.
    ///
    /// Events are dropped while the channel is full, the listener never waits.
    pub fn punch_events(&self, capacity: usize) -> mpsc::Receiver<SocketAddrV4> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.events.lock() = Some(tx);
        rx
    }

    pub fn canceller(&self) -> Canceller<T> {
        Canceller {
            running: self.running.clone(),
            transport: self.transport.clone(),
        }
    }

    /// Stop the current operation and release the socket.
    pub fn close(&self) {
        self.running.store(false, Relaxed);
        self.transport.close();
    }

    fn set_state(&self, state: State) {
        let mut cur = self.state.lock();
        if *cur != state {
            log::debug!("{:?} -> {:?}", *cur, state);
            *cur = state;
        }
    }

    fn link(&self) -> Link<'_, T> {
        Link {
            transport: &*self.transport,
            config: &self.config,
            running: &self.running,
        }
    }

    fn is_server(&self, addr: SocketAddrV4) -> bool {
        self.servers.contains(&addr)
    }

    /// Listen for connectors until cancelled.
    ///
    /// Each connector that punches through is published on [`Client::punch_events`].
    pub fn listen_for_punches(&self, local_addr: SocketAddr) -> Result<()> {
        self.run_listener(local_addr, false).map(|_| ())
    }

    /// Listen until the first connector punches through and return its endpoint.
    ///
    /// `None` if cancelled first.
    pub fn listen_for_single_punch(&self, local_addr: SocketAddr) -> Result<Option<SocketAddrV4>> {
        self.run_listener(local_addr, true)
    }

    fn run_listener(&self, local_addr: SocketAddr, single: bool) -> Result<Option<SocketAddrV4>> {
        self.transport.bind(local_addr)?;
        self.running.store(true, Relaxed);
        *self.last_registered.write() = None;
        self.set_state(State::Registering);

        let r = self.listen(single);

        self.running.store(false, Relaxed);
        match r {
            Ok(Some(_)) => self.set_state(State::Completed),
            _ => self.set_state(State::Stopped),
        }
        r
    }

    fn listen(&self, single: bool) -> Result<Option<SocketAddrV4>> {
        let link = self.link();
        let register = Message::Register {
            listener: true,
            connect: None,
        };

        let now = Instant::now();
        let mut statuses: Vec<ServerStatus> = self
            .servers
            .iter()
            .map(|&addr| ServerStatus {
                addr,
                waiting: true,
                last_register: now,
            })
            .collect();
        for s in statuses.iter() {
            link.send(&register, s.addr)?;
        }

        // tokens announced by a server ConnectTo
        let mut announced: Vec<(Token, Instant)> = Vec::new();
        let announce_ttl = (self.config.punch_response_timeout + self.config.retry_delay)
            * self.config.max_punch_attempts.max(1);

        while link.running() {
            match link.recv()? {
                Some((Message::Registered, from)) if self.is_server(from) => {
                    if let Some(s) = statuses.iter_mut().find(|s| s.addr == from) {
                        s.waiting = false;
                    }
                    *self.last_registered.write() = Some(Instant::now());
                    if self.state() == State::Registering {
                        log::info!("registered with {}", from);
                        self.set_state(State::Listening);
                    }
                }
                Some((Message::ConnectTo { peer, token }, from)) if self.is_server(from) => {
                    log::debug!("{} wants to connect", peer);
                    let now = Instant::now();
                    announced.retain(|(_, at)| now.duration_since(*at) < announce_ttl);
                    announced.push((token, now));
                    punch::send_burst(&link, peer, token)?;
                }
                Some((Message::Punch { token }, from)) => {
                    if self.config.authenticate_punches
                        && !announced.iter().any(|(t, _)| *t == token)
                    {
                        log::trace!("unannounced punch from {}", from);
                    } else {
                        link.send(&Message::PunchSuccess { token }, from)?;
                        log::info!("punched by {}", from);

                        if single {
                            return Ok(Some(from));
                        }
                        self.publish(from);
                    }
                }
                Some((msg, from)) => log::trace!("ignore {:?} from {}", msg.message_type(), from),
                None => {}
            }

            self.keep_registered(&link, &register, &mut statuses)?;
        }

        Ok(None)
    }

    fn keep_registered(
        &self,
        link: &Link<T>,
        register: &Message,
        statuses: &mut [ServerStatus],
    ) -> Result<()> {
        let now = Instant::now();
        for s in statuses.iter_mut() {
            let elapsed = now.duration_since(s.last_register);

            if !s.waiting && elapsed > self.config.server_register_interval {
                log::trace!("keep alive {}", s.addr);
            } else if s.waiting && elapsed > self.config.server_register_response_timeout {
                if self.config.server_unreachable_is_error {
                    return Err(Error::ServerNotReachable(s.addr));
                }
                log::warn!("no response from {}, registering again", s.addr);
            } else {
                continue;
            }

            link.send(register, s.addr)?;
            s.last_register = now;
            s.waiting = true;
        }

        Ok(())
    }

    fn publish(&self, peer: SocketAddrV4) {
        let mut events = self.events.lock();
        if let Some(tx) = events.as_ref() {
            match tx.try_send(peer) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => log::warn!("punch event for {} dropped", peer),
                Err(TrySendError::Closed(_)) => {
                    log::debug!("punch event receiver gone");
                    *events = None;
                }
            }
        }
    }

    /// Connect to the listener registered at `target` and punch through.
    ///
    /// `None` when the server does not know the target, the server points
    /// somewhere else, or no punch got through.
    pub fn punch(&self, target: IpAddr) -> Result<Option<SocketAddrV4>> {
        let target = match target {
            IpAddr::V4(target) => target,
            IpAddr::V6(_) => return Err(Error::NotIpv4(target)),
        };

        self.transport
            .bind(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        self.running.store(true, Relaxed);
        self.set_state(State::Registering);

        let r = self.connect(target);

        self.running.store(false, Relaxed);
        match r {
            Ok(Some(_)) => self.set_state(State::Succeeded),
            _ => self.set_state(State::Failed),
        }
        r
    }

    fn connect(&self, target: Ipv4Addr) -> Result<Option<SocketAddrV4>> {
        let link = self.link();
        let token = Token::random();
        let register = Message::Register {
            listener: false,
            connect: Some(ConnectRequest { target, token }),
        };

        let peer = match self.await_connect_to(&link, &register, token)? {
            Some(peer) => peer,
            None => return Ok(None),
        };

        if self.config.drop_unknown_addresses && *peer.ip() != target {
            log::warn!("server pointed {} to {}, dropped", target, peer);
            return Ok(None);
        }

        self.set_state(State::Punching);
        punch::punch(&link, peer, token)
    }

    fn await_connect_to(
        &self,
        link: &Link<T>,
        register: &Message,
        token: Token,
    ) -> Result<Option<SocketAddrV4>> {
        // the whole wait stays within one response timeout
        let attempts = self.config.max_server_response_attempts.max(1);
        let per_attempt = self.config.server_register_response_timeout / attempts;

        for _ in 0..attempts {
            if !link.running() {
                break;
            }

            for server in self.servers.iter() {
                link.send(register, *server)?;
            }
            self.set_state(State::AwaitingConnectTo);

            let deadline = Instant::now() + per_attempt;
            while link.running() && Instant::now() < deadline {
                let (msg, from) = match link.recv()? {
                    Some(r) => r,
                    None => continue,
                };

                if !self.is_server(from) {
                    log::trace!("ignore {:?} from {}", msg.message_type(), from);
                    continue;
                }

                match msg {
                    Message::Error { code } => {
                        log::info!("{} reports {:?}", from, code);
                        return Ok(None);
                    }
                    Message::ConnectTo { peer, token: t } if t == token => {
                        log::debug!("connect to {}", peer);
                        return Ok(Some(peer));
                    }
                    msg => log::trace!("ignore {:?} from {}", msg.message_type(), from),
                }
            }
        }

        log::info!("no response from rendezvous servers");
        Ok(None)
    }
}
