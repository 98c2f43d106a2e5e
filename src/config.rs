//! Tunables for clients and the rendezvous server.

use std::time::Duration;

/// Client side tunables, shared by the listener and connector roles.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Number of consecutive ports punched, starting at the announced port.
    pub port_predictions: u16,
    /// How long one punch burst waits for a `PunchSuccess`.
    pub punch_response_timeout: Duration,
    /// How long to wait for a server to answer a `Register`. For a connector
    /// this bounds the whole wait for `ConnectTo`.
    pub server_register_response_timeout: Duration,
    /// Keep-alive interval of a listener registration.
    pub server_register_interval: Duration,
    pub socket_send_timeout: Duration,
    /// Receive poll interval, also bounds how fast a cancelled call returns.
    pub socket_receive_timeout: Duration,
    /// Connector only: refuse a `ConnectTo` pointing at an address other than
    /// the one we asked for.
    pub drop_unknown_addresses: bool,
    /// Number of punch bursts before giving up.
    pub max_punch_attempts: u32,
    pub retry_delay: Duration,
    /// Number of `Register` sends a connector makes while waiting for `ConnectTo`.
    /// They share `server_register_response_timeout` evenly, so the whole
    /// wait never exceeds it.
    pub max_server_response_attempts: u32,
    /// Listener only: fail with `ServerNotReachable` instead of re-registering
    /// when a server stops acknowledging.
    pub server_unreachable_is_error: bool,
    /// Listener only: answer `Punch` only when its token was announced by a
    /// server `ConnectTo`.
    pub authenticate_punches: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port_predictions: 12,
            punch_response_timeout: Duration::from_secs(8),
            server_register_response_timeout: Duration::from_secs(8),
            server_register_interval: Duration::from_secs(60),
            socket_send_timeout: Duration::from_millis(500),
            socket_receive_timeout: Duration::from_millis(500),
            drop_unknown_addresses: true,
            max_punch_attempts: 2,
            retry_delay: Duration::from_millis(500),
            max_server_response_attempts: 3,
            server_unreachable_is_error: false,
            authenticate_punches: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// A listener that has not re-registered for this long is forgotten.
    pub expiry: Duration,
    pub sweep_interval: Duration,
    /// Receive poll interval of the dispatch loop.
    pub receive_timeout: Duration,
    pub send_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(15),
            receive_timeout: Duration::from_secs(1),
            send_timeout: Duration::from_millis(500),
        }
    }
}
