//! UDP hole punching.
//!
//! use `Client` to listen for, or punch through to, a peer.
//!
//! use `Server` to create a rendezvous server.

// large enough to tell oversized datagrams from frames
pub(crate) const RECV_BUFFER_SIZE: usize = 1500;

#[cfg(feature = "client")]
mod client;
#[cfg(feature = "client")]
pub use client::{Canceller, Client, State};
#[cfg(feature = "client")]
mod punch;

#[cfg(feature = "server")]
mod registry;
#[cfg(feature = "server")]
pub use registry::{Registration, Registry};
#[cfg(feature = "server")]
mod server;
#[cfg(feature = "server")]
pub use server::{Server, Stopper};

#[cfg(all(test, feature = "client", feature = "server"))]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, ServerConfig};
    use crate::transport::UdpTransport;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::thread::{sleep, spawn};
    use std::time::{Duration, Instant};

    #[test]
    fn test_punch_loopback() {
        let server = Server::with_transport(
            UdpTransport::new(),
            "127.0.0.1:0".parse().unwrap(),
            ServerConfig::default(),
        )
        .unwrap();
        let server_addr = server.local_addr().unwrap();
        let stopper = server.stopper();
        let s = spawn(move || server.run());

        let config = ClientConfig {
            port_predictions: 4,
            punch_response_timeout: Duration::from_secs(3),
            socket_receive_timeout: Duration::from_millis(50),
            ..Default::default()
        };

        let listener = Arc::new(
            Client::with_transport(UdpTransport::new(), &[server_addr], config.clone()).unwrap(),
        );
        let l = {
            let listener = listener.clone();
            spawn(move || listener.listen_for_single_punch("127.0.0.1:0".parse().unwrap()))
        };

        let start = Instant::now();
        while listener.last_registered().is_none() {
            assert!(start.elapsed() < Duration::from_secs(5), "listener not registered");
            sleep(Duration::from_millis(10));
        }
        let listener_addr = listener.local_addr().unwrap();

        let connector =
            Client::with_transport(UdpTransport::new(), &[server_addr], config).unwrap();
        let start = Instant::now();
        let peer = connector
            .punch("127.0.0.1".parse().unwrap())
            .unwrap()
            .expect("punch failed");
        assert!(start.elapsed() < Duration::from_secs(4));
        assert_eq!(SocketAddr::V4(peer), listener_addr);
        assert_eq!(connector.state(), State::Succeeded);

        let punched_by = l.join().unwrap().unwrap().expect("listener not punched");
        assert_eq!(punched_by.port(), connector.local_addr().unwrap().port());
        assert_eq!(listener.state(), State::Completed);

        stopper.stop();
        s.join().unwrap().unwrap();
    }

    #[test]
    fn test_punch_unknown_target_loopback() {
        let server = Server::with_transport(
            UdpTransport::new(),
            "127.0.0.1:0".parse().unwrap(),
            ServerConfig::default(),
        )
        .unwrap();
        let server_addr = server.local_addr().unwrap();
        let stopper = server.stopper();
        let s = spawn(move || server.run());

        let connector = Client::with_transport(
            UdpTransport::new(),
            &[server_addr],
            ClientConfig {
                socket_receive_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        )
        .unwrap();

        let start = Instant::now();
        assert_eq!(connector.punch("127.0.0.1".parse().unwrap()).unwrap(), None);
        assert!(start.elapsed() < Duration::from_secs(2));

        stopper.stop();
        s.join().unwrap().unwrap();
    }

    #[test]
    fn test_close_wakes_listener_loopback() {
        // nothing answers at the discard port
        let server_addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let config = ClientConfig {
            socket_receive_timeout: Duration::from_secs(3),
            ..Default::default()
        };
        let listener = Arc::new(
            Client::with_transport(UdpTransport::new(), &[server_addr], config).unwrap(),
        );

        let l = {
            let listener = listener.clone();
            spawn(move || listener.listen_for_punches("127.0.0.1:0".parse().unwrap()))
        };
        sleep(Duration::from_millis(200));

        let start = Instant::now();
        listener.close();
        assert!(start.elapsed() < Duration::from_millis(500));
        l.join().unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(listener.state(), State::Stopped);
    }
}
