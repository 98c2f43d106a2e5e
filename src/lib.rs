//!UDP hole punching through a rendezvous server.
//!
//!Two peers behind NAT can't reach each other directly, neither knows the
//!other's public address and neither NAT lets unsolicited traffic in.
//!A public rendezvous server observes both addresses and tells each side where to knock.
//!
//!## How it works
//!A listening peer keeps registering with the server, which remembers the public address
//!the registration came from.
//!A connecting peer asks the server for the listener at a public IPv4 address, along with a random token.
//!
//!The server sends both sides a `ConnectTo` carrying the other's endpoint and the token.
//!Both sides then send `Punch` packets to each other, opening their NAT for the return traffic.
//!The listener answers each `Punch` with a `PunchSuccess`, and the connector returns the endpoint
//!that answer came from.
//!
//!NATs often remap ports, so a burst of punches goes to a window of consecutive ports
//!starting at the announced one. A punch from an unexpected port is answered right away.
//!
//!Only IPv4 is punched, IPv6 peers don't need it.
//!
//!## Feature flags
//!For convenient, the crate include both client and server code by default.
//!Mostly you only use client or server code, set features to `client` or `server` instead.
//!
//!```toml
//!puncher = { version = "0.1", default-features=false, features=["client"]}
//!```
//!
//!- `client`: listener and connector
//!- `server`: rendezvous server

pub mod config;
mod error;
pub mod proto;
pub mod transport;
pub mod udp;

pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, Result};
