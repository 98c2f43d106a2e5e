use puncher::proto::DEFAULT_PORT;
use puncher::transport::UdpTransport;
use puncher::udp::{Client, Server};
use puncher::{ClientConfig, ServerConfig};
use std::io::{Error, ErrorKind, Result};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "puncher")]
enum Opt {
    /// run the rendezvous server
    Server(ServerOpt),
    /// register and wait for connectors to punch through
    Listen(ListenOpt),
    /// punch through to the listener at an address
    Punch(PunchOpt),
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
    #[structopt(long = "listen-addr", default_value = "0.0.0.0:6776")]
    listen_addr: SocketAddr,

    #[structopt(long = "expiry-secs", default_value = "120")]
    expiry_secs: u64,

    #[structopt(long = "sweep-interval-secs", default_value = "15")]
    sweep_interval_secs: u64,
}

#[derive(StructOpt, Debug)]
struct ClientOpt {
    #[structopt(long = "server-addr")]
    server_addr: String,

    #[structopt(long = "port-predictions", default_value = "12")]
    port_predictions: u16,

    #[structopt(long = "punch-timeout-ms", default_value = "8000")]
    punch_timeout_ms: u64,

    #[structopt(long = "attempts", default_value = "2")]
    attempts: u32,
}

#[derive(StructOpt, Debug)]
struct ListenOpt {
    #[structopt(flatten)]
    client: ClientOpt,

    #[structopt(long = "listen-addr", default_value = "0.0.0.0:1234")]
    listen_addr: SocketAddr,

    /// return after the first connector punched through
    #[structopt(long = "single")]
    single: bool,

    /// only answer punches announced by the server
    #[structopt(long = "authenticate")]
    authenticate: bool,
}

#[derive(StructOpt, Debug)]
struct PunchOpt {
    #[structopt(flatten)]
    client: ClientOpt,

    #[structopt(long = "target")]
    target: IpAddr,

    /// accept a peer address other than the target
    #[structopt(long = "allow-redirect")]
    allow_redirect: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt: Opt = StructOpt::from_args();

    match opt {
        Opt::Server(opt) => run_server(opt),
        Opt::Listen(opt) => run_listen(opt),
        Opt::Punch(opt) => run_punch(opt),
    }
}

fn run_server(opt: ServerOpt) -> Result<()> {
    let config = ServerConfig {
        expiry: Duration::from_secs(opt.expiry_secs),
        sweep_interval: Duration::from_secs(opt.sweep_interval_secs),
        ..Default::default()
    };

    let s = Server::with_transport(UdpTransport::new(), opt.listen_addr, config)?;
    Ok(s.run()?)
}

fn client(opt: &ClientOpt) -> Result<Client> {
    let config = ClientConfig {
        port_predictions: opt.port_predictions,
        punch_response_timeout: Duration::from_millis(opt.punch_timeout_ms),
        max_punch_attempts: opt.attempts,
        ..Default::default()
    };

    // bare host means the default port
    let server_addr = if opt.server_addr.to_socket_addrs().is_ok() {
        opt.server_addr.clone()
    } else {
        format!("{}:{}", opt.server_addr, DEFAULT_PORT)
    };

    Ok(Client::with_config(&server_addr, config)?)
}

fn run_listen(opt: ListenOpt) -> Result<()> {
    let mut c = client(&opt.client)?;
    c.config_mut().authenticate_punches = opt.authenticate;

    if opt.single {
        match c.listen_for_single_punch(opt.listen_addr)? {
            Some(peer) => println!("{} punched through", peer),
            None => println!("stopped"),
        }
        return Ok(());
    }

    let mut events = c.punch_events(16);
    std::thread::spawn(move || {
        while let Some(peer) = events.blocking_recv() {
            println!("{} punched through", peer);
        }
    });

    Ok(c.listen_for_punches(opt.listen_addr)?)
}

fn run_punch(opt: PunchOpt) -> Result<()> {
    let mut c = client(&opt.client)?;
    c.config_mut().drop_unknown_addresses = !opt.allow_redirect;

    match c.punch(opt.target)? {
        Some(peer) => {
            println!("punched through to {}", peer);
            Ok(())
        }
        None => Err(Error::new(ErrorKind::Other, "punch failed")),
    }
}
