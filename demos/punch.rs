use puncher::udp::{Client, Server};
use std::error::Error;
use std::sync::Arc;
use std::thread;
use std::time;

fn main() -> Result<(), Box<dyn Error>> {
    let server_addr = "127.0.0.1:6776";

    {
        thread::spawn(move || Server::start(server_addr).unwrap());
    }

    let listener = Arc::new(Client::new(server_addr)?);
    let t = {
        let listener = listener.clone();
        thread::spawn(move || {
            let peer = listener
                .listen_for_single_punch("127.0.0.1:1234".parse().unwrap())
                .unwrap();
            println!("listener: punched by {:?}", peer);
        })
    };

    while listener.last_registered().is_none() {
        thread::sleep(time::Duration::from_millis(100));
    }

    loop {
        let c = Client::new(server_addr)?;
        match c.punch("127.0.0.1".parse()?)? {
            Some(peer) => {
                println!("connector: punched through to {}", peer);
                break;
            }
            _ => thread::sleep(time::Duration::from_secs(2)),
        }
    }

    t.join().unwrap();

    Ok(())
}
