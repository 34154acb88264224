use async_std::net::UdpSocket;
use connect_dtls::dtls::{handshake, Config};
use connect_dtls::DatagramConn;
use log::*;
use std::env;

#[async_std::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    // get ip address and psk from cmd line args
    let (ip_address, identity, psk) = parse_args();

    // connect a socket to the server and secure it
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(&ip_address).await?;

    let config = Config::with_static_psk(identity, psk.into_bytes());
    let conn = handshake::client(socket, &config).await?;
    info!(
        "Established secure connection with {} ({})",
        conn.peer_addr()?,
        String::from_utf8_lossy(conn.peer_identity())
    );

    // send a message to the server
    let msg = String::from("Hello world");
    info!("Sending message: {}", msg);
    conn.send(msg.as_bytes()).await?;

    // wait for the server to echo it back
    let mut buf = vec![0; 8192];
    let bytes_read = conn.recv(&mut buf).await?;
    info!(
        "Received reply: {}",
        String::from_utf8_lossy(&buf[..bytes_read])
    );

    conn.close().await?;
    Ok(())
}

fn parse_args() -> (String, String, String) {
    let args: Vec<String> = env::args().collect();

    let ip_address = match args.get(1) {
        Some(addr) => addr,
        None => {
            error!("Need to pass IP address to connect to as first command line argument");
            panic!();
        }
    };

    let identity = match args.get(2) {
        Some(identity) => identity,
        None => {
            error!("Need to pass psk identity as second command line argument");
            panic!();
        }
    };

    let psk = match args.get(3) {
        Some(psk) => psk,
        None => {
            error!("Need to pass pre-shared key as third command line argument");
            panic!();
        }
    };

    (ip_address.to_string(), identity.to_string(), psk.to_string())
}
