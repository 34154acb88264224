use async_std::task;
use connect_dtls::dtls::Config;
use connect_dtls::{DatagramConn, DtlsListener, Listener, StreamExt};
use log::*;
use std::env;

#[async_std::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    // get ip address and psk from cmd line args
    let (ip_address, identity, psk) = parse_args();

    // create a server that only allocates connections for handshake datagrams
    let config = Config::with_static_psk(identity, psk.into_bytes());
    let listener = DtlsListener::bind(ip_address, config).await?;
    let mut incoming = listener.incoming();

    // wait for a connection to come in and finish its handshake
    while let Some(conn) = incoming.next().await {
        let peer_addr = conn.peer_addr()?;
        info!(
            "Handling connection from {} ({})",
            peer_addr,
            String::from_utf8_lossy(conn.peer_identity())
        );

        task::spawn(async move {
            let mut buf = vec![0; 8192];

            loop {
                let bytes_read = match conn.recv(&mut buf).await {
                    Ok(0) => {
                        info!("Peer {} closed the connection", peer_addr);
                        break;
                    }
                    Ok(bytes_read) => bytes_read,
                    Err(err) => {
                        warn!("Could not read from {}: {}", peer_addr, err);
                        break;
                    }
                };

                info!(
                    "Received a message \"{}\" from {}",
                    String::from_utf8_lossy(&buf[..bytes_read]),
                    peer_addr
                );

                if let Err(err) = conn.send(&buf[..bytes_read]).await {
                    warn!("Could not send message back to {}: {}", peer_addr, err);
                    break;
                }
                info!("Sent message back to original sender");
            }

            let _ = conn.close().await;
        });
    }

    Ok(())
}

fn parse_args() -> (String, String, String) {
    let args: Vec<String> = env::args().collect();

    let ip_address = match args.get(1) {
        Some(addr) => addr,
        None => {
            error!("Need to pass IP address to listen on as first command line argument");
            panic!();
        }
    };

    let identity = match args.get(2) {
        Some(identity) => identity,
        None => {
            error!("Need to pass psk identity hint as second command line argument");
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
