use std::error::Error;
use std::net::SocketAddr;

use log::info;

use crate::relay::RelayServer;

/// Run the relay server that rendezvouses sharers with connectors.
///
/// # Overview
/// The relay is a blind forwarder. It:
/// 1. Issues session credentials over `POST /session/create`
/// 2. Upgrades `GET /share` and `GET /connect` to the tunnel transport
/// 3. Pairs the two endpoints of a session and copies complete messages
///    between them verbatim
///
/// Everything after the peers' handshake is ciphertext; the relay holds
/// no keys and learns nothing but timing and sizes.
///
/// # Arguments
/// * `listen` - Listen address, either `host:port` or `:port`
pub async fn run(listen: &str) -> Result<(), Box<dyn Error>> {
    let addr: SocketAddr = if let Some(port) = listen.strip_prefix(':') {
        format!("0.0.0.0:{}", port).parse()?
    } else {
        listen.parse()?
    };

    println!("Starting Burrow relay server...");
    println!();
    println!("Security notes:");
    println!("  • The relay never sees plaintext data");
    println!("  • All encryption happens at the edges");
    println!("  • Sessions expire automatically");
    println!();

    let server = RelayServer::new();
    let (local_addr, serve_future) = server.serve(&addr)?;
    println!("Listening on {}", local_addr);
    info!("relay running on {}", local_addr);

    serve_future.await?;
    Ok(())
}
