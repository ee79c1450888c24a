use std::error::Error;
use std::time::Duration;

use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request, StatusCode};
use indicatif::ProgressBar;
use log::debug;
use serde::Deserialize;

use crate::dispatcher;
use crate::handshake::Role;
use crate::secure_fs::SecureFilesystem;
use crate::tunnel::Tunnel;

const CREATE_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct CreateSessionResponse {
    session_id: String,
    passcode: String,
}

/// Function handler to kickoff sharer logic:
///     - Validate the directory to export
///     - Create a session (id + passcode) at the relay
///     - Print the credential banner for the connector
///     - Open the tunnel as responder and wait for the peer's handshake
///     - Serve filesystem requests until the peer disconnects
pub async fn run(path: &str, relay: Option<String>, readonly: bool) -> Result<(), Box<dyn Error>> {
    let relay_url = super::resolve_relay_url(relay);

    let abs_path = std::fs::canonicalize(path)
        .map_err(|_| format!("path does not exist: {}", path))?;
    if !abs_path.is_dir() {
        return Err("path must be a directory".into());
    }

    debug!("creating session at {}", relay_url);
    let (session_id, passcode) = create_session(&relay_url, &abs_path.to_string_lossy()).await?;

    println!();
    println!("╔════════════════════════════════════════╗");
    println!("║     Burrow - Secure Folder Sharing     ║");
    println!("╚════════════════════════════════════════╝");
    println!();
    println!("  Session:  {}", session_id);
    println!("  Passcode: {}", passcode);
    println!();
    println!("Share these credentials with the connector.");
    println!();

    let secure_fs = SecureFilesystem::new(&abs_path, readonly)?;

    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("Waiting for a peer to connect");

    // The sharer is the responder: the handshake read blocks until the
    // connector shows up, so keep re-opening across idle windows.
    let tunnel = loop {
        match Tunnel::open(&relay_url, &session_id, &passcode, Role::Responder).await {
            Ok(tunnel) => break tunnel,
            Err(crate::Error::Timeout) => {
                debug!("no peer yet, re-opening tunnel");
                continue;
            }
            Err(e) => {
                spinner.finish_and_clear();
                return Err(e.into());
            }
        }
    };
    spinner.finish_and_clear();

    println!("✓ Connected! Tunnel established.");
    if readonly {
        println!("  Mode: Read-only");
    } else {
        println!("  Mode: Read-write");
    }
    println!();
    println!("Press Ctrl+C to stop sharing.");
    println!();

    let result = dispatcher::serve(&tunnel, &secure_fs).await;
    tunnel.close().await;
    result?;

    println!("Peer disconnected.");
    Ok(())
}

/// Creates a session via the relay's HTTP endpoint. Returns the id and
/// passcode to hand to the connector.
async fn create_session(
    relay_url: &str,
    shared_path: &str,
) -> Result<(String, String), Box<dyn Error>> {
    let body = serde_json::json!({ "shared_path": shared_path }).to_string();

    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("{}/session/create", relay_url.trim_end_matches('/')))
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))?;

    let response = tokio::time::timeout(CREATE_SESSION_TIMEOUT, Client::new().request(request))
        .await
        .map_err(|_| "relay did not answer in time")??;

    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await?;

    if status != StatusCode::OK {
        return Err(format!("relay error: {}", String::from_utf8_lossy(&bytes)).into());
    }

    let parsed: CreateSessionResponse = serde_json::from_slice(&bytes)?;
    Ok((parsed.session_id, parsed.passcode))
}
