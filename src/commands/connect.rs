use std::error::Error;
use std::io::{self, Write};

use log::debug;

use crate::client::RemoteClient;
use crate::handshake::Role;
use crate::tunnel::Tunnel;

/// Function handler to kickoff connector logic:
///     - Take the session id and passcode (prompting if needed)
///     - Open the tunnel as initiator (runs the handshake)
///     - Hand the authenticated channel to the file browser
pub async fn run(
    session_id: &str,
    relay: Option<String>,
    passcode: Option<String>,
    mount: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let relay_url = super::resolve_relay_url(relay);

    if mount.is_some() {
        return Err("mounting is not supported yet - use the interactive browser".into());
    }

    let passcode = match passcode {
        Some(p) => p,
        None => prompt_passcode()?,
    };

    println!("Connecting to session {}...", session_id);
    let tunnel = Tunnel::open(&relay_url, session_id, &passcode, Role::Initiator).await?;
    println!("✓ Connected! Tunnel established.");
    println!();

    browse(RemoteClient::new(tunnel)).await
}

fn prompt_passcode() -> Result<String, Box<dyn Error>> {
    loop {
        print!("Enter passcode: ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let trimmed = input.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
        println!("Passcode must not be empty.");
    }
}

/// Minimal line-oriented browser over the remote filesystem.
async fn browse(client: RemoteClient) -> Result<(), Box<dyn Error>> {
    println!("Type 'help' for commands, 'quit' to disconnect.");
    let mut cwd = String::from("/");

    loop {
        print!("burrow:{}> ", cwd);
        io::stdout().flush()?;

        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            break;
        }

        let args: Vec<&str> = line.split_whitespace().collect();
        let (command, rest) = match args.split_first() {
            Some((c, rest)) => (*c, rest),
            None => continue,
        };

        let result = match (command, rest) {
            ("help", _) => {
                print_help();
                Ok(())
            }
            ("ls", rest) => {
                let path = rest.first().map_or(cwd.clone(), |p| join_remote(&cwd, p));
                list_directory(&client, &path).await
            }
            ("cd", [target]) => {
                let path = join_remote(&cwd, target);
                match client.stat(&path).await {
                    Ok(info) if info.is_dir => {
                        cwd = path;
                        Ok(())
                    }
                    Ok(_) => Err(crate::Error::Protocol("not a directory".to_string())),
                    Err(e) => Err(e),
                }
            }
            ("cat", [target]) => {
                let path = join_remote(&cwd, target);
                client.download(&path).await.map(|data| {
                    println!("{}", String::from_utf8_lossy(&data));
                })
            }
            ("get", [target]) => {
                let path = join_remote(&cwd, target);
                download_to_disk(&client, &path).await
            }
            ("put", [local]) => upload_from_disk(&client, &cwd, local).await,
            ("rm", [target]) => client.delete(&join_remote(&cwd, target)).await,
            ("mv", [old, new]) => {
                client
                    .rename(&join_remote(&cwd, old), &join_remote(&cwd, new))
                    .await
            }
            ("mkdir", [target]) => client.mkdir(&join_remote(&cwd, target), 0o755).await,
            ("ping", _) => client.ping().await,
            ("quit", _) | ("exit", _) => break,
            _ => {
                println!("unknown command (try 'help')");
                Ok(())
            }
        };

        if let Err(e) = result {
            println!("error: {}", e);
        }
    }

    client.close().await;
    println!("Disconnected.");
    Ok(())
}

fn print_help() {
    println!("  ls [path]       list a directory");
    println!("  cd <path>       change directory");
    println!("  cat <file>      print a file");
    println!("  get <file>      download a file to the current directory");
    println!("  put <file>      upload a local file");
    println!("  rm <path>       delete a file or directory");
    println!("  mv <old> <new>  rename");
    println!("  mkdir <path>    create a directory");
    println!("  ping            check the tunnel");
    println!("  quit            disconnect");
}

async fn list_directory(client: &RemoteClient, path: &str) -> crate::Result<()> {
    let mut files = client.list(path).await?;
    files.sort_by(|a, b| a.name.cmp(&b.name));

    for file in files {
        if file.is_dir {
            println!("  {:>10}  {}/", "-", file.name);
        } else {
            println!("  {:>10}  {}", file.size, file.name);
        }
    }
    Ok(())
}

async fn download_to_disk(client: &RemoteClient, path: &str) -> crate::Result<()> {
    let data = client.download(path).await?;
    let name = path.rsplit('/').next().unwrap_or("download");
    std::fs::write(name, &data)?;
    println!("saved {} ({} bytes)", name, data.len());
    Ok(())
}

async fn upload_from_disk(client: &RemoteClient, cwd: &str, local: &str) -> crate::Result<()> {
    let data = std::fs::read(local)?;
    let name = local.rsplit('/').next().unwrap_or(local);
    let remote = join_remote(cwd, name);
    let written = client.write(&remote, 0, &data).await?;
    println!("uploaded {} ({} bytes)", remote, written);
    debug!("upload complete: {}", remote);
    Ok(())
}

fn join_remote(cwd: &str, target: &str) -> String {
    if target.starts_with('/') {
        return target.to_string();
    }
    if cwd == "/" {
        format!("/{}", target)
    } else {
        format!("{}/{}", cwd, target)
    }
}
