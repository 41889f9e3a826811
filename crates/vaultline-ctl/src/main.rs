//! vaultline-ctl: command-line client for the Vaultline backup server.

mod identity;

use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio::net::TcpStream;

use libvaultline::{BackupClient, ClientError, ClientOptions, CryptoContext};
use vaultline_core::config::VaultlineConfig;

// ── Subcommand handlers ───────────────────────────────────────────────────────

async fn cmd_backup(config: &VaultlineConfig, path: &Path, name: Option<&str>) -> Result<()> {
    let client_cfg = &config.client;
    let plaintext =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let filename = match name {
        Some(n) => n.to_string(),
        None => path
            .file_name()
            .and_then(|n| n.to_str())
            .context("file name is not valid UTF-8, pass --name")?
            .to_string(),
    };

    // A saved identity only counts for the same username.
    let saved = identity::load(&client_cfg.identity_path)?
        .filter(|id| id.username == client_cfg.username);
    let (crypto, known_id) = match saved {
        Some(id) => (CryptoContext::from_keypair(id.keypair), Some(id.client_id)),
        None => (CryptoContext::generate()?, None),
    };

    let stream = TcpStream::connect(&client_cfg.server_addr)
        .await
        .with_context(|| {
            format!("failed to connect to vaultlined at {} (is it running?)", client_cfg.server_addr)
        })?;
    stream.set_nodelay(true).ok();

    let options = ClientOptions {
        username: client_cfg.username.clone(),
        chunk_size: client_cfg.chunk_size,
        response_timeout: client_cfg.response_timeout(),
        max_payload: config.server.max_payload_bytes,
    };
    let mut client = BackupClient::new(stream, crypto, options);
    if let Some(id) = known_id {
        client = client.with_client_id(id);
    }

    let client_id = client.connect().await.context("handshake failed")?;
    if known_id != Some(client_id) {
        identity::save(
            &client_cfg.identity_path,
            &client_cfg.username,
            client_id,
            client.crypto().keypair(),
        )?;
    }

    match client.send_file(&filename, &plaintext).await {
        Ok(report) => {
            println!("═══════════════════════════════════════");
            println!("  Backup complete");
            println!("═══════════════════════════════════════");
            println!("  File       : {}", report.filename);
            println!("  Client     : {}", report.client_id);
            println!("  Plaintext  : {} bytes", report.plaintext_size);
            println!("  Ciphertext : {} bytes", report.ciphertext_size);
            println!("  Checksum   : {}", report.checksum);
            println!("  Attempts   : {}", report.attempts);
            Ok(())
        }
        Err(ClientError::TransferFailed { attempts, .. }) => {
            bail!("transfer failed after {attempts} attempts")
        }
        Err(e) => Err(e).context("transfer failed"),
    }
}

fn cmd_init() -> Result<()> {
    let path = VaultlineConfig::write_default_if_missing()?;
    println!("Config: {}", path.display());
    Ok(())
}

fn print_usage() {
    println!("Usage: vaultline-ctl [--server <addr>] [--user <name>] <command>");
    println!();
    println!("Commands:");
    println!("  backup <file> [--name <name>]   Encrypt and back up one file");
    println!("  init                            Write a default config file");
    println!();
    println!("Options:");
    println!("  --server <addr>   Server address (overrides client.server_addr)");
    println!("  --user <name>     Username (overrides client.username)");
    println!();
    println!("Config: {}", VaultlineConfig::file_path().display());
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut server: Option<String> = None;
    let mut user: Option<String> = None;
    let mut name: Option<String> = None;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--server" => {
                i += 1;
                server = Some(args.get(i).context("--server requires a value")?.clone());
            }
            "--user" => {
                i += 1;
                user = Some(args.get(i).context("--user requires a value")?.clone());
            }
            "--name" => {
                i += 1;
                name = Some(args.get(i).context("--name requires a value")?.clone());
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["init"] => return cmd_init(),
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            return Ok(());
        }
        _ => {}
    }

    let mut config = VaultlineConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        VaultlineConfig::default()
    });
    if let Some(addr) = server {
        config.client.server_addr = addr;
    }
    if let Some(u) = user {
        config.client.username = u;
    }

    match remaining.as_slice() {
        ["backup", file] => cmd_backup(&config, Path::new(file), name.as_deref()).await,
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            print_usage();
            std::process::exit(1);
        }
    }
}
