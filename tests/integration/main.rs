//! Vaultline integration test harness.
//!
//! Every test starts its own in-process server on loopback TCP with a
//! private storage root, then drives it with real clients:
//!
//!   cargo test --test integration
//!
//! Servers and storage roots are torn down on drop, so tests can run in
//! parallel without seeing each other's files.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use libvaultline::{BackupClient, ClientOptions, CryptoContext};
use vaultline_core::config::VaultlineConfig;
use vaultline_core::ClientId;
use vaultline_services::{ClientRegistry, DiskFileStore, MemorySink, TransferTable};
use vaultlined::{Dispatcher, Server};

mod backup;
mod fault;

// ── Harness ───────────────────────────────────────────────────────────────────

pub struct TestServer {
    pub addr: SocketAddr,
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<DiskFileStore>,
    pub events: Arc<MemorySink>,
    root: PathBuf,
    shutdown: broadcast::Sender<()>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl TestServer {
    pub async fn start(name: &str) -> Result<Self> {
        Self::start_with(name, |_| {}).await
    }

    /// Start with a config adjusted by `tweak`. The bind address and
    /// storage root are always overridden to loopback and a scratch dir.
    pub async fn start_with(name: &str, tweak: impl FnOnce(&mut VaultlineConfig)) -> Result<Self> {
        let root = std::env::temp_dir().join(format!(
            "vaultline-it-{}-{name}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);

        let mut config = VaultlineConfig::default();
        tweak(&mut config);
        config.server.bind_addr = "127.0.0.1:0".into();
        config.storage.root = root.clone();

        let store = Arc::new(DiskFileStore::new(&config.storage.root)?);
        let events = Arc::new(MemorySink::new());
        let dispatcher = Arc::new(Dispatcher::new(
            ClientRegistry::new(config.registry.unique_usernames),
            TransferTable::new(),
            store.clone(),
            events.clone(),
            config.storage.max_file_size,
        ));

        let (shutdown, _) = broadcast::channel(1);
        let server = Server::bind(&config.server, dispatcher.clone(), shutdown.subscribe()).await?;
        let addr = server.local_addr()?;
        let handle = tokio::spawn(server.run());

        Ok(Self {
            addr,
            dispatcher,
            store,
            events,
            root,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Contents of a committed backup, if any.
    pub fn committed(&self, client_id: &ClientId, filename: &str) -> Option<Vec<u8>> {
        std::fs::read(self.store.path_for(client_id, filename)).ok()
    }

    /// Signal shutdown and wait for the listener to return.
    pub async fn stop(mut self) -> Result<()> {
        let _ = self.shutdown.send(());
        match self.handle.take() {
            Some(handle) => handle.await?,
            None => Ok(()),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

pub fn options(username: &str) -> ClientOptions {
    ClientOptions::new(username)
}

/// A fresh client (new key pair) connected to `addr`.
pub async fn client(addr: SocketAddr, username: &str) -> Result<BackupClient<TcpStream>> {
    client_with(addr, CryptoContext::generate()?, options(username)).await
}

pub async fn client_with(
    addr: SocketAddr,
    crypto: CryptoContext,
    options: ClientOptions,
) -> Result<BackupClient<TcpStream>> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(BackupClient::new(stream, crypto, options))
}

/// Deterministic test payload.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
