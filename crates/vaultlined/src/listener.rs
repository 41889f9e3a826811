//! TCP accept loop.
//!
//! One task per accepted connection. A semaphore caps concurrent
//! connections; anything over the cap is closed immediately. Shutdown stops
//! accepting but leaves in-flight connections to finish.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};

use vaultline_core::config::ServerConfig;
use vaultline_core::Codec;

use crate::connection::Connection;
use crate::dispatch::Dispatcher;

pub struct Server {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    limit: Arc<Semaphore>,
    codec: Codec,
    idle_timeout: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl Server {
    pub async fn bind(
        config: &ServerConfig,
        dispatcher: Arc<Dispatcher>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.bind_addr))?;
        Ok(Self {
            listener,
            dispatcher,
            limit: Arc::new(Semaphore::new(config.max_connections.max(1))),
            codec: Codec::new(config.max_payload_bytes),
            idle_timeout: config.idle_timeout(),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(mut self) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, "listening");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("listener shutting down");
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    let permit = match self.limit.clone().try_acquire_owned() {
                        Ok(p) => p,
                        Err(_) => {
                            tracing::warn!(%peer, "connection limit reached, refusing");
                            drop(stream);
                            continue;
                        }
                    };

                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%peer, error = %e, "set_nodelay failed");
                    }

                    let conn = Connection::new(
                        stream,
                        peer,
                        self.dispatcher.clone(),
                        self.codec,
                        self.idle_timeout,
                    );
                    tokio::spawn(async move {
                        if let Err(e) = conn.run().await {
                            tracing::debug!(%peer, error = %e, "connection ended with error");
                        }
                        drop(permit);
                    });
                }
            }
        }
    }
}
