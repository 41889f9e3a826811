//! Observer interface for protocol activity.
//!
//! Outside collaborators (logging, dashboards) see the server only through
//! these events. Sinks are called synchronously from connection tasks and
//! must not block.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Mutex;

use vaultline_core::integrity::Checksum;
use vaultline_core::message::ClientId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    ClientRegistered {
        client_id: ClientId,
        username: String,
    },
    KeyExchanged {
        client_id: ClientId,
    },
    ClientReconnected {
        client_id: ClientId,
    },
    TransferStarted {
        client_id: ClientId,
        filename: String,
        content_size: u64,
    },
    ChecksumReported {
        client_id: ClientId,
        filename: String,
        checksum: Checksum,
        attempt: u8,
    },
    FileCommitted {
        client_id: ClientId,
        filename: String,
        path: PathBuf,
    },
    TransferAborted {
        client_id: ClientId,
        filename: String,
        reason: String,
    },
    ConnectionClosed {
        peer: SocketAddr,
        client_id: Option<ClientId>,
    },
    ConnectionFailed {
        peer: SocketAddr,
        client_id: Option<ClientId>,
        error: String,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: ProtocolEvent);
}

/// Default sink: one structured log line per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::ClientRegistered {
                client_id,
                username,
            } => tracing::info!(client = %client_id, %username, "client registered"),
            ProtocolEvent::KeyExchanged { client_id } => {
                tracing::info!(client = %client_id, "session key issued")
            }
            ProtocolEvent::ClientReconnected { client_id } => {
                tracing::info!(client = %client_id, "client reconnected")
            }
            ProtocolEvent::TransferStarted {
                client_id,
                filename,
                content_size,
            } => tracing::info!(client = %client_id, %filename, content_size, "transfer started"),
            ProtocolEvent::ChecksumReported {
                client_id,
                filename,
                checksum,
                attempt,
            } => tracing::debug!(
                client = %client_id,
                %filename,
                checksum = checksum.value(),
                attempt,
                "checksum reported"
            ),
            ProtocolEvent::FileCommitted {
                client_id,
                filename,
                path,
            } => tracing::info!(
                client = %client_id,
                %filename,
                path = %path.display(),
                "file committed"
            ),
            ProtocolEvent::TransferAborted {
                client_id,
                filename,
                reason,
            } => tracing::warn!(client = %client_id, %filename, %reason, "transfer aborted"),
            ProtocolEvent::ConnectionClosed { peer, client_id } => tracing::debug!(
                %peer,
                client = ?client_id,
                "connection closed"
            ),
            ProtocolEvent::ConnectionFailed {
                peer,
                client_id,
                error,
            } => tracing::warn!(
                %peer,
                client = ?client_id,
                %error,
                "connection failed"
            ),
        }
    }
}

/// Keeps every event in memory. Used by tests to assert on what happened.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<ProtocolEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProtocolEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, pred: impl Fn(&ProtocolEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: ProtocolEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
