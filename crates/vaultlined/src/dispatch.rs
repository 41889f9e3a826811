//! Routes decoded requests to their handlers.
//!
//! One handler per request variant, selected by an exhaustive match. Every
//! handler is synchronous: it validates the sender's prior state, mutates
//! the registry or the transfer table, and returns exactly one response.
//! Handlers never await, so no registry or table lock can be held across
//! network I/O.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use vaultline_core::crypto::{self, AesKey, AES_BLOCK_LEN};
use vaultline_core::message::{ClientId, FileChunk, Request, Response};
use vaultline_core::ProtocolError;
use vaultline_services::file_store::validate_filename;
use vaultline_services::{
    ChunkOutcome, ClientRegistry, ClientSession, ConnectionId, EventSink, FileStore,
    ProtocolEvent, RegistryError, TransferKey, TransferTable,
};

/// What one connection knows about its peer.
#[derive(Debug)]
pub struct ConnectionState {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    /// Set by a successful `Register` or `Reconnect`.
    pub bound_client: Option<ClientId>,
}

impl ConnectionState {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: ConnectionId::next(),
            peer,
            bound_client: None,
        }
    }
}

pub struct Dispatcher {
    registry: ClientRegistry,
    transfers: TransferTable,
    store: Arc<dyn FileStore>,
    events: Arc<dyn EventSink>,
    /// Largest announced ciphertext accepted. 0 = unlimited.
    max_file_size: u64,
}

impl Dispatcher {
    pub fn new(
        registry: ClientRegistry,
        transfers: TransferTable,
        store: Arc<dyn FileStore>,
        events: Arc<dyn EventSink>,
        max_file_size: u64,
    ) -> Self {
        Self {
            registry,
            transfers,
            store,
            events,
            max_file_size,
        }
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn transfers(&self) -> &TransferTable {
        &self.transfers
    }

    pub fn handle(
        &self,
        conn: &mut ConnectionState,
        request: Request,
    ) -> Result<Response, ProtocolError> {
        match request {
            Request::Register { username } => self.on_register(conn, username),
            Request::SendPublicKey {
                client_id,
                public_key,
            } => self.on_public_key(conn, client_id, &public_key),
            Request::Reconnect {
                client_id,
                username,
            } => self.on_reconnect(conn, client_id, &username),
            Request::SendFile(chunk) => self.on_file_chunk(conn, &chunk),
            Request::ChecksumAccept {
                client_id,
                filename,
            } => self.on_accept(conn, client_id, filename),
            Request::ChecksumRetry {
                client_id,
                filename,
            } => self.on_retry(conn, client_id, filename),
            Request::ChecksumAbort {
                client_id,
                filename,
            } => self.on_abort(conn, client_id, filename),
        }
    }

    /// Release everything the connection owned. Jobs it still had in
    /// flight are discarded; jobs of the same client on another connection
    /// (after a reconnect) are left alone.
    pub fn connection_closed(&self, conn: &ConnectionState, error: Option<&ProtocolError>) {
        for key in self.transfers.discard_owned(conn.id) {
            self.events.emit(ProtocolEvent::TransferAborted {
                client_id: key.client_id,
                filename: key.filename,
                reason: "connection ended mid-transfer".into(),
            });
        }
        self.events.emit(match error {
            None => ProtocolEvent::ConnectionClosed {
                peer: conn.peer,
                client_id: conn.bound_client,
            },
            Some(e) => ProtocolEvent::ConnectionFailed {
                peer: conn.peer,
                client_id: conn.bound_client,
                error: e.to_string(),
            },
        });
    }

    // ── Handlers ─────────────────────────────────────────────────────────────

    fn on_register(
        &self,
        conn: &mut ConnectionState,
        username: String,
    ) -> Result<Response, ProtocolError> {
        if let Some(bound) = conn.bound_client {
            return Err(ProtocolError::violation(format!(
                "connection already bound to client {bound}"
            )));
        }

        match self.registry.register(&username) {
            Ok(client_id) => {
                conn.bound_client = Some(client_id);
                self.events.emit(ProtocolEvent::ClientRegistered {
                    client_id,
                    username,
                });
                Ok(Response::RegisterAck { client_id })
            }
            Err(e) => {
                tracing::info!(peer = %conn.peer, %username, error = %e, "registration refused");
                Ok(Response::RegisterFailed)
            }
        }
    }

    fn on_public_key(
        &self,
        conn: &mut ConnectionState,
        client_id: ClientId,
        der: &[u8],
    ) -> Result<Response, ProtocolError> {
        self.bound_session(conn, client_id)?;

        let public_key = crypto::public_key_from_der(der)?;
        let aes = AesKey::generate();
        let wrapped = crypto::wrap_aes_key(&public_key, &aes)?;

        self.registry
            .store_public_key(&client_id, public_key)
            .map_err(registry_violation)?;
        self.registry
            .store_aes_key(&client_id, aes)
            .map_err(registry_violation)?;

        self.events.emit(ProtocolEvent::KeyExchanged { client_id });
        Ok(Response::KeyExchangeAck {
            client_id,
            wrapped_key: wrapped.into(),
        })
    }

    fn on_reconnect(
        &self,
        conn: &mut ConnectionState,
        client_id: ClientId,
        username: &str,
    ) -> Result<Response, ProtocolError> {
        if let Some(bound) = conn.bound_client {
            if bound != client_id {
                return Err(ProtocolError::violation(format!(
                    "connection already bound to client {bound}"
                )));
            }
        }

        let denied = Response::ReconnectDenied { client_id };
        let session = match self.registry.lookup(&client_id) {
            Ok(s) => s,
            Err(_) => {
                tracing::info!(peer = %conn.peer, client = %client_id, "reconnect for unknown client");
                return Ok(denied);
            }
        };
        if session.username != username {
            tracing::info!(client = %client_id, "reconnect username mismatch");
            return Ok(denied);
        }
        let Some(public_key) = session.rsa_public_key else {
            tracing::info!(client = %client_id, "reconnect before any key exchange");
            return Ok(denied);
        };

        let aes = AesKey::generate();
        let wrapped = crypto::wrap_aes_key(&public_key, &aes)?;
        self.registry
            .store_aes_key(&client_id, aes)
            .map_err(registry_violation)?;

        conn.bound_client = Some(client_id);
        self.events.emit(ProtocolEvent::ClientReconnected { client_id });
        Ok(Response::ReconnectAck {
            client_id,
            wrapped_key: wrapped.into(),
        })
    }

    fn on_file_chunk(
        &self,
        conn: &mut ConnectionState,
        chunk: &FileChunk,
    ) -> Result<Response, ProtocolError> {
        let client_id = chunk.client_id;
        let session = self.bound_session(conn, client_id)?;
        if !session.has_session_key() {
            return Err(ProtocolError::violation("file chunk before key exchange"));
        }

        validate_filename(&chunk.filename).map_err(|e| ProtocolError::violation(e.to_string()))?;
        if self.max_file_size > 0 && chunk.content_size > self.max_file_size {
            return Err(ProtocolError::violation(format!(
                "announced size {} exceeds limit {}",
                chunk.content_size, self.max_file_size
            )));
        }
        if chunk.content_size == 0 || chunk.content_size % AES_BLOCK_LEN as u64 != 0 {
            return Err(ProtocolError::violation(format!(
                "ciphertext size {} is not a positive multiple of {AES_BLOCK_LEN}",
                chunk.content_size
            )));
        }

        let key = TransferKey::new(client_id, chunk.filename.clone());
        let fresh = self.transfers.status(&key).is_none();

        let outcome = self
            .transfers
            .apply_chunk(conn.id, chunk)
            .map_err(|e| ProtocolError::violation(e.to_string()))?;
        self.registry.touch(&client_id);

        if fresh {
            self.events.emit(ProtocolEvent::TransferStarted {
                client_id,
                filename: chunk.filename.clone(),
                content_size: chunk.content_size,
            });
        }

        Ok(match outcome {
            ChunkOutcome::Partial { packet_number } => Response::ChunkAck {
                client_id,
                packet_number,
            },
            ChunkOutcome::Complete {
                checksum,
                content_size,
                attempt,
            } => {
                self.events.emit(ProtocolEvent::ChecksumReported {
                    client_id,
                    filename: chunk.filename.clone(),
                    checksum,
                    attempt,
                });
                Response::ChecksumReport {
                    client_id,
                    content_size,
                    filename: chunk.filename.clone(),
                    checksum,
                }
            }
        })
    }

    fn on_accept(
        &self,
        conn: &mut ConnectionState,
        client_id: ClientId,
        filename: String,
    ) -> Result<Response, ProtocolError> {
        let session = self.bound_session(conn, client_id)?;
        let key = TransferKey::new(client_id, filename);

        // The job leaves the table before any decryption or disk work.
        let job = self
            .transfers
            .take_verifying(&key)
            .map_err(|e| ProtocolError::violation(e.to_string()))?;

        let abort = |reason: String| {
            self.events.emit(ProtocolEvent::TransferAborted {
                client_id,
                filename: key.filename.clone(),
                reason,
            });
        };

        let Some(aes) = session.aes_key else {
            abort("no session key".into());
            return Err(ProtocolError::violation("checksum accept before key exchange"));
        };

        let orig_size = job.orig_size;
        let plaintext = match aes.decrypt(&job.into_ciphertext()) {
            Ok(p) => p,
            Err(e) => {
                abort(format!("decryption failed: {e}"));
                return Err(e.into());
            }
        };
        if plaintext.len() as u64 != orig_size {
            tracing::warn!(
                client = %client_id,
                filename = %key.filename,
                announced = orig_size,
                actual = plaintext.len(),
                "plaintext size differs from announced size"
            );
        }

        match self.persist(&client_id, &key.filename, &plaintext) {
            Ok(path) => {
                self.registry.touch(&client_id);
                self.events.emit(ProtocolEvent::FileCommitted {
                    client_id,
                    filename: key.filename.clone(),
                    path,
                });
                Ok(Response::MessageAck { client_id })
            }
            Err(e) => {
                abort(e.to_string());
                Err(e)
            }
        }
    }

    fn persist(
        &self,
        client_id: &ClientId,
        filename: &str,
        plaintext: &[u8],
    ) -> Result<PathBuf, ProtocolError> {
        let internal = |e: vaultline_services::StoreError| ProtocolError::Internal(e.to_string());

        let handle = self
            .store
            .begin(client_id, filename, plaintext.len() as u64)
            .map_err(internal)?;
        if let Err(e) = self.store.append(handle, plaintext) {
            let _ = self.store.discard(handle);
            return Err(internal(e));
        }
        self.store.commit(handle).map_err(internal)
    }

    fn on_retry(
        &self,
        conn: &mut ConnectionState,
        client_id: ClientId,
        filename: String,
    ) -> Result<Response, ProtocolError> {
        self.bound_session(conn, client_id)?;
        let key = TransferKey::new(client_id, filename);
        let next = self
            .transfers
            .begin_retry(&key)
            .map_err(|e| ProtocolError::violation(e.to_string()))?;
        tracing::info!(client = %client_id, filename = %key.filename, attempt = next, "client requested resend");
        Ok(Response::MessageAck { client_id })
    }

    fn on_abort(
        &self,
        conn: &mut ConnectionState,
        client_id: ClientId,
        filename: String,
    ) -> Result<Response, ProtocolError> {
        self.bound_session(conn, client_id)?;
        let key = TransferKey::new(client_id, filename);
        let job = self
            .transfers
            .remove(&key)
            .ok_or_else(|| ProtocolError::violation(format!("no transfer for {key}")))?;

        self.events.emit(ProtocolEvent::TransferAborted {
            client_id,
            filename: key.filename,
            reason: format!("client gave up after {} attempts", job.checksum_attempts),
        });
        Ok(Response::MessageAck { client_id })
    }

    // ── Checks ───────────────────────────────────────────────────────────────

    /// The client must exist and be the one this connection registered as.
    fn bound_session(
        &self,
        conn: &ConnectionState,
        client_id: ClientId,
    ) -> Result<ClientSession, ProtocolError> {
        let session = self.registry.lookup(&client_id).map_err(registry_violation)?;
        if conn.bound_client != Some(client_id) {
            return Err(ProtocolError::violation(format!(
                "client {client_id} is not bound to this connection"
            )));
        }
        Ok(session)
    }
}

fn registry_violation(e: RegistryError) -> ProtocolError {
    ProtocolError::violation(e.to_string())
}
