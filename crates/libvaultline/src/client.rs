//! Client state machine: register → exchange keys → transfer → verify.
//!
//! ```text
//! Start ─┬─ (known id) → Reconnecting ─┬─ ack ──────────────┐
//!        │                             └─ denied ─┐         │
//!        └────────────────────────────→ Registering → KeyExchanging
//!                                                           │
//!          ┌────────────── Retrying ←── mismatch (n < 3) ───┤
//!          ↓                                                │
//!     Transferring → Verifying ── match ──→ Done            │
//!                              └─ mismatch (n = 3) → Aborted
//! ```
//!
//! The file is encrypted once. Every retry resends the identical ciphertext
//! so the checksum keeps its meaning. The only state shared across steps is
//! the [`CryptoContext`].

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use vaultline_core::crypto::CryptoError;
use vaultline_core::integrity::{Checksum, ChecksumHasher, Decision, IntegrityController};
use vaultline_core::message::{ClientId, FileChunk, Request, Response, MAX_NAME_LEN};
use vaultline_core::transport::{read_message, write_request};
use vaultline_core::wire::{Codec, DEFAULT_MAX_PAYLOAD};
use vaultline_core::{ErrorCode, ProtocolError, TransportError};

use crate::context::CryptoContext;

/// Fixed part of a `SendFile` payload before the filename bytes.
const SEND_FILE_OVERHEAD: usize = ClientId::LEN + 8 + 8 + 4 + 4 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Start,
    Reconnecting,
    Registering,
    /// Also the resting state once a session key is installed.
    KeyExchanging,
    Transferring,
    Verifying,
    Retrying,
    Done,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub username: String,
    /// Ciphertext bytes per `SendFile`. Clamped to what fits in one frame.
    pub chunk_size: usize,
    pub response_timeout: Duration,
    pub max_payload: usize,
}

impl ClientOptions {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            chunk_size: 64 * 1024,
            response_timeout: Duration::from_secs(30),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// Outcome of a verified, committed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub client_id: ClientId,
    pub filename: String,
    pub plaintext_size: u64,
    pub ciphertext_size: u64,
    pub checksum: Checksum,
    /// Checksum comparisons it took, 1 to 3.
    pub attempts: u8,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("server refused registration of {0:?}")]
    RegistrationRefused(String),

    #[error("server error ({code:?}): {reason}")]
    Server { code: ErrorCode, reason: String },

    #[error("transfer failed after {attempts} attempts")]
    TransferFailed {
        attempts: u8,
        #[source]
        source: ProtocolError,
    },

    #[error("cannot {1} while {0:?}")]
    InvalidState(ClientState, &'static str),

    #[error("invalid option: {0}")]
    InvalidOptions(&'static str),
}

impl From<CryptoError> for ClientError {
    fn from(e: CryptoError) -> Self {
        ClientError::Protocol(e.into())
    }
}

pub struct BackupClient<S> {
    stream: S,
    codec: Codec,
    options: ClientOptions,
    crypto: CryptoContext,
    client_id: Option<ClientId>,
    state: ClientState,
}

impl<S> BackupClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, crypto: CryptoContext, options: ClientOptions) -> Self {
        Self {
            stream,
            codec: Codec::new(options.max_payload),
            options,
            crypto,
            client_id: None,
            state: ClientState::Start,
        }
    }

    /// Try `Reconnect` with a previously issued id before registering.
    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn crypto(&self) -> &CryptoContext {
        &self.crypto
    }

    /// Connect and back up one file.
    pub async fn run(
        &mut self,
        filename: &str,
        plaintext: &[u8],
    ) -> Result<TransferReport, ClientError> {
        self.connect().await?;
        self.send_file(filename, plaintext).await
    }

    /// Establish identity and a session key.
    pub async fn connect(&mut self) -> Result<ClientId, ClientError> {
        if self.state != ClientState::Start {
            return Err(ClientError::InvalidState(self.state, "connect"));
        }
        let result = self.handshake().await;
        if result.is_err() {
            self.state = ClientState::Aborted;
        }
        result
    }

    async fn handshake(&mut self) -> Result<ClientId, ClientError> {
        let username = self.options.username.clone();

        if let Some(id) = self.client_id {
            self.state = ClientState::Reconnecting;
            self.send(&Request::Reconnect {
                client_id: id,
                username: username.clone(),
            })
            .await?;
            match self.receive().await? {
                Response::ReconnectAck {
                    client_id,
                    wrapped_key,
                } if client_id == id => {
                    self.crypto.install_wrapped_key(&wrapped_key)?;
                    self.state = ClientState::KeyExchanging;
                    tracing::info!(client = %id, "reconnected with fresh session key");
                    return Ok(id);
                }
                Response::ReconnectDenied { .. } => {
                    tracing::info!(client = %id, "reconnect denied, registering afresh");
                    self.client_id = None;
                }
                other => return Err(self.unexpected(&other)),
            }
        }

        self.state = ClientState::Registering;
        self.send(&Request::Register {
            username: username.clone(),
        })
        .await?;
        let id = match self.receive().await? {
            Response::RegisterAck { client_id } => client_id,
            Response::RegisterFailed => return Err(ClientError::RegistrationRefused(username)),
            other => return Err(self.unexpected(&other)),
        };
        self.client_id = Some(id);
        tracing::info!(client = %id, %username, "registered");

        self.state = ClientState::KeyExchanging;
        let der = self.crypto.public_der()?;
        self.send(&Request::SendPublicKey {
            client_id: id,
            public_key: der.into(),
        })
        .await?;
        match self.receive().await? {
            Response::KeyExchangeAck {
                client_id,
                wrapped_key,
            } if client_id == id => self.crypto.install_wrapped_key(&wrapped_key)?,
            other => return Err(self.unexpected(&other)),
        }
        tracing::debug!(client = %id, "session key installed");
        Ok(id)
    }

    /// Encrypt, send and verify one file.
    pub async fn send_file(
        &mut self,
        filename: &str,
        plaintext: &[u8],
    ) -> Result<TransferReport, ClientError> {
        let id = match (self.state, self.client_id) {
            (ClientState::KeyExchanging | ClientState::Done, Some(id)) => id,
            (state, _) => return Err(ClientError::InvalidState(state, "send a file")),
        };
        if filename.is_empty() || filename.len() > MAX_NAME_LEN {
            return Err(ClientError::InvalidOptions("filename must be 1 to 255 bytes"));
        }
        let ciphertext = match self.crypto.session_key() {
            Some(key) => Bytes::from(key.encrypt(plaintext)),
            None => return Err(ClientError::InvalidState(self.state, "send a file")),
        };

        let result = self
            .transfer(id, filename, plaintext.len() as u64, ciphertext)
            .await;
        self.state = if result.is_ok() {
            ClientState::Done
        } else {
            ClientState::Aborted
        };
        result
    }

    async fn transfer(
        &mut self,
        id: ClientId,
        filename: &str,
        orig_size: u64,
        ciphertext: Bytes,
    ) -> Result<TransferReport, ClientError> {
        let chunk_size = self.chunk_size_for(filename)?;
        let mut integrity = IntegrityController::new();

        loop {
            self.state = ClientState::Transferring;
            let (local, remote) = self
                .send_chunks(id, filename, orig_size, &ciphertext, chunk_size)
                .await?;

            self.state = ClientState::Verifying;
            let attempt = integrity.attempts() + 1;
            let decision = integrity
                .record(local, remote)
                .map_err(|e| ProtocolError::violation(e.to_string()))?;

            match decision {
                Decision::Accept => {
                    self.send(&Request::ChecksumAccept {
                        client_id: id,
                        filename: filename.to_string(),
                    })
                    .await?;
                    self.expect_ack(id).await?;
                    tracing::info!(client = %id, filename, attempt, "backup verified");
                    return Ok(TransferReport {
                        client_id: id,
                        filename: filename.to_string(),
                        plaintext_size: orig_size,
                        ciphertext_size: ciphertext.len() as u64,
                        checksum: local,
                        attempts: attempt,
                    });
                }
                Decision::Retry { next_attempt } => {
                    tracing::warn!(
                        client = %id,
                        filename,
                        local = local.value(),
                        remote = remote.value(),
                        next_attempt,
                        "checksum mismatch, resending"
                    );
                    self.state = ClientState::Retrying;
                    self.send(&Request::ChecksumRetry {
                        client_id: id,
                        filename: filename.to_string(),
                    })
                    .await?;
                    self.expect_ack(id).await?;
                }
                Decision::Abort { attempts } => {
                    tracing::error!(client = %id, filename, attempts, "checksum never matched, aborting");
                    let notified = match self
                        .send(&Request::ChecksumAbort {
                            client_id: id,
                            filename: filename.to_string(),
                        })
                        .await
                    {
                        Ok(()) => self.expect_ack(id).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = notified {
                        tracing::debug!(error = %e, "server did not acknowledge abort");
                    }
                    return Err(ClientError::TransferFailed {
                        attempts,
                        source: ProtocolError::IntegrityMismatch {
                            attempt,
                            local,
                            remote,
                        },
                    });
                }
            }
        }
    }

    /// Send every chunk in order. Returns (local checksum, server's checksum).
    async fn send_chunks(
        &mut self,
        id: ClientId,
        filename: &str,
        orig_size: u64,
        ciphertext: &Bytes,
        chunk_size: usize,
    ) -> Result<(Checksum, Checksum), ClientError> {
        let total = u32::try_from(ciphertext.len().div_ceil(chunk_size))
            .map_err(|_| ClientError::InvalidOptions("file needs too many packets"))?;
        let mut hasher = ChecksumHasher::new();

        for (i, start) in (0..ciphertext.len()).step_by(chunk_size).enumerate() {
            let packet_number = i as u32 + 1;
            let data = ciphertext.slice(start..(start + chunk_size).min(ciphertext.len()));
            hasher.update(&data);

            self.send(&Request::SendFile(FileChunk {
                client_id: id,
                content_size: ciphertext.len() as u64,
                orig_size,
                packet_number,
                total_packets: total,
                filename: filename.to_string(),
                data,
            }))
            .await?;

            let response = self.receive().await?;
            if packet_number < total {
                match response {
                    Response::ChunkAck {
                        client_id,
                        packet_number: acked,
                    } if client_id == id && acked == packet_number => {}
                    other => return Err(self.unexpected(&other)),
                }
                continue;
            }

            return match response {
                Response::ChecksumReport {
                    client_id,
                    content_size,
                    filename: reported,
                    checksum,
                } if client_id == id && reported == filename => {
                    if content_size != ciphertext.len() as u64 {
                        return Err(ProtocolError::violation(format!(
                            "server reports {content_size} bytes, sent {}",
                            ciphertext.len()
                        ))
                        .into());
                    }
                    Ok((hasher.finalize(), checksum))
                }
                other => Err(self.unexpected(&other)),
            };
        }

        Err(ProtocolError::violation("no packets to send").into())
    }

    fn chunk_size_for(&self, filename: &str) -> Result<usize, ClientError> {
        let room = self
            .codec
            .max_payload()
            .saturating_sub(SEND_FILE_OVERHEAD + filename.len());
        match self.options.chunk_size.min(room) {
            0 => Err(ClientError::InvalidOptions(
                "chunk size and max payload leave no room for data",
            )),
            n => Ok(n),
        }
    }

    async fn expect_ack(&mut self, id: ClientId) -> Result<(), ClientError> {
        match self.receive().await? {
            Response::MessageAck { client_id } if client_id == id => Ok(()),
            other => Err(self.unexpected(&other)),
        }
    }

    async fn send(&mut self, request: &Request) -> Result<(), ClientError> {
        write_request(&mut self.stream, &self.codec, request).await?;
        Ok(())
    }

    /// Next response, bounded by the response timeout. `GeneralError` is
    /// surfaced as [`ClientError::Server`].
    async fn receive(&mut self) -> Result<Response, ClientError> {
        let limit = self.options.response_timeout;
        let msg = tokio::time::timeout(limit, read_message(&mut self.stream, &self.codec))
            .await
            .map_err(|_| ProtocolError::from(TransportError::Timeout(limit)))??;
        match Response::from_message(&msg)? {
            Response::GeneralError { code, reason } => Err(ClientError::Server { code, reason }),
            other => Ok(other),
        }
    }

    fn unexpected(&self, response: &Response) -> ClientError {
        ProtocolError::violation(format!(
            "unexpected {:?} while {:?}",
            response.opcode(),
            self.state
        ))
        .into()
    }
}
