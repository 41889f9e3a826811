//! In-flight transfers, keyed by `(client_id, filename)`.
//!
//! A job buffers ciphertext in packet order and checksums it as it arrives.
//! Only the dispatcher drives status changes. Terminal jobs are removed from
//! the table, so a job found here is always Pending, Receiving or Verifying.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use vaultline_core::integrity::{Checksum, ChecksumHasher, MAX_ATTEMPTS};
use vaultline_core::message::{ClientId, FileChunk};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Waiting for packet 1 of the current attempt.
    Pending,
    Receiving,
    /// All bytes in, checksum reported, waiting on the client's verdict.
    Verifying,
    Committed,
    Aborted,
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub client_id: ClientId,
    pub filename: String,
}

impl TransferKey {
    pub fn new(client_id: ClientId, filename: impl Into<String>) -> Self {
        Self {
            client_id,
            filename: filename.into(),
        }
    }
}

/// Identifies one network connection for the lifetime of the process.
/// Jobs are owned by the connection that sent their first packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_id, self.filename)
    }
}

pub struct TransferJob {
    pub key: TransferKey,
    pub owner: ConnectionId,
    /// Announced ciphertext size.
    pub expected_size: u64,
    /// Announced plaintext size.
    pub orig_size: u64,
    pub total_packets: u32,
    pub bytes_received: u64,
    /// Checksums reported so far. Never exceeds [`MAX_ATTEMPTS`].
    pub checksum_attempts: u8,
    pub status: TransferStatus,
    pub started_at: Instant,
    next_packet: u32,
    ciphertext: BytesMut,
    hasher: ChecksumHasher,
}

impl fmt::Debug for TransferJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferJob")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("expected_size", &self.expected_size)
            .field("bytes_received", &self.bytes_received)
            .field("checksum_attempts", &self.checksum_attempts)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Result of applying one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// More packets expected.
    Partial { packet_number: u32 },
    /// The last packet arrived; this is the checksum over the whole ciphertext.
    Complete {
        checksum: Checksum,
        content_size: u64,
        attempt: u8,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("no transfer in progress for {0}")]
    NoTransfer(TransferKey),

    #[error("packet {got} out of order, expected {expected}")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("packet numbering invalid: {packet_number} of {total_packets}")]
    BadPacketNumber {
        packet_number: u32,
        total_packets: u32,
    },

    #[error("chunk header disagrees with the transfer announced in packet 1")]
    HeaderChanged,

    #[error("received {received} bytes, more than the announced {expected}")]
    Overflow { expected: u64, received: u64 },

    #[error("final packet arrived with {received} of {expected} bytes")]
    Incomplete { expected: u64, received: u64 },

    #[error("transfer is {status}, cannot {action}")]
    WrongState {
        status: TransferStatus,
        action: &'static str,
    },

    #[error("all checksum attempts used")]
    AttemptsExhausted,

    #[error("{key} belongs to {owner}")]
    NotOwner { key: TransferKey, owner: ConnectionId },
}

impl TransferJob {
    fn new(owner: ConnectionId, chunk: &FileChunk) -> Self {
        Self {
            key: TransferKey::new(chunk.client_id, chunk.filename.clone()),
            owner,
            expected_size: chunk.content_size,
            orig_size: chunk.orig_size,
            total_packets: chunk.total_packets,
            bytes_received: 0,
            checksum_attempts: 0,
            status: TransferStatus::Pending,
            started_at: Instant::now(),
            next_packet: 1,
            ciphertext: BytesMut::new(),
            hasher: ChecksumHasher::new(),
        }
    }

    /// Append one chunk. Packets must arrive in order, starting at 1.
    pub fn accept_chunk(&mut self, chunk: &FileChunk) -> Result<ChunkOutcome, TransferError> {
        match self.status {
            TransferStatus::Pending | TransferStatus::Receiving => {}
            status => {
                return Err(TransferError::WrongState {
                    status,
                    action: "accept a chunk",
                })
            }
        }
        if chunk.content_size != self.expected_size
            || chunk.orig_size != self.orig_size
            || chunk.total_packets != self.total_packets
        {
            return Err(TransferError::HeaderChanged);
        }
        if chunk.packet_number != self.next_packet {
            return Err(TransferError::OutOfOrder {
                expected: self.next_packet,
                got: chunk.packet_number,
            });
        }

        let received = self.bytes_received + chunk.data.len() as u64;
        if received > self.expected_size {
            return Err(TransferError::Overflow {
                expected: self.expected_size,
                received,
            });
        }

        if chunk.is_final() {
            if received != self.expected_size {
                return Err(TransferError::Incomplete {
                    expected: self.expected_size,
                    received,
                });
            }
            if self.checksum_attempts >= MAX_ATTEMPTS {
                return Err(TransferError::AttemptsExhausted);
            }
        }

        self.ciphertext.extend_from_slice(&chunk.data);
        self.hasher.update(&chunk.data);
        self.bytes_received = received;
        self.status = TransferStatus::Receiving;

        if !chunk.is_final() {
            self.next_packet += 1;
            return Ok(ChunkOutcome::Partial {
                packet_number: chunk.packet_number,
            });
        }

        let hasher = std::mem::take(&mut self.hasher);
        self.checksum_attempts += 1;
        self.status = TransferStatus::Verifying;
        Ok(ChunkOutcome::Complete {
            checksum: hasher.finalize(),
            content_size: self.bytes_received,
            attempt: self.checksum_attempts,
        })
    }

    /// Reset for a resend of the same ciphertext. Returns the upcoming attempt number.
    pub fn begin_retry(&mut self) -> Result<u8, TransferError> {
        if self.status != TransferStatus::Verifying {
            return Err(TransferError::WrongState {
                status: self.status,
                action: "retry",
            });
        }
        if self.checksum_attempts >= MAX_ATTEMPTS {
            return Err(TransferError::AttemptsExhausted);
        }
        self.ciphertext.clear();
        self.hasher = ChecksumHasher::new();
        self.bytes_received = 0;
        self.next_packet = 1;
        self.status = TransferStatus::Pending;
        Ok(self.checksum_attempts + 1)
    }

    /// The reassembled ciphertext. Only meaningful once `Verifying`.
    pub fn ciphertext(&self) -> Bytes {
        self.ciphertext.clone().freeze()
    }

    pub fn into_ciphertext(self) -> Bytes {
        self.ciphertext.freeze()
    }
}

/// Shared table of in-flight jobs.
#[derive(Clone, Default)]
pub struct TransferTable {
    jobs: Arc<DashMap<TransferKey, TransferJob>>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a chunk to its job, creating the job on packet 1.
    ///
    /// Packet 1 from a different connection replaces the job, so a client
    /// that reconnected can restart a transfer its old connection left
    /// behind. Any other packet must come from the owning connection.
    pub fn apply_chunk(
        &self,
        owner: ConnectionId,
        chunk: &FileChunk,
    ) -> Result<ChunkOutcome, TransferError> {
        if chunk.packet_number == 0
            || chunk.total_packets == 0
            || chunk.packet_number > chunk.total_packets
        {
            return Err(TransferError::BadPacketNumber {
                packet_number: chunk.packet_number,
                total_packets: chunk.total_packets,
            });
        }

        let key = TransferKey::new(chunk.client_id, chunk.filename.clone());
        match self.jobs.entry(key) {
            Entry::Occupied(mut slot) if slot.get().owner == owner => {
                slot.get_mut().accept_chunk(chunk)
            }
            Entry::Occupied(mut slot) => {
                if chunk.packet_number != 1 {
                    return Err(TransferError::NotOwner {
                        key: slot.key().clone(),
                        owner: slot.get().owner,
                    });
                }
                let mut job = TransferJob::new(owner, chunk);
                let outcome = job.accept_chunk(chunk)?;
                tracing::info!(
                    key = %slot.key(),
                    from = %slot.get().owner,
                    to = %owner,
                    "transfer restarted on a new connection"
                );
                slot.insert(job);
                Ok(outcome)
            }
            Entry::Vacant(slot) => {
                if chunk.packet_number != 1 {
                    return Err(TransferError::NoTransfer(slot.into_key()));
                }
                let mut job = TransferJob::new(owner, chunk);
                let outcome = job.accept_chunk(chunk)?;
                slot.insert(job);
                Ok(outcome)
            }
        }
    }

    pub fn begin_retry(&self, key: &TransferKey) -> Result<u8, TransferError> {
        let mut job = self
            .jobs
            .get_mut(key)
            .ok_or_else(|| TransferError::NoTransfer(key.clone()))?;
        job.begin_retry()
    }

    /// Remove a job that has reported its checksum, for commit.
    pub fn take_verifying(&self, key: &TransferKey) -> Result<TransferJob, TransferError> {
        if let Some((_, job)) = self
            .jobs
            .remove_if(key, |_, job| job.status == TransferStatus::Verifying)
        {
            return Ok(job);
        }
        match self.jobs.get(key) {
            Some(job) => Err(TransferError::WrongState {
                status: job.status,
                action: "commit",
            }),
            None => Err(TransferError::NoTransfer(key.clone())),
        }
    }

    /// Remove a job regardless of status.
    pub fn remove(&self, key: &TransferKey) -> Option<TransferJob> {
        self.jobs.remove(key).map(|(_, job)| job)
    }

    /// Discard every job owned by `owner`. Returns the discarded keys.
    pub fn discard_owned(&self, owner: ConnectionId) -> Vec<TransferKey> {
        let mut dropped = Vec::new();
        self.jobs.retain(|key, job| {
            let keep = job.owner != owner;
            if !keep {
                dropped.push(key.clone());
            }
            keep
        });
        dropped
    }

    pub fn status(&self, key: &TransferKey) -> Option<TransferStatus> {
        self.jobs.get(key).map(|job| job.status)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
