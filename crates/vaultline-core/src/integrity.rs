//! Checksum and the bounded verify/retry state machine.
//!
//! The checksum is the POSIX `cksum` CRC: CRC-32 (poly 0x04C11DB7, no
//! reflection) over the data followed by the data length in the fewest
//! little-endian bytes, final value inverted. It is computed over the
//! ciphertext exactly as it travels on the wire.
//!
//! A transfer gets at most [`MAX_ATTEMPTS`] checksum comparisons. The
//! first mismatch and the second mismatch produce a retry; the third is
//! final.

use std::fmt;

use crc::{Crc, Digest, CRC_32_CKSUM};
use serde::{Deserialize, Serialize};
use thiserror::Error;

static CKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_CKSUM);

/// Maximum checksum comparisons per transfer.
pub const MAX_ATTEMPTS: u8 = 3;

/// A 32-bit POSIX cksum value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum(pub u32);

impl Checksum {
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({:#010x})", self.0)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Checksum a complete buffer.
pub fn compute_checksum(data: &[u8]) -> Checksum {
    let mut hasher = ChecksumHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Incremental checksum, for data that arrives in chunks.
///
/// Feeding the same bytes in any split yields the same value as
/// [`compute_checksum`] over the concatenation.
pub struct ChecksumHasher {
    digest: Digest<'static, u32>,
    length: u64,
}

impl ChecksumHasher {
    pub fn new() -> Self {
        Self {
            digest: CKSUM.digest(),
            length: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
        self.length += data.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn finalize(mut self) -> Checksum {
        let mut n = self.length;
        while n != 0 {
            self.digest.update(&[(n & 0xff) as u8]);
            n >>= 8;
        }
        Checksum(self.digest.finalize())
    }
}

impl Default for ChecksumHasher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Verification ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Match,
    Mismatch,
}

pub fn verify(local: Checksum, remote: Checksum) -> Verdict {
    if local == remote {
        Verdict::Match
    } else {
        Verdict::Mismatch
    }
}

/// Where a transfer stands in its verification lifecycle.
///
/// `Attempt(n)` is 1-based and never exceeds [`MAX_ATTEMPTS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyState {
    Attempt(u8),
    Verified,
    FailedFinal,
}

impl VerifyState {
    pub fn first() -> Self {
        VerifyState::Attempt(1)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, VerifyState::Verified | VerifyState::FailedFinal)
    }

    /// Apply one comparison result.
    pub fn advance(self, verdict: Verdict) -> Result<Self, IntegrityError> {
        match (self, verdict) {
            (VerifyState::Attempt(_), Verdict::Match) => Ok(VerifyState::Verified),
            (VerifyState::Attempt(n), Verdict::Mismatch) if n >= MAX_ATTEMPTS => {
                Ok(VerifyState::FailedFinal)
            }
            (VerifyState::Attempt(n), Verdict::Mismatch) => Ok(VerifyState::Attempt(n + 1)),
            (terminal, _) => Err(IntegrityError::AlreadyTerminal(terminal)),
        }
    }
}

/// What the sender should do after a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Retry { next_attempt: u8 },
    Abort { attempts: u8 },
}

/// Drives one transfer's verification. The sender owns one of these per file.
#[derive(Debug, Clone)]
pub struct IntegrityController {
    state: VerifyState,
    attempts: u8,
}

impl IntegrityController {
    pub fn new() -> Self {
        Self {
            state: VerifyState::first(),
            attempts: 0,
        }
    }

    pub fn state(&self) -> VerifyState {
        self.state
    }

    /// Comparisons recorded so far.
    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    pub fn record(&mut self, local: Checksum, remote: Checksum) -> Result<Decision, IntegrityError> {
        let next = self.state.advance(verify(local, remote))?;
        self.attempts += 1;
        self.state = next;
        Ok(match next {
            VerifyState::Verified => Decision::Accept,
            VerifyState::Attempt(n) => Decision::Retry { next_attempt: n },
            VerifyState::FailedFinal => Decision::Abort {
                attempts: self.attempts,
            },
        })
    }
}

impl Default for IntegrityController {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("verification already finished in state {0:?}")]
    AlreadyTerminal(VerifyState),
}

// ── Tests ────────────────────────────────────────────────────────────────────
