//! Typed protocol messages.
//!
//! `Request` is everything a client may send and `Response` everything the
//! server may send. Both map one-to-one onto opcodes in [`crate::wire`], so
//! the dispatcher matches exhaustively and a new opcode is a compile error
//! until every side handles it.
//!
//! Strings are length-prefixed UTF-8: names with a `u8` length, error
//! reasons with a `u16` length. Integers are little-endian.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;

use crate::error::{ErrorCode, ProtocolError};
use crate::integrity::Checksum;
use crate::wire::{Direction, FramingError, Message, Opcode};

/// Maximum byte length of a username or filename on the wire.
pub const MAX_NAME_LEN: usize = 255;

// ── ClientId ─────────────────────────────────────────────────────────────────

/// 16-byte client identifier, assigned by the server at registration.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub [u8; 16]);

impl ClientId {
    pub const LEN: usize = 16;

    pub fn generate() -> Self {
        let mut id = [0u8; Self::LEN];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, FramingError> {
        let raw = hex::decode(s).map_err(|e| FramingError::Malformed(format!("client id: {e}")))?;
        let id: [u8; 16] = raw
            .try_into()
            .map_err(|_| FramingError::Malformed("client id must be 16 bytes".into()))?;
        Ok(Self(id))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", &self.to_hex()[..8])
    }
}

// ── Requests ─────────────────────────────────────────────────────────────────

/// One `SendFile` message: a slice of the file's ciphertext plus enough
/// context for the server to place it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub client_id: ClientId,
    /// Total ciphertext size of the file.
    pub content_size: u64,
    /// Plaintext size of the file.
    pub orig_size: u64,
    /// 1-based position of this chunk.
    pub packet_number: u32,
    pub total_packets: u32,
    pub filename: String,
    pub data: Bytes,
}

impl FileChunk {
    pub fn is_final(&self) -> bool {
        self.packet_number == self.total_packets
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register {
        username: String,
    },
    SendPublicKey {
        client_id: ClientId,
        /// DER SubjectPublicKeyInfo.
        public_key: Bytes,
    },
    Reconnect {
        client_id: ClientId,
        username: String,
    },
    SendFile(FileChunk),
    ChecksumAccept {
        client_id: ClientId,
        filename: String,
    },
    ChecksumRetry {
        client_id: ClientId,
        filename: String,
    },
    ChecksumAbort {
        client_id: ClientId,
        filename: String,
    },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Register { .. } => Opcode::Register,
            Request::SendPublicKey { .. } => Opcode::SendPublicKey,
            Request::Reconnect { .. } => Opcode::Reconnect,
            Request::SendFile(_) => Opcode::SendFile,
            Request::ChecksumAccept { .. } => Opcode::ChecksumAccept,
            Request::ChecksumRetry { .. } => Opcode::ChecksumRetry,
            Request::ChecksumAbort { .. } => Opcode::ChecksumAbort,
        }
    }

    /// The client this request claims to come from. `None` only for `Register`.
    pub fn client_id(&self) -> Option<ClientId> {
        match self {
            Request::Register { .. } => None,
            Request::SendPublicKey { client_id, .. }
            | Request::Reconnect { client_id, .. }
            | Request::ChecksumAccept { client_id, .. }
            | Request::ChecksumRetry { client_id, .. }
            | Request::ChecksumAbort { client_id, .. } => Some(*client_id),
            Request::SendFile(chunk) => Some(chunk.client_id),
        }
    }

    pub fn encode_payload(&self) -> Result<Bytes, FramingError> {
        let mut w = PayloadWriter::new();
        match self {
            Request::Register { username } => w.name(username)?,
            Request::SendPublicKey {
                client_id,
                public_key,
            } => {
                w.client_id(client_id);
                let len = u16::try_from(public_key.len())
                    .map_err(|_| FramingError::Malformed("public key too long".into()))?;
                w.buf.put_u16_le(len);
                w.buf.put_slice(public_key);
            }
            Request::Reconnect {
                client_id,
                username,
            } => {
                w.client_id(client_id);
                w.name(username)?;
            }
            Request::SendFile(chunk) => {
                w.client_id(&chunk.client_id);
                w.buf.put_u64_le(chunk.content_size);
                w.buf.put_u64_le(chunk.orig_size);
                w.buf.put_u32_le(chunk.packet_number);
                w.buf.put_u32_le(chunk.total_packets);
                w.name(&chunk.filename)?;
                w.buf.put_slice(&chunk.data);
            }
            Request::ChecksumAccept {
                client_id,
                filename,
            }
            | Request::ChecksumRetry {
                client_id,
                filename,
            }
            | Request::ChecksumAbort {
                client_id,
                filename,
            } => {
                w.client_id(client_id);
                w.name(filename)?;
            }
        }
        Ok(w.finish())
    }

    /// Parse a decoded frame as a request. A response opcode here is a
    /// protocol violation, not a framing error.
    pub fn from_message(msg: &Message) -> Result<Self, ProtocolError> {
        if msg.opcode.direction() != Direction::Request {
            return Err(ProtocolError::violation(format!(
                "{:?} is not a request",
                msg.opcode
            )));
        }

        let mut r = PayloadReader::new(msg.payload.clone());
        let req = match msg.opcode {
            Opcode::Register => Request::Register {
                username: r.name()?,
            },
            Opcode::SendPublicKey => {
                let client_id = r.client_id()?;
                let len = r.u16()? as usize;
                Request::SendPublicKey {
                    client_id,
                    public_key: r.take(len)?,
                }
            }
            Opcode::Reconnect => Request::Reconnect {
                client_id: r.client_id()?,
                username: r.name()?,
            },
            Opcode::SendFile => Request::SendFile(FileChunk {
                client_id: r.client_id()?,
                content_size: r.u64()?,
                orig_size: r.u64()?,
                packet_number: r.u32()?,
                total_packets: r.u32()?,
                filename: r.name()?,
                data: r.rest(),
            }),
            Opcode::ChecksumAccept => Request::ChecksumAccept {
                client_id: r.client_id()?,
                filename: r.name()?,
            },
            Opcode::ChecksumRetry => Request::ChecksumRetry {
                client_id: r.client_id()?,
                filename: r.name()?,
            },
            Opcode::ChecksumAbort => Request::ChecksumAbort {
                client_id: r.client_id()?,
                filename: r.name()?,
            },
            other => {
                return Err(ProtocolError::violation(format!(
                    "{other:?} is not a request"
                )))
            }
        };
        r.finish()?;
        Ok(req)
    }
}

// ── Responses ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    RegisterAck {
        client_id: ClientId,
    },
    RegisterFailed,
    KeyExchangeAck {
        client_id: ClientId,
        /// Session AES key, RSA-OAEP wrapped under the client's public key.
        wrapped_key: Bytes,
    },
    ChecksumReport {
        client_id: ClientId,
        content_size: u64,
        filename: String,
        checksum: Checksum,
    },
    MessageAck {
        client_id: ClientId,
    },
    ReconnectAck {
        client_id: ClientId,
        wrapped_key: Bytes,
    },
    ReconnectDenied {
        client_id: ClientId,
    },
    GeneralError {
        code: ErrorCode,
        reason: String,
    },
    ChunkAck {
        client_id: ClientId,
        packet_number: u32,
    },
}

impl Response {
    pub fn opcode(&self) -> Opcode {
        match self {
            Response::RegisterAck { .. } => Opcode::RegisterAck,
            Response::RegisterFailed => Opcode::RegisterFailed,
            Response::KeyExchangeAck { .. } => Opcode::KeyExchangeAck,
            Response::ChecksumReport { .. } => Opcode::ChecksumReport,
            Response::MessageAck { .. } => Opcode::MessageAck,
            Response::ReconnectAck { .. } => Opcode::ReconnectAck,
            Response::ReconnectDenied { .. } => Opcode::ReconnectDenied,
            Response::GeneralError { .. } => Opcode::GeneralError,
            Response::ChunkAck { .. } => Opcode::ChunkAck,
        }
    }

    /// Build the `GeneralError` sent before a fatal close.
    pub fn from_error(err: &ProtocolError) -> Self {
        let mut reason = err.to_string();
        truncate_utf8(&mut reason, u16::MAX as usize);
        Response::GeneralError {
            code: err.code(),
            reason,
        }
    }

    pub fn encode_payload(&self) -> Result<Bytes, FramingError> {
        let mut w = PayloadWriter::new();
        match self {
            Response::RegisterAck { client_id }
            | Response::MessageAck { client_id }
            | Response::ReconnectDenied { client_id } => w.client_id(client_id),
            Response::RegisterFailed => {}
            Response::KeyExchangeAck {
                client_id,
                wrapped_key,
            }
            | Response::ReconnectAck {
                client_id,
                wrapped_key,
            } => {
                w.client_id(client_id);
                w.buf.put_slice(wrapped_key);
            }
            Response::ChecksumReport {
                client_id,
                content_size,
                filename,
                checksum,
            } => {
                w.client_id(client_id);
                w.buf.put_u64_le(*content_size);
                w.name(filename)?;
                w.buf.put_u32_le(checksum.value());
            }
            Response::GeneralError { code, reason } => {
                w.buf.put_u8((*code).into());
                let len = u16::try_from(reason.len())
                    .map_err(|_| FramingError::Malformed("error reason too long".into()))?;
                w.buf.put_u16_le(len);
                w.buf.put_slice(reason.as_bytes());
            }
            Response::ChunkAck {
                client_id,
                packet_number,
            } => {
                w.client_id(client_id);
                w.buf.put_u32_le(*packet_number);
            }
        }
        Ok(w.finish())
    }

    pub fn from_message(msg: &Message) -> Result<Self, ProtocolError> {
        if msg.opcode.direction() != Direction::Response {
            return Err(ProtocolError::violation(format!(
                "{:?} is not a response",
                msg.opcode
            )));
        }

        let mut r = PayloadReader::new(msg.payload.clone());
        let resp = match msg.opcode {
            Opcode::RegisterAck => Response::RegisterAck {
                client_id: r.client_id()?,
            },
            Opcode::RegisterFailed => Response::RegisterFailed,
            Opcode::KeyExchangeAck => Response::KeyExchangeAck {
                client_id: r.client_id()?,
                wrapped_key: r.rest(),
            },
            Opcode::ChecksumReport => Response::ChecksumReport {
                client_id: r.client_id()?,
                content_size: r.u64()?,
                filename: r.name()?,
                checksum: Checksum(r.u32()?),
            },
            Opcode::MessageAck => Response::MessageAck {
                client_id: r.client_id()?,
            },
            Opcode::ReconnectAck => Response::ReconnectAck {
                client_id: r.client_id()?,
                wrapped_key: r.rest(),
            },
            Opcode::ReconnectDenied => Response::ReconnectDenied {
                client_id: r.client_id()?,
            },
            Opcode::GeneralError => {
                let code = ErrorCode::from(r.u8()?);
                let len = r.u16()? as usize;
                Response::GeneralError {
                    code,
                    reason: r.utf8(len)?,
                }
            }
            Opcode::ChunkAck => Response::ChunkAck {
                client_id: r.client_id()?,
                packet_number: r.u32()?,
            },
            other => {
                return Err(ProtocolError::violation(format!(
                    "{other:?} is not a response"
                )))
            }
        };
        r.finish()?;
        Ok(resp)
    }
}

fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

// ── Payload helpers ──────────────────────────────────────────────────────────

struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    fn client_id(&mut self, id: &ClientId) {
        self.buf.put_slice(id.as_bytes());
    }

    fn name(&mut self, s: &str) -> Result<(), FramingError> {
        if s.len() > MAX_NAME_LEN {
            return Err(FramingError::Malformed(format!(
                "name of {} bytes exceeds {MAX_NAME_LEN}",
                s.len()
            )));
        }
        self.buf.put_u8(s.len() as u8);
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }

    fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Bounds-checked reads over a payload. Every short read is `Malformed`.
struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<(), FramingError> {
        if self.buf.remaining() < n {
            return Err(FramingError::Malformed(format!(
                "payload truncated: need {n} more bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, FramingError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, FramingError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self) -> Result<u32, FramingError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> Result<u64, FramingError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn take(&mut self, n: usize) -> Result<Bytes, FramingError> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    fn client_id(&mut self) -> Result<ClientId, FramingError> {
        let raw = self.take(ClientId::LEN)?;
        let mut id = [0u8; ClientId::LEN];
        id.copy_from_slice(&raw);
        Ok(ClientId(id))
    }

    fn utf8(&mut self, n: usize) -> Result<String, FramingError> {
        let raw = self.take(n)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| FramingError::Malformed("string is not valid UTF-8".into()))
    }

    fn name(&mut self) -> Result<String, FramingError> {
        let len = self.u8()? as usize;
        self.utf8(len)
    }

    fn rest(&mut self) -> Bytes {
        self.buf.split_off(0)
    }

    fn finish(self) -> Result<(), FramingError> {
        if self.buf.has_remaining() {
            return Err(FramingError::TrailingBytes(self.buf.remaining()));
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
