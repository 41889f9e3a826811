//! Vaultline wire format: the fixed frame header and the frame codec.
//!
//! Every message on a Vaultline connection is a 7-byte header followed by
//! exactly `payload_length` payload bytes. All multi-byte integers are
//! little-endian. Changing anything in this module is a protocol version bump.
//!
//! The header is a zerocopy struct built from byte-order-aware integer types,
//! so it has alignment 1 and a deterministic layout. There is no unsafe code
//! in this module.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Frame Header ─────────────────────────────────────────────────────────────

/// Precedes every payload on the wire.
///
/// The receiver validates the version, the opcode and the declared length
/// from these 7 bytes alone, before it allocates anything for the payload.
///
/// Wire size: 7 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    /// Protocol version. Currently 3.
    pub version: u8,

    /// Operation code, see [`Opcode`].
    pub opcode: U16<LittleEndian>,

    /// Number of payload bytes following this header.
    pub payload_length: U32<LittleEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 7]);

impl FrameHeader {
    pub fn new(opcode: Opcode, payload_length: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            opcode: U16::new(opcode.into()),
            payload_length: U32::new(payload_length),
        }
    }
}

// ── Opcodes ──────────────────────────────────────────────────────────────────

/// Which side of the connection sends a given opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server.
    Request,
    /// Server to client.
    Response,
}

/// Closed set of operation codes. Anything else is rejected at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    Register = 1025,
    SendPublicKey = 1026,
    Reconnect = 1027,
    SendFile = 1028,
    ChecksumAccept = 1029,
    ChecksumRetry = 1030,
    ChecksumAbort = 1031,

    RegisterAck = 1600,
    RegisterFailed = 1601,
    KeyExchangeAck = 1602,
    ChecksumReport = 1603,
    MessageAck = 1604,
    ReconnectAck = 1605,
    ReconnectDenied = 1606,
    GeneralError = 1607,
    ChunkAck = 1608,
}

impl Opcode {
    pub fn direction(self) -> Direction {
        match self {
            Opcode::Register
            | Opcode::SendPublicKey
            | Opcode::Reconnect
            | Opcode::SendFile
            | Opcode::ChecksumAccept
            | Opcode::ChecksumRetry
            | Opcode::ChecksumAbort => Direction::Request,
            Opcode::RegisterAck
            | Opcode::RegisterFailed
            | Opcode::KeyExchangeAck
            | Opcode::ChecksumReport
            | Opcode::MessageAck
            | Opcode::ReconnectAck
            | Opcode::ReconnectDenied
            | Opcode::GeneralError
            | Opcode::ChunkAck => Direction::Response,
        }
    }
}

impl TryFrom<u16> for Opcode {
    type Error = FramingError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            1025 => Opcode::Register,
            1026 => Opcode::SendPublicKey,
            1027 => Opcode::Reconnect,
            1028 => Opcode::SendFile,
            1029 => Opcode::ChecksumAccept,
            1030 => Opcode::ChecksumRetry,
            1031 => Opcode::ChecksumAbort,
            1600 => Opcode::RegisterAck,
            1601 => Opcode::RegisterFailed,
            1602 => Opcode::KeyExchangeAck,
            1603 => Opcode::ChecksumReport,
            1604 => Opcode::MessageAck,
            1605 => Opcode::ReconnectAck,
            1606 => Opcode::ReconnectDenied,
            1607 => Opcode::GeneralError,
            1608 => Opcode::ChunkAck,
            other => return Err(FramingError::UnknownOpcode(other)),
        })
    }
}

impl From<Opcode> for u16 {
    fn from(op: Opcode) -> u16 {
        op as u16
    }
}

// ── Message ──────────────────────────────────────────────────────────────────

/// A decoded frame. `payload.len()` is the declared payload length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub version: u8,
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Message {
    pub fn new(opcode: Opcode, payload: Bytes) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            opcode,
            payload,
        }
    }

    pub fn payload_length(&self) -> usize {
        self.payload.len()
    }
}

// ── Constants ────────────────────────────────────────────────────────────────

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 3;

/// Size of [`FrameHeader`] on the wire.
pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

/// Default upper bound on a single payload (1 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

// ── Codec ────────────────────────────────────────────────────────────────────

/// Stateless frame encoder/decoder bounded by a maximum payload size.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    max_payload: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Codec {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(u32::MAX as usize),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Encode one frame: header followed by the payload.
    pub fn encode(&self, opcode: Opcode, payload: &[u8]) -> Result<Bytes, FramingError> {
        if payload.len() > self.max_payload {
            return Err(FramingError::PayloadTooLarge {
                declared: payload.len() as u64,
                max: self.max_payload,
            });
        }

        let header = FrameHeader::new(opcode, payload.len() as u32);
        let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
        out.put_slice(header.as_bytes());
        out.put_slice(payload);
        Ok(out.freeze())
    }

    /// Validate a header and return the opcode and payload length it declares.
    ///
    /// Only the first [`HEADER_LEN`] bytes are inspected. Version is checked
    /// first, then opcode, then length against the configured maximum.
    pub fn decode_header(&self, bytes: &[u8]) -> Result<(Opcode, usize), FramingError> {
        let header = FrameHeader::read_from_prefix(bytes).ok_or(FramingError::Truncated {
            needed: HEADER_LEN,
            available: bytes.len(),
        })?;

        if header.version != PROTOCOL_VERSION {
            return Err(FramingError::UnsupportedVersion(header.version));
        }

        let opcode = Opcode::try_from(header.opcode.get())?;

        let declared = header.payload_length.get();
        if declared as u64 > self.max_payload as u64 {
            return Err(FramingError::PayloadTooLarge {
                declared: declared as u64,
                max: self.max_payload,
            });
        }

        Ok((opcode, declared as usize))
    }

    /// Decode exactly one frame from `bytes`.
    ///
    /// Pure: no I/O, no allocation beyond the returned payload, and every
    /// malformed input yields a [`FramingError`].
    pub fn decode(&self, bytes: &[u8]) -> Result<Message, FramingError> {
        let (opcode, len) = self.decode_header(bytes)?;

        let body = &bytes[HEADER_LEN..];
        if body.len() < len {
            return Err(FramingError::Truncated {
                needed: HEADER_LEN + len,
                available: bytes.len(),
            });
        }
        if body.len() > len {
            return Err(FramingError::TrailingBytes(body.len() - len));
        }

        Ok(Message::new(opcode, Bytes::copy_from_slice(body)))
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Malformed or oversized frames. Always connection-fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown opcode: {0}")]
    UnknownOpcode(u16),

    #[error("payload length {declared} exceeds maximum {max}")]
    PayloadTooLarge { declared: u64, max: usize },

    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_header(version: u8, opcode: u16, len: u32) -> Vec<u8> {
        let mut v = vec![version];
        v.extend_from_slice(&opcode.to_le_bytes());
        v.extend_from_slice(&len.to_le_bytes());
        v
    }

    #[test]
    fn header_is_seven_little_endian_bytes() {
        let header = FrameHeader::new(Opcode::SendFile, 0x0102_0304);
        let bytes = header.as_bytes();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(bytes, &[3, 0x04, 0x04, 0x04, 0x03, 0x02, 0x01][..]);
    }

    #[test]
    fn encode_then_decode_preserves_frame() {
        let codec = Codec::default();
        let frame = codec.encode(Opcode::Register, b"alice").unwrap();
        assert_eq!(frame.len(), HEADER_LEN + 5);

        let msg = codec.decode(&frame).unwrap();
        assert_eq!(msg.version, PROTOCOL_VERSION);
        assert_eq!(msg.opcode, Opcode::Register);
        assert_eq!(msg.payload_length(), 5);
        assert_eq!(&msg.payload[..], b"alice");
    }

    #[test]
    fn empty_payload_is_valid() {
        let codec = Codec::default();
        let frame = codec.encode(Opcode::RegisterFailed, &[]).unwrap();
        let msg = codec.decode(&frame).unwrap();
        assert_eq!(msg.opcode, Opcode::RegisterFailed);
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let bytes = raw_header(PROTOCOL_VERSION, 4242, 0);
        let err = Codec::default().decode(&bytes).unwrap_err();
        assert_eq!(err, FramingError::UnknownOpcode(4242));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let bytes = raw_header(2, Opcode::Register.into(), 0);
        let err = Codec::default().decode(&bytes).unwrap_err();
        assert_eq!(err, FramingError::UnsupportedVersion(2));
    }

    #[test]
    fn truncated_header_is_rejected() {
        let err = Codec::default().decode(&[3, 1, 4]).unwrap_err();
        assert_eq!(
            err,
            FramingError::Truncated {
                needed: HEADER_LEN,
                available: 3
            }
        );
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut bytes = raw_header(PROTOCOL_VERSION, Opcode::Register.into(), 10);
        bytes.extend_from_slice(b"short");
        let err = Codec::default().decode(&bytes).unwrap_err();
        assert!(matches!(err, FramingError::Truncated { .. }));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = raw_header(PROTOCOL_VERSION, Opcode::Register.into(), 1);
        bytes.extend_from_slice(b"ab");
        let err = Codec::default().decode(&bytes).unwrap_err();
        assert_eq!(err, FramingError::TrailingBytes(1));
    }

    #[test]
    fn four_gigabyte_declaration_is_rejected_from_header_alone() {
        // Only the header is present; nothing close to 4 GB is ever allocated.
        let bytes = raw_header(PROTOCOL_VERSION, Opcode::SendFile.into(), u32::MAX);
        let err = Codec::default().decode(&bytes).unwrap_err();
        assert_eq!(
            err,
            FramingError::PayloadTooLarge {
                declared: u32::MAX as u64,
                max: DEFAULT_MAX_PAYLOAD
            }
        );
    }

    #[test]
    fn encode_refuses_oversized_payload() {
        let codec = Codec::new(8);
        let err = codec.encode(Opcode::SendFile, &[0u8; 9]).unwrap_err();
        assert!(matches!(err, FramingError::PayloadTooLarge { declared: 9, max: 8 }));
    }

    #[test]
    fn opcode_round_trip_and_direction() {
        for op in [Opcode::Register, Opcode::ChecksumAbort, Opcode::ChunkAck] {
            assert_eq!(Opcode::try_from(u16::from(op)).unwrap(), op);
        }
        assert_eq!(Opcode::SendFile.direction(), Direction::Request);
        assert_eq!(Opcode::ChecksumReport.direction(), Direction::Response);
        assert!(Opcode::try_from(0).is_err());
    }
}
