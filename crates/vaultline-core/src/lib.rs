//! vaultline-core: wire format, typed messages, crypto and integrity primitives.
//! All other Vaultline crates depend on this one.

pub mod config;
pub mod crypto;
pub mod error;
pub mod integrity;
pub mod message;
pub mod transport;
pub mod wire;

pub use error::{ErrorCode, ProtocolError, TransportError};
pub use integrity::{Checksum, IntegrityController};
pub use message::{ClientId, FileChunk, Request, Response};
pub use wire::{Codec, Message, Opcode};
