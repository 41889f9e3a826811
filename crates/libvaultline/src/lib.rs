//! libvaultline: client side of the Vaultline backup protocol.
//!
//! [`BackupClient`] drives one connection through registration, key
//! exchange and a verified file transfer over any async byte stream.

pub mod client;
pub mod context;

pub use client::{BackupClient, ClientError, ClientOptions, ClientState, TransferReport};
pub use context::CryptoContext;
