//! vaultline-services: server-side state shared across connections:
//! client registry, in-flight transfers, file persistence and event sinks.

pub mod events;
pub mod file_store;
pub mod registry;
pub mod transfer;

pub use events::{EventSink, MemorySink, ProtocolEvent, TracingSink};
pub use file_store::{DiskFileStore, FileStore, StoreError, StoreHandle};
pub use registry::{ClientRegistry, ClientSession, RegistryError};
pub use transfer::{ChunkOutcome, ConnectionId, TransferError, TransferKey, TransferStatus, TransferTable};
