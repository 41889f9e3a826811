//! vaultlined: backup server: request dispatch, connection handling and
//! the TCP listener. The binary in `main.rs` wires these to configuration.

pub mod connection;
pub mod dispatch;
pub mod listener;

pub use dispatch::{ConnectionState, Dispatcher};
pub use listener::Server;
