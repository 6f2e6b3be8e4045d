// src/io/mod.rs
//
// Device and client I/O for the bridge.
//
// - serial: TA612C port handling and protocol decoding
// - relay: full-duplex serial <-> WebSocket pumps for one client
// - server: WebSocket accept loop

mod error;
pub mod relay;
pub mod serial;
pub mod server;

pub use error::IoError;
pub use relay::{Relay, RelayConfig};
pub use server::serve;
