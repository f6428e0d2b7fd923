//! Bridge module for communicating with the transport subprocess.

pub mod client;
pub mod process;
pub mod protocol;

pub use client::{BridgeTransport, DEFAULT_RESPONSE_TIMEOUT};
pub use process::{default_data_dir, find_bridge_binary, BridgeConfig, BridgeProcess};
pub use protocol::{BridgeCommand, BridgeEvent};
