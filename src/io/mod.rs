// src/io/mod.rs
//
// Transport abstraction for the modem engine.
// A transport is a byte duplex with out-of-band control-line status. Reads
// are pushed: `open` hands back a channel that yields raw chunks as the
// device produces them.

mod error;
pub mod memory;
pub mod serial;
mod types;

pub use error::IoError;
pub use memory::{memory_pair, MemoryDevice, MemoryTransport};
pub use serial::{FlowControl, Parity};
#[cfg(not(target_os = "ios"))]
pub use serial::{list_serial_ports, SerialConfig, SerialPortInfo, SerialTransport};
pub use types::{ChunkReceiver, ChunkSender, ModemLineStatus, WriteTap, CHUNK_CHANNEL_DEPTH};

use async_trait::async_trait;

// ============================================================================
// Transport Trait
// ============================================================================

/// A byte-duplex link to a modem.
///
/// The engine owns its transport exclusively; all calls come from the
/// executor task, so implementations never see concurrent writes.
#[async_trait]
pub trait Transport: Send {
    /// Human readable device name, used in logs and errors.
    fn name(&self) -> &str;

    /// Whether `open` succeeded and `close` has not been called.
    fn is_open(&self) -> bool;

    /// Open the link and return the inbound chunk stream.
    ///
    /// The stream ends when the device disconnects or the transport closes.
    async fn open(&mut self) -> Result<ChunkReceiver, IoError>;

    /// Queue bytes for transmission.
    async fn write(&mut self, data: &[u8]) -> Result<(), IoError>;

    /// Wait until queued bytes have been handed to the device.
    async fn drain(&mut self) -> Result<(), IoError>;

    /// Read the CTS/DSR/DCD control lines.
    async fn control_lines(&mut self) -> Result<ModemLineStatus, IoError>;

    /// Close the link. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), IoError>;
}
