// src/io/serial/mod.rs
//
// Serial port support: line framing, line settings, and the serialport-backed
// transport.

pub mod framer;
#[cfg(not(target_os = "ios"))]
pub mod transport;
pub(crate) mod utils;

pub use framer::{clean_line, LineFramer};
#[cfg(not(target_os = "ios"))]
pub use transport::{list_serial_ports, SerialConfig, SerialPortInfo, SerialTransport};
pub use utils::{FlowControl, Parity};
