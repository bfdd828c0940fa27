// src/io/serial/transport.rs
//
// Serial port transport backed by the serialport crate.
// A dedicated blocking thread reads the port and pushes chunks to the engine;
// writes, drains and control-line queries run on the blocking pool against a
// shared handle.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::utils::{self, FlowControl, Parity};
use crate::io::types::{ChunkReceiver, ChunkSender, ModemLineStatus, CHUNK_CHANNEL_DEPTH};
use crate::io::{IoError, Transport};

/// Read timeout of the reader thread; bounds how long `close` waits for it.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

// ============================================================================
// Types and Configuration
// ============================================================================

/// Serial port configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

/// Information about an available serial port
#[derive(Clone, Debug, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

// ============================================================================
// Serial Transport
// ============================================================================

/// Serial port implementing [`Transport`].
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<SharedPort>,
    cancel_flag: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            port: None,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn shared_port(&self) -> Result<SharedPort, IoError> {
        self.port
            .clone()
            .ok_or_else(|| IoError::write(format!("{} is not open", self.config.port)))
    }
}

/// Run a blocking operation against the shared port on the blocking pool.
async fn with_port<T, F>(port: SharedPort, op: F) -> Result<T, IoError>
where
    T: Send + 'static,
    F: FnOnce(&mut Box<dyn SerialPort>) -> Result<T, IoError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = port
            .lock()
            .map_err(|e| IoError::write(format!("Port mutex poisoned: {}", e)))?;
        op(&mut guard)
    })
    .await
    .map_err(|e| IoError::write(format!("Serial task failed: {}", e)))?
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.config.port
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn open(&mut self) -> Result<ChunkReceiver, IoError> {
        if self.port.is_some() {
            return Err(IoError::transport_open(&self.config.port, "already open"));
        }

        let config = &self.config;
        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(utils::to_serialport_data_bits(config.data_bits))
            .stop_bits(utils::to_serialport_stop_bits(config.stop_bits))
            .parity(utils::to_serialport_parity(config.parity))
            .flow_control(utils::to_serialport_flow_control(config.flow_control))
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| IoError::transport_open(&config.port, e.to_string()))?;

        // Separate handle for the reader so writes never wait on a read timeout
        let read_half = port
            .try_clone()
            .map_err(|e| IoError::transport_open(&config.port, e.to_string()))?;

        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_DEPTH);
        self.cancel_flag.store(false, Ordering::Relaxed);
        let cancel_flag = self.cancel_flag.clone();
        let name = config.port.clone();
        self.reader = Some(tokio::task::spawn_blocking(move || {
            run_reader_blocking(name, read_half, chunk_tx, cancel_flag)
        }));
        self.port = Some(Arc::new(Mutex::new(port)));

        tlog!(
            "[serial] Opened {} at {} baud ({}) [flow: {:?}]",
            config.port,
            config.baud_rate,
            utils::line_settings_label(config.data_bits, config.parity, config.stop_bits),
            config.flow_control
        );

        Ok(chunk_rx)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), IoError> {
        let data = data.to_vec();
        with_port(self.shared_port()?, move |port| {
            port.write_all(&data)
                .map_err(|e| IoError::write(format!("Serial write error: {}", e)))
        })
        .await
    }

    async fn drain(&mut self) -> Result<(), IoError> {
        with_port(self.shared_port()?, |port| {
            port.flush()
                .map_err(|e| IoError::write(format!("Serial flush error: {}", e)))
        })
        .await
    }

    async fn control_lines(&mut self) -> Result<ModemLineStatus, IoError> {
        let port = self
            .port
            .clone()
            .ok_or_else(|| IoError::status(format!("{} is not open", self.config.port)))?;
        with_port(port, |port| {
            let cts = port.read_clear_to_send();
            let dsr = port.read_data_set_ready();
            let dcd = port.read_carrier_detect();
            match (cts, dsr, dcd) {
                (Ok(cts), Ok(dsr), Ok(dcd)) => Ok(ModemLineStatus::new(cts, dsr, dcd)),
                (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                    Err(IoError::status(e.to_string()))
                }
            }
        })
        .await
    }

    async fn close(&mut self) -> Result<(), IoError> {
        self.cancel_flag.store(true, Ordering::Relaxed);
        let was_open = self.port.take().is_some();
        if let Some(handle) = self.reader.take() {
            let _ = handle.await;
        }
        if was_open {
            tlog!("[serial] Closed {}", self.config.port);
        }
        Ok(())
    }
}

/// Blocking read loop. Ends on cancellation, EOF, read error, or when the
/// engine drops the chunk receiver; dropping the sender ends the stream.
fn run_reader_blocking(
    name: String,
    mut port: Box<dyn SerialPort>,
    chunk_tx: ChunkSender,
    cancel_flag: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 256];

    while !cancel_flag.load(Ordering::Relaxed) {
        match port.read(&mut buf) {
            Ok(n) if n > 0 => {
                if chunk_tx.blocking_send(buf[..n].to_vec()).is_err() {
                    // Engine gone
                    break;
                }
            }
            Ok(_) => {
                tlog!("[serial] {} disconnected", name);
                break;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                // Timeout is expected for serial reads
            }
            Err(e) => {
                tlog!("[serial] Read error on {}: {}", name, e);
                break;
            }
        }
    }
}

// ============================================================================
// Port Enumeration
// ============================================================================

/// List available serial ports
///
/// On macOS, filters out /dev/tty.* devices and only shows /dev/cu.* devices.
/// The cu (calling unit) devices are non-blocking and preferred for outgoing connections.
/// The tty (terminal) devices block on open waiting for carrier detect.
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>, IoError> {
    let ports = serialport::available_ports()
        .map_err(|e| IoError::configuration(format!("Failed to enumerate ports: {}", e)))?;

    Ok(ports
        .into_iter()
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .map(|p| {
            let (port_type, manufacturer, product, serial_number, vid, pid) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => (
                    "USB".to_string(),
                    info.manufacturer,
                    info.product,
                    info.serial_number,
                    Some(info.vid),
                    Some(info.pid),
                ),
                serialport::SerialPortType::BluetoothPort => {
                    ("Bluetooth".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::PciPort => {
                    ("PCI".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::Unknown => {
                    ("Unknown".to_string(), None, None, None, None, None)
                }
            };
            SerialPortInfo {
                port_name: p.port_name,
                port_type,
                manufacturer,
                product,
                serial_number,
                vid,
                pid,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(port: &str) -> SerialConfig {
        SerialConfig {
            port: port.to_string(),
            baud_rate: 115_200,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            flow_control: FlowControl::Hardware,
        }
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let mut transport = SerialTransport::new(config("/dev/modemport-does-not-exist"));
        let err = transport.open().await.unwrap_err();
        assert!(matches!(err, IoError::TransportOpen { .. }));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_write_before_open_fails() {
        let mut transport = SerialTransport::new(config("/dev/ttyUSB9"));
        assert!(matches!(transport.write(b"AT\r\n").await, Err(IoError::Write { .. })));
        assert!(matches!(
            transport.control_lines().await,
            Err(IoError::Status { .. })
        ));
        assert!(transport.close().await.is_ok());
    }
}
