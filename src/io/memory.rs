// src/io/memory.rs
//
// In-memory transport pair.
// `MemoryTransport` is handed to the engine; `MemoryDevice` plays the modem:
// it pushes response bytes, observes written frames, and scripts control-line
// status and failures. Used by the test suites and for dry runs without
// hardware.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::types::{ChunkReceiver, ChunkSender, ModemLineStatus, CHUNK_CHANNEL_DEPTH};
use super::{IoError, Transport};

// ============================================================================
// Shared State
// ============================================================================

#[derive(Debug)]
struct DeviceState {
    line_status: Result<ModemLineStatus, String>,
    write_failure: Option<String>,
    open_failure: Option<String>,
}

impl Default for DeviceState {
    fn default() -> Self {
        DeviceState {
            line_status: Ok(ModemLineStatus::new(false, false, false)),
            write_failure: None,
            open_failure: None,
        }
    }
}

/// Create a connected transport/device pair.
pub fn memory_pair(name: impl Into<String>) -> (MemoryTransport, MemoryDevice) {
    let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_DEPTH);
    let (written_tx, written_rx) = mpsc::unbounded_channel();
    let state = Arc::new(Mutex::new(DeviceState::default()));

    let transport = MemoryTransport {
        name: name.into(),
        chunks: Some(chunk_rx),
        written: written_tx,
        state: state.clone(),
        open: false,
    };
    let device = MemoryDevice {
        chunks: chunk_tx,
        written: written_rx,
        state,
    };
    (transport, device)
}

// ============================================================================
// Transport Side
// ============================================================================

/// Engine-facing half of [`memory_pair`].
pub struct MemoryTransport {
    name: String,
    chunks: Option<ChunkReceiver>,
    written: mpsc::UnboundedSender<Vec<u8>>,
    state: Arc<Mutex<DeviceState>>,
    open: bool,
}

impl MemoryTransport {
    fn with_state<T>(&self, f: impl FnOnce(&DeviceState) -> T) -> Result<T, IoError> {
        self.state
            .lock()
            .map(|guard| f(&guard))
            .map_err(|e| IoError::write(format!("device state poisoned: {}", e)))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self) -> Result<ChunkReceiver, IoError> {
        if let Some(reason) = self.with_state(|s| s.open_failure.clone())? {
            return Err(IoError::transport_open(&self.name, reason));
        }
        let chunks = self
            .chunks
            .take()
            .ok_or_else(|| IoError::transport_open(&self.name, "already opened"))?;
        self.open = true;
        Ok(chunks)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), IoError> {
        if !self.open {
            return Err(IoError::write(format!("{} is not open", self.name)));
        }
        if let Some(reason) = self.with_state(|s| s.write_failure.clone())? {
            return Err(IoError::write(reason));
        }
        self.written
            .send(data.to_vec())
            .map_err(|_| IoError::write(format!("{} device side dropped", self.name)))
    }

    async fn drain(&mut self) -> Result<(), IoError> {
        Ok(())
    }

    async fn control_lines(&mut self) -> Result<ModemLineStatus, IoError> {
        self.with_state(|s| s.line_status.clone())?
            .map_err(IoError::status)
    }

    async fn close(&mut self) -> Result<(), IoError> {
        self.open = false;
        Ok(())
    }
}

// ============================================================================
// Device Side
// ============================================================================

/// Modem-facing half of [`memory_pair`].
pub struct MemoryDevice {
    chunks: ChunkSender,
    written: mpsc::UnboundedReceiver<Vec<u8>>,
    state: Arc<Mutex<DeviceState>>,
}

impl MemoryDevice {
    /// Push bytes as if the modem had sent them.
    pub async fn send(&self, data: impl AsRef<[u8]>) -> Result<(), IoError> {
        self.chunks
            .send(data.as_ref().to_vec())
            .await
            .map_err(|_| IoError::Closed)
    }

    /// Wait for the next frame written by the engine.
    pub async fn next_write(&mut self) -> Option<String> {
        self.written.recv().await.map(|bytes| frame_text(&bytes))
    }

    /// Next written frame, if one is already waiting.
    pub fn try_next_write(&mut self) -> Option<String> {
        self.written.try_recv().ok().map(|bytes| frame_text(&bytes))
    }

    /// Control-line status reported from now on.
    pub fn set_line_status(&self, status: ModemLineStatus) {
        self.update(|s| s.line_status = Ok(status));
    }

    /// Make control-line queries fail from now on.
    pub fn fail_line_status(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.update(|s| s.line_status = Err(reason));
    }

    /// Make writes fail (`Some`) or succeed again (`None`).
    pub fn fail_writes(&self, reason: Option<String>) {
        self.update(|s| s.write_failure = reason);
    }

    /// Make the next `open` fail.
    pub fn fail_open(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.update(|s| s.open_failure = Some(reason));
    }

    fn update(&self, f: impl FnOnce(&mut DeviceState)) {
        if let Ok(mut guard) = self.state.lock() {
            f(&mut guard);
        }
    }
}

fn frame_text(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}
