// src/io/types.rs
//
// Shared types for transports and the engine.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// Chunk Channel
// ============================================================================

/// Depth of the inbound chunk channel between a reader and the executor.
pub const CHUNK_CHANNEL_DEPTH: usize = 64;

/// Raw chunks pushed by a transport, in arrival order.
pub type ChunkReceiver = mpsc::Receiver<Vec<u8>>;

/// Producer side of [`ChunkReceiver`].
pub type ChunkSender = mpsc::Sender<Vec<u8>>;

// ============================================================================
// Write Tap
// ============================================================================

/// Observer invoked with every outbound frame (command segment plus
/// terminator) just before it is written.
pub type WriteTap = Arc<dyn Fn(&str) + Send + Sync>;

// ============================================================================
// Control Lines
// ============================================================================

/// Snapshot of the modem control lines.
///
/// Each line is tri-state: `None` means unknown (never read, or the last
/// read failed).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModemLineStatus {
    pub cts: Option<bool>,
    pub dsr: Option<bool>,
    pub dcd: Option<bool>,
}

impl ModemLineStatus {
    /// All three lines unknown.
    pub const UNKNOWN: ModemLineStatus = ModemLineStatus {
        cts: None,
        dsr: None,
        dcd: None,
    };

    /// A fully known snapshot.
    pub fn new(cts: bool, dsr: bool, dcd: bool) -> Self {
        ModemLineStatus {
            cts: Some(cts),
            dsr: Some(dsr),
            dcd: Some(dcd),
        }
    }

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}
