// src/modem/poller.rs
//
// Control-line status poller.
// Asks the executor for CTS/DSR/DCD on a fixed interval and emits
// `ModemEvent::ModemBits` only when the snapshot changes. The query runs
// inside the executor, between command writes.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::event::ModemEvent;
use super::executor::Request;
use crate::io::ModemLineStatus;

/// Last known control-line snapshot; reports edges only.
#[derive(Debug, Default)]
pub struct StatusTracker {
    last: ModemLineStatus,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a poll result. Returns the snapshot if it differs from the last one.
    pub fn observe(&mut self, status: ModemLineStatus) -> Option<ModemLineStatus> {
        if status == self.last {
            return None;
        }
        self.last = status;
        Some(status)
    }

    /// Forget the last snapshot.
    pub fn reset(&mut self) {
        self.last = ModemLineStatus::UNKNOWN;
    }

    pub fn last(&self) -> ModemLineStatus {
        self.last
    }
}

/// Spawn the poller. It holds only a weak reference to the executor, so it
/// stops on its own once every port handle is gone.
pub(crate) fn spawn_status_poller(
    requests: mpsc::WeakSender<Request>,
    events: broadcast::Sender<ModemEvent>,
    modem_bits: watch::Sender<ModemLineStatus>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tracker = StatusTracker::new();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let Some(requests) = requests.upgrade() else {
                break;
            };
            let (reply, reply_rx) = oneshot::channel();
            if requests.send(Request::ControlLines { reply }).await.is_err() {
                break;
            }
            drop(requests);

            let Ok(result) = reply_rx.await else {
                break;
            };
            match result {
                Ok(status) => {
                    if let Some(changed) = tracker.observe(status) {
                        modem_bits.send_replace(changed);
                        let _ = events.send(ModemEvent::ModemBits(changed));
                    }
                }
                Err(e) => {
                    tracker.reset();
                    modem_bits.send_replace(tracker.last());
                    tlog!("[modem] Control line polling stopped: {}", e);
                    break;
                }
            }
        }
    })
}
