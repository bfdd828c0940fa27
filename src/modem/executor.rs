// src/modem/executor.rs
//
// Command executor task.
// A single task owns the transport, the line framer, the command queue and
// the in-flight matcher. Handles submit commands over an mpsc channel and get
// their result back on a oneshot; everything observable goes out on the
// broadcast event channel. Because chunks are framed and classified inside
// one step of this task, a command write can never land in the middle of a
// half-processed response.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};

use super::converters::ConverterRegistry;
use super::event::{CommandOutput, ModemEvent};
use super::matcher::{CommandMatcher, LineOutcome};
use super::options::{CommandDefaults, MatchOptions};
use crate::io::serial::{clean_line, LineFramer};
use crate::io::{ChunkReceiver, IoError, ModemLineStatus, Transport, WriteTap};

/// Depth of the request channel between handles and the executor.
pub(crate) const REQUEST_CHANNEL_DEPTH: usize = 32;

/// Pause between the segments of a multi-line command.
const SEGMENT_GAP: Duration = Duration::from_millis(10);

pub(crate) type CommandReply = oneshot::Sender<Result<CommandOutput, IoError>>;

// ============================================================================
// Requests
// ============================================================================

pub(crate) struct PendingCommand {
    pub command: String,
    pub options: MatchOptions,
    pub reply: CommandReply,
}

pub(crate) enum Request {
    /// Queue a command.
    Submit(PendingCommand),
    /// Read the control lines between writes.
    ControlLines {
        reply: oneshot::Sender<Result<ModemLineStatus, IoError>>,
    },
    /// Replace the per-command defaults.
    UpdateDefaults(CommandDefaults),
    /// Reject everything outstanding and close the transport.
    Shutdown { reply: oneshot::Sender<()> },
}

// ============================================================================
// Spawn
// ============================================================================

pub(crate) struct ExecutorParts {
    pub transport: Box<dyn Transport>,
    pub chunks: ChunkReceiver,
    pub registry: ConverterRegistry,
    pub events: broadcast::Sender<ModemEvent>,
    pub defaults: CommandDefaults,
    pub write_tap: Option<WriteTap>,
}

/// Spawn the executor task. Returns the request channel and the task handle.
pub(crate) fn spawn_executor(parts: ExecutorParts) -> (mpsc::Sender<Request>, JoinHandle<()>) {
    let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_DEPTH);
    let executor = Executor {
        transport: parts.transport,
        framer: LineFramer::new(),
        registry: parts.registry,
        events: parts.events,
        defaults: parts.defaults,
        write_tap: parts.write_tap,
        queue: VecDeque::new(),
        in_flight: None,
        not_before: Instant::now(),
    };
    let handle = tokio::spawn(executor.run(parts.chunks, request_rx));
    (request_tx, handle)
}

// ============================================================================
// Executor
// ============================================================================

struct Queued {
    ready_at: Instant,
    pending: PendingCommand,
}

struct InFlight {
    matcher: CommandMatcher,
    reply: CommandReply,
    deadline: Instant,
}

struct Executor {
    transport: Box<dyn Transport>,
    framer: LineFramer,
    registry: ConverterRegistry,
    events: broadcast::Sender<ModemEvent>,
    defaults: CommandDefaults,
    write_tap: Option<WriteTap>,
    queue: VecDeque<Queued>,
    in_flight: Option<InFlight>,
    /// Earliest time the next command may be written
    not_before: Instant,
}

impl Executor {
    async fn run(mut self, mut chunks: ChunkReceiver, mut requests: mpsc::Receiver<Request>) {
        let mut stream_open = true;

        loop {
            let deadline = self.in_flight.as_ref().map(|f| f.deadline);
            let next_dispatch = match (&self.in_flight, self.queue.front()) {
                (None, Some(head)) => Some(head.ready_at.max(self.not_before)),
                _ => None,
            };

            tokio::select! {
                biased;

                chunk = chunks.recv(), if stream_open => match chunk {
                    Some(bytes) => self.handle_chunk(&bytes),
                    None => {
                        stream_open = false;
                        tlog!("[modem] {} input stream ended", self.transport.name());
                    }
                },

                request = requests.recv() => match request {
                    Some(Request::Submit(pending)) => self.enqueue(pending),
                    Some(Request::ControlLines { reply }) => {
                        let _ = reply.send(self.transport.control_lines().await);
                    }
                    Some(Request::UpdateDefaults(defaults)) => self.defaults = defaults,
                    Some(Request::Shutdown { reply }) => {
                        self.shutdown(chunks).await;
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        self.shutdown(chunks).await;
                        return;
                    }
                },

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire();
                }

                _ = sleep_until(next_dispatch.unwrap_or_else(Instant::now)), if next_dispatch.is_some() => {
                    self.dispatch_next().await;
                }
            }
        }
    }

    fn enqueue(&mut self, pending: PendingCommand) {
        let ready_at = Instant::now() + self.defaults.delay_between_commands;
        self.queue.push_back(Queued { ready_at, pending });
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    async fn dispatch_next(&mut self) {
        let Some(Queued { pending, .. }) = self.queue.pop_front() else {
            return;
        };

        let timeout = pending.options.timeout.unwrap_or(self.defaults.timeout);
        let matcher = CommandMatcher::new(&pending.command, &pending.options);
        self.in_flight = Some(InFlight {
            matcher,
            reply: pending.reply,
            deadline: Instant::now() + timeout,
        });

        if let Err(e) = self.write_segments(&pending.command).await {
            tlog!("[modem] Failed to send '{}': {}", pending.command.trim(), e);
            self.complete(Err(e));
        }
    }

    /// Write each non-empty line of `command` with the terminator appended.
    async fn write_segments(&mut self, command: &str) -> Result<(), IoError> {
        let eol = self.defaults.eol();
        let frames: Vec<String> = command
            .split('\n')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(|segment| format!("{}{}", segment, eol))
            .collect();

        if frames.is_empty() {
            return Err(IoError::write("empty command"));
        }

        for (idx, frame) in frames.iter().enumerate() {
            if idx > 0 {
                sleep(SEGMENT_GAP).await;
            }
            if let Some(tap) = &self.write_tap {
                tap(frame);
            }
            self.transport.write(frame.as_bytes()).await?;
            self.transport.drain().await?;
        }
        Ok(())
    }

    fn complete(&mut self, result: Result<CommandOutput, IoError>) {
        if let Some(in_flight) = self.in_flight.take() {
            let _ = in_flight.reply.send(result);
        }
        self.not_before = Instant::now() + self.defaults.delay_between_commands;
    }

    fn expire(&mut self) {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return;
        };
        let err = in_flight.matcher.expire();
        tlog!("[modem] {}", err);
        // A garbled response may have left an open quote behind
        self.framer.clear();
        self.complete(Err(err));
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    fn handle_chunk(&mut self, bytes: &[u8]) {
        for raw in self.framer.feed(bytes) {
            let line = clean_line(&raw);
            if !line.is_empty() {
                self.handle_line(line);
            }
        }
    }

    fn handle_line(&mut self, line: &str) {
        let Some(in_flight) = self.in_flight.as_mut() else {
            self.emit_rx(line, true);
            self.route_unsolicited(line);
            return;
        };

        match in_flight.matcher.accept(line) {
            LineOutcome::Ignored | LineOutcome::Echo => {}
            LineOutcome::Completed(result) => {
                self.emit_rx(line, false);
                self.complete(result);
            }
            LineOutcome::Collected { solicited } => self.emit_rx(line, !solicited),
            LineOutcome::Unclaimed { solicited } => {
                self.emit_rx(line, !solicited);
                self.route_unsolicited(line);
            }
        }
    }

    fn route_unsolicited(&self, line: &str) {
        if let Some(event) = self.registry.convert(line) {
            let _ = self.events.send(ModemEvent::Event(event));
        }
    }

    fn emit_rx(&self, line: &str, unsolicited: bool) {
        // No subscribers is not an error
        let _ = self.events.send(ModemEvent::Rx {
            line: line.to_string(),
            unsolicited,
        });
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    async fn shutdown(&mut self, chunks: ChunkReceiver) {
        if let Some(in_flight) = self.in_flight.take() {
            let _ = in_flight.reply.send(Err(IoError::Closed));
        }
        for queued in self.queue.drain(..) {
            let _ = queued.pending.reply.send(Err(IoError::Closed));
        }
        // A reader blocked on a full channel only sees the cancel flag once
        // the receiver is gone
        drop(chunks);
        if let Err(e) = self.transport.close().await {
            tlog!("[modem] Error closing {}: {}", self.transport.name(), e);
        }
        tlog!("[modem] {} closed", self.transport.name());
    }
}
