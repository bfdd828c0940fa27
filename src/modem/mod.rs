// src/modem/mod.rs
//
// AT command engine.
// `ModemPortBuilder` collects options, command modules and converters, opens
// the transport and starts the executor (plus the control-line poller when
// enabled). `ModemPort` is the cloneable handle used to submit commands and
// observe events.

mod converters;
mod event;
mod executor;
mod matcher;
mod options;
mod poller;

pub use converters::{line_prefix, Converter, ConverterRegistry, Prefixes};
pub use event::{CommandOutput, Event, EventCategory, ModemEvent};
pub use matcher::{CommandMatcher, LineOutcome, MatchState, ALLOW_LIST};
pub use options::{CommandDefaults, MatchOptions, ModemOptions, Processor};
pub use poller::StatusTracker;

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::api::CommandModule;
use crate::io::{IoError, ModemLineStatus, Transport, WriteTap};
use executor::{ExecutorParts, PendingCommand, Request};

/// Capacity of the broadcast event channel. Slow subscribers lag, they never
/// block the executor.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Builder
// ============================================================================

/// Configures and opens a [`ModemPort`].
pub struct ModemPortBuilder {
    transport: Box<dyn Transport>,
    options: ModemOptions,
    registry: ConverterRegistry,
    write_tap: Option<WriteTap>,
    events: broadcast::Sender<ModemEvent>,
}

impl ModemPortBuilder {
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        Self::from_boxed(Box::new(transport))
    }

    pub fn from_boxed(transport: Box<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        ModemPortBuilder {
            transport,
            options: ModemOptions::default(),
            registry: ConverterRegistry::new(),
            write_tap: None,
            events,
        }
    }

    pub fn options(mut self, options: ModemOptions) -> Self {
        self.options = options;
        self
    }

    /// Observe every frame just before it is written.
    pub fn on_write<F>(mut self, tap: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.write_tap = Some(Arc::new(tap));
        self
    }

    /// Install a command module's converters.
    pub fn with_module<M: CommandModule + ?Sized>(mut self, module: &M) -> Result<Self, IoError> {
        module.install(&mut self.registry)?;
        tlog!("[modem] Installed module {}", module.name());
        Ok(self)
    }

    pub fn register_converter<P, F>(mut self, prefixes: P, converter: F) -> Result<Self, IoError>
    where
        P: Prefixes,
        F: Fn(&str) -> Option<Event> + Send + Sync + 'static,
    {
        self.registry.register(prefixes, converter)?;
        Ok(self)
    }

    /// Subscribe before opening, so no event is missed.
    pub fn subscribe(&self) -> broadcast::Receiver<ModemEvent> {
        self.events.subscribe()
    }

    /// Open the transport and start the engine.
    pub async fn open(self) -> Result<ModemPort, IoError> {
        let mut transport = self.transport;
        let chunks = match transport.open().await {
            Ok(chunks) => chunks,
            Err(e) => {
                tlog!("[modem] {}", e);
                return Err(e);
            }
        };
        let name = transport.name().to_string();

        let (requests, executor) = executor::spawn_executor(ExecutorParts {
            transport,
            chunks,
            registry: self.registry,
            events: self.events.clone(),
            defaults: self.options.command_defaults(),
            write_tap: self.write_tap,
        });

        let (bits_tx, bits_rx) = watch::channel(ModemLineStatus::UNKNOWN);
        let poller = self.options.flag_check_interval().map(|period| {
            poller::spawn_status_poller(requests.downgrade(), self.events.clone(), bits_tx, period)
        });

        tlog!(
            "[modem] {} ready (timeout {} ms, delay {} ms, poll {})",
            name,
            self.options.timeout,
            self.options.delay_between_commands,
            match self.options.flag_check_interval {
                0 => "off".to_string(),
                ms => format!("{} ms", ms),
            }
        );

        Ok(ModemPort {
            inner: Arc::new(PortInner {
                name,
                requests,
                events: self.events,
                modem_bits: bits_rx,
                executor: Mutex::new(Some(executor)),
                poller: Mutex::new(poller),
            }),
        })
    }
}

// ============================================================================
// Port Handle
// ============================================================================

struct PortInner {
    name: String,
    requests: mpsc::Sender<Request>,
    events: broadcast::Sender<ModemEvent>,
    modem_bits: watch::Receiver<ModemLineStatus>,
    executor: Mutex<Option<JoinHandle<()>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to an open modem. Cheap to clone; all clones share one engine.
#[derive(Clone)]
pub struct ModemPort {
    inner: Arc<PortInner>,
}

impl ModemPort {
    pub fn builder<T: Transport + 'static>(transport: T) -> ModemPortBuilder {
        ModemPortBuilder::new(transport)
    }

    /// Open a serial modem with the given options and no command modules.
    #[cfg(not(target_os = "ios"))]
    pub async fn open_serial(path: &str, options: ModemOptions) -> Result<ModemPort, IoError> {
        let transport = crate::io::SerialTransport::new(options.serial_config(path));
        ModemPortBuilder::new(transport).options(options).open().await
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue a command and wait for its result.
    ///
    /// Commands run one at a time in submission order. Multi-line commands
    /// are written one line at a time.
    pub async fn write_command(
        &self,
        command: impl Into<String>,
        options: MatchOptions,
    ) -> Result<CommandOutput, IoError> {
        let (reply, reply_rx) = oneshot::channel();
        self.inner
            .requests
            .send(Request::Submit(PendingCommand {
                command: command.into(),
                options,
                reply,
            }))
            .await
            .map_err(|_| IoError::Closed)?;
        reply_rx.await.map_err(|_| IoError::Closed)?
    }

    /// `write_command` with `AT` prepended.
    pub async fn write_at(
        &self,
        command: impl AsRef<str>,
        options: MatchOptions,
    ) -> Result<CommandOutput, IoError> {
        self.write_command(format!("AT{}", command.as_ref()), options)
            .await
    }

    /// Read the control lines now, between command writes.
    pub async fn control_lines(&self) -> Result<ModemLineStatus, IoError> {
        let (reply, reply_rx) = oneshot::channel();
        self.inner
            .requests
            .send(Request::ControlLines { reply })
            .await
            .map_err(|_| IoError::Closed)?;
        reply_rx.await.map_err(|_| IoError::Closed)?
    }

    /// Replace delay, timeout and terminator for commands dispatched from now on.
    pub async fn set_defaults(&self, defaults: CommandDefaults) -> Result<(), IoError> {
        self.inner
            .requests
            .send(Request::UpdateDefaults(defaults))
            .await
            .map_err(|_| IoError::Closed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModemEvent> {
        self.inner.events.subscribe()
    }

    /// Last control-line snapshot published by the poller.
    pub fn modem_bits(&self) -> ModemLineStatus {
        *self.inner.modem_bits.borrow()
    }

    /// Watch control-line snapshots.
    pub fn watch_modem_bits(&self) -> watch::Receiver<ModemLineStatus> {
        self.inner.modem_bits.clone()
    }

    /// Stop polling, reject outstanding commands with `Closed` and close the
    /// transport. Closing an already closed port is a no-op.
    pub async fn close(&self) -> Result<(), IoError> {
        if let Some(poller) = self.inner.poller.lock().ok().and_then(|mut p| p.take()) {
            poller.abort();
        }

        let (reply, reply_rx) = oneshot::channel();
        if self
            .inner
            .requests
            .send(Request::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }

        let executor = self.inner.executor.lock().ok().and_then(|mut e| e.take());
        if let Some(executor) = executor {
            let _ = executor.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{memory_pair, MemoryDevice};
    use regex::Regex;
    use std::time::Duration;
    use tokio::time::{sleep, timeout, Instant};

    fn quiet() -> ModemOptions {
        ModemOptions {
            flag_check_interval: 0,
            ..Default::default()
        }
    }

    fn sms_indication(line: &str) -> Option<Event> {
        let (_, rest) = line.split_once(':')?;
        Some(
            Event::new("sms", EventCategory::Event)
                .with_message("new message")
                .with_field("storage", rest.trim()),
        )
    }

    async fn open_port(
        builder: ModemPortBuilder,
    ) -> (ModemPort, broadcast::Receiver<ModemEvent>) {
        let events = builder.subscribe();
        (builder.open().await.unwrap(), events)
    }

    async fn open_quiet() -> (ModemPort, MemoryDevice, broadcast::Receiver<ModemEvent>) {
        let (transport, device) = memory_pair("mem0");
        let (port, events) = open_port(
            ModemPort::builder(transport)
                .options(quiet())
                .register_converter("+CMTI", sms_indication)
                .unwrap(),
        )
        .await;
        (port, device, events)
    }

    fn rx(line: &str, unsolicited: bool) -> ModemEvent {
        ModemEvent::Rx {
            line: line.to_string(),
            unsolicited,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_then_ok_resolves_empty() {
        let (port, mut device, _events) = open_quiet().await;
        let p = port.clone();
        let task = tokio::spawn(async move { p.write_at("+CFUN=1", MatchOptions::new()).await });

        assert_eq!(device.next_write().await.as_deref(), Some("AT+CFUN=1\r\n"));
        device.send("AT+CFUN=1\r\n\r\nOK\r\n").await.unwrap();
        assert_eq!(task.await.unwrap(), Ok(CommandOutput::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expect_collects_payload() {
        let (port, mut device, mut events) = open_quiet().await;
        let p = port.clone();
        let task = tokio::spawn(async move {
            p.write_at(
                "+CSQ",
                MatchOptions::new().expect(Regex::new(r"^\+CSQ:").unwrap()),
            )
            .await
        });

        device.next_write().await.unwrap();
        device.send("+CSQ: 21,99\r\nOK\r\n").await.unwrap();
        assert_eq!(
            task.await.unwrap(),
            Ok(CommandOutput::Lines(vec!["+CSQ: 21,99".to_string()]))
        );
        assert_eq!(events.recv().await.unwrap(), rx("+CSQ: 21,99", false));
        assert_eq!(events.recv().await.unwrap(), rx("OK", false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_between_payload_and_ok_is_routed() {
        let (port, mut device, mut events) = open_quiet().await;
        let p = port.clone();
        let task = tokio::spawn(async move {
            p.write_at(
                "+CSQ",
                MatchOptions::new().expect(Regex::new(r"^\+CSQ:").unwrap()),
            )
            .await
        });

        device.next_write().await.unwrap();
        device
            .send("+CSQ: 21,99\r\n+CMTI: \"SM\",3\r\nOK\r\n")
            .await
            .unwrap();

        assert_eq!(
            task.await.unwrap(),
            Ok(CommandOutput::Lines(vec!["+CSQ: 21,99".to_string()]))
        );
        assert_eq!(events.recv().await.unwrap(), rx("+CSQ: 21,99", false));
        assert_eq!(events.recv().await.unwrap(), rx("+CMTI: \"SM\",3", true));
        let ModemEvent::Event(event) = events.recv().await.unwrap() else {
            panic!("expected a converted event");
        };
        assert_eq!(event.id, "sms");
        assert_eq!(events.recv().await.unwrap(), rx("OK", false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_between_commands_paces_writes() {
        let (transport, mut device) = memory_pair("mem0");
        let (port, _events) = open_port(ModemPort::builder(transport).options(ModemOptions {
            delay_between_commands: 200,
            ..quiet()
        }))
        .await;

        let submitted = Instant::now();
        let mut tasks = Vec::new();
        for cmd in ["+C1", "+C2"] {
            let p = port.clone();
            tasks.push(tokio::spawn(async move {
                p.write_at(cmd, MatchOptions::new()).await
            }));
        }

        assert_eq!(device.next_write().await.as_deref(), Some("AT+C1\r\n"));
        assert!(submitted.elapsed() >= Duration::from_millis(200));

        device.send("OK\r\n").await.unwrap();
        let ok_at = Instant::now();
        assert_eq!(device.next_write().await.as_deref(), Some("AT+C2\r\n"));
        assert!(ok_at.elapsed() >= Duration::from_millis(200));
        device.send("OK\r\n").await.unwrap();

        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(CommandOutput::Empty));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_run_in_submission_order() {
        let (port, mut device, _events) = open_quiet().await;

        let mut tasks = Vec::new();
        for cmd in ["+C1", "+C2", "+C3"] {
            let p = port.clone();
            tasks.push(tokio::spawn(async move {
                p.write_at(cmd, MatchOptions::new()).await
            }));
            // Let the task submit before spawning the next one
            sleep(Duration::from_millis(1)).await;
        }

        for expected in ["AT+C1\r\n", "AT+C2\r\n", "AT+C3\r\n"] {
            assert_eq!(device.next_write().await.as_deref(), Some(expected));
            // Nothing else goes out while this one is in flight
            sleep(Duration::from_millis(100)).await;
            assert_eq!(device.try_next_write(), None);
            device.send("OK\r\n").await.unwrap();
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(CommandOutput::Empty));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolicited_line_during_command_is_routed() {
        let (port, mut device, mut events) = open_quiet().await;
        let p = port.clone();
        let task = tokio::spawn(async move { p.write_at("+CSQ", MatchOptions::new()).await });

        device.next_write().await.unwrap();
        device.send("+CMTI: \"SM\",3\r\n").await.unwrap();
        device.send("+CSQ: 20,99\r\nOK\r\n").await.unwrap();

        assert_eq!(task.await.unwrap(), Ok(CommandOutput::Empty));
        assert_eq!(events.recv().await.unwrap(), rx("+CMTI: \"SM\",3", true));
        let ModemEvent::Event(event) = events.recv().await.unwrap() else {
            panic!("expected a converted event");
        };
        assert_eq!(event.id, "sms");
        assert_eq!(event.field_str("storage"), Some("\"SM\",3"));
        assert_eq!(events.recv().await.unwrap(), rx("+CSQ: 20,99", false));
        assert_eq!(events.recv().await.unwrap(), rx("OK", false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_lines_are_unsolicited() {
        let (_port, device, mut events) = open_quiet().await;
        device.send("\r\nRING\r\n").await.unwrap();
        assert_eq!(events.recv().await.unwrap(), rx("RING", true));

        device.send("+CMTI: \"ME\",1\r\n").await.unwrap();
        assert_eq!(events.recv().await.unwrap(), rx("+CMTI: \"ME\",1", true));
        assert!(matches!(
            events.recv().await.unwrap(),
            ModemEvent::Event(Event { ref id, .. }) if id == "sms"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_ok_is_unsolicited() {
        let (port, mut device, mut events) = open_quiet().await;
        let p = port.clone();
        let task = tokio::spawn(async move {
            p.write_at(
                "+COPS=?",
                MatchOptions::new().timeout(Duration::from_millis(50)),
            )
            .await
        });

        device.next_write().await.unwrap();
        // Open quote left behind by a garbled response
        device.send("+COPS: (2,\"Tel").await.unwrap();
        sleep(Duration::from_millis(60)).await;
        device.send("OK\r\n").await.unwrap();

        assert_eq!(task.await.unwrap(), Err(IoError::timeout("AT+COPS=?")));
        assert_eq!(events.recv().await.unwrap(), rx("OK", true));

        // The engine keeps working
        let p = port.clone();
        let task = tokio::spawn(async move { p.write_at("", MatchOptions::new()).await });
        assert_eq!(device.next_write().await.as_deref(), Some("AT\r\n"));
        device.send("OK\r\n").await.unwrap();
        assert_eq!(task.await.unwrap(), Ok(CommandOutput::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_errors_reject() {
        let (port, mut device, _events) = open_quiet().await;

        for line in ["ERROR", "+CME ERROR: 10", "+CMS ERROR: 321"] {
            let p = port.clone();
            let task = tokio::spawn(async move { p.write_at("+CMGR=1", MatchOptions::new()).await });
            device.next_write().await.unwrap();
            device.send(format!("{}\r\n", line)).await.unwrap();

            let err = task.await.unwrap().unwrap_err();
            assert_eq!(err, IoError::command("AT+CMGR=1", line));
            assert!(err.is_device_error());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_rejects_and_queue_continues() {
        let (port, mut device, _events) = open_quiet().await;

        device.fail_writes(Some("cable pulled".to_string()));
        let err = port.write_at("+CFUN?", MatchOptions::new()).await.unwrap_err();
        assert_eq!(err, IoError::write("cable pulled"));

        device.fail_writes(None);
        let p = port.clone();
        let task = tokio::spawn(async move { p.write_at("+CFUN?", MatchOptions::new()).await });
        assert_eq!(device.next_write().await.as_deref(), Some("AT+CFUN?\r\n"));
        device.send("OK\r\n").await.unwrap();
        assert_eq!(task.await.unwrap(), Ok(CommandOutput::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_line_command_is_written_in_segments() {
        let (transport, mut device) = memory_pair("mem0");
        let frames = Arc::new(Mutex::new(Vec::new()));
        let tap = frames.clone();
        let (port, _events) = open_port(
            ModemPort::builder(transport)
                .options(quiet())
                .on_write(move |frame| tap.lock().unwrap().push(frame.to_string())),
        )
        .await;

        let p = port.clone();
        let task = tokio::spawn(async move {
            p.write_command("AT+CMGS=\"+15551234\"\n  hello\u{1a}\n", MatchOptions::new())
                .await
        });

        assert_eq!(
            device.next_write().await.as_deref(),
            Some("AT+CMGS=\"+15551234\"\r\n")
        );
        assert_eq!(device.next_write().await.as_deref(), Some("hello\u{1a}\r\n"));
        device.send("AT+CMGS=\"+15551234\"\r\n> \r\n+CMGS: 7\r\nOK\r\n").await.unwrap();
        assert_eq!(task.await.unwrap(), Ok(CommandOutput::Empty));

        assert_eq!(
            *frames.lock().unwrap(),
            vec!["AT+CMGS=\"+15551234\"\r\n", "hello\u{1a}\r\n"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_defaults_switches_terminator() {
        let (port, mut device, _events) = open_quiet().await;
        port.set_defaults(CommandDefaults {
            null_terminated: true,
            ..CommandDefaults::default()
        })
        .await
        .unwrap();

        let p = port.clone();
        let task = tokio::spawn(async move { p.write_at("I", MatchOptions::new()).await });
        assert_eq!(device.next_write().await.as_deref(), Some("ATI\0"));
        device.send("nRF9160\0OK\0").await.unwrap();
        assert_eq!(task.await.unwrap(), Ok(CommandOutput::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_defaults_changes_delay_and_timeout() {
        let (port, mut device, _events) = open_quiet().await;
        port.set_defaults(CommandDefaults {
            delay_between_commands: Duration::from_millis(100),
            timeout: Duration::from_millis(300),
            null_terminated: false,
        })
        .await
        .unwrap();

        let submitted = Instant::now();
        let p = port.clone();
        let task = tokio::spawn(async move { p.write_at("+COPS?", MatchOptions::new()).await });

        device.next_write().await.unwrap();
        assert!(submitted.elapsed() >= Duration::from_millis(100));
        let written_at = Instant::now();

        assert_eq!(task.await.unwrap(), Err(IoError::timeout("AT+COPS?")));
        let waited = written_at.elapsed();
        assert!(waited >= Duration::from_millis(300));
        assert!(waited < Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure() {
        let (transport, device) = memory_pair("mem0");
        device.fail_open("no such device");
        let result = ModemPort::builder(transport).options(quiet()).open().await;
        assert!(matches!(result, Err(IoError::TransportOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_rejects_outstanding_commands() {
        let (port, mut device, _events) = open_quiet().await;
        let p = port.clone();
        let in_flight = tokio::spawn(async move { p.write_at("+COPS=?", MatchOptions::new()).await });
        device.next_write().await.unwrap();

        let p = port.clone();
        let queued = tokio::spawn(async move { p.write_at("+CSQ", MatchOptions::new()).await });
        sleep(Duration::from_millis(1)).await;

        port.close().await.unwrap();
        assert_eq!(in_flight.await.unwrap(), Err(IoError::Closed));
        assert_eq!(queued.await.unwrap(), Err(IoError::Closed));
        assert_eq!(
            port.write_at("", MatchOptions::new()).await,
            Err(IoError::Closed)
        );
        assert!(port.close().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_releases_input_stream() {
        let (port, device, _events) = open_quiet().await;
        port.close().await.unwrap();
        assert_eq!(device.send("RING\r\n").await, Err(IoError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_poller_emits_edges_only() {
        let (transport, device) = memory_pair("mem0");
        let (port, mut events) = open_port(ModemPort::builder(transport)).await;

        let idle = ModemLineStatus::new(false, false, false);
        let first = timeout(Duration::from_millis(150), events.recv()).await;
        assert_eq!(first.unwrap().unwrap(), ModemEvent::ModemBits(idle));
        assert_eq!(port.modem_bits(), idle);

        // Same status on the following polls
        assert!(timeout(Duration::from_millis(350), events.recv()).await.is_err());

        let carrier = ModemLineStatus::new(true, true, true);
        device.set_line_status(carrier);
        let edge = timeout(Duration::from_millis(150), events.recv()).await;
        assert_eq!(edge.unwrap().unwrap(), ModemEvent::ModemBits(carrier));
        assert!(timeout(Duration::from_millis(350), events.recv()).await.is_err());

        // A failed poll stops polling and forgets the snapshot
        device.fail_line_status("ioctl failed");
        let mut bits = port.watch_modem_bits();
        timeout(Duration::from_millis(150), bits.wait_for(|s| s.is_unknown()))
            .await
            .unwrap()
            .unwrap();
        assert!(port.modem_bits().is_unknown());
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_lines_on_demand() {
        let (port, device, _events) = open_quiet().await;
        device.set_line_status(ModemLineStatus::new(true, false, true));
        assert_eq!(
            port.control_lines().await,
            Ok(ModemLineStatus::new(true, false, true))
        );
        assert!(port.modem_bits().is_unknown());
    }
}
