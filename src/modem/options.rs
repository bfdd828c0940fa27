// src/modem/options.rs
//
// Engine options and per-command match options.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::event::Event;
use crate::io::{FlowControl, Parity};

// ============================================================================
// Engine Options
// ============================================================================

fn default_baud_rate() -> u32 {
    115_200
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_delay_between_commands() -> u64 {
    20
}

fn default_timeout() -> u64 {
    1000
}

fn default_flag_check_interval() -> u64 {
    100
}

/// Options for a modem port. All durations are in milliseconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModemOptions {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub flow_control: FlowControl,
    /// Minimum gap between one command completing and the next being written
    #[serde(default = "default_delay_between_commands")]
    pub delay_between_commands: u64,
    /// Default per-command timeout
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Terminate commands with NUL instead of CRLF
    #[serde(default)]
    pub null_terminated: bool,
    /// Control-line poll interval; 0 disables polling
    #[serde(default = "default_flag_check_interval")]
    pub flag_check_interval: u64,
}

impl Default for ModemOptions {
    fn default() -> Self {
        ModemOptions {
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::default(),
            flow_control: FlowControl::default(),
            delay_between_commands: default_delay_between_commands(),
            timeout: default_timeout(),
            null_terminated: false,
            flag_check_interval: default_flag_check_interval(),
        }
    }
}

impl ModemOptions {
    pub fn command_defaults(&self) -> CommandDefaults {
        CommandDefaults {
            delay_between_commands: Duration::from_millis(self.delay_between_commands),
            timeout: Duration::from_millis(self.timeout),
            null_terminated: self.null_terminated,
        }
    }

    /// Poll interval, `None` when polling is disabled.
    pub fn flag_check_interval(&self) -> Option<Duration> {
        (self.flag_check_interval > 0).then(|| Duration::from_millis(self.flag_check_interval))
    }

    #[cfg(not(target_os = "ios"))]
    pub fn serial_config(&self, port: impl Into<String>) -> crate::io::SerialConfig {
        crate::io::SerialConfig {
            port: port.into(),
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity,
            flow_control: self.flow_control,
        }
    }
}

/// The subset of options the executor applies per command. Can be replaced
/// on a running port with `ModemPort::set_defaults`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandDefaults {
    pub delay_between_commands: Duration,
    pub timeout: Duration,
    pub null_terminated: bool,
}

impl Default for CommandDefaults {
    fn default() -> Self {
        ModemOptions::default().command_defaults()
    }
}

impl CommandDefaults {
    /// Line terminator appended to every command segment.
    pub fn eol(&self) -> &'static str {
        if self.null_terminated {
            "\0"
        } else {
            "\r\n"
        }
    }
}

// ============================================================================
// Match Options
// ============================================================================

/// Turns the collected payload lines of a command into a value.
pub type Processor = Arc<dyn Fn(&[String]) -> Option<Event> + Send + Sync>;

/// Per-command response matching options.
#[derive(Clone, Default)]
pub struct MatchOptions {
    pub expect: Option<Regex>,
    pub processor: Option<Processor>,
    pub timeout: Option<Duration>,
}

impl MatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines matching `expect` are collected as payload.
    pub fn expect(mut self, expect: Regex) -> Self {
        self.expect = Some(expect);
        self
    }

    pub fn processor<F>(mut self, processor: F) -> Self
    where
        F: Fn(&[String]) -> Option<Event> + Send + Sync + 'static,
    {
        self.processor = Some(Arc::new(processor));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for MatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchOptions")
            .field("expect", &self.expect.as_ref().map(Regex::as_str))
            .field("processor", &self.processor.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}
