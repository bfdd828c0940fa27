// src/io/error.rs
//
// Error type shared by transports, the command executor and the converter
// registry. Per-command failures are local to that command's reply; none of
// these abort the queue.

use thiserror::Error;

/// Errors surfaced by the modem engine and its transports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoError {
    /// The transport could not be opened. Fatal to the engine instance.
    #[error("failed to open {device}: {message}")]
    TransportOpen { device: String, message: String },

    /// A write or drain failed. Rejects the in-flight command only.
    #[error("write failed: {message}")]
    Write { message: String },

    /// The device answered `ERROR`, `+CME ERROR` or `+CMS ERROR`.
    #[error("'{command}' failed: {line}")]
    Command { command: String, line: String },

    /// No terminal line arrived before the deadline.
    #[error("'{command}' timed out")]
    Timeout { command: String },

    /// A converter could not be registered (programming error).
    #[error("cannot register converter for '{prefix}': {reason}")]
    ConverterRegistration { prefix: String, reason: String },

    /// Control-line status could not be read.
    #[error("status query failed: {message}")]
    Status { message: String },

    /// The engine has shut down.
    #[error("modem port is closed")]
    Closed,

    /// Settings are missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl IoError {
    pub fn transport_open(device: impl Into<String>, message: impl Into<String>) -> Self {
        IoError::TransportOpen {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn write(message: impl Into<String>) -> Self {
        IoError::Write {
            message: message.into(),
        }
    }

    pub fn command(command: impl Into<String>, line: impl Into<String>) -> Self {
        IoError::Command {
            command: command.into(),
            line: line.into(),
        }
    }

    pub fn timeout(command: impl Into<String>) -> Self {
        IoError::Timeout {
            command: command.into(),
        }
    }

    pub fn registration(prefix: impl Into<String>, reason: impl Into<String>) -> Self {
        IoError::ConverterRegistration {
            prefix: prefix.into(),
            reason: reason.into(),
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        IoError::Status {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        IoError::Configuration(message.into())
    }

    /// True for failures reported by the device itself.
    pub fn is_device_error(&self) -> bool {
        matches!(self, IoError::Command { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_message() {
        let err = IoError::command("AT+CPIN?", "+CME ERROR: 10");
        assert_eq!(err.to_string(), "'AT+CPIN?' failed: +CME ERROR: 10");
        assert!(err.is_device_error());
    }

    #[test]
    fn test_timeout_message() {
        let err = IoError::timeout("AT+CFUN=1");
        assert_eq!(err.to_string(), "'AT+CFUN=1' timed out");
        assert!(!err.is_device_error());
    }
}
