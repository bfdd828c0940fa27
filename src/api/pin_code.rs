// src/api/pin_code.rs
//
// SIM PIN handling: +CPIN (enter / query state) and +CPINR (remaining
// retries).

use once_cell::sync::Lazy;
use regex::Regex;

use super::CommandModule;
use crate::io::IoError;
use crate::modem::{
    CommandOutput, ConverterRegistry, Event, EventCategory, MatchOptions, ModemPort,
};

/// Matches both `+CPIN: <code>` and `+CPINR: <code>,<retries>`, quoted or not.
static PIN_RESPONSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\+CPIN(R?): ?"?([A-Z0-9 -]+)"?(?:,([0-9]+))?"#).expect("valid PIN regex")
});

/// Human readable description of a SIM PIN state code.
pub fn pin_state_description(code: &str) -> Option<&'static str> {
    match code {
        "READY" => Some("no PIN required"),
        "SIM PIN" => Some("PIN code required"),
        "SIM PUK" => Some("PUK code required"),
        "SIM PIN2" => Some("PIN2 code required"),
        "SIM PUK2" => Some("PUK2 code required"),
        _ => None,
    }
}

/// Convert a `+CPIN` or `+CPINR` line into a `pin` or `pinRemaining` event.
pub fn convert_pin_response(line: &str) -> Option<Event> {
    let caps = PIN_RESPONSE.captures(line)?;
    let code = caps.get(2)?.as_str().trim();

    if caps.get(1).is_some_and(|m| !m.as_str().is_empty()) {
        let retries: u32 = caps.get(3)?.as_str().parse().ok()?;
        return Some(
            Event::new("pinRemaining", EventCategory::Event)
                .with_message(format!("{} remaining {} retries", code, retries))
                .with_field("code", code)
                .with_field("retries", retries),
        );
    }

    let event = Event::new("pin", EventCategory::Event);
    Some(match pin_state_description(code) {
        Some(state) => event.with_message(state).with_field("state", state),
        None => event.with_message(code),
    })
}

/// Resolves to the last `+CPIN` / `+CPINR` line of the payload.
fn last_line_processor() -> MatchOptions {
    MatchOptions::new()
        .expect(Regex::clone(&PIN_RESPONSE))
        .processor(|lines| lines.iter().rev().find_map(|line| convert_pin_response(line)))
}

// ============================================================================
// Module
// ============================================================================

/// Installs the `+CPIN` / `+CPINR` converter.
#[derive(Debug, Default, Clone, Copy)]
pub struct PinCodeModule;

impl CommandModule for PinCodeModule {
    fn name(&self) -> &'static str {
        "pin-code"
    }

    fn install(&self, registry: &mut ConverterRegistry) -> Result<(), IoError> {
        registry.register(["+CPIN", "+CPINR"], convert_pin_response)
    }
}

// ============================================================================
// Verbs
// ============================================================================

/// PIN verbs on a port that has [`PinCodeModule`] installed.
#[derive(Clone)]
pub struct PinCode {
    modem: ModemPort,
}

impl PinCode {
    pub fn new(modem: ModemPort) -> Self {
        PinCode { modem }
    }

    /// `AT+CPIN="<pin>"`, or `AT+CPIN="<puk>","<new pin>"` to unblock.
    pub async fn enter_pin(&self, pin: &str, new_pin: Option<&str>) -> Result<(), IoError> {
        let command = match new_pin {
            Some(new_pin) => format!("+CPIN=\"{}\",\"{}\"", pin, new_pin),
            None => format!("+CPIN=\"{}\"", pin),
        };
        self.modem.write_at(command, MatchOptions::new()).await?;
        Ok(())
    }

    /// Query the SIM PIN state. Resolves to a `pin` event, or `None` if the
    /// device answered `OK` without a `+CPIN` line.
    pub async fn check_pin(&self) -> Result<Option<Event>, IoError> {
        let output = self.modem.write_at("+CPIN?", last_line_processor()).await?;
        Ok(output.into_value())
    }

    /// Query the remaining SIM PIN attempts. Resolves to a `pinRemaining`
    /// event.
    pub async fn pin_retries(&self) -> Result<Option<Event>, IoError> {
        let output: CommandOutput = self
            .modem
            .write_at("+CPINR=\"SIM PIN\"", last_line_processor())
            .await?;
        Ok(output.into_value())
    }
}
