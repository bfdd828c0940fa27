// src/modem/event.rs
//
// Observable engine events and command results.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::io::ModemLineStatus;

// ============================================================================
// Structured Events
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    #[default]
    Event,
    Raw,
}

/// A structured event produced by a converter or a command processor.
///
/// Payload fields are specific to the event id and are flattened next to
/// `id`, `category` and `message` when serialized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub category: EventCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Event {
    pub fn new(id: impl Into<String>, category: EventCategory) -> Self {
        Event {
            id: id.into(),
            category,
            message: None,
            fields: Map::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// String payload field, if present and a string.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

// ============================================================================
// Engine Events
// ============================================================================

/// Everything a subscriber can observe on a modem port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModemEvent {
    /// A cleaned, non-empty line received from the device.
    Rx { line: String, unsolicited: bool },
    /// A converter recognised an unsolicited line.
    Event(Event),
    /// The control lines changed.
    ModemBits(ModemLineStatus),
}

// ============================================================================
// Command Results
// ============================================================================

/// How a command resolved.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CommandOutput {
    /// Terminal `OK` with no payload (or the processor declined).
    Empty,
    /// Collected payload lines, no processor given.
    Lines(Vec<String>),
    /// Processor result.
    Value(Event),
}

impl CommandOutput {
    pub fn is_empty(&self) -> bool {
        matches!(self, CommandOutput::Empty)
    }

    pub fn lines(&self) -> &[String] {
        match self {
            CommandOutput::Lines(lines) => lines,
            _ => &[],
        }
    }

    pub fn value(&self) -> Option<&Event> {
        match self {
            CommandOutput::Value(event) => Some(event),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Event> {
        match self {
            CommandOutput::Value(event) => Some(event),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serializes_flat() {
        let event = Event::new("pinRemaining", EventCategory::Event)
            .with_message("SIM PIN remaining 3 retries")
            .with_field("code", "SIM PIN")
            .with_field("retries", 3);
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "id": "pinRemaining",
                "category": "event",
                "message": "SIM PIN remaining 3 retries",
                "code": "SIM PIN",
                "retries": 3
            })
        );
        assert_eq!(event.field_str("code"), Some("SIM PIN"));
        assert_eq!(event.field("retries"), Some(&json!(3)));
    }

    #[test]
    fn test_modem_event_tagging() {
        let rx = ModemEvent::Rx {
            line: "RING".to_string(),
            unsolicited: true,
        };
        assert_eq!(
            serde_json::to_value(&rx).unwrap(),
            json!({"type": "rx", "line": "RING", "unsolicited": true})
        );

        let bits = ModemEvent::ModemBits(ModemLineStatus::new(true, false, false));
        assert_eq!(
            serde_json::to_value(&bits).unwrap(),
            json!({"type": "modem_bits", "cts": true, "dsr": false, "dcd": false})
        );
    }

    #[test]
    fn test_command_output_accessors() {
        assert!(CommandOutput::Empty.is_empty());
        let lines = CommandOutput::Lines(vec!["+CSQ: 20,99".to_string()]);
        assert_eq!(lines.lines(), ["+CSQ: 20,99".to_string()]);
        assert!(lines.value().is_none());

        let value = CommandOutput::Value(Event::new("pin", EventCategory::Event));
        assert_eq!(value.into_value().map(|e| e.id), Some("pin".to_string()));
    }
}
