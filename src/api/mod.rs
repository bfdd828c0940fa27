// src/api/mod.rs
//
// Command modules.
// A command module teaches a port about one family of AT commands: it
// registers converters for the unsolicited lines of that family when the
// port is built, and exposes typed verbs on a thin wrapper over `ModemPort`.

pub mod pin_code;

pub use pin_code::{convert_pin_response, PinCode, PinCodeModule};

use crate::io::IoError;
use crate::modem::ConverterRegistry;

/// A family of AT commands that can be installed on a port builder.
pub trait CommandModule {
    /// Module name, used in logs.
    fn name(&self) -> &'static str;

    /// Register this module's converters.
    fn install(&self, registry: &mut ConverterRegistry) -> Result<(), IoError>;
}
