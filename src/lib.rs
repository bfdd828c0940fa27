// AT command engine for serial-attached modems.
//
// Bytes from a transport are framed into lines, matched against the single
// in-flight command, and everything else is routed to converters registered
// by command modules. See `modem::ModemPort` for the entry point.

#[macro_use]
pub mod logging;

pub mod api;
pub mod io;
pub mod modem;
pub mod settings;

pub use api::{CommandModule, PinCode, PinCodeModule};
pub use io::{IoError, ModemLineStatus, Transport};
pub use modem::{
    CommandDefaults, CommandOutput, Event, EventCategory, MatchOptions, ModemEvent, ModemOptions,
    ModemPort, ModemPortBuilder,
};
pub use settings::{load_settings, ModemSettings};
