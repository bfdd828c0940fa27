// src/modem/converters.rs
//
// Converter registry for unsolicited lines.
// Command modules register a converter per line prefix; the executor looks
// the prefix of every unclaimed line up here and emits whatever event the
// converter produces.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use super::event::Event;
use crate::io::IoError;

/// Parses one unsolicited line into an event, or declines with `None`.
pub type Converter = Arc<dyn Fn(&str) -> Option<Event> + Send + Sync>;

/// Text before the first ':' of a line, or the whole line if it has none.
pub fn line_prefix(line: &str) -> &str {
    match line.find(':') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

// ============================================================================
// Prefix Lists
// ============================================================================

/// One prefix or a list of prefixes accepted by [`ConverterRegistry::register`].
pub trait Prefixes {
    fn into_prefixes(self) -> Vec<String>;
}

impl Prefixes for &str {
    fn into_prefixes(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl Prefixes for String {
    fn into_prefixes(self) -> Vec<String> {
        vec![self]
    }
}

impl Prefixes for &[&str] {
    fn into_prefixes(self) -> Vec<String> {
        self.iter().map(|p| p.to_string()).collect()
    }
}

impl<const N: usize> Prefixes for [&str; N] {
    fn into_prefixes(self) -> Vec<String> {
        self.iter().map(|p| p.to_string()).collect()
    }
}

impl Prefixes for Vec<&str> {
    fn into_prefixes(self) -> Vec<String> {
        self.into_iter().map(str::to_string).collect()
    }
}

impl Prefixes for Vec<String> {
    fn into_prefixes(self) -> Vec<String> {
        self
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default, Clone)]
pub struct ConverterRegistry {
    converters: HashMap<String, Converter>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `converter` under every prefix.
    ///
    /// Either all prefixes are added or none: an empty prefix, a prefix
    /// repeated within the call, or one that is already registered fails the
    /// whole registration.
    pub fn register<P, F>(&mut self, prefixes: P, converter: F) -> Result<(), IoError>
    where
        P: Prefixes,
        F: Fn(&str) -> Option<Event> + Send + Sync + 'static,
    {
        let prefixes = prefixes.into_prefixes();
        let mut seen = HashSet::new();
        for prefix in &prefixes {
            if prefix.is_empty() {
                return Err(IoError::registration(prefix, "prefix is empty"));
            }
            if !seen.insert(prefix.as_str()) {
                return Err(IoError::registration(prefix, "listed twice"));
            }
            if self.converters.contains_key(prefix) {
                return Err(IoError::registration(prefix, "already registered"));
            }
        }

        let converter: Converter = Arc::new(converter);
        for prefix in prefixes {
            self.converters.insert(prefix, converter.clone());
        }
        Ok(())
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.converters.contains_key(prefix)
    }

    pub fn len(&self) -> usize {
        self.converters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }

    /// Run the converter registered for the line's prefix.
    pub fn convert(&self, line: &str) -> Option<Event> {
        self.converters
            .get(line_prefix(line))
            .and_then(|converter| converter(line))
    }
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut prefixes: Vec<&String> = self.converters.keys().collect();
        prefixes.sort();
        f.debug_struct("ConverterRegistry")
            .field("prefixes", &prefixes)
            .finish()
    }
}
