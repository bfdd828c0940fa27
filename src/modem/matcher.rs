// src/modem/matcher.rs
//
// Response matching for the in-flight command.
// Every cleaned line received while a command is in flight goes through
// `CommandMatcher::accept`, which decides whether the line ends the command,
// is its echo, belongs to its payload, or is someone else's business.

use regex::Regex;

use super::converters::line_prefix;
use super::event::CommandOutput;
use super::options::{MatchOptions, Processor};
use crate::io::IoError;

/// Commands whose responses carry no `+CMD:` prefix.
pub const ALLOW_LIST: [&str; 5] = ["AT+CLAC", "AT+CGSN", "AT+CGMM", "AT+CGMI", "AT+CGMR"];

const ERROR_PREFIXES: [&str; 3] = ["ERROR", "+CME ERROR", "+CMS ERROR"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchState {
    AwaitingEchoOrPayload,
    Collecting,
    Terminated,
}

/// What the executor should do with a line.
#[derive(Debug, PartialEq)]
pub enum LineOutcome {
    /// Empty line
    Ignored,
    /// Echo of the command, dropped
    Echo,
    /// Terminal line; the command is done
    Completed(Result<CommandOutput, IoError>),
    /// Appended to the payload
    Collected { solicited: bool },
    /// Not part of the payload; route it as an unsolicited line
    Unclaimed { solicited: bool },
}

/// Match state of one in-flight command.
pub struct CommandMatcher {
    command: String,
    /// Command text up to its first `?`, `:` or `=`
    prefix: String,
    expect: Option<Regex>,
    processor: Option<Processor>,
    lines: Vec<String>,
    state: MatchState,
}

impl CommandMatcher {
    pub fn new(command: &str, options: &MatchOptions) -> Self {
        let command = command.trim().to_string();
        let prefix = command
            .split(['?', ':', '='])
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        CommandMatcher {
            command,
            prefix,
            expect: options.expect.clone(),
            processor: options.processor.clone(),
            lines: Vec::new(),
            state: MatchState::AwaitingEchoOrPayload,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn state(&self) -> MatchState {
        self.state
    }

    /// Whether a line looks like a response to this command.
    pub fn is_solicited(&self, line: &str) -> bool {
        if let Some(expect) = &self.expect {
            return expect.is_match(line);
        }
        if self.prefix.strip_prefix("AT") == Some(line_prefix(line)) {
            return true;
        }
        ALLOW_LIST.contains(&self.prefix.as_str())
    }

    pub fn accept(&mut self, line: &str) -> LineOutcome {
        if line.is_empty() || self.state == MatchState::Terminated {
            return LineOutcome::Ignored;
        }

        if line == "OK" {
            self.state = MatchState::Terminated;
            return LineOutcome::Completed(Ok(self.finish()));
        }
        if ERROR_PREFIXES.contains(&line_prefix(line)) {
            self.state = MatchState::Terminated;
            return LineOutcome::Completed(Err(IoError::command(&self.command, line)));
        }

        if self.lines.is_empty() && self.command.starts_with(line) {
            return LineOutcome::Echo;
        }

        // Only lines matching `expect` belong to the payload; anything else is routed
        match &self.expect {
            Some(expect) if expect.is_match(line) => {
                self.lines.push(line.to_string());
                self.state = MatchState::Collecting;
                LineOutcome::Collected { solicited: true }
            }
            Some(_) => LineOutcome::Unclaimed { solicited: false },
            None => LineOutcome::Unclaimed {
                solicited: self.is_solicited(line),
            },
        }
    }

    /// Tear the matcher down after its deadline passed.
    pub fn expire(&mut self) -> IoError {
        self.state = MatchState::Terminated;
        IoError::timeout(&self.command)
    }

    fn finish(&mut self) -> CommandOutput {
        let lines = std::mem::take(&mut self.lines);
        if lines.is_empty() {
            return CommandOutput::Empty;
        }
        match &self.processor {
            Some(processor) => processor(&lines)
                .map(CommandOutput::Value)
                .unwrap_or(CommandOutput::Empty),
            None => CommandOutput::Lines(lines),
        }
    }
}
