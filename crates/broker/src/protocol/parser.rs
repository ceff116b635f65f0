// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session fence parser (§4.3). Feeds one logical line (as produced by
//! [`crate::normalizer::Normalizer`]) at a time and returns zero or more
//! outcomes: a command, a parse error, or nothing yet.

use std::time::Duration;

use crate::command::{ControlKind, MessageKind, ParsedCommand, Target};

const OPEN_FENCE: &str = "<<<RELAY";
const CLOSE_FENCE: &str = "RELAY>>>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub reason: String,
}

impl ParseError {
    fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Scanning,
    InHeaders,
    InBody,
}

/// One outcome of feeding a line into the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Command(ParsedCommand),
    Error(ParseError),
}

/// Per-session parser state. A malformed block never desyncs parsing beyond
/// the line it failed on (§8 property 7): the next well-formed `<<<RELAY`
/// is always recognized.
#[derive(Debug)]
pub struct Parser {
    state: State,
    headers: Vec<(String, String)>,
    body: Vec<String>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self { state: State::Scanning, headers: Vec::new(), body: Vec::new() }
    }

    /// Feed one logical line. May produce 0, 1, or 2 outcomes (a nested
    /// fence can both terminate an outer block and, on a later line,
    /// complete the inner one; each `feed_line` call yields at most one,
    /// but the nested-fence case below can legitimately recurse once).
    pub fn feed_line(&mut self, line: &str) -> Vec<Outcome> {
        let trimmed = line.trim_end_matches(['\r']);
        match self.state {
            State::Scanning => {
                if trimmed.trim() == OPEN_FENCE {
                    self.start_block();
                }
                Vec::new()
            }
            State::InHeaders => self.feed_header_line(trimmed),
            State::InBody => self.feed_body_line(trimmed),
        }
    }

    /// Call at session end (or session release) to flag a block left open
    /// with no closing fence.
    pub fn flush(&mut self) -> Option<Outcome> {
        if self.state == State::Scanning {
            return None;
        }
        self.reset_to_scanning();
        Some(Outcome::Error(ParseError::new("unterminated fence")))
    }

    fn start_block(&mut self) {
        self.state = State::InHeaders;
        self.headers.clear();
        self.body.clear();
    }

    fn reset_to_scanning(&mut self) {
        self.state = State::Scanning;
        self.headers.clear();
        self.body.clear();
    }

    fn feed_header_line(&mut self, trimmed: &str) -> Vec<Outcome> {
        if trimmed.trim() == OPEN_FENCE {
            // A fence while still in headers abandons the current (never
            // fully-headed) block and starts a fresh one at this line.
            self.reset_to_scanning();
            self.start_block();
            return vec![Outcome::Error(ParseError::new("nested fence in headers"))];
        }

        if trimmed.trim().is_empty() {
            self.state = State::InBody;
            return Vec::new();
        }

        let Some((key, value)) = trimmed.split_once(':') else {
            let err = ParseError::new(format!("malformed header line: {trimmed:?}"));
            self.reset_to_scanning();
            return vec![Outcome::Error(err)];
        };
        let key = key.trim().to_ascii_uppercase();
        let value = value.trim().to_string();

        if self.headers.iter().any(|(k, _)| *k == key) {
            let err = ParseError::new(format!("duplicate header: {key}"));
            self.reset_to_scanning();
            return vec![Outcome::Error(err)];
        }
        self.headers.push((key, value));
        Vec::new()
    }

    fn feed_body_line(&mut self, trimmed: &str) -> Vec<Outcome> {
        if trimmed.trim() == CLOSE_FENCE {
            let outcome = self.emit();
            self.reset_to_scanning();
            return vec![outcome];
        }

        if trimmed.trim() == OPEN_FENCE {
            // Nested fence terminates the outer body (without its own
            // closing fence) and immediately starts the inner block.
            let outer = self.emit();
            self.start_block();
            return vec![outer];
        }

        self.body.push(trimmed.to_string());
        Vec::new()
    }

    fn header(&self, key: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    fn emit(&self) -> Outcome {
        let body = self.body.join("\n");
        let kind_raw = self.header("KIND").map(str::to_ascii_lowercase);

        match kind_raw.as_deref() {
            None | Some("message") => self.emit_message(body),
            Some("spawn") => self.emit_spawn(body),
            Some("release") => self.emit_release(),
            Some("ack") => self.emit_ack(),
            Some("ping") => Outcome::Command(ParsedCommand::Control(ControlKind::Ping)),
            Some("status") => Outcome::Command(ParsedCommand::Control(ControlKind::Status)),
            Some(other) => Outcome::Error(ParseError::new(format!("unknown KIND: {other}"))),
        }
    }

    fn emit_message(&self, body: String) -> Outcome {
        let Some(to_raw) = self.header("TO") else {
            return Outcome::Error(ParseError::new("message missing required header TO"));
        };
        let Some(to) = Target::parse(to_raw) else {
            return Outcome::Error(ParseError::new(format!("malformed TO target: {to_raw:?}")));
        };
        let thread = self.header("THREAD").map(str::to_string);
        let kind = MessageKind::parse(self.header("KIND"));
        let await_timeout = match self.header("AWAIT") {
            None => None,
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => match parse_await_duration(raw) {
                Some(d) => Some(d),
                None => return Outcome::Error(ParseError::new(format!("malformed AWAIT duration: {raw:?}"))),
            },
        };
        Outcome::Command(ParsedCommand::Message { to, thread, kind, body, await_timeout })
    }

    fn emit_ack(&self) -> Outcome {
        let Some(reference) = self.header("REF") else {
            return Outcome::Error(ParseError::new("ack missing required header REF"));
        };
        for (key, _) in &self.headers {
            if !matches!(key.as_str(), "KIND" | "REF" | "THREAD") {
                return Outcome::Error(ParseError::new(format!("unknown header on ack: {key}")));
            }
        }
        Outcome::Command(ParsedCommand::Ack { delivery_id: reference.to_string() })
    }

    fn emit_spawn(&self, body: String) -> Outcome {
        let Some(name) = self.header("NAME") else {
            return Outcome::Error(ParseError::new("spawn missing required header NAME"));
        };
        let Some(cli) = self.header("CLI") else {
            return Outcome::Error(ParseError::new("spawn missing required header CLI"));
        };
        for (key, _) in &self.headers {
            if !matches!(key.as_str(), "KIND" | "NAME" | "CLI" | "CWD" | "THREAD") {
                return Outcome::Error(ParseError::new(format!("unknown header on spawn: {key}")));
            }
        }
        let cwd = self.header("CWD").map(str::to_string);
        Outcome::Command(ParsedCommand::Spawn {
            name: name.to_string(),
            cli: cli.to_string(),
            task: body,
            channels: Vec::new(),
            cwd,
        })
    }

    fn emit_release(&self) -> Outcome {
        let Some(name) = self.header("NAME") else {
            return Outcome::Error(ParseError::new("release missing required header NAME"));
        };
        for (key, _) in &self.headers {
            if !matches!(key.as_str(), "KIND" | "NAME" | "THREAD") {
                return Outcome::Error(ParseError::new(format!("unknown header on release: {key}")));
            }
        }
        let reason = if self.body.is_empty() { None } else { Some(self.body.join("\n")) };
        Outcome::Command(ParsedCommand::Release { name: name.to_string(), reason })
    }
}

/// Parse an `AWAIT` header's duration (§8 Open Questions: `AWAIT` must carry
/// an explicit duration rather than acting as a bare flag). Accepts a bare
/// integer as seconds, or a suffixed form: `500ms`, `30s`, `5m`, `1h`.
fn parse_await_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (digits, unit) = match raw.strip_suffix("ms") {
        Some(d) => (d, "ms"),
        None => match raw.strip_suffix(['s', 'm', 'h']) {
            Some(d) => (d, &raw[d.len()..]),
            None => (raw, "s"),
        },
    };
    let value: u64 = digits.trim().parse().ok()?;
    let millis = match unit {
        "ms" => value,
        "s" => value.checked_mul(1_000)?,
        "m" => value.checked_mul(60_000)?,
        "h" => value.checked_mul(3_600_000)?,
        _ => return None,
    };
    if millis == 0 {
        return None;
    }
    Some(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut Parser, text: &str) -> Vec<Outcome> {
        let mut out = Vec::new();
        for line in text.lines() {
            out.extend(parser.feed_line(line));
        }
        out
    }

    #[test]
    fn parses_simple_message() {
        let mut parser = Parser::new();
        let outcomes = feed_all(
            &mut parser,
            "<<<RELAY\nTO: Bob\n\nhello\nRELAY>>>\n",
        );
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            Outcome::Command(ParsedCommand::Message { to, body, .. }) => {
                assert_eq!(*to, Target::AgentName("Bob".into()));
                assert_eq!(body, "hello");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn empty_body_is_legal() {
        let mut parser = Parser::new();
        let outcomes = feed_all(&mut parser, "<<<RELAY\nTO: Bob\n\nRELAY>>>\n");
        match &outcomes[0] {
            Outcome::Command(ParsedCommand::Message { body, .. }) => assert_eq!(body, ""),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_to_header_is_parse_error() {
        let mut parser = Parser::new();
        let outcomes = feed_all(&mut parser, "<<<RELAY\n\nhello\nRELAY>>>\n");
        assert!(matches!(outcomes[0], Outcome::Error(_)));
    }

    #[test]
    fn spawn_requires_name_and_cli() {
        let mut parser = Parser::new();
        let outcomes = feed_all(
            &mut parser,
            "<<<RELAY\nKIND: spawn\nNAME: Worker1\nCLI: claude\n\nDo task X.\nRELAY>>>\n",
        );
        match &outcomes[0] {
            Outcome::Command(ParsedCommand::Spawn { name, cli, task, .. }) => {
                assert_eq!(name, "Worker1");
                assert_eq!(cli, "claude");
                assert_eq!(task, "Do task X.");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn duplicate_header_recovers_within_one_line() {
        let mut parser = Parser::new();
        let outcomes = feed_all(
            &mut parser,
            "<<<RELAY\nTO: Alice\nTO: Bob\n\nhi\nRELAY>>>\n<<<RELAY\nTO: Carol\n\nhi again\nRELAY>>>\n",
        );
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0], Outcome::Error(_)));
        match &outcomes[1] {
            Outcome::Command(ParsedCommand::Message { to, .. }) => {
                assert_eq!(*to, Target::AgentName("Carol".into()));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn nested_fence_emits_outer_then_starts_inner() {
        let mut parser = Parser::new();
        let outcomes = feed_all(
            &mut parser,
            "<<<RELAY\nTO: Alice\n\nouter body\n<<<RELAY\nTO: Bob\n\ninner body\nRELAY>>>\n",
        );
        assert_eq!(outcomes.len(), 2);
        match &outcomes[0] {
            Outcome::Command(ParsedCommand::Message { to, body, .. }) => {
                assert_eq!(*to, Target::AgentName("Alice".into()));
                assert_eq!(body, "outer body");
            }
            other => panic!("unexpected: {other:?}"),
        }
        match &outcomes[1] {
            Outcome::Command(ParsedCommand::Message { to, body, .. }) => {
                assert_eq!(*to, Target::AgentName("Bob".into()));
                assert_eq!(body, "inner body");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unterminated_fence_flushed_as_error() {
        let mut parser = Parser::new();
        feed_all(&mut parser, "<<<RELAY\nTO: Alice\n\nbody never closes");
        let flushed = parser.flush();
        assert!(matches!(flushed, Some(Outcome::Error(_))));
        assert!(parser.flush().is_none());
    }

    #[test]
    fn unknown_header_on_spawn_is_parse_error() {
        let mut parser = Parser::new();
        let outcomes = feed_all(
            &mut parser,
            "<<<RELAY\nKIND: spawn\nNAME: W\nCLI: claude\nBOGUS: x\n\ntask\nRELAY>>>\n",
        );
        assert!(matches!(outcomes[0], Outcome::Error(_)));
    }

    #[test]
    fn unknown_header_on_message_is_ignored() {
        let mut parser = Parser::new();
        let outcomes = feed_all(
            &mut parser,
            "<<<RELAY\nTO: Bob\nBOGUS: x\n\nhi\nRELAY>>>\n",
        );
        assert!(matches!(outcomes[0], Outcome::Command(_)));
    }

    #[test]
    fn await_header_parses_explicit_duration() {
        let mut parser = Parser::new();
        let outcomes = feed_all(&mut parser, "<<<RELAY\nTO: Bob\nAWAIT: 5s\n\nhi\nRELAY>>>\n");
        match &outcomes[0] {
            Outcome::Command(ParsedCommand::Message { await_timeout, .. }) => {
                assert_eq!(*await_timeout, Some(std::time::Duration::from_secs(5)));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn await_header_bare_number_is_seconds() {
        let mut parser = Parser::new();
        let outcomes = feed_all(&mut parser, "<<<RELAY\nTO: Bob\nAWAIT: 2\n\nhi\nRELAY>>>\n");
        match &outcomes[0] {
            Outcome::Command(ParsedCommand::Message { await_timeout, .. }) => {
                assert_eq!(*await_timeout, Some(std::time::Duration::from_secs(2)));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn await_header_malformed_is_parse_error() {
        let mut parser = Parser::new();
        let outcomes = feed_all(&mut parser, "<<<RELAY\nTO: Bob\nAWAIT: soon\n\nhi\nRELAY>>>\n");
        assert!(matches!(outcomes[0], Outcome::Error(_)));
    }

    #[test]
    fn ack_requires_ref_header() {
        let mut parser = Parser::new();
        let outcomes = feed_all(&mut parser, "<<<RELAY\nKIND: ack\nREF: d-123\n\nRELAY>>>\n");
        match &outcomes[0] {
            Outcome::Command(ParsedCommand::Ack { delivery_id }) => assert_eq!(delivery_id, "d-123"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn ack_missing_ref_is_parse_error() {
        let mut parser = Parser::new();
        let outcomes = feed_all(&mut parser, "<<<RELAY\nKIND: ack\n\nRELAY>>>\n");
        assert!(matches!(outcomes[0], Outcome::Error(_)));
    }

    #[test]
    fn whitespace_only_body_preserved() {
        let mut parser = Parser::new();
        let outcomes = feed_all(&mut parser, "<<<RELAY\nTO: Bob\n\n   \nRELAY>>>\n");
        match &outcomes[0] {
            Outcome::Command(ParsedCommand::Message { body, .. }) => assert_eq!(body, "   "),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
