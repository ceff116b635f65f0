// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stream Normalizer (C3, §4.2).
//!
//! Incremental state machine turning a raw PTY byte stream into a sequence
//! of logical lines for the protocol parser. Operates on bytes (not `char`)
//! because PTY reads can split a multi-byte UTF-8 sequence across chunks;
//! only a completed line is lossily decoded to `String`.

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    Esc,
    Csi,
    Osc,
    OscEsc,
    Charset,
    Ss3,
}

/// Converts raw PTY bytes into logical lines, stripping CSI/OSC/SS3
/// sequences and honoring `\r` as a current-line overwrite rather than a
/// line terminator (§4.2.2).
#[derive(Debug)]
pub struct Normalizer {
    state: State,
    current: Vec<u8>,
    pending_cr: bool,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    pub fn new() -> Self {
        Self { state: State::Normal, current: Vec::new(), pending_cr: false }
    }

    /// Reset all parsing state, discarding any partial line. Used after an
    /// injection write to avoid the injected bytes confusing in-flight
    /// parsing (§4.2.4).
    pub fn reset(&mut self) {
        self.state = State::Normal;
        self.current.clear();
        self.pending_cr = false;
    }

    /// Feed a chunk of raw bytes, returning every logical line completed by
    /// this chunk. Any trailing partial line is retained for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            self.step(b, &mut lines);
        }
        lines
    }

    fn step(&mut self, b: u8, lines: &mut Vec<String>) {
        match self.state {
            State::Normal => match b {
                ESC => {
                    self.resolve_pending_cr();
                    self.state = State::Esc;
                }
                b'\n' => {
                    self.pending_cr = false;
                    self.emit_line(lines);
                }
                b'\r' => {
                    self.resolve_pending_cr();
                    self.pending_cr = true;
                }
                _ => {
                    self.resolve_pending_cr();
                    self.current.push(b);
                }
            },
            State::Esc => match b {
                b'[' => self.state = State::Csi,
                b']' => self.state = State::Osc,
                b'(' | b')' => self.state = State::Charset,
                b'O' => self.state = State::Ss3,
                _ => self.state = State::Normal,
            },
            State::Csi => {
                if (0x40..=0x7e).contains(&b) {
                    self.state = State::Normal;
                }
            }
            State::Osc => match b {
                BEL => self.state = State::Normal,
                ESC => self.state = State::OscEsc,
                _ => {}
            },
            State::OscEsc => {
                // ST is ESC \; any other byte after ESC inside an OSC just
                // reopens escape scanning rather than terminating.
                self.state = if b == b'\\' { State::Normal } else { State::Osc };
            }
            State::Charset => {
                self.state = State::Normal;
            }
            State::Ss3 => {
                self.state = State::Normal;
            }
        }
    }

    fn emit_line(&mut self, lines: &mut Vec<String>) {
        let line = String::from_utf8_lossy(&self.current).into_owned();
        lines.push(line);
        self.current.clear();
    }

    /// Apply a lone `\r`'s overwrite once we know it wasn't the start of a
    /// CRLF pair (the next byte wasn't `\n`).
    fn resolve_pending_cr(&mut self) {
        if self.pending_cr {
            self.current.clear();
            self.pending_cr = false;
        }
    }
}
