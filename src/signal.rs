//! Agent state-signal extraction from raw terminal byte streams.
//!
//! Two marker families are recognized:
//! - OSC-777 notifications: `ESC ] 777 ; notify ; <state> ; <message>`
//!   terminated by BEL or `ESC \`.
//! - Bracket markers on their own line: `--<[schmux:<state>:<message>]>--`,
//!   optionally preceded by a bullet glyph, whitespace, or ANSI sequences,
//!   trailed by horizontal whitespace only.
//!
//! The parser operates on whole chunks; callers tailing a live stream
//! should buffer to line/terminator boundaries before feeding it.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of agent states the parser will emit.
/// Anything else on the wire is passed through unmodified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalState {
    NeedsInput,
    NeedsTesting,
    Completed,
    Error,
    Working,
}

impl SignalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalState::NeedsInput => "needs_input",
            SignalState::NeedsTesting => "needs_testing",
            SignalState::Completed => "completed",
            SignalState::Error => "error",
            SignalState::Working => "working",
        }
    }
}

impl fmt::Display for SignalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "needs_input" => Ok(SignalState::NeedsInput),
            "needs_testing" => Ok(SignalState::NeedsTesting),
            "completed" => Ok(SignalState::Completed),
            "error" => Ok(SignalState::Error),
            "working" => Ok(SignalState::Working),
            _ => Err(()),
        }
    }
}

/// A recognized state marker lifted out of the terminal stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub state: SignalState,
    pub message: String,
    pub detected_at: DateTime<Utc>,
}

impl Signal {
    fn new(state: SignalState, message: String) -> Self {
        Self {
            state,
            message,
            detected_at: Utc::now(),
        }
    }
}

static BRACKET_MARKER: Lazy<Regex> = Lazy::new(|| {
    // (?s) so a cursor-down sequence cleaned into a newline still matches
    Regex::new(r"(?s)\A--<\[schmux:([a-z_]+):(.*?)\]>--[ \t]*\z").unwrap()
});

const BEL: u8 = 0x07;
const ESC: u8 = 0x1b;

/// Scan a chunk for recognized signals without modifying it.
pub fn parse(bytes: &[u8]) -> Vec<Signal> {
    extract_and_strip(bytes).0
}

/// Scan a chunk, returning recognized signals and the chunk with those
/// markers removed. Unrecognized OSC-777 notifications are left in place
/// so other consumers may observe them.
pub fn extract_and_strip(bytes: &[u8]) -> (Vec<Signal>, Vec<u8>) {
    let mut signals = Vec::new();
    let without_osc = strip_osc_notifications(bytes, &mut signals);
    let stripped = strip_marker_lines(&without_osc, &mut signals);
    (signals, stripped)
}

/// First pass: lift valid OSC-777 notifications out of the stream.
fn strip_osc_notifications(bytes: &[u8], signals: &mut Vec<Signal>) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == ESC && bytes.get(i + 1) == Some(&b']') {
            if let Some((payload_end, seq_end)) = find_osc_terminator(bytes, i + 2) {
                let payload = &bytes[i + 2..payload_end];
                if let Some(signal) = parse_osc_payload(payload) {
                    signals.push(signal);
                    i = seq_end;
                    continue;
                }
                // Unrecognized notification: keep the whole sequence
                out.extend_from_slice(&bytes[i..seq_end]);
                i = seq_end;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    out
}

/// Locate the end of an OSC payload starting at `from`.
/// Returns (payload end, one past the terminator).
fn find_osc_terminator(bytes: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut j = from;
    while j < bytes.len() {
        match bytes[j] {
            BEL => return Some((j, j + 1)),
            ESC if bytes.get(j + 1) == Some(&b'\\') => return Some((j, j + 2)),
            _ => j += 1,
        }
    }
    None
}

fn parse_osc_payload(payload: &[u8]) -> Option<Signal> {
    let text = String::from_utf8_lossy(payload);
    let rest = text.strip_prefix("777;notify;")?;
    let (state_str, message) = match rest.split_once(';') {
        Some((s, m)) => (s, m),
        None => (rest, ""),
    };
    let state = state_str.parse().ok()?;
    Some(Signal::new(state, message.to_string()))
}

/// Second pass: recognize bracket markers that stand alone on a line.
fn strip_marker_lines(bytes: &[u8], signals: &mut Vec<Signal>) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut start = 0;

    while start <= bytes.len() {
        let nl = bytes[start..].iter().position(|&b| b == b'\n');
        let (line_end, term_len) = match nl {
            Some(pos) => (start + pos, 1),
            None => (bytes.len(), 0),
        };
        let mut line = &bytes[start..line_end];
        // A trailing CR belongs to the terminator, not the line
        let had_cr = line.last() == Some(&b'\r');
        if had_cr {
            line = &line[..line.len() - 1];
        }

        match std::str::from_utf8(line).ok().and_then(match_marker_line) {
            Some(signal) => {
                signals.push(signal);
                // Drop the marker line; keep the terminator
                if term_len > 0 {
                    out.push(b'\n');
                }
            }
            None => {
                out.extend_from_slice(&bytes[start..line_end + term_len]);
            }
        }

        if term_len == 0 {
            break;
        }
        start = line_end + term_len;
    }

    out
}

/// Match one line against the bracket-marker grammar.
/// Inline markers (any non-prefix text before the marker) are rejected.
fn match_marker_line(line: &str) -> Option<Signal> {
    let cleaned = clean_ansi(line);
    let rest = cleaned.trim_start_matches(['⏺', '•', ' ', '\t']);
    let caps = BRACKET_MARKER.captures(rest)?;
    let state = caps.get(1)?.as_str().parse().ok()?;
    let message = caps.get(2)?.as_str().to_string();
    Some(Signal::new(state, message))
}

/// Strip ANSI escape sequences for matching purposes: cursor-forward
/// becomes a space, cursor-down a newline, everything else vanishes.
fn clean_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                // CSI: parameter/intermediate bytes then a final byte in @..~
                let mut terminator = None;
                for t in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&t) {
                        terminator = Some(t);
                        break;
                    }
                }
                match terminator {
                    Some('C') => out.push(' '),
                    Some('B') => out.push('\n'),
                    _ => {}
                }
            }
            Some(']') => {
                chars.next();
                // OSC: consume through BEL or ESC \
                while let Some(t) = chars.next() {
                    if t == '\u{07}' {
                        break;
                    }
                    if t == '\u{1b}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            Some(_) => {
                // Two-character escape (charset selection etc.)
                chars.next();
            }
            None => {}
        }
    }

    out
}
