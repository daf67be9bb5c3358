//! Incremental parser for the multiplexer's control-mode text protocol.
//!
//! Control mode frames command replies between `%begin` and `%end` (or
//! `%error`) lines, and interleaves asynchronous events such as
//! `%output %<pane-id> <data>` where the data escapes non-printable bytes
//! as backslash-octal. Replies carry no usable correlation IDs beyond
//! arrival order, which is why the adapter matches them FIFO.

/// One parsed protocol event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// First `%`-prefixed line observed; the protocol is live
    Active,
    /// A complete command reply
    Response { lines: Vec<String>, success: bool },
    /// Async pane output, octal escapes decoded
    Output { pane_id: String, bytes: Vec<u8> },
    /// The server is shutting the connection down
    Exit,
    /// Any other `%` notification, verbatim
    Notification(String),
}

#[derive(Default)]
pub struct ControlParser {
    buf: Vec<u8>,
    active: bool,
    reply: Option<Vec<String>>,
}

impl ControlParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every event completed by it.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ControlEvent> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            self.process_line(&line, &mut events);
        }

        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<ControlEvent>) {
        if !self.active {
            // Everything before the first protocol line is connection
            // noise (MOTD, provisioning output); the adapter's raw tee
            // already delivered it
            if !line.starts_with('%') {
                return;
            }
            self.active = true;
            events.push(ControlEvent::Active);
        }

        if let Some(body) = self.reply.as_mut() {
            if line.starts_with("%end") {
                let lines = self.reply.take().unwrap_or_default();
                events.push(ControlEvent::Response {
                    lines,
                    success: true,
                });
                return;
            }
            if line.starts_with("%error") {
                let lines = self.reply.take().unwrap_or_default();
                events.push(ControlEvent::Response {
                    lines,
                    success: false,
                });
                return;
            }
            if !line.starts_with('%') {
                body.push(line.to_string());
                return;
            }
            // Async events may interleave inside a reply block; fall
            // through so they are handled normally
        }

        if line.starts_with("%begin") {
            self.reply = Some(Vec::new());
        } else if let Some(rest) = line.strip_prefix("%output ") {
            if let Some((pane_id, data)) = rest.split_once(' ') {
                events.push(ControlEvent::Output {
                    pane_id: pane_id.to_string(),
                    bytes: decode_octal_escapes(data),
                });
            } else {
                events.push(ControlEvent::Output {
                    pane_id: rest.to_string(),
                    bytes: Vec::new(),
                });
            }
        } else if line.starts_with("%exit") {
            events.push(ControlEvent::Exit);
        } else if line.starts_with('%') {
            events.push(ControlEvent::Notification(line.to_string()));
        }
        // Bare lines outside a reply block carry nothing we track
    }
}

/// Decode control mode's `\ooo` octal escapes (and `\\`).
fn decode_octal_escapes(data: &str) -> Vec<u8> {
    let raw = data.as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;

    while i < raw.len() {
        if raw[i] == b'\\' && i + 1 < raw.len() {
            if raw[i + 1] == b'\\' {
                out.push(b'\\');
                i += 2;
                continue;
            }
            if i + 3 < raw.len()
                && raw[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b))
            {
                let value = (raw[i + 1] - b'0') as u32 * 64
                    + (raw[i + 2] - b'0') as u32 * 8
                    + (raw[i + 3] - b'0') as u32;
                out.push(value as u8);
                i += 4;
                continue;
            }
        }
        out.push(raw[i]);
        i += 1;
    }

    out
}
