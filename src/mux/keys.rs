//! Keystroke-string parsing for `send_keys`.
//!
//! Control characters embedded directly in a multiplexer command line can
//! be mis-parsed by a remote server, so a keystroke string is decomposed
//! into literal-text runs interleaved with named keys, each sent as its
//! own `send-keys` invocation: `"Hello\t\x01World\x1b[A"` becomes
//! `send -l "Hello"`, `send Tab`, `send C-a`, `send -l "World"`, `send Up`.

/// One `send-keys` invocation worth of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyChunk {
    /// Sent with the literal flag
    Literal(String),
    /// A named key the multiplexer interprets (Enter, Tab, C-a, Up, ...)
    Named(String),
}

/// Decompose a keystroke string into literal runs and named keys.
pub fn parse_keystrokes(input: &str) -> Vec<KeyChunk> {
    let mut chunks = Vec::new();
    let mut literal = String::new();
    let mut chars = input.chars().peekable();

    let flush = |literal: &mut String, chunks: &mut Vec<KeyChunk>| {
        if !literal.is_empty() {
            chunks.push(KeyChunk::Literal(std::mem::take(literal)));
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '\t' => {
                flush(&mut literal, &mut chunks);
                chunks.push(KeyChunk::Named("Tab".to_string()));
            }
            '\r' | '\n' => {
                flush(&mut literal, &mut chunks);
                chunks.push(KeyChunk::Named("Enter".to_string()));
            }
            '\u{7f}' => {
                flush(&mut literal, &mut chunks);
                chunks.push(KeyChunk::Named("BSpace".to_string()));
            }
            '\u{1b}' => {
                flush(&mut literal, &mut chunks);
                // Arrow keys arrive as CSI sequences; a bare escape is the
                // Escape key itself
                if chars.peek() == Some(&'[') {
                    let mut ahead = chars.clone();
                    ahead.next();
                    let named = match ahead.peek() {
                        Some('A') => Some("Up"),
                        Some('B') => Some("Down"),
                        Some('C') => Some("Right"),
                        Some('D') => Some("Left"),
                        _ => None,
                    };
                    if let Some(name) = named {
                        chars.next();
                        chars.next();
                        chunks.push(KeyChunk::Named(name.to_string()));
                        continue;
                    }
                }
                chunks.push(KeyChunk::Named("Escape".to_string()));
            }
            c if (c as u32) < 0x20 => {
                flush(&mut literal, &mut chunks);
                // C0 control: Ctrl plus the matching letter
                let letter = char::from_u32(c as u32 + 0x60).unwrap_or('?');
                chunks.push(KeyChunk::Named(format!("C-{letter}")));
            }
            c => literal.push(c),
        }
    }

    flush(&mut literal, &mut chunks);
    chunks
}

/// Quote an argument for a multiplexer command line (local argv is passed
/// verbatim; control mode parses commands like configuration lines).
pub fn quote_arg(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' | '\\' | '$' | '`' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}
