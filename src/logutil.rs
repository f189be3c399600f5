//! Logging helpers that keep device- and caller-supplied text on a single log line.
//!
//! Method names, device error texts and RPC arguments come from outside the
//! process; they are escaped and capped before they reach a log record.

use serde_json::Value;
use std::fmt::Write;

/// Longest preview written to a log line before it is cut with an ellipsis.
const MAX_PREVIEW: usize = 300;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
/// - other control characters => `\xNN`
///
/// Output is capped at [`MAX_PREVIEW`] characters.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Compact JSON rendering of `v` for logs, capped like [`escape_log`].
pub fn preview_json(v: &Value) -> String {
    escape_log(&v.to_string())
}
