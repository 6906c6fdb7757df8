use std::sync::LazyLock;

use regex::Regex;

const MAX_LOG_CHARS: usize = 2048;

// CSI, OSC (BEL or ST terminated), and string-terminated DCS/PM/APC/SOS.
static ESCAPES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b(?:\[[0-?]*[ -/]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)|[PX^_][^\x1b]*\x1b\\|.)")
        .expect("escape regex")
});

/// Make a line from an external tool or the API safe to print and log.
pub fn sanitize_log_line(input: &str) -> String {
    let stripped = ESCAPES.replace_all(input, "");
    let mut out = String::with_capacity(stripped.len().min(MAX_LOG_CHARS));
    let mut count = 0usize;
    for c in stripped.chars() {
        if count >= MAX_LOG_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
        match c {
            '\t' => out.push(' '),
            '\r' | '\n' => continue,
            c if c.is_control() || is_bidi_control(c) => continue,
            c => out.push(c),
        }
        count += 1;
    }
    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}')
}
