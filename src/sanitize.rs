//! Make captured bytes safe to print on a terminal.

/// Decode `bytes` as UTF-8 (lossily) and neutralize control characters.
pub fn sanitize_payload(bytes: &[u8]) -> String {
    sanitize_text(&String::from_utf8_lossy(bytes))
}

/// Replace C0/C1 control characters and DEL with U+FFFD, keeping tab,
/// newline and carriage return. Strings pulled out of payloads (SSIDs,
/// config values) go through here before reaching the terminal.
pub fn sanitize_text(s: &str) -> String {
    s.chars()
        .map(|c| if is_unsafe(c) { '\u{FFFD}' } else { c })
        .collect()
}

fn is_unsafe(c: char) -> bool {
    match c {
        '\t' | '\n' | '\r' => false,
        // CSI (U+009B) and friends act as escape sequences on some terminals.
        '\u{0080}'..='\u{009F}' => true,
        _ => c.is_ascii_control(),
    }
}
