//! Decoding and parsing of tunneling-tool output

use regex::Regex;
use std::borrow::Cow;
use std::sync::OnceLock;

/// Marker that identifies a forwarding announcement
pub const FORWARDING_MARKER: &str = "Forwarding";

/// A decoded output line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLine {
    pub text: String,
    /// The raw bytes were not valid UTF-8 and were decoded with substitutions
    pub lossy: bool,
}

/// Decode one raw output line
///
/// Strips the trailing `\r\n` or `\n`. Invalid UTF-8 never fails the read:
/// offending sequences become U+FFFD.
pub fn decode_line(raw: &[u8]) -> DecodedLine {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);

    match String::from_utf8_lossy(raw) {
        Cow::Borrowed(text) => DecodedLine {
            text: text.to_string(),
            lossy: false,
        },
        Cow::Owned(text) => DecodedLine { text, lossy: true },
    }
}

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // scheme://host[:port][/path]
        Regex::new(r#"[A-Za-z][A-Za-z0-9+.\-]*://[^\s/:"'<>]+(?::\d+)?(?:/[^\s"'<>]*)?"#)
            .unwrap_or_else(|e| panic!("invalid forwarding URL pattern: {}", e))
    })
}

/// Extract the public address from a forwarding announcement
///
/// # Returns
/// * `Some(url)` - the first URL on a line that carries the marker
/// * `None` - not an announcement
pub fn parse_forwarding(line: &str) -> Option<String> {
    if !line.contains(FORWARDING_MARKER) {
        return None;
    }

    let marker_end = line.find(FORWARDING_MARKER)? + FORWARDING_MARKER.len();
    url_pattern()
        .find(&line[marker_end..])
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';']).to_string())
}
