//! Scan buffer for prompt detection.
//!
//! Output is accumulated as it arrives. Prompt rules only look at the
//! region after the consumed mark, so text that already triggered an
//! answer can never trigger it twice. Scans are also limited to a
//! trailing window, since prompts sit at the end of the output.

use regex::bytes::{Match, Regex};

/// Removes terminal escape sequences from a byte stream.
///
/// Parser state carries over between calls, so a sequence split across
/// two reads is still removed as a whole.
pub struct AnsiStripper {
    parser: vte::Parser,
}

impl AnsiStripper {
    pub fn new() -> Self {
        Self {
            parser: vte::Parser::new(),
        }
    }

    /// Feed `chunk`, appending its printable text to `out`.
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        self.parser.advance(&mut Printable(out), chunk);
    }

    /// Feed `chunk` and return its printable text.
    pub fn strip(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(chunk.len());
        self.push(chunk, &mut out);
        out
    }
}

impl Default for AnsiStripper {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AnsiStripper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnsiStripper").finish_non_exhaustive()
    }
}

/// Keeps printed text and line structure, drops everything else.
struct Printable<'a>(&'a mut Vec<u8>);

impl vte::Perform for Printable<'_> {
    fn print(&mut self, c: char) {
        let mut utf8 = [0u8; 4];
        self.0.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
    }

    fn execute(&mut self, byte: u8) {
        if matches!(byte, b'\n' | b'\r' | b'\t') {
            self.0.push(byte);
        }
    }
}

/// Decode captured output as text with `\n` line endings.
pub fn normalize_output(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .replace("\r\n", "\n")
        .replace('\r', "")
}

/// Accumulated device output with a consumed mark.
#[derive(Debug)]
pub struct PatternBuffer {
    data: Vec<u8>,
    mark: usize,
    window: usize,
    stripper: AnsiStripper,
}

impl PatternBuffer {
    /// A buffer that scans at most the last `window` bytes.
    pub fn new(window: usize) -> Self {
        Self {
            data: Vec::with_capacity(4096),
            mark: 0,
            window,
            stripper: AnsiStripper::new(),
        }
    }

    /// Append a chunk, minus its escape sequences, and return the text
    /// it contributed.
    pub fn extend(&mut self, chunk: &[u8]) -> &[u8] {
        let from = self.data.len();
        self.stripper.push(chunk, &mut self.data);
        &self.data[from..]
    }

    fn scan_from(&self) -> usize {
        self.mark.max(self.data.len().saturating_sub(self.window))
    }

    /// The region prompt scans run against.
    pub fn unconsumed(&self) -> &[u8] {
        &self.data[self.scan_from()..]
    }

    /// First non-empty match in [`unconsumed`](Self::unconsumed); offsets
    /// are relative to that region.
    pub fn search_unconsumed(&self, pattern: &Regex) -> Option<Match<'_>> {
        pattern
            .find_iter(self.unconsumed())
            .find(|m| !m.is_empty())
    }

    /// Move the mark to `offset` within the unconsumed region.
    pub fn consume(&mut self, offset: usize) {
        self.mark = (self.scan_from() + offset).min(self.data.len());
    }

    /// Move the mark to the end of the output.
    pub fn consume_all(&mut self) {
        self.mark = self.data.len();
    }

    pub fn has_unconsumed(&self) -> bool {
        self.mark < self.data.len()
    }

    /// Last non-blank line, trimmed. Used in log messages.
    pub fn last_line(&self) -> String {
        let text = self.data.trim_ascii_end();
        let start = memchr::memrchr(b'\n', text).map_or(0, |i| i + 1);
        String::from_utf8_lossy(text[start..].trim_ascii()).into_owned()
    }
}

impl Default for PatternBuffer {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escapes_are_stripped_on_extend() {
        let mut buffer = PatternBuffer::new(100);
        buffer.extend(b"\x1b[1;32mcore-1#\x1b[0m \x1b]0;title\x07");
        assert_eq!(buffer.unconsumed(), b"core-1# ");
    }

    #[test]
    fn test_escape_split_across_reads() {
        let mut buffer = PatternBuffer::new(100);
        assert_eq!(buffer.extend(b"\r\n12:00 UTC\r\nr1#\x1b["), b"\r\n12:00 UTC\r\nr1#");
        assert_eq!(buffer.extend(b"0m "), b" ");

        let prompt = Regex::new(r"[>#$]\s*$").unwrap();
        assert!(buffer.search_unconsumed(&prompt).is_some());
        assert_eq!(buffer.unconsumed(), b"\r\n12:00 UTC\r\nr1# ");
    }

    #[test]
    fn test_stripper_keeps_state_between_chunks() {
        let mut stripper = AnsiStripper::new();
        let mut out = stripper.strip(b"edge\x1b]0;ti");
        out.extend(stripper.strip(b"tle\x07-1"));
        out.extend(stripper.strip(b"# \x1b"));
        out.extend(stripper.strip(b"[K"));
        assert_eq!(out, b"edge-1# ");
        assert_eq!(AnsiStripper::new().strip(b"\x1b[2K\rok\x07\n"), b"\rok\n");
    }

    #[test]
    fn test_answered_prompt_does_not_match_twice() {
        let mut buffer = PatternBuffer::new(1000);
        buffer.extend(b"Proceed with reload? [confirm]");

        let confirm = Regex::new(r"\[confirm\]").unwrap();
        let end = buffer.search_unconsumed(&confirm).unwrap().end();
        buffer.consume(end);
        assert!(buffer.search_unconsumed(&confirm).is_none());
        assert!(!buffer.has_unconsumed());

        buffer.extend(b"\nSave configuration? [confirm]");
        assert!(buffer.has_unconsumed());
        assert!(buffer.search_unconsumed(&confirm).is_some());
    }

    #[test]
    fn test_prompt_outside_window_is_ignored() {
        let mut buffer = PatternBuffer::new(16);
        buffer.extend(b"edge-2#");
        buffer.extend(&[b'.'; 64]);

        assert_eq!(buffer.unconsumed().len(), 16);
        let prompt = Regex::new(r"edge-2#").unwrap();
        assert!(buffer.search_unconsumed(&prompt).is_none());
    }

    #[test]
    fn test_consume_is_relative_to_window() {
        let mut buffer = PatternBuffer::new(8);
        buffer.extend(b"0123456789abcdef");
        assert_eq!(buffer.unconsumed(), b"89abcdef");

        buffer.consume(4);
        assert_eq!(buffer.unconsumed(), b"cdef");
    }

    #[test]
    fn test_empty_matches_are_skipped() {
        let mut buffer = PatternBuffer::new(100);
        let anything = Regex::new(r"x*").unwrap();
        assert!(buffer.search_unconsumed(&anything).is_none());

        buffer.extend(b"abxxx");
        assert_eq!(buffer.search_unconsumed(&anything).unwrap().as_bytes(), b"xxx");
    }

    #[test]
    fn test_last_line_skips_trailing_blanks() {
        let mut buffer = PatternBuffer::default();
        buffer.extend(b"Building configuration...\r\n  spine-3#  \r\n\r\n");
        assert_eq!(buffer.last_line(), "spine-3#");

        buffer.consume_all();
        assert!(!buffer.has_unconsumed());
        assert_eq!(buffer.last_line(), "spine-3#");
    }

    #[test]
    fn test_normalize_output() {
        assert_eq!(normalize_output(b"show ver\r\nIOS XE\rok\n"), "show ver\nIOS XEok\n");
    }
}
