//! Terminal activity tracking: what the student is typing, what the shell
//! printed since the last analysis pass, and whether that output is worth a
//! pass at all.

use tokio::time::{Duration, Instant};

/// Characters whose appearance in output suggests a shell prompt came back.
pub const PROMPT_MARKERS: [char; 3] = ['$', '#', '>'];

/// Lowercase substrings that make a chunk worth analyzing on their own.
pub const TRIGGER_PHRASES: &[&str] = &[
    "error",
    "failed",
    "not found",
    "denied",
    "timeout",
    "refused",
    "invalid",
    "unrecognized",
    "quitting",
    "unreachable",
];

/// Upper bound on buffered output between passes. Older text is dropped
/// first.
const MAX_BUFFERED_BYTES: usize = 64 * 1024;

/// Lowercase phrases that mark an output line as error text.
pub static ERROR_PHRASES: &[&str] = &[
    // general
    "error",
    "failed",
    "permission denied",
    "command not found",
    "no such file",
    "invalid",
    "cannot",
    "unable",
    // tool usage
    "quitting",
    "usage:",
    "unknown option",
    "unrecognized option",
    "bad argument",
    "syntax error",
    "not found",
    "timeout",
    // network
    "refused",
    "unreachable",
    "no route",
    "timed out",
    // auth
    "authentication failed",
    "access denied",
    "unauthorized",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Escape {
    #[default]
    None,
    Start,
    /// Inside `ESC [ ...` until a final byte.
    Csi,
    /// `ESC O x` (application keypad / arrows).
    Ss3,
}

/// Reconstructs the command line being typed from raw terminal input.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    current: String,
    escape: Escape,
    /// Most recent finalized command not yet claimed by an analysis pass.
    unclaimed: Option<String>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `input` in order and returns every command it finalized.
    pub fn feed(&mut self, input: &str) -> Vec<String> {
        let mut finalized = Vec::new();
        for c in input.chars() {
            match self.escape {
                Escape::Start => {
                    self.escape = match c {
                        '[' => Escape::Csi,
                        'O' => Escape::Ss3,
                        _ => Escape::None,
                    };
                    continue;
                }
                Escape::Csi => {
                    if ('\u{40}'..='\u{7e}').contains(&c) {
                        self.escape = Escape::None;
                    }
                    continue;
                }
                Escape::Ss3 => {
                    self.escape = Escape::None;
                    continue;
                }
                Escape::None => {}
            }
            match c {
                '\u{1b}' => self.escape = Escape::Start,
                '\r' | '\n' => {
                    let line = std::mem::take(&mut self.current);
                    let line = line.trim();
                    if !line.is_empty() {
                        self.unclaimed = Some(line.to_string());
                        finalized.push(line.to_string());
                    }
                }
                '\u{7f}' | '\u{8}' => {
                    self.current.pop();
                }
                // Ctrl-C, Ctrl-U
                '\u{3}' | '\u{15}' => self.current.clear(),
                c if c.is_control() => {}
                c => self.current.push(c),
            }
        }
        finalized
    }

    /// The partially typed line.
    #[cfg(test)]
    fn current(&self) -> &str {
        &self.current
    }

    /// Takes the latest finalized command, if one arrived since the last take.
    pub fn take_unclaimed(&mut self) -> Option<String> {
        self.unclaimed.take()
    }
}

/// Output accumulated since the last analysis pass.
#[derive(Debug)]
pub struct OutputBuffer {
    text: String,
    last_update: Instant,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self {
            text: String::new(),
            last_update: Instant::now(),
        }
    }
}

impl OutputBuffer {
    pub fn append(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        self.last_update = Instant::now();
        if self.text.len() > MAX_BUFFERED_BYTES {
            let mut cut = self.text.len() - MAX_BUFFERED_BYTES;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn last_update(&self) -> Instant {
        self.last_update
    }

    pub fn quiet_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_update)
    }

    /// Returns the buffered text and leaves the buffer empty.
    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.text)
    }
}

/// Whether a freshly appended chunk should schedule an analysis pass.
pub fn should_trigger(chunk: &str) -> bool {
    if chunk.contains(PROMPT_MARKERS) {
        return true;
    }
    let lower = chunk.to_lowercase();
    TRIGGER_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

/// Whether a pass over this data should consult the advice pipeline.
pub fn worth_analyzing(command: Option<&str>, output: &str, errors: &str, min_output_len: usize) -> bool {
    command.is_some() || !errors.is_empty() || output.chars().count() > min_output_len
}

/// Every output line matching an error phrase, in output order, joined with
/// newlines.
pub fn extract_errors(output: &str) -> String {
    let clean = strip_ansi(output);
    let mut lines = Vec::new();
    for line in clean.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let lower = line.to_lowercase();
        if ERROR_PHRASES.iter().any(|phrase| lower.contains(phrase)) {
            lines.push(line);
        }
    }
    lines.join("\n")
}

/// Best-effort recovery of a command from output alone: the text after the
/// prompt marker on the last prompt line that has any.
pub fn attribute_command(output: &str) -> Option<String> {
    let clean = strip_ansi(output);
    clean.lines().rev().find_map(|line| {
        let at = line.find(PROMPT_MARKERS)?;
        let rest = line[at + 1..].trim();
        (!rest.is_empty()).then(|| rest.to_string())
    })
}

/// Removes CSI/OSC escape sequences from terminal text.
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('[') => {
                for c in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&c) {
                        break;
                    }
                }
            }
            Some(']') => {
                // OSC ends with BEL or ESC \
                while let Some(c) = chars.next() {
                    if c == '\u{7}' {
                        break;
                    }
                    if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Decodes a byte stream as UTF-8 across chunk boundaries.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        out
    }

    /// Flushes an incomplete trailing sequence.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_chars(buffer: &mut CommandBuffer, chars: &[&str]) -> Vec<String> {
        chars.iter().flat_map(|c| buffer.feed(c)).collect()
    }

    #[test]
    fn typed_characters_become_a_command() {
        let mut buffer = CommandBuffer::new();
        let done = feed_chars(&mut buffer, &["l", "s", " ", "-", "l", "a", "\r"]);
        assert_eq!(done, vec!["ls -la".to_string()]);
        assert_eq!(buffer.current(), "");
    }

    #[test]
    fn erase_removes_the_last_character() {
        let mut buffer = CommandBuffer::new();
        let done = feed_chars(&mut buffer, &["l", "s", "x", "\u{7f}", "\r"]);
        assert_eq!(done, vec!["ls".to_string()]);

        let done = buffer.feed("\u{7f}\u{8}ab\u{8}\n");
        assert_eq!(done, vec!["a".to_string()]);
    }

    #[test]
    fn finalize_never_leaks_into_the_next_line() {
        let mut buffer = CommandBuffer::new();
        assert_eq!(buffer.feed("whoami\rpw"), vec!["whoami".to_string()]);
        assert_eq!(buffer.current(), "pw");
        assert_eq!(buffer.feed("d\r"), vec!["pwd".to_string()]);
        assert_eq!(buffer.take_unclaimed(), Some("pwd".to_string()));
        assert_eq!(buffer.take_unclaimed(), None);
        assert!(buffer.feed("\r  \r").is_empty());
    }

    #[test]
    fn interrupt_and_escape_sequences_are_not_typed() {
        let mut buffer = CommandBuffer::new();
        buffer.feed("rm -rf\u{3}");
        assert_eq!(buffer.current(), "");
        // Up arrow, then home key
        assert_eq!(buffer.feed("ls\u{1b}[A\u{1b}OH -l\r"), vec!["ls -l".to_string()]);
        buffer.feed("junk\u{15}");
        assert_eq!(buffer.current(), "");
    }

    #[test]
    fn quiet_chunks_do_not_trigger() {
        assert!(!should_trigger("compiling module 3 of 9"));
        assert!(!should_trigger(""));
        assert!(should_trigger("ssh: Permission denied (publickey)"));
        assert!(should_trigger("student@lab:~$ "));
        assert!(should_trigger("Unrecognized flag"));
        assert!(should_trigger("QUITTING!"));
    }

    #[test]
    fn analysis_needs_command_error_or_enough_output() {
        assert!(!worth_analyzing(None, "$ ", "", 50));
        assert!(worth_analyzing(Some("ls"), "$ ", "", 50));
        assert!(worth_analyzing(None, "x", "Error: bad", 50));
        assert!(worth_analyzing(None, &"a".repeat(51), "", 50));
    }

    #[test]
    fn error_lines_are_extracted_in_order() {
        assert_eq!(extract_errors("line1\nError: bad\nline3"), "Error: bad");
        let output = "Starting\r\nnmap: unrecognized option '-djf'\r\nSee nmap -h\r\nQUITTING!\r\n$ ";
        assert_eq!(extract_errors(output), "nmap: unrecognized option '-djf'\nQUITTING!");
    }

    #[test]
    fn a_line_matching_several_phrases_appears_once() {
        let output = "ssh: connect to host 10.0.0.5 port 22: Connection refused error\nok";
        assert_eq!(extract_errors(output), "ssh: connect to host 10.0.0.5 port 22: Connection refused error");
        assert_eq!(extract_errors("all good\n"), "");
    }

    #[test]
    fn command_is_recovered_from_the_last_prompt_line() {
        let output = "student@lab:~$ ls -la\r\ntotal 0\r\nstudent@lab:~$ ";
        assert_eq!(attribute_command(output), Some("ls -la".to_string()));
        assert_eq!(attribute_command("no prompt here"), None);
        assert_eq!(attribute_command("\u{1b}[01;32m$\u{1b}[0m whoami\nroot"), Some("whoami".to_string()));
    }

    #[test]
    fn ansi_sequences_are_stripped() {
        assert_eq!(strip_ansi("\u{1b}[1;31mred\u{1b}[0m"), "red");
        assert_eq!(strip_ansi("\u{1b}]0;title\u{7}text"), "text");
    }

    #[test]
    fn output_buffer_clears_on_take() {
        let mut buffer = OutputBuffer::default();
        buffer.append("hello ");
        buffer.append("world");
        assert_eq!(buffer.as_str(), "hello world");
        assert_eq!(buffer.take(), "hello world");
        assert_eq!(buffer.as_str(), "");
    }

    #[test]
    fn output_buffer_keeps_the_newest_text() {
        let mut buffer = OutputBuffer::default();
        buffer.append(&"é".repeat(MAX_BUFFERED_BYTES));
        buffer.append("tail");
        assert!(buffer.as_str().len() <= MAX_BUFFERED_BYTES);
        assert!(buffer.as_str().ends_with("tail"));
    }

    #[test]
    fn utf8_split_across_chunks_is_reassembled() {
        let bytes = "héllo ✓".as_bytes();
        let mut stream = Utf8Stream::default();
        let mut out = String::new();
        for byte in bytes {
            out.push_str(&stream.decode(std::slice::from_ref(byte)));
        }
        assert_eq!(out, "héllo ✓");
        assert_eq!(stream.decode(&[0xff, b'a']), "\u{fffd}a");
        assert_eq!(stream.decode(&[0xe2, 0x9c]), "");
        assert_eq!(stream.finish(), "\u{fffd}");
    }
}
