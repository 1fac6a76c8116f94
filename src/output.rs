//! Output buffering for slot processes.
//!
//! `LogBuffer` is the append-only record of everything a slot's process printed,
//! kept so the whole run can be copied to the clipboard. `SharedLog` is the
//! handle a runner shares with its stream reader tasks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use strip_ansi_escapes::strip;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// A single line of output from a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// The content of the line, without its terminator.
    pub text: String,
    /// The stream it originated from (stdout/stderr).
    pub stream: StreamKind,
}

/// A line buffer capped at `max_lines`, oldest lines dropped first.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<LogLine>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        let max_lines = max_lines.max(1);
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line to the buffer.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, line: LogLine) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Returns the number of lines currently in the buffer.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Returns an iterator over the lines in the buffer.
    pub fn iter(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter()
    }

    /// Joins every buffered line, each terminated by a newline, with ANSI codes removed.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(&sanitize_text(&line.text, true));
            out.push('\n');
        }
        out
    }
}

/// A `LogBuffer` shared between a runner and its stream readers.
#[derive(Debug, Clone)]
pub struct SharedLog(Arc<Mutex<LogBuffer>>);

impl SharedLog {
    pub fn new(max_lines: usize) -> Self {
        Self(Arc::new(Mutex::new(LogBuffer::new(max_lines))))
    }

    pub fn push(&self, text: &str, stream: StreamKind) {
        self.lock().push(LogLine {
            text: text.to_string(),
            stream,
        });
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn text(&self) -> String {
        self.lock().text()
    }

    // A reader task panicking mid-push leaves the buffer consistent, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, LogBuffer> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
///
/// Trailing carriage returns (CRLF output from Windows tools) are always removed.
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    let text = text.trim_end_matches('\r');
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}
