//! Bounded line log for session output.
//!
//! Holds the last `capacity` completed lines of a session's output plus the
//! bytes received since the last line terminator, so lines split across PTY
//! reads are reassembled before they are logged.

use std::collections::VecDeque;

use regex::Regex;
use sm_core::rpc::{ContextLine, SearchMatch};

/// Line-oriented log with FIFO eviction.
#[derive(Debug)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    /// Bytes after the last `\n`, carried into the next chunk.
    partial: Vec<u8>,
}

impl LogBuffer {
    /// Create an empty buffer holding at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            partial: Vec::new(),
        }
    }

    /// Append a complete line, evicting the oldest one when full.
    pub fn push_line(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    /// Feed raw output bytes; returns the lines this chunk completed.
    ///
    /// A trailing `\r` (from the PTY's `\r\n`) is stripped from each line.
    pub fn push_chunk(&mut self, data: &[u8]) -> Vec<String> {
        let mut completed = Vec::new();

        for &byte in data {
            if byte == b'\n' {
                let raw = std::mem::take(&mut self.partial);
                let line = decode_line(&raw);
                self.push_line(line.clone());
                completed.push(line);
            } else {
                self.partial.push(byte);
            }
        }

        completed
    }

    /// Move any unterminated output into the log as a final line.
    pub fn flush_partial(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.partial);
        let line = decode_line(&raw);
        self.push_line(line.clone());
        Some(line)
    }

    /// The most recent `count` lines in order, or all of them.
    pub fn tail(&self, count: Option<usize>) -> Vec<String> {
        let count = count.unwrap_or(self.lines.len()).min(self.lines.len());
        self.lines
            .iter()
            .skip(self.lines.len() - count)
            .cloned()
            .collect()
    }

    /// Scan the buffer in order for lines matching `pattern`.
    ///
    /// Each match carries up to `context` lines on either side (clamped to the
    /// buffer). Returns the matches and whether the `max_matches` cap cut the
    /// scan short.
    pub fn search(
        &self,
        pattern: &Regex,
        context: usize,
        max_matches: usize,
    ) -> (Vec<SearchMatch>, bool) {
        let mut matches = Vec::new();
        let last = self.lines.len().saturating_sub(1);

        for (index, line) in self.lines.iter().enumerate() {
            if !pattern.is_match(line) {
                continue;
            }
            if matches.len() == max_matches {
                return (matches, true);
            }

            let start = index.saturating_sub(context);
            let end = index.saturating_add(context).min(last);
            let context_lines = (start..=end)
                .map(|i| ContextLine {
                    line_number: i + 1,
                    text: self.lines[i].clone(),
                    is_match: i == index,
                })
                .collect();

            matches.push(SearchMatch {
                line_number: index + 1,
                line: line.clone(),
                context: context_lines,
            });
        }

        (matches, false)
    }

    /// Drop all lines and any partial line.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.partial.clear();
    }

    /// Number of lines currently held.
    pub fn len(&self) -> usize {
        self.lines.len()
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
