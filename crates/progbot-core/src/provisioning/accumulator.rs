//! Bounded line buffer with noise filtering and pattern search.
//!
//! Device firmware interleaves debug output and shell prompts with the
//! replies a script waits for. The accumulator keeps every received line in a
//! raw buffer and the lines that survive prompt stripping and ignore patterns
//! in a filtered buffer. Searches run over the filtered view.

use std::collections::{BTreeMap, VecDeque};

use regex::Regex;
use tracing::{debug, error, warn};

/// Cap on buffered text, counting one separator per line.
pub const MAX_BUFFER_SIZE: usize = 32 * 1024;

/// Lines longer than this many characters are truncated.
pub const MAX_LINE_SIZE: usize = 4 * 1024;

/// Outcome of a pattern search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchMatch {
    /// Text of the whole match.
    pub matched_text: String,
    /// Named capture groups that participated in the match.
    pub captures: BTreeMap<String, String>,
}

/// Accumulates device output for one step attempt.
#[derive(Debug)]
pub struct ResponseAccumulator {
    raw: VecDeque<(u64, String)>,
    filtered: VecDeque<(u64, String)>,
    buffer_size: usize,
    next_seq: u64,
    ignore_patterns: Vec<Regex>,
    strip_prompt: Option<String>,
}

impl ResponseAccumulator {
    /// Create an accumulator. Ignore patterns that fail to compile are
    /// logged and left out.
    pub fn new(ignore_patterns: &[String], strip_prompt: Option<&str>) -> Self {
        let ignore_patterns = ignore_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "invalid ignore pattern");
                    None
                }
            })
            .collect();

        Self {
            raw: VecDeque::new(),
            filtered: VecDeque::new(),
            buffer_size: 0,
            next_seq: 0,
            ignore_patterns,
            strip_prompt: strip_prompt.filter(|p| !p.is_empty()).map(str::to_string),
        }
    }

    /// Append one received line (without its terminator).
    pub fn add_line(&mut self, line: &str) {
        let char_count = line.chars().count();
        let line = if char_count > MAX_LINE_SIZE {
            warn!(
                from = char_count,
                to = MAX_LINE_SIZE,
                "line truncated"
            );
            line.chars().take(MAX_LINE_SIZE).collect::<String>()
        } else {
            line.to_string()
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.buffer_size += line.chars().count() + 1;
        self.raw.push_back((seq, line.clone()));

        while self.buffer_size > MAX_BUFFER_SIZE && self.raw.len() > 1 {
            let Some((dropped_seq, dropped)) = self.raw.pop_front() else {
                break;
            };
            self.buffer_size -= dropped.chars().count() + 1;
            if self.filtered.front().map(|(s, _)| *s) == Some(dropped_seq) {
                self.filtered.pop_front();
            }
            debug!("dropped oldest line, buffer full");
        }

        let stripped = match &self.strip_prompt {
            Some(prompt) => line.strip_prefix(prompt.as_str()).unwrap_or(&line),
            None => &line,
        };

        if self.ignore_patterns.iter().any(|re| re.is_match(stripped)) {
            debug!(line = %stripped, "filtered out line");
            return;
        }

        let stripped = stripped.to_string();
        self.filtered.push_back((seq, stripped));
    }

    /// Search for `pattern`, line by line first, then across the joined
    /// filtered text. An invalid pattern is logged and never matches.
    pub fn search(&self, pattern: &str) -> Option<SearchMatch> {
        let re = match Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => {
                error!(pattern, error = %e, "invalid search pattern");
                return None;
            }
        };

        for (_, line) in &self.filtered {
            if let Some(found) = match_with_captures(&re, line) {
                debug!(line = %line, "pattern matched in line");
                return Some(found);
            }
        }

        let full_text = self.full_text();
        let found = match_with_captures(&re, &full_text);
        if found.is_some() {
            debug!("pattern matched in full text");
        }
        found
    }

    /// Try `patterns` in order. The first match wins; its index is returned
    /// alongside. `None` when nothing matched.
    pub fn search_any(&self, patterns: &[String]) -> Option<(usize, SearchMatch)> {
        patterns
            .iter()
            .enumerate()
            .find_map(|(i, p)| self.search(p).map(|m| (i, m)))
    }

    /// Filtered lines joined with `\n`.
    pub fn full_text(&self) -> String {
        join(&self.filtered)
    }

    /// Raw lines joined with `\n`.
    pub fn raw_text(&self) -> String {
        join(&self.raw)
    }

    pub fn clear(&mut self) {
        self.raw.clear();
        self.filtered.clear();
        self.buffer_size = 0;
    }

    /// Number of raw lines held.
    pub fn line_count(&self) -> usize {
        self.raw.len()
    }

    /// Number of filtered lines held.
    pub fn filtered_line_count(&self) -> usize {
        self.filtered.len()
    }

    /// Buffered size in characters, counting one separator per line.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

fn join(lines: &VecDeque<(u64, String)>) -> String {
    lines
        .iter()
        .map(|(_, l)| l.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

fn match_with_captures(re: &Regex, text: &str) -> Option<SearchMatch> {
    let caps = re.captures(text)?;
    let matched_text = caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default();
    let captures = re
        .capture_names()
        .flatten()
        .filter_map(|name| {
            caps.name(name)
                .map(|m| (name.to_string(), m.as_str().to_string()))
        })
        .collect();
    Some(SearchMatch {
        matched_text,
        captures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> ResponseAccumulator {
        ResponseAccumulator::new(&[], None)
    }

    #[test]
    fn test_buffer_never_exceeds_cap() {
        let mut acc = plain();
        let line = "x".repeat(1000);
        for _ in 0..100 {
            acc.add_line(&line);
            assert!(acc.buffer_size() <= MAX_BUFFER_SIZE);
        }
        assert_eq!(acc.line_count(), MAX_BUFFER_SIZE / 1001);
    }

    #[test]
    fn test_filtered_lines_follow_raw_drops() {
        let mut acc = ResponseAccumulator::new(&["^\\[DBG\\]".to_string()], None);
        for i in 0..200 {
            if i % 2 == 0 {
                acc.add_line(&format!("[DBG] {}", "d".repeat(300)));
            } else {
                acc.add_line(&format!("line-{i:03} {}", "v".repeat(300)));
            }
        }

        let raw = acc.raw_text();
        for line in acc.full_text().lines() {
            assert!(raw.contains(line), "filtered line {line} no longer in raw");
        }
        assert!(acc.filtered_line_count() <= acc.line_count());
    }

    #[test]
    fn test_long_line_truncated_to_exact_size() {
        let mut acc = plain();
        acc.add_line(&"a".repeat(MAX_LINE_SIZE + 500));
        assert_eq!(acc.raw_text().chars().count(), MAX_LINE_SIZE);
        assert_eq!(acc.buffer_size(), MAX_LINE_SIZE + 1);
    }

    #[test]
    fn test_prompt_stripped_and_noise_ignored() {
        let mut acc = ResponseAccumulator::new(&["^\\[DEBUG\\]".to_string()], Some("> "));
        acc.add_line("> version 1.2.3");
        acc.add_line("[DEBUG] heap ok");

        assert_eq!(acc.line_count(), 2);
        assert_eq!(acc.filtered_line_count(), 1);
        assert_eq!(acc.full_text(), "version 1.2.3");
    }

    #[test]
    fn test_search_single_line_captures() {
        let mut acc = plain();
        acc.add_line("boot");
        acc.add_line("MAC=AA:BB:CC BT=ready");

        let found = acc
            .search(r"MAC=(?P<mac>[0-9A-F:]+).*BT=(?P<bt>\w+)")
            .expect("should match");
        assert_eq!(found.captures["mac"], "AA:BB:CC");
        assert_eq!(found.captures["bt"], "ready");
    }

    #[test]
    fn test_search_spans_lines() {
        let mut acc = plain();
        acc.add_line("SERIAL");
        acc.add_line("ABC123");

        let found = acc.search(r"SERIAL\n(?P<sn>\w+)").expect("should match");
        assert_eq!(found.captures["sn"], "ABC123");
    }

    #[test]
    fn test_invalid_pattern_is_no_match() {
        let mut acc = plain();
        acc.add_line("anything");
        assert!(acc.search("(unclosed").is_none());
    }

    #[test]
    fn test_search_any_first_wins() {
        let mut acc = plain();
        acc.add_line("ERR 5");
        acc.add_line("OK");

        let patterns = vec!["^OK$".to_string(), "^ERR".to_string()];
        let (index, found) = acc.search_any(&patterns).expect("should match");
        assert_eq!(index, 0);
        assert_eq!(found.matched_text, "OK");

        assert!(acc.search_any(&["nope".to_string()]).is_none());
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut acc = plain();
        acc.add_line("one");
        acc.clear();
        assert_eq!(acc.line_count(), 0);
        assert_eq!(acc.buffer_size(), 0);
        assert_eq!(acc.full_text(), "");
    }
}
