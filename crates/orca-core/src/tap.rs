//! TAP 14 streaming parser (C6, §4.6).
//!
//! Consumes the stdout/stderr byte stream of a running job, line-buffered,
//! and emits derived progress events alongside the raw bytes the router
//! already forwards verbatim. One parser instance per job.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One derived progress event, emitted alongside (never instead of) the raw
/// forwarded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TapEvent {
    /// A top-level `ok`/`not ok` line.
    TestResult {
        number: Option<u32>,
        name: String,
        ok: bool,
        skip: bool,
        todo: bool,
    },
    /// The closing result line of a BatchRun child script, matched against
    /// `current_subtest`.
    SubtestResult {
        name: String,
        ok: bool,
        duration: Duration,
    },
    /// A parsed YAML diagnostic block, merged key/value.
    Diagnostics(HashMap<String, String>),
}

/// Final accounting for a finished job, computed once its `exit` frame
/// arrives (§4.6 final paragraph).
#[derive(Debug, Clone, PartialEq)]
pub struct TapReport {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub passed_final: bool,
    pub fully_skipped: bool,
    pub timed_out: bool,
}

/// Streaming state machine. Fed raw bytes as they arrive on stdout/stderr;
/// buffers a partial trailing line across calls.
pub struct TapParser {
    expected_children: Vec<String>,
    line_buf: String,
    total: u32,
    passed: u32,
    failed: u32,
    skipped: u32,
    todo_seen: bool,
    current_subtest: Option<String>,
    subtest_start: Option<Instant>,
    in_yaml: bool,
    diagnostics: HashMap<String, String>,
    block_key: Option<String>,
    block_indent: Option<usize>,
    block_lines: Vec<String>,
}

impl TapParser {
    /// `expected_children` lists the script paths of a BatchRun job in
    /// order, so `# Subtest: <path>` lines can be matched against an
    /// expected name; empty for non-batch jobs (subtests are then ignored).
    pub fn new(expected_children: Vec<String>) -> Self {
        Self {
            expected_children,
            line_buf: String::new(),
            total: 0,
            passed: 0,
            failed: 0,
            skipped: 0,
            todo_seen: false,
            current_subtest: None,
            subtest_start: None,
            in_yaml: false,
            diagnostics: HashMap::new(),
            block_key: None,
            block_indent: None,
            block_lines: Vec::new(),
        }
    }

    /// Feed a chunk of bytes (as delivered by one `stdout`/`stderr` frame).
    /// Returns the events derived from every complete line in the chunk.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<TapEvent> {
        let text = String::from_utf8_lossy(bytes);
        self.line_buf.push_str(&text);

        let mut events = Vec::new();
        while let Some(pos) = self.line_buf.find('\n') {
            let line = self.line_buf[..pos].to_string();
            self.line_buf.drain(..=pos);
            events.extend(self.process_line(&line));
        }
        events
    }

    fn process_line(&mut self, raw_line: &str) -> Vec<TapEvent> {
        let trimmed = raw_line.trim_end_matches('\r').trim();
        let mut events = Vec::new();

        if self.in_yaml {
            if trimmed == "..." {
                self.close_yaml_block();
                self.in_yaml = false;
                events.push(TapEvent::Diagnostics(self.diagnostics.clone()));
                return events;
            }
            self.process_yaml_line(raw_line, trimmed);
            return events;
        }

        if trimmed == "---" {
            self.in_yaml = true;
            self.diagnostics.clear();
            return events;
        }

        if trimmed.starts_with("TAP version") || is_plan_line(trimmed) {
            return events;
        }

        if let Some(sub_name) = trimmed.strip_prefix("# Subtest:") {
            let sub_name = sub_name.trim().to_string();
            if self.expected_children.iter().any(|c| c == &sub_name) {
                self.current_subtest = Some(sub_name);
                self.subtest_start = Some(Instant::now());
            }
            return events;
        }

        if let Some(result) = parse_result_line(trimmed) {
            self.total += 1;
            if result.skip {
                self.skipped += 1;
            } else if !result.ok && !result.todo {
                self.failed += 1;
            }
            if result.todo {
                self.todo_seen = true;
            }

            if self
                .current_subtest
                .as_deref()
                .map(|s| s == result.name)
                .unwrap_or(false)
            {
                let duration = self
                    .subtest_start
                    .map(|start| start.elapsed())
                    .unwrap_or_default();
                events.push(TapEvent::SubtestResult {
                    name: result.name.clone(),
                    ok: result.ok,
                    duration,
                });
                self.current_subtest = None;
                self.subtest_start = None;
            }

            events.push(TapEvent::TestResult {
                number: result.number,
                name: result.name,
                ok: result.ok,
                skip: result.skip,
                todo: result.todo,
            });
        }

        events
    }

    fn process_yaml_line(&mut self, raw_line: &str, trimmed: &str) {
        let indent = raw_line.len() - raw_line.trim_start().len();

        if self.block_key.is_some() {
            if self.block_indent.is_none() {
                self.block_indent = Some(indent);
                self.block_lines.push(trimmed.to_string());
                return;
            }
            let block_indent = self.block_indent.unwrap();
            if !trimmed.is_empty() && indent < block_indent {
                self.close_block_into_diagnostics();
            } else {
                let content = if raw_line.len() >= block_indent {
                    &raw_line[block_indent.min(raw_line.len())..]
                } else {
                    trimmed
                };
                self.block_lines.push(content.to_string());
                return;
            }
        }

        let Some((key, value)) = trimmed.split_once(':') else {
            return;
        };
        let key = key.trim().to_string();
        let value = value.trim();

        if value == "|" {
            self.block_key = Some(key);
            self.block_indent = None;
            self.block_lines.clear();
        } else {
            if key.eq_ignore_ascii_case("severity") && value.eq_ignore_ascii_case("skip") {
                self.diagnostics.insert("severity".to_string(), "skip".to_string());
            } else {
                self.diagnostics.insert(key, value.to_string());
            }
        }
    }

    fn close_block_into_diagnostics(&mut self) {
        if let Some(key) = self.block_key.take() {
            self.diagnostics.insert(key, self.block_lines.join("\n"));
        }
        self.block_indent = None;
        self.block_lines.clear();
    }

    fn close_yaml_block(&mut self) {
        if self.block_key.is_some() {
            self.close_block_into_diagnostics();
        }
    }

    /// Compute the final report once the job's `exit` frame has arrived
    /// (§4.6 last paragraph).
    pub fn finalize(&self, exit_code: i32) -> TapReport {
        let fully_skipped = self
            .diagnostics
            .get("severity")
            .map(|v| v == "skip")
            .unwrap_or(false);
        let passed_final = if self.todo_seen {
            true
        } else {
            exit_code == 0 && self.failed == 0
        };
        TapReport {
            total: self.total,
            passed: self.total.saturating_sub(self.failed + self.skipped),
            failed: self.failed,
            skipped: self.skipped,
            passed_final,
            fully_skipped,
            timed_out: exit_code == 124,
        }
    }
}

struct ParsedResult {
    number: Option<u32>,
    name: String,
    ok: bool,
    skip: bool,
    todo: bool,
}

fn is_plan_line(trimmed: &str) -> bool {
    let Some((lo, hi)) = trimmed.split_once("..") else {
        return false;
    };
    lo.chars().all(|c| c.is_ascii_digit()) && hi.chars().all(|c| c.is_ascii_digit()) && !lo.is_empty()
}

fn parse_result_line(trimmed: &str) -> Option<ParsedResult> {
    let (ok, rest) = if let Some(rest) = trimmed.strip_prefix("not ok") {
        (false, rest)
    } else if let Some(rest) = trimmed.strip_prefix("ok") {
        (true, rest)
    } else {
        return None;
    };

    let rest = rest.trim_start();
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let number = digits.parse::<u32>().ok();
    let rest = rest[digits.len()..].trim_start();
    let rest = rest.strip_prefix('-').unwrap_or(rest).trim_start();

    let (desc, directive) = match rest.split_once('#') {
        Some((desc, dir)) => (desc.trim(), dir.trim()),
        None => (rest.trim(), ""),
    };
    let directive_word = directive
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();

    Some(ParsedResult {
        number,
        name: desc.to_string(),
        ok,
        skip: directive_word == "skip",
        todo: directive_word == "todo",
    })
}
