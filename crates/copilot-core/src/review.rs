use std::collections::HashSet;

use serde_json::Value;

use crate::types::MrChange;

// ── Findings ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "error" => Severity::Error,
            "warning" => Severity::Warning,
            _ => Severity::Info,
        }
    }

    /// Uppercase tag used in posted comment bodies.
    pub fn tag(self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Info => "INFO",
        }
    }
}

/// One structured finding from the review agent.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewFinding {
    pub file: String,
    /// 1-based line number on the new side of the diff.
    pub line: u32,
    pub severity: Severity,
    pub comment: String,
    /// Verbatim replacement for the span
    /// `[line - start_offset, line + end_offset]`.
    pub suggestion: Option<String>,
    pub suggestion_start_offset: u32,
    pub suggestion_end_offset: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReview {
    pub findings: Vec<ReviewFinding>,
    pub summary: String,
}

// ── Output parsing ───────────────────────────────────────────────────────

/// Extract structured findings and a summary from the agent's free text.
///
/// Looks for the first fenced ```json array, then for any bracket-balanced
/// JSON array anywhere in the text. When neither parses the entire output
/// becomes the summary with zero findings.
pub fn parse_review(raw: &str) -> ParsedReview {
    let Some((items, end)) = fenced_json_array(raw).or_else(|| balanced_json_array(raw)) else {
        return ParsedReview {
            findings: Vec::new(),
            summary: raw.trim().to_string(),
        };
    };

    let findings = items.iter().filter_map(finding_from_value).collect();

    let mut summary = raw[end..].trim();
    summary = summary.strip_prefix("```").unwrap_or(summary).trim();
    let summary = if summary.is_empty() {
        "Review complete.".to_string()
    } else {
        summary.to_string()
    };

    ParsedReview { findings, summary }
}

/// First fenced ```json block whose contents form a JSON array. Returns the
/// elements and the byte offset just past the closing fence.
fn fenced_json_array(raw: &str) -> Option<(Vec<Value>, usize)> {
    let fence = raw.find("```json")?;
    let content_start = fence + raw[fence..].find('\n')? + 1;
    let close = content_start + raw[content_start..].find("```")?;
    let content = raw[content_start..close].trim();
    let value: Value = serde_json::from_str(content).ok()?;
    let Value::Array(items) = value else {
        return None;
    };
    Some((items, close + 3))
}

/// Any bracket-balanced JSON array in the text (string-aware). Returns the
/// elements and the byte offset just past the closing bracket.
fn balanced_json_array(raw: &str) -> Option<(Vec<Value>, usize)> {
    let bytes = raw.as_bytes();
    for start in (0..bytes.len()).filter(|&i| bytes[i] == b'[') {
        let Some(end) = matching_bracket(bytes, start) else {
            continue;
        };
        if let Ok(Value::Array(items)) = serde_json::from_str(&raw[start..=end]) {
            return Some((items, end + 1));
        }
    }
    None
}

fn matching_bracket(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0i64;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Build a finding from one array element. Elements missing `file`, `line`,
/// or `comment` are skipped; `severity` defaults to info, offsets to zero.
fn finding_from_value(item: &Value) -> Option<ReviewFinding> {
    let obj = item.as_object()?;
    let file = obj.get("file")?.as_str()?.to_string();
    let line = u32::try_from(obj.get("line")?.as_i64()?).ok()?;
    let comment = obj.get("comment")?.as_str()?.to_string();

    let severity = obj
        .get("severity")
        .and_then(Value::as_str)
        .map(Severity::parse)
        .unwrap_or(Severity::Info);
    let suggestion = obj
        .get("suggestion")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let offset = |key: &str| {
        obj.get(key)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    };

    Some(ReviewFinding {
        file,
        line,
        severity,
        comment,
        suggestion,
        suggestion_start_offset: offset("suggestion_start_offset"),
        suggestion_end_offset: offset("suggestion_end_offset"),
    })
}

// ── Diff positioning ─────────────────────────────────────────────────────

/// New-side line positions that can receive inline comments, across all
/// changed files of an MR.
pub fn diff_positions(changes: &[MrChange]) -> HashSet<(String, u32)> {
    let mut positions = HashSet::new();
    for change in changes {
        hunk_positions(&change.diff, &change.new_path, &mut positions);
    }
    positions
}

/// Walk one file's unified diff. The counter starts at the hunk header's
/// new-side start and advances on context and addition lines only; those are
/// the lines that exist in the new file.
fn hunk_positions(diff: &str, new_path: &str, positions: &mut HashSet<(String, u32)>) {
    let mut new_line: Option<u32> = None;
    for line in diff.lines() {
        if line.starts_with("@@") {
            new_line = parse_hunk_header(line);
            continue;
        }
        let Some(counter) = new_line.as_mut() else {
            continue;
        };
        match line.as_bytes().first() {
            Some(b' ') | Some(b'+') => {
                positions.insert((new_path.to_string(), *counter));
                *counter += 1;
            }
            // Deletions and hunk-internal metadata don't advance the new side.
            _ => {}
        }
    }
}

/// Parse `@@ -a,b +c,d @@` and return `c`.
fn parse_hunk_header(line: &str) -> Option<u32> {
    let plus = line.find('+')?;
    let digits: String = line[plus + 1..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}
