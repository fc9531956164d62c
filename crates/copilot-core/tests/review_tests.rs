use copilot_core::review::{diff_positions, parse_review, Severity};
use copilot_core::types::MrChange;

fn change(new_path: &str, diff: &str) -> MrChange {
    MrChange {
        old_path: new_path.to_string(),
        new_path: new_path.to_string(),
        diff: diff.to_string(),
        new_file: false,
        deleted_file: false,
        renamed_file: false,
    }
}

#[test]
fn test_parse_fenced_json_with_summary() {
    let raw = "```json\n[{\"file\": \"src/x.py\", \"line\": 10, \"severity\": \"warning\", \"comment\": \"off by one\"}]\n```\nAll good otherwise.";
    let parsed = parse_review(raw);
    assert_eq!(parsed.findings.len(), 1);
    let finding = &parsed.findings[0];
    assert_eq!(finding.file, "src/x.py");
    assert_eq!(finding.line, 10);
    assert_eq!(finding.severity, Severity::Warning);
    assert_eq!(finding.comment, "off by one");
    assert!(finding.suggestion.is_none());
    assert_eq!(parsed.summary, "All good otherwise.");
}

#[test]
fn test_parse_bare_array_without_fence() {
    let raw = "Here is my review:\n[{\"file\": \"a.py\", \"line\": 3, \"comment\": \"shadowed var\"}]\nLooks fine.";
    let parsed = parse_review(raw);
    assert_eq!(parsed.findings.len(), 1);
    assert_eq!(parsed.findings[0].severity, Severity::Info);
    assert_eq!(parsed.summary, "Looks fine.");
}

#[test]
fn test_parse_no_json_falls_back_to_summary() {
    let raw = "The change is straightforward and correct.";
    let parsed = parse_review(raw);
    assert!(parsed.findings.is_empty());
    assert_eq!(parsed.summary, raw);
}

#[test]
fn test_parse_empty_array_uses_default_summary() {
    let raw = "```json\n[]\n```\n";
    let parsed = parse_review(raw);
    assert!(parsed.findings.is_empty());
    assert_eq!(parsed.summary, "Review complete.");
}

#[test]
fn test_parse_skips_elements_missing_required_fields() {
    let raw = r#"```json
[
  {"file": "a.py", "line": 1, "comment": "ok"},
  {"file": "b.py", "comment": "no line"},
  {"line": 2, "comment": "no file"},
  {"file": "c.py", "line": 3}
]
```
done"#;
    let parsed = parse_review(raw);
    assert_eq!(parsed.findings.len(), 1);
    assert_eq!(parsed.findings[0].file, "a.py");
}

#[test]
fn test_parse_suggestion_and_offsets() {
    let raw = r#"```json
[{"file": "a.py", "line": 5, "severity": "error", "comment": "fix",
  "suggestion": "x = 1", "suggestion_start_offset": 1, "suggestion_end_offset": 2}]
```
summary"#;
    let parsed = parse_review(raw);
    let finding = &parsed.findings[0];
    assert_eq!(finding.suggestion.as_deref(), Some("x = 1"));
    assert_eq!(finding.suggestion_start_offset, 1);
    assert_eq!(finding.suggestion_end_offset, 2);
}

#[test]
fn test_parse_null_suggestion_is_absent() {
    let raw = r#"[{"file": "a.py", "line": 5, "comment": "note", "suggestion": null}]"#;
    let parsed = parse_review(raw);
    assert!(parsed.findings[0].suggestion.is_none());
}

#[test]
fn test_parse_nested_arrays_stay_balanced() {
    let raw = r#"intro [not json] then
[{"file": "a.py", "line": 1, "comment": "uses [0] indexing"}]
tail"#;
    let parsed = parse_review(raw);
    assert_eq!(parsed.findings.len(), 1);
    assert_eq!(parsed.findings[0].comment, "uses [0] indexing");
}

#[test]
fn test_parse_trailing_fence_trimmed_from_summary() {
    let raw = "[{\"file\": \"a.py\", \"line\": 1, \"comment\": \"x\"}]\n```\nreal summary";
    let parsed = parse_review(raw);
    assert_eq!(parsed.summary, "real summary");
}

const SAMPLE_DIFF: &str = "\
@@ -1,4 +1,5 @@
 def hello():
-    print('hi')
+    name = input()
+    print(f'hi {name}')
 
 hello()
@@ -10,2 +11,3 @@
 # footer
+# appended
 # end
";

#[test]
fn test_diff_positions_cover_context_and_additions() {
    let positions = diff_positions(&[change("src/x.py", SAMPLE_DIFF)]);

    // First hunk: new side lines 1..=5.
    for line in 1..=5 {
        assert!(positions.contains(&("src/x.py".to_string(), line)), "line {line}");
    }
    // Second hunk: new side lines 11..=13.
    for line in 11..=13 {
        assert!(positions.contains(&("src/x.py".to_string(), line)), "line {line}");
    }
    // The gap between hunks is not commentable.
    assert!(!positions.contains(&("src/x.py".to_string(), 7)));
    assert!(!positions.contains(&("src/x.py".to_string(), 999)));
}

#[test]
fn test_diff_positions_deletions_do_not_advance() {
    let diff = "@@ -1,3 +1,2 @@\n line one\n-removed\n line two\n";
    let positions = diff_positions(&[change("a.txt", diff)]);
    assert!(positions.contains(&("a.txt".to_string(), 1)));
    assert!(positions.contains(&("a.txt".to_string(), 2)));
    assert!(!positions.contains(&("a.txt".to_string(), 3)));
}

#[test]
fn test_diff_positions_multiple_files() {
    let positions = diff_positions(&[
        change("a.py", "@@ -0,0 +1,2 @@\n+line\n+line\n"),
        change("b.py", "@@ -0,0 +1,1 @@\n+only\n"),
    ]);
    assert!(positions.contains(&("a.py".to_string(), 1)));
    assert!(positions.contains(&("a.py".to_string(), 2)));
    assert!(positions.contains(&("b.py".to_string(), 1)));
    assert!(!positions.contains(&("b.py".to_string(), 2)));
}

#[test]
fn test_diff_positions_ignores_no_newline_marker() {
    let diff = "@@ -1,1 +1,1 @@\n-old\n+new\n\\ No newline at end of file\n";
    let positions = diff_positions(&[change("a.txt", diff)]);
    assert_eq!(positions.len(), 1);
    assert!(positions.contains(&("a.txt".to_string(), 1)));
}

#[test]
fn test_finding_position_membership_drives_inline_policy() {
    // A finding inside hunk coverage is inline-postable; one outside is not.
    let positions = diff_positions(&[change("src/x.py", SAMPLE_DIFF)]);
    let parsed = parse_review(
        "[{\"file\": \"src/x.py\", \"line\": 3, \"comment\": \"in diff\"},\n {\"file\": \"src/x.py\", \"line\": 42, \"comment\": \"off diff\"}]",
    );
    let inline: Vec<bool> = parsed
        .findings
        .iter()
        .map(|f| positions.contains(&(f.file.clone(), f.line)))
        .collect();
    assert_eq!(inline, vec![true, false]);
}
