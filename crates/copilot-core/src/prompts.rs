use crate::config::Config;

/// Max characters of diff to inline into the review prompt. Beyond this the
/// diff is truncated and the agent is told to run git diff for the rest.
pub const MAX_DIFF_CHARS: usize = 120_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Coding,
    Review,
    MrComment,
}

pub const DEFAULT_CODING_PROMPT: &str = "\
You are a senior software engineer implementing requested changes.

Your workflow:
1. Read the task description carefully to understand requirements
2. Explore the existing codebase using file tools to understand structure and conventions
3. Make minimal, focused changes that address the task
4. Follow existing project conventions for code style, formatting, and architecture
5. However, always prioritize security and quality standards defined in repo config \
files over patterns observed in existing code: if existing code contains anti-patterns \
such as SQL injection, hardcoded secrets, or bare exception handling, do NOT replicate them
6. Ensure an ignore file exists with standard ignores for the project language
7. Run the project linter if available and fix any issues
8. Run tests if available to verify your changes
9. Output your results in the EXACT format described below

Guidelines:
- Make the smallest change that solves the problem
- Preserve existing behavior unless explicitly required to change it
- Add tests for new functionality
- Do not introduce new dependencies without strong justification
- Never commit generated or cached files (__pycache__, node_modules, target, etc.)

Output format:
Your final message MUST end with a JSON block listing the files you changed.
Only list source files you intentionally created, modified, or deleted.
Include deleted files so the deletion is captured in the patch.

```json
{
  \"summary\": \"Brief description of changes made and test results\",
  \"files_changed\": [
    \"src/app/main.py\"
  ]
}
```
";

pub const DEFAULT_REVIEW_PROMPT: &str = "\
You are a senior code reviewer. Review the merge request diff thoroughly.

Focus on:
- Bugs, logic errors, and edge cases
- Security vulnerabilities (OWASP Top 10)
- Performance issues
- Code clarity and maintainability

IMPORTANT: The \"line\" field in your output MUST be the line number as shown in
the NEW version of the file (the right-hand side of the diff). Use the line
numbers from the `+` side of the `git diff` output. Double-check each line
number by counting from the hunk header `@@ ... +START,COUNT @@`.
Use the FULL file path as shown in the diff.

CRITICAL: Only comment on files and lines that are PART OF THE DIFF provided
in the user message. Do not review or comment on files that are not in the diff.

Output your review as a JSON array:
```json
[
  {
    \"file\": \"src/full/path/to/file.py\",
    \"line\": 42,
    \"severity\": \"error|warning|info\",
    \"comment\": \"Description of the issue\",
    \"suggestion\": \"replacement code for the line(s)\",
    \"suggestion_start_offset\": 0,
    \"suggestion_end_offset\": 0
  }
]
```

Suggestion fields:
- \"suggestion\": The replacement code. Include ONLY when you can provide a
  concrete, unambiguous fix. Suggestions MUST be self-contained: if the fix
  requires a new import, mention it in the comment text instead.
- \"suggestion_start_offset\": Lines ABOVE the commented line to replace (default 0).
- \"suggestion_end_offset\": Lines BELOW the commented line to replace (default 0).

After the JSON array, add a brief summary paragraph.
If the code looks good, return an empty array and say so in the summary.
";

/// Resolve the effective system prompt for a persona.
///
/// Layering: global base (`SYSTEM_PROMPT` + suffix), then the per-persona
/// override or built-in default plus its suffix.
pub fn get_prompt(config: &Config, kind: PromptKind) -> String {
    let mut global = config.system_prompt.clone();
    if !config.system_prompt_suffix.is_empty() {
        if !global.is_empty() {
            global.push_str("\n\n");
        }
        global.push_str(&config.system_prompt_suffix);
    }

    let (override_prompt, suffix, default) = match kind {
        PromptKind::Coding => (
            &config.coding_system_prompt,
            &config.coding_system_prompt_suffix,
            DEFAULT_CODING_PROMPT,
        ),
        PromptKind::Review => (
            &config.review_system_prompt,
            &config.review_system_prompt_suffix,
            DEFAULT_REVIEW_PROMPT,
        ),
        PromptKind::MrComment => (
            &config.mr_comment_system_prompt,
            &config.mr_comment_system_prompt_suffix,
            DEFAULT_CODING_PROMPT,
        ),
    };

    let mut persona = if override_prompt.is_empty() {
        default.to_string()
    } else {
        override_prompt.clone()
    };
    if !suffix.is_empty() {
        persona.push_str("\n\n");
        persona.push_str(suffix);
    }

    if global.is_empty() {
        persona
    } else {
        format!("{global}\n\n{persona}")
    }
}

/// Minimal MR info the review agent needs.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub title: String,
    pub description: Option<String>,
    pub source_branch: String,
    pub target_branch: String,
}

/// Cut at a char boundary at or below `max` bytes.
fn truncate_chars(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Build the review user prompt; the diff is inlined when available.
pub fn build_review_prompt(req: &ReviewRequest, diff_text: Option<&str>) -> String {
    let mut prompt = format!(
        "## Merge Request\n\
         **Title:** {}\n\
         **Description:** {}\n\
         **Source branch:** {}\n\
         **Target branch:** {}\n\n",
        req.title,
        req.description.as_deref().unwrap_or("(none)"),
        req.source_branch,
        req.target_branch,
    );
    match diff_text {
        Some(diff) => {
            let body = if diff.len() > MAX_DIFF_CHARS {
                tracing::warn!(
                    original_len = diff.len(),
                    max_len = MAX_DIFF_CHARS,
                    "diff truncated for review prompt"
                );
                format!("{}\n... (diff truncated)", truncate_chars(diff, MAX_DIFF_CHARS))
            } else {
                diff.to_string()
            };
            prompt.push_str(&format!("## Diff\n\n```diff\n{body}\n```\n\n"));
            prompt.push_str("Review ONLY the changes shown in the diff above.");
        }
        None => {
            prompt.push_str(&format!(
                "Run `git diff {}...{}` to see the changes, then read relevant files for context.",
                req.target_branch, req.source_branch
            ));
        }
    }
    prompt
}

/// Build the user prompt for a Jira-issue coding task.
pub fn build_issue_coding_prompt(issue_key: &str, summary: &str, description: Option<&str>) -> String {
    format!(
        "## Jira Issue: {issue_key}\n\
         **Summary:** {summary}\n\
         **Description:**\n{}\n\n\
         Implement the changes described in this issue. \
         Explore the repository, make necessary changes, run tests, \
         and provide a summary of what you did.",
        description.unwrap_or("(no description provided)")
    )
}

/// Build the user prompt for a `/copilot` MR-comment coding task.
pub fn build_mr_coding_prompt(
    instruction: &str,
    mr_title: &str,
    source_branch: &str,
    target_branch: &str,
) -> String {
    format!(
        "## MR: {mr_title}\n\
         **Branch:** {source_branch} -> {target_branch}\n\
         **Instruction:** {instruction}\n\n\
         Implement the requested changes on this merge request. \
         Explore the repository, make the changes, run tests, \
         and provide a summary of what you did."
    )
}
