//! Pure text normalisation of candidate unified diffs.
//!
//! Generated diffs most often fail `git apply` because hunk header counts do
//! not match the hunk body. [`sanitize`] recomputes those counts from the
//! body; it never changes the diff's content lines.

use regex::Regex;
use std::sync::LazyLock;

static PATCH_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<patch>\s*(.*?)\s*</patch>").unwrap());

static OPEN_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^```[a-zA-Z0-9_-]*\n").unwrap());

static CLOSE_FENCE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"```\s*$").unwrap());

static HUNK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").unwrap());

static PLUS_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\+\+\+ b/(\S+)").unwrap());

/// Remove `<patch>` delimiters and a surrounding markdown fence.
pub fn strip_wrappers(diff: &str) -> String {
    let mut text = normalize_newlines(diff.trim());
    let lower = text.to_lowercase();
    if lower.contains("<patch>")
        && lower.contains("</patch>")
        && let Some(inner) = PATCH_TAG_RE.captures(&text).and_then(|c| c.get(1))
    {
        text = inner.as_str().trim().to_string();
    }
    let text = OPEN_FENCE_RE.replace(&text, "");
    let text = CLOSE_FENCE_RE.replace(&text, "");
    text.trim().to_string()
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn is_file_header(line: &str) -> bool {
    line.starts_with("diff --git ") || line.starts_with("--- ") || line.starts_with("+++ ")
}

/// Strip wrappers, normalise line endings and rewrite every hunk header
/// with counts taken from its body. Idempotent.
pub fn sanitize(diff: &str) -> String {
    let mut stripped = strip_wrappers(diff);
    loop {
        let again = strip_wrappers(&stripped);
        if again == stripped {
            break;
        }
        stripped = again;
    }
    if stripped.is_empty() {
        return stripped;
    }
    let mut text = stripped;
    if !text.ends_with('\n') {
        text.push('\n');
    }
    let lines: Vec<&str> = text.split_inclusive('\n').collect();

    let mut out = String::with_capacity(text.len());
    for (i, line) in lines.iter().enumerate() {
        let Some(caps) = HUNK_RE.captures(line) else {
            out.push_str(line);
            continue;
        };
        let (mut old_count, mut new_count) = (0usize, 0usize);
        for body in &lines[i + 1..] {
            if HUNK_RE.is_match(body) || is_file_header(body) {
                break;
            }
            if body.starts_with('\\') {
                continue;
            }
            if body.starts_with('-') {
                old_count += 1;
            } else if body.starts_with('+') {
                new_count += 1;
            } else {
                old_count += 1;
                new_count += 1;
            }
        }
        let header_end = caps.get(0).map_or(0, |m| m.end());
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@{}",
            &caps[1],
            old_count,
            &caps[3],
            new_count,
            &line[header_end..]
        ));
    }
    out
}

/// A diff must carry file headers before its first hunk.
pub fn looks_like_unified_diff(text: &str) -> bool {
    let t = text.trim_start();
    if t.is_empty() {
        return false;
    }
    if t.starts_with("diff --git ") {
        return true;
    }
    if t.starts_with("--- ") {
        return match (t.find("+++ "), t.find("@@")) {
            (Some(plus), Some(hunk)) => plus < hunk,
            (Some(_), None) => true,
            (None, _) => false,
        };
    }
    false
}

/// Paths named by `+++ b/<path>` headers, in order of appearance.
pub fn changed_files(diff: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for caps in PLUS_FILE_RE.captures_iter(diff) {
        let path = caps[1].to_string();
        if !files.contains(&path) {
            files.push(path);
        }
    }
    files
}

/// Parsed `@@ -a,b +c,d @@` header values.
pub(crate) fn hunk_header(line: &str) -> Option<(usize, usize, usize, usize)> {
    let caps = HUNK_RE.captures(line)?;
    let num = |i: usize, default: usize| {
        caps.get(i)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(default)
    };
    Some((num(1, 0), num(2, 1), num(3, 0), num(4, 1)))
}
