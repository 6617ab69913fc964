//! Code context search for the "Context search" step.
//!
//! Ranks source files in the sandbox against ticket and signal keywords and
//! renders the best excerpts as markdown for the plan and the backends.

use regex::Regex;
use rusqlite::{Connection, params};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;
use walkdir::WalkDir;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "when", "then", "than", "have",
    "has", "had", "will", "would", "should", "could", "cant", "cannot", "not", "your", "you",
    "our", "are", "was", "were", "being", "been", "else", "true", "false",
];

const SKIP_DIRS: &[&str] = &[
    "node_modules",
    "__pycache__",
    "venv",
    "env",
    "dist",
    "build",
    "coverage",
    "htmlcov",
    "target",
];

const SOURCE_PATTERNS: &[&str] = &[
    "*.py",
    "*.js",
    "*.ts",
    "*.tsx",
    "*.jsx",
    "*.go",
    "*.rs",
    "*.rb",
    "*.java",
    "*.php",
    "pyproject.toml",
    "package.json",
    "requirements.txt",
    "setup.py",
    "setup.cfg",
    "Cargo.toml",
    "go.mod",
];

const MANIFESTS: &[&str] = &["pyproject.toml", "package.json", "requirements.txt", "Cargo.toml", "go.mod"];

const MAX_KEYWORDS: usize = 15;
const MAX_FILE_HINTS: usize = 30;
const MAX_FILE_BYTES: u64 = 300_000;
const EXCERPT_CONTEXT_LINES: usize = 60;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-zA-Z_][a-zA-Z0-9_]{2,}").unwrap());

static FILE_HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([\w./-]+\.(?:py|js|ts|tsx|jsx|go|rs|toml|cfg|ini|yaml|yml|json))").unwrap()
});

static SOURCE_GLOBS: LazyLock<Vec<glob::Pattern>> = LazyLock::new(|| {
    SOURCE_PATTERNS
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .collect()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snippet {
    pub path: String,
    pub score: usize,
    pub excerpt: String,
    pub language: &'static str,
}

/// Identifiers of three or more characters, ranked by frequency then length.
pub fn pick_keywords(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut freq: HashMap<&str, usize> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for m in TOKEN_RE.find_iter(&lower) {
        let token = m.as_str();
        if STOPWORDS.contains(&token) {
            continue;
        }
        let count = freq.entry(token).or_insert(0);
        if *count == 0 {
            order.push(token);
        }
        *count += 1;
    }
    order.sort_by(|a, b| (freq[b], b.len()).cmp(&(freq[a], a.len())));
    order
        .into_iter()
        .take(MAX_KEYWORDS)
        .map(str::to_string)
        .collect()
}

/// File paths mentioned in failure output, in first-seen order.
pub fn file_hints(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    FILE_HINT_RE
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .filter(|c| seen.insert(c.clone()))
        .take(MAX_FILE_HINTS)
        .collect()
}

fn language_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "py" => "python",
        "js" => "javascript",
        "ts" => "typescript",
        "tsx" => "tsx",
        "jsx" => "jsx",
        "go" => "go",
        "rs" => "rust",
        "java" => "java",
        "rb" => "ruby",
        "php" => "php",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "json" => "json",
        "md" => "markdown",
        _ => "",
    }
}

fn is_hidden_or_skipped(name: &str) -> bool {
    (name.starts_with('.') && name != ".") || SKIP_DIRS.contains(&name)
}

/// Window of up to 120 lines with the highest keyword density.
fn best_excerpt(content: &str, keywords: &[String]) -> String {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let window = (EXCERPT_CONTEXT_LINES * 2).min(lines.len());
    let step = (window / 2).max(1);
    let last_start = lines.len() - window;
    let mut starts: Vec<usize> = (0..=last_start).step_by(step).collect();
    if starts.last() != Some(&last_start) {
        starts.push(last_start);
    }

    let mut best_start = 0;
    let mut best_density = 0;
    for start in starts {
        let end = (start + window).min(lines.len());
        let chunk = lines[start..end].join("\n").to_lowercase();
        let density: usize = keywords.iter().map(|k| chunk.matches(k.as_str()).count()).sum();
        if density > best_density {
            best_density = density;
            best_start = start;
        }
    }
    let end = (best_start + window).min(lines.len());
    lines[best_start..end].join("\n")
}

/// Score every candidate source file; files scoring zero are dropped.
pub fn rank_files(root: &Path, keywords: &[String], hints: &[String], signals_text: &str) -> Vec<Snippet> {
    let signals_lower = signals_text.to_lowercase();
    let failing = ["fail", "error", "assert"]
        .iter()
        .any(|k| signals_lower.contains(k));

    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir() && is_hidden_or_skipped(&e.file_name().to_string_lossy()))
        });

    let mut snippets = Vec::new();
    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !SOURCE_GLOBS.iter().any(|p| p.matches(&name)) || name.ends_with(".min.js") {
            continue;
        }
        if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
            continue;
        }
        let Ok(bytes) = std::fs::read(entry.path()) else {
            continue;
        };
        let content = String::from_utf8_lossy(&bytes);
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");

        let lower = content.to_lowercase();
        let mut score: usize = keywords
            .iter()
            .map(|k| lower.matches(k.as_str()).count() * 2)
            .sum();
        score += hints
            .iter()
            .filter(|h| rel.ends_with(h.as_str()) || rel.contains(h.as_str()))
            .count()
            * 30;
        if failing && rel.to_lowercase().contains("test") {
            score += 10;
        }
        if MANIFESTS.contains(&name.as_str()) {
            score += 5;
        }
        if score == 0 {
            continue;
        }
        snippets.push(Snippet {
            excerpt: best_excerpt(&content, keywords),
            language: language_for(entry.path()),
            path: rel,
            score,
        });
    }
    // Stable: equal scores keep walk order.
    snippets.sort_by(|a, b| b.score.cmp(&a.score));
    snippets
}

static DOC_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-z0-9_]+").unwrap());

/// A knowledge-base document from the workspace `docs/` folder.
#[derive(Debug, Clone, PartialEq)]
pub struct DocHit {
    pub title: String,
    pub text: String,
    /// Negated FTS5 `bm25()`; higher is more relevant.
    pub score: f64,
}

/// Any-term FTS5 match expression; each token is quoted so punctuation and
/// FTS keywords in the ticket are taken literally.
fn fts_query(query: &str) -> String {
    let lower = query.to_lowercase();
    let mut seen = HashSet::new();
    DOC_TOKEN_RE
        .find_iter(&lower)
        .map(|m| m.as_str())
        .filter(|t| seen.insert(*t))
        .map(|t| format!("\"{}\"", t))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn rank_docs(docs: &[(String, String)], expr: &str, k: usize) -> rusqlite::Result<Vec<DocHit>> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("CREATE VIRTUAL TABLE kb USING fts5(title UNINDEXED, body);")?;
    {
        let mut insert = conn.prepare("INSERT INTO kb (title, body) VALUES (?1, ?2)")?;
        for (title, body) in docs {
            insert.execute(params![title, body])?;
        }
    }
    let mut stmt = conn.prepare(
        "SELECT title, body, bm25(kb) FROM kb WHERE kb MATCH ?1 ORDER BY bm25(kb) LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![expr, k as i64], |row| {
        Ok(DocHit {
            title: row.get(0)?,
            text: row.get(1)?,
            score: -row.get::<_, f64>(2)?,
        })
    })?;
    rows.collect()
}

/// Index `docs/**/*.md` into an in-memory FTS5 table and return how many
/// were indexed plus the `k` best matches for `query`. Documents with no
/// matching term are dropped.
pub fn search_docs(root: &Path, query: &str, k: usize) -> (usize, Vec<DocHit>) {
    let docs_dir = root.join("docs");
    if !docs_dir.is_dir() {
        return (0, Vec::new());
    }
    let docs: Vec<(String, String)> = WalkDir::new(&docs_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && e.path().extension().is_some_and(|x| x == "md"))
        .filter_map(|e| {
            let text = std::fs::read_to_string(e.path()).ok()?;
            Some((e.file_name().to_string_lossy().to_string(), text))
        })
        .collect();
    let indexed = docs.len();
    let expr = fts_query(query);
    if indexed == 0 || expr.is_empty() || k == 0 {
        return (indexed, Vec::new());
    }
    match rank_docs(&docs, &expr, k) {
        Ok(hits) => (indexed, hits),
        Err(e) => {
            tracing::warn!(error = %e, "docs search failed");
            (indexed, Vec::new())
        }
    }
}

/// Render the context markdown, bounded by `max_files` and `max_chars`.
pub fn build_code_context(
    root: &Path,
    ticket_text: &str,
    signals_text: &str,
    max_files: usize,
    max_chars: usize,
) -> String {
    let keywords = pick_keywords(&format!("{}\n{}", ticket_text, signals_text));
    let hints = file_hints(signals_text);
    let mut snippets = rank_files(root, &keywords, &hints, signals_text);
    snippets.truncate(max_files);

    if snippets.is_empty() {
        return "(no relevant code context found)".to_string();
    }

    let mut parts: Vec<String> = Vec::new();
    let shown = if keywords.is_empty() {
        "(none)".to_string()
    } else {
        keywords.join(", ")
    };
    parts.push(format!("**Keywords**: {}", shown));
    if !hints.is_empty() {
        let first: Vec<&str> = hints.iter().take(10).map(String::as_str).collect();
        parts.push(format!("**Files mentioned in failures**: {}", first.join(", ")));
    }
    parts.push(String::new());

    let mut used: usize = parts.iter().map(String::len).sum();
    for snip in &snippets {
        let mut block = format!(
            "### {} (score={})\n```{}\n{}\n```\n",
            snip.path, snip.score, snip.language, snip.excerpt
        );
        if used + block.len() > max_chars {
            let short = crate::util::head_chars(&snip.excerpt, 800);
            block = format!(
                "### {} (score={})\n```{}\n{}\n... (truncated)\n```\n",
                snip.path, snip.score, snip.language, short
            );
            if used + block.len() > max_chars {
                break;
            }
        }
        used += block.len();
        parts.push(block);
    }

    let joined = parts.join("\n");
    crate::util::head_chars(joined.trim(), max_chars).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn shop() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("tinyshop")).unwrap();
        std::fs::create_dir_all(root.join("tests")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/x")).unwrap();
        std::fs::write(
            root.join("tinyshop/pricing.py"),
            "def apply_discount(amount_cents: int, percent: int) -> int:\n    return amount_cents * (100 - percent) // 100\n",
        )
        .unwrap();
        std::fs::write(
            root.join("tests/test_pricing.py"),
            "from tinyshop.pricing import apply_discount\n\ndef test_discount():\n    assert apply_discount(995, 10) == 896\n",
        )
        .unwrap();
        std::fs::write(root.join("node_modules/x/discount.js"), "discount discount").unwrap();
        std::fs::write(root.join("README.txt"), "nothing").unwrap();
        dir
    }

    #[test]
    fn test_pick_keywords_ranks_and_filters() {
        let kws = pick_keywords("The discount is wrong. discount rounding for the cart, cart, cart");
        assert_eq!(kws[0], "cart");
        assert_eq!(kws[1], "discount");
        assert!(!kws.contains(&"the".to_string()));
        assert!(!kws.contains(&"is".to_string()));
    }

    #[test]
    fn test_file_hints_dedupe() {
        let hints = file_hints("tests/test_pricing.py:12: AssertionError\ntests/test_pricing.py:20 and cart.go:3");
        assert_eq!(hints, vec!["tests/test_pricing.py", "cart.go"]);
    }

    #[test]
    fn test_rank_prefers_hinted_file_and_skips_vendor() {
        let dir = shop();
        let kws = pick_keywords("discount rounding");
        let hints = file_hints("tinyshop/pricing.py:2");
        let ranked = rank_files(dir.path(), &kws, &hints, "1 failed");
        assert_eq!(ranked[0].path, "tinyshop/pricing.py");
        assert_eq!(ranked[0].language, "python");
        assert!(ranked.iter().all(|s| !s.path.starts_with("node_modules")));
        assert!(ranked.iter().any(|s| s.path == "tests/test_pricing.py"));
    }

    #[test]
    fn test_build_context_renders_sections() {
        let dir = shop();
        let ctx = build_code_context(dir.path(), "Discount rounding bug", "1 failed", 8, 12_000);
        assert!(ctx.starts_with("**Keywords**:"));
        assert!(ctx.contains("### tinyshop/pricing.py"));
        assert!(!ctx.contains("node_modules"));
        assert!(ctx.contains("```python"));
    }

    #[test]
    fn test_build_context_empty_workspace() {
        let dir = TempDir::new().unwrap();
        let ctx = build_code_context(dir.path(), "anything", "", 8, 12_000);
        assert_eq!(ctx, "(no relevant code context found)");
    }

    #[test]
    fn test_build_context_respects_char_cap() {
        let dir = shop();
        let ctx = build_code_context(dir.path(), "discount", "", 8, 300);
        assert!(ctx.chars().count() <= 300);
    }

    #[test]
    fn test_best_excerpt_finds_dense_window() {
        let mut content = String::new();
        for i in 0..400 {
            content.push_str(&format!("line {}\n", i));
        }
        content.push_str("discount discount discount\n");
        let excerpt = best_excerpt(&content, &["discount".to_string()]);
        assert!(excerpt.contains("discount"));
        assert!(excerpt.lines().count() <= 120);
    }

    #[test]
    fn test_search_docs_ranks_matching_notes() {
        let dir = TempDir::new().unwrap();
        let docs = dir.path().join("docs");
        std::fs::create_dir_all(docs.join("nested")).unwrap();
        std::fs::write(docs.join("pricing.md"), "# Pricing\nDiscount rounding is half-up. Discount applies first.").unwrap();
        std::fs::write(docs.join("nested/deploy.md"), "# Deploy\nRun the container.").unwrap();
        std::fs::write(docs.join("notes.txt"), "discount").unwrap();

        let (indexed, hits) = search_docs(dir.path(), "Fix discount rounding", 4);
        assert_eq!(indexed, 2);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "pricing.md");
        assert!(hits[0].text.starts_with("# Pricing"));
    }

    #[test]
    fn test_search_docs_orders_by_relevance_and_caps() {
        let dir = TempDir::new().unwrap();
        let docs = dir.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        std::fs::write(docs.join("a.md"), "Shipping costs are flat. Rounding is not involved here at all, only totals.").unwrap();
        std::fs::write(docs.join("b.md"), "Rounding rounding rounding.").unwrap();
        std::fs::write(docs.join("c.md"), "Rounding of refunds.").unwrap();

        let (indexed, hits) = search_docs(dir.path(), "rounding", 2);
        assert_eq!(indexed, 3);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "b.md");
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(fts_query("Fix \"discount\" AND rounding"), "\"fix\" OR \"discount\" OR \"and\" OR \"rounding\"");
        assert_eq!(fts_query("  -- "), "");
    }

    #[test]
    fn test_search_docs_without_folder() {
        let dir = TempDir::new().unwrap();
        assert_eq!(search_docs(dir.path(), "discount", 4), (0, Vec::new()));
    }
}
