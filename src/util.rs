//! Shared utility functions for the fixloop crate.

/// Extract a JSON object from text that may contain other content.
///
/// Uses brace-counting to find the outermost JSON object. Braces inside
/// string literals are ignored, since model output frequently carries diffs
/// or code with unbalanced braces in its string values.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse the first JSON object in `text`, tolerating trailing commas.
pub fn parse_json_object(text: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    let blob = extract_json_object(text)?;
    let parse = |s: &str| match serde_json::from_str::<serde_json::Value>(s) {
        Ok(serde_json::Value::Object(map)) => Some(map),
        _ => None,
    };
    parse(&blob).or_else(|| {
        let cleaned = TRAILING_COMMA.replace_all(&blob, "$1");
        parse(&cleaned)
    })
}

static TRAILING_COMMA: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r",\s*([}\]])").unwrap());

/// First `max` characters of `text`, on a char boundary.
pub fn head_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Last `max` characters of `text`, on a char boundary.
pub fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}
