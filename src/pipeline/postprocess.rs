//! Deterministic cleanup of raw model replies.
//!
//! Vision models asked for a bare JSON object still wrap it in code fences,
//! prefix it with a sentence, or emit CRLF line endings and zero-width
//! characters. These rules recover the object and tidy the transcription
//! text without touching its meaning.
//!
//! Rules run in a fixed order: fences are stripped before the object is
//! located, and line endings are normalised before blank lines are counted.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Tidy free text a model returned as page content.
///
/// 1. Normalise line endings (CRLF → LF)
/// 2. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 3. Trim trailing whitespace per line
/// 4. Collapse runs of blank lines to one
/// 5. Trim the whole text
pub fn clean_model_text(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    s.trim().to_string()
}

/// Locate and parse the JSON object in a model reply.
///
/// Accepts a bare object, one wrapped in ```` ```json ```` fences, or one
/// embedded in surrounding prose. Returns `None` when no object parses.
pub fn extract_json_object(reply: &str) -> Option<Value> {
    let unfenced = strip_outer_fences(reply);
    let text = unfenced.trim();

    if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(text) {
        return Some(v);
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

// ── Fences ───────────────────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*\s*\n(.*?)\n?```\s*$").unwrap());

pub fn strip_outer_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Whitespace ───────────────────────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_fences() {
        let reply = "```json\n{\"content\": \"x\"}\n```";
        assert_eq!(strip_outer_fences(reply), "{\"content\": \"x\"}");
    }

    #[test]
    fn leaves_unfenced_text_alone() {
        assert_eq!(strip_outer_fences("plain"), "plain");
    }

    #[test]
    fn extracts_bare_object() {
        let v = extract_json_object(r#"{"fields": {"total": "12"}}"#).unwrap();
        assert_eq!(v["fields"]["total"], "12");
    }

    #[test]
    fn extracts_fenced_object() {
        let v = extract_json_object("```json\n{\"content\": \"Invoice\"}\n```\n").unwrap();
        assert_eq!(v["content"], "Invoice");
    }

    #[test]
    fn extracts_object_from_prose() {
        let reply = "Here is the result:\n{\"fields\": {\"a\": 1}}\nHope this helps.";
        let v = extract_json_object(reply).unwrap();
        assert_eq!(v["fields"]["a"], 1);
    }

    #[test]
    fn rejects_non_object_replies() {
        assert!(extract_json_object("[1, 2, 3]").is_none());
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("} backwards {").is_none());
    }

    #[test]
    fn cleans_model_text() {
        let raw = "Line one  \r\n\r\n\r\n\r\nLine\u{200B} two\n";
        assert_eq!(clean_model_text(raw), "Line one\n\nLine two");
    }
}
