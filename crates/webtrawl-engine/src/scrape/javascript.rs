//! Best-effort URL extraction from JavaScript text.
//!
//! No parsing, just string literals that plausibly name a resource:
//! absolute http/https/ftp URLs, or root-relative paths that contain a
//! dot (so `/api/data.json` counts but `/` and `/x` noise does not).

use std::sync::LazyLock;

use regex::Regex;

static STRING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""((?:[^"\\]|\\.)*)"|'((?:[^'\\]|\\.)*)'"#).unwrap()
});

pub fn scrape_javascript(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for capture in STRING_RE.captures_iter(text) {
        let literal = capture
            .get(1)
            .or_else(|| capture.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        if looks_like_url(literal) && seen.insert(literal.to_string()) {
            out.push(literal.to_string());
        }
    }
    out
}

fn looks_like_url(literal: &str) -> bool {
    if literal.len() < 2 || literal.contains(char::is_whitespace) {
        return false;
    }
    let lowered = literal.to_ascii_lowercase();
    if lowered.starts_with("http://")
        || lowered.starts_with("https://")
        || lowered.starts_with("ftp://")
    {
        return true;
    }
    literal.starts_with('/') && !literal.starts_with("//") && literal.contains('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_and_root_relative_urls() {
        let js = r#"
            var a = "https://example.com/data";
            var b = '/assets/app.js';
            var c = "just words";
            var d = "/";
        "#;
        assert_eq!(
            scrape_javascript(js),
            vec!["https://example.com/data", "/assets/app.js"]
        );
    }

    #[test]
    fn duplicates_collapse() {
        let js = r#"f("/a/b.json"); g("/a/b.json");"#;
        assert_eq!(scrape_javascript(js), vec!["/a/b.json"]);
    }

    #[test]
    fn strings_with_spaces_are_not_urls() {
        assert!(scrape_javascript(r#"var x = "http error occurred";"#).is_empty());
    }
}
