//! CSS link extraction: `@import` targets and `url(...)` tokens.

use std::sync::LazyLock;

use regex::Regex;

// Both quoted and bare forms are legal:
//   @import "a.css";  @import url('b.css');  url(img.png)
static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)@import\s+(?:url\(\s*)?["']?([^"'()\s;]+)"#).unwrap()
});
static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)url\(\s*["']?([^"'()\s]+?)["']?\s*\)"#).unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CssLink {
    pub url: String,
    /// True for `@import` (another stylesheet), false for `url()`
    /// references (fonts, images).
    pub import: bool,
}

pub fn scrape_css(text: &str) -> Vec<CssLink> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for capture in IMPORT_RE.captures_iter(text) {
        let url = capture[1].trim();
        if usable(url) && seen.insert(url.to_string()) {
            out.push(CssLink {
                url: url.to_string(),
                import: true,
            });
        }
    }
    for capture in URL_RE.captures_iter(text) {
        let url = capture[1].trim();
        if usable(url) && seen.insert(url.to_string()) {
            out.push(CssLink {
                url: url.to_string(),
                import: false,
            });
        }
    }
    out
}

fn usable(url: &str) -> bool {
    !url.is_empty() && !url.to_ascii_lowercase().starts_with("data:")
}
