//! URL extraction from plain text bodies.

use std::sync::LazyLock;

use regex::Regex;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\b(?:https?|ftp)://[^\s<>"']+"#).unwrap());

pub fn scrape_text(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for found in URL_RE.find_iter(text) {
        // Prose likes to end URLs with punctuation that is not part of them.
        let url = found
            .as_str()
            .trim_end_matches(['.', ',', ';', ')', ']', '!', '?']);
        if seen.insert(url.to_string()) {
            out.push(url.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_urls_and_strips_trailing_punctuation() {
        let text = "See https://example.com/a, http://example.com/b. Or ftp://example.com/c";
        assert_eq!(
            scrape_text(text),
            vec![
                "https://example.com/a",
                "http://example.com/b",
                "ftp://example.com/c",
            ]
        );
    }

    #[test]
    fn plain_words_are_ignored() {
        assert!(scrape_text("no links here, just text").is_empty());
    }
}
