//! Link extraction from fetched documents.
//!
//! One scraper per document family; the demux picks a family from the
//! response MIME type first, then the URL path suffix, then a sniff of
//! the first 4 KiB of the body. Extractor output is normalized here:
//! resolved against the effective base URL, fragments dropped,
//! unsupported schemes rejected, duplicates collapsed.

use tracing::debug;
use webtrawl_core::{LinkType, UrlInfo};

pub mod css;
pub mod html;
pub mod javascript;
pub mod sitemap;
pub mod text;

/// How much of the body the detector may sniff.
const SNIFF_LEN: usize = 4096;

/// A discovered URL, classified.
///
/// Inline resources are fetched as part of rendering the parent (images,
/// stylesheets); linked resources are followed as new pages.
#[derive(Debug, Clone)]
pub struct LinkContext {
    pub url: UrlInfo,
    pub inline: bool,
    pub linked: bool,
    pub link_type: Option<LinkType>,
}

#[derive(Debug, Clone, Default)]
pub struct ScrapeResult {
    pub links: Vec<LinkContext>,
    pub encoding: String,
}

impl ScrapeResult {
    pub fn inline_urls(&self) -> Vec<&str> {
        self.links
            .iter()
            .filter(|context| context.inline)
            .map(|context| context.url.url())
            .collect()
    }

    pub fn linked_urls(&self) -> Vec<&str> {
        self.links
            .iter()
            .filter(|context| context.linked)
            .map(|context| context.url.url())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Html,
    Css,
    Sitemap,
    Javascript,
    PlainText,
}

/// Demux scraper configured from `--follow-tags` / `--ignore-tags`.
#[derive(Debug, Clone, Default)]
pub struct DocumentScraper {
    pub follow_tags: Option<Vec<String>>,
    pub ignore_tags: Vec<String>,
}

impl DocumentScraper {
    /// Decide which extractor handles this document, if any.
    pub fn detect(
        &self,
        url: &UrlInfo,
        content_type: Option<&str>,
        link_type: Option<LinkType>,
        body: &[u8],
    ) -> Option<DocumentKind> {
        // The frontier's own classification wins when present: a URL that
        // was discovered as a stylesheet stays a stylesheet even when the
        // server labels it text/plain.
        match link_type {
            Some(LinkType::Css) => return Some(DocumentKind::Css),
            Some(LinkType::Javascript) => return Some(DocumentKind::Javascript),
            Some(LinkType::Sitemap) => return Some(DocumentKind::Sitemap),
            _ => {}
        }

        if let Some(kind) = detect_by_mime(content_type, body) {
            return Some(kind);
        }
        if let Some(kind) = detect_by_path(url) {
            return Some(kind);
        }
        if let Some(kind) = detect_by_sniff(body) {
            return Some(kind);
        }
        // Anything still textual gets the plain-text URL scan.
        let mime = content_type
            .unwrap_or_default()
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        if mime.eq_ignore_ascii_case("text/plain") {
            return Some(DocumentKind::PlainText);
        }
        None
    }

    /// Extract links from a fetched body. `None` when no extractor claims
    /// the document.
    pub fn scrape(
        &self,
        url: &UrlInfo,
        content_type: Option<&str>,
        link_type: Option<LinkType>,
        body: &[u8],
    ) -> Option<ScrapeResult> {
        let kind = self.detect(url, content_type, link_type, body)?;
        let mut result = ScrapeResult {
            links: Vec::new(),
            encoding: "utf-8".to_string(),
        };

        match kind {
            DocumentKind::Html => {
                let text = String::from_utf8_lossy(body);
                let scrape =
                    html::scrape_html(&text, self.follow_tags.as_deref(), &self.ignore_tags);
                let base = effective_base(url, scrape.base_href.as_deref());
                for raw in scrape.links {
                    push_link(
                        &mut result,
                        &base,
                        &raw.link,
                        raw.inline,
                        raw.linked,
                        raw.link_type,
                    );
                }
            }
            DocumentKind::Css => {
                let text = String::from_utf8_lossy(body);
                for link in css::scrape_css(&text) {
                    let link_type = if link.import {
                        LinkType::Css
                    } else {
                        LinkType::Media
                    };
                    push_link(&mut result, url, &link.url, true, false, Some(link_type));
                }
            }
            DocumentKind::Javascript => {
                let text = String::from_utf8_lossy(body);
                for link in javascript::scrape_javascript(&text) {
                    push_link(&mut result, url, &link, false, true, None);
                }
            }
            DocumentKind::Sitemap => {
                let scrape = sitemap::scrape_sitemap(url, body)?;
                for link in scrape.links {
                    push_link(&mut result, url, &link, false, true, scrape.link_type);
                }
            }
            DocumentKind::PlainText => {
                for link in text::scrape_text(&String::from_utf8_lossy(body)) {
                    push_link(&mut result, url, &link, false, true, None);
                }
            }
        }

        dedupe(&mut result.links);
        Some(result)
    }
}

fn effective_base(doc_url: &UrlInfo, base_href: Option<&str>) -> UrlInfo {
    match base_href {
        Some(href) => doc_url.join(href).unwrap_or_else(|_| doc_url.clone()),
        None => doc_url.clone(),
    }
}

fn push_link(
    result: &mut ScrapeResult,
    base: &UrlInfo,
    link: &str,
    inline: bool,
    linked: bool,
    link_type: Option<LinkType>,
) {
    let trimmed = link.trim();
    if trimmed.is_empty() {
        return;
    }
    let lowered = trimmed.to_ascii_lowercase();
    if lowered.starts_with("javascript:")
        || lowered.starts_with("mailto:")
        || lowered.starts_with("data:")
    {
        return;
    }
    match base.join(trimmed) {
        Ok(url) => result.links.push(LinkContext {
            url,
            inline,
            linked,
            link_type,
        }),
        Err(err) => {
            debug!(link = trimmed, %err, "discarding malformed url");
        }
    }
}

fn dedupe(links: &mut Vec<LinkContext>) {
    let mut seen = std::collections::HashSet::new();
    links.retain(|context| {
        seen.insert((
            context.url.url().to_string(),
            context.inline,
            context.linked,
        ))
    });
}

fn detect_by_mime(content_type: Option<&str>, body: &[u8]) -> Option<DocumentKind> {
    let mime = content_type?
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "text/html" | "application/xhtml+xml" => Some(DocumentKind::Html),
        "text/css" => Some(DocumentKind::Css),
        "text/javascript" | "application/javascript" | "application/x-javascript" => {
            Some(DocumentKind::Javascript)
        }
        "text/xml" | "application/xml" => {
            if sniff_is_sitemap(body) {
                Some(DocumentKind::Sitemap)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn detect_by_path(url: &UrlInfo) -> Option<DocumentKind> {
    let path = url.path().to_ascii_lowercase();
    if path == "/robots.txt" {
        return Some(DocumentKind::Sitemap);
    }
    if path.contains("sitemap") && path.contains(".xml") {
        return Some(DocumentKind::Sitemap);
    }
    if path.ends_with(".html") || path.ends_with(".htm") || path.ends_with(".xhtml") {
        return Some(DocumentKind::Html);
    }
    if path.ends_with(".css") {
        return Some(DocumentKind::Css);
    }
    if path.ends_with(".js") {
        return Some(DocumentKind::Javascript);
    }
    None
}

fn detect_by_sniff(body: &[u8]) -> Option<DocumentKind> {
    let head = &body[..body.len().min(SNIFF_LEN)];
    let text = String::from_utf8_lossy(head).to_ascii_lowercase();
    if text.contains("<html") || text.contains("<!doctype html") {
        return Some(DocumentKind::Html);
    }
    if sniff_is_sitemap(body) {
        return Some(DocumentKind::Sitemap);
    }
    None
}

fn sniff_is_sitemap(body: &[u8]) -> bool {
    let head = if sitemap::is_gzip(body) {
        sitemap::gunzip_best_effort(&body[..body.len().min(SNIFF_LEN)])
    } else {
        body[..body.len().min(SNIFF_LEN)].to_vec()
    };
    let text = String::from_utf8_lossy(&head);
    text.contains("<?xml") && (text.contains("<urlset") || text.contains("<sitemapindex"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(url: &str) -> UrlInfo {
        UrlInfo::parse(url).unwrap()
    }

    #[test]
    fn mime_beats_suffix() {
        let scraper = DocumentScraper::default();
        let kind = scraper.detect(
            &info("http://example.com/style.css"),
            Some("text/html; charset=utf-8"),
            None,
            b"",
        );
        assert_eq!(kind, Some(DocumentKind::Html));
    }

    #[test]
    fn suffix_applies_when_mime_unknown() {
        let scraper = DocumentScraper::default();
        assert_eq!(
            scraper.detect(&info("http://example.com/style.css"), None, None, b""),
            Some(DocumentKind::Css)
        );
        assert_eq!(
            scraper.detect(&info("http://example.com/robots.txt"), None, None, b""),
            Some(DocumentKind::Sitemap)
        );
    }

    #[test]
    fn sniff_catches_extensionless_html() {
        let scraper = DocumentScraper::default();
        let kind = scraper.detect(
            &info("http://example.com/page"),
            Some("application/octet-stream"),
            None,
            b"<!DOCTYPE html><html><body></body></html>",
        );
        assert_eq!(kind, Some(DocumentKind::Html));
    }

    #[test]
    fn frontier_link_type_hint_wins() {
        let scraper = DocumentScraper::default();
        let kind = scraper.detect(
            &info("http://example.com/asset"),
            Some("text/plain"),
            Some(LinkType::Css),
            b"body { }",
        );
        assert_eq!(kind, Some(DocumentKind::Css));
    }

    #[test]
    fn scrape_resolves_and_drops_bad_schemes() {
        let scraper = DocumentScraper::default();
        let body = br#"<html><body>
            <a href="/a">a</a>
            <a href="mailto:x@example.com">mail</a>
            <a href="javascript:void(0)">js</a>
            <img src="pic.png">
        </body></html>"#;
        let result = scraper
            .scrape(
                &info("http://example.com/dir/page.html"),
                Some("text/html"),
                None,
                body,
            )
            .unwrap();
        assert_eq!(result.linked_urls(), vec!["http://example.com/a"]);
        assert_eq!(
            result.inline_urls(),
            vec!["http://example.com/dir/pic.png"]
        );
    }

    #[test]
    fn scrape_dedupes_repeated_links() {
        let scraper = DocumentScraper::default();
        let body = br#"<html><body><a href="/x">1</a><a href="/x#frag">2</a></body></html>"#;
        let result = scraper
            .scrape(&info("http://example.com/"), Some("text/html"), None, body)
            .unwrap();
        assert_eq!(result.links.len(), 1);
    }

    #[test]
    fn binary_documents_are_not_scraped() {
        let scraper = DocumentScraper::default();
        assert!(scraper
            .scrape(
                &info("http://example.com/img.png"),
                Some("image/png"),
                None,
                &[0x89, 0x50, 0x4e, 0x47],
            )
            .is_none());
    }
}
