//! HTML link extraction.
//!
//! Walks every element of the parsed document and applies the classic
//! attribute table: anchors and forms yield linked pages, media and
//! stylesheet references yield inline resources, frames yield both.
//! Inline `style`/`<style>` content goes through the CSS scanner and
//! inline `<script>` text through the JavaScript scanner.

use scraper::{ElementRef, Html, Selector};
use webtrawl_core::LinkType;

use super::{css, javascript};

/// A link as found in the markup, before base resolution.
#[derive(Debug, Clone)]
pub struct RawLink {
    pub tag: String,
    pub attribute: Option<String>,
    pub link: String,
    pub inline: bool,
    pub linked: bool,
    pub link_type: Option<LinkType>,
}

#[derive(Debug, Clone, Default)]
pub struct HtmlScrape {
    /// First `<base href>` in the document, if any.
    pub base_href: Option<String>,
    pub links: Vec<RawLink>,
}

pub fn scrape_html(
    body: &str,
    follow_tags: Option<&[String]>,
    ignore_tags: &[String],
) -> HtmlScrape {
    let document = Html::parse_document(body);
    let everything = match Selector::parse("*") {
        Ok(selector) => selector,
        Err(_) => return HtmlScrape::default(),
    };

    let mut scrape = HtmlScrape::default();
    for element in document.select(&everything) {
        let tag = element.value().name().to_ascii_lowercase();

        if tag == "base" {
            if scrape.base_href.is_none() {
                if let Some(href) = element.value().attr("href") {
                    scrape.base_href = Some(href.to_string());
                }
            }
            continue;
        }

        if let Some(allowed) = follow_tags {
            if !allowed.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
                continue;
            }
        }
        if ignore_tags.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
            continue;
        }

        scrape_element(&mut scrape, &element, &tag);

        // Inline style attributes can reference images anywhere.
        if let Some(style) = element.value().attr("style") {
            for link in css::scrape_css(style) {
                push(&mut scrape, &tag, Some("style"), &link.url, true, false, {
                    if link.import {
                        Some(LinkType::Css)
                    } else {
                        Some(LinkType::Media)
                    }
                });
            }
        }
    }
    scrape
}

fn scrape_element(scrape: &mut HtmlScrape, element: &ElementRef<'_>, tag: &str) {
    let attr = |name: &str| element.value().attr(name);

    match tag {
        "a" | "area" => {
            if let Some(href) = attr("href") {
                push(scrape, tag, Some("href"), href, false, true, Some(LinkType::Html));
            }
        }
        "link" => {
            if let Some(href) = attr("href") {
                let rel = attr("rel").unwrap_or_default().to_ascii_lowercase();
                if rel.split_whitespace().any(|token| token == "stylesheet") {
                    push(scrape, tag, Some("href"), href, true, false, Some(LinkType::Css));
                } else {
                    push(scrape, tag, Some("href"), href, false, true, Some(LinkType::Html));
                }
            }
        }
        "img" => {
            if let Some(src) = attr("src") {
                push(scrape, tag, Some("src"), src, true, false, Some(LinkType::Media));
            }
            if let Some(lowsrc) = attr("lowsrc") {
                push(scrape, tag, Some("lowsrc"), lowsrc, true, false, Some(LinkType::Media));
            }
            if let Some(srcset) = attr("srcset") {
                for candidate in parse_srcset(srcset) {
                    push(scrape, tag, Some("srcset"), &candidate, true, false, Some(LinkType::Media));
                }
            }
        }
        "script" => {
            if let Some(src) = attr("src") {
                push(scrape, tag, Some("src"), src, true, false, Some(LinkType::Javascript));
            } else {
                let text: String = element.text().collect();
                for link in javascript::scrape_javascript(&text) {
                    push(scrape, tag, None, &link, false, true, Some(LinkType::Javascript));
                }
            }
        }
        "iframe" | "frame" => {
            if let Some(src) = attr("src") {
                push(scrape, tag, Some("src"), src, true, true, Some(LinkType::Html));
            }
        }
        "embed" => {
            if let Some(src) = attr("src") {
                push(scrape, tag, Some("src"), src, true, false, Some(LinkType::Media));
            }
        }
        "object" => {
            if let Some(data) = attr("data") {
                push(scrape, tag, Some("data"), data, true, false, Some(LinkType::Media));
            }
        }
        "applet" => {
            for name in ["code", "src", "archive"] {
                if let Some(value) = attr(name) {
                    // archive is a comma-separated list.
                    for part in value.split(',') {
                        push(scrape, tag, Some(name), part, true, false, Some(LinkType::Media));
                    }
                }
            }
        }
        "audio" | "video" | "source" | "track" => {
            if let Some(src) = attr("src") {
                push(scrape, tag, Some("src"), src, true, false, Some(LinkType::Media));
            }
        }
        "form" => {
            if let Some(action) = attr("action") {
                push(scrape, tag, Some("action"), action, false, true, Some(LinkType::Html));
            }
        }
        "meta" => {
            let http_equiv = attr("http-equiv").unwrap_or_default();
            if http_equiv.eq_ignore_ascii_case("refresh") {
                if let Some(url) = attr("content").and_then(parse_refresh_content) {
                    push(scrape, tag, Some("content"), &url, false, true, Some(LinkType::Html));
                }
            }
        }
        "style" => {
            let text: String = element.text().collect();
            for link in css::scrape_css(&text) {
                let link_type = if link.import {
                    Some(LinkType::Css)
                } else {
                    Some(LinkType::Media)
                };
                push(scrape, tag, None, &link.url, true, false, link_type);
            }
        }
        _ => {}
    }
}

#[allow(clippy::too_many_arguments)]
fn push(
    scrape: &mut HtmlScrape,
    tag: &str,
    attribute: Option<&str>,
    link: &str,
    inline: bool,
    linked: bool,
    link_type: Option<LinkType>,
) {
    let link = link.trim();
    if link.is_empty() {
        return;
    }
    scrape.links.push(RawLink {
        tag: tag.to_string(),
        attribute: attribute.map(str::to_string),
        link: link.to_string(),
        inline,
        linked,
        link_type,
    });
}

/// Pull the URL out of each srcset candidate (`url [descriptor]`, comma
/// separated).
fn parse_srcset(srcset: &str) -> Vec<String> {
    srcset
        .split(',')
        .filter_map(|candidate| {
            candidate
                .split_whitespace()
                .next()
                .filter(|url| !url.is_empty())
                .map(str::to_string)
        })
        .collect()
}

/// `content="5; url=/next"` from a refresh meta tag.
fn parse_refresh_content(content: &str) -> Option<String> {
    for part in content.split(';') {
        let part = part.trim();
        let lowered = part.to_ascii_lowercase();
        if let Some(rest) = lowered.strip_prefix("url=") {
            let raw = &part[part.len() - rest.len()..];
            return Some(raw.trim_matches(|c| c == '"' || c == '\'').to_string());
        }
    }
    None
}
