//! Sitemap link extraction.
//!
//! Two shapes arrive here: `robots.txt` files carrying `Sitemap:`
//! directives, and sitemap XML (`<urlset>` of pages or `<sitemapindex>`
//! of further sitemaps). Gzipped sitemaps are decompressed transparently;
//! a truncated gzip stream is parsed as far as it goes.

use std::io::Read;

use flate2::read::MultiGzDecoder;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;
use webtrawl_core::{LinkType, UrlInfo};

/// Cap on how much of a robots.txt we scan for sitemap directives.
pub const MAX_ROBOTS_SCAN_BYTES: usize = 4096;

#[derive(Debug, Clone, Default)]
pub struct SitemapScrape {
    pub links: Vec<String>,
    /// `Some(Sitemap)` when the links are themselves sitemaps (an index
    /// or robots directives), `None` when they are ordinary pages.
    pub link_type: Option<LinkType>,
}

pub fn scrape_sitemap(url: &UrlInfo, body: &[u8]) -> Option<SitemapScrape> {
    if url.path().eq_ignore_ascii_case("/robots.txt") {
        return Some(SitemapScrape {
            links: sitemaps_from_robots(body),
            link_type: Some(LinkType::Sitemap),
        });
    }

    let body = if is_gzip(body) {
        gunzip_best_effort(body)
    } else {
        body.to_vec()
    };
    locs_from_xml(&body)
}

pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

/// Decompress as much of a gzip stream as is intact.
pub fn gunzip_best_effort(data: &[u8]) -> Vec<u8> {
    let mut decoder = MultiGzDecoder::new(data);
    let mut out = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match decoder.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(err) => {
                debug!(%err, "truncated gzip stream, keeping partial output");
                break;
            }
        }
    }
    out
}

/// `Sitemap:` directives from a robots.txt, scanning at most the first
/// 4 KiB.
fn sitemaps_from_robots(body: &[u8]) -> Vec<String> {
    let head = &body[..body.len().min(MAX_ROBOTS_SCAN_BYTES)];
    let text = String::from_utf8_lossy(head);
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("sitemap") {
            let value = value.trim();
            if !value.is_empty() {
                out.push(value.to_string());
            }
        }
    }
    out
}

/// Every `<loc>` text under a `<urlset>` or `<sitemapindex>` root.
/// `None` when the document has some other root.
fn locs_from_xml(body: &[u8]) -> Option<SitemapScrape> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut root: Option<Vec<u8>> = None;
    let mut in_loc = false;
    let mut links = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) => {
                let local = start.local_name().as_ref().to_vec();
                if root.is_none() {
                    if local != b"urlset" && local != b"sitemapindex" {
                        return None;
                    }
                    root = Some(local);
                } else if local == b"loc" {
                    in_loc = true;
                }
            }
            Ok(Event::Text(text)) if in_loc => {
                if let Ok(value) = text.unescape() {
                    let value = value.trim();
                    if !value.is_empty() {
                        links.push(value.to_string());
                    }
                }
            }
            Ok(Event::End(end)) => {
                if end.local_name().as_ref() == b"loc" {
                    in_loc = false;
                }
            }
            Ok(Event::Eof) => break,
            // Truncated or malformed XML: keep what was parsed so far.
            Err(err) => {
                debug!(%err, "sitemap xml ended early");
                break;
            }
            Ok(_) => {}
        }
        buf.clear();
    }

    let root = root?;
    let link_type = if root == b"sitemapindex" {
        Some(LinkType::Sitemap)
    } else {
        None
    };
    Some(SitemapScrape { links, link_type })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn info(url: &str) -> UrlInfo {
        UrlInfo::parse(url).unwrap()
    }

    const URLSET: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>http://example.com/a</loc></url>
  <url><loc>http://example.com/b</loc></url>
</urlset>"#;

    #[test]
    fn urlset_locs_are_pages() {
        let scrape = scrape_sitemap(&info("http://example.com/sitemap.xml"), URLSET).unwrap();
        assert_eq!(
            scrape.links,
            vec!["http://example.com/a", "http://example.com/b"]
        );
        assert_eq!(scrape.link_type, None);
    }

    #[test]
    fn sitemapindex_locs_are_sitemaps() {
        let body = br#"<?xml version="1.0"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>http://example.com/sitemap-1.xml.gz</loc></sitemap>
</sitemapindex>"#;
        let scrape = scrape_sitemap(&info("http://example.com/sitemap.xml"), body).unwrap();
        assert_eq!(scrape.links, vec!["http://example.com/sitemap-1.xml.gz"]);
        assert_eq!(scrape.link_type, Some(LinkType::Sitemap));
    }

    #[test]
    fn other_xml_roots_are_rejected() {
        let body = b"<?xml version=\"1.0\"?><rss><channel></channel></rss>";
        assert!(scrape_sitemap(&info("http://example.com/sitemap.xml"), body).is_none());
    }

    #[test]
    fn robots_directives_are_extracted() {
        let body = b"User-agent: *\nDisallow: /x\nSitemap: http://example.com/sitemap.xml\nsitemap: http://example.com/more.xml\n";
        let scrape = scrape_sitemap(&info("http://example.com/robots.txt"), body).unwrap();
        assert_eq!(
            scrape.links,
            vec![
                "http://example.com/sitemap.xml",
                "http://example.com/more.xml"
            ]
        );
        assert_eq!(scrape.link_type, Some(LinkType::Sitemap));
    }

    #[test]
    fn gzipped_sitemap_is_decompressed() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(URLSET).unwrap();
        let compressed = encoder.finish().unwrap();

        let scrape =
            scrape_sitemap(&info("http://example.com/sitemap.xml.gz"), &compressed).unwrap();
        assert_eq!(scrape.links.len(), 2);
    }

    #[test]
    fn truncated_gzip_parses_best_effort() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::none());
        encoder.write_all(URLSET).unwrap();
        let mut compressed = encoder.finish().unwrap();
        compressed.truncate(compressed.len() - 12);

        // Whatever decompressed cleanly is still scanned; no panic, and
        // any fully present <loc> entries survive.
        let result = scrape_sitemap(&info("http://example.com/sitemap.xml.gz"), &compressed);
        if let Some(scrape) = result {
            assert!(scrape.links.len() <= 2);
        }
    }

    #[test]
    fn truncated_xml_keeps_complete_entries() {
        // Ends mid-tag; parsing stops there and keeps the first entry.
        let cut: &[u8] = b"<?xml version=\"1.0\"?>\n<urlset>\n  <url><loc>http://example.com/a</loc></url>\n  <url><loc";
        let scrape = scrape_sitemap(&info("http://example.com/sitemap.xml"), cut).unwrap();
        assert_eq!(scrape.links, vec!["http://example.com/a"]);
    }
}
