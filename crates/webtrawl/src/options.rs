//! Command-line surface, kept Wget-compatible where the engine has the
//! matching behavior.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "webtrawl")]
#[command(version)]
#[command(about = "Recursive, resumable web/FTP archiver", long_about = None)]
pub struct Options {
    /// URLs to fetch.
    #[arg(required = true, value_name = "URL")]
    pub urls: Vec<String>,

    // ── Recursion ──────────────────────────────────────────────────
    /// Follow links and download them too.
    #[arg(short = 'r', long)]
    pub recursive: bool,
    /// Maximum recursion depth.
    #[arg(short = 'l', long, value_name = "DEPTH")]
    pub level: Option<u32>,
    /// Download page requisites (images, stylesheets) even without -r.
    #[arg(short = 'p', long)]
    pub page_requisites: bool,
    /// Do not ascend above the seed directories.
    #[arg(long)]
    pub no_parent: bool,
    /// Follow links onto other hosts.
    #[arg(short = 'H', long)]
    pub span_hosts: bool,
    /// Follow only links below the referrer's directory.
    #[arg(short = 'L', long = "relative")]
    pub relative: bool,
    /// Hostname suffixes to accept.
    #[arg(short = 'D', long = "domains", value_delimiter = ',', value_name = "LIST")]
    pub domains: Vec<String>,
    /// Hostname suffixes to reject.
    #[arg(long, value_delimiter = ',', value_name = "LIST")]
    pub exclude_domains: Vec<String>,
    /// Exact hostnames to accept.
    #[arg(long, value_delimiter = ',', value_name = "LIST")]
    pub hostnames: Vec<String>,
    /// Exact hostnames to reject.
    #[arg(long, value_delimiter = ',', value_name = "LIST")]
    pub exclude_hostnames: Vec<String>,
    /// Path prefixes to accept.
    #[arg(
        short = 'I',
        long = "include-directories",
        value_delimiter = ',',
        value_name = "LIST"
    )]
    pub include_directories: Vec<String>,
    /// Path prefixes to reject.
    #[arg(
        short = 'X',
        long = "exclude-directories",
        value_delimiter = ',',
        value_name = "LIST"
    )]
    pub exclude_directories: Vec<String>,
    /// Accept only URLs matching this regex.
    #[arg(long, value_name = "REGEX")]
    pub accept_regex: Option<String>,
    /// Reject URLs matching this regex.
    #[arg(long, value_name = "REGEX")]
    pub reject_regex: Option<String>,
    /// Restrict HTML extraction to these tags.
    #[arg(long, value_delimiter = ',', value_name = "LIST")]
    pub follow_tags: Vec<String>,
    /// Skip these tags during HTML extraction.
    #[arg(long, value_delimiter = ',', value_name = "LIST")]
    pub ignore_tags: Vec<String>,
    /// Follow ftp:// links found in documents.
    #[arg(long)]
    pub follow_ftp: bool,

    // ── Fetching ───────────────────────────────────────────────────
    /// Attempts per URL before giving up.
    #[arg(short = 't', long, default_value_t = 20, value_name = "NUMBER")]
    pub tries: u32,
    /// Retry refused connections instead of skipping.
    #[arg(long)]
    pub retry_connrefused: bool,
    /// Retry failed DNS lookups instead of skipping.
    #[arg(long)]
    pub retry_dns_error: bool,
    /// Seconds to wait between requests.
    #[arg(short = 'w', long, default_value_t = 0.0, value_name = "SECONDS")]
    pub wait: f64,
    /// Ceiling on the error backoff, in seconds.
    #[arg(long, default_value_t = 10.0, value_name = "SECONDS")]
    pub waitretry: f64,
    /// Perturb each wait by a random factor in [0.5, 1.5].
    #[arg(long)]
    pub random_wait: bool,
    /// Overall per-request timeout in seconds.
    #[arg(short = 'T', long, value_name = "SECONDS")]
    pub timeout: Option<f64>,
    /// TCP connect timeout in seconds.
    #[arg(long, value_name = "SECONDS")]
    pub connect_timeout: Option<f64>,
    /// Socket read timeout in seconds.
    #[arg(long, value_name = "SECONDS")]
    pub read_timeout: Option<f64>,
    /// Local address to bind outgoing connections to.
    #[arg(long, value_name = "ADDRESS")]
    pub bind_address: Option<std::net::IpAddr>,
    /// Connect over IPv4 only.
    #[arg(short = '4', long)]
    pub inet4_only: bool,
    /// Connect over IPv6 only.
    #[arg(short = '6', long)]
    pub inet6_only: bool,
    /// Concurrent sessions.
    #[arg(long, default_value_t = 1, value_name = "NUMBER")]
    pub concurrent: usize,

    // ── Output ─────────────────────────────────────────────────────
    /// Directory to save files under.
    #[arg(short = 'P', long, default_value = ".", value_name = "PREFIX")]
    pub directory_prefix: PathBuf,
    /// Always create the URL directory hierarchy.
    #[arg(short = 'x', long)]
    pub force_directories: bool,
    /// Never create the URL directory hierarchy.
    #[arg(long)]
    pub no_directories: bool,
    /// Do not create a hostname directory.
    #[arg(long)]
    pub no_host_directories: bool,
    /// Prefix the tree with a scheme directory.
    #[arg(long)]
    pub protocol_directories: bool,
    /// Drop this many leading path segments.
    #[arg(long, default_value_t = 0, value_name = "NUMBER")]
    pub cut_dirs: u32,
    /// Filename for directory URLs.
    #[arg(long, default_value = "index.html", value_name = "NAME")]
    pub default_page: String,
    /// Skip downloads whose target file already exists.
    #[arg(long)]
    pub no_clobber: bool,
    /// Resume partially downloaded files.
    #[arg(short = 'c', long = "continue")]
    pub continue_download: bool,
    /// Only fetch files newer than the local copy.
    #[arg(short = 'N', long)]
    pub timestamping: bool,
    /// Prepend the HTTP response header to saved files.
    #[arg(long)]
    pub save_headers: bool,

    // ── HTTP ───────────────────────────────────────────────────────
    /// Extra request header, `NAME: VALUE`. Repeatable.
    #[arg(long = "header", value_name = "NAME: VALUE")]
    pub headers: Vec<String>,
    /// Redirect budget per URL.
    #[arg(long, default_value_t = 20, value_name = "NUMBER")]
    pub max_redirect: u32,
    /// Send this Referer on every request.
    #[arg(long, value_name = "URL")]
    pub referer: Option<String>,
    /// User-Agent header.
    #[arg(short = 'U', long, value_name = "AGENT")]
    pub user_agent: Option<String>,
    /// Ignore robots.txt entirely.
    #[arg(long)]
    pub no_robots: bool,
    /// POST this urlencoded body instead of GET.
    #[arg(long, value_name = "DATA")]
    pub post_data: Option<String>,

    // ── WARC ───────────────────────────────────────────────────────
    /// Write a WARC archive named NAME.warc.gz.
    #[arg(long, value_name = "NAME")]
    pub warc_file: Option<String>,
    /// Extra warcinfo field, `NAME: VALUE`. Repeatable.
    #[arg(long = "warc-header", value_name = "NAME: VALUE")]
    pub warc_headers: Vec<String>,
    /// Write an uncompressed .warc instead.
    #[arg(long)]
    pub no_warc_compression: bool,

    // ── Storage ────────────────────────────────────────────────────
    /// Frontier database path; in-memory when omitted. Reusing a path
    /// resumes the crawl.
    #[arg(long, value_name = "PATH")]
    pub database: Option<PathBuf>,

    // ── Logging ────────────────────────────────────────────────────
    /// Only log warnings and errors.
    #[arg(short = 'q', long)]
    pub quiet: bool,
    /// Log session internals.
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Split a repeatable `NAME: VALUE` flag into pairs; malformed entries
/// are reported, not guessed at.
pub fn parse_header_pairs(raw: &[String]) -> Result<Vec<(String, String)>, String> {
    let mut pairs = Vec::new();
    for entry in raw {
        let Some((name, value)) = entry.split_once(':') else {
            return Err(format!("malformed header {entry:?}, expected NAME: VALUE"));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(format!("malformed header {entry:?}, empty name"));
        }
        pairs.push((name.to_string(), value.trim().to_string()));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_invocation_parses() {
        let options = Options::try_parse_from(["webtrawl", "http://example.com/"]).unwrap();
        assert_eq!(options.urls, vec!["http://example.com/"]);
        assert_eq!(options.tries, 20);
        assert_eq!(options.max_redirect, 20);
        assert!(!options.recursive);
    }

    #[test]
    fn recursion_family_parses() {
        let options = Options::try_parse_from([
            "webtrawl",
            "-r",
            "-l",
            "3",
            "-p",
            "--no-parent",
            "-D",
            "example.com,example.org",
            "--exclude-directories",
            "/private,/tmp",
            "http://example.com/",
        ])
        .unwrap();
        assert!(options.recursive && options.page_requisites && options.no_parent);
        assert_eq!(options.level, Some(3));
        assert_eq!(options.domains, vec!["example.com", "example.org"]);
        assert_eq!(options.exclude_directories, vec!["/private", "/tmp"]);
    }

    #[test]
    fn missing_url_is_an_error() {
        assert!(Options::try_parse_from(["webtrawl"]).is_err());
    }

    #[test]
    fn header_pairs_parse_and_reject_garbage() {
        let pairs =
            parse_header_pairs(&["Accept-Language: en".to_string(), "X-A:b".to_string()])
                .unwrap();
        assert_eq!(
            pairs,
            vec![
                ("Accept-Language".to_string(), "en".to_string()),
                ("X-A".to_string(), "b".to_string()),
            ]
        );
        assert!(parse_header_pairs(&["no-colon".to_string()]).is_err());
    }
}
