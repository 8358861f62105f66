//! Accept/reject verdicts for candidate URLs.
//!
//! The fetch rule is an ordered chain of named filters. Every filter sees
//! the candidate URL plus its frontier record and votes; the verdict is
//! the conjunction. The session forwards the verdict through the
//! `accept_url` hook, which gets the last word.

use regex::Regex;
use webtrawl_core::{UrlInfo, UrlRecord};

/// Outcome of running the filter chain on one URL.
#[derive(Debug, Clone)]
pub struct FilterVerdict {
    pub verdict: bool,
    pub passed: Vec<&'static str>,
    pub failed: Vec<&'static str>,
}

pub trait UrlFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn test(&self, info: &UrlInfo, record: &UrlRecord) -> bool;
}

pub struct FetchRule {
    filters: Vec<Box<dyn UrlFilter>>,
}

impl FetchRule {
    pub fn new(filters: Vec<Box<dyn UrlFilter>>) -> Self {
        Self { filters }
    }

    /// Run every filter; the URL is fetched only if all pass.
    pub fn test(&self, info: &UrlInfo, record: &UrlRecord) -> FilterVerdict {
        let mut passed = Vec::new();
        let mut failed = Vec::new();
        for filter in &self.filters {
            if filter.test(info, record) {
                passed.push(filter.name());
            } else {
                failed.push(filter.name());
            }
        }
        FilterVerdict {
            verdict: failed.is_empty(),
            passed,
            failed,
        }
    }
}

/// Protocol allowlist: http/https always; ftp only when followed from a
/// page (`--follow-ftp`) or named directly as a seed.
pub struct SchemeFilter {
    pub follow_ftp: bool,
}

impl UrlFilter for SchemeFilter {
    fn name(&self) -> &'static str {
        "scheme"
    }

    fn test(&self, info: &UrlInfo, record: &UrlRecord) -> bool {
        match info.scheme() {
            "http" | "https" => true,
            "ftp" => self.follow_ftp || record.level == 0,
            _ => false,
        }
    }
}

/// Reject items that already failed `max_tries` times.
pub struct TriesFilter {
    pub max_tries: u32,
}

impl UrlFilter for TriesFilter {
    fn name(&self) -> &'static str {
        "tries"
    }

    fn test(&self, _info: &UrlInfo, record: &UrlRecord) -> bool {
        record.try_count < self.max_tries
    }
}

/// Recursion depth cap (`-l`).
pub struct LevelFilter {
    pub max_level: Option<u32>,
}

impl UrlFilter for LevelFilter {
    fn name(&self) -> &'static str {
        "level"
    }

    fn test(&self, _info: &UrlInfo, record: &UrlRecord) -> bool {
        match self.max_level {
            Some(max) => record.level <= max,
            None => true,
        }
    }
}

/// Stay on the seed hosts unless `-H` spans.
pub struct SpanHostsFilter {
    pub seed_hosts: Vec<String>,
    pub enabled: bool,
}

impl UrlFilter for SpanHostsFilter {
    fn name(&self) -> &'static str {
        "span_hosts"
    }

    fn test(&self, info: &UrlInfo, _record: &UrlRecord) -> bool {
        if self.enabled {
            return true;
        }
        self.seed_hosts.iter().any(|host| host == info.host())
    }
}

/// `-D` / `--exclude-domains`: hostname suffix match on dot boundaries.
pub struct DomainFilter {
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}

impl UrlFilter for DomainFilter {
    fn name(&self) -> &'static str {
        "domain"
    }

    fn test(&self, info: &UrlInfo, _record: &UrlRecord) -> bool {
        let host = info.host();
        if self
            .rejected
            .iter()
            .any(|domain| domain_matches(host, domain))
        {
            return false;
        }
        if self.accepted.is_empty() {
            return true;
        }
        self.accepted
            .iter()
            .any(|domain| domain_matches(host, domain))
    }
}

/// `--hostnames` / `--exclude-hostnames`: exact hostname match.
pub struct HostnameFilter {
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
}

impl UrlFilter for HostnameFilter {
    fn name(&self) -> &'static str {
        "hostname"
    }

    fn test(&self, info: &UrlInfo, _record: &UrlRecord) -> bool {
        let host = info.host();
        if self.rejected.iter().any(|candidate| candidate == host) {
            return false;
        }
        if self.accepted.is_empty() {
            return true;
        }
        self.accepted.iter().any(|candidate| candidate == host)
    }
}

/// `-I` / `-X`: path prefix include/exclude.
pub struct DirectoryFilter {
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
}

fn dir_matches(path: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    path.starts_with(&format!("{dir}/")) || path == dir
}

impl UrlFilter for DirectoryFilter {
    fn name(&self) -> &'static str {
        "directory"
    }

    fn test(&self, info: &UrlInfo, _record: &UrlRecord) -> bool {
        let path = info.path();
        if self.rejected.iter().any(|dir| dir_matches(path, dir)) {
            return false;
        }
        if self.accepted.is_empty() {
            return true;
        }
        self.accepted.iter().any(|dir| dir_matches(path, dir))
    }
}

/// `--accept-regex` / `--reject-regex` on the full URL string.
pub struct RegexFilter {
    pub accept: Option<Regex>,
    pub reject: Option<Regex>,
}

impl UrlFilter for RegexFilter {
    fn name(&self) -> &'static str {
        "regex"
    }

    fn test(&self, info: &UrlInfo, _record: &UrlRecord) -> bool {
        if let Some(reject) = &self.reject {
            if reject.is_match(info.url()) {
                return false;
            }
        }
        match &self.accept {
            Some(accept) => accept.is_match(info.url()),
            None => true,
        }
    }
}

/// `--no-parent`: the URL must live at or below one of the seed
/// directories on the same host. Page requisites are exempt, like Wget.
pub struct ParentFilter {
    /// `(host, directory)` pairs derived from the seeds.
    pub seed_dirs: Vec<(String, String)>,
}

impl UrlFilter for ParentFilter {
    fn name(&self) -> &'static str {
        "parent"
    }

    fn test(&self, info: &UrlInfo, record: &UrlRecord) -> bool {
        if record.inline {
            return true;
        }
        let mut saw_host = false;
        for (host, dir) in &self.seed_dirs {
            if host != info.host() {
                continue;
            }
            saw_host = true;
            if info.path().starts_with(dir.as_str()) {
                return true;
            }
        }
        // Other hosts are the span filter's concern.
        !saw_host
    }
}

/// `-L`: follow only URLs under the referrer's directory.
pub struct RelativeOnlyFilter;

impl UrlFilter for RelativeOnlyFilter {
    fn name(&self) -> &'static str {
        "relative_only"
    }

    fn test(&self, info: &UrlInfo, record: &UrlRecord) -> bool {
        let Some(referrer) = &record.referrer else {
            return true;
        };
        let Ok(parent) = UrlInfo::parse(referrer) else {
            return true;
        };
        parent.host() == info.host() && info.path().starts_with(parent.dir_path())
    }
}
