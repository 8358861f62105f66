//! Per-host robots.txt cache.
//!
//! Rules are fetched once per host and shared by every session. The slot
//! for a host is an async mutex over `Option<HostRules>`: the first
//! session to lock an empty slot performs the fetch while concurrent
//! sessions for the same host wait on the lock instead of issuing
//! duplicate robots requests.

use std::collections::HashMap;
use std::sync::Arc;

use texting_robots::Robot;
use tracing::{debug, warn};
use webtrawl_core::UrlInfo;

/// Parsed robots state for one host.
pub enum HostRules {
    AllowAll,
    Rules(Box<Robot>),
}

/// Cached answer for a URL without forcing a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotsVerdict {
    Allowed,
    Disallowed,
    /// Nothing cached yet; the session must fetch `/robots.txt` first.
    Unknown,
}

type Slot = Arc<tokio::sync::Mutex<Option<HostRules>>>;

pub struct RobotsPool {
    agent: String,
    slots: std::sync::Mutex<HashMap<String, Slot>>,
}

impl RobotsPool {
    pub fn new(agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            slots: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// The cache slot for a host. Lock it to read or fill the rules;
    /// holding the lock across the fetch is what makes the fetch
    /// single-flight.
    pub fn slot(&self, host_key: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slots.entry(host_key.to_string()).or_default())
    }

    /// Answer from the cache only; never blocks on an in-flight fetch.
    pub fn cached_verdict(&self, info: &UrlInfo) -> RobotsVerdict {
        let slot = self.slot(&info.host_key());
        let verdict = match slot.try_lock() {
            Ok(guard) => match guard.as_ref() {
                Some(rules) => self.evaluate(rules, info),
                None => RobotsVerdict::Unknown,
            },
            // Another session is fetching right now.
            Err(_) => RobotsVerdict::Unknown,
        };
        verdict
    }

    pub fn evaluate(&self, rules: &HostRules, info: &UrlInfo) -> RobotsVerdict {
        match rules {
            HostRules::AllowAll => RobotsVerdict::Allowed,
            HostRules::Rules(robot) => {
                if robot.allowed(info.url()) {
                    RobotsVerdict::Allowed
                } else {
                    RobotsVerdict::Disallowed
                }
            }
        }
    }

    /// Fold a completed robots.txt fetch into host rules.
    ///
    /// 2xx parses the body (an unparsable file allows everything, matching
    /// the crawler convention of failing open). 4xx means no robots policy
    /// exists. Server errors also fail open, with a warning, so one broken
    /// host does not stall its whole crawl.
    pub fn rules_from_response(&self, host_key: &str, status: u16, body: &[u8]) -> HostRules {
        match status {
            200..=299 => match Robot::new(&self.agent, body) {
                Ok(robot) => {
                    debug!(host = host_key, "parsed robots.txt");
                    HostRules::Rules(Box::new(robot))
                }
                Err(err) => {
                    warn!(host = host_key, %err, "unparsable robots.txt, allowing");
                    HostRules::AllowAll
                }
            },
            400..=499 => HostRules::AllowAll,
            _ => {
                warn!(
                    host = host_key,
                    status, "robots.txt fetch failed, allowing"
                );
                HostRules::AllowAll
            }
        }
    }

    /// Rules for a host whose robots.txt could not be fetched at all.
    pub fn rules_from_failure(&self, host_key: &str) -> HostRules {
        warn!(host = host_key, "robots.txt unreachable, allowing");
        HostRules::AllowAll
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(url: &str) -> UrlInfo {
        UrlInfo::parse(url).unwrap()
    }

    #[test]
    fn disallow_rules_apply() {
        let pool = RobotsPool::new("webtrawl");
        let rules = pool.rules_from_response(
            "example.com:80",
            200,
            b"User-agent: *\nDisallow: /private/\n",
        );
        assert_eq!(
            pool.evaluate(&rules, &info("http://example.com/private/x")),
            RobotsVerdict::Disallowed
        );
        assert_eq!(
            pool.evaluate(&rules, &info("http://example.com/public")),
            RobotsVerdict::Allowed
        );
    }

    #[test]
    fn missing_robots_allows_everything() {
        let pool = RobotsPool::new("webtrawl");
        let rules = pool.rules_from_response("example.com:80", 404, b"");
        assert_eq!(
            pool.evaluate(&rules, &info("http://example.com/anything")),
            RobotsVerdict::Allowed
        );
    }

    #[test]
    fn server_error_fails_open() {
        let pool = RobotsPool::new("webtrawl");
        let rules = pool.rules_from_response("example.com:80", 503, b"");
        assert!(matches!(rules, HostRules::AllowAll));
    }

    #[tokio::test]
    async fn cache_round_trip_through_slot() {
        let pool = RobotsPool::new("webtrawl");
        let target = info("http://example.com/private/x");
        assert_eq!(pool.cached_verdict(&target), RobotsVerdict::Unknown);

        let slot = pool.slot(&target.host_key());
        {
            let mut guard = slot.lock().await;
            let rules = pool.rules_from_response(
                &target.host_key(),
                200,
                b"User-agent: *\nDisallow: /private/\n",
            );
            *guard = Some(rules);
        }
        assert_eq!(pool.cached_verdict(&target), RobotsVerdict::Disallowed);
        assert_eq!(
            pool.cached_verdict(&info("http://example.com/ok")),
            RobotsVerdict::Allowed
        );
        // Hosts are independent.
        assert_eq!(
            pool.cached_verdict(&info("http://other.com/private/x")),
            RobotsVerdict::Unknown
        );
    }
}
