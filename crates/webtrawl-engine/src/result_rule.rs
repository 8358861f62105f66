//! Outcome classification for completed fetch attempts.

use webtrawl_core::Error;

/// Status codes that carry a document worth saving.
pub const DOCUMENT_STATUS_CODES: &[u16] = &[200, 206, 304];

/// Status codes that are permanent: the server answered, the answer is
/// final, retrying will not help.
pub const NO_DOCUMENT_STATUS_CODES: &[u16] = &[401, 403, 404, 405, 410];

/// What the session should do with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseVerdict {
    /// Save the body, scrape it, mark done.
    Document,
    /// Discard the body, mark skipped.
    NoDocument,
    /// Follow the Location header within the redirect budget.
    Redirect,
    /// Transient server failure; mark error and retry later.
    ServerError,
}

/// What the session should do with a request error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorVerdict {
    /// Permanent by policy; mark skipped.
    Skip,
    /// Transient; mark error and retry later.
    Retry,
}

#[derive(Debug, Clone, Default)]
pub struct ResultRule {
    /// `--retry-connrefused`: treat refused connections as transient.
    pub retry_connrefused: bool,
    /// `--retry-dns-error`: treat failed lookups as transient.
    pub retry_dns_error: bool,
}

impl ResultRule {
    pub fn classify_response(&self, status_code: u16) -> ResponseVerdict {
        if DOCUMENT_STATUS_CODES.contains(&status_code) {
            ResponseVerdict::Document
        } else if (300..400).contains(&status_code) {
            ResponseVerdict::Redirect
        } else if NO_DOCUMENT_STATUS_CODES.contains(&status_code) {
            ResponseVerdict::NoDocument
        } else {
            ResponseVerdict::ServerError
        }
    }

    /// FTP replies: 2xx completes, 550 family is the FTP spelling of
    /// "no such file", the 4xx family is transient.
    pub fn classify_ftp_reply(&self, reply_code: u16) -> ResponseVerdict {
        match reply_code {
            200..=299 => ResponseVerdict::Document,
            550..=559 => ResponseVerdict::NoDocument,
            _ => ResponseVerdict::ServerError,
        }
    }

    pub fn classify_error(&self, error: &Error) -> ErrorVerdict {
        match error {
            Error::ConnectionRefused(_) if !self.retry_connrefused => ErrorVerdict::Skip,
            Error::DnsNotFound(_) if !self.retry_dns_error => ErrorVerdict::Skip,
            _ => ErrorVerdict::Retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_codes_are_done() {
        let rule = ResultRule::default();
        for code in [200, 206, 304] {
            assert_eq!(rule.classify_response(code), ResponseVerdict::Document);
        }
    }

    #[test]
    fn permanent_codes_skip() {
        let rule = ResultRule::default();
        for code in [401, 403, 404, 405, 410] {
            assert_eq!(rule.classify_response(code), ResponseVerdict::NoDocument);
        }
    }

    #[test]
    fn redirects_and_server_errors() {
        let rule = ResultRule::default();
        assert_eq!(rule.classify_response(301), ResponseVerdict::Redirect);
        assert_eq!(rule.classify_response(500), ResponseVerdict::ServerError);
        assert_eq!(rule.classify_response(429), ResponseVerdict::ServerError);
    }

    #[test]
    fn refused_and_dns_skip_unless_opted_in() {
        let rule = ResultRule::default();
        assert_eq!(
            rule.classify_error(&Error::ConnectionRefused("x".into())),
            ErrorVerdict::Skip
        );
        assert_eq!(
            rule.classify_error(&Error::DnsNotFound("x".into())),
            ErrorVerdict::Skip
        );
        assert_eq!(
            rule.classify_error(&Error::NetworkTimedOut("x".into())),
            ErrorVerdict::Retry
        );

        let retrying = ResultRule {
            retry_connrefused: true,
            retry_dns_error: true,
        };
        assert_eq!(
            retrying.classify_error(&Error::ConnectionRefused("x".into())),
            ErrorVerdict::Retry
        );
        assert_eq!(
            retrying.classify_error(&Error::DnsNotFound("x".into())),
            ErrorVerdict::Retry
        );
    }

    #[test]
    fn ftp_replies() {
        let rule = ResultRule::default();
        assert_eq!(rule.classify_ftp_reply(226), ResponseVerdict::Document);
        assert_eq!(rule.classify_ftp_reply(550), ResponseVerdict::NoDocument);
        assert_eq!(rule.classify_ftp_reply(421), ResponseVerdict::ServerError);
    }
}
