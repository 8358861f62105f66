//! HTTP client used by web sessions.
//!
//! Thin wrapper over reqwest with automatic redirects turned off: the
//! session owns the redirect loop so every hop lands in the frontier and
//! the WARC. Transport failures are folded into the engine's error
//! taxonomy here, in one place.

use std::error::Error as _;
use std::time::Duration;

use futures_util::StreamExt;
use webtrawl_core::{Error, Result, UrlInfo};

/// One protocol request, kept simple enough to replay into a WARC record.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub info: UrlInfo,
    pub method: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn get(info: UrlInfo) -> Self {
        Self {
            info,
            method: "GET",
            headers: Vec::new(),
            body: None,
        }
    }

    /// POST with an `application/x-www-form-urlencoded` body.
    pub fn post(info: UrlInfo, body: Vec<u8>) -> Self {
        let mut request = Self {
            info,
            method: "POST",
            headers: Vec::new(),
            body: None,
        };
        request.set_header(
            "Content-Type",
            "application/x-www-form-urlencoded".to_string(),
        );
        request.set_header("Content-Length", body.len().to_string());
        request.body = Some(body);
        request
    }

    /// Set a header, replacing any existing value with the same name.
    pub fn set_header(&mut self, name: &str, value: String) {
        self.headers
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// HTTP/1.1 wire form of the request head, for the WARC `request`
    /// record.
    pub fn wire_format(&self) -> Vec<u8> {
        let mut target = self.info.path().to_string();
        if let Some(query) = self.info.query() {
            target.push('?');
            target.push_str(query);
        }
        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, target).into_bytes();
        let mut wrote_host = false;
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("host") {
                wrote_host = true;
            }
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if !wrote_host {
            out.extend_from_slice(format!("Host: {}\r\n", self.info.host()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// HTTP/1.1 wire form of the status line and headers, for the WARC
    /// `response` record and `--save-headers`.
    pub fn wire_header(&self) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub read_timeout: Option<Duration>,
    /// Whole-request ceiling, DNS to last body byte.
    pub timeout: Option<Duration>,
    /// Hard cap on bytes read from one body; `None` is unbounded.
    pub max_body: Option<u64>,
    /// Local address to bind sockets to. Binding to `0.0.0.0` or `::`
    /// doubles as the `-4`/`-6` family restriction.
    pub local_address: Option<std::net::IpAddr>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("webtrawl/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: None,
            timeout: Some(Duration::from_secs(900)),
            max_body: None,
            local_address: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    max_body: Option<u64>,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            // The session drives redirects itself.
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.connect_timeout);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(read_timeout) = config.read_timeout {
            builder = builder.read_timeout(read_timeout);
        }
        if let Some(local_address) = config.local_address {
            builder = builder.local_address(local_address);
        }
        let inner = builder
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(Self {
            inner,
            max_body: config.max_body,
        })
    }

    pub async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut builder = match request.method {
            "POST" => self.inner.post(request.info.url()),
            "HEAD" => self.inner.head(request.info.url()),
            _ => self.inner.get(request.info.url()),
        };
        for (name, value) in &request.headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                builder = builder.header(name, value);
            }
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let reason = response
            .status()
            .canonical_reason()
            .unwrap_or("Unknown")
            .to_string();
        let mut headers = Vec::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.push((name.as_str().to_string(), value.to_string()));
            }
        }

        let max_body = self.max_body.unwrap_or(u64::MAX) as usize;
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify_reqwest_error)?;
            let can_take = max_body.saturating_sub(body.len());
            if chunk.len() > can_take {
                body.extend_from_slice(&chunk[..can_take]);
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Ok(HttpResponse {
            status,
            reason,
            headers,
            body,
        })
    }
}

/// Fold a reqwest failure into the engine taxonomy. The interesting kinds
/// hide in the error source chain; the string checks are a fallback for
/// resolver and TLS errors that surface only as text.
fn classify_reqwest_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        return Error::NetworkTimedOut(err.to_string());
    }

    let mut source: Option<&(dyn std::error::Error + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    return Error::ConnectionRefused(err.to_string());
                }
                std::io::ErrorKind::TimedOut => {
                    return Error::NetworkTimedOut(err.to_string());
                }
                _ => {}
            }
        }
        source = cause.source();
    }

    let text = format!("{err:?}").to_ascii_lowercase();
    if text.contains("dns") || text.contains("failed to lookup address") {
        Error::DnsNotFound(err.to_string())
    } else if text.contains("certificate") || text.contains("handshake") || text.contains("tls") {
        Error::SslVerification(err.to_string())
    } else if err.is_connect() {
        Error::ConnectionRefused(err.to_string())
    } else {
        Error::Network(err.to_string())
    }
}
