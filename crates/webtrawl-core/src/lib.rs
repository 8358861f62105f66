use serde::{Deserialize, Serialize};

pub mod url_info;

pub use url_info::UrlInfo;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("database error: {0}")]
    Database(String),
    #[error("no matching row")]
    NotFound,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("dns lookup failed: {0}")]
    DnsNotFound(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("operation timed out: {0}")]
    NetworkTimedOut(String),
    #[error("ssl verification failed: {0}")]
    SslVerification(String),
    #[error("file io error: {0}")]
    FileIo(String),
    #[error("parser error: {0}")]
    Parser(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("stop requested by hook")]
    HookStop,
}

impl Error {
    /// Stable kind name used for statistics keys and hook payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Database(_) => "database",
            Error::NotFound => "not_found",
            Error::Protocol(_) => "protocol",
            Error::Server(_) => "server",
            Error::ConnectionRefused(_) => "connection_refused",
            Error::DnsNotFound(_) => "dns_not_found",
            Error::Network(_) => "network",
            Error::NetworkTimedOut(_) => "network_timed_out",
            Error::SslVerification(_) => "ssl_verification",
            Error::FileIo(_) => "file_io",
            Error::Parser(_) => "parser",
            Error::Authentication(_) => "authentication",
            Error::HookStop => "hook_stop",
        }
    }
}

impl Error {
    /// Classify an I/O failure that happened on a socket. Anything not
    /// specifically recognizable is a network error, never file I/O.
    pub fn from_io_net(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => Error::ConnectionRefused(err.to_string()),
            std::io::ErrorKind::TimedOut => Error::NetworkTimedOut(err.to_string()),
            _ => Error::Network(err.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => Error::ConnectionRefused(err.to_string()),
            std::io::ErrorKind::TimedOut => Error::NetworkTimedOut(err.to_string()),
            _ => Error::FileIo(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Process exit codes, Wget-compatible.
///
/// Lower codes win when several error classes were seen during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum ExitStatus {
    Ok = 0,
    GenericError = 1,
    ParserError = 2,
    FileIoError = 3,
    NetworkFailure = 4,
    SslVerificationError = 5,
    AuthenticationFailure = 6,
    ProtocolError = 7,
    ServerError = 8,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Server(_) => ExitStatus::ServerError,
            Error::Protocol(_) | Error::HookStop => ExitStatus::ProtocolError,
            Error::SslVerification(_) => ExitStatus::SslVerificationError,
            Error::Authentication(_) => ExitStatus::AuthenticationFailure,
            Error::DnsNotFound(_)
            | Error::ConnectionRefused(_)
            | Error::Network(_)
            | Error::NetworkTimedOut(_) => ExitStatus::NetworkFailure,
            Error::FileIo(_) | Error::Database(_) => ExitStatus::FileIoError,
            Error::Parser(_) => ExitStatus::ParserError,
            Error::NotFound => ExitStatus::GenericError,
        }
    }
}

/// Frontier row lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Todo,
    InProgress,
    Done,
    Error,
    Skipped,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Todo => "todo",
            Status::InProgress => "in_progress",
            Status::Done => "done",
            Status::Error => "error",
            Status::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "todo" => Some(Status::Todo),
            "in_progress" => Some(Status::InProgress),
            "done" => Some(Status::Done),
            "error" => Some(Status::Error),
            "skipped" => Some(Status::Skipped),
            _ => None,
        }
    }

    /// Terminal statuses never return to the dispatch queue on their own.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Skipped)
    }
}

/// Coarse classification of a discovered link, used for filtering and
/// writer/extractor choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Html,
    Css,
    Javascript,
    Media,
    Sitemap,
    File,
    Directory,
}

impl LinkType {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkType::Html => "html",
            LinkType::Css => "css",
            LinkType::Javascript => "javascript",
            LinkType::Media => "media",
            LinkType::Sitemap => "sitemap",
            LinkType::File => "file",
            LinkType::Directory => "directory",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "html" => Some(LinkType::Html),
            "css" => Some(LinkType::Css),
            "javascript" => Some(LinkType::Javascript),
            "media" => Some(LinkType::Media),
            "sitemap" => Some(LinkType::Sitemap),
            "file" => Some(LinkType::File),
            "directory" => Some(LinkType::Directory),
            _ => None,
        }
    }
}

/// One row of the URL frontier.
///
/// Immutable snapshot: mutations go through the frontier so that every
/// change is durable before anything acts on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRecord {
    pub url: String,
    pub status: Status,
    pub try_count: u32,
    pub level: u32,
    pub top_url: Option<String>,
    pub status_code: Option<u16>,
    pub referrer: Option<String>,
    pub inline: bool,
    pub link_type: Option<LinkType>,
    pub url_encoding: Option<String>,
    pub post_data: Option<Vec<u8>>,
    pub filename: Option<String>,
}

impl UrlRecord {
    pub fn new_todo(url: &str) -> Self {
        Self {
            url: url.to_string(),
            status: Status::Todo,
            try_count: 0,
            level: 0,
            top_url: None,
            status_code: None,
            referrer: None,
            inline: false,
            link_type: None,
            url_encoding: None,
            post_data: None,
            filename: None,
        }
    }
}

/// What a hook callback asks the session to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Use the built-in logic.
    Normal,
    /// Retry the current request.
    Retry,
    /// Mark the item done and move on.
    Finish,
    /// Unwind the pipeline and shut down.
    Stop,
}
