//! Writing fetched documents to disk.
//!
//! The path namer maps a URL onto a directory tree (optional scheme and
//! hostname segments, one directory per path segment, `index.html` for
//! directory URLs), escaping anything the local filesystem would choke
//! on. Writer sessions then decide what to do when the target already
//! exists: overwrite, skip, pick a fresh `.N` suffix, continue a partial
//! download, or only refetch when the server copy is newer.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;
use webtrawl_core::{Error, Result, UrlInfo};

use crate::client::{HttpRequest, HttpResponse};

/// Escaping profile for the target filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsType {
    Unix,
    Windows,
}

impl OsType {
    pub fn native() -> Self {
        if cfg!(windows) {
            OsType::Windows
        } else {
            OsType::Unix
        }
    }
}

/// Percent-escape one path component for safe storage.
///
/// Escapes `%`-ambiguity aside: path separators, ASCII control bytes and
/// C1 range, the Windows-reserved set on Windows, and non-ASCII bytes
/// when `ascii_only`. A Windows name may not end in a dot or space; the
/// final byte gets hex-escaped instead.
pub fn safe_filename(part: &str, os_type: OsType, ascii_only: bool) -> String {
    if part == "." {
        return "%2E".to_string();
    }
    if part == ".." {
        return "%2E%2E".to_string();
    }

    let mut bytes = Vec::with_capacity(part.len());
    for byte in part.bytes() {
        let escape = byte == b'/'
            || byte <= 0x1f
            || (ascii_only && byte > 0x7f)
            || (os_type == OsType::Windows && br#"\|:?"*<>"#.contains(&byte));
        if escape {
            bytes.extend_from_slice(format!("%{byte:02X}").as_bytes());
        } else {
            bytes.push(byte);
        }
    }
    let mut out = String::from_utf8_lossy(&bytes).into_owned();

    if os_type == OsType::Windows {
        if let Some(last) = out.chars().last() {
            if last == '.' || last == ' ' {
                out.pop();
                out.push_str(&format!("{:02X}", last as u32));
            }
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct PathNamer {
    pub root: PathBuf,
    /// Filename used when the URL path ends in `/`.
    pub index: String,
    /// Build a directory per URL path segment (`-x`).
    pub use_dir: bool,
    /// Leading path segments to drop (`--cut-dirs`).
    pub cut: u32,
    /// Include a scheme segment (`--protocol-directories`).
    pub include_protocol: bool,
    /// Include a hostname segment (inverse of `-nH`).
    pub include_hostname: bool,
    pub os_type: OsType,
    pub ascii_only: bool,
}

impl Default for PathNamer {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            index: "index.html".to_string(),
            use_dir: false,
            cut: 0,
            include_protocol: false,
            include_hostname: false,
            os_type: OsType::native(),
            ascii_only: true,
        }
    }
}

impl PathNamer {
    pub fn get_filename(&self, info: &UrlInfo) -> PathBuf {
        let mut path = self.root.clone();
        if self.use_dir {
            for part in self.dir_parts(info) {
                path.push(part);
            }
        }
        path.push(self.file_part(info));
        path
    }

    fn dir_parts(&self, info: &UrlInfo) -> Vec<String> {
        let mut parts = Vec::new();
        if self.include_protocol {
            parts.push(info.scheme().to_string());
        }
        if self.include_hostname {
            let mut host = info.host().to_string();
            let default_port = matches!(
                (info.scheme(), info.port()),
                ("http", 80) | ("https", 443) | ("ftp", 21)
            );
            if !default_port {
                let delim = if self.os_type == OsType::Windows {
                    '+'
                } else {
                    ':'
                };
                host.push(delim);
                host.push_str(&info.port().to_string());
            }
            parts.push(safe_filename(&host, self.os_type, self.ascii_only));
        }

        let segments: Vec<&str> = info
            .path()
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        // The final segment is the filename unless the path names a
        // directory outright.
        let dir_count = if info.path().ends_with('/') {
            segments.len()
        } else {
            segments.len().saturating_sub(1)
        };
        for segment in segments
            .into_iter()
            .take(dir_count)
            .skip(self.cut as usize)
        {
            parts.push(safe_filename(segment, self.os_type, self.ascii_only));
        }
        parts
    }

    fn file_part(&self, info: &UrlInfo) -> String {
        let last = info
            .path()
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty());
        let mut filename = match last {
            Some(segment) => safe_filename(segment, self.os_type, self.ascii_only),
            None => self.index.clone(),
        };
        if let Some(query) = info.query() {
            let delim = if self.os_type == OsType::Windows {
                '@'
            } else {
                '?'
            };
            filename.push(delim);
            filename.push_str(&safe_filename(query, self.os_type, self.ascii_only));
        }
        filename
    }
}

/// What to do when the target file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClobberMode {
    /// Save under `name.1`, `name.2`, ... (Wget default).
    #[default]
    AntiClobber,
    /// Replace the existing file.
    Overwrite,
    /// `--no-clobber`: do not fetch at all.
    SkipExisting,
    /// `--continue`: request the remaining byte range.
    Continue,
    /// `--timestamping`: refetch only when the server copy is newer.
    Timestamping,
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub namer: PathNamer,
    pub clobber: ClobberMode,
    /// Prepend the HTTP response header to the saved file.
    pub save_headers: bool,
    /// Stamp the file mtime from `Last-Modified`.
    pub local_timestamping: bool,
}

/// Per-URL writer state. `Writer::session()` hands one out per frontier
/// item; a `None` config is the null writer that stores nothing.
#[derive(Debug, Clone, Default)]
pub struct Writer {
    config: Option<WriterConfig>,
}

impl Writer {
    pub fn new(config: WriterConfig) -> Self {
        Self {
            config: Some(config),
        }
    }

    pub fn null() -> Self {
        Self { config: None }
    }

    pub fn session(&self) -> WriterSession {
        WriterSession {
            config: self.config.clone(),
            filename: None,
        }
    }
}

pub struct WriterSession {
    config: Option<WriterConfig>,
    filename: Option<PathBuf>,
}

impl WriterSession {
    /// Prepare the request for this item's target file. Returns false
    /// when the fetch should be skipped entirely (`--no-clobber` with an
    /// existing file).
    pub fn process_request(&mut self, request: &mut HttpRequest) -> Result<bool> {
        let Some(config) = &self.config else {
            return Ok(true);
        };
        if self.filename.is_none() {
            self.filename = Some(self.compute_filename(config, &request.info));
        }
        let filename = self.filename.clone().unwrap_or_default();

        match config.clobber {
            ClobberMode::SkipExisting if filename.exists() => {
                debug!(file = %filename.display(), "file exists, not refetching");
                return Ok(false);
            }
            ClobberMode::Continue => {
                if let Ok(meta) = std::fs::metadata(&filename) {
                    request.set_header("Range", format!("bytes={}-", meta.len()));
                }
            }
            ClobberMode::Timestamping => {
                if let Ok(meta) = std::fs::metadata(&filename) {
                    if let Ok(modified) = meta.modified() {
                        request.set_header(
                            "If-Modified-Since",
                            httpdate::fmt_http_date(modified),
                        );
                    }
                }
            }
            _ => {}
        }
        Ok(true)
    }

    fn compute_filename(&self, config: &WriterConfig, info: &UrlInfo) -> PathBuf {
        let base = config.namer.get_filename(info);
        if config.clobber != ClobberMode::AntiClobber || !base.exists() {
            return base;
        }
        // First taken name wins; everyone later gets the next free suffix.
        for suffix in 1u32.. {
            let candidate = PathBuf::from(format!("{}.{}", base.display(), suffix));
            if !candidate.exists() {
                return candidate;
            }
        }
        unreachable!()
    }

    /// Save a successful response body. Returns the path written.
    pub fn save_document(&mut self, response: &HttpResponse) -> Result<Option<PathBuf>> {
        let Some(config) = self.config.clone() else {
            return Ok(None);
        };
        let Some(filename) = self.filename.clone() else {
            return Ok(None);
        };

        // 304 means the local copy is current; leave it alone.
        if response.status == 304 {
            return Ok(Some(filename));
        }

        if let Some(parent) = filename.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::FileIo(format!("{}: {e}", parent.display())))?;
            }
        }

        let append = config.clobber == ClobberMode::Continue && response.status == 206;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&filename)
            .map_err(|e| Error::FileIo(format!("{}: {e}", filename.display())))?;

        if config.save_headers && !append {
            file.write_all(&response.wire_header())
                .map_err(|e| Error::FileIo(e.to_string()))?;
        }
        file.write_all(&response.body)
            .map_err(|e| Error::FileIo(e.to_string()))?;

        if config.local_timestamping {
            if let Some(value) = response.header("last-modified") {
                if let Ok(last_modified) = httpdate::parse_http_date(value) {
                    set_mtime(&file, last_modified);
                }
            }
        }

        debug!(file = %filename.display(), bytes = response.body.len(), "saved");
        Ok(Some(filename))
    }

    /// Write raw bytes (FTP data, listings) to this session's target.
    pub fn save_bytes(&mut self, info: &UrlInfo, body: &[u8]) -> Result<Option<PathBuf>> {
        let Some(config) = self.config.clone() else {
            return Ok(None);
        };
        if self.filename.is_none() {
            self.filename = Some(self.compute_filename(&config, info));
        }
        let filename = self.filename.clone().unwrap_or_default();
        if let Some(parent) = filename.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::FileIo(format!("{}: {e}", parent.display())))?;
            }
        }
        std::fs::write(&filename, body)
            .map_err(|e| Error::FileIo(format!("{}: {e}", filename.display())))?;
        Ok(Some(filename))
    }

    /// Byte offset to resume from, when `--continue` applies and a
    /// partial file exists. Used by the FTP session for `REST`.
    pub fn continue_offset(&mut self, info: &UrlInfo) -> Option<u64> {
        let config = self.config.clone()?;
        if config.clobber != ClobberMode::Continue {
            return None;
        }
        if self.filename.is_none() {
            self.filename = Some(self.compute_filename(&config, info));
        }
        std::fs::metadata(self.filename.as_ref()?)
            .ok()
            .map(|meta| meta.len())
    }

    /// Drop anything written for a response that turned out to be
    /// discardable (permanent error bodies).
    pub fn discard_document(&mut self) {
        if let Some(filename) = &self.filename {
            if filename.exists() {
                let _ = std::fs::remove_file(filename);
            }
        }
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }
}

fn set_mtime(file: &std::fs::File, time: SystemTime) {
    let times = std::fs::FileTimes::new().set_modified(time);
    if let Err(err) = file.set_times(times) {
        debug!(%err, "could not set file mtime");
    }
}
