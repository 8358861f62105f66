//! WARC archive output.
//!
//! One `warcinfo` record at the head of the file, then a paired
//! `request`/`response` record per fetch carrying the wire bytes, the
//! response linked to its request via `WARC-Concurrent-To`. By default
//! every record is its own gzip member, which is what replay tooling
//! expects of a `.warc.gz`.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::write::GzEncoder;
use flate2::Compression;
use rand::RngCore;
use webtrawl_core::{Error, Result};

const WARC_VERSION: &str = "WARC/1.0";

pub struct WarcWriter {
    file: std::fs::File,
    path: PathBuf,
    compress: bool,
}

impl WarcWriter {
    /// Create the archive and write the `warcinfo` record.
    /// `extra_fields` come from `--warc-header`.
    pub fn create(
        path: &Path,
        compress: bool,
        extra_fields: &[(String, String)],
    ) -> Result<Self> {
        let file = std::fs::File::create(path)
            .map_err(|e| Error::FileIo(format!("{}: {e}", path.display())))?;
        let mut writer = Self {
            file,
            path: path.to_path_buf(),
            compress,
        };

        let mut info_body = format!(
            "software: webtrawl/{}\r\nformat: WARC File Format 1.0\r\n",
            env!("CARGO_PKG_VERSION")
        );
        for (name, value) in extra_fields {
            info_body.push_str(&format!("{name}: {value}\r\n"));
        }
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        writer.write_record(
            &[
                ("WARC-Type".to_string(), "warcinfo".to_string()),
                ("WARC-Record-ID".to_string(), new_record_id()),
                ("WARC-Date".to_string(), warc_date_now()),
                ("WARC-Filename".to_string(), filename),
                (
                    "Content-Type".to_string(),
                    "application/warc-fields".to_string(),
                ),
            ],
            info_body.as_bytes(),
        )?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the request/response pair for one completed fetch.
    pub fn write_capture(
        &mut self,
        target_uri: &str,
        request_bytes: &[u8],
        response_bytes: &[u8],
    ) -> Result<()> {
        let request_id = new_record_id();
        let response_id = new_record_id();
        let date = warc_date_now();

        self.write_record(
            &[
                ("WARC-Type".to_string(), "request".to_string()),
                ("WARC-Record-ID".to_string(), request_id.clone()),
                ("WARC-Date".to_string(), date.clone()),
                ("WARC-Target-URI".to_string(), target_uri.to_string()),
                ("WARC-Concurrent-To".to_string(), response_id.clone()),
                (
                    "Content-Type".to_string(),
                    "application/http;msgtype=request".to_string(),
                ),
            ],
            request_bytes,
        )?;
        self.write_record(
            &[
                ("WARC-Type".to_string(), "response".to_string()),
                ("WARC-Record-ID".to_string(), response_id),
                ("WARC-Date".to_string(), date),
                ("WARC-Target-URI".to_string(), target_uri.to_string()),
                ("WARC-Concurrent-To".to_string(), request_id),
                (
                    "Content-Type".to_string(),
                    "application/http;msgtype=response".to_string(),
                ),
            ],
            response_bytes,
        )
    }

    fn write_record(&mut self, headers: &[(String, String)], block: &[u8]) -> Result<()> {
        let mut record = format!("{WARC_VERSION}\r\n").into_bytes();
        for (name, value) in headers {
            record.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        record.extend_from_slice(format!("Content-Length: {}\r\n\r\n", block.len()).as_bytes());
        record.extend_from_slice(block);
        record.extend_from_slice(b"\r\n\r\n");

        if self.compress {
            let mut encoder = GzEncoder::new(&mut self.file, Compression::default());
            encoder
                .write_all(&record)
                .map_err(|e| Error::FileIo(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| Error::FileIo(e.to_string()))?;
        } else {
            self.file
                .write_all(&record)
                .map_err(|e| Error::FileIo(e.to_string()))?;
        }
        self.file
            .flush()
            .map_err(|e| Error::FileIo(e.to_string()))
    }
}

/// One record read back from an archive.
#[derive(Debug, Clone)]
pub struct WarcRecord {
    pub headers: Vec<(String, String)>,
    pub block: Vec<u8>,
}

impl WarcRecord {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Read every record of an archive, gzip or plain.
pub fn read_warc(path: &Path) -> Result<Vec<WarcRecord>> {
    let raw = std::fs::read(path).map_err(|e| Error::FileIo(format!("{}: {e}", path.display())))?;
    let data = if raw.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = flate2::read::MultiGzDecoder::new(raw.as_slice());
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| Error::Parser(format!("warc gzip: {e}")))?;
        out
    } else {
        raw
    };

    let mut records = Vec::new();
    let mut cursor = 0usize;
    while cursor < data.len() {
        let Some(head_end) = find(&data[cursor..], b"\r\n\r\n") else {
            break;
        };
        let head = &data[cursor..cursor + head_end];
        let head_text = String::from_utf8_lossy(head);
        let mut lines = head_text.lines();
        let version = lines.next().unwrap_or_default();
        if !version.starts_with("WARC/") {
            return Err(Error::Parser(format!("bad warc version line: {version}")));
        }
        let mut headers = Vec::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }
        let length: usize = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.parse().ok())
            .ok_or_else(|| Error::Parser("warc record without content-length".to_string()))?;

        let block_start = cursor + head_end + 4;
        let block_end = block_start + length;
        if block_end > data.len() {
            return Err(Error::Parser("truncated warc record".to_string()));
        }
        records.push(WarcRecord {
            headers,
            block: data[block_start..block_end].to_vec(),
        });
        // Skip the record separator.
        cursor = (block_end + 4).min(data.len());
    }
    Ok(records)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn new_record_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    // RFC 4122 version 4, variant 1.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    format!(
        "<urn:uuid:{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}>",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
    )
}

/// UTC timestamp in the `YYYY-MM-DDTHH:MM:SSZ` form WARC requires.
fn warc_date_now() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let days = secs / 86_400;
    let (year, month, day) = days_to_ymd(days);
    let rem = secs % 86_400;
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

// Howard Hinnant's civil_from_days.
fn days_to_ymd(days: u64) -> (i64, u32, u32) {
    let z = days as i64 + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = i64::from(yoe) + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}
