//! FTP fetches: a minimal passive-mode client and the session that
//! drives one frontier item through it.
//!
//! The control channel speaks USER/PASS, TYPE I, then EPSV (falling back
//! to PASV), REST when continuing a partial file, and RETR or LIST. Only
//! passive mode exists here; there is no active-mode path to advertise.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, error, info};
use webtrawl_core::{Error, LinkType, Result, Status, UrlInfo};

use crate::frontier::UpdateFields;
use crate::item::{ChildUrl, UrlItem};
use crate::result_rule::{ErrorVerdict, ResponseVerdict};
use crate::session::{accept_url_override, SessionContext};

#[derive(Debug, Clone)]
pub struct FtpReply {
    pub code: u16,
    pub text: String,
}

/// Outcome of one FTP transfer. Refusals the server expressed with a
/// reply code (550 and friends) land here, not in `Err`: the result rule
/// decides what they mean.
#[derive(Debug, Clone)]
pub struct FtpFetch {
    pub code: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FtpClient {
    pub timeout: Duration,
}

impl Default for FtpClient {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

struct ControlChannel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl ControlChannel {
    async fn read_reply(&mut self) -> Result<FtpReply> {
        let mut text = String::new();
        let mut code: Option<u16> = None;
        loop {
            let mut line = String::new();
            let read = tokio::time::timeout(self.timeout, self.reader.read_line(&mut line))
                .await
                .map_err(|_| Error::NetworkTimedOut("ftp control read".to_string()))?
                .map_err(Error::from_io_net)?;
            if read == 0 {
                return Err(Error::Protocol("ftp control channel closed".to_string()));
            }
            let line = line.trim_end();
            if line.len() < 3 || !line.is_char_boundary(3) {
                return Err(Error::Protocol(format!("short ftp reply: {line:?}")));
            }
            let this_code: u16 = line[..3]
                .parse()
                .map_err(|_| Error::Protocol(format!("bad ftp reply: {line:?}")))?;
            text.push_str(line);
            text.push('\n');

            match code {
                None => {
                    if line.as_bytes().get(3) == Some(&b'-') {
                        // Multiline reply; read until "NNN ".
                        code = Some(this_code);
                    } else {
                        return Ok(FtpReply {
                            code: this_code,
                            text,
                        });
                    }
                }
                Some(first) => {
                    if this_code == first && line.as_bytes().get(3) == Some(&b' ') {
                        return Ok(FtpReply {
                            code: this_code,
                            text,
                        });
                    }
                }
            }
        }
    }

    async fn command(&mut self, command: &str) -> Result<FtpReply> {
        debug!(command, "ftp");
        let line = format!("{command}\r\n");
        tokio::time::timeout(self.timeout, self.writer.write_all(line.as_bytes()))
            .await
            .map_err(|_| Error::NetworkTimedOut("ftp control write".to_string()))?
            .map_err(Error::from_io_net)?;
        self.read_reply().await
    }
}

impl FtpClient {
    /// Run one transfer: `RETR` for files, `LIST` for directories.
    pub async fn fetch(
        &self,
        info: &UrlInfo,
        restart: Option<u64>,
        list: bool,
    ) -> Result<FtpFetch> {
        let addr = self.resolve(info).await?;
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::NetworkTimedOut(format!("connect {addr}")))?
            .map_err(Error::from_io_net)?;
        let peer_ip = stream.peer_addr().map_err(Error::from_io_net)?.ip();
        let (read_half, write_half) = stream.into_split();
        let mut control = ControlChannel {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout: self.timeout,
        };

        let greeting = control.read_reply().await?;
        if greeting.code != 220 {
            return Err(Error::Protocol(format!(
                "unexpected ftp greeting: {}",
                greeting.code
            )));
        }

        self.login(&mut control, info).await?;

        let type_reply = control.command("TYPE I").await?;
        if type_reply.code != 200 {
            return Err(Error::Protocol(format!(
                "TYPE I refused: {}",
                type_reply.code
            )));
        }

        let data_addr = self.open_passive(&mut control, peer_ip).await?;
        let data_stream = tokio::time::timeout(self.timeout, TcpStream::connect(data_addr))
            .await
            .map_err(|_| Error::NetworkTimedOut(format!("data connect {data_addr}")))?
            .map_err(Error::from_io_net)?;

        if let Some(offset) = restart.filter(|offset| *offset > 0 && !list) {
            let rest = control.command(&format!("REST {offset}")).await?;
            if rest.code != 350 {
                debug!(code = rest.code, "REST refused, fetching from start");
            }
        }

        let path = percent_decoded_path(info);
        let command = if list {
            format!("LIST {path}")
        } else {
            format!("RETR {path}")
        };
        let transfer = control.command(&command).await?;
        if !(transfer.code == 125 || transfer.code == 150) {
            // The server declined before opening the transfer.
            return Ok(FtpFetch {
                code: transfer.code,
                data: Vec::new(),
            });
        }

        let data = self.read_data(data_stream).await?;
        let done = control.read_reply().await?;
        let _ = control.command("QUIT").await;

        Ok(FtpFetch {
            code: done.code,
            data,
        })
    }

    async fn resolve(&self, info: &UrlInfo) -> Result<SocketAddr> {
        let target = (info.host().to_string(), info.port());
        let mut addrs = tokio::net::lookup_host(target)
            .await
            .map_err(|e| Error::DnsNotFound(format!("{}: {e}", info.host())))?;
        addrs
            .next()
            .ok_or_else(|| Error::DnsNotFound(info.host().to_string()))
    }

    async fn login(&self, control: &mut ControlChannel, info: &UrlInfo) -> Result<()> {
        let (user, password) = match info.userinfo() {
            Some(userinfo) => match userinfo.split_once(':') {
                Some((user, password)) => (user.to_string(), password.to_string()),
                None => (userinfo.to_string(), String::new()),
            },
            None => ("anonymous".to_string(), "anonymous@".to_string()),
        };

        let user_reply = control.command(&format!("USER {user}")).await?;
        match user_reply.code {
            230 => Ok(()),
            331 => {
                let pass_reply = control.command(&format!("PASS {password}")).await?;
                if pass_reply.code == 230 {
                    Ok(())
                } else {
                    Err(Error::Authentication(format!(
                        "ftp login rejected: {}",
                        pass_reply.code
                    )))
                }
            }
            530 => Err(Error::Authentication("ftp login refused".to_string())),
            code => Err(Error::Protocol(format!("unexpected USER reply: {code}"))),
        }
    }

    /// EPSV first, PASV as fallback. The data address keeps the control
    /// connection's IP; only the port comes from the reply.
    async fn open_passive(
        &self,
        control: &mut ControlChannel,
        peer_ip: std::net::IpAddr,
    ) -> Result<SocketAddr> {
        let epsv = control.command("EPSV").await?;
        if epsv.code == 229 {
            if let Some(port) = parse_epsv_port(&epsv.text) {
                return Ok(SocketAddr::new(peer_ip, port));
            }
        }
        let pasv = control.command("PASV").await?;
        if pasv.code == 227 {
            if let Some(port) = parse_pasv_port(&pasv.text) {
                return Ok(SocketAddr::new(peer_ip, port));
            }
        }
        Err(Error::Protocol(format!(
            "no passive mode available (EPSV {}, PASV {})",
            epsv.code, pasv.code
        )))
    }

    async fn read_data(&self, mut stream: TcpStream) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let read = tokio::time::timeout(self.timeout, stream.read(&mut chunk))
                .await
                .map_err(|_| Error::NetworkTimedOut("ftp data read".to_string()))?
                .map_err(Error::from_io_net)?;
            if read == 0 {
                return Ok(data);
            }
            data.extend_from_slice(&chunk[..read]);
        }
    }
}

/// `229 Entering Extended Passive Mode (|||6446|)`
fn parse_epsv_port(text: &str) -> Option<u16> {
    let start = text.find("(|||")? + 4;
    let rest = &text[start..];
    let end = rest.find('|')?;
    rest[..end].parse().ok()
}

/// `227 Entering Passive Mode (127,0,0,1,25,46)`
fn parse_pasv_port(text: &str) -> Option<u16> {
    let start = text.find('(')? + 1;
    let end = text[start..].find(')')? + start;
    let fields: Vec<&str> = text[start..end].split(',').map(str::trim).collect();
    if fields.len() != 6 {
        return None;
    }
    let high: u16 = fields[4].parse().ok()?;
    let low: u16 = fields[5].parse().ok()?;
    Some(high * 256 + low)
}

fn percent_decoded_path(info: &UrlInfo) -> String {
    percent_encoding::percent_decode_str(info.path())
        .decode_utf8_lossy()
        .into_owned()
}

/// One parsed line of a `LIST` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Parse a directory listing, tolerating both `ls -l` style lines and
/// bare name-per-line output.
pub fn parse_listing(data: &[u8]) -> Vec<ListingEntry> {
    let text = String::from_utf8_lossy(data);
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with("total ") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let entry = if fields.len() >= 9
            && matches!(line.as_bytes()[0], b'd' | b'-' | b'l')
        {
            let name = fields[8..].join(" ");
            // Symlink lines carry "name -> target".
            let name = name
                .split(" -> ")
                .next()
                .unwrap_or(name.as_str())
                .to_string();
            ListingEntry {
                is_dir: line.starts_with('d'),
                name,
            }
        } else if fields.len() == 1 {
            ListingEntry {
                is_dir: line.ends_with('/'),
                name: line.trim_end_matches('/').to_string(),
            }
        } else {
            continue;
        };
        if entry.name == "." || entry.name == ".." || entry.name.is_empty() {
            continue;
        }
        entries.push(entry);
    }
    entries
}

/// Session variant for `ftp://` items. Shares the fetch rule, result
/// rule, waiter, writer, and statistics with the web session.
pub struct FtpSession<'a> {
    ctx: &'a SessionContext,
    client: FtpClient,
    item: &'a mut UrlItem,
}

impl<'a> FtpSession<'a> {
    pub fn new(ctx: &'a SessionContext, client: FtpClient, item: &'a mut UrlItem) -> Self {
        Self { ctx, client, item }
    }

    pub async fn process(mut self) -> Result<()> {
        let info = self.item.url_info().clone();

        let verdict = self.ctx.fetch_rule.test(&info, self.item.record());
        let allowed = accept_url_override(
            self.ctx,
            &info,
            self.item.record(),
            verdict.verdict,
            "filters",
            verdict.passed.iter().map(|name| name.to_string()).collect(),
            verdict.failed.iter().map(|name| name.to_string()).collect(),
        );
        if !allowed {
            debug!(url = %info, failed = ?verdict.failed, "rejected by filters");
            self.item.skip()?;
            return Ok(());
        }

        let list = info.path().ends_with('/')
            || self.item.record().link_type == Some(LinkType::Directory);
        let mut writer_session = self.ctx.writer.session();
        let restart = writer_session.continue_offset(&info);

        info!(url = %info, list, "fetching via ftp");
        match self.client.fetch(&info, restart, list).await {
            Ok(fetch) => {
                self.item.set_value(UpdateFields {
                    status_code: Some(fetch.code),
                    ..Default::default()
                })?;
                match self.ctx.result_rule.classify_ftp_reply(fetch.code) {
                    ResponseVerdict::Document => {
                        if let Some(path) = writer_session.save_bytes(&info, &fetch.data)? {
                            self.item.set_value(UpdateFields {
                                filename: Some(path.display().to_string()),
                                ..Default::default()
                            })?;
                        }
                        self.ctx.stats.increment(fetch.data.len() as u64);
                        if list {
                            self.enqueue_listing(&info, &fetch.data)?;
                        }
                        self.reset_waiter();
                        self.item.set_status(Status::Done)?;
                    }
                    ResponseVerdict::NoDocument => {
                        self.reset_waiter();
                        self.item.skip()?;
                    }
                    _ => {
                        self.bump_waiter();
                        self.ctx
                            .stats
                            .record_error(&Error::Server(format!("ftp {}", fetch.code)));
                        self.item.set_status(Status::Error)?;
                    }
                }
            }
            Err(err) => {
                error!(url = %info, %err, "ftp fetch failed");
                self.ctx.stats.record_error(&err);
                self.bump_waiter();
                match self.ctx.result_rule.classify_error(&err) {
                    ErrorVerdict::Skip => self.item.skip()?,
                    ErrorVerdict::Retry => self.item.set_status(Status::Error)?,
                }
            }
        }
        Ok(())
    }

    fn enqueue_listing(&mut self, info: &UrlInfo, data: &[u8]) -> Result<()> {
        if !self.ctx.config.recursive {
            return Ok(());
        }
        let mut children = Vec::new();
        for entry in parse_listing(data) {
            let relative = if entry.is_dir {
                format!("{}/", entry.name)
            } else {
                entry.name.clone()
            };
            match info.join(&relative) {
                Ok(child) => {
                    let link_type = if entry.is_dir {
                        LinkType::Directory
                    } else {
                        LinkType::File
                    };
                    children.push(ChildUrl::linked(child, Some(link_type)));
                }
                Err(err) => debug!(name = %entry.name, %err, "skipping unparsable entry"),
            }
        }
        if !children.is_empty() {
            self.item.add_child_urls(&children)?;
        }
        Ok(())
    }

    fn reset_waiter(&self) {
        self.ctx
            .waiter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();
    }

    fn bump_waiter(&self) {
        self.ctx
            .waiter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .increment();
    }
}
