//! The per-URL web session.
//!
//! One session drives one frontier item to a terminal status: filters,
//! robots consultation, the request itself, redirect hops, body capture,
//! link extraction, and outcome classification. Redirects stay inside
//! the session (the frontier never sees intermediate hops); everything
//! the session decides is written back through the item.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use webtrawl_core::{Action, Error, LinkType, Result, Status, UrlInfo, UrlRecord};

use crate::client::{HttpClient, HttpRequest, HttpResponse};
use crate::fetch_rule::FetchRule;
use crate::frontier::{AddDefaults, Frontier, UpdateFields};
use crate::hooks::{
    ErrorSnapshot, FilterInfoSnapshot, HookBus, ResponseSnapshot, ScrapeSnapshot, ScrapedAction,
    UrlInfoSnapshot,
};
use crate::item::{ChildUrl, UrlItem};
use crate::result_rule::{ErrorVerdict, ResponseVerdict, ResultRule};
use crate::robots::{RobotsPool, RobotsVerdict};
use crate::scrape::DocumentScraper;
use crate::stats::Statistics;
use crate::waiter::Waiter;
use crate::warc::WarcWriter;
use crate::writer::Writer;

/// Session knobs that come straight from the command line.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_redirects: u32,
    /// Enqueue linked pages (`-r`).
    pub recursive: bool,
    /// Enqueue inline resources even without `-r` (`-p`).
    pub page_requisites: bool,
    /// `--referer` override; otherwise the record's referrer is sent.
    pub referer_override: Option<String>,
    /// `--header` extras, applied to every request.
    pub extra_headers: Vec<(String, String)>,
    /// `--post-data`: global POST body when the record has none.
    pub post_data: Option<Vec<u8>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_redirects: 20,
            recursive: false,
            page_requisites: false,
            referer_override: None,
            extra_headers: Vec::new(),
            post_data: None,
        }
    }
}

/// Everything sessions share: protocol clients, rules, caches, sinks.
/// Built once per application run.
pub struct SessionContext {
    pub frontier: Arc<Frontier>,
    pub client: HttpClient,
    pub fetch_rule: FetchRule,
    pub result_rule: ResultRule,
    pub scraper: DocumentScraper,
    pub robots: Option<RobotsPool>,
    pub hooks: HookBus,
    pub stats: Arc<Statistics>,
    pub writer: Writer,
    pub warc: Option<std::sync::Mutex<WarcWriter>>,
    pub waiter: std::sync::Mutex<Waiter>,
    pub config: SessionConfig,
}

enum Step {
    /// Session reached a terminal status.
    Finished,
    /// Run another request, usually a redirect target.
    Continue(UrlInfo),
}

/// Send a fetch verdict through the `accept_url` hook. Every verdict is
/// offered, whatever produced it (`filters`, `robots`, `redirect`), and
/// the hook gets the last word; with no subscriber the verdict stands.
pub(crate) fn accept_url_override(
    ctx: &SessionContext,
    info: &UrlInfo,
    record: &UrlRecord,
    verdict: bool,
    reason: &str,
    passed: Vec<String>,
    failed: Vec<String>,
) -> bool {
    if !ctx.hooks.is_accept_url_connected() {
        return verdict;
    }
    let filters = FilterInfoSnapshot {
        verdict,
        reason: reason.to_string(),
        passed,
        failed,
    };
    ctx.hooks
        .dispatch_accept_url(&UrlInfoSnapshot::from(info), record, verdict, &filters)
        .unwrap_or(verdict)
}

pub struct WebSession<'a> {
    ctx: &'a SessionContext,
    item: &'a mut UrlItem,
    writer_session: crate::writer::WriterSession,
    visited: HashSet<UrlInfo>,
    redirects_left: u32,
}

impl<'a> WebSession<'a> {
    pub fn new(ctx: &'a SessionContext, item: &'a mut UrlItem) -> Self {
        let writer_session = ctx.writer.session();
        Self {
            ctx,
            item,
            writer_session,
            visited: HashSet::new(),
            redirects_left: ctx.config.max_redirects,
        }
    }

    /// Drive the item to a terminal status.
    pub async fn process(mut self) -> Result<()> {
        let mut next = self.item.url_info().clone();
        loop {
            match self.step(next).await? {
                Step::Finished => return Ok(()),
                Step::Continue(info) => next = info,
            }
        }
    }

    async fn step(&mut self, info: UrlInfo) -> Result<Step> {
        if !self.check_filters(&info)? {
            self.item.skip()?;
            return Ok(Step::Finished);
        }

        if self.needs_robots_check(&info) {
            if !self.check_robots(&info).await? {
                debug!(url = %info, "disallowed by robots.txt");
                self.item.skip()?;
                return Ok(Step::Finished);
            }
        }

        // A URL revisited within one session is a redirect cycle.
        if !self.visited.insert(info.clone()) {
            return self.finish_with_error(&Error::Protocol(format!(
                "redirect loop at {info}"
            )));
        }

        let mut request = self.build_request(&info);
        if !self.writer_session.process_request(&mut request)? {
            self.item.skip()?;
            return Ok(Step::Finished);
        }

        info!(url = %info, "fetching");
        match self.ctx.client.fetch(&request).await {
            Ok(response) => {
                info!(
                    url = %info,
                    status = response.status,
                    length = response.body.len(),
                    content_type = response.content_type().unwrap_or(""),
                    "fetched"
                );
                self.record_capture(&info, &request, &response);
                let step = self.handle_response(&info, &request, &response)?;
                self.apply_wait(&info).await;
                Ok(step)
            }
            Err(err) => {
                error!(url = %info, %err, "fetch failed");
                let step = self.handle_fetch_error(&info, &err)?;
                self.apply_wait(&info).await;
                Ok(step)
            }
        }
    }

    fn check_filters(&mut self, info: &UrlInfo) -> Result<bool> {
        let verdict = self.ctx.fetch_rule.test(info, self.item.record());
        let allowed = accept_url_override(
            self.ctx,
            info,
            self.item.record(),
            verdict.verdict,
            "filters",
            verdict.passed.iter().map(|name| name.to_string()).collect(),
            verdict.failed.iter().map(|name| name.to_string()).collect(),
        );

        if !allowed {
            debug!(
                url = %info,
                failed = ?verdict.failed,
                "rejected by filters"
            );
        }
        Ok(allowed)
    }

    fn needs_robots_check(&self, info: &UrlInfo) -> bool {
        self.ctx.robots.is_some()
            && matches!(info.scheme(), "http" | "https")
            && !info.path().eq_ignore_ascii_case("/robots.txt")
    }

    /// Consult the per-host robots cache, fetching `/robots.txt` first if
    /// this host has not been seen. The fetch is single-flight: parallel
    /// sessions for the host wait on the slot lock instead of refetching.
    async fn check_robots(&self, info: &UrlInfo) -> Result<bool> {
        let pool = self.ctx.robots.as_ref().expect("robots pool");
        let allowed = match pool.cached_verdict(info) {
            RobotsVerdict::Allowed => true,
            RobotsVerdict::Disallowed => false,
            RobotsVerdict::Unknown => {
                let slot = pool.slot(&info.host_key());
                let mut guard = slot.lock().await;
                if guard.is_none() {
                    *guard = Some(self.fetch_robots(pool, info).await?);
                }
                let rules = guard.as_ref().expect("rules just stored");
                pool.evaluate(rules, info) == RobotsVerdict::Allowed
            }
        };
        if allowed {
            return Ok(true);
        }
        // A robots denial is still offered to accept_url for override.
        Ok(accept_url_override(
            self.ctx,
            info,
            self.item.record(),
            false,
            "robots",
            Vec::new(),
            vec!["robots".to_string()],
        ))
    }

    async fn fetch_robots(
        &self,
        pool: &RobotsPool,
        info: &UrlInfo,
    ) -> Result<crate::robots::HostRules> {
        let robots_info = info.join("/robots.txt")?;
        let robots_url = robots_info.url().to_string();

        // The robots request gets its own frontier row so a resumed crawl
        // can account for it.
        self.ctx.frontier.add(
            &[robots_url.clone()],
            &AddDefaults {
                link_type: Some(LinkType::File),
                inline: Some(false),
                ..Default::default()
            },
        )?;

        let request = HttpRequest::get(robots_info.clone());
        match self.ctx.client.fetch(&request).await {
            Ok(response) => {
                info!(url = %robots_url, status = response.status, "fetched robots.txt");
                self.record_capture(&robots_info, &request, &response);
                self.ctx.frontier.update(
                    &robots_url,
                    false,
                    &UpdateFields {
                        status: Some(Status::Done),
                        status_code: Some(response.status),
                        ..Default::default()
                    },
                )?;
                Ok(pool.rules_from_response(&info.host_key(), response.status, &response.body))
            }
            Err(err) => {
                warn!(url = %robots_url, %err, "robots.txt fetch failed");
                self.ctx.stats.record_error(&err);
                self.ctx.frontier.update(
                    &robots_url,
                    true,
                    &UpdateFields {
                        status: Some(Status::Error),
                        ..Default::default()
                    },
                )?;
                Ok(pool.rules_from_failure(&info.host_key()))
            }
        }
    }

    fn build_request(&self, info: &UrlInfo) -> HttpRequest {
        let record = self.item.record();
        let post_data = record
            .post_data
            .clone()
            .or_else(|| self.ctx.config.post_data.clone());
        let mut request = match post_data {
            Some(body) => HttpRequest::post(info.clone(), body),
            None => HttpRequest::get(info.clone()),
        };

        if let Some(referer) = &self.ctx.config.referer_override {
            request.set_header("Referer", referer.clone());
        } else if let Some(referrer) = &record.referrer {
            request.set_header("Referer", referrer.clone());
        }
        for (name, value) in &self.ctx.config.extra_headers {
            request.set_header(name, value.clone());
        }
        request
    }

    fn record_capture(&self, info: &UrlInfo, request: &HttpRequest, response: &HttpResponse) {
        let Some(warc) = &self.ctx.warc else {
            return;
        };
        let mut response_bytes = response.wire_header();
        response_bytes.extend_from_slice(&response.body);
        let mut warc = warc.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = warc.write_capture(info.url(), &request.wire_format(), &response_bytes)
        {
            warn!(%err, "warc write failed");
            self.ctx.stats.record_error(&err);
        }
    }

    fn handle_response(
        &mut self,
        info: &UrlInfo,
        request: &HttpRequest,
        response: &HttpResponse,
    ) -> Result<Step> {
        self.item.set_value(UpdateFields {
            status_code: Some(response.status),
            ..Default::default()
        })?;

        let snapshot = response_snapshot(response, &self.writer_session);
        let info_snapshot = UrlInfoSnapshot::from(info);

        if self.ctx.hooks.is_handle_pre_response_connected() {
            let action = self
                .ctx
                .hooks
                .dispatch_handle_pre_response(&info_snapshot, &snapshot)
                .unwrap_or(Action::Normal);
            if let Some(step) = self.apply_action(action, info)? {
                return Ok(step);
            }
        }
        if self.ctx.hooks.is_handle_response_connected() {
            let action = self
                .ctx
                .hooks
                .dispatch_handle_response(&info_snapshot, self.item.record(), &snapshot)
                .unwrap_or(Action::Normal);
            if let Some(step) = self.apply_action(action, info)? {
                return Ok(step);
            }
        }

        match self.ctx.result_rule.classify_response(response.status) {
            ResponseVerdict::Redirect => self.handle_redirect(info, response),
            ResponseVerdict::Document => self.handle_document(info, request, response),
            ResponseVerdict::NoDocument => {
                self.writer_session.discard_document();
                self.reset_waiter();
                self.item.skip()?;
                Ok(Step::Finished)
            }
            ResponseVerdict::ServerError => {
                self.writer_session.discard_document();
                self.bump_waiter();
                self.ctx
                    .stats
                    .record_error(&Error::Server(format!("HTTP {}", response.status)));
                self.item.set_status(Status::Error)?;
                Ok(Step::Finished)
            }
        }
    }

    /// Map a hook action onto the state machine. `None` means fall
    /// through to the built-in classification.
    fn apply_action(&mut self, action: Action, info: &UrlInfo) -> Result<Option<Step>> {
        match action {
            Action::Normal => Ok(None),
            Action::Retry => {
                // Re-request the same URL; clear it from the loop set.
                self.visited.remove(info);
                Ok(Some(Step::Continue(info.clone())))
            }
            Action::Finish => {
                self.item.set_status(Status::Done)?;
                Ok(Some(Step::Finished))
            }
            Action::Stop => Err(Error::HookStop),
        }
    }

    fn handle_redirect(&mut self, info: &UrlInfo, response: &HttpResponse) -> Result<Step> {
        self.reset_waiter();
        if self.redirects_left == 0 {
            return self.finish_with_error(&Error::Protocol(format!(
                "too many redirects at {info}"
            )));
        }
        self.redirects_left -= 1;

        let Some(location) = response.header("location") else {
            return self.finish_with_error(&Error::Protocol(format!(
                "redirect without Location at {info}"
            )));
        };
        match info.join(location) {
            Ok(target) => {
                // The hook may veto following this hop.
                let follow = accept_url_override(
                    self.ctx,
                    &target,
                    self.item.record(),
                    true,
                    "redirect",
                    Vec::new(),
                    Vec::new(),
                );
                if !follow {
                    debug!(from = %info, to = %target, "redirect rejected by hook");
                    self.item.skip()?;
                    return Ok(Step::Finished);
                }
                debug!(from = %info, to = %target, "redirect");
                Ok(Step::Continue(target))
            }
            Err(_) => self.finish_with_error(&Error::Protocol(format!(
                "unparsable redirect target {location:?} at {info}"
            ))),
        }
    }

    fn handle_document(
        &mut self,
        info: &UrlInfo,
        request: &HttpRequest,
        response: &HttpResponse,
    ) -> Result<Step> {
        if let Some(path) = self.writer_session.save_document(response)? {
            self.item.set_value(UpdateFields {
                filename: Some(path.display().to_string()),
                ..Default::default()
            })?;
        }
        self.ctx.stats.increment(response.body.len() as u64);
        self.scrape_document(info, request, response)?;
        self.reset_waiter();
        self.item.set_status(Status::Done)?;
        Ok(Step::Finished)
    }

    fn scrape_document(
        &mut self,
        info: &UrlInfo,
        _request: &HttpRequest,
        response: &HttpResponse,
    ) -> Result<()> {
        let scrape = self.ctx.scraper.scrape(
            info,
            response.content_type(),
            self.item.record().link_type,
            &response.body,
        );

        let mut children: Vec<ChildUrl> = Vec::new();
        let mut snapshot = ScrapeSnapshot {
            inline_urls: Vec::new(),
            linked_urls: Vec::new(),
            encoding: "utf-8".to_string(),
        };
        if let Some(result) = &scrape {
            snapshot.encoding = result.encoding.clone();
            for context in &result.links {
                if context.inline {
                    snapshot.inline_urls.push(context.url.url().to_string());
                    if self.ctx.config.recursive || self.ctx.config.page_requisites {
                        children.push(ChildUrl::inline(context.url.clone(), context.link_type));
                    }
                }
                if context.linked {
                    snapshot.linked_urls.push(context.url.url().to_string());
                    if self.ctx.config.recursive {
                        children.push(ChildUrl::linked(context.url.clone(), context.link_type));
                    }
                }
            }
        }

        if self.ctx.hooks.is_scrape_document_connected() {
            let action = self
                .ctx
                .hooks
                .dispatch_scrape_document(
                    &UrlInfoSnapshot::from(info),
                    self.item.record(),
                    &snapshot,
                )
                .unwrap_or(ScrapedAction::Normal);
            match action {
                ScrapedAction::Normal => {}
                ScrapedAction::Merge(extra) => {
                    children.extend(requested_children(&extra));
                }
                ScrapedAction::Replace(replacement) => {
                    children = requested_children(&replacement);
                }
            }
        }

        if !children.is_empty() {
            let inline_count = children.iter().filter(|child| child.inline).count();
            debug!(
                url = %info,
                inline = inline_count,
                linked = children.len() - inline_count,
                "scraped document"
            );
            self.item.add_child_urls(&children)?;
        }
        Ok(())
    }

    fn handle_fetch_error(&mut self, info: &UrlInfo, err: &Error) -> Result<Step> {
        self.ctx.stats.record_error(err);
        self.bump_waiter();

        if self.ctx.hooks.is_handle_error_connected() {
            let action = self
                .ctx
                .hooks
                .dispatch_handle_error(
                    &UrlInfoSnapshot::from(info),
                    self.item.record(),
                    &ErrorSnapshot {
                        kind: err.kind().to_string(),
                        message: err.to_string(),
                    },
                )
                .unwrap_or(Action::Normal);
            if let Some(step) = self.apply_action(action, info)? {
                return Ok(step);
            }
        }

        match self.ctx.result_rule.classify_error(err) {
            ErrorVerdict::Skip => {
                self.item.skip()?;
            }
            ErrorVerdict::Retry => {
                self.item.set_status(Status::Error)?;
            }
        }
        Ok(Step::Finished)
    }

    /// An unrecoverable protocol condition: count it, mark the item.
    fn finish_with_error(&mut self, err: &Error) -> Result<Step> {
        error!(url = %self.item.record().url, %err, "session failed");
        self.ctx.stats.record_error(err);
        self.bump_waiter();
        self.item.set_status(Status::Error)?;
        Ok(Step::Finished)
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

    async fn apply_wait(&self, info: &UrlInfo) {
        let mut seconds = {
            let waiter = self.ctx.waiter.lock().unwrap_or_else(|e| e.into_inner());
            waiter.get().as_secs_f64()
        };
        if self.ctx.hooks.is_wait_time_connected() {
            seconds = self
                .ctx
                .hooks
                .dispatch_wait_time(seconds, Some(&UrlInfoSnapshot::from(info)))
                .unwrap_or(seconds);
        }
        if seconds > 0.0 {
            debug!(seconds, "waiting");
            tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        }
    }
}

fn response_snapshot(
    response: &HttpResponse,
    writer_session: &crate::writer::WriterSession,
) -> ResponseSnapshot {
    ResponseSnapshot {
        status_code: response.status,
        reason: response.reason.clone(),
        headers: response.headers.clone(),
        body_len: response.body.len() as u64,
        filename: writer_session
            .filename()
            .map(|path| path.display().to_string()),
    }
}

fn requested_children(requests: &[crate::hooks::AddUrlRequest]) -> Vec<ChildUrl> {
    let mut children = Vec::new();
    for request in requests {
        match UrlInfo::parse(&request.url) {
            Ok(info) => children.push(ChildUrl {
                info,
                inline: request.inline,
                link_type: request.link_type,
                post_data: request.post_data.clone(),
                replace: request.replace,
            }),
            Err(err) => {
                warn!(url = %request.url, %err, "hook supplied malformed url");
            }
        }
    }
    children
}
