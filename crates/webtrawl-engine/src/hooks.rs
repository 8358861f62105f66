//! Typed event registry for user callbacks.
//!
//! Each hook has at most one subscriber. Components guard dispatch with
//! the `is_*_connected` accessors; dispatching a disconnected hook is a
//! programming error and says so. Payloads cross the boundary as plain
//! snapshot structs so callbacks never see (or keep) engine internals.

use std::collections::BTreeMap;

use serde::Serialize;
use webtrawl_core::{Action, LinkType, UrlInfo, UrlRecord};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum HookError {
    #[error("hook already connected: {0}")]
    AlreadyConnected(&'static str),
    #[error("hook not connected: {0}")]
    NotConnected(&'static str),
}

#[derive(Debug, Clone, Serialize)]
pub struct UrlInfoSnapshot {
    pub url: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,
}

impl From<&UrlInfo> for UrlInfoSnapshot {
    fn from(info: &UrlInfo) -> Self {
        Self {
            url: info.url().to_string(),
            scheme: info.scheme().to_string(),
            host: info.host().to_string(),
            port: info.port(),
            path: info.path().to_string(),
            query: info.query().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterInfoSnapshot {
    pub verdict: bool,
    /// What produced this verdict: "filters", "robots", or "redirect".
    pub reason: String,
    pub passed: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseSnapshot {
    pub status_code: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body_len: u64,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSnapshot {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeSnapshot {
    pub inline_urls: Vec<String>,
    pub linked_urls: Vec<String>,
    pub encoding: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub duration_secs: f64,
    pub files: u64,
    pub bytes: u64,
    pub errors: BTreeMap<String, u64>,
}

/// A URL a callback wants enqueued.
#[derive(Debug, Clone)]
pub struct AddUrlRequest {
    pub url: String,
    pub inline: bool,
    pub link_type: Option<LinkType>,
    pub post_data: Option<Vec<u8>>,
    pub replace: bool,
}

/// `scrape_document` outcome: keep the scraped set, merge extra URLs
/// into it, or replace it outright.
#[derive(Debug, Clone)]
pub enum ScrapedAction {
    Normal,
    Merge(Vec<AddUrlRequest>),
    Replace(Vec<AddUrlRequest>),
}

type AcceptUrlFn =
    dyn Fn(&UrlInfoSnapshot, &UrlRecord, bool, &FilterInfoSnapshot) -> bool + Send + Sync;
type PreResponseFn = dyn Fn(&UrlInfoSnapshot, &ResponseSnapshot) -> Action + Send + Sync;
type ResponseFn =
    dyn Fn(&UrlInfoSnapshot, &UrlRecord, &ResponseSnapshot) -> Action + Send + Sync;
type ErrorFn = dyn Fn(&UrlInfoSnapshot, &UrlRecord, &ErrorSnapshot) -> Action + Send + Sync;
type ScrapeFn =
    dyn Fn(&UrlInfoSnapshot, &UrlRecord, &ScrapeSnapshot) -> ScrapedAction + Send + Sync;
type WaitTimeFn = dyn Fn(f64, Option<&UrlInfoSnapshot>) -> f64 + Send + Sync;
type EngineRunFn = dyn Fn() + Send + Sync;
type StatsFn = dyn Fn(&StatsSnapshot) + Send + Sync;
type ExitStatusFn = dyn Fn(i32) -> i32 + Send + Sync;

macro_rules! hook_slot {
    ($connect:ident, $is_connected:ident, $field:ident, $ty:ty, $name:literal) => {
        pub fn $connect(&mut self, callback: Box<$ty>) -> Result<(), HookError> {
            if self.$field.is_some() {
                return Err(HookError::AlreadyConnected($name));
            }
            self.$field = Some(callback);
            Ok(())
        }

        pub fn $is_connected(&self) -> bool {
            self.$field.is_some()
        }
    };
}

/// The event registry. Connect callbacks while building the application;
/// dispatch happens from sessions and the application loop.
#[derive(Default)]
pub struct HookBus {
    accept_url: Option<Box<AcceptUrlFn>>,
    handle_pre_response: Option<Box<PreResponseFn>>,
    handle_response: Option<Box<ResponseFn>>,
    handle_error: Option<Box<ErrorFn>>,
    scrape_document: Option<Box<ScrapeFn>>,
    wait_time: Option<Box<WaitTimeFn>>,
    engine_run: Option<Box<EngineRunFn>>,
    finishing_statistics: Option<Box<StatsFn>>,
    exit_status: Option<Box<ExitStatusFn>>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    hook_slot!(
        connect_accept_url,
        is_accept_url_connected,
        accept_url,
        AcceptUrlFn,
        "accept_url"
    );
    hook_slot!(
        connect_handle_pre_response,
        is_handle_pre_response_connected,
        handle_pre_response,
        PreResponseFn,
        "handle_pre_response"
    );
    hook_slot!(
        connect_handle_response,
        is_handle_response_connected,
        handle_response,
        ResponseFn,
        "handle_response"
    );
    hook_slot!(
        connect_handle_error,
        is_handle_error_connected,
        handle_error,
        ErrorFn,
        "handle_error"
    );
    hook_slot!(
        connect_scrape_document,
        is_scrape_document_connected,
        scrape_document,
        ScrapeFn,
        "scrape_document"
    );
    hook_slot!(
        connect_wait_time,
        is_wait_time_connected,
        wait_time,
        WaitTimeFn,
        "wait_time"
    );
    hook_slot!(
        connect_engine_run,
        is_engine_run_connected,
        engine_run,
        EngineRunFn,
        "engine_run"
    );
    hook_slot!(
        connect_finishing_statistics,
        is_finishing_statistics_connected,
        finishing_statistics,
        StatsFn,
        "finishing_statistics"
    );
    hook_slot!(
        connect_exit_status,
        is_exit_status_connected,
        exit_status,
        ExitStatusFn,
        "exit_status"
    );

    pub fn dispatch_accept_url(
        &self,
        info: &UrlInfoSnapshot,
        record: &UrlRecord,
        verdict: bool,
        filters: &FilterInfoSnapshot,
    ) -> Result<bool, HookError> {
        let hook = self
            .accept_url
            .as_ref()
            .ok_or(HookError::NotConnected("accept_url"))?;
        Ok(hook(info, record, verdict, filters))
    }

    pub fn dispatch_handle_pre_response(
        &self,
        info: &UrlInfoSnapshot,
        response: &ResponseSnapshot,
    ) -> Result<Action, HookError> {
        let hook = self
            .handle_pre_response
            .as_ref()
            .ok_or(HookError::NotConnected("handle_pre_response"))?;
        Ok(hook(info, response))
    }

    pub fn dispatch_handle_response(
        &self,
        info: &UrlInfoSnapshot,
        record: &UrlRecord,
        response: &ResponseSnapshot,
    ) -> Result<Action, HookError> {
        let hook = self
            .handle_response
            .as_ref()
            .ok_or(HookError::NotConnected("handle_response"))?;
        Ok(hook(info, record, response))
    }

    pub fn dispatch_handle_error(
        &self,
        info: &UrlInfoSnapshot,
        record: &UrlRecord,
        error: &ErrorSnapshot,
    ) -> Result<Action, HookError> {
        let hook = self
            .handle_error
            .as_ref()
            .ok_or(HookError::NotConnected("handle_error"))?;
        Ok(hook(info, record, error))
    }

    pub fn dispatch_scrape_document(
        &self,
        info: &UrlInfoSnapshot,
        record: &UrlRecord,
        scrape: &ScrapeSnapshot,
    ) -> Result<ScrapedAction, HookError> {
        let hook = self
            .scrape_document
            .as_ref()
            .ok_or(HookError::NotConnected("scrape_document"))?;
        Ok(hook(info, record, scrape))
    }

    pub fn dispatch_wait_time(
        &self,
        seconds: f64,
        info: Option<&UrlInfoSnapshot>,
    ) -> Result<f64, HookError> {
        let hook = self
            .wait_time
            .as_ref()
            .ok_or(HookError::NotConnected("wait_time"))?;
        Ok(hook(seconds, info))
    }

    pub fn dispatch_engine_run(&self) -> Result<(), HookError> {
        let hook = self
            .engine_run
            .as_ref()
            .ok_or(HookError::NotConnected("engine_run"))?;
        hook();
        Ok(())
    }

    pub fn dispatch_finishing_statistics(&self, stats: &StatsSnapshot) -> Result<(), HookError> {
        let hook = self
            .finishing_statistics
            .as_ref()
            .ok_or(HookError::NotConnected("finishing_statistics"))?;
        hook(stats);
        Ok(())
    }

    pub fn dispatch_exit_status(&self, code: i32) -> Result<i32, HookError> {
        let hook = self
            .exit_status
            .as_ref()
            .ok_or(HookError::NotConnected("exit_status"))?;
        Ok(hook(code))
    }
}
