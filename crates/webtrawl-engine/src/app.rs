//! Application run loop: pipeline series, signals, exit code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info};
use webtrawl_core::{Error, ExitStatus};

use crate::pipeline::PipelineSeries;
use crate::session::SessionContext;

/// Shared stop flags and the exit-code aggregator.
pub struct AppState {
    stopping: AtomicBool,
    force: AtomicBool,
    exit: Mutex<Option<ExitStatus>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    pub fn new() -> Self {
        Self {
            stopping: AtomicBool::new(false),
            force: AtomicBool::new(false),
            exit: Mutex::new(None),
        }
    }

    /// Cooperative stop; `force` additionally abandons in-flight work.
    pub fn stop(&self, force: bool) {
        self.stopping.store(true, Ordering::SeqCst);
        if force {
            self.force.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn is_force_stopping(&self) -> bool {
        self.force.load(Ordering::SeqCst)
    }

    /// Keep the highest-priority (numerically lowest) exit status.
    pub fn record_exit(&self, status: ExitStatus) {
        let mut exit = self.exit.lock().unwrap_or_else(|e| e.into_inner());
        *exit = Some(match *exit {
            Some(existing) => existing.min(status),
            None => status,
        });
    }

    pub fn exit_code(&self) -> Option<ExitStatus> {
        *self.exit.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct Application {
    series: PipelineSeries,
    ctx: Arc<SessionContext>,
    state: Arc<AppState>,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application").finish_non_exhaustive()
    }
}

impl Application {
    pub fn new(series: PipelineSeries, ctx: Arc<SessionContext>) -> Self {
        Self {
            series,
            ctx,
            state: Arc::new(AppState::new()),
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    /// Run every pipeline and return the process exit code.
    pub async fn run(&self) -> i32 {
        if self.ctx.hooks.is_engine_run_connected() {
            let _ = self.ctx.hooks.dispatch_engine_run();
        }
        self.install_signal_handlers();

        for pipeline in &self.series.pipelines {
            if self.state.is_stopping() {
                if pipeline.skippable() {
                    continue;
                }
                break;
            }
            match pipeline.run(&self.state).await {
                Ok(()) => {}
                Err(Error::HookStop) => {
                    self.state.stop(false);
                }
                Err(err) => {
                    error!(%err, "pipeline failed");
                    self.state.record_exit(ExitStatus::from_error(&err));
                    if !pipeline.skippable() {
                        break;
                    }
                }
            }
        }

        self.finish()
    }

    fn finish(&self) -> i32 {
        let stats = self.ctx.stats.snapshot();
        info!(
            duration_secs = stats.duration_secs,
            files = stats.files,
            bytes = stats.bytes,
            "finished"
        );
        if self.ctx.hooks.is_finishing_statistics_connected() {
            let _ = self.ctx.hooks.dispatch_finishing_statistics(&stats);
        }

        let mut worst = self.state.exit_code();
        if let Some(from_stats) = self.ctx.stats.worst_exit_status() {
            worst = Some(match worst {
                Some(existing) => existing.min(from_stats),
                None => from_stats,
            });
        }
        let mut code = worst.map(ExitStatus::code).unwrap_or(0);

        if code == ExitStatus::SslVerificationError.code() {
            info!("a TLS certificate could not be verified");
        }

        if self.ctx.hooks.is_exit_status_connected() {
            code = self.ctx.hooks.dispatch_exit_status(code).unwrap_or(code);
        }
        info!(code, "exiting");
        code
    }

    /// First SIGINT/SIGTERM asks for a cooperative stop; a second one
    /// abandons outstanding sessions.
    fn install_signal_handlers(&self) {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut received = 0u32;
            loop {
                wait_for_signal().await;
                received += 1;
                if received == 1 {
                    info!("interrupt: finishing in-flight items (again to force)");
                    state.stop(false);
                } else {
                    info!("forced stop");
                    state.stop(true);
                    break;
                }
            }
        });
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
