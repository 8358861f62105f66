//! Bounded-concurrency item pipelines.
//!
//! A pipeline pulls items from its source and runs each through a list
//! of tasks; a semaphore caps how many items are in flight. The pipeline
//! completes when the source is dry and no worker is busy. A series runs
//! pipelines in order; `skippable` pipelines are passed over once the
//! application is stopping instead of aborting the run.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, error};
use webtrawl_core::{Error, ExitStatus, Result, Status};

use crate::app::AppState;
use crate::frontier::Frontier;
use crate::item::UrlItem;
use crate::processor::Processor;

/// How often an idle worker re-polls a dry source while others are busy.
const IDLE_POLL: Duration = Duration::from_millis(200);

#[async_trait]
pub trait Task<T: Send>: Send + Sync {
    async fn process(&self, item: &mut T) -> Result<()>;
}

#[async_trait]
pub trait ItemSource<T: Send>: Send + Sync {
    /// The next item to process, or `None` when currently dry.
    async fn next_item(&self) -> Result<Option<T>>;
}

/// What a pipeline does with an item whose task failed unexpectedly.
pub trait PipelineItem: Send + 'static {
    fn fail(&mut self, error: &Error);
}

impl PipelineItem for () {
    fn fail(&mut self, _error: &Error) {}
}

impl PipelineItem for UrlItem {
    fn fail(&mut self, _error: &Error) {
        if !self.is_processed() {
            if let Err(update_err) = self.set_status(Status::Error) {
                error!(%update_err, "could not record failed item");
            }
        }
    }
}

#[async_trait]
pub trait PipelineRunner: Send + Sync {
    fn skippable(&self) -> bool {
        false
    }
    async fn run(&self, state: &Arc<AppState>) -> Result<()>;
}

pub struct Pipeline<T: PipelineItem> {
    source: Arc<dyn ItemSource<T>>,
    tasks: Arc<Vec<Box<dyn Task<T>>>>,
    concurrency: usize,
    skippable: bool,
}

impl<T: PipelineItem> Pipeline<T> {
    pub fn new(
        source: Arc<dyn ItemSource<T>>,
        tasks: Vec<Box<dyn Task<T>>>,
        concurrency: usize,
    ) -> Self {
        Self {
            source,
            tasks: Arc::new(tasks),
            concurrency: concurrency.max(1),
            skippable: false,
        }
    }

    pub fn skippable(mut self) -> Self {
        self.skippable = true;
        self
    }
}

#[async_trait]
impl<T: PipelineItem> PipelineRunner for Pipeline<T> {
    fn skippable(&self) -> bool {
        self.skippable
    }

    async fn run(&self, state: &Arc<AppState>) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let busy = Arc::new(AtomicUsize::new(0));
        let mut workers = tokio::task::JoinSet::new();

        loop {
            if state.is_stopping() {
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed");

            match self.source.next_item().await {
                Err(err) => {
                    drop(permit);
                    return Err(err);
                }
                Ok(None) => {
                    drop(permit);
                    // Reap finished workers so busy reflects reality.
                    while workers.try_join_next().is_some() {}
                    if busy.load(Ordering::SeqCst) == 0 {
                        debug!("source dry and no worker busy, pipeline complete");
                        break;
                    }
                    tokio::time::sleep(IDLE_POLL).await;
                }
                Ok(Some(mut item)) => {
                    busy.fetch_add(1, Ordering::SeqCst);
                    let tasks = Arc::clone(&self.tasks);
                    let state = Arc::clone(state);
                    let busy = Arc::clone(&busy);
                    workers.spawn(async move {
                        for task in tasks.iter() {
                            match task.process(&mut item).await {
                                Ok(()) => {}
                                Err(Error::HookStop) => {
                                    debug!("hook requested stop");
                                    item.fail(&Error::HookStop);
                                    state.stop(false);
                                    break;
                                }
                                Err(err) => {
                                    error!(%err, "task failed");
                                    item.fail(&err);
                                    state.record_exit(ExitStatus::from_error(&err));
                                    break;
                                }
                            }
                        }
                        busy.fetch_sub(1, Ordering::SeqCst);
                        drop(permit);
                    });
                }
            }
        }

        if state.is_force_stopping() {
            workers.abort_all();
        }
        // Cooperative stop: in-flight items run to completion.
        while workers.join_next().await.is_some() {}
        Ok(())
    }
}

pub struct PipelineSeries {
    pub pipelines: Vec<Box<dyn PipelineRunner>>,
}

impl PipelineSeries {
    pub fn new(pipelines: Vec<Box<dyn PipelineRunner>>) -> Self {
        Self { pipelines }
    }
}

/// Frontier-backed source for the main fetch pipeline: `todo` rows
/// first, then earlier failures for another attempt.
pub struct FrontierSource {
    frontier: Arc<Frontier>,
}

impl FrontierSource {
    pub fn new(frontier: Arc<Frontier>) -> Self {
        Self { frontier }
    }
}

#[async_trait]
impl ItemSource<UrlItem> for FrontierSource {
    async fn next_item(&self) -> Result<Option<UrlItem>> {
        for status in [Status::Todo, Status::Error] {
            loop {
                let record =
                    match self
                        .frontier
                        .get_and_update(status, Status::InProgress, None)
                    {
                        Ok(record) => record,
                        Err(Error::NotFound) => break,
                        Err(err) => return Err(err),
                    };
                match webtrawl_core::UrlInfo::parse(&record.url) {
                    Ok(info) => {
                        return Ok(Some(UrlItem::new(
                            Arc::clone(&self.frontier),
                            info,
                            record,
                        )));
                    }
                    Err(err) => {
                        // A row that stopped parsing is dead weight.
                        error!(url = %record.url, %err, "unparsable frontier row");
                        self.frontier.update(
                            &record.url,
                            false,
                            &crate::frontier::UpdateFields {
                                status: Some(Status::Skipped),
                                ..Default::default()
                            },
                        )?;
                    }
                }
            }
        }
        Ok(None)
    }
}

/// Source yielding exactly one `()` item, for setup pipelines.
pub struct OnceSource {
    consumed: std::sync::atomic::AtomicBool,
}

impl Default for OnceSource {
    fn default() -> Self {
        Self {
            consumed: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ItemSource<()> for OnceSource {
    async fn next_item(&self) -> Result<Option<()>> {
        if self.consumed.swap(true, Ordering::SeqCst) {
            Ok(None)
        } else {
            Ok(Some(()))
        }
    }
}

/// Startup drain: repair `in_progress` rows left by a dead process.
pub struct ReleaseTask {
    pub frontier: Arc<Frontier>,
}

#[async_trait]
impl Task<()> for ReleaseTask {
    async fn process(&self, _item: &mut ()) -> Result<()> {
        debug!("releasing in-progress rows");
        self.frontier.release()
    }
}

/// Enqueue the seed URLs.
pub struct SeedTask {
    pub frontier: Arc<Frontier>,
    pub seeds: Vec<String>,
}

#[async_trait]
impl Task<()> for SeedTask {
    async fn process(&self, _item: &mut ()) -> Result<()> {
        self.frontier
            .add(&self.seeds, &crate::frontier::AddDefaults::default())
    }
}

/// The main fetch task: hand the item to the processor.
pub struct ProcessTask {
    pub processor: Processor,
}

#[async_trait]
impl Task<UrlItem> for ProcessTask {
    async fn process(&self, item: &mut UrlItem) -> Result<()> {
        self.processor.process(item).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontier::AddDefaults;

    struct CountingTask {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Task<UrlItem> for CountingTask {
        async fn process(&self, item: &mut UrlItem) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            item.set_status(Status::Done)?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn pipeline_processes_every_row_once() {
        let frontier = Arc::new(Frontier::open_in_memory().unwrap());
        let urls: Vec<String> = (0..50).map(|i| format!("http://example.com/{i}")).collect();
        frontier.add(&urls, &AddDefaults::default()).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(
            Arc::new(FrontierSource::new(Arc::clone(&frontier))),
            vec![Box::new(CountingTask {
                count: Arc::clone(&count),
            }) as Box<dyn Task<UrlItem>>],
            8,
        );
        let state = Arc::new(AppState::new());
        pipeline.run(&state).await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 50);
        assert_eq!(
            frontier.count_by_status(Status::Done).unwrap(),
            50
        );
        assert_eq!(frontier.count_by_status(Status::InProgress).unwrap(), 0);
    }

    struct FailOnceTask {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Task<UrlItem> for FailOnceTask {
        async fn process(&self, item: &mut UrlItem) -> Result<()> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::Parser("boom".to_string()));
            }
            item.skip()?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn unexpected_task_error_marks_item_and_exit_code() {
        let frontier = Arc::new(Frontier::open_in_memory().unwrap());
        frontier
            .add(&["http://example.com/".to_string()], &AddDefaults::default())
            .unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(
            Arc::new(FrontierSource::new(Arc::clone(&frontier))),
            vec![Box::new(FailOnceTask {
                attempts: Arc::clone(&attempts),
            }) as Box<dyn Task<UrlItem>>],
            2,
        );
        let state = Arc::new(AppState::new());
        pipeline.run(&state).await.unwrap();

        // First claim failed (try_count bumped, exit recorded); the error
        // row was redispatched and the second attempt resolved it.
        let record = frontier.get("http://example.com/").unwrap();
        assert_eq!(record.status, Status::Skipped);
        assert_eq!(record.try_count, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(state.exit_code(), Some(ExitStatus::ParserError));
    }

    struct StopTask;

    #[async_trait]
    impl Task<UrlItem> for StopTask {
        async fn process(&self, item: &mut UrlItem) -> Result<()> {
            item.set_status(Status::Done)?;
            Err(Error::HookStop)
        }
    }

    #[tokio::test]
    async fn hook_stop_halts_the_pipeline_cleanly() {
        let frontier = Arc::new(Frontier::open_in_memory().unwrap());
        let urls: Vec<String> = (0..20).map(|i| format!("http://example.com/{i}")).collect();
        frontier.add(&urls, &AddDefaults::default()).unwrap();

        let pipeline = Pipeline::new(
            Arc::new(FrontierSource::new(Arc::clone(&frontier))),
            vec![Box::new(StopTask) as Box<dyn Task<UrlItem>>],
            1,
        );
        let state = Arc::new(AppState::new());
        pipeline.run(&state).await.unwrap();

        assert!(state.is_stopping());
        // No exit code: a hook stop is a clean shutdown.
        assert_eq!(state.exit_code(), None);
        // Most rows were never dispatched.
        assert!(frontier.count_by_status(Status::Todo).unwrap() > 0);
    }

    #[tokio::test]
    async fn once_source_yields_exactly_one_item() {
        let source = OnceSource::default();
        assert!(source.next_item().await.unwrap().is_some());
        assert!(source.next_item().await.unwrap().is_none());
    }
}
