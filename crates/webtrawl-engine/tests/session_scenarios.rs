//! End-to-end crawl scenarios against loopback fixture servers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::routing::get;
use axum::Router;
use webtrawl_core::{Action, LinkType, Status};
use webtrawl_engine::app::AppState;
use webtrawl_engine::client::{HttpClient, HttpClientConfig};
use webtrawl_engine::fetch_rule::{FetchRule, LevelFilter, SchemeFilter, TriesFilter};
use webtrawl_engine::frontier::{AddDefaults, Frontier};
use webtrawl_engine::hooks::HookBus;
use webtrawl_engine::pipeline::{
    FrontierSource, OnceSource, Pipeline, PipelineRunner, ProcessTask, ReleaseTask, SeedTask,
    Task,
};
use webtrawl_engine::processor::Processor;
use webtrawl_engine::result_rule::ResultRule;
use webtrawl_engine::robots::RobotsPool;
use webtrawl_engine::scrape::DocumentScraper;
use webtrawl_engine::session::{SessionConfig, SessionContext};
use webtrawl_engine::stats::Statistics;
use webtrawl_engine::waiter::Waiter;
use webtrawl_engine::writer::Writer;
use webtrawl_engine::UrlItem;

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

struct ContextOptions {
    recursive: bool,
    max_level: Option<u32>,
    robots: bool,
    max_redirects: u32,
    tries: u32,
    writer: Writer,
    hooks: HookBus,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            max_level: None,
            robots: false,
            max_redirects: 20,
            tries: 20,
            writer: Writer::null(),
            hooks: HookBus::new(),
        }
    }
}

fn context(frontier: &Arc<Frontier>, options: ContextOptions) -> Arc<SessionContext> {
    Arc::new(SessionContext {
        frontier: Arc::clone(frontier),
        client: HttpClient::new(HttpClientConfig {
            timeout: Some(Duration::from_secs(10)),
            ..Default::default()
        })
        .unwrap(),
        fetch_rule: FetchRule::new(vec![
            Box::new(SchemeFilter { follow_ftp: false }),
            Box::new(TriesFilter {
                max_tries: options.tries,
            }),
            Box::new(LevelFilter {
                max_level: options.max_level,
            }),
        ]),
        result_rule: ResultRule::default(),
        scraper: DocumentScraper::default(),
        robots: options.robots.then(|| RobotsPool::new("webtrawl-test")),
        hooks: options.hooks,
        stats: Arc::new(Statistics::new()),
        writer: options.writer,
        warc: None,
        waiter: Mutex::new(Waiter::new(Duration::ZERO, Duration::ZERO, false)),
        config: SessionConfig {
            max_redirects: options.max_redirects,
            recursive: options.recursive,
            ..Default::default()
        },
    })
}

async fn crawl(ctx: &Arc<SessionContext>, seeds: &[String], concurrency: usize) -> Arc<AppState> {
    let frontier = Arc::clone(&ctx.frontier);
    let startup = Pipeline::new(
        Arc::new(OnceSource::default()),
        vec![
            Box::new(ReleaseTask {
                frontier: Arc::clone(&frontier),
            }) as Box<dyn Task<()>>,
            Box::new(SeedTask {
                frontier: Arc::clone(&frontier),
                seeds: seeds.to_vec(),
            }),
        ],
        1,
    );
    let fetch = Pipeline::new(
        Arc::new(FrontierSource::new(frontier)),
        vec![Box::new(ProcessTask {
            processor: Processor::new(Arc::clone(ctx)),
        }) as Box<dyn Task<UrlItem>>],
        concurrency,
    );

    let state = Arc::new(AppState::new());
    startup.run(&state).await.unwrap();
    fetch.run(&state).await.unwrap();
    state
}

// Scenario: one page, no recursion. The discovered link must not be
// enqueued.
#[tokio::test]
async fn single_page_without_recursion() {
    let app = Router::new().route(
        "/x",
        get(|| async {
            (
                [(header::CONTENT_TYPE, "text/html")],
                r#"<html><body><a href="y">next</a></body></html>"#,
            )
        }),
    );
    let addr = serve(app).await;

    let frontier = Arc::new(Frontier::open_in_memory().unwrap());
    let ctx = context(&frontier, ContextOptions::default());
    crawl(&ctx, &[format!("http://{addr}/x")], 1).await;

    let record = frontier.get(&format!("http://{addr}/x")).unwrap();
    assert_eq!(record.status, Status::Done);
    assert_eq!(record.status_code, Some(200));
    assert_eq!(frontier.count().unwrap(), 1, "no child rows expected");
    assert_eq!(ctx.stats.worst_exit_status(), None);
}

// Scenario: recursive depth 1 discovers the linked page and the inline
// image with the right classifications.
#[tokio::test]
async fn recursive_depth_one() {
    let app = Router::new()
        .route(
            "/",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "text/html")],
                    r#"<html><body><a href="/a">a</a><img src="/b.png"></body></html>"#,
                )
            }),
        )
        .route(
            "/a",
            get(|| async { ([(header::CONTENT_TYPE, "text/html")], "<html></html>") }),
        )
        .route(
            "/b.png",
            get(|| async { ([(header::CONTENT_TYPE, "image/png")], "png-bytes") }),
        );
    let addr = serve(app).await;

    let frontier = Arc::new(Frontier::open_in_memory().unwrap());
    let ctx = context(
        &frontier,
        ContextOptions {
            recursive: true,
            max_level: Some(1),
            ..Default::default()
        },
    );
    crawl(&ctx, &[format!("http://{addr}/")], 2).await;

    let root = frontier.get(&format!("http://{addr}/")).unwrap();
    assert_eq!(root.status, Status::Done);
    assert_eq!(root.level, 0);

    let linked = frontier.get(&format!("http://{addr}/a")).unwrap();
    assert_eq!(linked.status, Status::Done);
    assert_eq!(linked.level, 1);
    assert!(!linked.inline);
    assert_eq!(linked.referrer.as_deref(), Some(format!("http://{addr}/").as_str()));
    assert_eq!(linked.top_url.as_deref(), Some(format!("http://{addr}/").as_str()));

    let inline = frontier.get(&format!("http://{addr}/b.png")).unwrap();
    assert_eq!(inline.status, Status::Done);
    assert_eq!(inline.level, 1);
    assert!(inline.inline);
    assert_eq!(inline.link_type, Some(LinkType::Media));

    assert_eq!(ctx.stats.files(), 3);
    assert_eq!(ctx.stats.worst_exit_status(), None);
}

// Scenario: 301 into a 404. The item is skipped (permanent), not an
// error; no server-error exit code either.
#[tokio::test]
async fn redirect_then_not_found_is_skipped() {
    let app = Router::new()
        .route(
            "/",
            get(|| async {
                (
                    StatusCode::MOVED_PERMANENTLY,
                    [(header::LOCATION, "/gone")],
                    "",
                )
            }),
        )
        .route("/gone", get(|| async { (StatusCode::NOT_FOUND, "nope") }));
    let addr = serve(app).await;

    let frontier = Arc::new(Frontier::open_in_memory().unwrap());
    let ctx = context(&frontier, ContextOptions::default());
    crawl(&ctx, &[format!("http://{addr}/")], 1).await;

    let record = frontier.get(&format!("http://{addr}/")).unwrap();
    assert_eq!(record.status, Status::Skipped);
    assert_eq!(record.status_code, Some(404));
    assert_eq!(ctx.stats.worst_exit_status(), None);
}

// Scenario: unresolvable host without --retry-dns-error. One attempt,
// skipped, network-failure exit code.
#[tokio::test]
async fn dns_failure_without_retry_skips() {
    let frontier = Arc::new(Frontier::open_in_memory().unwrap());
    let ctx = context(&frontier, ContextOptions::default());
    crawl(&ctx, &["http://no-such-host.invalid/".to_string()], 1).await;

    let record = frontier.get("http://no-such-host.invalid/").unwrap();
    assert_eq!(record.status, Status::Skipped);
    assert_eq!(record.try_count, 0);
    assert_eq!(
        ctx.stats.worst_exit_status(),
        Some(webtrawl_core::ExitStatus::NetworkFailure)
    );
}

// Scenario: robots.txt disallows the path. The main request is never
// issued; the robots fetch itself lands in the frontier as done.
#[tokio::test]
async fn robots_denial_prevents_the_fetch() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_for_handler = Arc::clone(&hits);
    let app = Router::new()
        .route(
            "/robots.txt",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "text/plain")],
                    "User-agent: *\nDisallow: /private/\n",
                )
            }),
        )
        .route(
            "/private/page.html",
            get(move || {
                let hits = Arc::clone(&hits_for_handler);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    ([(header::CONTENT_TYPE, "text/html")], "<html></html>")
                }
            }),
        );
    let addr = serve(app).await;

    let frontier = Arc::new(Frontier::open_in_memory().unwrap());
    let ctx = context(
        &frontier,
        ContextOptions {
            robots: true,
            ..Default::default()
        },
    );
    crawl(&ctx, &[format!("http://{addr}/private/page.html")], 1).await;

    assert_eq!(hits.load(Ordering::SeqCst), 0, "main request must not go out");
    let page = frontier.get(&format!("http://{addr}/private/page.html")).unwrap();
    assert_eq!(page.status, Status::Skipped);

    let robots = frontier.get(&format!("http://{addr}/robots.txt")).unwrap();
    assert_eq!(robots.status, Status::Done);
    assert_eq!(robots.status_code, Some(200));
    assert_eq!(robots.link_type, Some(LinkType::File));
}

// A robots denial is offered to accept_url; the hook can override it
// and the fetch proceeds.
#[tokio::test]
async fn accept_url_hook_can_override_a_robots_denial() {
    let app = Router::new()
        .route(
            "/robots.txt",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "text/plain")],
                    "User-agent: *\nDisallow: /private/\n",
                )
            }),
        )
        .route(
            "/private/page.html",
            get(|| async { ([(header::CONTENT_TYPE, "text/html")], "<html></html>") }),
        );
    let addr = serve(app).await;

    let mut hooks = HookBus::new();
    hooks
        .connect_accept_url(Box::new(|_info, _record, verdict, filters| {
            verdict || filters.reason == "robots"
        }))
        .unwrap();

    let frontier = Arc::new(Frontier::open_in_memory().unwrap());
    let ctx = context(
        &frontier,
        ContextOptions {
            robots: true,
            hooks,
            ..Default::default()
        },
    );
    crawl(&ctx, &[format!("http://{addr}/private/page.html")], 1).await;

    let page = frontier
        .get(&format!("http://{addr}/private/page.html"))
        .unwrap();
    assert_eq!(page.status, Status::Done);
    assert_eq!(page.status_code, Some(200));
}

// accept_url also sees each resolved redirect target and can veto the
// hop; the item is then skipped without fetching the target.
#[tokio::test]
async fn accept_url_hook_can_veto_a_redirect() {
    let target_hits = Arc::new(AtomicUsize::new(0));
    let target_for_handler = Arc::clone(&target_hits);
    let app = Router::new()
        .route(
            "/",
            get(|| async {
                (
                    StatusCode::MOVED_PERMANENTLY,
                    [(header::LOCATION, "/target")],
                    "",
                )
            }),
        )
        .route(
            "/target",
            get(move || {
                let hits = Arc::clone(&target_for_handler);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    ([(header::CONTENT_TYPE, "text/html")], "<html></html>")
                }
            }),
        );
    let addr = serve(app).await;

    let mut hooks = HookBus::new();
    hooks
        .connect_accept_url(Box::new(|_info, _record, verdict, filters| {
            filters.reason != "redirect" && verdict
        }))
        .unwrap();

    let frontier = Arc::new(Frontier::open_in_memory().unwrap());
    let ctx = context(
        &frontier,
        ContextOptions {
            hooks,
            ..Default::default()
        },
    );
    crawl(&ctx, &[format!("http://{addr}/")], 1).await;

    assert_eq!(target_hits.load(Ordering::SeqCst), 0);
    let record = frontier.get(&format!("http://{addr}/")).unwrap();
    assert_eq!(record.status, Status::Skipped);
    assert_eq!(ctx.stats.worst_exit_status(), None);
}

// Scenario: a handle_response hook that says STOP. The pipeline drains
// cleanly and stops dispatching.
#[tokio::test]
async fn hook_stop_unwinds_the_pipeline() {
    let app = Router::new().route(
        "/*path",
        get(|| async { ([(header::CONTENT_TYPE, "text/html")], "<html></html>") }),
    );
    let addr = serve(app).await;

    let mut hooks = HookBus::new();
    hooks
        .connect_handle_response(Box::new(|_info, _record, _response| Action::Stop))
        .unwrap();

    let frontier = Arc::new(Frontier::open_in_memory().unwrap());
    let urls: Vec<String> = (0..10).map(|i| format!("http://{addr}/p{i}")).collect();
    frontier.add(&urls, &AddDefaults::default()).unwrap();

    let ctx = context(
        &frontier,
        ContextOptions {
            hooks,
            ..Default::default()
        },
    );
    let state = crawl(&ctx, &[], 1).await;

    assert!(state.is_stopping());
    assert!(frontier.count_by_status(Status::Todo).unwrap() > 0);
}

// A redirect chain longer than the budget ends in a protocol error: the
// session visits at most max_redirect + 1 request URLs.
#[tokio::test]
async fn redirect_budget_is_enforced() {
    let hops = Arc::new(AtomicUsize::new(0));
    let hops_for_handler = Arc::clone(&hops);
    let app = Router::new().route(
        "/loop/:n",
        get(
            move |axum::extract::Path(n): axum::extract::Path<u32>| {
                let hops = Arc::clone(&hops_for_handler);
                async move {
                    hops.fetch_add(1, Ordering::SeqCst);
                    (
                        StatusCode::FOUND,
                        [(header::LOCATION, format!("/loop/{}", n + 1))],
                        "",
                    )
                }
            },
        ),
    );
    let addr = serve(app).await;

    let frontier = Arc::new(Frontier::open_in_memory().unwrap());
    let ctx = context(
        &frontier,
        ContextOptions {
            max_redirects: 3,
            // One attempt: the error row is rejected on redispatch.
            tries: 1,
            ..Default::default()
        },
    );
    crawl(&ctx, &[format!("http://{addr}/loop/0")], 1).await;

    // Budget 3 allows the initial request plus three redirect targets.
    assert_eq!(hops.load(Ordering::SeqCst), 4);
    let record = frontier.get(&format!("http://{addr}/loop/0")).unwrap();
    assert_eq!(record.try_count, 1);
    assert_eq!(record.status, Status::Skipped);
    assert_eq!(
        ctx.stats.worst_exit_status(),
        Some(webtrawl_core::ExitStatus::ProtocolError)
    );
}

// A redirect straight back to a visited URL trips loop detection well
// before the budget runs out.
#[tokio::test]
async fn redirect_cycle_is_detected() {
    let app = Router::new()
        .route(
            "/a",
            get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/b")], "") }),
        )
        .route(
            "/b",
            get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/a")], "") }),
        );
    let addr = serve(app).await;

    let frontier = Arc::new(Frontier::open_in_memory().unwrap());
    let ctx = context(
        &frontier,
        ContextOptions {
            tries: 1,
            ..Default::default()
        },
    );
    crawl(&ctx, &[format!("http://{addr}/a")], 1).await;

    let record = frontier.get(&format!("http://{addr}/a")).unwrap();
    assert_eq!(record.try_count, 1);
    assert_eq!(record.status, Status::Skipped);
    assert_eq!(
        ctx.stats.worst_exit_status(),
        Some(webtrawl_core::ExitStatus::ProtocolError)
    );
}

// Resume: a crawl interrupted mid-flight finishes on restart with the
// same terminal statuses as an uninterrupted run.
#[tokio::test]
async fn restart_resumes_from_the_database() {
    let served = Arc::new(AtomicUsize::new(0));
    let served_for_handler = Arc::clone(&served);
    let app = Router::new().route(
        "/*path",
        get(move || {
            let served = Arc::clone(&served_for_handler);
            async move {
                served.fetch_add(1, Ordering::SeqCst);
                ([(header::CONTENT_TYPE, "text/html")], "<html></html>")
            }
        }),
    );
    let addr = serve(app).await;

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("frontier.db");

    // First run: simulate a crash by leaving rows behind in every
    // pre-terminal state.
    {
        let frontier = Arc::new(Frontier::open(&db_path).unwrap());
        let urls: Vec<String> = (0..4).map(|i| format!("http://{addr}/p{i}")).collect();
        frontier.add(&urls, &AddDefaults::default()).unwrap();
        // One row was mid-fetch when the process died.
        frontier
            .get_and_update(Status::Todo, Status::InProgress, None)
            .unwrap();
    }

    // Restart with the same database.
    let frontier = Arc::new(Frontier::open(&db_path).unwrap());
    let ctx = context(&frontier, ContextOptions::default());
    crawl(&ctx, &[], 2).await;

    for i in 0..4 {
        let record = frontier.get(&format!("http://{addr}/p{i}")).unwrap();
        assert_eq!(record.status, Status::Done, "p{i} should finish after resume");
    }
    assert_eq!(served.load(Ordering::SeqCst), 4);
}

// Concurrent sessions for one host share a single robots fetch.
#[tokio::test]
async fn robots_fetch_is_single_flight() {
    let robots_hits = Arc::new(AtomicUsize::new(0));
    let robots_for_handler = Arc::clone(&robots_hits);
    let app = Router::new()
        .route(
            "/robots.txt",
            get(move || {
                let hits = Arc::clone(&robots_for_handler);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    // Slow enough that the other workers pile up behind it.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    ([(header::CONTENT_TYPE, "text/plain")], "User-agent: *\nAllow: /\n")
                }
            }),
        )
        .route(
            "/*path",
            get(|| async { ([(header::CONTENT_TYPE, "text/html")], "<html></html>") }),
        );
    let addr = serve(app).await;

    let frontier = Arc::new(Frontier::open_in_memory().unwrap());
    let urls: Vec<String> = (0..8).map(|i| format!("http://{addr}/p{i}")).collect();
    frontier.add(&urls, &AddDefaults::default()).unwrap();

    let ctx = context(
        &frontier,
        ContextOptions {
            robots: true,
            ..Default::default()
        },
    );
    crawl(&ctx, &[], 8).await;

    assert_eq!(robots_hits.load(Ordering::SeqCst), 1);
    assert_eq!(frontier.count_by_status(Status::Done).unwrap(), 9);
}

// The writer lays out the host/path tree and saves bodies.
#[tokio::test]
async fn recursive_crawl_writes_the_file_tree() {
    let app = Router::new()
        .route(
            "/docs/",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "text/html")],
                    r#"<html><a href="page.html">p</a></html>"#,
                )
            }),
        )
        .route(
            "/docs/page.html",
            get(|| async { ([(header::CONTENT_TYPE, "text/html")], "<html>leaf</html>") }),
        );
    let addr = serve(app).await;

    let out = tempfile::tempdir().unwrap();
    let writer = Writer::new(webtrawl_engine::writer::WriterConfig {
        namer: webtrawl_engine::writer::PathNamer {
            root: out.path().to_path_buf(),
            use_dir: true,
            include_hostname: true,
            ..Default::default()
        },
        clobber: webtrawl_engine::writer::ClobberMode::AntiClobber,
        save_headers: false,
        local_timestamping: true,
    });

    let frontier = Arc::new(Frontier::open_in_memory().unwrap());
    let ctx = context(
        &frontier,
        ContextOptions {
            recursive: true,
            writer,
            ..Default::default()
        },
    );
    crawl(&ctx, &[format!("http://{addr}/docs/")], 1).await;

    let host_dir = format!("{}:{}", addr.ip(), addr.port());
    let index = out.path().join(&host_dir).join("docs/index.html");
    let leaf = out.path().join(&host_dir).join("docs/page.html");
    assert!(index.exists(), "expected {}", index.display());
    assert!(leaf.exists(), "expected {}", leaf.display());
    assert_eq!(std::fs::read_to_string(leaf).unwrap(), "<html>leaf</html>");

    let record = frontier.get(&format!("http://{addr}/docs/page.html")).unwrap();
    assert!(record.filename.unwrap().ends_with("docs/page.html"));
}

// Stress: no duplicate dispatch under concurrency and the frontier
// count stays stable.
#[tokio::test]
async fn concurrent_crawl_dispatches_each_url_once() {
    let served = Arc::new(Mutex::new(Vec::new()));
    let served_for_handler = Arc::clone(&served);
    let app = Router::new().route(
        "/*path",
        get(move |axum::extract::Path(path): axum::extract::Path<String>| {
            let served = Arc::clone(&served_for_handler);
            async move {
                served.lock().unwrap().push(path);
                ([(header::CONTENT_TYPE, "text/html")], "<html></html>")
            }
        }),
    );
    let addr = serve(app).await;

    let frontier = Arc::new(Frontier::open_in_memory().unwrap());
    let urls: Vec<String> = (0..300).map(|i| format!("http://{addr}/u{i}")).collect();
    frontier.add(&urls, &AddDefaults::default()).unwrap();

    let ctx = context(&frontier, ContextOptions::default());
    crawl(&ctx, &[], 32).await;

    let served = served.lock().unwrap();
    let unique: std::collections::HashSet<&String> = served.iter().collect();
    assert_eq!(served.len(), 300, "every url fetched exactly once");
    assert_eq!(unique.len(), 300);
    assert_eq!(frontier.count().unwrap(), 300);
    assert_eq!(frontier.count_by_status(Status::Done).unwrap(), 300);
}
