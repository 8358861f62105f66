//! Assemble a runnable [`Application`] from parsed options.
//!
//! Everything configurable is wired here: the frontier, the filter
//! chain, writers, the WARC sink, the robots pool, and the two-stage
//! pipeline series (startup drain + seeding, then the fetch pipeline).
//! Embedders connect hook callbacks through [`Builder::hooks_mut`]
//! before calling [`Builder::build`].

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use webtrawl_core::{Error, Result, UrlInfo};
use webtrawl_engine::app::Application;
use webtrawl_engine::client::{HttpClient, HttpClientConfig};
use webtrawl_engine::fetch_rule::{
    DirectoryFilter, DomainFilter, FetchRule, HostnameFilter, LevelFilter, ParentFilter,
    RegexFilter, RelativeOnlyFilter, SchemeFilter, SpanHostsFilter, TriesFilter, UrlFilter,
};
use webtrawl_engine::frontier::Frontier;
use webtrawl_engine::hooks::HookBus;
use webtrawl_engine::pipeline::{
    FrontierSource, Pipeline, PipelineSeries, ProcessTask, ReleaseTask, SeedTask, Task,
};
use webtrawl_engine::processor::Processor;
use webtrawl_engine::result_rule::ResultRule;
use webtrawl_engine::robots::RobotsPool;
use webtrawl_engine::scrape::DocumentScraper;
use webtrawl_engine::session::{SessionConfig, SessionContext};
use webtrawl_engine::stats::Statistics;
use webtrawl_engine::waiter::Waiter;
use webtrawl_engine::warc::WarcWriter;
use webtrawl_engine::writer::{ClobberMode, OsType, PathNamer, Writer, WriterConfig};

use crate::options::{parse_header_pairs, Options};

pub struct Builder {
    options: Options,
    hooks: HookBus,
}

impl Builder {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            hooks: HookBus::new(),
        }
    }

    /// Connect user callbacks before building.
    pub fn hooks_mut(&mut self) -> &mut HookBus {
        &mut self.hooks
    }

    pub fn build(self) -> Result<Application> {
        let Builder { options, hooks } = self;
        let options = &options;

        let mut seeds = Vec::new();
        for raw in &options.urls {
            seeds.push(UrlInfo::parse(raw)?);
        }

        let frontier = Arc::new(match &options.database {
            Some(path) => Frontier::open(path)?,
            None => Frontier::open_in_memory()?,
        });

        let user_agent = options
            .user_agent
            .clone()
            .unwrap_or_else(|| format!("webtrawl/{}", env!("CARGO_PKG_VERSION")));

        let client = HttpClient::new(HttpClientConfig {
            user_agent: user_agent.clone(),
            connect_timeout: secs(options.connect_timeout.or(options.timeout), 10.0),
            read_timeout: options.read_timeout.or(options.timeout).map(duration),
            timeout: Some(secs(options.timeout, 900.0)),
            max_body: None,
            local_address: local_address(options),
        })?;

        let extra_headers =
            parse_header_pairs(&options.headers).map_err(Error::Parser)?;
        let warc_fields =
            parse_header_pairs(&options.warc_headers).map_err(Error::Parser)?;

        let warc = match &options.warc_file {
            Some(name) => {
                let compress = !options.no_warc_compression;
                let suffix = if compress { ".warc.gz" } else { ".warc" };
                let path = PathBuf::from(format!("{name}{suffix}"));
                Some(Mutex::new(WarcWriter::create(
                    &path,
                    compress,
                    &warc_fields,
                )?))
            }
            None => None,
        };

        let ctx = Arc::new(SessionContext {
            frontier: Arc::clone(&frontier),
            client,
            fetch_rule: fetch_rule(options, &seeds)?,
            result_rule: ResultRule {
                retry_connrefused: options.retry_connrefused,
                retry_dns_error: options.retry_dns_error,
            },
            scraper: DocumentScraper {
                follow_tags: if options.follow_tags.is_empty() {
                    None
                } else {
                    Some(options.follow_tags.clone())
                },
                ignore_tags: options.ignore_tags.clone(),
            },
            robots: if options.no_robots {
                None
            } else {
                Some(RobotsPool::new(&user_agent))
            },
            hooks,
            stats: Arc::new(Statistics::new()),
            writer: writer(options),
            warc,
            waiter: Mutex::new(Waiter::new(
                duration(options.wait),
                duration(options.waitretry),
                options.random_wait,
            )),
            config: SessionConfig {
                max_redirects: options.max_redirect,
                recursive: options.recursive,
                page_requisites: options.page_requisites,
                referer_override: options.referer.clone(),
                extra_headers,
                post_data: options.post_data.clone().map(String::into_bytes),
            },
        });

        let startup = Pipeline::new(
            Arc::new(webtrawl_engine::pipeline::OnceSource::default()),
            vec![
                Box::new(ReleaseTask {
                    frontier: Arc::clone(&frontier),
                }) as Box<dyn Task<()>>,
                Box::new(SeedTask {
                    frontier: Arc::clone(&frontier),
                    seeds: seeds.iter().map(|info| info.url().to_string()).collect(),
                }),
            ],
            1,
        );
        let fetch = Pipeline::new(
            Arc::new(FrontierSource::new(Arc::clone(&frontier))),
            vec![Box::new(ProcessTask {
                processor: Processor::new(Arc::clone(&ctx)),
            }) as Box<dyn Task<webtrawl_engine::UrlItem>>],
            options.concurrent,
        )
        .skippable();

        let series = PipelineSeries::new(vec![Box::new(startup), Box::new(fetch)]);
        Ok(Application::new(series, ctx))
    }
}

fn fetch_rule(options: &Options, seeds: &[UrlInfo]) -> Result<FetchRule> {
    let seed_hosts: Vec<String> = seeds.iter().map(|info| info.host().to_string()).collect();

    let mut filters: Vec<Box<dyn UrlFilter>> = vec![
        Box::new(SchemeFilter {
            follow_ftp: options.follow_ftp,
        }),
        Box::new(TriesFilter {
            max_tries: options.tries,
        }),
        Box::new(LevelFilter {
            max_level: options.level,
        }),
        Box::new(SpanHostsFilter {
            seed_hosts,
            enabled: options.span_hosts,
        }),
    ];

    if !options.domains.is_empty() || !options.exclude_domains.is_empty() {
        filters.push(Box::new(DomainFilter {
            accepted: options.domains.clone(),
            rejected: options.exclude_domains.clone(),
        }));
    }
    if !options.hostnames.is_empty() || !options.exclude_hostnames.is_empty() {
        filters.push(Box::new(HostnameFilter {
            accepted: options.hostnames.clone(),
            rejected: options.exclude_hostnames.clone(),
        }));
    }
    if !options.include_directories.is_empty() || !options.exclude_directories.is_empty() {
        filters.push(Box::new(DirectoryFilter {
            accepted: options.include_directories.clone(),
            rejected: options.exclude_directories.clone(),
        }));
    }
    if options.accept_regex.is_some() || options.reject_regex.is_some() {
        filters.push(Box::new(RegexFilter {
            accept: compile_regex(&options.accept_regex)?,
            reject: compile_regex(&options.reject_regex)?,
        }));
    }
    if options.no_parent {
        filters.push(Box::new(ParentFilter {
            seed_dirs: seeds
                .iter()
                .map(|info| (info.host().to_string(), info.dir_path().to_string()))
                .collect(),
        }));
    }
    if options.relative {
        filters.push(Box::new(RelativeOnlyFilter));
    }
    Ok(FetchRule::new(filters))
}

fn writer(options: &Options) -> Writer {
    let use_dir = (options.recursive || options.force_directories) && !options.no_directories;
    let clobber = if options.timestamping {
        ClobberMode::Timestamping
    } else if options.continue_download {
        ClobberMode::Continue
    } else if options.no_clobber {
        ClobberMode::SkipExisting
    } else {
        ClobberMode::AntiClobber
    };

    Writer::new(WriterConfig {
        namer: PathNamer {
            root: options.directory_prefix.clone(),
            index: options.default_page.clone(),
            use_dir,
            cut: options.cut_dirs,
            include_protocol: use_dir && options.protocol_directories,
            include_hostname: use_dir && !options.no_host_directories,
            os_type: OsType::native(),
            ascii_only: true,
        },
        clobber,
        save_headers: options.save_headers,
        local_timestamping: true,
    })
}

fn duration(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds.max(0.0))
}

fn secs(value: Option<f64>, default: f64) -> Duration {
    duration(value.unwrap_or(default))
}

fn local_address(options: &Options) -> Option<IpAddr> {
    if let Some(address) = options.bind_address {
        return Some(address);
    }
    // Binding the socket family is how -4/-6 are enforced.
    if options.inet4_only {
        return Some(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
    }
    if options.inet6_only {
        return Some(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED));
    }
    None
}

fn compile_regex(pattern: &Option<String>) -> Result<Option<regex::Regex>> {
    match pattern {
        Some(pattern) => regex::Regex::new(pattern)
            .map(Some)
            .map_err(|e| Error::Parser(format!("bad regex {pattern:?}: {e}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn build(args: &[&str]) -> Result<Application> {
        let mut full = vec!["webtrawl"];
        full.extend_from_slice(args);
        Builder::new(Options::try_parse_from(full).unwrap()).build()
    }

    #[test]
    fn builds_from_minimal_options() {
        let app = build(&["http://example.com/"]).unwrap();
        assert!(app.context().robots.is_some());
        assert!(!app.context().config.recursive);
    }

    #[test]
    fn no_robots_disables_the_pool() {
        let app = build(&["--no-robots", "http://example.com/"]).unwrap();
        assert!(app.context().robots.is_none());
    }

    #[test]
    fn bad_seed_is_a_parser_error() {
        let err = build(&["not-a-url"]).unwrap_err();
        assert!(matches!(err, Error::Parser(_)));
    }

    #[test]
    fn bad_regex_is_a_parser_error() {
        let err = build(&["--accept-regex", "(", "http://example.com/"]).unwrap_err();
        assert!(matches!(err, Error::Parser(_)));
    }

    #[test]
    fn malformed_header_is_a_parser_error() {
        let err = build(&["--header", "nocolon", "http://example.com/"]).unwrap_err();
        assert!(matches!(err, Error::Parser(_)));
    }

    #[test]
    fn hooks_connect_through_the_builder() {
        let options = Options::try_parse_from(["webtrawl", "http://example.com/"]).unwrap();
        let mut builder = Builder::new(options);
        builder
            .hooks_mut()
            .connect_exit_status(Box::new(|code| code))
            .unwrap();
        let app = builder.build().unwrap();
        assert!(app.context().hooks.is_exit_status_connected());
    }
}
