use clap::Parser;
use tracing_subscriber::EnvFilter;

mod builder;
mod options;

use builder::Builder;
use options::Options;

fn main() {
    // Usage errors exit 2 (clap's default), matching the parser-error
    // slot in the exit-code table.
    let options = Options::parse();
    init_tracing(&options);

    let app = match Builder::new(options).build() {
        Ok(app) => app,
        Err(err) => {
            tracing::error!(%err, "could not start");
            std::process::exit(webtrawl_core::ExitStatus::from_error(&err).code());
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(%err, "could not start runtime");
            std::process::exit(webtrawl_core::ExitStatus::GenericError.code());
        }
    };

    let code = runtime.block_on(app.run());
    // Let outstanding sockets and files close without blocking exit.
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    std::process::exit(code);
}

fn init_tracing(options: &Options) {
    let default_level = if options.quiet {
        "warn"
    } else if options.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
