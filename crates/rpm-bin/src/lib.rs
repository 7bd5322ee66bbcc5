//! Code shared by the `rpm` and `rpm2cpio` binaries.

pub mod query;

use miette::IntoDiagnostic;
use tracing_subscriber::{filter::LevelFilter, util::SubscriberInitExt, EnvFilter};

/// Installs the global tracing subscriber. Logs go to stderr so they never mix with query output
/// or payload data on stdout. `RUST_LOG` overrides the level selected by `verbose`.
pub fn init_logging(verbose: u8) -> miette::Result<()> {
    let default_filter = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(default_filter.into())
        .from_env()
        .into_diagnostic()?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .without_time()
        .finish()
        .try_init()
        .into_diagnostic()
}
