use clap::{ArgAction, Parser, ValueEnum};
use is_terminal::IsTerminal;
use tracing::{Dispatch, dispatcher};
use tracing_log::AsLog;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
pub struct LoggingOpts {
    #[clap(long, env = "ASTATE_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    #[clap(long, env = "ASTATE_LOG_COLOR", default_value = "auto")]
    pub log_color: LogColor,

    /// Extra directives in the RUST_LOG format, e.g. `transport_lib=debug`.
    /// RUST_LOG wins when both set a level for the same target.
    #[clap(long, env = "ASTATE_LOG_DIRECTIVES")]
    pub log_directives: Option<String>,

    /// Include the emitting thread name in every line. Helpful when the
    /// performance reporter and data-plane callers interleave.
    #[clap(
        long,
        env = "ASTATE_LOG_THREAD_NAMES",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub log_thread_names: bool,
}

impl Default for LoggingOpts {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Text,
            log_color: LogColor::Auto,
            log_directives: None,
            log_thread_names: true,
        }
    }
}

/// Installs the process-wide subscriber. Fails if one is already installed.
pub fn init(opts: &LoggingOpts) -> Result<(), anyhow::Error> {
    dispatcher::set_global_default(build_dispatch(opts)?)?;

    tracing_log::LogTracer::builder()
        // Must run after the global default is set to pick up its max level.
        .with_max_level(tracing_core::LevelFilter::current().as_log())
        .init()?;
    Ok(())
}

/// Like [`init`], but leaves an already installed subscriber in place.
pub fn try_init(opts: &LoggingOpts) -> bool {
    init(opts).is_ok()
}

fn build_dispatch(opts: &LoggingOpts) -> Result<Dispatch, anyhow::Error> {
    let color = match opts.log_color {
        // tracing_subscriber::fmt writes to stderr here, so probe that.
        LogColor::Auto => std::io::stderr().is_terminal(),
        LogColor::Always => true,
        LogColor::Never => false,
    };

    let mut log_filter_builder = EnvFilter::builder();
    if let Some(directives) = &opts.log_directives {
        log_filter_builder =
            log_filter_builder.with_default_directive(directives.parse()?);
    }
    let log_filter = log_filter_builder.from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_thread_names(opts.log_thread_names);

    #[cfg(test)]
    let builder = builder.with_test_writer();

    #[cfg(not(test))]
    let builder = builder.with_writer(std::io::stderr);

    let dispatch: Dispatch = match opts.log_format {
        LogFormat::Text => builder.with_ansi(color).finish().into(),
        LogFormat::Json => builder.json().finish().into(),
    };
    Ok(dispatch)
}

#[derive(Debug, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogColor {
    Auto,
    Always,
    Never,
}
