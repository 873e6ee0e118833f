//! ---
//! tmd_section: "01-core-functionality"
//! tmd_subsection: "module"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Tracing bootstrap for the guard daemon and one-shot checks."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "TMD_LOG";

/// HTTP client internals are polled on every probe tick and drown the guard's own events.
const QUIET_TARGETS: &[&str] = &["hyper=warn", "hyper_util=warn", "reqwest=warn", "h2=warn"];

static GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

/// Console log encoding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Stream receiving console logs. `check` prints its report on stdout, so
/// the default keeps logs on stderr.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogConsole {
    #[default]
    Stderr,
    Stdout,
}

/// Filter directive for the given `TMD_LOG`/`RUST_LOG` value and configured level.
///
/// An explicit environment directive wins untouched. Otherwise the configured
/// level applies to the guard crates and HTTP client internals stay at `warn`.
pub fn filter_directive(env_directive: Option<&str>, level: &str) -> String {
    match env_directive.map(str::trim).filter(|value| !value.is_empty()) {
        Some(directive) => directive.to_owned(),
        None => std::iter::once(level)
            .chain(QUIET_TARGETS.iter().copied())
            .collect::<Vec<_>>()
            .join(","),
    }
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    let env = std::env::var(LOG_ENV)
        .ok()
        .or_else(|| std::env::var(EnvFilter::DEFAULT_ENV).ok());
    let directive = filter_directive(env.as_deref(), &config.level);
    EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!("invalid log directive '{directive}' ({err}); falling back to info");
        EnvFilter::new(filter_directive(None, "info"))
    })
}

fn console_layer<S>(format: LogFormat, writer: NonBlocking) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(writer);
    match format {
        LogFormat::StructuredJson => layer.json().flatten_event(true).boxed(),
        LogFormat::Pretty => layer.compact().boxed(),
    }
}

/// Install the global subscriber for `service_name`.
///
/// Console output follows [`LoggingConfig::format`] and [`LoggingConfig::console`].
/// With `file` enabled a daily JSON log is also written under `directory`, which
/// keeps alert storms reviewable after the fact. Calling this twice is harmless;
/// the first subscriber stays installed.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let mut guards = Vec::with_capacity(2);

    let (console_writer, console_guard) = match config.console {
        LogConsole::Stderr => tracing_appender::non_blocking(std::io::stderr()),
        LogConsole::Stdout => tracing_appender::non_blocking(std::io::stdout()),
    };
    guards.push(console_guard);

    let file_layer = if config.file {
        std::fs::create_dir_all(&config.directory)?;
        let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
        let (file_writer, file_guard) =
            tracing_appender::non_blocking(daily(&config.directory, format!("{prefix}.log")));
        guards.push(file_guard);
        Some(
            fmt::layer()
                .with_target(true)
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .json()
                .flatten_event(true)
                .with_writer(file_writer),
        )
    } else {
        None
    };

    let installed = tracing_subscriber::registry()
        .with(build_filter(config))
        .with(console_layer(config.format, console_writer))
        .with(file_layer)
        .try_init()
        .is_ok();
    if installed {
        let _ = GUARDS.set(guards);
        info!(
            target: "tmd::logging",
            service = %service_name,
            level = %config.level,
            file = config.file,
            log_dir = %config.directory.display(),
            "tracing initialised"
        );
    }
    Ok(())
}
