//! Global `tracing` subscriber setup.
//!
//! `RUST_LOG` wins over the configured level when it is set. Extra directives
//! are appended after the level, which lets an embedder silence the protocol
//! engine's chatter (`kestrel_protocol=off`) without lowering everything else.

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Level used when neither `RUST_LOG` nor the caller picks one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

static BUILD_SHA: OnceCell<String> = OnceCell::new();

/// Install the process-wide subscriber described by `config`.
///
/// # Errors
///
/// Fails when a directive does not parse or a global subscriber is already
/// installed.
pub fn init_logging(config: &LoggingConfig<'_>) -> Result<()> {
    let _ = BUILD_SHA.set(config.build_sha.to_string());
    let filter = env_filter(config.level, config.directives)?;

    let output: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(false)
            .with_target(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer().with_target(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init()
        .context("failed to install tracing subscriber")
}

/// Build SHA recorded by the first [`init_logging`] call, `dev` before that.
#[must_use]
pub fn build_sha() -> &'static str {
    BUILD_SHA.get().map_or("dev", String::as_str)
}

/// Inputs for [`init_logging`].
#[derive(Debug, Clone)]
pub struct LoggingConfig<'a> {
    /// Base level, for example `info` or `debug`.
    pub level: &'a str,
    /// Per-target overrides such as `kestrel_engine=debug`.
    pub directives: &'a [&'a str],
    /// Output encoding.
    pub format: LogFormat,
    /// Build identifier exposed through [`build_sha`].
    pub build_sha: &'a str,
}

impl Default for LoggingConfig<'_> {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL,
            directives: &[],
            format: LogFormat::infer(),
            build_sha: build_sha(),
        }
    }
}

/// Subscriber output encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human-readable lines.
    Pretty,
}

impl LogFormat {
    /// Pretty in debug builds, JSON otherwise.
    #[must_use]
    pub const fn infer() -> Self {
        if cfg!(debug_assertions) {
            Self::Pretty
        } else {
            Self::Json
        }
    }

    /// Parse a format name; unknown names fall back to [`LogFormat::infer`].
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" | "text" => Self::Pretty,
            _ => Self::infer(),
        }
    }
}

fn env_filter(level: &str, directives: &[&str]) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    directives
        .iter()
        .try_fold(EnvFilter::new(level), |filter, directive| -> Result<EnvFilter> {
            let parsed = directive
                .parse()
                .with_context(|| format!("invalid log directive {directive}"))?;
            Ok(filter.add_directive(parsed))
        })
}
