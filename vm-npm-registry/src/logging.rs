//! Tracing subscriber setup driven by environment variables.
//!
//! | Variable        | Values                      | Default                    |
//! |-----------------|-----------------------------|----------------------------|
//! | `LOG_LEVEL`     | any `EnvFilter` directive   | `info`                     |
//! | `LOG_FORMAT`    | `human`, `json`             | `human`                    |
//! | `LOG_OUTPUT`    | `console`, `file`, `both`   | `console`                  |
//! | `LOG_FILE_PATH` | path of the rolling log     | `/tmp/npm-registry.log`    |
//!
//! `RUST_LOG`, when set, takes precedence over `LOG_LEVEL`.

use std::env;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, registry, EnvFilter, Layer, Registry};

const DEFAULT_LOG_FILE: &str = "/tmp/npm-registry.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    /// Unrecognized output: events are filtered but not written anywhere.
    Silent,
}

impl LogOutput {
    fn parse(value: &str) -> Self {
        match value {
            "console" => LogOutput::Console,
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            _ => LogOutput::Silent,
        }
    }

    fn console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
    pub output: LogOutput,
    pub file_path: PathBuf,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        LogSettings {
            level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            json: lookup("LOG_FORMAT").is_some_and(|format| format == "json"),
            output: LogOutput::parse(&lookup("LOG_OUTPUT").unwrap_or_else(|| "console".to_string())),
            file_path: PathBuf::from(
                lookup("LOG_FILE_PATH").unwrap_or_else(|| DEFAULT_LOG_FILE.to_string()),
            ),
        }
    }

    fn file_parts(&self) -> (&Path, &Path) {
        let dir = self
            .file_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("/tmp"));
        let name = self
            .file_path
            .file_name()
            .map(Path::new)
            .unwrap_or_else(|| Path::new("npm-registry.log"));
        (dir, name)
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer<W>(writer: W, json: bool) -> BoxedLayer
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer().with_writer(writer);
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Initializes the global tracing subscriber.
///
/// Returns the file appender's guard when logging to a file; dropping it
/// flushes and stops the background writer. A second call is a no-op.
pub fn init_subscriber() -> Option<WorkerGuard> {
    let settings = LogSettings::from_env();

    let mut env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));
    for directive in ["tokio=warn", "hyper=warn", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            env_filter = env_filter.add_directive(directive);
        }
    }

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;
    if settings.output.console() {
        layers.push(fmt_layer(std::io::stdout, settings.json));
    }
    if settings.output.file() {
        let (dir, name) = settings.file_parts();
        let (non_blocking, file_guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
        guard = Some(file_guard);
        layers.push(fmt_layer(non_blocking, settings.json));
    }

    if registry().with(layers).with(env_filter).try_init().is_err() {
        tracing::debug!("Tracing subscriber already initialized");
    }
    guard
}
