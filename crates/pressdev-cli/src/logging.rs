use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// The directives in `raw` (the value of `RUST_LOG`), or `default_level`
/// when there are none.
fn env_filter(default_level: tracing::Level, raw: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default_level.into())
        .parse_lossy(raw)
}

/// Install the global subscriber: stderr always, plus a plain-text copy
/// appended to `log_file` when one is given. `RUST_LOG` overrides the level.
pub fn init(default_level: tracing::Level, log_file: Option<&Path>) {
    let raw = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let filter = env_filter(default_level, &raw);
    let stderr = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let file = log_file.and_then(|path| {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("warning: cannot open {}: {e}", path.display());
                None
            }
        }
    });
    let file_layer = file.map(|f| {
        fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_writer(Mutex::new(f))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file_layer)
        .init();
}
