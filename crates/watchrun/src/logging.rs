use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Verbosity env var; accepts `RUST_LOG`-style directives. The `-v` flag
/// overrides the global level but leaves per-module directives alone.
const LOG_ENV_VAR: &str = "WATCHRUN_LOG";

pub fn init(verbosity: u8) {
    let level_override = match verbosity {
        0 => None,
        1 => Some(LevelFilter::INFO),
        2 => Some(LevelFilter::DEBUG),
        _ => Some(LevelFilter::TRACE),
    };

    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .with_env_var(LOG_ENV_VAR)
        .from_env_lossy();
    if let Some(level) = level_override {
        filter = filter.add_directive(level.into());
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(console::Term::stderr().features().colors_supported())
        .init();
}
