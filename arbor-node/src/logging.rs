use tracing::error;
use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Logs to stderr with file and line, filtered by `RUST_LOG` (`info` when unset). A panic
/// anywhere is logged under the `arbor` target and ends the process.
pub fn setup_log() {
    let _ = SubscriberBuilder::default()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_env_filter(env_filter())
        .finish()
        .try_init();

    std::panic::set_hook(Box::new(|info| {
        error!(target: "arbor", "{}", info);
        std::process::exit(1);
    }));
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
