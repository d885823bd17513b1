use std::sync::LazyLock;
use std::time::Instant;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

/// Process start time, used to report elapsed-since-start in readiness and shutdown logs.
pub static APPLICATION_START_TIME: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Initializes the process-wide `tracing` subscriber. Must be called exactly once, before any
/// other component logs. The returned guard must be held for the lifetime of the process, or
/// buffered log lines may be dropped on exit.
pub fn setup_logging() -> WorkerGuard {
	LazyLock::force(&APPLICATION_START_TIME);
	let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_span_events(FmtSpan::NONE)
		.with_writer(writer)
		.with_ansi(false)
		.init();
	guard
}
