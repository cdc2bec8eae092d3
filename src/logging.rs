use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level. With a `log_dir`, output goes to `node_<name>.log` in it
/// and the returned guard has to be kept alive until exit so the file is flushed.
pub fn init_logging(config: &LoggingConfig, name: &str) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_target(false)
        .with_line_number(true);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(Path::new(dir), format!("node_{name}.log"));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = builder.with_ansi(false).with_writer(writer).try_init();
            Some(guard)
        }
        None => {
            let _ = builder.try_init();
            None
        }
    }
}
