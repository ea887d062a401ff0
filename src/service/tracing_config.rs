use dotenv::dotenv;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use super::{AppError, AppResult};

/// Keeps the non-blocking file writer alive; logs are flushed when dropped.
pub struct LogGuard {
    _worker_guard: Option<WorkerGuard>,
}

/// Console-only tracing, filtered through `RUST_LOG`.
///
/// Used by tests and the command line client.
pub fn setup_local_tracing() -> AppResult<()> {
    // load RUST_LOG from .env when present
    dotenv().ok();
    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.6f".to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .map_err(|e| AppError::IllegalStateError(format!("tracing already set up: {}", e)))
}

/// Server tracing: console output plus, when `log_dir` is given, an hourly
/// rolling `biddrd.log` written through a non-blocking appender.
pub fn setup_tracing(log_dir: Option<&str>, verbose: u8) -> AppResult<LogGuard> {
    dotenv().ok();

    let filter = match verbose {
        0 => tracing_subscriber::EnvFilter::from_default_env(),
        1 => tracing_subscriber::EnvFilter::new("info"),
        2 => tracing_subscriber::EnvFilter::new("debug"),
        _ => tracing_subscriber::EnvFilter::new("trace"),
    };

    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.6f".to_string());

    let (worker_guard, result) = match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::hourly(dir, "biddrd.log");
            let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
            // write to the console and the log file at the same time
            let writer = non_blocking.and(std::io::stdout);
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_timer(timer)
                .with_target(true)
                .with_thread_names(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(writer);
            let result = tracing_subscriber::registry()
                .with(fmt_layer)
                .with(filter)
                .try_init();
            (Some(worker_guard), result)
        }
        None => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_timer(timer)
                .with_target(true)
                .with_thread_names(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_ansi(true);
            let result = tracing_subscriber::registry()
                .with(fmt_layer)
                .with(filter)
                .try_init();
            (None, result)
        }
    };

    result.map_err(|e| AppError::IllegalStateError(format!("tracing already set up: {}", e)))?;

    Ok(LogGuard {
        _worker_guard: worker_guard,
    })
}
