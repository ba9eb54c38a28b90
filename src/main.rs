use std::process::ExitCode;

use strobe::{exit_status, Config};

fn main() -> ExitCode {
    let config = match Config::setup() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err:#}");
            return ExitCode::FAILURE;
        }
    };

    let _guard = setup_tracing(config.log_file);

    match strobe::run(config) {
        Ok(()) => {
            tracing::info!("exiting");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(exit_status(&err))
        }
    }
}

fn setup_tracing(log_file: bool) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_appender::{non_blocking, rolling::never};
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (log, guard) = if log_file {
        std::fs::remove_file(".log").ok();
        non_blocking(never(".", ".log"))
    } else {
        non_blocking(std::io::stderr())
    };

    tracing_subscriber::fmt()
        .with_writer(log)
        .with_ansi(!log_file)
        .with_env_filter(filter)
        .init();
    guard
}
