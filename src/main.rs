//! echod server binary.

use clap::error::ErrorKind;
use clap::Parser;
use echod::config::{CliArgs, Config};
use echod::pool::ThreadPool;
use echod::server::Server;
use echod::signal;
use std::fs::OpenOptions;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = match CliArgs::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::resolve(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config) {
        eprintln!("Failed to open log file: {e}");
        return ExitCode::FAILURE;
    }

    signal::ignore_sigpipe();

    info!(
        address = %config.address,
        port = config.port,
        threads = config.threads,
        compute_threads = config.compute_threads,
        "starting echod"
    );

    let server = match Server::new(&config.address, config.port, config.threads) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!(error = %e, "failed to create server");
            return ExitCode::FAILURE;
        }
    };

    // With compute threads configured, the echo work leaves the I/O thread
    // and the result re-enters the owning loop through Connection::send.
    let pool = if config.compute_threads > 0 {
        let pool = Arc::new(ThreadPool::new(
            config.compute_threads,
            config.task_queue_size,
        ));
        pool.start();
        let compute = Arc::clone(&pool);
        server.set_message_callback(move |conn, buffer| {
            let message = buffer.retrieve_all_as_bytes();
            let conn = Arc::clone(conn);
            compute.execute(move || conn.send(message));
        });
        Some(pool)
    } else {
        None
    };

    if let Err(e) = signal::install_shutdown_handler(Arc::clone(&server)) {
        error!(error = %e, "failed to install signal handler");
        return ExitCode::FAILURE;
    }

    // Blocks on the main event loop until a shutdown signal stops it.
    if server.start().is_err() {
        return ExitCode::FAILURE;
    }

    if let Some(pool) = pool {
        pool.stop();
    }
    info!("echod shutdown complete");
    ExitCode::SUCCESS
}

fn init_logging(config: &Config) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true)
        .with_target(false);

    match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_writer(Arc::new(file)).with_ansi(false).init();
        }
        None => builder.init(),
    }
    Ok(())
}
