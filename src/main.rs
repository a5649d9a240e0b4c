//! stream-tee: an io_uring stream duplicator
//!
//! Accepts two local connections. Everything read from the first is written
//! back to it and, byte for byte, to the second.
//!
//! Features:
//! - Zero-copy relay through kernel pipes (splice and tee)
//! - Buffer relay through one user-space block (recv and send)
//! - TCP loopback or Unix domain sockets
//! - Built-in traffic simulators driving both connections
//! - Periodic throughput and resource-usage reports
//! - Configuration via CLI arguments or TOML file

mod config;
mod rate;
mod report;
mod runtime;
mod simulator;
mod transport;

use config::Config;
use report::{ReportSettings, Reporter};
use runtime::EngineError;
use std::io;
use std::os::fd::AsFd;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use transport::Transport;

/// Exit code for configuration that does not validate.
const EXIT_CONFIG: i32 = 2;

#[derive(Debug, Error)]
enum RunError {
    #[error("setup failed: {0}")]
    Setup(#[from] io::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("simulator thread panicked")]
    SimulatorPanicked,
}

impl RunError {
    fn exit_code(&self) -> i32 {
        match self {
            RunError::Setup(e) => -e.raw_os_error().unwrap_or(1),
            RunError::Engine(e) => e.exit_code(),
            RunError::SimulatorPanicked => -1,
        }
    }
}

fn main() {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        strategy = ?config.strategy,
        transport = ?config.transport,
        block_size = config.block_size(),
        ring_size = config.ring_size,
        source_bytes = ?config.source_bytes,
        "Starting stream-tee"
    );

    let code = match run(&config) {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Duplication failed");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(config: &Config) -> Result<(), RunError> {
    let block_size = config.block_size();
    let transport = Transport::new(config.transport)?;
    let echo_listener = transport.create_listener(1)?;
    let observer_listener = transport.create_listener(1)?;

    let client = transport.connect_to(&echo_listener)?;
    let observer = transport.connect_to(&observer_listener)?;
    let simulators = simulator::spawn(client, observer, block_size, config.source_bytes)?;

    let secondary = observer_listener.accept()?;
    let primary = echo_listener.accept()?;
    info!("Connections accepted");

    let mut reporter = Reporter::new(&ReportSettings {
        interval: config.report_interval,
        rate_window: config.rate_window,
        log_file: config.log_file.clone(),
    })?;

    let result = runtime::run(
        config.strategy,
        config.ring_size,
        block_size,
        primary.as_fd(),
        secondary.as_fd(),
        &mut reporter,
    );

    // Closing the server side ends the simulators' reads.
    drop(primary);
    drop(secondary);
    let metrics = result?;

    info!(
        bytes_sent = metrics.bytes_sent,
        iterations = metrics.iterations,
        short_reads = metrics.short_reads,
        short_writes = metrics.short_writes(),
        interrupted = metrics.interrupted,
        "Duplication finished"
    );

    // An unbounded source never finishes on its own.
    if config.source_bytes.is_some() {
        match simulators.join() {
            Ok(Ok(traffic)) => info!(
                sent = traffic.sent,
                echoed = traffic.echoed,
                observed = traffic.observed,
                "Traffic complete"
            ),
            Ok(Err(e)) => warn!(error = %e, "Simulator failed"),
            Err(_) => return Err(RunError::SimulatorPanicked),
        }
    }

    Ok(())
}
