//! Binary entry point: parse arguments, load configuration, set up logging,
//! build the [`Manager`], and run it to completion.
//!
//! Mirrors the teacher's own `main.rs` shape: install a bare-bones logger
//! before anything else can fail noisily, load and apply config, then hand
//! off to a multi-threaded tokio runtime and block on a shutdown signal.
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use corehttpd::config::{Args, Config};
use corehttpd::manager::Manager;
use daemonbase::error::ExitError;
use log::info;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

fn run() -> Result<(), ExitError> {
    corehttpd::log::LogConfig::init_logging()?;

    let args = Args::parse();
    let cur_dir = std::env::current_dir().map_err(|_| ExitError::default())?;

    let mut config = Config::from_file(Path::new(&args.config))?;
    config.apply_args(&args, &cur_dir).map_err(ExitError::from)?;
    config.log.switch_logging(false).map_err(ExitError::from)?;

    let manager = Manager::new(config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            log::error!("failed to start tokio runtime: {err}");
            ExitError::default()
        })?;

    let server = manager.start(&runtime)?;

    runtime.block_on(async {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining connections");
        server.shutdown().await;
    });

    Ok(())
}

/// Waits for Ctrl-C, or SIGTERM on unix, whichever comes first.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
