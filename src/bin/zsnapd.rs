//! The daemon binary: loads both config files, then loops tick-sleep-tick
//! until a termination signal arrives. Mirrors `zcrab::main`'s
//! `clap::Parser` args struct and `daemon()` loop shape, generalized from
//! zcrab's single-purpose snapshot/gc loop into the full
//! scheduler-dispatches-to-engine sequence this scheme requires.

use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use chrono::Utc;
use clap::Parser;
use color_eyre::eyre::Result;
use tokio::signal::unix::{signal, SignalKind};

use zsnapd::config;
use zsnapd::engine;
use zsnapd::logging::{self, DebugLevel, Sink};
use zsnapd::scheduler;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Snapshots, replicates and ages out ZFS datasets on a schedule.",
    long_about = "Usage
    zsnapd -c /etc/zsnapd/process.conf [-d LEVEL] [-S] [-v] [-b]

Tips
    run foreground (no -S) while developing a dataset.conf
    run with -S under systemd for syslog/journal output
"
)]
struct Args {
    /// Process config file path.
    #[arg(short = 'c', long = "config", default_value = "/etc/zsnapd/process.conf")]
    config: PathBuf,

    /// Debug level: 0|1|2|3 or none|normal|verbose|extreme.
    #[arg(short = 'd', long = "debug", default_value = "normal")]
    debug: String,

    /// Foreground/systemd mode: logs to syslog's DAEMON facility instead of stderr.
    #[arg(short = 'S', long = "systemd")]
    systemd: bool,

    /// Verbose: forces at least DEBUG-level logging regardless of `-d`.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Log a process memory snapshot once per tick.
    #[arg(short = 'b', long = "memory-stats")]
    memory_stats: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let debug_level = DebugLevel::parse(&args.debug).unwrap_or_else(|| {
        eprintln!("invalid -d value `{}`, falling back to normal", args.debug);
        DebugLevel::Normal
    });
    let sink = if args.systemd { Sink::Syslog } else { Sink::Foreground };
    logging::init(sink, debug_level, args.verbose)?;

    let process_conf = match std::fs::read_to_string(&args.config) {
        Ok(text) => text,
        Err(e) => {
            log::error!("failed to read process config {}: {e}", args.config.display());
            std::process::exit(1);
        }
    };
    let process = match config::load_process_file(&process_conf) {
        Ok(p) => p,
        Err(e) => {
            log::error!("invalid process config: {e}");
            std::process::exit(1);
        }
    };

    let dataset_conf = match std::fs::read_to_string(&process.dataset_config_file) {
        Ok(text) => text,
        Err(e) => {
            log::error!(
                "failed to read dataset config {}: {e}",
                process.dataset_config_file.display()
            );
            std::process::exit(1);
        }
    };
    let datasets = match config::load_dataset_file(&dataset_conf, None) {
        Ok(d) => d,
        Err(e) => {
            log::error!("invalid dataset config: {e}");
            std::process::exit(1);
        }
    };
    log::info!("loaded {} configured dataset(s)", datasets.len());

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    thread::spawn(move || wait_for_shutdown_signal(shutdown_tx));

    let sleep_time = if args.debug == "extreme" { process.debug_sleep_time } else { process.sleep_time };

    let mut previous_tick = None;
    loop {
        match shutdown_rx.recv_timeout(sleep_time) {
            Ok(()) => {
                log::info!("received termination signal, shutting down");
                std::process::exit(2);
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                log::error!("shutdown signal thread died unexpectedly");
                std::process::exit(3);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        let now = Utc::now();
        if args.memory_stats {
            log_memory_stats();
        }

        for dataset in scheduler::tick(&datasets, previous_tick, now) {
            match engine::run(dataset, now) {
                Ok(Some(outcome)) => log::info!(
                    "{}: snapshot={:?} replication={:?} destroyed_local={} destroyed_remote={}",
                    outcome.dataset,
                    outcome.snapshot_taken,
                    outcome.replication,
                    outcome.destroyed_local.len(),
                    outcome.destroyed_remote.len(),
                ),
                Ok(None) => log::debug!("{}: no-op tick (no trigger file)", dataset.name),
                Err(e) => log::error!("{}: tick failed: {e}", dataset.name),
            }
        }

        previous_tick = Some(now);
    }
}

fn wait_for_shutdown_signal(tx: mpsc::Sender<()>) {
    let rt = match tokio::runtime::Builder::new_multi_thread().enable_io().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("failed to start signal-handling runtime: {e}");
            return;
        }
    };
    rt.block_on(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {e}");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to install SIGINT handler: {e}");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        let _ = tx.send(());
    });
}

fn log_memory_stats() {
    match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => {
            for line in status.lines() {
                if line.starts_with("VmRSS:") || line.starts_with("VmHWM:") {
                    log::info!("{line}");
                }
            }
        }
        Err(e) => log::debug!("memory stats unavailable: {e}"),
    }
}
