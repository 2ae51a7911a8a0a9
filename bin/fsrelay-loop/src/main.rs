//! fsrelay loopback harness
//!
//! Mounts one volume, plays the remote side of the transport against an
//! in-memory file system on worker threads, and drives the volume with
//! client threads issuing directory scans and metadata calls. Prints the
//! queue, exchange and cache statistics as JSON on exit.

mod memfs;
mod remote;
mod report;
mod workload;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use fsrelay_common::Config;
use fsrelay_transact::Mode;
use fsrelay_volume::Volume;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::memfs::MemFs;
use crate::report::LoopReport;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "fsrelay-loop",
    about = "Run an fsrelay volume against an in-memory remote file system"
)]
struct Args {
    /// Configuration file (TOML); FSRELAY__SECTION__KEY variables override it
    #[arg(long, env = "FSRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Remote transactor threads
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Client threads issuing file-system calls
    #[arg(long, default_value_t = 4)]
    clients: usize,

    /// Directories in the remote file system
    #[arg(long, default_value_t = 8)]
    dirs: usize,

    /// Files per directory
    #[arg(long, default_value_t = 2000)]
    files: usize,

    /// Seconds to run (0 runs until Ctrl-C)
    #[arg(long, default_value_t = 10)]
    duration_s: u64,

    /// Outbound buffer per round trip in bytes
    #[arg(long, default_value_t = 64 * 1024)]
    outbound_bytes: usize,

    /// Transmit one request per round trip
    #[arg(long)]
    single: bool,

    /// Seed for the generated file system and the workload
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Tracing
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting fsrelay loopback");

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = Config::load(args.config.as_deref()).context("load configuration")?;
    let tick_period = config.volume.transact_timeout();

    // ── Remote file system ────────────────────────────────────────────────────
    let mut rng = StdRng::seed_from_u64(args.seed);
    let fs = Arc::new(MemFs::generate(args.dirs, args.files, &mut rng));
    let paths = Arc::new(fs.paths());
    info!("Remote file system: {} directories of {} files", args.dirs, args.files);

    // ── Volume ────────────────────────────────────────────────────────────────
    let volume = Arc::new(Volume::mount(config));

    // ── Remote workers ────────────────────────────────────────────────────────
    let mode = if args.single { Mode::Single } else { Mode::Batch };
    let workers: Vec<_> = (0..args.workers)
        .map(|worker| {
            let volume = Arc::clone(&volume);
            let fs = Arc::clone(&fs);
            let outbound_bytes = args.outbound_bytes;
            tokio::task::spawn_blocking(move || remote::serve(worker, &volume, &fs, mode, outbound_bytes))
        })
        .collect();

    // ── Expiration timer ──────────────────────────────────────────────────────
    let timer = tokio::spawn(expiration_loop(Arc::clone(&volume), tick_period));

    // ── Clients ───────────────────────────────────────────────────────────────
    let stop = Arc::new(AtomicBool::new(false));
    let clients: Vec<_> = (0..args.clients)
        .map(|client| {
            let volume = Arc::clone(&volume);
            let paths = Arc::clone(&paths);
            let stop = Arc::clone(&stop);
            let files = args.files;
            let seed = args.seed.wrapping_add(client as u64 + 1);
            tokio::task::spawn_blocking(move || workload::run(client, &volume, &paths, files, &stop, seed))
        })
        .collect();

    // ── Run ───────────────────────────────────────────────────────────────────
    let run_for = async {
        if args.duration_s == 0 {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(Duration::from_secs(args.duration_s)).await;
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listen for Ctrl-C")?;
            info!("Interrupted");
        }
        () = run_for => info!("Run time elapsed"),
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────
    // Refuse new work first so remote workers drain their replies and exit,
    // then cancel whatever is still queued to release blocked clients.
    stop.store(true, Ordering::Relaxed);
    volume.begin_shutdown();

    let mut worker_reports = Vec::with_capacity(workers.len());
    for worker in workers {
        worker_reports.push(worker.await.context("join remote worker")?);
    }
    let cancelled = volume.finish_shutdown();

    let mut client_reports = Vec::with_capacity(clients.len());
    for client in clients {
        client_reports.push(client.await.context("join client")?);
    }
    timer.await.context("join expiration timer")?;

    let report = LoopReport::collect(&volume, fs.served(), worker_reports, client_reports, cancelled);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Periodically time out overdue operations and sweep expired cache items
async fn expiration_loop(volume: Arc<Volume>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if volume.is_stopped() {
            debug!("expiration timer stopped");
            return;
        }
        let outcome = volume.tick(Instant::now());
        if outcome.expired > 0 {
            info!("{} operations timed out", outcome.expired);
        }
    }
}
