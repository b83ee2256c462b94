//! Load generator for exercising the swap pipeline against a real store.
//!
//! Preloads a keyspace with a mix of resident and cold keys, then issues
//! random read commands through the pipeline and reports swap and iterator
//! statistics.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use coldswap::request::CommandIntention;
use coldswap::value::Value;
use coldswap::{Client, Command, SwapConfig, SwapPipeline};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "coldswap-load")]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Cmd {
    Run(RunArgs),
}

/// CLI options for running the load.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Store directory. Created if missing.
    #[arg(long, default_value = ".tmp/coldswap-load")]
    path: PathBuf,

    /// Number of keys in the working set.
    #[arg(long, default_value_t = 1000)]
    keys: usize,

    /// Value payload length in bytes.
    #[arg(long, default_value_t = 128)]
    value_len: usize,

    /// Percent of keys preloaded as cold (on disk only).
    #[arg(long, default_value_t = 50)]
    cold_pct: u8,

    /// Number of read commands to issue.
    #[arg(long, default_value_t = 10_000)]
    ops: u64,

    /// Swap-worker threads.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Scan the cold partition through the store iterator after the run.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    scan: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Cmd::Run(run) => run_load(run),
    }
}

fn run_load(args: RunArgs) -> anyhow::Result<()> {
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let mut rng = SmallRng::seed_from_u64(seed);
    tracing::info!(seed, keys = args.keys, ops = args.ops, "starting load");

    let mut config = SwapConfig::from_env();
    config.worker_threads = args.workers.max(1);
    let mut pipeline =
        SwapPipeline::open(&args.path, config).context("failed to open swap pipeline")?;

    preload(&mut pipeline, &args, &mut rng)?;

    let client = Arc::new(Client::new(1));
    let hits = Arc::new(AtomicU64::new(0));
    let started = Instant::now();
    for op in 0..args.ops {
        let key = key_bytes(rng.gen_range(0..args.keys));
        let counter = Arc::clone(&hits);
        let lookup = key.clone();
        let exec = Box::new(move |keyspace: &mut coldswap::KeyspaceState| {
            if keyspace.get(&lookup).is_some() {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });
        pipeline.dispatch(
            &client,
            Command::new(CommandIntention::Read, vec![key], exec),
        );
        pipeline
            .wait_for_client(&client, Duration::from_secs(10))
            .with_context(|| format!("op {op} did not complete"))?;
    }
    let elapsed = started.elapsed();

    let stats = pipeline.stats();
    let workers = pipeline.worker_stats();
    tracing::info!(
        ops = args.ops,
        hits = hits.load(Ordering::Relaxed),
        elapsed_ms = elapsed.as_millis() as u64,
        inline = stats.inline_completions,
        async_done = stats.async_completions,
        resumes = stats.resumes,
        get_ops = workers.get_ops,
        io_errors = workers.io_errors,
        processed = client.processed(),
        repl_offset = client.repl_offset(),
        resident = pipeline.keyspace().resident_len(),
        cold = pipeline.keyspace().cold_len(),
        "load complete"
    );

    if args.scan {
        scan_store(&pipeline)?;
    }
    Ok(())
}

/// Seed the store: cold keys go to disk only, the rest stay resident.
fn preload(
    pipeline: &mut SwapPipeline,
    args: &RunArgs,
    rng: &mut SmallRng,
) -> anyhow::Result<()> {
    let mut cold = 0usize;
    for idx in 0..args.keys {
        let key = key_bytes(idx);
        let mut payload = vec![0u8; args.value_len];
        rng.fill(payload.as_mut_slice());
        let value = Value::raw(payload);
        if rng.gen_range(0..100u8) < args.cold_pct {
            pipeline.store().flush(&key, &value)?;
            pipeline.keyspace_mut().mark_cold(key);
            cold += 1;
        } else {
            pipeline.keyspace_mut().insert(key, value);
        }
    }
    tracing::info!(cold, resident = args.keys - cold, "preload complete");
    Ok(())
}

/// Walk the cold partition through the background iterator and report
/// entry and byte counts.
fn scan_store(pipeline: &SwapPipeline) -> anyhow::Result<()> {
    let mut iter = pipeline.iterator()?;
    let mut entries = 0u64;
    let mut bytes = 0u64;
    let mut more = iter.seek_to_first();
    while more {
        if let Some((key, value)) = iter.current() {
            entries += 1;
            bytes += (key.len() + value.len()) as u64;
        }
        more = iter.advance();
    }
    if let Some(err) = iter.take_error() {
        return Err(err.context("store scan failed"));
    }
    tracing::info!(entries, bytes, "store scan complete");
    iter.release();
    Ok(())
}

fn key_bytes(idx: usize) -> Vec<u8> {
    format!("load_k{idx}").into_bytes()
}
