//! Directory controller simulator.
//!
//! Drives one controller with a deterministic pseudo-random load/store workload
//! through the loopback network and prints the controller statistics.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cmpdir::{Access, CacheCoherenceController, ControllerConfig, DirectoryKind, Loopback, NodeId};

#[derive(Parser, Debug)]
#[command(name = "cmpdir-sim")]
#[command(about = "Simulate a tile directory controller under a synthetic workload")]
struct Args {
    /// Private caches issuing requests.
    #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u16).range(1..=128))]
    nodes: u16,

    /// Directory storage: `infinite` or `set:<sets>x<ways>`.
    #[arg(long, default_value = "infinite")]
    directory: DirectoryKind,

    /// Distinct lines touched by the workload.
    #[arg(long, default_value_t = 64, value_parser = clap::value_parser!(u64).range(1..))]
    lines: u64,

    /// Accesses to perform.
    #[arg(long, default_value_t = 2_000)]
    ops: u64,

    /// Percentage of accesses that are stores.
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u8).range(0..=100))]
    write_percent: u8,

    /// Evict a random private copy every N accesses (0 disables).
    #[arg(long, default_value_t = 7)]
    evict_every: u64,

    /// Replace a tile-cache line every N accesses (0 disables).
    #[arg(long, default_value_t = 50)]
    replace_every: u64,

    /// Network delay in cycles.
    #[arg(long, default_value_t = 4)]
    delay: u64,

    #[arg(long, default_value_t = 16)]
    queue_size: usize,

    #[arg(long, default_value_t = 32)]
    maf_size: usize,

    /// Seed for the workload generator; equal seeds replay the same run.
    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,

    /// Give up if the run has not drained after this many ticks.
    #[arg(long, default_value_t = 1_000_000)]
    max_ticks: u64,

    /// Restore the directory from a snapshot before the run.
    #[arg(long)]
    load_directory: Option<PathBuf>,

    /// Write a directory snapshot after the run.
    #[arg(long)]
    save_directory: Option<PathBuf>,
}

const BASE: u64 = 0x10_0000;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    // The tile id sits just above the private caches.
    let tile = args.nodes;
    let config = ControllerConfig::default()
        .with_name("sim")
        .with_tile(tile)
        .with_num_nodes(usize::from(args.nodes))
        .with_queue_size(args.queue_size)
        .with_maf_size(args.maf_size)
        .with_directory(args.directory);
    let block = config.block_size;
    let mut ctrl = CacheCoherenceController::new(config)?;
    let mut net = Loopback::new(tile, args.delay);

    if let Some(path) = &args.load_directory {
        let restored = ctrl.load_directory(BufReader::new(File::open(path)?))?;
        let copies = net.adopt_directory(ctrl.directory());
        log::info!("restored {restored} directory entries ({copies} private copies) from {}", path.display());
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let store_ratio = f64::from(args.write_percent) / 100.0;
    let (mut hits, mut misses, mut busy) = (0u64, 0u64, 0u64);
    let mut done = 0;
    while done < args.ops {
        let node: NodeId = rng.gen_range(0..args.nodes);
        let address = BASE + rng.gen_range(0..args.lines) * block;
        let write = rng.gen_bool(store_ratio);
        loop {
            match net.access(&mut ctrl, node, address, write)? {
                Access::Hit => hits += 1,
                Access::Issued(_) => misses += 1,
                Access::Busy => {
                    busy += 1;
                    net.step(&mut ctrl)?;
                    continue;
                }
            }
            break;
        }
        done += 1;

        if args.evict_every > 0 && done % args.evict_every == 0 {
            let victim: NodeId = rng.gen_range(0..args.nodes);
            let line = BASE + rng.gen_range(0..args.lines) * block;
            net.evict(victim, line);
        }
        if args.replace_every > 0 && done % args.replace_every == 0 {
            ctrl.schedule_replacement(BASE + rng.gen_range(0..args.lines) * block);
        }
        net.step(&mut ctrl)?;
    }
    let drain = net.run_until_quiesced(&mut ctrl, args.max_ticks)?;

    println!("{}", ctrl.stats());
    println!(
        "Workload: {} accesses, {} hits, {} misses, {} retries, drained in {} cycles",
        args.ops, hits, misses, busy, drain
    );
    println!(
        "Traffic: {} replies, {} multicasts, {} memory messages",
        net.replies().len(),
        net.multicasts().len(),
        net.memory_traffic().len()
    );

    if let Some(path) = &args.save_directory {
        let saved = ctrl.save_directory(BufWriter::new(File::create(path)?))?;
        println!("Saved {saved} directory entries to {}", path.display());
    }
    Ok(())
}
