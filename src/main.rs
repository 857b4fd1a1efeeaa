use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use cachelab_sim::{
    Geometry, Simulator, TraceFile,
    transpose::{TRANSPOSERS, evaluate},
};
use clap::{Args, Parser, Subcommand};
use env_logger::Env;

#[derive(Parser)]
#[command(name = "csim", version, about = "Set-associative LRU cache simulator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a valgrind memory trace and count hits, misses and evictions
    Sim(SimArgs),
    /// Score the registered matrix transposers on a 1KB direct-mapped cache
    Trans(TransArgs),
}

#[derive(Args)]
struct SimArgs {
    /// Number of set index bits
    #[arg(short = 's', long = "set-bits")]
    set_bits: u32,

    /// Number of lines per set
    #[arg(short = 'E', long = "lines")]
    lines: usize,

    /// Number of block offset bits
    #[arg(short = 'b', long = "block-bits")]
    block_bits: u32,

    /// Trace file
    #[arg(short = 't', long = "trace")]
    trace: PathBuf,

    /// Print the outcome of every trace record
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args)]
struct TransArgs {
    /// Number of columns in the source matrix
    #[arg(short = 'M', default_value = "32")]
    cols: usize,

    /// Number of rows in the source matrix
    #[arg(short = 'N', default_value = "32")]
    rows: usize,
}

fn main() -> Result<()> {
    let env = Env::default()
        .filter_or("CSIM_LOG", "warn")
        .write_style_or("CSIM_LOG_STYLE", "auto");
    env_logger::init_from_env(env);

    match Cli::parse().command {
        Command::Sim(args) => run_sim(args),
        Command::Trans(args) => run_trans(args),
    }
}

fn run_sim(args: SimArgs) -> Result<()> {
    let geometry =
        Geometry::new(args.set_bits, args.lines, args.block_bits).context("Bad argument value")?;
    let trace = TraceFile::load(&args.trace)?;

    let mut sim = Simulator::new(geometry);
    if args.verbose {
        sim = sim.with_verbose();
    }
    let stats = sim.run_trace(&trace.entries);
    for line in sim.verbose_log() {
        println!("{line}");
    }
    println!("{stats}");
    Ok(())
}

fn run_trans(args: TransArgs) -> Result<()> {
    let mut failed = Vec::new();
    for transposer in &TRANSPOSERS {
        let eval = evaluate(transposer, args.rows, args.cols)?;
        println!("\n== {} ==", transposer.description);
        println!(
            "  {}x{} correct:{} {} ({} references)",
            args.rows,
            args.cols,
            if eval.correct { "yes" } else { "no" },
            eval.stats,
            eval.references
        );
        if !eval.correct {
            failed.push(transposer.description);
        }
    }
    if !failed.is_empty() {
        bail!("incorrect transpose: {}", failed.join(", "));
    }
    Ok(())
}
