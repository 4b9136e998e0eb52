//! Traffic-shaper emulation: a token-bucket filter feeding two servers.
//!
//! Packets arrive at rate lambda (or per a trace file), queue in Q1 until
//! the bucket holds enough tokens, then move to Q2 where two servers drain
//! them at rate mu. Ctrl-C stops arrivals, drains the queues, and the run
//! ends with the usual statistics block.

mod emu;
mod stats;
mod trace;

use clap::Parser;
use emu::{Config, Emulator};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "shaper", about = "Leaky-bucket traffic shaper emulator")]
struct Args {
    /// Packet arrival rate (packets per second).
    #[arg(long, default_value_t = 1.0)]
    lambda: f64,

    /// Service rate (packets per second).
    #[arg(long, default_value_t = 0.35)]
    mu: f64,

    /// Token arrival rate (tokens per second).
    #[arg(short, long = "rate", default_value_t = 1.5)]
    r: f64,

    /// Token bucket depth.
    #[arg(short = 'B', long = "bucket", default_value_t = 10)]
    bucket: u64,

    /// Tokens required per packet.
    #[arg(short = 'P', long = "tokens", default_value_t = 3)]
    tokens: u64,

    /// Number of packets to arrive.
    #[arg(short = 'n', long = "num", default_value_t = 20)]
    num: u64,

    /// Drive arrivals from a trace file instead of lambda/mu/P.
    #[arg(short = 't', long = "tsfile")]
    tsfile: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let (num, trace) = match &args.tsfile {
        Some(path) => match trace::parse_trace(path) {
            Ok(records) => (records.len() as u64, Some(records)),
            Err(e) => {
                eprintln!("shaper: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => (args.num, None),
    };

    println!("Emulation Parameters:");
    println!("\tnumber to arrive = {}", num);
    if trace.is_none() {
        println!("\tlambda = {}", args.lambda);
        println!("\tmu = {}", args.mu);
    }
    println!("\tr = {}", args.r);
    println!("\tB = {}", args.bucket);
    if trace.is_none() {
        println!("\tP = {}", args.tokens);
    }
    if let Some(path) = &args.tsfile {
        println!("\ttsfile = {}", path.display());
    }
    println!();

    let emulator = Emulator::new(Config {
        lambda: args.lambda,
        mu: args.mu,
        rate: args.r,
        bucket: args.bucket,
        tokens_per_packet: args.tokens,
        num,
        trace,
        quiet: false,
    });

    {
        let emulator = emulator.clone();
        if let Err(e) = ctrlc::set_handler(move || emulator.interrupt()) {
            log::warn!("could not install the SIGINT handler: {}", e);
        }
    }

    let st = emulator.run();
    stats::report(&st);
    ExitCode::SUCCESS
}
