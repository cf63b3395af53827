extern crate memprof;
extern crate simplelog;

#[macro_use]
extern crate log;

use std::env;
use std::process;
use std::time::Duration;

use chrono::Utc;
use simplelog::*;

const RUN_SECONDS: u64 = 5;
const CHUNK: usize = 64 * 1024;

fn main() {
    if let Err(e) = CombinedLogger::init(vec![TermLogger::new(
        LevelFilter::Debug,
        simplelog::Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )]) {
        eprintln!("cannot initialise logging: {}", e);
    }

    let args: Vec<String> = env::args().collect();
    let seconds = match args.get(1).map(|s| s.parse::<u64>()) {
        None => RUN_SECONDS,
        Some(Ok(s)) => s,
        Some(Err(e)) => {
            error!("bad run time {:?}: {}", args[1], e);
            process::exit(2);
        }
    };

    let mut config = match memprof::Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            process::exit(2);
        }
    };
    if let Some(period) = args.get(2) {
        match period.parse::<u64>() {
            Ok(us) if us > 0 => config.period = Duration::from_micros(us),
            _ => {
                error!("bad sample period {:?}", period);
                process::exit(2);
            }
        }
    }

    if let Err(e) = memprof::attach(&config) {
        error!("{}", e);
        process::exit(1);
    }

    info!("touching memory for {} s of wall time", seconds);
    let start_time = Utc::now();
    let checksum = churn(Duration::from_secs(seconds));
    info!(
        "---------- Completed run in {} ms (checksum {:x}) ----------",
        (Utc::now() - start_time).num_milliseconds(),
        checksum
    );
    // Returning runs the exit hook, which dumps smaps if asked to.
}

/// Burns CPU while growing and rewriting heap memory, so successive samples
/// show resident and dirty figures moving.
fn churn(duration: Duration) -> u64 {
    let deadline = std::time::Instant::now() + duration;
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut checksum: u64 = 0;
    while std::time::Instant::now() < deadline {
        if chunks.len() < 1024 {
            chunks.push(vec![0u8; CHUNK]);
        }
        for (i, chunk) in chunks.iter_mut().enumerate() {
            for byte in chunk.iter_mut().step_by(4096) {
                *byte = byte.wrapping_add(i as u8);
                checksum = checksum.wrapping_mul(31).wrapping_add(u64::from(*byte));
            }
        }
    }
    checksum
}
