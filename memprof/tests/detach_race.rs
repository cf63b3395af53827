//! Detaching while other threads keep taking SIGPROF. Own test binary: the
//! timer and the signal are process-wide.

#[macro_use]
extern crate scan_fmt;

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use memprof::{Config, IntervalTimer, Output, ProfTimer};

const BURNERS: usize = 4;
const ROUNDS: usize = 200;
const ERRNO_MARK: libc::c_int = 4242;

fn errno() -> libc::c_int {
    unsafe { *libc::__errno_location() }
}

/// Burns CPU until told to stop. Nothing here touches errno, so any change
/// to it can only come from a signal handler that ran on this thread.
fn spin_until(stop: &AtomicBool) -> u64 {
    unsafe { *libc::__errno_location() = ERRNO_MARK };
    let mut x: u64 = 1;
    while !stop.load(Ordering::Relaxed) {
        for i in 0..10_000u64 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(i);
        }
        assert_eq!(errno(), ERRNO_MARK);
    }
    x
}

#[test]
fn timer_stays_disarmed_after_detach_under_load() {
    let out = tempfile::NamedTempFile::new().unwrap();
    let config = Config {
        period: Duration::from_micros(500),
        output: Output::Path(out.path().to_path_buf()),
        ..Config::default()
    };

    let stop = Arc::new(AtomicBool::new(false));
    let burners: Vec<_> = (0..BURNERS)
        .map(|_| {
            let stop = Arc::clone(&stop);
            thread::spawn(move || spin_until(&stop))
        })
        .collect();

    let mut samples = 0;
    for round in 0..ROUNDS {
        memprof::attach(&config).unwrap();
        thread::sleep(Duration::from_millis(5));
        memprof::detach().unwrap();

        let left = ProfTimer.get().unwrap();
        assert!(!left.is_armed(), "round {}: timer still armed: {:?}", round, left);
        assert!(left.interval.is_zero(), "round {}: {:?}", round, left);

        // Each attach truncates the output. Records must never interleave,
        // whichever thread took the signal.
        let text = fs::read_to_string(out.path()).unwrap();
        for (i, line) in text.lines().enumerate() {
            let (pid, sample) =
                scan_fmt!(line, "== {d} sample {d} totals ==", u32, u64).unwrap();
            assert_eq!(pid, std::process::id());
            assert_eq!(sample, i as u64 + 1, "round {}:\n{}", round, text);
        }
        samples += text.lines().count();
    }

    stop.store(true, Ordering::Relaxed);
    for burner in burners {
        burner.join().unwrap();
    }
    assert!(samples > 0, "no sample was taken in {} rounds", ROUNDS);
}
