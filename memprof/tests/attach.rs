//! Attaches to the test process itself. Kept in its own test binary because
//! SIGPROF and ITIMER_PROF are process-wide.

#[macro_use]
extern crate scan_fmt;

use std::fs;
use std::time::{Duration, Instant};

use memprof::{AttachError, Config, Output};

fn burn_cpu(for_at_least: Duration) -> u64 {
    let deadline = Instant::now() + for_at_least;
    let mut x: u64 = 1;
    while Instant::now() < deadline {
        for i in 0..10_000u64 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(i);
        }
    }
    x
}

#[test]
fn samples_own_process_until_detached() {
    let out = tempfile::NamedTempFile::new().unwrap();
    let config = Config {
        period: Duration::from_millis(10),
        output: Output::Path(out.path().to_path_buf()),
        ..Config::default()
    };

    memprof::attach(&config).unwrap();
    assert!(matches!(
        memprof::attach(&config),
        Err(AttachError::AlreadyAttached)
    ));

    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        burn_cpu(Duration::from_millis(200));
        let text = fs::read_to_string(out.path()).unwrap();
        if text.lines().count() >= 3 {
            break;
        }
    }
    memprof::detach().unwrap();
    assert!(matches!(memprof::detach(), Err(AttachError::NotAttached)));

    let text = fs::read_to_string(out.path()).unwrap();
    let records: Vec<(u32, u64, u64, u64)> = text
        .lines()
        .map(|line| {
            scan_fmt!(
                line,
                "== {d} sample {d} totals == size {d} kB, resident {d} kB",
                u32,
                u64,
                u64,
                u64
            )
            .unwrap()
        })
        .collect();

    assert!(records.len() >= 3, "only {} samples:\n{}", records.len(), text);
    for (i, &(pid, sample, size, resident)) in records.iter().enumerate() {
        assert_eq!(pid, std::process::id());
        assert_eq!(sample, i as u64 + 1);
        assert!(resident > 0);
        assert!(size >= resident);
    }

    // The signal is free again, so a second attach works.
    memprof::attach(&config).unwrap();
    memprof::detach().unwrap();
}
