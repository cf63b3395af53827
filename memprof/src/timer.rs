//! The CPU-time interval timer that drives sampling.
//!
//! `ITIMER_PROF` counts down only while the process is running (user plus
//! system time) and delivers `SIGPROF`, so a stopped or sleeping process is
//! not sampled and wall-clock timers the host may rely on are left alone.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    #[error("{op} failed (errno {errno})")]
    Syscall { op: &'static str, errno: i32 },

    #[error("timer has already expired on entry to the sampler")]
    Expired,
}

/// A countdown plus the period it reloads with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimerSetting {
    pub value: Duration,
    pub interval: Duration,
}

impl TimerSetting {
    pub const DISARMED: TimerSetting = TimerSetting {
        value: Duration::ZERO,
        interval: Duration::ZERO,
    };

    pub fn periodic(period: Duration) -> Self {
        TimerSetting {
            value: period,
            interval: period,
        }
    }

    pub fn is_armed(&self) -> bool {
        !self.value.is_zero()
    }
}

/// Read and re-arm access to an interval timer. Both calls must be
/// async-signal-safe.
pub trait IntervalTimer {
    fn get(&self) -> Result<TimerSetting, TimerError>;

    /// Installs `setting` and returns the one it replaced.
    fn set(&self, setting: TimerSetting) -> Result<TimerSetting, TimerError>;
}

/// The process-wide `ITIMER_PROF` timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProfTimer;

impl IntervalTimer for ProfTimer {
    fn get(&self) -> Result<TimerSetting, TimerError> {
        let mut cur = zeroed_itimerval();
        // SAFETY: `cur` is a valid out-pointer for the duration of the call.
        let ret = unsafe { libc::getitimer(libc::ITIMER_PROF, &mut cur) };
        if ret != 0 {
            return Err(syscall_error("getitimer"));
        }
        Ok(from_itimerval(&cur))
    }

    fn set(&self, setting: TimerSetting) -> Result<TimerSetting, TimerError> {
        let new = to_itimerval(&setting);
        let mut old = zeroed_itimerval();
        // SAFETY: both pointers are valid for the duration of the call.
        let ret = unsafe { libc::setitimer(libc::ITIMER_PROF, &new, &mut old) };
        if ret != 0 {
            return Err(syscall_error("setitimer"));
        }
        Ok(from_itimerval(&old))
    }
}

fn syscall_error(op: &'static str) -> TimerError {
    TimerError::Syscall {
        op,
        errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
    }
}

fn zeroed_itimerval() -> libc::itimerval {
    libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
    }
}

fn to_timeval(d: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: d.as_secs() as libc::time_t,
        tv_usec: d.subsec_micros() as libc::suseconds_t,
    }
}

fn from_timeval(tv: &libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

fn to_itimerval(s: &TimerSetting) -> libc::itimerval {
    libc::itimerval {
        it_interval: to_timeval(s.interval),
        it_value: to_timeval(s.value),
    }
}

fn from_itimerval(it: &libc::itimerval) -> TimerSetting {
    TimerSetting {
        value: from_timeval(&it.it_value),
        interval: from_timeval(&it.it_interval),
    }
}
