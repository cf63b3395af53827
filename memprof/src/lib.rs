//! In-process memory sampler.
//!
//! Once attached, `ITIMER_PROF` delivers SIGPROF every configured period of
//! CPU time. The handler re-reads `/proc/self/smaps` into a fixed buffer,
//! folds every mapping's Rss/dirty/shared/referenced figures into per-sample
//! totals and writes them out with raw `write(2)` calls. Nothing on that path
//! allocates, so the sampler is usable from early process startup and from
//! inside arbitrary host code.
//!
//! Output records look like
//!
//! ```text
//! == 0000012345 sample 0000000003 totals == size 0000102400 kB, resident 0000004096 kB, ...
//! ```

#[macro_use]
extern crate log;

extern crate chrono;
extern crate libc;

pub mod config;
pub mod lifecycle;
pub mod report;
pub mod sampler;
pub mod sigsafe;
pub mod smaps;
pub mod timer;

pub use config::{Config, ConfigError, Output};
pub use lifecycle::{attach, attach_from_env, detach, AttachError};
pub use report::{ProcReport, ReportSource, Snapshot};
pub use sampler::{SampleError, Sampler, Scratch};
pub use smaps::{Accumulator, Counters, MappingHeader, Perms, ReportError, Stat};
pub use timer::{IntervalTimer, ProfTimer, TimerError, TimerSetting};
