//! Async-signal-safe building blocks.
//!
//! Everything in this module may be called from inside the SIGPROF handler:
//! no heap allocation, no locks, no buffered stdio, only raw syscalls that
//! POSIX lists as async-signal-safe. Code reachable from the handler must
//! stay within this module, [`crate::smaps`] and [`crate::report::ReportSource`].

pub mod line;
pub mod num;
pub mod out;

pub use line::{Line, LineReader, LINE_CAP};
pub use num::{fmt_dec, fmt_hex, DEC_MAX_LEN, DEC_WIDTH, HEX_LEN};
pub use out::{FdWriter, RawWrite};
