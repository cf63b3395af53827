//! One sample, and the timer discipline wrapped around it.

use thiserror::Error;

use crate::report::ReportSource;
use crate::sigsafe::{RawWrite, LINE_CAP};
use crate::smaps::{Accumulator, Counters, ReportError, REPORT_CAP};
use crate::timer::{IntervalTimer, TimerError};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleError {
    #[error(transparent)]
    Timer(#[from] TimerError),

    #[error(transparent)]
    Report(#[from] ReportError),
}

/// Fixed working memory for a sample: the report snapshot and one line.
///
/// Sized at compile time so the handler never allocates; `const fn new`
/// lets it live in a `static`.
pub struct Scratch<const N: usize = REPORT_CAP, const L: usize = LINE_CAP> {
    report: [u8; N],
    line: [u8; L],
}

impl<const N: usize, const L: usize> Scratch<N, L> {
    pub const fn new() -> Self {
        Scratch {
            report: [0; N],
            line: [0; L],
        }
    }
}

impl<const N: usize, const L: usize> Default for Scratch<N, L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a sample needs besides its scratch memory.
pub struct Sampler<S, W> {
    source: S,
    out: W,
    acc: Accumulator,
    clear_refs: bool,
}

impl<S: ReportSource, W: RawWrite> Sampler<S, W> {
    pub fn new(source: S, out: W, acc: Accumulator, clear_refs: bool) -> Self {
        Sampler {
            source,
            out,
            acc,
            clear_refs,
        }
    }

    pub fn accumulator(&self) -> &Accumulator {
        &self.acc
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    /// Snapshots the report, accumulates it and prints the records.
    pub fn sample<const N: usize, const L: usize>(
        &mut self,
        scratch: &mut Scratch<N, L>,
    ) -> Result<Counters, ReportError> {
        let snap = self.source.fill(&mut scratch.report)?;
        let totals = self
            .acc
            .run(&scratch.report[..snap.len], &mut scratch.line, &mut self.out)?;
        if self.clear_refs {
            self.source.reset_referenced();
        }
        Ok(totals)
    }

    /// Timer-expiry entry point.
    ///
    /// Reads the countdown left before the next expiry, samples, then puts
    /// that same countdown back. Reading smaps can cost a lot of system time
    /// that `ITIMER_PROF` also charges; restoring the saved value keeps that
    /// cost from eating into the host's next interval.
    pub fn on_timer<T: IntervalTimer, const N: usize, const L: usize>(
        &mut self,
        timer: &T,
        scratch: &mut Scratch<N, L>,
    ) -> Result<Counters, SampleError> {
        let saved = timer.get()?;
        if !saved.is_armed() {
            return Err(TimerError::Expired.into());
        }
        let result = self.sample(scratch);
        timer.set(saved)?;
        Ok(result?)
    }
}
