//! Attaching the sampler to the current process and tearing it down.
//!
//! The sampler and its scratch memory live in one static slot. The slot is
//! written only by `attach`/`detach` while the state is BUSY, and read only
//! by the SIGPROF handler (while ATTACHED) and the exit hook.

use std::cell::UnsafeCell;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::mem::{self, ManuallyDrop};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread;

use chrono::Utc;
use thiserror::Error;

use crate::config::{Config, Output};
use crate::report::ProcReport;
use crate::sampler::{Sampler, Scratch};
use crate::sigsafe::FdWriter;
use crate::smaps::Accumulator;
use crate::timer::{IntervalTimer, ProfTimer, TimerError, TimerSetting};

#[derive(Error, Debug)]
pub enum AttachError {
    #[error("memprof is already attached")]
    AlreadyAttached,

    #[error("memprof is not attached")]
    NotAttached,

    #[error("cannot open the mapping report: {0}")]
    Report(#[source] io::Error),

    #[error("cannot open output {path}: {source}")]
    Output {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("SIGPROF already has a handler installed")]
    HandlerConflict,

    #[error("sigaction failed: {0}")]
    Sigaction(#[source] io::Error),

    #[error(transparent)]
    Timer(#[from] TimerError),
}

const IDLE: u8 = 0;
const BUSY: u8 = 1;
const ATTACHED: u8 = 2;

struct Slot {
    state: AtomicU8,
    in_handler: AtomicBool,
    dump_at_exit: AtomicBool,
    exit_hook: AtomicBool,
    sampler: UnsafeCell<Option<Sampler<ProcReport, FdWriter>>>,
    scratch: UnsafeCell<Scratch>,
}

// SAFETY: the cells are only mutated by attach/detach while the state is
// BUSY and no handler invocation is in flight; the handler touches them only
// while ATTACHED and guards itself with `in_handler`.
unsafe impl Sync for Slot {}

static SLOT: Slot = Slot {
    state: AtomicU8::new(IDLE),
    in_handler: AtomicBool::new(false),
    dump_at_exit: AtomicBool::new(false),
    exit_hook: AtomicBool::new(false),
    sampler: UnsafeCell::new(None),
    scratch: UnsafeCell::new(Scratch::new()),
};

/// Starts sampling the current process as described by `config`.
///
/// Opens `/proc/self/smaps`, waits out the startup delay, installs the
/// SIGPROF handler and arms `ITIMER_PROF`. Fails if the sampler is already
/// running or SIGPROF belongs to somebody else.
pub fn attach(config: &Config) -> Result<(), AttachError> {
    if SLOT
        .state
        .compare_exchange(IDLE, BUSY, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(AttachError::AlreadyAttached);
    }
    match install(config) {
        Ok(()) => {
            SLOT.state.store(ATTACHED, Ordering::SeqCst);
            Ok(())
        }
        Err(e) => {
            // SAFETY: no handler is installed on any failure path.
            if let Some(sampler) = unsafe { (*SLOT.sampler.get()).take() } {
                close_output(sampler.output());
            }
            SLOT.state.store(IDLE, Ordering::SeqCst);
            Err(e)
        }
    }
}

fn install(config: &Config) -> Result<(), AttachError> {
    let source = ProcReport::open_self().map_err(AttachError::Report)?;
    let out = open_output(&config.output)?;

    if !config.startup_delay.is_zero() {
        info!(
            "delaying startup by {} s (pid {})",
            config.startup_delay.as_secs(),
            std::process::id()
        );
        thread::sleep(config.startup_delay);
    }

    let acc = Accumulator::new(std::process::id(), page_size(), config.verbose);
    // SAFETY: state is BUSY, so nobody else touches the slot and the handler
    // is not installed yet.
    unsafe { *SLOT.sampler.get() = Some(Sampler::new(source, out, acc, config.clear_refs)) };
    SLOT.dump_at_exit.store(config.dump_at_exit, Ordering::Release);

    // Handler first: a SIGPROF arriving with the default disposition would
    // terminate the host.
    install_handler()?;
    if let Err(e) = ProfTimer.set(TimerSetting::periodic(config.period)) {
        let _ = restore_default_handler();
        return Err(e.into());
    }

    if !SLOT.exit_hook.swap(true, Ordering::AcqRel) {
        // SAFETY: registering a plain extern "C" fn.
        if unsafe { libc::atexit(on_exit) } != 0 {
            warn!("could not register the exit hook; no dump at exit");
        }
    }

    info!(
        "sampling pid {} every {} us of CPU time{}",
        std::process::id(),
        config.period.as_micros(),
        if config.verbose { ", verbose" } else { "" }
    );
    Ok(())
}

/// Stops sampling: disarms the timer and gives SIGPROF back.
///
/// An invocation already running on another thread re-arms the timer when it
/// finishes, so it is waited out before disarming. Later invocations see the
/// state is no longer ATTACHED and leave the timer alone.
pub fn detach() -> Result<(), AttachError> {
    if SLOT
        .state
        .compare_exchange(ATTACHED, BUSY, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(AttachError::NotAttached);
    }
    wait_for_handler();
    let disarmed = ProfTimer.set(TimerSetting::DISARMED);
    let restored = restore_default_handler();
    // SAFETY: the state is BUSY and no invocation is in flight.
    let sampler = unsafe { (*SLOT.sampler.get()).take() };
    if let Some(sampler) = sampler {
        debug!(
            "detached after {} samples",
            sampler.accumulator().sample_index()
        );
        close_output(sampler.output());
    }
    SLOT.state.store(IDLE, Ordering::SeqCst);
    disarmed?;
    restored
}

/// Reads [`Config`] from the environment and attaches, aborting the process
/// if either step fails.
pub fn attach_from_env() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("memprof: {}", e);
            std::process::abort();
        }
    };
    if let Err(e) = attach(&config) {
        error!("memprof: {}", e);
        std::process::abort();
    }
}

fn open_output(output: &Output) -> Result<FdWriter, AttachError> {
    match output {
        Output::Stderr => Ok(FdWriter::stderr()),
        Output::Path(path) => OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map(|file| FdWriter::new(file.into_raw_fd()))
            .map_err(|source| AttachError::Output {
                path: path.display().to_string(),
                source,
            }),
    }
}

fn close_output(out: &FdWriter) {
    if out.fd() != libc::STDERR_FILENO {
        // SAFETY: the descriptor came from `into_raw_fd` in `open_output` and
        // nothing else holds it.
        drop(unsafe { File::from_raw_fd(out.fd()) });
    }
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

fn install_handler() -> Result<(), AttachError> {
    // SAFETY: sigaction structs are plain data; a null new-action only
    // queries.
    unsafe {
        let mut old: libc::sigaction = mem::zeroed();
        if libc::sigaction(libc::SIGPROF, std::ptr::null(), &mut old) != 0 {
            return Err(AttachError::Sigaction(io::Error::last_os_error()));
        }
        if old.sa_sigaction != libc::SIG_DFL {
            return Err(AttachError::HandlerConflict);
        }

        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = on_sigprof as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGPROF, &action, std::ptr::null_mut()) != 0 {
            return Err(AttachError::Sigaction(io::Error::last_os_error()));
        }
    }
    Ok(())
}

fn restore_default_handler() -> Result<(), AttachError> {
    // Going through SIG_IGN discards a SIGPROF that is already pending, which
    // would otherwise kill the process under SIG_DFL.
    for disposition in [libc::SIG_IGN, libc::SIG_DFL] {
        // SAFETY: as in `install_handler`.
        unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = disposition;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(libc::SIGPROF, &action, std::ptr::null_mut()) != 0 {
                return Err(AttachError::Sigaction(io::Error::last_os_error()));
            }
        }
    }
    Ok(())
}

extern "C" fn on_sigprof(_sig: libc::c_int) {
    // In a multithreaded host a second thread can take SIGPROF while the
    // first is still sampling; it just skips its turn.
    if SLOT.in_handler.swap(true, Ordering::SeqCst) {
        return;
    }
    if SLOT.state.load(Ordering::SeqCst) == ATTACHED {
        // SAFETY: errno is thread-local; it is put back before returning.
        let errno = unsafe { *libc::__errno_location() };

        // SAFETY: `in_handler` plus the ATTACHED state give this invocation
        // exclusive use of the slot.
        let (sampler, scratch) =
            unsafe { (&mut *SLOT.sampler.get(), &mut *SLOT.scratch.get()) };
        if let Some(sampler) = sampler {
            if let Err(e) = sampler.on_timer(&ProfTimer, scratch) {
                let mut err = FdWriter::stderr();
                let _ = writeln!(err, "memprof: fatal: {}", e);
                // SAFETY: abort is async-signal-safe.
                unsafe { libc::abort() };
            }
        }

        // SAFETY: as above.
        unsafe { *libc::__errno_location() = errno };
    }
    SLOT.in_handler.store(false, Ordering::SeqCst);
}

/// Blocks until no handler invocation is running. Callers move the state
/// away from ATTACHED first, so none can start afterwards.
fn wait_for_handler() {
    while SLOT.in_handler.load(Ordering::SeqCst) {
        std::hint::spin_loop();
    }
}

extern "C" fn on_exit() {
    // Stop sampling first so the handler can't rewind the report under us.
    if SLOT
        .state
        .compare_exchange(ATTACHED, BUSY, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }
    wait_for_handler();
    let _ = ProfTimer.set(TimerSetting::DISARMED);
    if SLOT.dump_at_exit.load(Ordering::Acquire) {
        dump_at_exit();
    }
}

fn dump_at_exit() {
    // SAFETY: the timer is disarmed and no handler invocation is running.
    let Some(sampler) = (unsafe { &mut *SLOT.sampler.get() }) else {
        return;
    };
    let fd = sampler.output().fd();
    // SAFETY: borrow the output descriptor without taking ownership of it.
    let mut out = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
    write_dump(sampler.source_mut(), &mut *out);
}

/// Copies the whole raw report to `out`, or a one-line apology if it can't be
/// read.
fn write_dump<W: Write>(source: &mut ProcReport, out: &mut W) {
    let started = Utc::now();
    match source.copy_to(out) {
        Ok(bytes) => debug!(
            "dumped {} bytes of smaps at exit in {} ms",
            bytes,
            (Utc::now() - started).num_milliseconds()
        ),
        Err(e) => {
            error!("exit dump failed: {}", e);
            let _ = out.write_all(b"Couldn't read from smaps!\n");
        }
    }
    let _ = out.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detach_without_attach_is_an_error() {
        assert!(matches!(detach(), Err(AttachError::NotAttached)));
    }

    #[test]
    fn unwritable_output_is_reported() {
        let err = open_output(&Output::Path("/nonexistent/dir/out".into())).unwrap_err();
        assert!(err.to_string().starts_with("cannot open output /nonexistent/dir/out"));
    }

    #[test]
    fn dump_copies_the_raw_report() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"00400000-00401000 r-xp 00000000 08:01 1\nRss: 4 kB\n")
            .unwrap();
        let mut source = ProcReport::open(file.path()).unwrap();
        let mut out = Vec::new();
        write_dump(&mut source, &mut out);
        assert_eq!(out, b"00400000-00401000 r-xp 00000000 08:01 1\nRss: 4 kB\n");
    }

    #[test]
    fn unreadable_report_dumps_an_apology() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = ProcReport::open(dir.path()).unwrap();
        let mut out = Vec::new();
        write_dump(&mut source, &mut out);
        assert_eq!(out, b"Couldn't read from smaps!\n");
    }

    #[test]
    fn page_size_is_a_whole_number_of_kilobytes() {
        let size = page_size();
        assert!(size >= 4096);
        assert_eq!(size % 1024, 0);
    }
}
