//! Access to the kernel's mapping report.
//!
//! The descriptor is opened once at attach time and rewound for every
//! sample. [`ReportSource::fill`] is called from the signal handler and uses
//! raw `lseek`/`read` only.

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::Path;

use crate::smaps::ReportError;

const SELF_SMAPS: &str = "/proc/self/smaps";

/// How much of the report a [`ReportSource::fill`] captured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub len: usize,
    /// The report did not fit and was cut back to its last complete line.
    pub truncated: bool,
}

/// Somewhere a full mapping report can be pulled from.
pub trait ReportSource {
    /// Reads the whole current report into `buf` from its beginning.
    fn fill(&mut self, buf: &mut [u8]) -> Result<Snapshot, ReportError>;

    /// Best-effort reset of the kernel's referenced bits after a sample.
    fn reset_referenced(&mut self) {}
}

/// An open `smaps` file, by default `/proc/self/smaps`.
#[derive(Debug)]
pub struct ProcReport {
    fd: OwnedFd,
}

impl ProcReport {
    pub fn open_self() -> io::Result<Self> {
        Self::open(SELF_SMAPS)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(ProcReport { fd: file.into() })
    }

    /// Copies the raw report to `out` with ordinary I/O. Not for signal
    /// context.
    pub fn copy_to<W: io::Write>(&mut self, out: &mut W) -> io::Result<u64> {
        self.rewind().map_err(io::Error::from_raw_os_error)?;
        let mut buffer = [0u8; 4096];
        let mut total = 0;
        loop {
            let n = read_some(self.fd.as_raw_fd(), &mut buffer)
                .map_err(io::Error::from_raw_os_error)?;
            if n == 0 {
                break;
            }
            out.write_all(&buffer[..n])?;
            total += n as u64;
        }
        out.flush()?;
        Ok(total)
    }

    fn rewind(&mut self) -> Result<(), i32> {
        // SAFETY: plain syscall on a descriptor we own.
        let off = unsafe { libc::lseek(self.fd.as_raw_fd(), 0, libc::SEEK_SET) };
        if off == 0 {
            Ok(())
        } else {
            Err(last_errno())
        }
    }
}

impl ReportSource for ProcReport {
    fn fill(&mut self, buf: &mut [u8]) -> Result<Snapshot, ReportError> {
        self.rewind().map_err(|errno| ReportError::Read { errno })?;
        let fd = self.fd.as_raw_fd();
        let mut filled = 0;
        while filled < buf.len() {
            match read_some(fd, &mut buf[filled..]) {
                Ok(0) => return Ok(Snapshot { len: filled, truncated: false }),
                Ok(n) => filled += n,
                Err(errno) => return Err(ReportError::Read { errno }),
            }
        }
        // Full buffer: only truncated if the kernel still has more to give.
        let mut probe = [0u8; 1];
        match read_some(fd, &mut probe) {
            Ok(0) => Ok(Snapshot { len: filled, truncated: false }),
            Ok(_) => Ok(Snapshot {
                len: trim_to_last_line(&buf[..filled]),
                truncated: true,
            }),
            Err(errno) => Err(ReportError::Read { errno }),
        }
    }

    fn reset_referenced(&mut self) {
        clear_refs();
    }
}

/// Length of `buf` up to and including its last newline.
pub fn trim_to_last_line(buf: &[u8]) -> usize {
    buf.iter().rposition(|&b| b == b'\n').map_or(0, |nl| nl + 1)
}

/// Asks the kernel to clear the referenced bits of every mapping, so the next
/// sample's `Referenced` figures cover one interval. Failures are ignored.
pub fn clear_refs() {
    // SAFETY: open/write/close are async-signal-safe; the path is a valid C
    // string and the buffer outlives the call.
    unsafe {
        let fd = libc::open(
            c"/proc/self/clear_refs".as_ptr(),
            libc::O_WRONLY | libc::O_CLOEXEC,
        );
        if fd != -1 {
            let msg = b"1\n";
            let _ = libc::write(fd, msg.as_ptr().cast(), msg.len());
            libc::close(fd);
        }
    }
}

fn read_some(fd: libc::c_int, buf: &mut [u8]) -> Result<usize, i32> {
    loop {
        // SAFETY: the pointer and length describe a live, writable slice.
        let ret = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let errno = last_errno();
        if errno != libc::EINTR {
            return Err(errno);
        }
    }
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn report_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn fills_whole_report_and_rereads_from_start() {
        let file = report_file(b"00400000-00401000 r-xp 00000000 08:01 1\nRss: 4 kB\n");
        let mut report = ProcReport::open(file.path()).unwrap();
        let mut buf = [0u8; 256];
        let first = report.fill(&mut buf).unwrap();
        assert_eq!(first, Snapshot { len: 50, truncated: false });
        let second = report.fill(&mut buf).unwrap();
        assert_eq!(first, second);
        assert_eq!(&buf[45..50], b"4 kB\n");
    }

    #[test]
    fn exact_fit_is_not_truncated() {
        let file = report_file(b"Rss: 4 kB\n");
        let mut report = ProcReport::open(file.path()).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(
            report.fill(&mut buf).unwrap(),
            Snapshot { len: 10, truncated: false }
        );
    }

    #[test]
    fn oversized_report_is_cut_at_a_line_boundary() {
        let file = report_file(b"Rss: 4 kB\nSize: 8 kB\nReferenced: 0 kB\n");
        let mut report = ProcReport::open(file.path()).unwrap();
        let mut buf = [0u8; 25];
        let snap = report.fill(&mut buf).unwrap();
        assert_eq!(snap, Snapshot { len: 21, truncated: true });
        assert_eq!(&buf[..snap.len], b"Rss: 4 kB\nSize: 8 kB\n");
    }

    #[test]
    fn trim_without_any_newline_keeps_nothing() {
        assert_eq!(trim_to_last_line(b"partial"), 0);
        assert_eq!(trim_to_last_line(b"a\nb"), 2);
    }

    #[test]
    fn copy_to_rewinds_first() {
        let file = report_file(b"line one\nline two\n");
        let mut report = ProcReport::open(file.path()).unwrap();
        let mut buf = [0u8; 64];
        report.fill(&mut buf).unwrap();

        let mut copy = Vec::new();
        assert_eq!(report.copy_to(&mut copy).unwrap(), 18);
        assert_eq!(copy, b"line one\nline two\n");
    }

    #[test]
    fn opening_a_missing_report_fails() {
        assert!(ProcReport::open("/nonexistent/smaps").is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn own_smaps_is_readable() {
        let mut report = ProcReport::open_self().unwrap();
        let mut buf = vec![0u8; crate::smaps::REPORT_CAP];
        let snap = report.fill(&mut buf).unwrap();
        assert!(snap.len > 0);
        report.reset_referenced();
    }
}
