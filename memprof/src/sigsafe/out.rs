//! Raw, unbuffered output.

use std::fmt;
use std::os::unix::io::RawFd;

use super::num::{fmt_dec, fmt_hex, DEC_MAX_LEN, HEX_LEN};

/// A byte sink the sampler writes its records to.
///
/// Implementations used from the signal handler must not allocate or take
/// locks. Write failures are swallowed: there is nobody to report them to.
pub trait RawWrite {
    fn write_raw(&mut self, bytes: &[u8]);

    fn write_dec(&mut self, n: u64) {
        let mut buf = [0u8; DEC_MAX_LEN];
        self.write_raw(fmt_dec(n, &mut buf));
    }

    fn write_hex(&mut self, n: u64) {
        let mut buf = [0u8; HEX_LEN];
        self.write_raw(fmt_hex(n, &mut buf));
    }
}

/// Writes straight to a file descriptor with `write(2)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FdWriter {
    fd: RawFd,
}

impl FdWriter {
    pub const fn new(fd: RawFd) -> Self {
        FdWriter { fd }
    }

    pub const fn stderr() -> Self {
        FdWriter::new(libc::STDERR_FILENO)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl RawWrite for FdWriter {
    fn write_raw(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            // SAFETY: the pointer and length describe a live slice.
            let ret = unsafe { libc::write(self.fd, bytes.as_ptr().cast(), bytes.len()) };
            if ret < 0 {
                if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return;
            }
            if ret == 0 {
                return;
            }
            bytes = &bytes[ret as usize..];
        }
    }
}

// core::fmt never allocates, so fatal messages can be rendered with `write!`
// from the handler.
impl fmt::Write for FdWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_raw(s.as_bytes());
        Ok(())
    }
}

/// Capture buffer for use outside signal context (tests, one-off snapshots).
impl RawWrite for Vec<u8> {
    fn write_raw(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}
