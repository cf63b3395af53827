//! Parser and accumulator for `/proc/<pid>/smaps`.
//!
//! The report is a sequence of blocks, one per mapping:
//!
//! ```text
//! 00400000-00401000 r-xp 00000000 08:01 12345 /bin/true
//! Size:                  4 kB
//! Rss:                   4 kB
//! ...
//! ```
//!
//! Header lines are recognised by a leading hex digit, statistic lines by a
//! leading uppercase letter. Everything here runs inside the signal handler,
//! so it works on borrowed bytes only and reports errors as small `Copy`
//! values.

use thiserror::Error;

use crate::sigsafe::{LineReader, RawWrite};

/// Default capacity of the buffer the whole report is read into.
pub const REPORT_CAP: usize = 256 * 1024;

/// Running figures for one mapping or for a whole sample, all in kB.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    pub size: u64,
    pub resident: u64,
    pub dirty: u64,
    pub referenced: u64,
    pub shared: u64,
}

impl Counters {
    /// Adds `self` into `totals` and zeroes `self`. Leaves `totals` alone
    /// and returns `None` if any sum would overflow.
    fn fold_into(&mut self, totals: &mut Counters) -> Option<()> {
        *totals = Counters {
            size: totals.size.checked_add(self.size)?,
            resident: totals.resident.checked_add(self.resident)?,
            dirty: totals.dirty.checked_add(self.dirty)?,
            referenced: totals.referenced.checked_add(self.referenced)?,
            shared: totals.shared.checked_add(self.shared)?,
        };
        *self = Counters::default();
        Some(())
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportError {
    #[error("reading the mapping report failed (errno {errno})")]
    Read { errno: i32 },

    #[error("report line {line}: neither a mapping header nor a statistic")]
    UnrecognisedLine { line: usize },

    #[error("report line {line}: malformed mapping header")]
    MalformedHeader { line: usize },

    #[error("report line {line}: malformed statistic value")]
    MalformedStat { line: usize },

    #[error("report line {line}: statistic outside any mapping")]
    OrphanStat { line: usize },

    #[error("report line {line}: declared size {declared} kB, mapped range is {mapped} kB")]
    SizeMismatch {
        line: usize,
        declared: u64,
        mapped: u64,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    /// `s` rather than `p` in the fourth column.
    pub shared: bool,
}

impl Perms {
    fn parse(field: &[u8]) -> Option<Self> {
        let &[r, w, x, p] = field else {
            return None;
        };
        Some(Perms {
            read: flag(r, b'r')?,
            write: flag(w, b'w')?,
            exec: flag(x, b'x')?,
            shared: match p {
                b's' => true,
                b'p' => false,
                _ => return None,
            },
        })
    }
}

fn flag(got: u8, set: u8) -> Option<bool> {
    match got {
        b'-' => Some(false),
        g if g == set => Some(true),
        _ => None,
    }
}

/// One mapping header line, borrowing its label from the line buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappingHeader<'a> {
    pub start: u64,
    pub end: u64,
    pub perms: Perms,
    pub offset: u64,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub inode: u64,
    pub label: Option<&'a [u8]>,
}

impl<'a> MappingHeader<'a> {
    /// Scans `<start>-<end> <perms> <offset> <major>:<minor> <inode> [label]`.
    pub fn parse(line: &'a [u8]) -> Option<Self> {
        let mut s = Scanner::new(line);
        let start = s.hex()?;
        s.expect(b'-')?;
        let end = s.hex()?;
        s.spaces()?;
        let perms = Perms::parse(s.word())?;
        s.spaces()?;
        let offset = s.hex()?;
        s.spaces()?;
        let dev_major = u32::try_from(s.hex()?).ok()?;
        s.expect(b':')?;
        let dev_minor = u32::try_from(s.hex()?).ok()?;
        s.spaces()?;
        let inode = s.dec()?;
        if end < start {
            return None;
        }
        let label = s.rest();
        Some(MappingHeader {
            start,
            end,
            perms,
            offset,
            dev_major,
            dev_minor,
            inode,
            label: (!label.is_empty()).then_some(label),
        })
    }

    pub fn size_kb(&self) -> u64 {
        (self.end - self.start) / 1024
    }

    /// Kernels may report a stack's size one guard page larger than its range.
    pub fn is_stack(&self) -> bool {
        self.label.is_some_and(|l| l.starts_with(b"[stack"))
    }
}

/// The statistic keys that feed the counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stat {
    Size,
    Rss,
    SharedClean,
    SharedDirty,
    PrivateClean,
    PrivateDirty,
    Referenced,
}

impl Stat {
    pub fn from_key(key: &[u8]) -> Option<Self> {
        Some(match key {
            b"Size" => Stat::Size,
            b"Rss" => Stat::Rss,
            b"Shared_Clean" => Stat::SharedClean,
            b"Shared_Dirty" => Stat::SharedDirty,
            b"Private_Clean" => Stat::PrivateClean,
            b"Private_Dirty" => Stat::PrivateDirty,
            b"Referenced" => Stat::Referenced,
            _ => return None,
        })
    }
}

/// Splits `<Key>: <integer> kB`. Lines with a key we don't track come back as
/// `Ok(None)` without their value being looked at, since newer kernels add
/// fields like `VmFlags:` whose value isn't a size.
pub(crate) fn parse_stat(line: &[u8]) -> Result<Option<(Stat, u64)>, ()> {
    let Some(colon) = line.iter().position(|&b| b == b':') else {
        return Ok(None);
    };
    let Some(stat) = Stat::from_key(&line[..colon]) else {
        return Ok(None);
    };
    let mut s = Scanner::new(&line[colon + 1..]);
    s.spaces().ok_or(())?;
    let kb = s.dec().ok_or(())?;
    s.spaces().ok_or(())?;
    if s.word() != b"kB" || !s.rest().is_empty() {
        return Err(());
    }
    Ok(Some((stat, kb)))
}

/// Byte cursor for the two fixed line shapes.
struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Scanner { bytes, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn expect(&mut self, want: u8) -> Option<()> {
        (self.peek()? == want).then(|| self.pos += 1)
    }

    /// At least one blank.
    fn spaces(&mut self) -> Option<()> {
        let from = self.pos;
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
        (self.pos > from).then_some(())
    }

    fn word(&mut self) -> &'a [u8] {
        let from = self.pos;
        while matches!(self.peek(), Some(b) if b != b' ' && b != b'\t') {
            self.pos += 1;
        }
        &self.bytes[from..self.pos]
    }

    fn hex(&mut self) -> Option<u64> {
        self.number(16)
    }

    fn dec(&mut self) -> Option<u64> {
        self.number(10)
    }

    fn number(&mut self, radix: u32) -> Option<u64> {
        let from = self.pos;
        let mut value: u64 = 0;
        while let Some(digit) = self.peek().and_then(|b| (b as char).to_digit(radix)) {
            value = value
                .checked_mul(u64::from(radix))?
                .checked_add(u64::from(digit))?;
            self.pos += 1;
        }
        (self.pos > from).then_some(value)
    }

    /// Whatever follows the current position, leading and trailing blanks
    /// dropped.
    fn rest(&mut self) -> &'a [u8] {
        let _ = self.spaces();
        let mut rest = &self.bytes[self.pos..];
        while let [head @ .., b' ' | b'\t'] = rest {
            rest = head;
        }
        self.pos = self.bytes.len();
        rest
    }
}

#[derive(Clone, Copy, Debug)]
struct Pending {
    counters: Counters,
    is_stack: bool,
}

/// Per-process sampling state: the sample index and the running totals.
///
/// Only ever touched from one context at a time (the signal handler, or a
/// test), so there is no internal synchronisation.
#[derive(Debug)]
pub struct Accumulator {
    pid: u32,
    page_kb: u64,
    verbose: bool,
    sample: u64,
    totals: Counters,
    pending: Option<Pending>,
}

impl Accumulator {
    pub fn new(pid: u32, page_size: u64, verbose: bool) -> Self {
        Accumulator {
            pid,
            page_kb: page_size / 1024,
            verbose,
            sample: 0,
            totals: Counters::default(),
            pending: None,
        }
    }

    /// Index of the most recent sample; 0 before the first one.
    pub fn sample_index(&self) -> u64 {
        self.sample
    }

    /// Runs one sample over a full report snapshot, writing per-mapping
    /// records (when verbose) and the totals record to `out`.
    ///
    /// `line_buf` bounds the longest line; longer lines are split.
    pub fn run<W: RawWrite>(
        &mut self,
        report: &[u8],
        line_buf: &mut [u8],
        out: &mut W,
    ) -> Result<Counters, ReportError> {
        self.sample += 1;
        self.totals = Counters::default();
        self.pending = None;

        let mut reader = LineReader::new(report);
        let mut lineno = 0;
        while let Some(line) = reader.next_line(line_buf) {
            lineno += 1;
            let bytes = line.bytes;
            match bytes.first() {
                Some(b'0'..=b'9' | b'a'..=b'f') => {
                    let header = MappingHeader::parse(bytes)
                        .ok_or(ReportError::MalformedHeader { line: lineno })?;
                    self.flush_pending(out, lineno)?;
                    if self.verbose {
                        out.write_raw(bytes);
                        out.write_raw(b"\t");
                    }
                    self.pending = Some(Pending {
                        counters: Counters {
                            size: header.size_kb(),
                            ..Counters::default()
                        },
                        is_stack: header.is_stack(),
                    });
                }
                Some(b'A'..=b'Z') => self.apply_stat(bytes, lineno)?,
                _ => return Err(ReportError::UnrecognisedLine { line: lineno }),
            }
        }

        self.flush_pending(out, lineno)?;
        let totals = self.totals;
        write_record(out, self.pid, self.sample, Some(b"totals"), &totals);
        self.totals = Counters::default();
        Ok(totals)
    }

    fn apply_stat(&mut self, line: &[u8], lineno: usize) -> Result<(), ReportError> {
        let Some((stat, kb)) =
            parse_stat(line).map_err(|()| ReportError::MalformedStat { line: lineno })?
        else {
            return Ok(());
        };
        let page_kb = self.page_kb;
        let pending = self
            .pending
            .as_mut()
            .ok_or(ReportError::OrphanStat { line: lineno })?;
        let c = &mut pending.counters;
        let overflow = ReportError::MalformedStat { line: lineno };
        match stat {
            Stat::Size => {
                let stack_rounded =
                    pending.is_stack && c.size.checked_add(page_kb) == Some(kb);
                if kb != c.size && !stack_rounded {
                    return Err(ReportError::SizeMismatch {
                        line: lineno,
                        declared: kb,
                        mapped: c.size,
                    });
                }
            }
            Stat::Rss => c.resident = c.resident.checked_add(kb).ok_or(overflow)?,
            Stat::SharedClean => c.shared = c.shared.checked_add(kb).ok_or(overflow)?,
            Stat::SharedDirty => {
                c.shared = c.shared.checked_add(kb).ok_or(overflow)?;
                c.dirty = c.dirty.checked_add(kb).ok_or(overflow)?;
            }
            Stat::PrivateClean => {}
            Stat::PrivateDirty => c.dirty = c.dirty.checked_add(kb).ok_or(overflow)?,
            Stat::Referenced => c.referenced = c.referenced.checked_add(kb).ok_or(overflow)?,
        }
        Ok(())
    }

    /// Prints and folds the mapping in progress. `lineno` is the line that
    /// ended it, reported if the totals would overflow.
    fn flush_pending<W: RawWrite>(
        &mut self,
        out: &mut W,
        lineno: usize,
    ) -> Result<(), ReportError> {
        let Some(mut pending) = self.pending.take() else {
            return Ok(());
        };
        if self.verbose {
            write_record(out, self.pid, self.sample, None, &pending.counters);
        }
        pending
            .counters
            .fold_into(&mut self.totals)
            .ok_or(ReportError::MalformedStat { line: lineno })
    }
}

fn write_record<W: RawWrite>(
    out: &mut W,
    pid: u32,
    sample: u64,
    suffix: Option<&[u8]>,
    c: &Counters,
) {
    out.write_raw(b"== ");
    out.write_dec(u64::from(pid));
    out.write_raw(b" sample ");
    out.write_dec(sample);
    if let Some(suffix) = suffix {
        out.write_raw(b" ");
        out.write_raw(suffix);
    }
    out.write_raw(b" == size ");
    out.write_dec(c.size);
    out.write_raw(b" kB, resident ");
    out.write_dec(c.resident);
    out.write_raw(b" kB, dirty ");
    out.write_dec(c.dirty);
    out.write_raw(b" kB, referenced ");
    out.write_dec(c.referenced);
    out.write_raw(b" kB, shared ");
    out.write_dec(c.shared);
    out.write_raw(b" kB\n");
}
