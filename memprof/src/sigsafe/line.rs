//! Line splitting over an in-memory report snapshot.

/// Default size of the per-line destination buffer.
pub const LINE_CAP: usize = 8192;

/// One line handed out by [`LineReader::next_line`].
#[derive(Debug, PartialEq, Eq)]
pub struct Line<'d> {
    /// Source bytes consumed, including the newline if one was found.
    pub consumed: usize,
    /// The line contents with the newline stripped.
    pub bytes: &'d [u8],
}

/// Cursor over a byte buffer that yields one line at a time.
///
/// Lines are copied into a caller-supplied fixed buffer. A line longer than
/// that buffer is cut at the buffer's length and the remainder comes back as
/// the following line.
pub struct LineReader<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> LineReader<'a> {
    pub fn new(src: &'a [u8]) -> Self {
        LineReader { src, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Copies the next line into `dst`. Returns `None` once the cursor has
    /// reached the end of the source, or if `dst` has no room at all.
    pub fn next_line<'d>(&mut self, dst: &'d mut [u8]) -> Option<Line<'d>> {
        if dst.is_empty() || self.pos >= self.src.len() {
            return None;
        }
        let avail = &self.src[self.pos..];
        let take = avail.len().min(dst.len());
        let chunk = &avail[..take];

        // Without a newline in what fits, this is either the unterminated
        // last line or an overlong one; either way hand back what we have.
        // A newline sitting just past a full buffer still ends this line.
        let (consumed, len) = match chunk.iter().position(|&b| b == b'\n') {
            Some(nl) => (nl + 1, nl),
            None if avail.get(take) == Some(&b'\n') => (take + 1, take),
            None => (take, take),
        };
        dst[..len].copy_from_slice(&chunk[..len]);
        self.pos += consumed;
        Some(Line {
            consumed,
            bytes: &dst[..len],
        })
    }
}
