//! Gap-tolerant stream reader
//!
//! [`GapBuffer`] stores a reassembled TCP byte stream that may contain
//! gaps where segments were lost. Data is tracked as an ordered list of
//! blocks `{gap, data_len}`; a gap is reported to the reader exactly once
//! (the report consumes it) so that the next read proceeds at the data
//! following the gap. A `Discard` that outruns the buffered data is
//! recorded as a debt against future writes, which lets a parser discard a
//! value body before the body has arrived.
//!
//! [`Reader`] wraps a `GapBuffer` with the stream lifecycle: an `eof` flag
//! set on reassembly completion, a sticky write-side error when a write
//! overflows the capacity, and a `closed` flag after which writes are
//! silently dropped and reads panic.

use thiserror::Error;

/// Capacity of a stream reader, sized for one command's worth of data.
pub const READER_CAPACITY: usize = 32 * 1024;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// Insufficient data in the buffer to complete the operation.
    #[error("insufficient data to complete read")]
    ShortRead,
    /// The stream ended before the operation could complete.
    #[error("unexpected end of stream")]
    UnexpectedEof,
    /// A write would exceed the buffer capacity. The stream cannot be
    /// interpreted further.
    #[error("write exceeds stream buffer capacity")]
    ShortWrite,
    /// Bytes were lost from the stream due to missing or late packets.
    /// Reported once per gap; the next read proceeds at the data after the
    /// gap.
    #[error("lost {0} bytes from stream")]
    LostData(usize),
}

/// A contiguous run of stream bytes, possibly preceded by a gap of lost
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    gap: usize,
    data_len: usize,
}

impl Block {
    fn has_gap(&self) -> bool {
        self.gap > 0
    }

    /// Stream bytes covered by this block, including the leading gap.
    fn len(&self) -> usize {
        self.gap + self.data_len
    }
}

/// Bounded buffer over a byte stream with loss markers.
#[derive(Debug)]
pub struct GapBuffer {
    /// Physical storage; `data[off..]` holds the live bytes.
    data: Vec<u8>,
    off: usize,
    /// Logical length including gap bytes.
    len: usize,
    cap: usize,
    blocks: Vec<Block>,
    /// Bytes demanded by `discard` before any data arrived.
    discard: usize,
}

impl GapBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::with_capacity(cap.min(4096)),
            off: 0,
            len: 0,
            cap,
            blocks: Vec::new(),
            discard: 0,
        }
    }

    /// Logical length of buffered stream, including gap bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Physical bytes currently stored.
    fn stored(&self) -> usize {
        self.data.len() - self.off
    }

    /// Append stream data preceded by `skip` lost bytes. A negative `skip`
    /// (start of stream with unknown prior loss) is treated as zero. A
    /// pending discard debt consumes incoming bytes before they land.
    pub fn write(&mut self, skip: isize, data: &[u8]) -> Result<(), ReadError> {
        let mut skip = skip.max(0) as usize;
        if self.discard >= skip + data.len() {
            self.discard -= skip + data.len();
            return Ok(());
        }

        let mut data = data;
        if skip >= self.discard {
            skip -= self.discard;
        } else {
            data = &data[self.discard - skip..];
            skip = 0;
        }

        if self.stored() + data.len() > self.cap {
            return Err(ReadError::ShortWrite);
        }
        if self.off > 0 {
            self.data.drain(..self.off);
            self.off = 0;
        }
        self.data.extend_from_slice(data);
        self.discard = 0;
        match self.blocks.last_mut() {
            Some(last) if skip == 0 => last.data_len += data.len(),
            _ => self.blocks.push(Block {
                gap: skip,
                data_len: data.len(),
            }),
        }
        self.len += skip + data.len();
        Ok(())
    }

    /// Contiguous data bytes available before the first gap, and the size
    /// of that gap (0 if none).
    fn contiguous_available(&self) -> (usize, usize) {
        let mut avail = 0;
        for block in &self.blocks {
            if block.has_gap() {
                return (avail, block.gap);
            }
            avail += block.data_len;
        }
        (avail, 0)
    }

    /// Read exactly `n` bytes. Fails with `ShortRead` if fewer than `n`
    /// stream bytes are buffered, or with `LostData` if a gap blocks the
    /// read (the gap and the data before it are consumed by the report).
    pub fn read_n(&mut self, n: usize) -> Result<&[u8], ReadError> {
        if self.len < n {
            return Err(ReadError::ShortRead);
        }
        let (avail, gap) = self.contiguous_available();
        if avail < n {
            self.discard(avail + gap);
            return Err(ReadError::LostData(gap));
        }
        let start = self.off;
        self.discard(n);
        Ok(&self.data[start..start + n])
    }

    /// Like `read_n` but non-consuming. Never advances past a gap:
    /// `LostData` is returned repeatedly until a consuming operation.
    pub fn peek_n(&mut self, n: usize) -> Result<&[u8], ReadError> {
        if self.len < n {
            return Err(ReadError::ShortRead);
        }
        let (avail, gap) = self.contiguous_available();
        if avail < n {
            return Err(ReadError::LostData(gap));
        }
        Ok(&self.data[self.off..self.off + n])
    }

    /// Position of the first of `chars` in the contiguous prefix.
    pub fn index_any(&self, chars: &[u8]) -> Result<usize, ReadError> {
        let (avail, gap) = self.contiguous_available();
        match self.data[self.off..self.off + avail]
            .iter()
            .position(|b| chars.contains(b))
        {
            Some(pos) => Ok(pos),
            None if avail < self.len => Err(ReadError::LostData(gap)),
            None => Err(ReadError::ShortRead),
        }
    }

    /// Read up to but not including the next `\n`, stripping a trailing
    /// `\r`. The line terminator is consumed.
    pub fn read_line(&mut self) -> Result<&[u8], ReadError> {
        let (avail, gap) = self.contiguous_available();
        let pos = self.data[self.off..self.off + avail]
            .iter()
            .position(|&b| b == b'\n');
        let Some(pos) = pos else {
            if avail < self.len {
                self.discard(avail + gap);
                return Err(ReadError::LostData(gap));
            }
            return Err(ReadError::ShortRead);
        };

        let start = self.off;
        let mut end = start + pos;
        if end > start && self.data[end - 1] == b'\r' {
            end -= 1;
        }
        self.discard(pos + 1);
        Ok(&self.data[start..end])
    }

    /// Advance past `n` stream bytes (data or gap). Any excess beyond what
    /// is buffered accumulates as a debt consumed by future writes.
    pub fn discard(&mut self, n: usize) {
        let mut to_discard = n;
        for i in 0..self.blocks.len() {
            let block_len = self.blocks[i].len();
            if block_len > to_discard {
                self.partial_discard(i, to_discard);
                self.drop_blocks(i);
                return;
            }
            to_discard -= block_len;
        }
        // everything buffered is consumed; the remainder becomes debt.
        // Storage is only reclaimed on the next write so slices returned by
        // the read that triggered this discard stay valid.
        self.off = self.data.len();
        self.len = 0;
        self.blocks.clear();
        self.discard += to_discard;
    }

    /// Discard `n` bytes from within block `i` (`n` < the block's length).
    fn partial_discard(&mut self, i: usize, n: usize) {
        self.len -= n;
        let block = &mut self.blocks[i];
        if block.gap > n {
            block.gap -= n;
            return;
        }
        let data_bytes = n - block.gap;
        block.gap = 0;
        block.data_len -= data_bytes;
        self.off += data_bytes;
    }

    /// Drop the first `n` blocks entirely.
    fn drop_blocks(&mut self, n: usize) {
        for block in self.blocks.drain(..n) {
            self.len -= block.len();
            self.off += block.data_len;
        }
    }

    /// Drop all buffered data. Used by parsers to resync at the next
    /// command boundary. A pending discard debt is NOT buffered data and
    /// survives: a parser may have discarded a value body that is still in
    /// flight.
    pub fn truncate(&mut self) {
        self.data.clear();
        self.off = 0;
        self.len = 0;
        self.blocks.clear();
    }

    /// Full re-initialization for pool reuse.
    pub fn reset(&mut self) {
        self.truncate();
        self.discard = 0;
    }

    #[cfg(test)]
    fn total_block_len(&self) -> usize {
        self.blocks.iter().map(|b| b.len()).sum()
    }

    #[cfg(test)]
    fn total_data_len(&self) -> usize {
        self.blocks.iter().map(|b| b.data_len).sum()
    }
}

/// `ShortRead` means "wait for more data"; once the stream has ended no
/// more data will come, so it is promoted to `UnexpectedEof`.
fn promote(eof: bool, e: ReadError) -> ReadError {
    match e {
        ReadError::ShortRead if eof => ReadError::UnexpectedEof,
        other => other,
    }
}

/// One side of a reassembled TCP conversation, exposed to protocol
/// parsers.
#[derive(Debug)]
pub struct Reader {
    buf: GapBuffer,
    eof: bool,
    closed: bool,
    err: Option<ReadError>,
}

impl Default for Reader {
    fn default() -> Self {
        Self::new()
    }
}

impl Reader {
    pub fn new() -> Self {
        Self {
            buf: GapBuffer::new(READER_CAPACITY),
            eof: false,
            closed: false,
            err: None,
        }
    }

    /// Append reassembled data. Writes to a closed reader are silently
    /// discarded: TCP assembly may still emit FIN/ACK reassemblies after
    /// the parser has logically closed the stream. A write overflowing the
    /// capacity sets a sticky error surfaced on the next read.
    pub fn write(&mut self, skip: isize, data: &[u8]) {
        if self.closed || self.err.is_some() {
            return;
        }
        if let Err(e) = self.buf.write(skip, data) {
            self.err = Some(e);
        }
    }

    /// Mark the stream as complete; pending short reads become
    /// `UnexpectedEof`.
    pub fn reassembly_complete(&mut self) {
        self.eof = true;
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn check_open(&self) {
        if self.closed {
            panic!("read from closed stream reader");
        }
    }

    pub fn read_n(&mut self, n: usize) -> Result<&[u8], ReadError> {
        self.check_open();
        if let Some(e) = self.err {
            return Err(e);
        }
        let eof = self.eof;
        self.buf.read_n(n).map_err(|e| promote(eof, e))
    }

    pub fn peek_n(&mut self, n: usize) -> Result<&[u8], ReadError> {
        self.check_open();
        if let Some(e) = self.err {
            return Err(e);
        }
        let eof = self.eof;
        self.buf.peek_n(n).map_err(|e| promote(eof, e))
    }

    pub fn index_any(&self, chars: &[u8]) -> Result<usize, ReadError> {
        self.check_open();
        if let Some(e) = self.err {
            return Err(e);
        }
        self.buf.index_any(chars).map_err(|e| promote(self.eof, e))
    }

    pub fn read_line(&mut self) -> Result<&[u8], ReadError> {
        self.check_open();
        if let Some(e) = self.err {
            return Err(e);
        }
        let eof = self.eof;
        self.buf.read_line().map_err(|e| promote(eof, e))
    }

    /// Advance past `n` stream bytes; excess becomes a debt against future
    /// writes.
    pub fn discard(&mut self, n: usize) -> Result<(), ReadError> {
        self.check_open();
        if let Some(e) = self.err {
            return Err(e);
        }
        self.buf.discard(n);
        Ok(())
    }

    /// Drop buffered data to resync at a command boundary. `eof` and
    /// `closed` are unaffected.
    pub fn truncate(&mut self) {
        self.buf.truncate();
    }

    /// Stop accepting data. Subsequent writes are dropped; subsequent reads
    /// are a programmer error.
    pub fn close(&mut self) {
        self.closed = true;
        self.buf.reset();
    }

    /// Full re-initialization for pool reuse.
    pub fn reset(&mut self) {
        self.buf.reset();
        self.eof = false;
        self.closed = false;
        self.err = None;
    }
}
