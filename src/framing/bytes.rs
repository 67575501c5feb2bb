use std::io::{ErrorKind, Read, Seek, SeekFrom};

use tracing::trace;

use crate::prelude::*;

/// Number of bytes requested from the source per read unless configured otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Bytes obtained from a single read of the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    /// Offset of the first byte of `data` in the source.
    pub offset: u64,
    pub data: Vec<u8>,
}

/// ByteStreamReader reads a source in fixed size chunks and keeps every byte that has
/// not yet been consumed in a growable rolling buffer.
///
/// Nothing is ever dropped from the buffer unless requested via [ByteStreamReader::consume]
/// or [ByteStreamReader::retain_tail], so a pattern that is split across two reads is
/// always visible in one contiguous slice.
///
/// Offsets are relative to the position of the source when the reader was created,
/// which for freshly opened files is the start of the file. [ByteStreamReader::reset] and
/// [ByteStreamReader::seek_and_read] use the same base.
pub struct ByteStreamReader<R>
where
    R: Read,
{
    reader: R,
    chunk_size: usize,
    buf: Vec<u8>,
    // Offset of buf[0] in the source
    buf_offset: u64,
    num_read: u64,
    eof: bool,
}

impl<R> ByteStreamReader<R>
where
    R: Read,
{
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, DEFAULT_CHUNK_SIZE)
    }

    /// Create a reader requesting `chunk_size` bytes per read. A chunk size of 0 is
    /// treated as 1.
    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        ByteStreamReader {
            reader,
            chunk_size: chunk_size.max(1),
            buf: Vec::new(),
            buf_offset: 0,
            num_read: 0,
            eof: false,
        }
    }

    fn read_chunk(&mut self) -> Result<Option<RawChunk>> {
        let mut data = vec![0u8; self.chunk_size];
        let n = loop {
            match self.reader.read(&mut data) {
                Ok(n) => break n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::Io(err)),
            }
        };
        if n == 0 {
            return Ok(None);
        }
        data.truncate(n);
        let chunk = RawChunk {
            offset: self.num_read,
            data,
        };
        self.num_read += n as u64;
        Ok(Some(chunk))
    }

    /// Append the next chunk from the source to the buffer.
    ///
    /// Returns `false` only when the source is exhausted and no bytes were obtained. The
    /// first empty read marks the reader as being at end-of-stream and no further reads
    /// are attempted until [ByteStreamReader::reset].
    ///
    /// # Errors
    /// Any I/O error from the source other than [ErrorKind::Interrupted].
    pub fn read_more(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        match self.read_chunk()? {
            Some(chunk) => {
                trace!(offset = chunk.offset, len = chunk.data.len(), "read chunk");
                self.buf.extend_from_slice(&chunk.data);
                Ok(true)
            }
            None => {
                trace!(offset = self.num_read, "end of stream");
                self.eof = true;
                Ok(false)
            }
        }
    }

    /// Unconsumed bytes.
    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Offset in the source of the first byte in [ByteStreamReader::buffer].
    #[must_use]
    pub fn buffer_offset(&self) -> u64 {
        self.buf_offset
    }

    /// Total number of bytes read from the source.
    #[must_use]
    pub fn num_read(&self) -> u64 {
        self.num_read
    }

    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Drop up to `n` bytes from the front of the buffer, returning the number dropped.
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
        self.buf_offset += n as u64;
        n
    }

    /// Drop everything but the last `keep` bytes of the buffer, returning the number
    /// of bytes dropped.
    pub fn retain_tail(&mut self, keep: usize) -> usize {
        if self.buf.len() > keep {
            self.consume(self.buf.len() - keep)
        } else {
            0
        }
    }
}

impl<R> ByteStreamReader<R>
where
    R: Read + Seek,
{
    // Position of the source when the reader was created. Every read advances the source
    // by exactly the number of bytes obtained, and seeks always restore the position.
    fn start_position(&mut self) -> Result<u64> {
        let pos = self.reader.stream_position()?;
        Ok(pos.saturating_sub(self.num_read))
    }

    /// Rewind the source to where it was when the reader was created and clear all
    /// buffered state.
    ///
    /// # Errors
    /// If the source cannot be repositioned.
    pub fn reset(&mut self) -> Result<()> {
        let start = self.start_position()?;
        self.reader.seek(SeekFrom::Start(start))?;
        self.buf.clear();
        self.buf_offset = 0;
        self.num_read = 0;
        self.eof = false;
        Ok(())
    }

    /// Read up to `length` bytes starting at `offset`, using the same offsets as
    /// [ByteStreamReader::buffer_offset].
    ///
    /// Fewer than `length` bytes are returned if the end of the source is reached. The
    /// sequential read position is restored afterwards so buffered reading may continue.
    ///
    /// # Errors
    /// If the source cannot be repositioned or read.
    pub fn seek_and_read(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let pos = self.reader.stream_position()?;
        let start = pos.saturating_sub(self.num_read);
        self.reader.seek(SeekFrom::Start(start + offset))?;
        let mut out = Vec::with_capacity(length.min(DEFAULT_CHUNK_SIZE * 16));
        let zult = (&mut self.reader).take(length as u64).read_to_end(&mut out);
        self.reader.seek(SeekFrom::Start(pos))?;
        zult?;
        Ok(out)
    }
}
