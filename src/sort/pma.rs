//! PMA writer and reader
//!
//! A PMA (Packed Memory Array) is one sorted run in a temp file: a length
//! varint followed by that many bytes of records, each record itself a
//! `{length varint, bytes}` pair. Consecutive PMAs sit back-to-back in the
//! same file. The writer buffers so that its buffer's first byte always
//! aligns to a page boundary of the underlying file, and latches the first
//! I/O error so later writes are no-ops. The reader runs either over a
//! memory map of the temp file or over an aligned buffer with a growable
//! scratch area for values spanning a buffer boundary; end-of-PMA is
//! modelled by clearing the file handle.

use std::sync::Arc;

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::{OpenFlags, Vfs, VfsFile};
use crate::types::DbOffset;
use crate::util::varint::{read_varint_at, write_varint};

// ============================================================================
// Temp files and spans
// ============================================================================

/// An anonymous temp file (exclusive, deleted on close) shared between one
/// writer and any number of readers.
pub(crate) struct TempFile {
    pub(crate) file: Box<dyn VfsFile>,
}

impl TempFile {
    pub(crate) fn create(vfs: &Arc<dyn Vfs>) -> Result<Arc<Self>> {
        let file = vfs.open(
            None,
            OpenFlags::TEMP_DB | OpenFlags::EXCLUSIVE | OpenFlags::DELETEONCLOSE,
        )?;
        Ok(Arc::new(Self { file }))
    }
}

/// One PMA within a temp file. `seq` is the global acceptance sequence of
/// the first flush the run covers; merges only ever combine runs whose
/// sequences are contiguous, which is what keeps the sort stable and the
/// output independent of the worker count.
#[derive(Clone)]
pub(crate) struct PmaSpan {
    pub(crate) file: Arc<TempFile>,
    /// Byte offset of the leading size varint.
    pub(crate) start: u64,
    /// Byte offset one past the last record byte.
    pub(crate) end: u64,
    /// Record bytes, excluding the leading size varint.
    pub(crate) content: u64,
    pub(crate) seq: u64,
}

// ============================================================================
// Writer
// ============================================================================

/// Buffered PMA writer with a sticky error latch.
pub(crate) struct PmaWriter {
    file: Arc<TempFile>,
    buf: Vec<u8>,
    /// First valid byte in `buf`; nonzero only before the first flush when
    /// the start offset is not page-aligned.
    i_buf_start: usize,
    /// One past the last valid byte in `buf`.
    i_buf_end: usize,
    /// File offset corresponding to `buf[0]`; always page-aligned.
    i_write_off: u64,
    err: Option<ErrorCode>,
}

impl PmaWriter {
    /// Start writing at absolute file offset `start` with an `n_buf`-byte
    /// buffer (`n_buf` is the page size of the temp file).
    pub(crate) fn new(file: Arc<TempFile>, n_buf: usize, start: u64) -> Self {
        let i_buf_start = (start % n_buf as u64) as usize;
        Self {
            file,
            buf: vec![0u8; n_buf],
            i_buf_start,
            i_buf_end: i_buf_start,
            i_write_off: start - i_buf_start as u64,
            err: None,
        }
    }

    /// Append raw bytes. A latched error turns this into a no-op.
    pub(crate) fn write(&mut self, data: &[u8]) {
        if self.err.is_some() {
            return;
        }
        let mut remain = data;
        while !remain.is_empty() {
            let n = remain.len().min(self.buf.len() - self.i_buf_end);
            self.buf[self.i_buf_end..self.i_buf_end + n].copy_from_slice(&remain[..n]);
            self.i_buf_end += n;
            remain = &remain[n..];
            if self.i_buf_end == self.buf.len() {
                self.flush_buffer();
            }
        }
    }

    /// Append a varint.
    pub(crate) fn write_varint(&mut self, value: u64) {
        let mut tmp = Vec::with_capacity(9);
        write_varint(value, &mut tmp);
        self.write(&tmp);
    }

    /// One aligned write of the buffered bytes at the cached offset.
    fn flush_buffer(&mut self) {
        if self.err.is_none() && self.i_buf_end > self.i_buf_start {
            let off = self.i_write_off + self.i_buf_start as u64;
            if let Err(err) = self
                .file
                .file
                .write(&self.buf[self.i_buf_start..self.i_buf_end], off as DbOffset)
            {
                self.err = Some(err.code());
            }
        }
        self.i_write_off += self.buf.len() as u64;
        self.i_buf_start = 0;
        self.i_buf_end = 0;
    }

    /// Write the residual tail and report the latched error, if any.
    /// Returns the end offset of the written data.
    pub(crate) fn finish(mut self) -> Result<u64> {
        let end = self.i_write_off + self.i_buf_end as u64;
        if self.err.is_none() && self.i_buf_end > self.i_buf_start {
            let off = self.i_write_off + self.i_buf_start as u64;
            if let Err(err) = self
                .file
                .file
                .write(&self.buf[self.i_buf_start..self.i_buf_end], off as DbOffset)
            {
                self.err = Some(err.code());
            }
        }
        match self.err {
            Some(code) => Err(Error::with_message(code, "pma write failed")),
            None => Ok(end),
        }
    }
}

// ============================================================================
// Reader
// ============================================================================

/// A read-only view into a memory-mapped temp file. The `Arc` keeps the
/// descriptor (and so the mapping) alive for the view's lifetime.
struct MapView {
    ptr: *const u8,
    len: usize,
    file: Arc<TempFile>,
}

// The mapping is read-only and the file is kept alive by the Arc.
unsafe impl Send for MapView {}

impl MapView {
    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for MapView {
    fn drop(&mut self) {
        let _ = self.file.file.unfetch(0, self.ptr);
    }
}

enum Source {
    /// Records are views into the map.
    Mapped(MapView),
    /// Aligned per-reader buffer plus scratch for spanning values.
    Buffered {
        buf: Vec<u8>,
        /// File offset of `buf[0]`; aligned to the buffer size.
        buf_off: u64,
        /// Valid bytes in `buf`.
        buf_len: usize,
        scratch: Vec<u8>,
    },
}

enum KeyRef {
    None,
    Scratch(usize),
    Buffer { off: usize, len: usize },
    Map { off: usize, len: usize },
}

/// Reader over one PMA. `file` doubles as the EOF sentinel: it is cleared
/// once the run is exhausted.
pub(crate) struct PmaReader {
    file: Option<Arc<TempFile>>,
    i_read_off: u64,
    /// Offset one past the last record byte of this PMA.
    i_eof: u64,
    source: Source,
    key: KeyRef,
}

impl PmaReader {
    /// Open a reader on the PMA at `span`, mapping the temp file when it
    /// fits under `mmap_limit`, and load the first record.
    pub(crate) fn begin(span: &PmaSpan, n_buf: usize, mmap_limit: i64) -> Result<Self> {
        let file_size = span.file.file.file_size()? as u64;
        let source = if mmap_limit > 0 && file_size <= mmap_limit as u64 {
            match span.file.file.fetch(0, file_size as usize)? {
                Some(ptr) => Source::Mapped(MapView {
                    ptr,
                    len: file_size as usize,
                    file: Arc::clone(&span.file),
                }),
                None => Self::buffered_source(n_buf),
            }
        } else {
            Self::buffered_source(n_buf)
        };

        let mut reader = Self {
            file: Some(Arc::clone(&span.file)),
            i_read_off: span.start,
            i_eof: 0,
            source,
            key: KeyRef::None,
        };
        let content = reader.read_varint()?;
        reader.i_eof = reader.i_read_off + content;
        reader.next()?;
        Ok(reader)
    }

    fn buffered_source(n_buf: usize) -> Source {
        Source::Buffered {
            buf: vec![0u8; n_buf],
            buf_off: 0,
            buf_len: 0,
            scratch: Vec::new(),
        }
    }

    /// True once the run is exhausted.
    pub(crate) fn eof(&self) -> bool {
        self.file.is_none()
    }

    /// The current record's bytes.
    pub(crate) fn key(&self) -> Option<&[u8]> {
        match self.key {
            KeyRef::None => None,
            KeyRef::Scratch(len) => match &self.source {
                Source::Buffered { scratch, .. } => Some(&scratch[..len]),
                Source::Mapped(_) => None,
            },
            KeyRef::Buffer { off, len } => match &self.source {
                Source::Buffered { buf, .. } => Some(&buf[off..off + len]),
                Source::Mapped(_) => None,
            },
            KeyRef::Map { off, len } => match &self.source {
                Source::Mapped(map) => Some(&map.as_slice()[off..off + len]),
                Source::Buffered { .. } => None,
            },
        }
    }

    /// Advance to the next `{length varint, bytes}` record, caching it.
    /// Clears the file handle at end of run.
    pub(crate) fn next(&mut self) -> Result<bool> {
        if self.file.is_none() {
            return Ok(false);
        }
        if self.i_read_off >= self.i_eof {
            self.file = None;
            self.key = KeyRef::None;
            return Ok(false);
        }
        let len = self.read_varint()? as usize;
        self.read_blob(len)?;
        Ok(true)
    }

    /// Decode one varint at the read offset.
    pub(crate) fn read_varint(&mut self) -> Result<u64> {
        match &self.source {
            Source::Mapped(map) => {
                let slice = map.as_slice();
                let (value, consumed) = read_varint_at(slice, self.i_read_off as usize);
                if consumed == 0 {
                    return Err(Error::with_message(ErrorCode::Corrupt, "truncated pma"));
                }
                self.i_read_off += consumed as u64;
                Ok(value)
            }
            Source::Buffered { .. } => {
                let mut value = 0u64;
                for i in 0..9 {
                    let byte = self.next_byte()?;
                    if i == 8 {
                        value = (value << 8) | byte as u64;
                        break;
                    }
                    value = (value << 7) | (byte & 0x7f) as u64;
                    if byte & 0x80 == 0 {
                        break;
                    }
                }
                Ok(value)
            }
        }
    }

    /// Load `len` bytes at the read offset as the current record.
    pub(crate) fn read_blob(&mut self, len: usize) -> Result<()> {
        match &mut self.source {
            Source::Mapped(map) => {
                if self.i_read_off as usize + len > map.len {
                    return Err(Error::with_message(ErrorCode::Corrupt, "truncated pma"));
                }
                self.key = KeyRef::Map {
                    off: self.i_read_off as usize,
                    len,
                };
                self.i_read_off += len as u64;
                Ok(())
            }
            Source::Buffered { .. } => {
                self.fill_buffer_at(self.i_read_off)?;
                let (buf_off, buf_len) = match &self.source {
                    Source::Buffered {
                        buf_off, buf_len, ..
                    } => (*buf_off, *buf_len),
                    Source::Mapped(_) => unreachable!(),
                };
                let rel = (self.i_read_off - buf_off) as usize;
                if rel + len <= buf_len {
                    // Fully inside the buffer: return a view into it.
                    self.key = KeyRef::Buffer { off: rel, len };
                    self.i_read_off += len as u64;
                    return Ok(());
                }
                // Spans the buffer boundary: assemble into scratch.
                let mut copied = 0usize;
                if let Source::Buffered { scratch, .. } = &mut self.source {
                    scratch.clear();
                    scratch.reserve(len);
                }
                while copied < len {
                    self.fill_buffer_at(self.i_read_off)?;
                    if let Source::Buffered {
                        buf,
                        buf_off,
                        buf_len,
                        scratch,
                    } = &mut self.source
                    {
                        let rel = (self.i_read_off - *buf_off) as usize;
                        if rel >= *buf_len {
                            return Err(Error::with_message(ErrorCode::Corrupt, "truncated pma"));
                        }
                        let n = (len - copied).min(*buf_len - rel);
                        scratch.extend_from_slice(&buf[rel..rel + n]);
                        copied += n;
                        self.i_read_off += n as u64;
                    }
                }
                self.key = KeyRef::Scratch(len);
                Ok(())
            }
        }
    }

    /// One byte at the read offset (buffered mode only).
    fn next_byte(&mut self) -> Result<u8> {
        self.fill_buffer_at(self.i_read_off)?;
        if let Source::Buffered {
            buf,
            buf_off,
            buf_len,
            ..
        } = &self.source
        {
            let rel = (self.i_read_off - buf_off) as usize;
            if rel >= *buf_len {
                return Err(Error::with_message(ErrorCode::Corrupt, "truncated pma"));
            }
            let byte = buf[rel];
            self.i_read_off += 1;
            Ok(byte)
        } else {
            Err(Error::new(ErrorCode::Internal))
        }
    }

    /// Ensure the aligned buffer covers file offset `off`.
    fn fill_buffer_at(&mut self, off: u64) -> Result<()> {
        let file = match &self.file {
            Some(file) => Arc::clone(file),
            None => return Err(Error::new(ErrorCode::Internal)),
        };
        if let Source::Buffered {
            buf,
            buf_off,
            buf_len,
            ..
        } = &mut self.source
        {
            let n_buf = buf.len() as u64;
            let covered = *buf_len > 0 && off >= *buf_off && off < *buf_off + *buf_len as u64;
            if covered {
                return Ok(());
            }
            let aligned = off - off % n_buf;
            let n = file.file.read(buf, aligned as DbOffset)?;
            *buf_off = aligned;
            *buf_len = n;
            if off >= aligned + n as u64 {
                return Err(Error::with_message(ErrorCode::Corrupt, "read past temp eof"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::vfs::vfs_find;
    use crate::util::varint::varint_len;

    fn write_run(records: &[&[u8]], n_buf: usize) -> PmaSpan {
        let vfs = vfs_find(None).unwrap();
        let file = TempFile::create(&vfs).unwrap();
        let content: u64 = records
            .iter()
            .map(|r| (varint_len(r.len() as u64) + r.len()) as u64)
            .sum();
        let mut writer = PmaWriter::new(Arc::clone(&file), n_buf, 0);
        writer.write_varint(content);
        for record in records {
            writer.write_varint(record.len() as u64);
            writer.write(record);
        }
        let end = writer.finish().unwrap();
        PmaSpan {
            file,
            start: 0,
            end,
            content,
            seq: 0,
        }
    }

    fn drain(mut reader: PmaReader) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while !reader.eof() {
            out.push(reader.key().unwrap().to_vec());
            reader.next().unwrap();
        }
        out
    }

    #[test]
    fn test_roundtrip_buffered() {
        let records: Vec<&[u8]> = vec![b"alpha", b"bb", b"", b"a-much-longer-record-payload"];
        let span = write_run(&records, 32);
        // mmap disabled: buffered mode, tiny buffer forces spanning reads.
        let reader = PmaReader::begin(&span, 16, 0).unwrap();
        let out = drain(reader);
        assert_eq!(out, records);
    }

    #[test]
    fn test_roundtrip_mapped() {
        let records: Vec<&[u8]> = vec![b"one", b"two", b"three"];
        let span = write_run(&records, 64);
        let reader = PmaReader::begin(&span, 64, 1 << 20).unwrap();
        let out = drain(reader);
        assert_eq!(out, records);
    }

    #[test]
    fn test_mapped_and_buffered_agree() {
        let records: Vec<Vec<u8>> = (0..200u32)
            .map(|i| {
                let mut r = i.to_le_bytes().to_vec();
                r.resize(4 + (i as usize % 23), i as u8);
                r
            })
            .collect();
        let refs: Vec<&[u8]> = records.iter().map(Vec::as_slice).collect();
        let span = write_run(&refs, 128);

        let buffered = drain(PmaReader::begin(&span, 128, 0).unwrap());
        let mapped = drain(PmaReader::begin(&span, 128, 1 << 30).unwrap());
        assert_eq!(buffered, mapped);
        assert_eq!(buffered.len(), 200);
    }

    #[test]
    fn test_back_to_back_runs() {
        let vfs = vfs_find(None).unwrap();
        let file = TempFile::create(&vfs).unwrap();

        let mut spans = Vec::new();
        let mut offset = 0u64;
        for batch in [&[b"aa".as_slice(), b"bb"][..], &[b"cc".as_slice()][..]] {
            let content: u64 = batch
                .iter()
                .map(|r| (varint_len(r.len() as u64) + r.len()) as u64)
                .sum();
            let mut writer = PmaWriter::new(Arc::clone(&file), 64, offset);
            writer.write_varint(content);
            for record in batch {
                writer.write_varint(record.len() as u64);
                writer.write(record);
            }
            let end = writer.finish().unwrap();
            spans.push(PmaSpan {
                file: Arc::clone(&file),
                start: offset,
                end,
                content,
                seq: 0,
            });
            offset = end;
        }

        assert_eq!(drain(PmaReader::begin(&spans[0], 64, 0).unwrap()).len(), 2);
        let second = drain(PmaReader::begin(&spans[1], 64, 0).unwrap());
        assert_eq!(second, vec![b"cc".to_vec()]);
    }
}
