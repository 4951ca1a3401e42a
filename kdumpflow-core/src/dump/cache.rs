/*!
Output sinks and the write-back cache in front of them.
*/

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::trace;

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};

/// Pages buffered per write cache as a power of two.
pub const DEFAULT_BLOCK_ORDER: u32 = 4;

/// Destination of a dump file.
///
/// All writers address the output by absolute offset. A sink that streams
/// (see [`FlatSink`](super::flat::FlatSink)) records the offset next to the
/// data instead of seeking.
pub trait DumpSink {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Completes the output. No writes follow.
    fn finish(&mut self) -> Result<()>;
}

impl<T: DumpSink + ?Sized> DumpSink for &mut T {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        (**self).write_at(offset, data)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

impl<T: DumpSink + ?Sized> DumpSink for Box<T> {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        (**self).write_at(offset, data)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

impl DumpSink for Vec<u8> {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset as usize + data.len();
        if self.len() < end {
            self.resize(end, 0);
        }
        self[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A dump file on disk.
pub struct FileSink {
    file: File,
    path: PathBuf,
}

impl FileSink {
    /// Creates or truncates the file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| {
                Error::from_io(ErrorOrigin::DumpFile, ErrorKind::UnableToOpenFile, &e)
                    .log_error(format!("{}: {}", path.display(), e))
            })?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DumpSink for FileSink {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, offset).map_err(|e| {
            Error::from_io(ErrorOrigin::DumpFile, ErrorKind::UnableToWriteFile, &e).log_error(format!(
                "{}: {} bytes at {:x}: {}",
                self.path.display(),
                data.len(),
                offset,
                e
            ))
        })
    }

    fn finish(&mut self) -> Result<()> {
        self.file.sync_all().map_err(|e| {
            Error::from_io(ErrorOrigin::DumpFile, ErrorKind::UnableToWriteFile, &e)
                .log_error(format!("{}: {}", self.path.display(), e))
        })
    }
}

/// Buffers sequential writes to one region of a sink.
///
/// The cache only tracks a position. Several caches can feed the same sink,
/// e.g. one for the descriptor table and one for page data.
#[derive(Debug)]
pub struct WriteCache {
    buf: Vec<u8>,
    offset: u64,
    capacity: usize,
}

impl WriteCache {
    pub fn new(offset: u64, capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            offset,
            capacity: capacity.max(1),
        }
    }

    /// Output offset the next byte written lands at.
    pub fn position(&self) -> u64 {
        self.offset + self.buf.len() as u64
    }

    pub fn write<K: DumpSink + ?Sized>(&mut self, sink: &mut K, data: &[u8]) -> Result<()> {
        let mut data = data;
        while !data.is_empty() {
            let room = self.capacity - self.buf.len();
            let n = room.min(data.len());
            self.buf.extend_from_slice(&data[..n]);
            data = &data[n..];
            if self.buf.len() == self.capacity {
                self.flush(sink)?;
            }
        }
        Ok(())
    }

    pub fn write_zero<K: DumpSink + ?Sized>(&mut self, sink: &mut K, len: u64) -> Result<()> {
        let zero = [0u8; 512];
        let mut left = len;
        while left > 0 {
            let n = left.min(zero.len() as u64);
            self.write(sink, &zero[..n as usize])?;
            left -= n;
        }
        Ok(())
    }

    pub fn flush<K: DumpSink + ?Sized>(&mut self, sink: &mut K) -> Result<()> {
        if !self.buf.is_empty() {
            trace!("write cache: flushing {:x} bytes at {:x}", self.buf.len(), self.offset);
            sink.write_at(self.offset, &self.buf)?;
            self.offset += self.buf.len() as u64;
            self.buf.clear();
        }
        Ok(())
    }
}
