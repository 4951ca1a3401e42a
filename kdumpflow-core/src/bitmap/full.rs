use std::fs::File;
use std::ops::Range;
use std::os::unix::fs::FileExt;

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::types::Pfn;

use super::Bitmap;

/// Bytes of the bitmap file cached at a time.
pub const BUFSIZE_BITMAP: u64 = 4096;

/// A whole-machine bitmap stored in a region of a scratch file.
///
/// One block of the region is cached in memory. It is written back when a
/// different block is touched or on [`flush`](Bitmap::flush).
pub struct BlockBitmap {
    file: File,
    base: u64,
    len: u64,
    max_mapnr: Pfn,
    block: Option<u64>,
    dirty: bool,
    buf: Vec<u8>,
}

impl BlockBitmap {
    pub fn new(file: File, base: u64, len: u64, max_mapnr: Pfn) -> Self {
        Self {
            file,
            base,
            len,
            max_mapnr,
            block: None,
            dirty: false,
            buf: vec![0u8; BUFSIZE_BITMAP as usize],
        }
    }

    fn block_len(&self, block: u64) -> usize {
        (self.len - block * BUFSIZE_BITMAP).min(BUFSIZE_BITMAP) as usize
    }

    fn check(&self, pfn: Pfn) -> Result<()> {
        if pfn < self.max_mapnr {
            Ok(())
        } else {
            Err(Error(ErrorOrigin::Bitmap, ErrorKind::OutOfBounds)
                .log_error(format!("pfn {:x} beyond max_mapnr {:x}", pfn, self.max_mapnr)))
        }
    }

    fn write_back(&mut self) -> Result<()> {
        if let (Some(block), true) = (self.block, self.dirty) {
            let len = self.block_len(block);
            let offset = self.base + block * BUFSIZE_BITMAP;
            self.file.write_all_at(&self.buf[..len], offset).map_err(|e| {
                Error::from_io(ErrorOrigin::Bitmap, ErrorKind::UnableToWriteFile, &e)
                    .log_error(format!("bitmap block at {:x}: {}", offset, e))
            })?;
            self.dirty = false;
        }
        Ok(())
    }

    fn load(&mut self, pfn: Pfn) -> Result<usize> {
        let byte = pfn / 8;
        let block = byte / BUFSIZE_BITMAP;
        if self.block != Some(block) {
            self.write_back()?;
            let len = self.block_len(block);
            let offset = self.base + block * BUFSIZE_BITMAP;
            self.file.read_exact_at(&mut self.buf[..len], offset).map_err(|e| {
                Error::from_io(ErrorOrigin::Bitmap, ErrorKind::UnableToReadFile, &e)
                    .log_error(format!("bitmap block at {:x}: {}", offset, e))
            })?;
            self.block = Some(block);
        }
        Ok((byte % BUFSIZE_BITMAP) as usize)
    }

    fn chunks(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        let blocks = (self.len + BUFSIZE_BITMAP - 1) / BUFSIZE_BITMAP;
        (0..blocks).map(move |b| (b * BUFSIZE_BITMAP, self.block_len(b)))
    }
}

impl Bitmap for BlockBitmap {
    fn window(&self) -> Range<Pfn> {
        0..self.max_mapnr
    }

    fn get(&mut self, pfn: Pfn) -> Result<bool> {
        self.check(pfn)?;
        let idx = self.load(pfn)?;
        Ok(self.buf[idx] & (1 << (pfn % 8)) != 0)
    }

    fn set(&mut self, pfn: Pfn, on: bool) -> Result<bool> {
        self.check(pfn)?;
        let idx = self.load(pfn)?;
        let mask = 1u8 << (pfn % 8);
        let previous = self.buf[idx] & mask != 0;
        if previous != on {
            if on {
                self.buf[idx] |= mask;
            } else {
                self.buf[idx] &= !mask;
            }
            self.dirty = true;
        }
        Ok(previous)
    }

    fn flush(&mut self) -> Result<()> {
        self.write_back()
    }

    fn reset(&mut self, window: Range<Pfn>) -> Result<()> {
        if window != self.window() {
            return Err(Error(ErrorOrigin::Bitmap, ErrorKind::OutOfBounds).log_error(format!(
                "a whole-machine bitmap cannot move to window {:x}-{:x}",
                window.start, window.end
            )));
        }
        let zero = vec![0u8; BUFSIZE_BITMAP as usize];
        for (off, len) in self.chunks().collect::<Vec<_>>() {
            self.file
                .write_all_at(&zero[..len], self.base + off)
                .map_err(|e| {
                    Error::from_io(ErrorOrigin::Bitmap, ErrorKind::UnableToWriteFile, &e)
                        .log_error(format!("clearing bitmap at {:x}: {}", self.base + off, e))
                })?;
        }
        self.block = None;
        self.dirty = false;
        Ok(())
    }

    fn copy_from(&mut self, other: &mut Self) -> Result<()> {
        other.flush()?;
        self.flush()?;
        let mut buf = vec![0u8; BUFSIZE_BITMAP as usize];
        for (off, len) in self.chunks().collect::<Vec<_>>() {
            other
                .file
                .read_exact_at(&mut buf[..len], other.base + off)
                .map_err(|e| {
                    Error::from_io(ErrorOrigin::Bitmap, ErrorKind::UnableToReadFile, &e)
                        .log_error(format!("copying bitmap at {:x}: {}", other.base + off, e))
                })?;
            self.file
                .write_all_at(&buf[..len], self.base + off)
                .map_err(|e| {
                    Error::from_io(ErrorOrigin::Bitmap, ErrorKind::UnableToWriteFile, &e)
                        .log_error(format!("copying bitmap at {:x}: {}", self.base + off, e))
                })?;
        }
        self.block = None;
        Ok(())
    }

    fn for_each_chunk(&mut self, f: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        self.flush()?;
        let mut buf = vec![0u8; BUFSIZE_BITMAP as usize];
        for (off, len) in self.chunks().collect::<Vec<_>>() {
            self.file
                .read_exact_at(&mut buf[..len], self.base + off)
                .map_err(|e| {
                    Error::from_io(ErrorOrigin::Bitmap, ErrorKind::UnableToReadFile, &e)
                        .log_error(format!("reading bitmap at {:x}: {}", self.base + off, e))
                })?;
            f(&buf[..len])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::BitmapStore;

    #[test]
    fn bits_survive_block_switches() {
        let store = BitmapStore::new(0x20000, 4096).unwrap();
        let mut bitmaps = store.bitmaps().unwrap();
        let bm = &mut bitmaps.first;

        assert!(!bm.set(1, true).unwrap());
        assert!(!bm.set(0x1_8000, true).unwrap());
        assert!(bm.set(1, true).unwrap());
        assert!(bm.get(1).unwrap());
        assert!(bm.get(0x1_8000).unwrap());
        assert!(!bm.get(2).unwrap());
        assert!(bm.get(0x20000).is_err());
    }

    #[test]
    fn copy_and_reset() {
        let store = BitmapStore::new(0x10000, 4096).unwrap();
        let mut bitmaps = store.bitmaps().unwrap();
        bitmaps.first.set_range(0x100..0x300, true).unwrap();
        bitmaps.second.copy_from(&mut bitmaps.first).unwrap();
        assert_eq!(bitmaps.second.count_ones().unwrap(), 0x200);

        bitmaps.first.reset(0..0x10000).unwrap();
        assert_eq!(bitmaps.first.count_ones().unwrap(), 0);
        assert!(bitmaps.second.get(0x2ff).unwrap());
        assert!(bitmaps.first.reset(0..0x100).is_err());
    }
}
