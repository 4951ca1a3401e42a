use std::ops::Range;

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::types::{divideup, Pfn};

use super::Bitmap;

/// A bitmap covering a single window of page frames, held in memory.
///
/// Windows start on a byte boundary so the buffer can be written to its
/// absolute place in the dump file unchanged.
#[derive(Clone, Debug)]
pub struct CyclicBitmap {
    buf: Vec<u8>,
    capacity: u64,
    window: Range<Pfn>,
}

impl CyclicBitmap {
    /// Creates a bitmap able to hold windows of up to `pfn_cyclic` frames.
    pub fn new(pfn_cyclic: u64) -> Self {
        Self {
            buf: vec![0u8; divideup(pfn_cyclic, 8) as usize],
            capacity: pfn_cyclic,
            window: 0..0,
        }
    }

    fn index(&self, pfn: Pfn) -> Result<(usize, u8)> {
        if !self.window.contains(&pfn) {
            return Err(Error(ErrorOrigin::Cycle, ErrorKind::PfnOutOfCycle).log_error(format!(
                "pfn {:x} outside window {:x}-{:x}",
                pfn, self.window.start, self.window.end
            )));
        }
        let rel = pfn - self.window.start;
        Ok(((rel / 8) as usize, 1u8 << (rel % 8)))
    }

    fn window_bytes(&self) -> usize {
        divideup(self.window.end - self.window.start, 8) as usize
    }
}

impl Bitmap for CyclicBitmap {
    fn window(&self) -> Range<Pfn> {
        self.window.clone()
    }

    fn get(&mut self, pfn: Pfn) -> Result<bool> {
        let (idx, mask) = self.index(pfn)?;
        Ok(self.buf[idx] & mask != 0)
    }

    fn set(&mut self, pfn: Pfn, on: bool) -> Result<bool> {
        let (idx, mask) = self.index(pfn)?;
        let previous = self.buf[idx] & mask != 0;
        if on {
            self.buf[idx] |= mask;
        } else {
            self.buf[idx] &= !mask;
        }
        Ok(previous)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self, window: Range<Pfn>) -> Result<()> {
        if window.start % 8 != 0 || window.end < window.start || window.end - window.start > self.capacity {
            return Err(Error(ErrorOrigin::Cycle, ErrorKind::OutOfBounds).log_error(format!(
                "window {:x}-{:x} does not fit a buffer of {:x} pfns",
                window.start, window.end, self.capacity
            )));
        }
        self.buf.iter_mut().for_each(|b| *b = 0);
        self.window = window;
        Ok(())
    }

    fn copy_from(&mut self, other: &mut Self) -> Result<()> {
        if self.capacity < other.window.end - other.window.start {
            return Err(Error(ErrorOrigin::Cycle, ErrorKind::OutOfBounds)
                .log_error("copy source window is larger than the buffer"));
        }
        let len = other.window_bytes();
        self.buf[..len].copy_from_slice(&other.buf[..len]);
        self.buf[len..].iter_mut().for_each(|b| *b = 0);
        self.window = other.window.clone();
        Ok(())
    }

    fn for_each_chunk(&mut self, f: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        f(&self.buf[..self.window_bytes()])
    }

    fn set_range(&mut self, pfns: Range<Pfn>, on: bool) -> Result<u64> {
        if pfns.is_empty() {
            return Ok(0);
        }
        self.index(pfns.start)?;
        self.index(pfns.end - 1)?;

        let rel_start = pfns.start - self.window.start;
        let rel_end = pfns.end - self.window.start;
        let fill = if on { 0xff } else { 0 };
        let mut changed = 0;
        let mut rel = rel_start;
        while rel < rel_end {
            let idx = (rel / 8) as usize;
            if rel % 8 == 0 && rel + 8 <= rel_end {
                let before = self.buf[idx].count_ones() as u64;
                changed += if on { 8 - before } else { before };
                self.buf[idx] = fill;
                rel += 8;
            } else {
                let mask = 1u8 << (rel % 8);
                if (self.buf[idx] & mask != 0) != on {
                    changed += 1;
                    self.buf[idx] ^= mask;
                }
                rel += 1;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outside_window_is_rejected() {
        let mut bm = CyclicBitmap::new(64);
        bm.reset(128..192).unwrap();
        assert!(!bm.get(130).unwrap());
        assert_eq!(
            bm.get(127).unwrap_err(),
            Error(ErrorOrigin::Cycle, ErrorKind::PfnOutOfCycle)
        );
        assert!(bm.set(192, true).is_err());
        assert!(bm.reset(129..140).is_err());
        assert!(bm.reset(0..72).is_err());
    }

    #[test]
    fn range_fill_counts_changes() {
        let mut bm = CyclicBitmap::new(64);
        bm.reset(8..72).unwrap();
        assert_eq!(bm.set_range(10..30, true).unwrap(), 20);
        assert_eq!(bm.set_range(8..72, true).unwrap(), 44);
        assert_eq!(bm.set_range(12..13, false).unwrap(), 1);
        assert_eq!(bm.count_ones().unwrap(), 63);
        assert!(!bm.get(12).unwrap());
        assert!(bm.get(71).unwrap());
    }

    #[test]
    fn short_last_window() {
        let mut bm = CyclicBitmap::new(64);
        bm.reset(64..69).unwrap();
        bm.set_range(64..69, true).unwrap();
        let mut seen = Vec::new();
        bm.for_each_chunk(&mut |b| {
            seen.extend_from_slice(b);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![0x1f]);
    }
}
