/*!
The two dump bitmaps.

The 1st bitmap records which page frames exist in the source image, the 2nd
which of them are written to the output. Both come in a whole-machine form
backed by a scratch file ([`BlockBitmap`]) and a bounded window form held in
memory ([`CyclicBitmap`]).
*/

pub mod store;
pub use store::{bitmap_len, BitmapStore};

pub mod full;
pub use full::BlockBitmap;

pub mod cyclic;
pub use cyclic::CyclicBitmap;

use std::ops::Range;

use crate::error::Result;
use crate::types::Pfn;

/// A bit per page frame over some window of the address space.
pub trait Bitmap {
    /// Page frames that can currently be queried.
    fn window(&self) -> Range<Pfn>;

    fn get(&mut self, pfn: Pfn) -> Result<bool>;

    /// Changes the bit of `pfn` and returns its previous value.
    fn set(&mut self, pfn: Pfn, on: bool) -> Result<bool>;

    /// Persists pending changes.
    fn flush(&mut self) -> Result<()>;

    /// Clears every bit and moves the bitmap to `window`.
    ///
    /// Whole-machine bitmaps only accept their own window.
    fn reset(&mut self, window: Range<Pfn>) -> Result<()>;

    /// Overwrites this bitmap with the current window of `other`.
    fn copy_from(&mut self, other: &mut Self) -> Result<()>
    where
        Self: Sized;

    /// Hands the raw bytes of the current window to `f` in order.
    fn for_each_chunk(&mut self, f: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()>;

    fn set_range(&mut self, pfns: Range<Pfn>, on: bool) -> Result<u64> {
        let mut changed = 0;
        for pfn in pfns {
            if self.set(pfn, on)? != on {
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn count_ones(&mut self) -> Result<u64> {
        let mut ones = 0;
        self.for_each_chunk(&mut |bytes| {
            ones += bytes.iter().map(|b| b.count_ones() as u64).sum::<u64>();
            Ok(())
        })?;
        Ok(ones)
    }
}

/// The 1st and 2nd bitmap of one dump.
pub struct DumpBitmaps<B> {
    pub first: B,
    pub second: B,
}

impl<B: Bitmap> DumpBitmaps<B> {
    pub fn new(first: B, second: B) -> Self {
        Self { first, second }
    }

    pub fn window(&self) -> Range<Pfn> {
        self.second.window()
    }

    /// Clears both bitmaps for a new window.
    pub fn reset(&mut self, window: Range<Pfn>) -> Result<()> {
        self.first.reset(window.clone())?;
        self.second.reset(window)
    }

    /// Marks `pfns` as backed by memory in the 1st bitmap.
    ///
    /// Returns how many frames were newly marked.
    pub fn mark_present(&mut self, pfns: Range<Pfn>) -> Result<u64> {
        self.first.set_range(pfns, true)
    }

    /// Makes the 2nd bitmap a copy of the 1st.
    pub fn seed_second(&mut self) -> Result<()> {
        self.second.copy_from(&mut self.first)
    }

    /// Drops `pfn` from the output.
    ///
    /// Returns true if the page was kept before, so each page is counted
    /// under exactly one category.
    pub fn mark_excluded(&mut self, pfn: Pfn) -> Result<bool> {
        self.second.set(pfn, false)
    }

    pub fn is_present(&mut self, pfn: Pfn) -> Result<bool> {
        self.first.get(pfn)
    }

    pub fn is_keep(&mut self, pfn: Pfn) -> Result<bool> {
        self.second.get(pfn)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.first.flush()?;
        self.second.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusion_counts_once() {
        let mut bitmaps = DumpBitmaps::new(CyclicBitmap::new(64), CyclicBitmap::new(64));
        bitmaps.reset(0..64).unwrap();
        assert_eq!(bitmaps.mark_present(4..20).unwrap(), 16);
        assert_eq!(bitmaps.mark_present(10..24).unwrap(), 4);
        bitmaps.seed_second().unwrap();

        assert!(bitmaps.is_keep(5).unwrap());
        assert!(bitmaps.mark_excluded(5).unwrap());
        assert!(!bitmaps.mark_excluded(5).unwrap());
        assert!(!bitmaps.is_keep(5).unwrap());
        assert!(bitmaps.is_present(5).unwrap());
        assert!(!bitmaps.mark_excluded(40).unwrap());

        assert_eq!(bitmaps.first.count_ones().unwrap(), 20);
        assert_eq!(bitmaps.second.count_ones().unwrap(), 19);
    }
}
