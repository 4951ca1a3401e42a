/*!
Windows ("cycles") the page frame space is processed in when the bitmaps do
not fit the memory budget.
*/

use std::ops::Range;

use crate::kernel::PageClass;
use crate::types::Pfn;

/// The window currently processed, together with an exclusion that spilled
/// over from the previous window.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cycle {
    pub start_pfn: Pfn,
    pub end_pfn: Pfn,
    pub exclude_pfn_start: Pfn,
    pub exclude_pfn_end: Pfn,
    /// Category the pending exclusion is counted under.
    pub exclude_class: Option<PageClass>,
}

impl Cycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves to `window`, keeping any pending exclusion.
    pub fn enter(&mut self, window: Range<Pfn>) {
        self.start_pfn = window.start;
        self.end_pfn = window.end;
    }

    pub fn window(&self) -> Range<Pfn> {
        self.start_pfn..self.end_pfn
    }

    pub fn contains(&self, pfn: Pfn) -> bool {
        pfn >= self.start_pfn && pfn < self.end_pfn
    }

    /// Frames of the pending exclusion that fall into the current window.
    pub fn pending(&self) -> Option<(Range<Pfn>, PageClass)> {
        let class = self.exclude_class?;
        let start = self.exclude_pfn_start.max(self.start_pfn);
        let end = self.exclude_pfn_end.min(self.end_pfn);
        if start < end {
            Some((start..end, class))
        } else {
            None
        }
    }

    /// Records that `pfns` are excluded under `class` and returns the part
    /// inside the current window.
    ///
    /// The part past the window end stays pending for the next window.
    pub fn exclude(&mut self, pfns: Range<Pfn>, class: PageClass) -> Range<Pfn> {
        self.exclude_pfn_start = self.end_pfn;
        self.exclude_pfn_end = pfns.end;
        self.exclude_class = if pfns.end > self.end_pfn {
            Some(class)
        } else {
            None
        };
        pfns.start..pfns.end.min(self.end_pfn)
    }

    /// Forgets any pending exclusion.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Iterator over the windows tiling `[start, end)`.
///
/// The first window is aligned down to a multiple of the window size, the last
/// is truncated at `end`.
#[derive(Copy, Clone, Debug)]
pub struct Cycles {
    next: Pfn,
    end: Pfn,
    pfn_cyclic: u64,
}

impl Cycles {
    pub fn new(pfns: Range<Pfn>, pfn_cyclic: u64) -> Self {
        let pfn_cyclic = pfn_cyclic.max(1);
        Self {
            next: pfns.start - pfns.start % pfn_cyclic,
            end: pfns.end,
            pfn_cyclic,
        }
    }

    pub fn pfn_cyclic(&self) -> u64 {
        self.pfn_cyclic
    }
}

impl Iterator for Cycles {
    type Item = Range<Pfn>;

    fn next(&mut self) -> Option<Range<Pfn>> {
        if self.next >= self.end {
            return None;
        }
        let start = self.next;
        let end = start.saturating_add(self.pfn_cyclic).min(self.end);
        self.next = end;
        Some(start..end)
    }
}

/// Window length for a buffer of `free_bytes`.
///
/// Uses at most 80% of the available memory, never more than the bitmap for the
/// whole machine needs, shared between `num_files` split workers. The result is
/// a multiple of 8 frames.
pub fn pfn_cyclic_for(free_bytes: u64, max_mapnr: Pfn, num_files: u64) -> u64 {
    let limit = free_bytes / 10 * 8;
    let needed = crate::types::divideup(max_mapnr, 8);
    let bytes = (limit.min(needed) / num_files.max(1)).max(1);
    bytes * 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    #[test]
    fn windows_tile_the_range() {
        let windows = Cycles::new(0..100, 32).collect_vec();
        assert_eq!(windows, vec![0..32, 32..64, 64..96, 96..100]);
        let windows = Cycles::new(40..70, 32).collect_vec();
        assert_eq!(windows, vec![32..64, 64..70]);
        assert_eq!(Cycles::new(0..0, 32).count(), 0);
        assert_eq!(Cycles::new(0..100, 1000).collect_vec(), vec![0..100]);
    }

    #[test]
    fn exclusion_spills_into_next_window() {
        let mut cycle = Cycle::new();
        cycle.enter(0..32);
        assert_eq!(cycle.exclude(24..40, PageClass::Free), 24..32);
        assert_eq!(cycle.pending(), None);

        cycle.enter(32..64);
        assert_eq!(cycle.pending(), Some((32..40, PageClass::Free)));
        assert_eq!(cycle.exclude(32..40, PageClass::Free), 32..40);
        assert_eq!(cycle.exclude_class, None);

        cycle.enter(64..96);
        assert_eq!(cycle.pending(), None);
    }

    #[test]
    fn buffer_sizing() {
        // plenty of memory: one window for the whole machine
        assert_eq!(pfn_cyclic_for(1 << 30, 0x1000, 1), 0x1000);
        // 80% of 1000 bytes is 800 bytes, i.e. 6400 frames
        assert_eq!(pfn_cyclic_for(1000, 1 << 20, 1), 6400);
        assert_eq!(pfn_cyclic_for(1000, 1 << 20, 2), 3200);
        assert_eq!(pfn_cyclic_for(0, 1 << 20, 1), 8);
    }
}
