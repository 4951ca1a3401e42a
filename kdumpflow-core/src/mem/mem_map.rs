use std::fmt;
use std::ops::Range;

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::types::Pfn;

/// A contiguous run of page frames and the kernel virtual address of the
/// page descriptor array covering it.
///
/// `mem_map` is `None` for ranges the kernel keeps no descriptors for.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct MemMapSegment {
    pub pfn_start: Pfn,
    pub pfn_end: Pfn,
    pub mem_map: Option<u64>,
}

impl MemMapSegment {
    pub fn pfns(&self) -> Range<Pfn> {
        self.pfn_start..self.pfn_end
    }

    /// Address of the descriptor of `pfn`.
    pub fn page_address(&self, pfn: Pfn, size_page: u64) -> Option<u64> {
        self.mem_map
            .filter(|_| self.pfns().contains(&pfn))
            .map(|base| base + (pfn - self.pfn_start) * size_page)
    }
}

impl fmt::Debug for MemMapSegment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.mem_map {
            Some(addr) => write!(
                f,
                "{:x}-{:x} => mem_map {:x}",
                self.pfn_start, self.pfn_end, addr
            ),
            None => write!(f, "{:x}-{:x} => not mapped", self.pfn_start, self.pfn_end),
        }
    }
}

/// The `MemMapTable` holds the page descriptor arrays of the crashed kernel
/// ordered by their first page frame.
///
/// Segments never overlap.
///
/// # Examples
///
/// ```
/// use kdumpflow_core::mem::MemMapTable;
///
/// let mut table = MemMapTable::new();
/// table.push(0, 0x8000, Some(0xffffea0000000000)).unwrap();
/// table.push(0x8000, 0x10000, None).unwrap();
///
/// assert_eq!(table.page_to_pfn(0xffffea0000000040, 64), Some(1));
/// ```
#[derive(Clone, Default)]
pub struct MemMapTable {
    segments: Vec<MemMapSegment>,
}

impl MemMapTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single array covering every page frame up to `max_mapnr`.
    pub fn flat(max_mapnr: Pfn, mem_map: u64) -> Self {
        Self {
            segments: vec![MemMapSegment {
                pfn_start: 0,
                pfn_end: max_mapnr,
                mem_map: Some(mem_map),
            }],
        }
    }

    /// Appends a segment; it must start at or after the end of the previous one.
    pub fn push(&mut self, pfn_start: Pfn, pfn_end: Pfn, mem_map: Option<u64>) -> Result<&mut Self> {
        if pfn_end < pfn_start {
            return Err(Error(ErrorOrigin::MemoryMap, ErrorKind::OutOfBounds)
                .log_error(format!("segment {:x}-{:x} is reversed", pfn_start, pfn_end)));
        }
        if let Some(last) = self.segments.last() {
            if last.pfn_end > pfn_start {
                return Err(Error(ErrorOrigin::MemoryMap, ErrorKind::OutOfBounds).log_error(
                    format!(
                        "segment {:x}-{:x} overlaps the previous one ending at {:x}",
                        pfn_start, pfn_end, last.pfn_end
                    ),
                ));
            }
        }
        self.segments.push(MemMapSegment {
            pfn_start,
            pfn_end,
            mem_map,
        });
        Ok(self)
    }

    /// Builds a table from unordered segments, filling gaps up to `max_mapnr`
    /// with unmapped entries.
    pub fn from_unordered(mut segments: Vec<MemMapSegment>, max_mapnr: Pfn) -> Result<Self> {
        segments.sort_by_key(|s| s.pfn_start);
        let mut table = Self::new();
        let mut next = 0;
        for seg in segments {
            if seg.pfn_start > next {
                table.push(next, seg.pfn_start, None)?;
            }
            let end = seg.pfn_end.min(max_mapnr);
            if end > seg.pfn_start {
                table.push(seg.pfn_start, end, seg.mem_map)?;
            }
            next = next.max(end);
        }
        if next < max_mapnr {
            table.push(next, max_mapnr, None)?;
        }
        Ok(table)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemMapSegment> {
        self.segments.iter()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segments with descriptors that intersect `range`.
    pub fn mapped_overlapping(&self, range: Range<Pfn>) -> impl Iterator<Item = &MemMapSegment> {
        self.segments
            .iter()
            .filter(move |s| s.mem_map.is_some() && s.pfn_start < range.end && s.pfn_end > range.start)
    }

    /// Translates the address of a page descriptor back to its page frame.
    pub fn page_to_pfn(&self, page: u64, size_page: u64) -> Option<Pfn> {
        self.segments.iter().find_map(|s| {
            let base = s.mem_map?;
            if page < base {
                return None;
            }
            let index = (page - base) / size_page;
            if index >= s.pfn_end - s.pfn_start {
                return None;
            }
            Some(s.pfn_start + index)
        })
    }
}

impl fmt::Debug for MemMapTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, s) in self.segments.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{:?}", s)?;
        }
        Ok(())
    }
}
