/*!
Walker for the buddy allocator's free lists.

Used to find free pages when the kernel offers no way to recognise them
from their descriptors alone.
*/

use log::{debug, trace};

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::mem::{MemMapTable, SourceMemory};
use crate::types::Pfn;

use super::zone::{FreeAreaLayout, ZoneInfo};

/// Totals gathered from one zone.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FreeListStats {
    /// Pages linked into the free lists.
    pub listed: u64,
    /// Pages newly excluded by the callback.
    pub excluded: u64,
    /// The zone's own free page counter, when readable.
    pub expected: Option<u64>,
}

pub struct FreeListScanner<'a> {
    layout: &'a FreeAreaLayout,
    mem_map: &'a MemMapTable,
}

impl<'a> FreeListScanner<'a> {
    pub fn new(layout: &'a FreeAreaLayout, mem_map: &'a MemMapTable) -> Self {
        Self { layout, mem_map }
    }

    /// Walks every free list of `zone`, from the highest order down.
    ///
    /// `exclude(pfn, nr_pages)` is called once per free block and returns
    /// how many of its pages it actually excluded.
    pub fn scan_zone<S, F>(&self, source: &mut S, zone: &ZoneInfo, mut exclude: F) -> Result<FreeListStats>
    where
        S: SourceMemory,
        F: FnMut(Pfn, u64) -> Result<u64>,
    {
        let l = self.layout;
        let mut stats = FreeListStats::default();

        for order in (0..l.nr_orders).rev() {
            let nr_pages = 1u64 << order;
            for migrate_type in 0..l.nr_migrate_types {
                let head = l.list_head(zone.address, order, migrate_type);
                let mut previous = head;
                let mut curr = self.read_link(source, head + l.off_list_next)?;

                while curr != head {
                    let page = curr.wrapping_sub(l.off_page_lru);
                    let start_pfn = self.mem_map.page_to_pfn(page, l.size_page).ok_or_else(|| {
                        Error(ErrorOrigin::FreeList, ErrorKind::NotFound)
                            .log_error(format!("page descriptor {:x} has no pfn", page))
                    })?;

                    let curr_prev = self.read_link(source, curr + l.off_list_prev)?;
                    if curr_prev != previous {
                        return Err(Error(ErrorOrigin::FreeList, ErrorKind::BrokenFreeList).log_error(
                            format!(
                                "zone {:x} order {} type {}: entry {:x} points back to {:x} instead of {:x}",
                                zone.address, order, migrate_type, curr, curr_prev, previous
                            ),
                        ));
                    }

                    trace!("free block pfn={:x} order={}", start_pfn, order);
                    stats.listed += nr_pages;
                    stats.excluded += exclude(start_pfn, nr_pages)?;

                    previous = curr;
                    curr = self.read_link(source, curr + l.off_list_next)?;
                }
            }
        }

        stats.expected = match l.free_pages_address(zone.address) {
            Some(addr) => Some(source.virt_read_ulong(addr, l.word_size)?),
            None => {
                debug!("zone {:x} has no readable free page counter", zone.address);
                None
            }
        };

        Ok(stats)
    }

    fn read_link<S: SourceMemory>(&self, source: &mut S, addr: u64) -> Result<u64> {
        source
            .virt_read_ulong(addr, self.layout.word_size)
            .map_err(|e| Error(ErrorOrigin::FreeList, e.1).log_error(format!("list link at {:x}", addr)))
    }
}
