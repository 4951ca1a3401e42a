use crate::error::Result;

use super::layout::LayoutTable;

/// Orders in a zone's free area when the kernel does not export them.
pub const DEFAULT_MAX_ORDER: u64 = 11;

/// A memory zone of one NUMA node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ZoneInfo {
    pub node: u32,
    pub index: u32,
    /// Kernel virtual address of the `struct zone`.
    pub address: u64,
    pub spanned_pages: u64,
}

/// Where a zone keeps its global free page count.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FreePagesCounter {
    /// `zone.free_pages`
    Field(u64),
    /// `zone.vm_stat[NR_FREE_PAGES]`
    VmStat(u64),
    Unavailable,
}

/// Resolved layout of the buddy allocator's free area lists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FreeAreaLayout {
    pub off_free_area: u64,
    pub size_free_area: u64,
    pub off_free_list: u64,
    pub size_list_head: u64,
    pub off_list_next: u64,
    pub off_list_prev: u64,
    pub off_page_lru: u64,
    pub size_page: u64,
    pub nr_orders: u64,
    pub nr_migrate_types: u64,
    pub free_pages: FreePagesCounter,
    pub word_size: u64,
}

impl FreeAreaLayout {
    pub fn from_table(table: &LayoutTable) -> Result<Self> {
        let free_pages = match (table.offset("zone.free_pages"), table.offset("zone.vm_stat")) {
            (Some(off), _) => FreePagesCounter::Field(off),
            (None, Some(off)) => match table.number("NR_FREE_PAGES") {
                Some(index) => FreePagesCounter::VmStat(off + table.word_size() * index as u64),
                None => FreePagesCounter::Unavailable,
            },
            (None, None) => FreePagesCounter::Unavailable,
        };

        Ok(Self {
            off_free_area: table.require_offset("zone.free_area")?,
            size_free_area: table.require_size("free_area")?,
            off_free_list: table.require_offset("free_area.free_list")?,
            size_list_head: table.require_size("list_head")?,
            off_list_next: table.require_offset("list_head.next")?,
            off_list_prev: table.require_offset("list_head.prev")?,
            off_page_lru: table.require_offset("page.lru")?,
            size_page: table.require_size("page")?,
            nr_orders: table.length("zone.free_area").unwrap_or(DEFAULT_MAX_ORDER),
            nr_migrate_types: table.length("free_area.free_list").unwrap_or(1),
            free_pages,
            word_size: table.word_size(),
        })
    }

    /// Address of the list head for blocks of `order` and `migrate_type` in `zone`.
    pub fn list_head(&self, zone: u64, order: u64, migrate_type: u64) -> u64 {
        zone + self.off_free_area
            + self.size_free_area * order
            + self.off_free_list
            + self.size_list_head * migrate_type
    }

    pub fn free_pages_address(&self, zone: u64) -> Option<u64> {
        match self.free_pages {
            FreePagesCounter::Field(off) | FreePagesCounter::VmStat(off) => Some(zone + off),
            FreePagesCounter::Unavailable => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_head_address() {
        let table = LayoutTable::new()
            .with_offset("zone.free_area", 0x100)
            .with_size("free_area", 0x58)
            .with_offset("free_area.free_list", 0)
            .with_size("list_head", 0x10)
            .with_offset("list_head.next", 0)
            .with_offset("list_head.prev", 8)
            .with_offset("page.lru", 8)
            .with_size("page", 64)
            .with_length("free_area.free_list", 5)
            .with_offset("zone.vm_stat", 0x500)
            .with_number("NR_FREE_PAGES", 0);
        let fa = FreeAreaLayout::from_table(&table).unwrap();
        assert_eq!(fa.nr_orders, DEFAULT_MAX_ORDER);
        assert_eq!(fa.nr_migrate_types, 5);
        assert_eq!(fa.list_head(0x1000, 2, 3), 0x1000 + 0x100 + 0x58 * 2 + 0x30);
        assert_eq!(fa.free_pages_address(0x1000), Some(0x1500));
    }
}
