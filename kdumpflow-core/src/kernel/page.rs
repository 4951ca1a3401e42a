/*!
Decoding of kernel page descriptors (`struct page`).
*/

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::types::Pfn;

use super::layout::{uint_at, ulong_at, LayoutTable};

/// Number of descriptors read from the source in one batch.
pub const PGMM_CACHED: u64 = 512;

/// Low bit of `page.mapping` marking anonymous memory.
pub const PAGE_MAPPING_ANON: u64 = 0x1;

// bit positions used by kernels that predate the exported flag numbers
const PG_LRU_ORIGINAL: i64 = 5;
const PG_SLAB_ORIGINAL: i64 = 7;
const PG_PRIVATE_ORIGINAL: i64 = 11;
const PG_COMPOUND_ORIGINAL: i64 = 14;
const PG_SWAPCACHE_ORIGINAL: i64 = 15;

/// Page flag masks of the crashed kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageFlagBits {
    pub lru: u64,
    pub private: u64,
    pub swapcache: u64,
    pub slab: u64,
    pub head: u64,
    pub hwpoison: Option<u64>,
    pub buddy: Option<u64>,
}

impl PageFlagBits {
    pub fn from_table(table: &LayoutTable) -> Result<Self> {
        let mask = |name: &str, bit: i64| {
            u32::try_from(bit)
                .ok()
                .and_then(|b| 1u64.checked_shl(b))
                .ok_or_else(|| {
                    Error(ErrorOrigin::Layout, ErrorKind::InvalidHeader)
                        .log_error(format!("NUMBER({})={} is not a page flag bit", name, bit))
                })
        };
        let bit = |name: &str, default: i64| mask(name, table.number(name).unwrap_or(default));
        let optional = |name: &str| table.number(name).map(|b| mask(name, b)).transpose();
        Ok(Self {
            lru: bit("PG_lru", PG_LRU_ORIGINAL)?,
            private: bit("PG_private", PG_PRIVATE_ORIGINAL)?,
            swapcache: bit("PG_swapcache", PG_SWAPCACHE_ORIGINAL)?,
            slab: bit("PG_slab", PG_SLAB_ORIGINAL)?,
            head: table
                .number("PG_head_mask")
                .map(|m| m as u64)
                .unwrap_or(1 << PG_COMPOUND_ORIGINAL),
            hwpoison: optional("PG_hwpoison")?,
            buddy: optional("PG_buddy")?,
        })
    }
}

/// How a compound destructor identifies a hugetlbfs page.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HugetlbDtor {
    /// Destructor is a function pointer compared to `free_huge_page`.
    Symbol(u64),
    /// Destructor is an index compared to `HUGETLB_PAGE_DTOR`.
    Index(u64),
    Unknown,
}

/// Where the order and destructor of a compound page live in its first tail page.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum CompoundFields {
    /// Stored as `unsigned long`s in the tail page's `lru` link.
    Lru { order: usize, dtor: usize },
    /// Stored as bytes in dedicated members.
    Bytes { order: usize, dtor: usize },
}

/// Resolved `struct page` layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageLayout {
    pub size_page: u64,
    pub word_size: u64,
    off_flags: usize,
    off_count: usize,
    off_mapping: usize,
    off_mapcount: Option<usize>,
    off_private: Option<usize>,
    compound: CompoundFields,
    pub flags: PageFlagBits,
    pub hugetlb: HugetlbDtor,
}

/// The fields of one page descriptor the classifier looks at.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PageDescriptor {
    pub flags: u64,
    pub count: u32,
    pub mapping: u64,
    pub mapcount: u32,
    pub private: u64,
    pub compound_order: u32,
    pub compound_dtor: u64,
}

impl PageLayout {
    pub fn from_table(table: &LayoutTable) -> Result<Self> {
        let size_page = table.require_size("page")?;
        let off_flags = table.require_offset("page.flags")? as usize;
        let off_count = match table.offset("page._refcount") {
            Some(off) => off,
            None => table.require_offset("page._count")?,
        } as usize;
        let off_mapping = table.require_offset("page.mapping")? as usize;

        let compound = match (
            table.offset("page.compound_order"),
            table.offset("page.compound_dtor"),
        ) {
            (Some(order), Some(dtor)) => CompoundFields::Bytes {
                order: order as usize,
                dtor: dtor as usize,
            },
            _ => {
                let lru = table.require_offset("page.lru")?;
                CompoundFields::Lru {
                    order: (lru + table.require_offset("list_head.prev")?) as usize,
                    dtor: (lru + table.require_offset("list_head.next")?) as usize,
                }
            }
        };

        let hugetlb = match (table.symbol("free_huge_page"), table.number("HUGETLB_PAGE_DTOR")) {
            (Some(addr), _) => HugetlbDtor::Symbol(addr),
            (None, Some(index)) => HugetlbDtor::Index(index as u64),
            (None, None) => HugetlbDtor::Unknown,
        };

        Ok(Self {
            size_page,
            word_size: table.word_size(),
            off_flags,
            off_count,
            off_mapping,
            off_mapcount: table.offset("page._mapcount").map(|o| o as usize),
            off_private: table.offset("page.private").map(|o| o as usize),
            compound,
            flags: PageFlagBits::from_table(table)?,
            hugetlb,
        })
    }

    pub fn has_mapcount(&self) -> bool {
        self.off_mapcount.is_some()
    }

    pub fn has_private(&self) -> bool {
        self.off_private.is_some()
    }

    /// Decodes the descriptor of `pfn` from `slot`.
    ///
    /// `tail` holds the descriptor that follows in memory. It is only
    /// consulted for compound heads; pass `None` when it was not read.
    pub fn decode(&self, pfn: Pfn, slot: &[u8], tail: Option<&[u8]>) -> PageDescriptor {
        let word = self.word_size;
        let flags = ulong_at(slot, self.off_flags, word);

        let (mut compound_order, compound_dtor) = match tail {
            Some(tail) if flags & self.flags.head != 0 => match self.compound {
                CompoundFields::Lru { order, dtor } => {
                    (ulong_at(tail, order, word), ulong_at(tail, dtor, word))
                }
                CompoundFields::Bytes { order, dtor } => (tail[order] as u64, tail[dtor] as u64),
            },
            _ => (0, 0),
        };
        if !is_valid_order(pfn, compound_order, word) {
            compound_order = 0;
        }

        PageDescriptor {
            flags,
            count: uint_at(slot, self.off_count),
            mapping: ulong_at(slot, self.off_mapping, word),
            mapcount: self.off_mapcount.map(|o| uint_at(slot, o)).unwrap_or(0),
            private: self.off_private.map(|o| ulong_at(slot, o, word)).unwrap_or(0),
            compound_order: compound_order as u32,
            compound_dtor,
        }
    }

    pub fn is_lru(&self, d: &PageDescriptor) -> bool {
        d.flags & self.flags.lru != 0
    }

    pub fn is_private(&self, d: &PageDescriptor) -> bool {
        d.flags & self.flags.private != 0
    }

    pub fn is_swapcache(&self, d: &PageDescriptor) -> bool {
        d.flags & self.flags.swapcache != 0
    }

    pub fn is_slab(&self, d: &PageDescriptor) -> bool {
        d.flags & self.flags.slab != 0
    }

    pub fn is_hwpoison(&self, d: &PageDescriptor) -> bool {
        self.flags.hwpoison.map(|m| d.flags & m != 0).unwrap_or(false)
    }

    pub fn is_anon(&self, d: &PageDescriptor) -> bool {
        d.mapping & PAGE_MAPPING_ANON != 0
    }

    pub fn is_hugetlb(&self, d: &PageDescriptor) -> bool {
        match self.hugetlb {
            HugetlbDtor::Symbol(addr) => d.compound_order > 0 && d.compound_dtor == addr,
            HugetlbDtor::Index(index) => d.compound_order > 0 && d.compound_dtor == index,
            HugetlbDtor::Unknown => false,
        }
    }
}

/// A block order is usable if it fits the machine word and `pfn` is aligned to it.
pub fn is_valid_order(pfn: Pfn, order: u64, word_size: u64) -> bool {
    order < word_size * 8 && order < 64 && pfn & ((1u64 << order) - 1) == 0
}
