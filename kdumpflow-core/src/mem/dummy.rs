/*!
A synthetic crashed kernel held entirely in memory.

The builder lays out a page descriptor array, one memory zone with buddy free
lists and the physical pages themselves, and produces the matching layout
table. Page contents are random unless stated otherwise.
*/

use std::ops::Range;

use rand::{RngCore, SeedableRng};
use rand_xorshift::XorShiftRng;

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::kernel::{KernelContext, LayoutTable, ZoneInfo};
use crate::mem::{ElfIdent, ImageInfo, LoadSegment, MemMapSegment, MemMapTable, ReopenSource, SourceMemory};
use crate::types::{roundup, Pfn};

/// Start of the direct mapping of physical memory.
pub const DUMMY_PAGE_OFFSET: u64 = 0xffff_8880_0000_0000;
/// Base of the kernel data region holding `mem_map` and the zone.
pub const DUMMY_KMEM: u64 = 0xffff_ea00_0000_0000;
/// Start of the kernel text mapping.
pub const DUMMY_KERNEL_MAP: u64 = 0xffff_ffff_8000_0000;
/// Address of the hugetlbfs compound destructor.
pub const DUMMY_FREE_HUGE_PAGE: u64 = 0xffff_ffff_8123_4560;

pub const DUMMY_PAGE_SIZE: u64 = 0x1000;
/// Size of one page descriptor.
pub const SIZE_PAGE: u64 = 64;
const OFF_FLAGS: u64 = 0;
const OFF_MAPPING: u64 = 8;
const OFF_PRIVATE: u64 = 16;
const OFF_MAPCOUNT: u64 = 24;
const OFF_COUNT: u64 = 28;
const OFF_LRU: u64 = 32;

const SIZE_LIST_HEAD: u64 = 16;
const MIGRATE_TYPES: u64 = 2;
const MAX_ORDER: u64 = 11;
const SIZE_FREE_AREA: u64 = MIGRATE_TYPES * SIZE_LIST_HEAD + 8;
const ZONE_OFF_SPANNED: u64 = 0x8;
const ZONE_OFF_FREE_AREA: u64 = 0x40;
const ZONE_OFF_VM_STAT: u64 = ZONE_OFF_FREE_AREA + MAX_ORDER * SIZE_FREE_AREA;
const SIZE_ZONE: u64 = 0x200;

pub const PG_LRU: u64 = 1 << 5;
pub const PG_SLAB: u64 = 1 << 7;
pub const PG_PRIVATE: u64 = 1 << 11;
pub const PG_HEAD: u64 = 1 << 14;
pub const PG_SWAPCACHE: u64 = 1 << 15;
pub const PG_HWPOISON: u64 = 1 << 20;
const PAGE_BUDDY_MAPCOUNT_VALUE: i32 = -128;

pub struct DummyKernelBuilder {
    nr_pages: u64,
    page_size: u64,
    seed: u64,
    kmem: Vec<u8>,
    holes: Vec<Range<Pfn>>,
    unmapped: Vec<Range<Pfn>>,
    zero: Vec<Range<Pfn>>,
    compressible: Vec<Range<Pfn>>,
    free_blocks: Vec<(Pfn, u64)>,
    buddy_detection: bool,
    broken_free_list: bool,
}

impl DummyKernelBuilder {
    fn new(nr_pages: u64) -> Self {
        let kmem_len = roundup(nr_pages * SIZE_PAGE, DUMMY_PAGE_SIZE) + SIZE_ZONE;
        Self {
            nr_pages,
            page_size: DUMMY_PAGE_SIZE,
            seed: 0x5eed,
            kmem: vec![0u8; kmem_len as usize],
            holes: Vec::new(),
            unmapped: Vec::new(),
            zero: Vec::new(),
            compressible: Vec::new(),
            free_blocks: Vec::new(),
            buddy_detection: true,
            broken_free_list: false,
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Leaves `pfns` out of the load segments.
    pub fn hole(mut self, pfns: Range<Pfn>) -> Self {
        self.holes.push(pfns);
        self
    }

    /// Gives `pfns` no page descriptors.
    pub fn unmapped(mut self, pfns: Range<Pfn>) -> Self {
        self.unmapped.push(pfns);
        self
    }

    pub fn zero_pages(mut self, pfns: Range<Pfn>) -> Self {
        self.zero.push(pfns);
        self
    }

    /// Fills `pfns` with repetitive text instead of random bytes.
    pub fn compressible(mut self, pfns: Range<Pfn>) -> Self {
        self.compressible.push(pfns);
        self
    }

    pub fn cache_pages(mut self, pfns: Range<Pfn>) -> Self {
        pfns.for_each(|pfn| self.set_page(pfn, PG_LRU, 0xffff_8881_0000_1000, 0));
        self
    }

    pub fn private_cache_pages(mut self, pfns: Range<Pfn>) -> Self {
        pfns.for_each(|pfn| self.set_page(pfn, PG_LRU | PG_PRIVATE, 0xffff_8881_0000_1000, 0));
        self
    }

    pub fn anon_pages(mut self, pfns: Range<Pfn>) -> Self {
        pfns.for_each(|pfn| self.set_page(pfn, PG_LRU | PG_SWAPCACHE, 0xffff_8881_0000_2001, 0));
        self
    }

    pub fn slab_pages(mut self, pfns: Range<Pfn>) -> Self {
        pfns.for_each(|pfn| self.set_page(pfn, PG_SLAB, 0, 0));
        self
    }

    pub fn hwpoison(mut self, pfn: Pfn) -> Self {
        self.set_page(pfn, PG_HWPOISON, 0, 0);
        self
    }

    /// A hugetlbfs page of `1 << order` frames starting at `pfn`.
    pub fn huge_page(mut self, pfn: Pfn, order: u64) -> Self {
        self.set_page(pfn, PG_HEAD, 0, 0);
        self.set_compound_tail(pfn + 1, order, DUMMY_FREE_HUGE_PAGE);
        self
    }

    /// A compound page cache page of `1 << order` frames starting at `pfn`.
    pub fn compound_cache(mut self, pfn: Pfn, order: u64) -> Self {
        self.set_page(pfn, PG_HEAD | PG_LRU, 0xffff_8881_0000_1000, 0);
        self.set_compound_tail(pfn + 1, order, 0);
        self
    }

    /// A free buddy block; it is marked on its head descriptor and linked into
    /// the zone's free lists.
    pub fn buddy_block(mut self, pfn: Pfn, order: u64) -> Self {
        self.set_page(pfn, 0, 0, order);
        self.put_u32(pfn * SIZE_PAGE + OFF_MAPCOUNT, PAGE_BUDDY_MAPCOUNT_VALUE as u32);
        self.free_blocks.push((pfn, order));
        self
    }

    /// Omits the buddy marker from the layout table, so free pages can only
    /// be found through the free lists.
    pub fn without_buddy_detection(mut self) -> Self {
        self.buddy_detection = false;
        self
    }

    /// Corrupts the back link of the first free list entry.
    pub fn broken_free_list(mut self) -> Self {
        self.broken_free_list = true;
        self
    }

    fn set_page(&mut self, pfn: Pfn, flags: u64, mapping: u64, private: u64) {
        let base = pfn * SIZE_PAGE;
        self.put_u64(base + OFF_FLAGS, flags);
        self.put_u64(base + OFF_MAPPING, mapping);
        self.put_u64(base + OFF_PRIVATE, private);
        self.put_u32(base + OFF_COUNT, 1);
        self.put_u32(base + OFF_MAPCOUNT, u32::MAX);
    }

    fn set_compound_tail(&mut self, tail: Pfn, order: u64, dtor: u64) {
        let base = tail * SIZE_PAGE + OFF_LRU;
        self.put_u64(base, dtor);
        self.put_u64(base + 8, order);
    }

    fn put_u64(&mut self, off: u64, value: u64) {
        let off = off as usize;
        self.kmem[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(&mut self, off: u64, value: u32) {
        let off = off as usize;
        self.kmem[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn zone_offset(&self) -> u64 {
        roundup(self.nr_pages * SIZE_PAGE, DUMMY_PAGE_SIZE)
    }

    fn link_free_lists(&mut self) {
        let zone = self.zone_offset();
        let kmem_addr = |off: u64| DUMMY_KMEM + off;
        let mut total = 0;

        for order in 0..MAX_ORDER {
            for mt in 0..MIGRATE_TYPES {
                let head = zone + ZONE_OFF_FREE_AREA + order * SIZE_FREE_AREA + mt * SIZE_LIST_HEAD;
                let entries = self
                    .free_blocks
                    .iter()
                    .enumerate()
                    .filter(|(i, (_, o))| *o == order && *i as u64 % MIGRATE_TYPES == mt)
                    .map(|(_, (pfn, _))| pfn * SIZE_PAGE + OFF_LRU)
                    .collect::<Vec<_>>();

                let mut prev = head;
                for &entry in entries.iter() {
                    self.put_u64(prev, kmem_addr(entry));
                    self.put_u64(entry + 8, kmem_addr(prev));
                    prev = entry;
                }
                self.put_u64(prev, kmem_addr(head));
                self.put_u64(head + 8, kmem_addr(prev));
                total += entries.len() as u64 * (1 << order);
            }
        }

        if self.broken_free_list {
            if let Some(&(pfn, _)) = self.free_blocks.first() {
                self.put_u64(pfn * SIZE_PAGE + OFF_LRU + 8, 0xdead_0000);
            }
        }

        self.put_u64(zone + ZONE_OFF_SPANNED, self.nr_pages);
        self.put_u64(zone + ZONE_OFF_VM_STAT, total);
    }

    fn layout_table(&self) -> LayoutTable {
        let table = LayoutTable::new()
            .with_word_size(8)
            .with_value("OSRELEASE", "6.1.0-dummy")
            .with_value("PAGESIZE", &self.page_size.to_string())
            .with_size("page", SIZE_PAGE)
            .with_offset("page.flags", OFF_FLAGS)
            .with_offset("page._refcount", OFF_COUNT)
            .with_offset("page.mapping", OFF_MAPPING)
            .with_offset("page.private", OFF_PRIVATE)
            .with_offset("page._mapcount", OFF_MAPCOUNT)
            .with_offset("page.lru", OFF_LRU)
            .with_size("list_head", SIZE_LIST_HEAD)
            .with_offset("list_head.next", 0)
            .with_offset("list_head.prev", 8)
            .with_size("zone", SIZE_ZONE)
            .with_offset("zone.spanned_pages", ZONE_OFF_SPANNED)
            .with_offset("zone.free_area", ZONE_OFF_FREE_AREA)
            .with_offset("zone.vm_stat", ZONE_OFF_VM_STAT)
            .with_length("zone.free_area", MAX_ORDER)
            .with_size("free_area", SIZE_FREE_AREA)
            .with_offset("free_area.free_list", 0)
            .with_length("free_area.free_list", MIGRATE_TYPES)
            .with_number("NR_FREE_PAGES", 0)
            .with_number("PG_lru", 5)
            .with_number("PG_slab", 7)
            .with_number("PG_private", 11)
            .with_number("PG_swapcache", 15)
            .with_number("PG_hwpoison", 20)
            .with_symbol("free_huge_page", DUMMY_FREE_HUGE_PAGE);
        if self.buddy_detection {
            table.with_number("PAGE_BUDDY_MAPCOUNT_VALUE", PAGE_BUDDY_MAPCOUNT_VALUE as i64)
        } else {
            table
        }
    }

    fn loads(&self) -> Vec<LoadSegment> {
        let mut holes = self.holes.clone();
        holes.sort_by_key(|h| h.start);
        let mut loads = Vec::new();
        let mut next = 0;
        for hole in holes.iter().chain(std::iter::once(&(self.nr_pages..self.nr_pages))) {
            if hole.start > next {
                let paddr = next * self.page_size;
                loads.push(
                    LoadSegment::new(paddr, (hole.start - next) * self.page_size)
                        .with_virt_start(DUMMY_PAGE_OFFSET + paddr),
                );
            }
            next = next.max(hole.end);
        }
        loads
    }

    fn mem_map(&self) -> Result<MemMapTable> {
        let mut cuts = self.unmapped.clone();
        cuts.sort_by_key(|c| c.start);
        let mut segments = Vec::new();
        let mut next = 0;
        for cut in cuts.iter() {
            if cut.start > next {
                segments.push(MemMapSegment {
                    pfn_start: next,
                    pfn_end: cut.start,
                    mem_map: Some(DUMMY_KMEM + next * SIZE_PAGE),
                });
            }
            segments.push(MemMapSegment {
                pfn_start: cut.start,
                pfn_end: cut.end,
                mem_map: None,
            });
            next = cut.end;
        }
        if next < self.nr_pages {
            segments.push(MemMapSegment {
                pfn_start: next,
                pfn_end: self.nr_pages,
                mem_map: Some(DUMMY_KMEM + next * SIZE_PAGE),
            });
        }
        MemMapTable::from_unordered(segments, self.nr_pages)
    }

    fn notes(vmcoreinfo: &str) -> (Vec<u8>, Range<usize>) {
        let name = b"VMCOREINFO\0";
        let mut notes = Vec::new();
        notes.extend_from_slice(&(name.len() as u32).to_le_bytes());
        notes.extend_from_slice(&(vmcoreinfo.len() as u32).to_le_bytes());
        notes.extend_from_slice(&0u32.to_le_bytes());
        notes.extend_from_slice(name);
        notes.resize(roundup(notes.len() as u64, 4) as usize, 0);
        let start = notes.len();
        notes.extend_from_slice(vmcoreinfo.as_bytes());
        let end = notes.len();
        notes.resize(roundup(notes.len() as u64, 4) as usize, 0);
        (notes, start..end)
    }

    pub fn build(mut self) -> DummyKernel {
        self.link_free_lists();

        let mut phys = vec![0u8; (self.nr_pages * self.page_size) as usize];
        let mut rng = XorShiftRng::seed_from_u64(self.seed);
        rng.fill_bytes(&mut phys);

        let page_len = self.page_size as usize;
        for pfn in self.compressible.iter().cloned().flatten() {
            let page = &mut phys[pfn as usize * page_len..(pfn as usize + 1) * page_len];
            let text = format!("page {:08x} of the dummy kernel. ", pfn);
            for (dst, src) in page.iter_mut().zip(text.bytes().cycle()) {
                *dst = src;
            }
        }
        for pfn in self.zero.iter().cloned().flatten() {
            phys[pfn as usize * page_len..(pfn as usize + 1) * page_len].fill(0);
        }

        let vmcoreinfo = format!(
            "OSRELEASE=6.1.0-dummy\nPAGESIZE={}\nSIZE(page)={}\n",
            self.page_size, SIZE_PAGE
        );
        let (notes, vmcoreinfo_range) = Self::notes(&vmcoreinfo);

        let info = ImageInfo {
            page_size: self.page_size,
            max_mapnr: self.nr_pages,
            loads: self.loads(),
            notes,
            vmcoreinfo: Some(vmcoreinfo_range),
            ident: ElfIdent::default(),
            phys_base: 0,
            nr_cpus: 1,
        };

        let zones = vec![ZoneInfo {
            node: 0,
            index: 0,
            address: DUMMY_KMEM + self.zone_offset(),
            spanned_pages: self.nr_pages,
        }];
        let mem_map = self.mem_map().unwrap_or_else(|_| MemMapTable::flat(self.nr_pages, DUMMY_KMEM));
        let kernel = KernelContext::new(self.layout_table(), mem_map, zones);

        DummyKernel {
            info,
            kernel,
            phys,
            kmem: self.kmem,
        }
    }
}

/// An in-memory crashed system, see [`DummyKernel::builder`].
#[derive(Clone)]
pub struct DummyKernel {
    info: ImageInfo,
    kernel: KernelContext,
    phys: Vec<u8>,
    kmem: Vec<u8>,
}

impl DummyKernel {
    /// Starts a kernel with `nr_pages` 4 KiB page frames.
    pub fn builder(nr_pages: u64) -> DummyKernelBuilder {
        DummyKernelBuilder::new(nr_pages)
    }

    pub fn kernel(&self) -> &KernelContext {
        &self.kernel
    }

    /// Contents of a page frame as they appear in the image.
    pub fn page(&self, pfn: Pfn) -> &[u8] {
        let len = self.info.page_size as usize;
        &self.phys[pfn as usize * len..(pfn as usize + 1) * len]
    }

    pub fn page_descriptor_address(pfn: Pfn) -> u64 {
        DUMMY_KMEM + pfn * SIZE_PAGE
    }
}

impl SourceMemory for DummyKernel {
    fn info(&self) -> &ImageInfo {
        &self.info
    }

    fn phys_read_raw_into(&mut self, paddr: u64, out: &mut [u8]) -> Result<()> {
        let end = paddr + out.len() as u64;
        let backed = self
            .info
            .loads
            .iter()
            .any(|l| l.phys_start <= paddr && end <= l.phys_end);
        if !backed {
            return Err(Error(ErrorOrigin::Source, ErrorKind::UnableToReadMemory)
                .log_trace(format!("physical read {:x}-{:x} outside of loads", paddr, end)));
        }
        out.copy_from_slice(&self.phys[paddr as usize..end as usize]);
        Ok(())
    }

    fn virt_read_raw_into(&mut self, vaddr: u64, out: &mut [u8]) -> Result<()> {
        let len = out.len() as u64;
        if vaddr >= DUMMY_KMEM && vaddr - DUMMY_KMEM + len <= self.kmem.len() as u64 {
            let off = (vaddr - DUMMY_KMEM) as usize;
            out.copy_from_slice(&self.kmem[off..off + out.len()]);
            Ok(())
        } else if vaddr >= DUMMY_PAGE_OFFSET && vaddr < DUMMY_KMEM {
            self.phys_read_raw_into(vaddr - DUMMY_PAGE_OFFSET, out)
        } else {
            Err(Error(ErrorOrigin::Source, ErrorKind::UnableToReadMemory)
                .log_trace(format!("virtual address {:x} not mapped", vaddr)))
        }
    }

    fn virt_to_phys(&mut self, vaddr: u64) -> Result<u64> {
        if vaddr >= DUMMY_KERNEL_MAP {
            Ok(vaddr - DUMMY_KERNEL_MAP + self.info.phys_base)
        } else if vaddr >= DUMMY_PAGE_OFFSET && vaddr < DUMMY_KMEM {
            Ok(vaddr - DUMMY_PAGE_OFFSET)
        } else {
            Err(Error(ErrorOrigin::Source, ErrorKind::UnableToReadMemory)
                .log_error(format!("virtual address {:x} has no physical backing", vaddr)))
        }
    }
}

impl ReopenSource for DummyKernel {
    fn reopen(&self) -> Result<Self> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{BuddyDetect, FreeListScanner};

    #[test]
    fn layout_resolves() {
        let dummy = DummyKernel::builder(0x100).build();
        let kernel = dummy.kernel();
        assert!(kernel.page_layout().is_ok());
        assert!(kernel.free_area_layout().is_ok());
        assert!(matches!(kernel.buddy(), BuddyDetect::MapcountValue { .. }));

        let dummy = DummyKernel::builder(0x100).without_buddy_detection().build();
        assert_eq!(dummy.kernel().buddy(), BuddyDetect::None);
    }

    #[test]
    fn loads_skip_holes() {
        let dummy = DummyKernel::builder(0x100).hole(0x10..0x20).hole(0x80..0x90).build();
        let info = dummy.info();
        assert_eq!(info.loads.len(), 3);
        assert_eq!(info.max_mapnr, 0x100);
        assert!(!info.is_present(0x10));
        assert!(info.is_present(0x20));
    }

    #[test]
    fn free_lists_are_walkable() {
        let mut dummy = DummyKernel::builder(0x200)
            .buddy_block(0x40, 4)
            .buddy_block(0x80, 4)
            .buddy_block(0x101, 0)
            .build();
        let kernel = dummy.kernel().clone();
        let layout = kernel.free_area_layout().unwrap();
        let scanner = FreeListScanner::new(layout, &kernel.mem_map);

        let mut blocks = Vec::new();
        let stats = scanner
            .scan_zone(&mut dummy, &kernel.zones[0], |pfn, nr| {
                blocks.push((pfn, nr));
                Ok(nr)
            })
            .unwrap();
        blocks.sort_unstable();
        assert_eq!(blocks, vec![(0x40, 16), (0x80, 16), (0x101, 1)]);
        assert_eq!(stats.listed, 33);
        assert_eq!(stats.expected, Some(33));
    }

    #[test]
    fn broken_link_is_detected() {
        let mut dummy = DummyKernel::builder(0x100)
            .buddy_block(0x10, 1)
            .broken_free_list()
            .build();
        let kernel = dummy.kernel().clone();
        let layout = kernel.free_area_layout().unwrap();
        let scanner = FreeListScanner::new(layout, &kernel.mem_map);
        let err = scanner
            .scan_zone(&mut dummy, &kernel.zones[0], |_, nr| Ok(nr))
            .unwrap_err();
        assert_eq!(err.1, ErrorKind::BrokenFreeList);
    }

    #[test]
    fn direct_map_reads_physical_memory() {
        let mut dummy = DummyKernel::builder(0x10).zero_pages(2..3).build();
        let mut buf = [0xffu8; 16];
        dummy.virt_read_raw_into(DUMMY_PAGE_OFFSET + 0x2000, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
        assert!(dummy.virt_read_raw_into(0x1000, &mut buf).is_err());
    }
}
