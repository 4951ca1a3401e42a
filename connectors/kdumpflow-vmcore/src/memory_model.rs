/*!
Locating the page descriptor arrays of the crashed kernel.

The kernel keeps `struct page` either in one flat array (FLATMEM), in per
section arrays found through `mem_section` (SPARSEMEM, with a second level
of indirection for SPARSEMEM_EXTREME), or in the virtually contiguous
`vmemmap` (SPARSEMEM_VMEMMAP).
*/

use log::{debug, info};

use kdumpflow_core::error::{Error, ErrorKind, ErrorOrigin, Result};
use kdumpflow_core::kernel::LayoutTable;
use kdumpflow_core::mem::{MemMapSegment, MemMapTable, SourceMemory};
use kdumpflow_core::types::{divideup, Pfn};

pub const DEFAULT_SECTION_SIZE_BITS: u64 = 27;
pub const DEFAULT_MAX_PHYSMEM_BITS: u64 = 46;
/// `VMEMMAP_START` of 4-level paging kernels without randomization.
pub const DEFAULT_VMEMMAP_START: u64 = 0xffff_ea00_0000_0000;

pub const SECTION_HAS_MEM_MAP: u64 = 1 << 1;
/// Low bits of `section_mem_map` that carry flags.
pub const SECTION_MAP_FLAGS: u64 = 0x1f;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryModel {
    Flatmem,
    Sparsemem,
    SparsememExtreme,
    SparsememVmemmap,
}

/// Section geometry of a SPARSEMEM kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SectionLayout {
    pub mem_section: u64,
    pub size_mem_section: u64,
    pub off_section_mem_map: u64,
    pub pages_per_section: u64,
    pub nr_mem_sections: u64,
    pub sections_per_root: u64,
    pub word_size: u64,
}

impl SectionLayout {
    pub fn from_table(table: &LayoutTable, page_size: u64) -> Result<Self> {
        let (section_bits, physmem_bits) = section_bits(table);
        let page_shift = page_size.trailing_zeros() as u64;
        if section_bits < page_shift || physmem_bits < section_bits {
            return Err(Error(ErrorOrigin::MemoryMap, ErrorKind::InvalidHeader).log_error(format!(
                "section size bits {} with physmem bits {}",
                section_bits, physmem_bits
            )));
        }

        let size_mem_section = table.require_size("mem_section")?;
        let nr_mem_sections = 1 << (physmem_bits - section_bits);
        let sections_per_root = match table.length("mem_section") {
            Some(roots) if roots < nr_mem_sections => page_size / size_mem_section,
            _ => 1,
        };

        Ok(Self {
            mem_section: table.require_symbol("mem_section")?,
            size_mem_section,
            off_section_mem_map: table.require_offset("mem_section.section_mem_map")?,
            pages_per_section: 1 << (section_bits - page_shift),
            nr_mem_sections,
            sections_per_root,
            word_size: table.word_size(),
        })
    }

    pub fn is_extreme(&self) -> bool {
        self.sections_per_root > 1
    }

    /// Address of the `struct mem_section` of `nr`, if its root is allocated.
    fn section_address<S: SourceMemory>(&self, source: &mut S, nr: u64) -> Result<Option<u64>> {
        if !self.is_extreme() {
            return Ok(Some(self.mem_section + nr * self.size_mem_section));
        }
        let root = nr / self.sections_per_root;
        let root_addr = source.virt_read_ulong(self.mem_section + root * self.word_size, self.word_size)?;
        if root_addr == 0 {
            return Ok(None);
        }
        Ok(Some(root_addr + (nr % self.sections_per_root) * self.size_mem_section))
    }
}

fn section_bits(table: &LayoutTable) -> (u64, u64) {
    let section_bits = table
        .number("SECTION_SIZE_BITS")
        .map(|n| n as u64)
        .unwrap_or(DEFAULT_SECTION_SIZE_BITS);
    let physmem_bits = table
        .number("MAX_PHYSMEM_BITS")
        .map(|n| n as u64)
        .unwrap_or(DEFAULT_MAX_PHYSMEM_BITS);
    (section_bits, physmem_bits)
}

/// Picks the memory model the VMCOREINFO table describes.
///
/// With SPARSEMEM_EXTREME `mem_section` has fewer roots than sections.
pub fn detect(table: &LayoutTable) -> Result<MemoryModel> {
    let model = if table.symbol("mem_section").is_some() {
        let (section_bits, physmem_bits) = section_bits(table);
        match table.length("mem_section") {
            Some(roots) if physmem_bits >= section_bits && roots < 1 << (physmem_bits - section_bits) => {
                MemoryModel::SparsememExtreme
            }
            _ => MemoryModel::Sparsemem,
        }
    } else if table.symbol("mem_map").is_some() {
        MemoryModel::Flatmem
    } else if table.symbol("vmemmap_base").is_some() || table.number("VMEMMAP_START").is_some() {
        MemoryModel::SparsememVmemmap
    } else {
        return Err(Error(ErrorOrigin::MemoryMap, ErrorKind::MissingSymbol)
            .log_error("the kernel exports neither mem_section, mem_map nor vmemmap"));
    };
    info!("memory model: {:?}", model);
    Ok(model)
}

/// Reads the descriptor array locations for every page frame below
/// `max_mapnr`.
pub fn build_mem_map<S: SourceMemory>(
    source: &mut S,
    table: &LayoutTable,
    model: MemoryModel,
) -> Result<MemMapTable> {
    let info = source.info().clone();
    let max_mapnr = info.max_mapnr;
    let word_size = table.word_size();

    let mem_map = match model {
        MemoryModel::Flatmem => {
            let mem_map = source.virt_read_ulong(table.require_symbol("mem_map")?, word_size)?;
            MemMapTable::flat(max_mapnr, mem_map)
        }
        MemoryModel::SparsememVmemmap => {
            let vmemmap = match table.symbol("vmemmap_base") {
                Some(sym) => source.virt_read_ulong(sym, word_size)?,
                None => table
                    .number("VMEMMAP_START")
                    .map(|n| n as u64)
                    .unwrap_or(DEFAULT_VMEMMAP_START),
            };
            let size_page = table.require_size("page")?;
            let shift = info.page_shift();
            let segments = info
                .loads
                .iter()
                .map(|l| {
                    let pfns = l.pfn_range(shift);
                    MemMapSegment {
                        pfn_start: pfns.start,
                        pfn_end: pfns.end,
                        mem_map: Some(vmemmap + pfns.start * size_page),
                    }
                })
                .collect();
            MemMapTable::from_unordered(segments, max_mapnr)?
        }
        MemoryModel::Sparsemem | MemoryModel::SparsememExtreme => {
            let layout = SectionLayout::from_table(table, info.page_size)?;
            let size_page = table.require_size("page")?;
            MemMapTable::from_unordered(read_sections(source, &layout, size_page, max_mapnr)?, max_mapnr)?
        }
    };
    debug!("mem_map:\n{:?}", mem_map);
    Ok(mem_map)
}

/// Decodes every section up to `max_mapnr`, merging neighbours with
/// contiguous descriptor arrays.
fn read_sections<S: SourceMemory>(
    source: &mut S,
    layout: &SectionLayout,
    size_page: u64,
    max_mapnr: Pfn,
) -> Result<Vec<MemMapSegment>> {
    let nr_sections = divideup(max_mapnr, layout.pages_per_section).min(layout.nr_mem_sections);
    let mut segments: Vec<MemMapSegment> = Vec::new();

    for nr in 0..nr_sections {
        let addr = match layout.section_address(source, nr)? {
            Some(addr) => addr,
            None => continue,
        };
        let coded = source.virt_read_ulong(addr + layout.off_section_mem_map, layout.word_size)?;
        if coded & SECTION_HAS_MEM_MAP == 0 {
            continue;
        }
        let pfn_start = nr * layout.pages_per_section;
        let pfn_end = (pfn_start + layout.pages_per_section).min(max_mapnr);
        // the kernel stores mem_map minus the section's first pfn
        let mem_map = (coded & !SECTION_MAP_FLAGS).wrapping_add(pfn_start.wrapping_mul(size_page));

        match segments.last_mut() {
            Some(last)
                if last.pfn_end == pfn_start
                    && last.mem_map.map(|m| m + (pfn_start - last.pfn_start) * size_page) == Some(mem_map) =>
            {
                last.pfn_end = pfn_end;
            }
            _ => segments.push(MemMapSegment {
                pfn_start,
                pfn_end,
                mem_map: Some(mem_map),
            }),
        }
    }
    info!("{} sections decoded into {} mem_map segments", nr_sections, segments.len());
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sparse_table(roots: u64) -> LayoutTable {
        LayoutTable::new()
            .with_symbol("mem_section", 0xffff_8880_0200_0000)
            .with_size("mem_section", 16)
            .with_offset("mem_section.section_mem_map", 0)
            .with_length("mem_section", roots)
            .with_number("SECTION_SIZE_BITS", 27)
            .with_number("MAX_PHYSMEM_BITS", 46)
    }

    #[test]
    fn detect_models() {
        assert_eq!(detect(&sparse_table(2048)).unwrap(), MemoryModel::SparsememExtreme);
        assert_eq!(detect(&sparse_table(1 << 19)).unwrap(), MemoryModel::Sparsemem);
        let flat = LayoutTable::new().with_symbol("mem_map", 0xffff_ffff_8200_0000);
        assert_eq!(detect(&flat).unwrap(), MemoryModel::Flatmem);
        let vmemmap = LayoutTable::new().with_symbol("vmemmap_base", 0xffff_ffff_8200_0000);
        assert_eq!(detect(&vmemmap).unwrap(), MemoryModel::SparsememVmemmap);
        assert!(detect(&LayoutTable::new()).is_err());
    }

    #[test]
    fn section_geometry() {
        let layout = SectionLayout::from_table(&sparse_table(2048), 0x1000).unwrap();
        assert_eq!(layout.pages_per_section, 0x8000);
        assert_eq!(layout.nr_mem_sections, 1 << 19);
        assert_eq!(layout.sections_per_root, 256);
        assert!(layout.is_extreme());

        let layout = SectionLayout::from_table(&sparse_table(1 << 19), 0x1000).unwrap();
        assert_eq!(layout.sections_per_root, 1);
    }
}
