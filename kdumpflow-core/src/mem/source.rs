/*!
Raw read access to a captured memory image.
*/

use std::ops::Range;

use dataview::{Pod, PodMethods};

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::types::Pfn;

/// A loadable region of the source image, in page-granular physical address space.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LoadSegment {
    pub phys_start: u64,
    pub phys_end: u64,
    pub virt_start: u64,
    pub file_offset: u64,
}

impl LoadSegment {
    pub fn new(phys_start: u64, size: u64) -> Self {
        Self {
            phys_start,
            phys_end: phys_start + size,
            virt_start: 0,
            file_offset: 0,
        }
    }

    pub fn with_virt_start(mut self, virt_start: u64) -> Self {
        self.virt_start = virt_start;
        self
    }

    pub fn with_file_offset(mut self, file_offset: u64) -> Self {
        self.file_offset = file_offset;
        self
    }

    pub fn size(&self) -> u64 {
        self.phys_end - self.phys_start
    }

    pub fn contains(&self, paddr: u64) -> bool {
        paddr >= self.phys_start && paddr < self.phys_end
    }

    /// Page frames fully or partially starting inside this segment.
    ///
    /// Both ends are rounded down to whole pages.
    pub fn pfn_range(&self, page_shift: u32) -> Range<Pfn> {
        (self.phys_start >> page_shift)..(self.phys_end >> page_shift)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

/// Identification fields copied from the source image into an ELF output.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ElfIdent {
    pub class: ElfClass,
    pub data: u8,
    pub osabi: u8,
    pub machine: u16,
    pub flags: u32,
}

pub const ELFDATA2LSB: u8 = 1;
pub const EM_X86_64: u16 = 62;

impl Default for ElfIdent {
    fn default() -> Self {
        Self {
            class: ElfClass::Elf64,
            data: ELFDATA2LSB,
            osabi: 0,
            machine: EM_X86_64,
            flags: 0,
        }
    }
}

/// Static description of a source image.
#[derive(Clone, Debug)]
pub struct ImageInfo {
    pub page_size: u64,
    pub max_mapnr: Pfn,
    pub loads: Vec<LoadSegment>,
    /// Raw contents of the PT_NOTE segment.
    pub notes: Vec<u8>,
    /// Location of the VMCOREINFO descriptor inside `notes`.
    pub vmcoreinfo: Option<Range<usize>>,
    pub ident: ElfIdent,
    pub phys_base: u64,
    pub nr_cpus: u32,
}

impl ImageInfo {
    /// Builds the description from a set of load segments.
    ///
    /// `max_mapnr` is derived from the highest segment end.
    pub fn new(page_size: u64, mut loads: Vec<LoadSegment>) -> Result<Self> {
        if !page_size.is_power_of_two() {
            return Err(Error(ErrorOrigin::Source, ErrorKind::InvalidHeader)
                .log_error(format!("invalid page size {}", page_size)));
        }
        loads.sort_by_key(|l| l.phys_start);
        let max_paddr = loads.iter().map(|l| l.phys_end).max().unwrap_or_default();
        Ok(Self {
            page_size,
            max_mapnr: max_paddr >> page_size.trailing_zeros(),
            loads,
            notes: Vec::new(),
            vmcoreinfo: None,
            ident: ElfIdent::default(),
            phys_base: 0,
            nr_cpus: 1,
        })
    }

    pub fn page_shift(&self) -> u32 {
        self.page_size.trailing_zeros()
    }

    pub fn pfn_to_paddr(&self, pfn: Pfn) -> u64 {
        pfn << self.page_shift()
    }

    pub fn paddr_to_pfn(&self, paddr: u64) -> Pfn {
        paddr >> self.page_shift()
    }

    /// Returns true if the page frame is backed by a load segment.
    pub fn is_present(&self, pfn: Pfn) -> bool {
        let shift = self.page_shift();
        self.loads.iter().any(|l| l.pfn_range(shift).contains(&pfn))
    }

    pub fn vmcoreinfo_bytes(&self) -> Option<&[u8]> {
        self.vmcoreinfo.clone().and_then(|r| self.notes.get(r))
    }
}

/// Read access to the memory of the crashed system.
pub trait SourceMemory {
    fn info(&self) -> &ImageInfo;

    fn phys_read_raw_into(&mut self, paddr: u64, out: &mut [u8]) -> Result<()>;

    fn virt_read_raw_into(&mut self, vaddr: u64, out: &mut [u8]) -> Result<()>;

    /// Translates a kernel virtual address, e.g. of a symbol named in an
    /// erase entry.
    fn virt_to_phys(&mut self, vaddr: u64) -> Result<u64> {
        Err(Error(ErrorOrigin::Source, ErrorKind::NotSupported)
            .log_error(format!("unable to translate virtual address {:x}", vaddr)))
    }

    /// Reads a whole page frame.
    fn read_page(&mut self, pfn: Pfn, out: &mut [u8]) -> Result<()> {
        let paddr = self.info().pfn_to_paddr(pfn);
        self.phys_read_raw_into(paddr, out)
    }

    fn virt_read_into<T: Pod + ?Sized>(&mut self, vaddr: u64, out: &mut T) -> Result<()>
    where
        Self: Sized,
    {
        self.virt_read_raw_into(vaddr, out.as_bytes_mut())
    }

    fn virt_read_u64(&mut self, vaddr: u64) -> Result<u64>
    where
        Self: Sized,
    {
        let mut v = 0u64;
        self.virt_read_into(vaddr, &mut v)?;
        Ok(u64::from_le(v))
    }

    fn virt_read_u32(&mut self, vaddr: u64) -> Result<u32>
    where
        Self: Sized,
    {
        let mut v = 0u32;
        self.virt_read_into(vaddr, &mut v)?;
        Ok(u32::from_le(v))
    }

    /// Reads a kernel `unsigned long` of the given width.
    fn virt_read_ulong(&mut self, vaddr: u64, word_size: u64) -> Result<u64>
    where
        Self: Sized,
    {
        if word_size == 4 {
            self.virt_read_u32(vaddr).map(u64::from)
        } else {
            self.virt_read_u64(vaddr)
        }
    }
}

/// A source that can hand out an independent handle to the same image.
///
/// Split workers each read through their own handle.
pub trait ReopenSource: SourceMemory + Sized {
    fn reopen(&self) -> Result<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_mapnr_from_loads() {
        let info = ImageInfo::new(
            0x1000,
            vec![
                LoadSegment::new(0x10_0000, 0x10_0000),
                LoadSegment::new(0, 0x9_f000),
            ],
        )
        .unwrap();
        assert_eq!(info.max_mapnr, 0x200);
        assert_eq!(info.loads[0].phys_start, 0);
        assert!(info.is_present(0x9e));
        assert!(!info.is_present(0x9f));
        assert!(info.is_present(0x100));
        assert!(!info.is_present(0x200));
    }

    #[test]
    fn reject_bad_page_size() {
        assert!(ImageInfo::new(3000, vec![]).is_err());
    }
}
