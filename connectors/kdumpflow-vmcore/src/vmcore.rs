use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use log::{debug, info};

use kdumpflow_core::error::{Error, ErrorKind, ErrorOrigin, Result};
use kdumpflow_core::kernel::LayoutTable;
use kdumpflow_core::mem::{ImageInfo, ReopenSource, SourceMemory};

use crate::elf::{parse_header, FileLoad, VmcoreHeader};
use crate::file::Backing;
use crate::vtop::vtop;

/// `__START_KERNEL_map`
pub const START_KERNEL_MAP: u64 = 0xffff_ffff_8000_0000;
/// Default `PAGE_OFFSET` of 4-level paging kernels.
pub const DEFAULT_PAGE_OFFSET: u64 = 0xffff_8880_0000_0000;
/// Size of the direct mapping of 4-level paging kernels.
pub const DIRECT_MAP_SIZE: u64 = 1 << 46;
pub const DEFAULT_KERNEL_IMAGE_SIZE: u64 = 0x4000_0000;
pub const DEFAULT_PAGE_SIZE: u64 = 0x1000;

/// How kernel virtual addresses map to physical ones.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Translation {
    pub page_offset: u64,
    pub phys_base: u64,
    pub kernel_image_size: u64,
    /// Physical address of `init_top_pgt`, for addresses outside the linear maps.
    pub pgd: Option<u64>,
}

impl Translation {
    /// Derives the translation from the VMCOREINFO table and the load segments.
    ///
    /// `phys_base` and `PAGE_OFFSET` fall back to what the virtual addresses
    /// of the loads imply.
    pub fn from_table(table: &LayoutTable, loads: &[FileLoad]) -> Result<Self> {
        if table.number("pgtable_l5_enabled").unwrap_or(0) != 0 {
            return Err(Error(ErrorOrigin::Source, ErrorKind::NotSupported).log_error("5-level page tables"));
        }

        let text = loads.iter().find(|l| l.segment.virt_start >= START_KERNEL_MAP);
        let phys_base = match table.number("phys_base") {
            Some(base) => base as u64,
            None => text
                .map(|l| l.segment.phys_start.wrapping_sub(l.segment.virt_start - START_KERNEL_MAP))
                .unwrap_or(0),
        };

        let page_offset = loads
            .iter()
            .map(|l| l.segment)
            .find(|s| s.virt_start != 0 && s.virt_start < START_KERNEL_MAP && s.virt_start >= s.phys_start)
            .map(|s| s.virt_start - s.phys_start)
            .unwrap_or(DEFAULT_PAGE_OFFSET);

        let kernel_image_size = table
            .number("KERNEL_IMAGE_SIZE")
            .map(|n| n as u64)
            .unwrap_or(DEFAULT_KERNEL_IMAGE_SIZE);

        let pgd = table
            .symbol("init_top_pgt")
            .or_else(|| table.symbol("init_level4_pgt"))
            .map(|pgt| pgt - START_KERNEL_MAP + phys_base);

        let translation = Self {
            page_offset,
            phys_base,
            kernel_image_size,
            pgd,
        };
        info!("{:x?}", translation);
        Ok(translation)
    }

    /// Translates the linearly mapped ranges; `None` means a table walk is needed.
    pub fn linear(&self, vaddr: u64) -> Option<u64> {
        if vaddr >= START_KERNEL_MAP && vaddr - START_KERNEL_MAP < self.kernel_image_size {
            Some(vaddr - START_KERNEL_MAP + self.phys_base)
        } else if vaddr >= self.page_offset && vaddr - self.page_offset < DIRECT_MAP_SIZE {
            Some(vaddr - self.page_offset)
        } else {
            None
        }
    }
}

impl Default for Translation {
    fn default() -> Self {
        Self {
            page_offset: DEFAULT_PAGE_OFFSET,
            phys_base: 0,
            kernel_image_size: DEFAULT_KERNEL_IMAGE_SIZE,
            pgd: None,
        }
    }
}

/// A `/proc/vmcore` style ELF image.
pub struct Vmcore {
    path: PathBuf,
    backing: Backing,
    header: VmcoreHeader,
    info: ImageInfo,
    translation: Translation,
    tlb: HashMap<u64, u64>,
}

impl Vmcore {
    /// Opens the image reading it on demand.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let backing = Backing::open(&path)?;
        Self::with_backing(path, backing)
    }

    /// Opens the image as a read-only file mapping.
    #[cfg(feature = "filemap")]
    pub fn map<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let backing = Backing::map(&path)?;
        Self::with_backing(path, backing)
    }

    fn with_backing(path: PathBuf, backing: Backing) -> Result<Self> {
        let header = parse_header(&backing)?;
        let page_size = header
            .vmcoreinfo_text()
            .and_then(|text| page_size_of(&text))
            .unwrap_or(DEFAULT_PAGE_SIZE);

        let mut info = ImageInfo::new(page_size, header.loads.iter().map(|l| l.segment).collect())?;
        info.notes = header.notes.clone();
        info.vmcoreinfo = header.vmcoreinfo.clone();
        info.ident = header.ident;
        info.nr_cpus = header.nr_cpus;

        Ok(Self {
            path,
            backing,
            header,
            info,
            translation: Translation::default(),
            tlb: HashMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn loads(&self) -> &[FileLoad] {
        &self.header.loads
    }

    pub fn kernel_text(&self) -> Option<FileLoad> {
        self.header.kernel_text
    }

    pub fn vmcoreinfo_text(&self) -> Option<String> {
        self.header.vmcoreinfo_text()
    }

    pub fn translation(&self) -> &Translation {
        &self.translation
    }

    pub fn set_translation(&mut self, translation: Translation) {
        self.info.phys_base = translation.phys_base;
        self.translation = translation;
        self.tlb.clear();
    }

    fn load_index(&self, paddr: u64) -> Option<usize> {
        let loads = &self.header.loads;
        let idx = loads.partition_point(|l| l.segment.phys_start <= paddr);
        idx.checked_sub(1).filter(|&i| loads[i].segment.contains(paddr))
    }

    fn read_u64_phys(&mut self, paddr: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.phys_read_raw_into(paddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn translate_page(&mut self, vaddr: u64) -> Result<u64> {
        let page_mask = self.info.page_size - 1;
        let page = vaddr & !page_mask;
        if let Some(paddr) = self.translation.linear(page) {
            return Ok(paddr | (vaddr & page_mask));
        }
        if let Some(&paddr) = self.tlb.get(&page) {
            return Ok(paddr | (vaddr & page_mask));
        }
        let pgd = self.translation.pgd.ok_or_else(|| {
            Error(ErrorOrigin::Source, ErrorKind::UnableToReadMemory)
                .log_trace(format!("no page tables to translate {:x}", vaddr))
        })?;
        let paddr = vtop(pgd, page, |entry| self.read_u64_phys(entry))?;
        self.tlb.insert(page, paddr);
        Ok(paddr | (vaddr & page_mask))
    }
}

/// `PAGESIZE=` from the VMCOREINFO text.
fn page_size_of(text: &str) -> Option<u64> {
    text.lines()
        .find_map(|l| l.trim().strip_prefix("PAGESIZE="))
        .and_then(|v| v.parse().ok())
}

impl SourceMemory for Vmcore {
    fn info(&self) -> &ImageInfo {
        &self.info
    }

    fn phys_read_raw_into(&mut self, paddr: u64, out: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < out.len() {
            let cur = paddr + done as u64;
            let load = match self.load_index(cur) {
                Some(i) => self.header.loads[i],
                None => {
                    return Err(Error(ErrorOrigin::Source, ErrorKind::UnableToReadMemory)
                        .log_trace(format!("physical address {:x} is not in any load", cur)))
                }
            };
            let seg = load.segment;
            let len = ((seg.phys_end - cur) as usize).min(out.len() - done);
            let chunk = &mut out[done..done + len];

            let rel = cur - seg.phys_start;
            if rel >= load.file_size {
                chunk.fill(0);
            } else {
                let in_file = ((load.file_size - rel) as usize).min(len);
                self.backing.read_at(seg.file_offset + rel, &mut chunk[..in_file])?;
                chunk[in_file..].fill(0);
            }
            done += len;
        }
        Ok(())
    }

    fn virt_read_raw_into(&mut self, vaddr: u64, out: &mut [u8]) -> Result<()> {
        let page_size = self.info.page_size;
        let mut done = 0;
        while done < out.len() {
            let cur = vaddr.wrapping_add(done as u64);
            let len = ((page_size - (cur & (page_size - 1))) as usize).min(out.len() - done);
            let paddr = self.translate_page(cur)?;
            self.phys_read_raw_into(paddr, &mut out[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    fn virt_to_phys(&mut self, vaddr: u64) -> Result<u64> {
        self.translate_page(vaddr)
    }
}

impl ReopenSource for Vmcore {
    fn reopen(&self) -> Result<Self> {
        debug!("reopening {}", self.path.display());
        Ok(Self {
            path: self.path.clone(),
            backing: self.backing.reopen(&self.path)?,
            header: self.header.clone(),
            info: self.info.clone(),
            translation: self.translation,
            tlb: HashMap::new(),
        })
    }
}
