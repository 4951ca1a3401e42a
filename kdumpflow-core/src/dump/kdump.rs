/*!
The compressed kdump container.

Layout of the file, in blocks of one page:

```text
| disk_dump_header | sub header + notes | 1st bitmap | 2nd bitmap | page descriptors | page data | eraseinfo |
```

Every kept page has one descriptor. With zero page exclusion enabled a single
zero page is stored at the start of the data area and all zero pages point
to it.
*/

use std::mem::size_of;
use std::ops::Range;

use dataview::{Pod, PodMethods};
use log::{debug, info};

use crate::bitmap::{bitmap_len, Bitmap};
use crate::error::Result;
use crate::filter::{is_zero_page, BitmapBuilder, PageFilter};
use crate::kernel::Utsname;
use crate::mem::{ImageInfo, SourceMemory};
use crate::report::ExclusionCounters;
use crate::types::{divideup, DumpLevel, Pfn};

use super::cache::{DumpSink, WriteCache, DEFAULT_BLOCK_ORDER};
use super::compress::PageCompressor;
use super::eraseinfo::EraseFilter;

pub const KDUMP_SIGNATURE: [u8; 8] = *b"KDUMP   ";
pub const KDUMP_HEADER_VERSION: i32 = 6;
pub const DISKDUMP_HEADER_BLOCKS: u64 = 1;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Timeval {
    pub tv_sec: i64,
    pub tv_usec: i64,
}
unsafe impl Pod for Timeval {}

/// `struct disk_dump_header`.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct DiskDumpHeader {
    pub signature: [u8; 8],
    pub header_version: i32,
    pub utsname: Utsname,
    pub _pad1: [u8; 6],
    pub timestamp: Timeval,
    pub status: u32,
    pub block_size: i32,
    pub sub_hdr_size: i32,
    pub bitmap_blocks: u32,
    pub max_mapnr: u32,
    pub total_ram_blocks: u32,
    pub device_blocks: u32,
    pub written_blocks: u32,
    pub current_cpu: u32,
    pub nr_cpus: i32,
}
unsafe impl Pod for DiskDumpHeader {}

impl Default for DiskDumpHeader {
    fn default() -> Self {
        Self {
            signature: [0; 8],
            header_version: 0,
            utsname: Utsname::default(),
            _pad1: [0; 6],
            timestamp: Timeval::default(),
            status: 0,
            block_size: 0,
            sub_hdr_size: 0,
            bitmap_blocks: 0,
            max_mapnr: 0,
            total_ram_blocks: 0,
            device_blocks: 0,
            written_blocks: 0,
            current_cpu: 0,
            nr_cpus: 0,
        }
    }
}

impl DiskDumpHeader {
    pub fn block_size(&self) -> u64 {
        self.block_size as u64
    }

    /// Offset of the 1st bitmap.
    pub fn offset_bitmap1(&self) -> u64 {
        (DISKDUMP_HEADER_BLOCKS + self.sub_hdr_size as u64) * self.block_size()
    }

    /// Size of both bitmaps together.
    pub fn len_bitmap(&self) -> u64 {
        self.bitmap_blocks as u64 * self.block_size()
    }

    /// Offset of the first page descriptor.
    pub fn offset_descriptors(&self) -> u64 {
        (DISKDUMP_HEADER_BLOCKS + self.sub_hdr_size as u64 + self.bitmap_blocks as u64) * self.block_size()
    }
}

/// `struct kdump_sub_header`, version 6.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct KdumpSubHeader {
    pub phys_base: u64,
    pub dump_level: i32,
    pub split: i32,
    pub start_pfn: u64,
    pub end_pfn: u64,
    pub offset_vmcoreinfo: u64,
    pub size_vmcoreinfo: u64,
    pub offset_note: u64,
    pub size_note: u64,
    pub offset_eraseinfo: u64,
    pub size_eraseinfo: u64,
    pub start_pfn_64: u64,
    pub end_pfn_64: u64,
    pub max_mapnr_64: u64,
}
unsafe impl Pod for KdumpSubHeader {}

impl KdumpSubHeader {
    /// Frames whose pages are stored in this file.
    pub fn pfn_range(&self) -> Range<Pfn> {
        if self.split != 0 {
            self.start_pfn_64..self.end_pfn_64
        } else {
            0..self.max_mapnr_64
        }
    }
}

/// `struct page_desc`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PageDesc {
    pub offset: i64,
    pub size: u32,
    pub flags: u32,
    pub page_flags: u64,
}
unsafe impl Pod for PageDesc {}

pub const SIZE_PAGE_DESC: u64 = size_of::<PageDesc>() as u64;

/// Offsets of the fixed parts of a container.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KdumpLayout {
    pub block_size: u64,
    pub sub_hdr_size: u64,
    pub len_bitmap: u64,
    pub bitmap_blocks: u64,
}

impl KdumpLayout {
    pub fn new(page_size: u64, max_mapnr: Pfn, size_note: u64) -> Self {
        let len_bitmap = bitmap_len(max_mapnr, page_size);
        Self {
            block_size: page_size,
            sub_hdr_size: divideup(size_of::<KdumpSubHeader>() as u64 + size_note, page_size),
            len_bitmap,
            bitmap_blocks: divideup(len_bitmap, page_size),
        }
    }

    pub fn offset_bitmap1(&self) -> u64 {
        (DISKDUMP_HEADER_BLOCKS + self.sub_hdr_size) * self.block_size
    }

    pub fn offset_bitmap2(&self) -> u64 {
        self.offset_bitmap1() + self.len_bitmap / 2
    }

    pub fn offset_descriptors(&self) -> u64 {
        (DISKDUMP_HEADER_BLOCKS + self.sub_hdr_size + self.bitmap_blocks) * self.block_size
    }
}

/// Outcome of writing one container.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct KdumpStats {
    /// Counters of the filtering pass, zero pages found while writing included.
    pub counters: ExclusionCounters,
    pub num_dumpable: u64,
    pub pages_compressed: u64,
}

/// Writes the compressed container from a filtered source image.
pub struct KdumpWriter {
    page_size: u64,
    max_mapnr: Pfn,
    notes: Vec<u8>,
    vmcoreinfo: Option<Range<usize>>,
    phys_base: u64,
    nr_cpus: u32,
    utsname: Utsname,
    compressor: PageCompressor,
    erase: EraseFilter,
    split: Option<Range<Pfn>>,
    timestamp: Timeval,
    cache_size: usize,
}

impl KdumpWriter {
    pub fn new(info: &ImageInfo, utsname: Utsname, compressor: PageCompressor, erase: EraseFilter) -> Self {
        Self {
            page_size: info.page_size,
            max_mapnr: info.max_mapnr,
            notes: info.notes.clone(),
            vmcoreinfo: info.vmcoreinfo.clone(),
            phys_base: info.phys_base,
            nr_cpus: info.nr_cpus,
            utsname,
            compressor,
            erase,
            split: None,
            timestamp: Timeval::default(),
            cache_size: (info.page_size as usize) << DEFAULT_BLOCK_ORDER,
        }
    }

    /// Stores only the pages of `range`, as one file of a split dump.
    pub fn with_split(mut self, range: Range<Pfn>) -> Self {
        self.split = Some(range);
        self
    }

    pub fn with_timestamp(mut self, tv_sec: i64, tv_usec: i64) -> Self {
        self.timestamp = Timeval { tv_sec, tv_usec };
        self
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn layout(&self) -> KdumpLayout {
        KdumpLayout::new(self.page_size, self.max_mapnr, self.notes.len() as u64)
    }

    fn pfn_range(&self) -> Range<Pfn> {
        self.split.clone().unwrap_or(0..self.max_mapnr)
    }

    fn disk_dump_header(&self, layout: &KdumpLayout) -> DiskDumpHeader {
        DiskDumpHeader {
            signature: KDUMP_SIGNATURE,
            header_version: KDUMP_HEADER_VERSION,
            utsname: self.utsname,
            timestamp: self.timestamp,
            status: self.compressor.status_flag(),
            block_size: layout.block_size as i32,
            sub_hdr_size: layout.sub_hdr_size as i32,
            bitmap_blocks: layout.bitmap_blocks as u32,
            max_mapnr: self.max_mapnr.min(u32::MAX as u64) as u32,
            nr_cpus: self.nr_cpus as i32,
            ..DiskDumpHeader::default()
        }
    }

    fn sub_header(&self, layout: &KdumpLayout, level: DumpLevel) -> KdumpSubHeader {
        let mut kh = KdumpSubHeader {
            phys_base: self.phys_base,
            dump_level: level.level() as i32,
            max_mapnr_64: self.max_mapnr,
            ..KdumpSubHeader::default()
        };
        if let Some(range) = &self.split {
            kh.split = 1;
            kh.start_pfn = range.start.min(u32::MAX as u64);
            kh.end_pfn = range.end.min(u32::MAX as u64);
            kh.start_pfn_64 = range.start;
            kh.end_pfn_64 = range.end;
        }
        if !self.notes.is_empty() {
            kh.offset_note = DISKDUMP_HEADER_BLOCKS * layout.block_size + size_of::<KdumpSubHeader>() as u64;
            kh.size_note = self.notes.len() as u64;
            if let Some(vmci) = &self.vmcoreinfo {
                kh.offset_vmcoreinfo = kh.offset_note + vmci.start as u64;
                kh.size_vmcoreinfo = (vmci.end - vmci.start) as u64;
            }
        }
        kh
    }

    /// Writes the whole container.
    pub fn write<S, B, K>(
        &self,
        source: &mut S,
        sink: &mut K,
        builder: &mut BitmapBuilder<B>,
        filter: &PageFilter,
    ) -> Result<KdumpStats>
    where
        S: SourceMemory,
        B: Bitmap,
        K: DumpSink + ?Sized,
    {
        let layout = self.layout();
        let level = filter.level();
        let range = self.pfn_range();

        let num_dumpable = builder.count_dumpable(filter, source, range.clone())?;
        info!(
            "kdump output: {:x} dumpable pages in {:x}-{:x}, dump level {}",
            num_dumpable, range.start, range.end, level
        );

        sink.write_at(0, self.disk_dump_header(&layout).as_bytes())?;
        let mut kh = self.sub_header(&layout, level);
        if !self.notes.is_empty() {
            sink.write_at(kh.offset_note, &self.notes)?;
        }
        sink.write_at(layout.block_size, kh.as_bytes())?;

        let offset_desc = layout.offset_descriptors();
        let mut cd_header = WriteCache::new(offset_desc, self.cache_size);
        let mut cd_page = WriteCache::new(offset_desc + SIZE_PAGE_DESC * num_dumpable, self.cache_size);

        let zero_blob = if level.contains(DumpLevel::ZERO) {
            let pd = PageDesc {
                offset: cd_page.position() as i64,
                size: self.page_size as u32,
                flags: 0,
                page_flags: 0,
            };
            cd_page.write_zero(sink, self.page_size)?;
            Some(pd)
        } else {
            None
        };

        let mut buf = vec![0u8; self.page_size as usize];
        let mut pfn_zero = 0;
        let mut pages_compressed = 0;

        builder.for_each_window(filter, source, |source, bitmaps, window| {
            let mut offset = layout.offset_bitmap1() + window.start / 8;
            bitmaps.first.for_each_chunk(&mut |bytes| {
                sink.write_at(offset, bytes)?;
                offset += bytes.len() as u64;
                Ok(())
            })?;

            for pfn in window.start.max(range.start)..window.end.min(range.end) {
                if !bitmaps.is_keep(pfn)? {
                    continue;
                }
                source.read_page(pfn, &mut buf)?;
                self.erase.apply(source.info().pfn_to_paddr(pfn), &mut buf);

                if let Some(pd_zero) = &zero_blob {
                    if is_zero_page(&buf) {
                        cd_header.write(sink, pd_zero.as_bytes())?;
                        pfn_zero += 1;
                        continue;
                    }
                }

                let mut pd = PageDesc {
                    offset: cd_page.position() as i64,
                    ..PageDesc::default()
                };
                match self.compressor.compress(&buf)? {
                    Some((codec, out)) => {
                        pd.flags = codec.flag();
                        pd.size = out.len() as u32;
                        cd_page.write(sink, &out)?;
                        pages_compressed += 1;
                    }
                    None => {
                        pd.size = buf.len() as u32;
                        cd_page.write(sink, &buf)?;
                    }
                }
                cd_header.write(sink, pd.as_bytes())?;
            }

            let mut offset = layout.offset_bitmap2() + window.start / 8;
            bitmaps.second.for_each_chunk(&mut |bytes| {
                sink.write_at(offset, bytes)?;
                offset += bytes.len() as u64;
                Ok(())
            })
        })?;

        cd_header.flush(sink)?;
        cd_page.flush(sink)?;

        if !self.erase.is_empty() {
            let text = self.erase.text();
            kh.offset_eraseinfo = cd_page.position();
            kh.size_eraseinfo = text.len() as u64;
            cd_page.write(sink, text.as_bytes())?;
            cd_page.flush(sink)?;
            sink.write_at(layout.block_size, kh.as_bytes())?;
            debug!(
                "eraseinfo: {:x} bytes at {:x}",
                kh.size_eraseinfo, kh.offset_eraseinfo
            );
        }

        let mut counters = builder.counters();
        counters.zero += pfn_zero;
        Ok(KdumpStats {
            counters,
            num_dumpable,
            pages_compressed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_sizes() {
        assert_eq!(size_of::<DiskDumpHeader>(), 464);
        assert_eq!(size_of::<KdumpSubHeader>(), 104);
        assert_eq!(size_of::<PageDesc>(), 24);
    }

    #[test]
    fn fixed_offsets() {
        // 0x10000 pages need 8 KiB per bitmap
        let layout = KdumpLayout::new(4096, 0x10000, 0x1000);
        assert_eq!(layout.sub_hdr_size, 2);
        assert_eq!(layout.len_bitmap, 0x4000);
        assert_eq!(layout.bitmap_blocks, 4);
        assert_eq!(layout.offset_bitmap1(), 0x3000);
        assert_eq!(layout.offset_bitmap2(), 0x5000);
        assert_eq!(layout.offset_descriptors(), 0x7000);
    }
}
