/*!
Reading back compressed kdump containers.
*/

use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;

use dataview::PodMethods;
use log::debug;

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::types::{DumpLevel, Pfn};

use super::compress::Codec;
use super::kdump::{DiskDumpHeader, KdumpSubHeader, PageDesc, KDUMP_HEADER_VERSION, KDUMP_SIGNATURE, SIZE_PAGE_DESC};

/// Bits per rank entry of the 2nd bitmap.
const RANK_BITS: u64 = 4096;

/// Random access to the pages of a container.
pub struct KdumpReader<R> {
    input: R,
    header: DiskDumpHeader,
    sub_header: KdumpSubHeader,
    bitmap1: Vec<u8>,
    bitmap2: Vec<u8>,
    /// Kept pages of the stored range before each block of `RANK_BITS` frames.
    ranks: Vec<u64>,
}

impl<R: Read + Seek> KdumpReader<R> {
    pub fn new(mut input: R) -> Result<Self> {
        let mut header = DiskDumpHeader::default();
        read_at(&mut input, 0, header.as_bytes_mut())?;
        if header.signature != KDUMP_SIGNATURE {
            return Err(Error(ErrorOrigin::DumpFile, ErrorKind::InvalidSignature)
                .log_error("not a compressed kdump file"));
        }
        if header.header_version < KDUMP_HEADER_VERSION {
            return Err(Error(ErrorOrigin::DumpFile, ErrorKind::VersionMismatch)
                .log_error(format!("header version {} is not supported", header.header_version)));
        }
        if header.block_size <= 0 || !(header.block_size as u64).is_power_of_two() {
            return Err(Error(ErrorOrigin::DumpFile, ErrorKind::InvalidHeader)
                .log_error(format!("invalid block size {}", header.block_size)));
        }

        let mut sub_header = KdumpSubHeader::default();
        read_at(&mut input, header.block_size(), sub_header.as_bytes_mut())?;

        let half = (header.len_bitmap() / 2) as usize;
        let mut bitmaps = vec![0u8; half * 2];
        read_at(&mut input, header.offset_bitmap1(), &mut bitmaps)?;
        let bitmap2 = bitmaps.split_off(half);

        let mut reader = Self {
            input,
            header,
            sub_header,
            bitmap1: bitmaps,
            bitmap2,
            ranks: Vec::new(),
        };
        reader.build_ranks();
        debug!(
            "kdump file: max_mapnr={:x} range={:?} dumpable={:x}",
            reader.max_mapnr(),
            reader.pfn_range(),
            reader.num_dumpable()
        );
        Ok(reader)
    }

    fn build_ranks(&mut self) {
        let range = self.pfn_range();
        let mut count = 0;
        let mut ranks = Vec::with_capacity((range.end / RANK_BITS + 1) as usize);
        let mut pfn = 0;
        while pfn < range.end {
            ranks.push(count);
            let block_end = (pfn + RANK_BITS).min(range.end);
            count += (pfn.max(range.start)..block_end)
                .filter(|&p| self.is_dumpable(p))
                .count() as u64;
            pfn = block_end;
        }
        ranks.push(count);
        self.ranks = ranks;
    }

    pub fn header(&self) -> &DiskDumpHeader {
        &self.header
    }

    pub fn sub_header(&self) -> &KdumpSubHeader {
        &self.sub_header
    }

    pub fn page_size(&self) -> u64 {
        self.header.block_size()
    }

    pub fn max_mapnr(&self) -> Pfn {
        self.sub_header.max_mapnr_64
    }

    /// Frames whose pages are stored in this file.
    pub fn pfn_range(&self) -> Range<Pfn> {
        self.sub_header.pfn_range()
    }

    pub fn bitmap1(&self) -> &[u8] {
        &self.bitmap1
    }

    pub fn bitmap2(&self) -> &[u8] {
        &self.bitmap2
    }

    fn bit(bitmap: &[u8], pfn: Pfn) -> bool {
        bitmap
            .get((pfn / 8) as usize)
            .map(|b| b & (1 << (pfn % 8)) != 0)
            .unwrap_or(false)
    }

    pub fn is_present(&self, pfn: Pfn) -> bool {
        Self::bit(&self.bitmap1, pfn)
    }

    pub fn is_dumpable(&self, pfn: Pfn) -> bool {
        Self::bit(&self.bitmap2, pfn)
    }

    /// Number of page descriptors in this file.
    pub fn num_dumpable(&self) -> u64 {
        self.ranks.last().copied().unwrap_or(0)
    }

    pub fn offset_descriptors(&self) -> u64 {
        self.header.offset_descriptors()
    }

    /// Offset of the shared zero page, when the dump level excludes zero pages.
    pub fn offset_zero_page(&self) -> Option<u64> {
        if self.sub_header.dump_level as u32 & DumpLevel::ZERO.bits() != 0 {
            Some(self.offset_descriptors() + SIZE_PAGE_DESC * self.num_dumpable())
        } else {
            None
        }
    }

    fn descriptor_index(&self, pfn: Pfn) -> u64 {
        let range = self.pfn_range();
        let block = pfn / RANK_BITS;
        let from = (block * RANK_BITS).max(range.start);
        self.ranks[block as usize] + (from..pfn).filter(|&p| self.is_dumpable(p)).count() as u64
    }

    /// Descriptor of a kept page of the stored range.
    pub fn page_desc(&mut self, pfn: Pfn) -> Result<Option<PageDesc>> {
        if !self.pfn_range().contains(&pfn) || !self.is_dumpable(pfn) {
            return Ok(None);
        }
        let index = self.descriptor_index(pfn);
        self.page_desc_at(index).map(Some)
    }

    /// The `index`th descriptor of the table, in frame order.
    pub fn page_desc_at(&mut self, index: u64) -> Result<PageDesc> {
        let offset = self.offset_descriptors() + SIZE_PAGE_DESC * index;
        let mut pd = PageDesc::default();
        read_at(&mut self.input, offset, pd.as_bytes_mut())?;
        Ok(pd)
    }

    /// Stored bytes of a descriptor, compressed or not.
    pub fn read_raw(&mut self, pd: &PageDesc) -> Result<Vec<u8>> {
        if pd.offset < 0 || pd.size as u64 > self.page_size() * 2 {
            return Err(Error(ErrorOrigin::DumpFile, ErrorKind::InvalidHeader)
                .log_error(format!("invalid page descriptor {:?}", pd)));
        }
        let mut data = vec![0u8; pd.size as usize];
        read_at(&mut self.input, pd.offset as u64, &mut data)?;
        Ok(data)
    }

    /// Contents of a kept page, decompressed.
    pub fn read_page(&mut self, pfn: Pfn) -> Result<Option<Vec<u8>>> {
        let pd = match self.page_desc(pfn)? {
            Some(pd) => pd,
            None => return Ok(None),
        };
        let data = self.read_raw(&pd)?;
        let page_size = self.page_size() as usize;
        match Codec::from_flag(pd.flags) {
            Some(codec) => codec.decompress(&data, page_size).map(Some),
            None if data.len() == page_size => Ok(Some(data)),
            None => Err(Error(ErrorOrigin::DumpFile, ErrorKind::InvalidHeader)
                .log_error(format!("raw page {:x} has {} bytes", pfn, data.len()))),
        }
    }

    pub fn notes(&mut self) -> Result<Vec<u8>> {
        let (offset, size) = (self.sub_header.offset_note, self.sub_header.size_note);
        self.read_section(offset, size)
    }

    pub fn vmcoreinfo(&mut self) -> Result<Vec<u8>> {
        let (offset, size) = (self.sub_header.offset_vmcoreinfo, self.sub_header.size_vmcoreinfo);
        self.read_section(offset, size)
    }

    pub fn eraseinfo(&mut self) -> Result<Vec<u8>> {
        let (offset, size) = (self.sub_header.offset_eraseinfo, self.sub_header.size_eraseinfo);
        self.read_section(offset, size)
    }

    fn read_section(&mut self, offset: u64, size: u64) -> Result<Vec<u8>> {
        let mut out = vec![0u8; size as usize];
        if size != 0 {
            read_at(&mut self.input, offset, &mut out)?;
        }
        Ok(out)
    }
}

fn read_at<R: Read + Seek>(input: &mut R, offset: u64, buf: &mut [u8]) -> Result<()> {
    input
        .seek(SeekFrom::Start(offset))
        .map_err(|e| Error::from_io(ErrorOrigin::DumpFile, ErrorKind::UnableToSeekFile, &e).log_error(e))?;
    input.read_exact(buf).map_err(|e| {
        Error::from_io(ErrorOrigin::DumpFile, ErrorKind::UnableToReadFile, &e)
            .log_error(format!("{} bytes at {:x}: {}", buf.len(), offset, e))
    })
}
