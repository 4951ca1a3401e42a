/*!
Merging the files of a split dump back into one container.
*/

use std::io::{Read, Seek};

use dataview::PodMethods;
use log::{debug, info};

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::types::DumpLevel;

use super::cache::{DumpSink, WriteCache, DEFAULT_BLOCK_ORDER};
use super::kdump::{PageDesc, SIZE_PAGE_DESC};
use super::reader::KdumpReader;

fn mismatch(what: &str) -> Error {
    Error(ErrorOrigin::Reassemble, ErrorKind::InvalidHeader)
        .log_error(format!("split files disagree on {}", what))
}

/// Checks that `files` are parts of one split dump covering the whole
/// address space and sorts them by their first frame.
fn validate<R: Read + Seek>(files: &mut [KdumpReader<R>]) -> Result<()> {
    files.sort_by_key(|f| f.pfn_range().start);
    let first = files
        .first()
        .ok_or_else(|| Error(ErrorOrigin::Reassemble, ErrorKind::ArgValidation).log_error("no split files given"))?;
    let (dh, kh) = (*first.header(), *first.sub_header());

    let mut expected = 0;
    for f in files.iter() {
        let (h, s) = (f.header(), f.sub_header());
        if s.split == 0 {
            return Err(Error(ErrorOrigin::Reassemble, ErrorKind::InvalidHeader)
                .log_error("input is not part of a split dump"));
        }
        if h.block_size != dh.block_size || h.sub_hdr_size != dh.sub_hdr_size || h.bitmap_blocks != dh.bitmap_blocks {
            return Err(mismatch("the file layout"));
        }
        if h.utsname.as_bytes() != dh.utsname.as_bytes() {
            return Err(mismatch("the kernel"));
        }
        if s.max_mapnr_64 != kh.max_mapnr_64 || s.dump_level != kh.dump_level {
            return Err(mismatch("max_mapnr or the dump level"));
        }
        let range = f.pfn_range();
        if range.start != expected || range.end < range.start {
            return Err(Error(ErrorOrigin::Reassemble, ErrorKind::NotContiguous)
                .log_error(format!("expected a file starting at pfn {:x}, got {:x}", expected, range.start)));
        }
        expected = range.end;
    }
    if expected != kh.max_mapnr_64 {
        return Err(Error(ErrorOrigin::Reassemble, ErrorKind::NotContiguous)
            .log_error(format!("split files end at pfn {:x} of {:x}", expected, kh.max_mapnr_64)));
    }
    Ok(())
}

/// Writes the container made of `files` to `sink`.
///
/// Returns the number of pages in the merged file.
pub fn reassemble<R, K>(mut files: Vec<KdumpReader<R>>, sink: &mut K) -> Result<u64>
where
    R: Read + Seek,
    K: DumpSink + ?Sized,
{
    validate(&mut files)?;

    let dh = *files[0].header();
    let mut kh = *files[0].sub_header();
    kh.split = 0;
    kh.start_pfn = 0;
    kh.end_pfn = 0;
    kh.start_pfn_64 = 0;
    kh.end_pfn_64 = 0;
    kh.offset_eraseinfo = 0;
    kh.size_eraseinfo = 0;

    sink.write_at(0, dh.as_bytes())?;
    let notes = files[0].notes()?;
    if !notes.is_empty() {
        sink.write_at(kh.offset_note, &notes)?;
    }
    sink.write_at(dh.block_size(), kh.as_bytes())?;

    let offset_bitmap2 = dh.offset_bitmap1() + dh.len_bitmap() / 2;
    sink.write_at(dh.offset_bitmap1(), files[0].bitmap1())?;
    sink.write_at(offset_bitmap2, files[0].bitmap2())?;

    let total: u64 = files.iter().map(|f| f.num_dumpable()).sum();
    let cache_size = (dh.block_size() as usize) << DEFAULT_BLOCK_ORDER;
    let mut cd_pd = WriteCache::new(dh.offset_descriptors(), cache_size);
    let mut cd_data = WriteCache::new(dh.offset_descriptors() + SIZE_PAGE_DESC * total, cache_size);

    let zero_page = if kh.dump_level as u32 & DumpLevel::ZERO.bits() != 0 {
        let pd = PageDesc {
            offset: cd_data.position() as i64,
            size: dh.block_size as u32,
            ..PageDesc::default()
        };
        cd_data.write_zero(sink, dh.block_size())?;
        Some(pd)
    } else {
        None
    };

    for file in files.iter_mut() {
        let file_zero = file.offset_zero_page();
        debug!(
            "merging pfn {:x}-{:x}: {:x} pages",
            file.pfn_range().start,
            file.pfn_range().end,
            file.num_dumpable()
        );
        for index in 0..file.num_dumpable() {
            let mut pd = file.page_desc_at(index)?;
            if let (Some(zero), Some(off)) = (&zero_page, file_zero) {
                if pd.offset as u64 == off {
                    cd_pd.write(sink, zero.as_bytes())?;
                    continue;
                }
            }
            let data = file.read_raw(&pd)?;
            pd.offset = cd_data.position() as i64;
            cd_pd.write(sink, pd.as_bytes())?;
            cd_data.write(sink, &data)?;
        }
    }
    cd_pd.flush(sink)?;
    cd_data.flush(sink)?;

    let mut eraseinfo = Vec::new();
    for file in files.iter_mut() {
        eraseinfo.extend_from_slice(&file.eraseinfo()?);
    }
    if !eraseinfo.is_empty() {
        kh.offset_eraseinfo = cd_data.position();
        kh.size_eraseinfo = eraseinfo.len() as u64;
        cd_data.write(sink, &eraseinfo)?;
        cd_data.flush(sink)?;
        sink.write_at(dh.block_size(), kh.as_bytes())?;
    }

    info!("reassembled {} files, {:x} pages", files.len(), total);
    Ok(total)
}
