/*!
ELF core output.

The output keeps the note segment of the source image and describes the kept
memory with PT_LOAD segments. Excluded runs shorter than the coalescing
threshold stay inside a segment. Longer runs end the current segment and the
next kept page starts a new one.
*/

use std::mem::size_of;

use dataview::{Pod, PodMethods};
use log::{debug, info};

use crate::bitmap::Bitmap;
use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::filter::{BitmapBuilder, PageFilter};
use crate::mem::{ElfClass, ElfIdent, ImageInfo, LoadSegment, SourceMemory};
use crate::types::{roundup, Pfn};

use super::cache::{DumpSink, WriteCache};
use super::eraseinfo::EraseFilter;

/// Excluded runs of at least this many pages start a new PT_LOAD.
pub const PFN_EXCLUDED: u64 = 256;

pub const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub const ELFCLASS32: u8 = 1;
pub const ELFCLASS64: u8 = 2;
pub const EV_CURRENT: u8 = 1;
pub const ET_CORE: u16 = 4;
pub const PT_LOAD: u32 = 1;
pub const PT_NOTE: u32 = 4;
pub const PF_RWX: u32 = 0x7;

pub const ERASEINFO_NOTE_NAME: &[u8] = b"ERASEINFO\0";

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct Elf64Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}
unsafe impl Pod for Elf64Ehdr {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct Elf64Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}
unsafe impl Pod for Elf64Phdr {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct Elf32Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}
unsafe impl Pod for Elf32Ehdr {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct Elf32Phdr {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}
unsafe impl Pod for Elf32Phdr {}

/// Note header, identical for both classes.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct ElfNhdr {
    pub n_namesz: u32,
    pub n_descsz: u32,
    pub n_type: u32,
}
unsafe impl Pod for ElfNhdr {}

/// One program header of the output.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ElfSegment {
    pub paddr: u64,
    pub vaddr: u64,
    pub offset: u64,
    pub memsz: u64,
    pub filesz: u64,
}

/// Cuts one source load into output segments, page by page.
struct LoadCoalescer {
    page_size: u64,
    threshold: u64,
    next_pfn: Pfn,
    pfn_end: Pfn,
    frac_tail: u64,
    num_excluded: u64,
    current: ElfSegment,
    done: Vec<ElfSegment>,
}

impl LoadCoalescer {
    fn new(load: &LoadSegment, page_size: u64, threshold: u64) -> Self {
        let mut next_pfn = load.phys_start / page_size;
        let mut pfn_end = load.phys_end / page_size;
        let frac_head = page_size - load.phys_start % page_size;
        let frac_tail = load.phys_end % page_size;

        let mut current = ElfSegment {
            paddr: load.phys_start,
            vaddr: load.virt_start,
            ..ElfSegment::default()
        };
        // a partial first page is always written
        if frac_head != page_size {
            current.memsz = frac_head.min(load.size());
            current.filesz = current.memsz;
            next_pfn += 1;
        }
        if frac_tail != 0 {
            pfn_end += 1;
        }

        Self {
            page_size,
            threshold: threshold.max(1),
            next_pfn,
            pfn_end: pfn_end.max(next_pfn),
            frac_tail,
            num_excluded: 0,
            current,
            done: Vec::new(),
        }
    }

    fn page_len(&self, pfn: Pfn) -> u64 {
        if pfn + 1 == self.pfn_end && self.frac_tail != 0 {
            self.frac_tail
        } else {
            self.page_size
        }
    }

    fn pending(&self) -> std::ops::Range<Pfn> {
        self.next_pfn..self.pfn_end
    }

    fn feed(&mut self, pfn: Pfn, keep: bool) {
        let len = self.page_len(pfn);
        self.next_pfn = pfn + 1;

        if !keep {
            self.num_excluded += 1;
            self.current.memsz += len;
        } else if self.num_excluded == 0 {
            self.current.memsz += len;
            self.current.filesz += len;
        } else if self.num_excluded < self.threshold {
            self.current.memsz += len;
            self.current.filesz += self.page_size * self.num_excluded + len;
            self.num_excluded = 0;
        } else {
            let closed = self.current;
            self.done.push(closed);
            self.current = ElfSegment {
                paddr: closed.paddr + closed.memsz,
                vaddr: closed.vaddr + closed.memsz,
                offset: 0,
                memsz: len,
                filesz: len,
            };
            self.num_excluded = 0;
        }
    }

    fn finish(mut self) -> Vec<ElfSegment> {
        for pfn in self.pending() {
            self.feed(pfn, false);
        }
        self.done.push(self.current);
        self.done
    }
}

/// Placement of the output headers and data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElfLayout {
    pub segments: Vec<ElfSegment>,
    pub offset_note: u64,
    /// PT_NOTE size including the eraseinfo note.
    pub size_note: u64,
    pub offset_load: u64,
}

/// Writes an ELF core from a filtered source image.
pub struct ElfWriter {
    ident: ElfIdent,
    page_size: u64,
    loads: Vec<LoadSegment>,
    notes: Vec<u8>,
    erase: EraseFilter,
    threshold: u64,
    cache_size: usize,
}

impl ElfWriter {
    pub fn new(info: &ImageInfo, erase: EraseFilter) -> Self {
        Self {
            ident: info.ident,
            page_size: info.page_size,
            loads: info.loads.clone(),
            notes: info.notes.clone(),
            erase,
            threshold: PFN_EXCLUDED,
            cache_size: (info.page_size as usize) << super::cache::DEFAULT_BLOCK_ORDER,
        }
    }

    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    fn is_elf64(&self) -> bool {
        self.ident.class == ElfClass::Elf64
    }

    fn ehdr_size(&self) -> u64 {
        if self.is_elf64() {
            size_of::<Elf64Ehdr>() as u64
        } else {
            size_of::<Elf32Ehdr>() as u64
        }
    }

    fn phdr_size(&self) -> u64 {
        if self.is_elf64() {
            size_of::<Elf64Phdr>() as u64
        } else {
            size_of::<Elf32Phdr>() as u64
        }
    }

    /// Size of the eraseinfo note appended to the source notes.
    fn eraseinfo_note_size(&self) -> u64 {
        if self.erase.is_empty() {
            return 0;
        }
        size_of::<ElfNhdr>() as u64
            + roundup(ERASEINFO_NOTE_NAME.len() as u64, 4)
            + roundup(self.erase.text().len() as u64, 4)
    }

    /// PT_NOTE size. The eraseinfo note starts 4-aligned after the source notes.
    fn size_note(&self) -> u64 {
        if self.erase.is_empty() {
            self.notes.len() as u64
        } else {
            roundup(self.notes.len() as u64, 4) + self.eraseinfo_note_size()
        }
    }

    /// Computes the PT_LOAD segments of the output in a single pass over
    /// the windows of `builder`.
    pub fn plan<S, B>(
        &self,
        source: &mut S,
        builder: &mut BitmapBuilder<B>,
        filter: &PageFilter,
    ) -> Result<ElfLayout>
    where
        S: SourceMemory,
        B: Bitmap,
    {
        let mut coalescers = self
            .loads
            .iter()
            .map(|l| LoadCoalescer::new(l, self.page_size, self.threshold))
            .collect::<Vec<_>>();

        builder.for_each_window(filter, source, |_, bitmaps, window| {
            for c in coalescers.iter_mut() {
                let pending = c.pending();
                for pfn in pending.start.max(window.start)..pending.end.min(window.end) {
                    c.feed(pfn, bitmaps.is_keep(pfn)?);
                }
            }
            Ok(())
        })?;

        let mut segments = coalescers
            .into_iter()
            .flat_map(LoadCoalescer::finish)
            .collect::<Vec<_>>();

        let offset_note = self.ehdr_size() + self.phdr_size() * (1 + segments.len() as u64);
        let size_note = self.size_note();
        let offset_load = offset_note + size_note;

        let mut offset = offset_load;
        for seg in segments.iter_mut() {
            if seg.filesz != 0 {
                seg.offset = offset;
                offset += seg.filesz;
            }
        }
        info!(
            "elf output: {} PT_LOAD segments, {:x} bytes of page data",
            segments.len(),
            offset - offset_load
        );

        Ok(ElfLayout {
            segments,
            offset_note,
            size_note,
            offset_load,
        })
    }

    /// Writes headers, notes and segment data described by `layout`.
    pub fn write<S, K>(&self, source: &mut S, sink: &mut K, layout: &ElfLayout) -> Result<()>
    where
        S: SourceMemory,
        K: DumpSink + ?Sized,
    {
        let mut header = WriteCache::new(0, self.cache_size);
        self.write_headers(sink, &mut header, layout)?;
        header.flush(sink)?;

        sink.write_at(layout.offset_note, &self.notes)?;
        if !self.erase.is_empty() {
            self.write_eraseinfo_note(sink, layout)?;
        }

        let mut data = WriteCache::new(layout.offset_load, self.cache_size);
        let mut buf = vec![0u8; self.page_size as usize];
        for seg in layout.segments.iter().filter(|s| s.filesz != 0) {
            debug!(
                "writing segment paddr={:x} filesz={:x} at {:x}",
                seg.paddr, seg.filesz, seg.offset
            );
            let mut paddr = seg.paddr;
            let end = seg.paddr + seg.filesz;
            while paddr < end {
                // stay page aligned after a partial first page
                let chunk = (self.page_size - paddr % self.page_size).min(end - paddr) as usize;
                source.phys_read_raw_into(paddr, &mut buf[..chunk])?;
                self.erase.apply(paddr, &mut buf[..chunk]);
                data.write(sink, &buf[..chunk])?;
                paddr += chunk as u64;
            }
        }
        data.flush(sink)
    }

    fn write_headers<K: DumpSink + ?Sized>(
        &self,
        sink: &mut K,
        cache: &mut WriteCache,
        layout: &ElfLayout,
    ) -> Result<()> {
        let mut e_ident = [0u8; 16];
        e_ident[..4].copy_from_slice(&ELFMAG);
        e_ident[4] = if self.is_elf64() { ELFCLASS64 } else { ELFCLASS32 };
        e_ident[5] = self.ident.data;
        e_ident[6] = EV_CURRENT;
        e_ident[7] = self.ident.osabi;
        let phnum = 1 + layout.segments.len() as u16;

        let note = ElfSegment {
            offset: layout.offset_note,
            memsz: layout.size_note,
            filesz: layout.size_note,
            ..ElfSegment::default()
        };

        if self.is_elf64() {
            let ehdr = Elf64Ehdr {
                e_ident,
                e_type: ET_CORE,
                e_machine: self.ident.machine,
                e_version: EV_CURRENT as u32,
                e_phoff: self.ehdr_size(),
                e_flags: self.ident.flags,
                e_ehsize: self.ehdr_size() as u16,
                e_phentsize: self.phdr_size() as u16,
                e_phnum: phnum,
                ..Elf64Ehdr::default()
            };
            cache.write(sink, ehdr.as_bytes())?;
            cache.write(sink, phdr64(PT_NOTE, 0, &note).as_bytes())?;
            for seg in layout.segments.iter() {
                cache.write(sink, phdr64(PT_LOAD, PF_RWX, seg).as_bytes())?;
            }
        } else {
            let ehdr = Elf32Ehdr {
                e_ident,
                e_type: ET_CORE,
                e_machine: self.ident.machine,
                e_version: EV_CURRENT as u32,
                e_phoff: self.ehdr_size() as u32,
                e_flags: self.ident.flags,
                e_ehsize: self.ehdr_size() as u16,
                e_phentsize: self.phdr_size() as u16,
                e_phnum: phnum,
                ..Elf32Ehdr::default()
            };
            cache.write(sink, ehdr.as_bytes())?;
            cache.write(sink, phdr32(PT_NOTE, 0, &note)?.as_bytes())?;
            for seg in layout.segments.iter() {
                cache.write(sink, phdr32(PT_LOAD, PF_RWX, seg)?.as_bytes())?;
            }
        }
        Ok(())
    }

    fn write_eraseinfo_note<K: DumpSink + ?Sized>(&self, sink: &mut K, layout: &ElfLayout) -> Result<()> {
        let text = self.erase.text();
        let nhdr = ElfNhdr {
            n_namesz: ERASEINFO_NOTE_NAME.len() as u32,
            n_descsz: text.len() as u32,
            n_type: 0,
        };
        let mut note = nhdr.as_bytes().to_vec();
        note.extend_from_slice(ERASEINFO_NOTE_NAME);
        note.resize(roundup(note.len() as u64, 4) as usize, 0);
        note.extend_from_slice(text.as_bytes());
        note.resize(roundup(note.len() as u64, 4) as usize, 0);

        let offset = layout.offset_note + roundup(self.notes.len() as u64, 4);
        debug!("eraseinfo note: {:x} bytes at {:x}", note.len(), offset);
        sink.write_at(offset, &note)
    }
}

fn phdr64(p_type: u32, p_flags: u32, seg: &ElfSegment) -> Elf64Phdr {
    Elf64Phdr {
        p_type,
        p_flags,
        p_offset: seg.offset,
        p_vaddr: seg.vaddr,
        p_paddr: seg.paddr,
        p_filesz: seg.filesz,
        p_memsz: seg.memsz,
        p_align: 0,
    }
}

fn elf32_field(name: &str, value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        Error(ErrorOrigin::DumpFile, ErrorKind::OutOfBounds)
            .log_error(format!("{} {:x} does not fit into an ELF32 header", name, value))
    })
}

fn phdr32(p_type: u32, p_flags: u32, seg: &ElfSegment) -> Result<Elf32Phdr> {
    Ok(Elf32Phdr {
        p_type,
        p_offset: elf32_field("p_offset", seg.offset)?,
        p_vaddr: elf32_field("p_vaddr", seg.vaddr)?,
        p_paddr: elf32_field("p_paddr", seg.paddr)?,
        p_filesz: elf32_field("p_filesz", seg.filesz)?,
        p_memsz: elf32_field("p_memsz", seg.memsz)?,
        p_flags,
        p_align: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::eraseinfo::{EraseEntry, EraseSize};

    fn coalesce(keep: &[bool], threshold: u64) -> Vec<ElfSegment> {
        let load = LoadSegment::new(0, keep.len() as u64 * 0x1000);
        let mut c = LoadCoalescer::new(&load, 0x1000, threshold);
        for (pfn, &k) in keep.iter().enumerate() {
            c.feed(pfn as u64, k);
        }
        c.finish()
    }

    #[test]
    fn short_gap_stays_in_segment() {
        let mut keep = vec![true; 8];
        keep[2] = false;
        keep[3] = false;
        let segs = coalesce(&keep, 3);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].memsz, 0x8000);
        assert_eq!(segs[0].filesz, 0x8000);
    }

    #[test]
    fn long_gap_splits_segment() {
        let mut keep = vec![true; 8];
        keep[2..5].iter_mut().for_each(|k| *k = false);
        let segs = coalesce(&keep, 3);
        assert_eq!(segs.len(), 2);
        assert_eq!((segs[0].paddr, segs[0].memsz, segs[0].filesz), (0, 0x5000, 0x2000));
        assert_eq!((segs[1].paddr, segs[1].memsz, segs[1].filesz), (0x5000, 0x3000, 0x3000));
    }

    #[test]
    fn trailing_exclusion_only_grows_memsz() {
        let mut keep = vec![true; 8];
        keep[4..].iter_mut().for_each(|k| *k = false);
        let segs = coalesce(&keep, 2);
        assert_eq!(segs.len(), 1);
        assert_eq!((segs[0].memsz, segs[0].filesz), (0x8000, 0x4000));
    }

    #[test]
    fn unfed_pages_count_as_excluded() {
        let load = LoadSegment::new(0x800, 0x2000);
        let mut c = LoadCoalescer::new(&load, 0x1000, 256);
        assert_eq!(c.pending(), 1..3);
        c.feed(1, true);
        let segs = c.finish();
        // partial head, one full page, partial tail
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].memsz, 0x2000);
        assert_eq!(segs[0].filesz, 0x1800);
    }

    fn writer(notes: &[u8], erase: EraseFilter) -> ElfWriter {
        let mut info = ImageInfo::new(0x1000, vec![LoadSegment::new(0, 0x10000)]).unwrap();
        info.notes = notes.to_vec();
        ElfWriter::new(&info, erase)
    }

    #[test]
    fn eraseinfo_note_fits_after_unaligned_notes() {
        let erase = EraseFilter::new(
            vec![EraseEntry::new("modprobe_path", 0x2000, EraseSize::Bytes(16))],
            8,
        );
        let writer = writer(&[1, 2, 3, 4, 5], erase);
        let text = writer.erase.text();
        let note_end = 8 + 12 + roundup(ERASEINFO_NOTE_NAME.len() as u64, 4) + roundup(text.len() as u64, 4);
        assert_eq!(writer.size_note(), note_end);

        let mut out = Vec::new();
        let layout = ElfLayout {
            segments: Vec::new(),
            offset_note: 0x100,
            size_note: writer.size_note(),
            offset_load: 0x100 + writer.size_note(),
        };
        writer.write_eraseinfo_note(&mut out, &layout).unwrap();
        assert_eq!(out.len() as u64, layout.offset_load);
        assert!(out.windows(text.len()).any(|w| w == text.as_bytes()));
    }

    #[test]
    fn notes_without_eraseinfo_are_copied_as_is() {
        let writer = writer(&[1, 2, 3, 4, 5], EraseFilter::default());
        assert_eq!(writer.size_note(), 5);
    }

    #[test]
    fn elf32_rejects_wide_values() {
        let seg = ElfSegment {
            paddr: 0x1_0000_0000,
            memsz: 0x1000,
            filesz: 0x1000,
            ..ElfSegment::default()
        };
        assert!(phdr32(PT_LOAD, PF_RWX, &seg).is_err());

        let seg = ElfSegment {
            paddr: 0xfff0_0000,
            memsz: 0x1000,
            filesz: 0x1000,
            offset: 0x2000,
            ..ElfSegment::default()
        };
        let phdr = phdr32(PT_LOAD, PF_RWX, &seg).unwrap();
        assert_eq!(phdr.p_paddr, 0xfff0_0000);
    }

    #[test]
    fn header_sizes() {
        assert_eq!(size_of::<Elf64Ehdr>(), 64);
        assert_eq!(size_of::<Elf64Phdr>(), 56);
        assert_eq!(size_of::<Elf32Ehdr>(), 52);
        assert_eq!(size_of::<Elf32Phdr>(), 32);
        assert_eq!(size_of::<ElfNhdr>(), 12);
    }
}
