/*!
Parsing of the ELF headers of a `/proc/vmcore` image.
*/

use std::ops::Range;

use dataview::{Pod, PodMethods};
use log::{debug, info};

use kdumpflow_core::dump::elf::{
    Elf32Ehdr, Elf32Phdr, Elf64Ehdr, Elf64Phdr, ElfNhdr, ELFCLASS32, ELFCLASS64, ELFMAG, ET_CORE, PT_LOAD,
    PT_NOTE,
};
use kdumpflow_core::error::{Error, ErrorKind, ErrorOrigin, Result};
use kdumpflow_core::mem::{ElfClass, ElfIdent, LoadSegment, ELFDATA2LSB, EM_X86_64};
use kdumpflow_core::types::roundup;

use crate::file::Backing;
use crate::vmcore::START_KERNEL_MAP;

pub const NT_PRSTATUS: u32 = 1;
pub const VMCOREINFO_NOTE_NAME: &[u8] = b"VMCOREINFO";

/// A PT_LOAD of the image; bytes past `file_size` read as zero.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FileLoad {
    pub segment: LoadSegment,
    pub file_size: u64,
}

/// Everything the program headers of the image say.
#[derive(Clone, Debug)]
pub struct VmcoreHeader {
    pub ident: ElfIdent,
    /// Loads of physical memory, sorted and without overlaps.
    pub loads: Vec<FileLoad>,
    /// The kernel text load, which repeats part of the physical memory.
    pub kernel_text: Option<FileLoad>,
    pub notes: Vec<u8>,
    pub vmcoreinfo: Option<Range<usize>>,
    pub nr_cpus: u32,
}

impl VmcoreHeader {
    pub fn vmcoreinfo_text(&self) -> Option<String> {
        self.vmcoreinfo
            .clone()
            .and_then(|r| self.notes.get(r))
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

fn read_pod<T: Pod + Default>(backing: &Backing, offset: u64) -> Result<T> {
    let mut value = T::default();
    backing.read_at(offset, value.as_bytes_mut())?;
    Ok(value)
}

fn invalid(what: impl std::fmt::Display) -> Error {
    Error(ErrorOrigin::Source, ErrorKind::InvalidElfFile).log_error(what)
}

/// One program header, widened to 64 bits.
struct Phdr {
    p_type: u32,
    offset: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
}

impl From<Elf64Phdr> for Phdr {
    fn from(p: Elf64Phdr) -> Self {
        Self {
            p_type: p.p_type,
            offset: p.p_offset,
            vaddr: p.p_vaddr,
            paddr: p.p_paddr,
            filesz: p.p_filesz,
            memsz: p.p_memsz,
        }
    }
}

impl From<Elf32Phdr> for Phdr {
    fn from(p: Elf32Phdr) -> Self {
        Self {
            p_type: p.p_type,
            offset: p.p_offset as u64,
            vaddr: p.p_vaddr as u64,
            paddr: p.p_paddr as u64,
            filesz: p.p_filesz as u64,
            memsz: p.p_memsz as u64,
        }
    }
}

fn program_headers(backing: &Backing) -> Result<(ElfIdent, Vec<Phdr>)> {
    let mut e_ident = [0u8; 16];
    backing.read_at(0, &mut e_ident)?;
    if e_ident[..4] != ELFMAG {
        return Err(Error(ErrorOrigin::Source, ErrorKind::InvalidSignature).log_error("not an ELF file"));
    }
    if e_ident[5] != ELFDATA2LSB {
        return Err(Error(ErrorOrigin::Source, ErrorKind::NotSupported).log_error("big endian images"));
    }

    let (ident, phdrs) = match e_ident[4] {
        ELFCLASS64 => {
            let ehdr: Elf64Ehdr = read_pod(backing, 0)?;
            check_ehdr(ehdr.e_type, ehdr.e_machine)?;
            let phdrs = (0..ehdr.e_phnum as u64)
                .map(|i| read_pod::<Elf64Phdr>(backing, ehdr.e_phoff + i * ehdr.e_phentsize as u64).map(Phdr::from))
                .collect::<Result<Vec<_>>>()?;
            (ident(ElfClass::Elf64, &e_ident, ehdr.e_machine, ehdr.e_flags), phdrs)
        }
        ELFCLASS32 => {
            let ehdr: Elf32Ehdr = read_pod(backing, 0)?;
            check_ehdr(ehdr.e_type, ehdr.e_machine)?;
            let phdrs = (0..ehdr.e_phnum as u64)
                .map(|i| {
                    read_pod::<Elf32Phdr>(backing, ehdr.e_phoff as u64 + i * ehdr.e_phentsize as u64)
                        .map(Phdr::from)
                })
                .collect::<Result<Vec<_>>>()?;
            (ident(ElfClass::Elf32, &e_ident, ehdr.e_machine, ehdr.e_flags), phdrs)
        }
        class => return Err(invalid(format!("unknown ELF class {}", class))),
    };
    Ok((ident, phdrs))
}

fn check_ehdr(e_type: u16, e_machine: u16) -> Result<()> {
    if e_type != ET_CORE {
        return Err(invalid(format!("ELF type {} is not a core file", e_type)));
    }
    if e_machine != EM_X86_64 {
        return Err(Error(ErrorOrigin::Source, ErrorKind::NotSupported)
            .log_error(format!("machine type {}", e_machine)));
    }
    Ok(())
}

fn ident(class: ElfClass, e_ident: &[u8; 16], machine: u16, flags: u32) -> ElfIdent {
    ElfIdent {
        class,
        data: e_ident[5],
        osabi: e_ident[7],
        machine,
        flags,
    }
}

/// Finds the VMCOREINFO descriptor and counts the cpu notes.
fn scan_notes(notes: &[u8]) -> Result<(Option<Range<usize>>, u32)> {
    let mut vmcoreinfo = None;
    let mut nr_cpus = 0;
    let mut off = 0usize;
    let hdr_len = std::mem::size_of::<ElfNhdr>();

    while off + hdr_len <= notes.len() {
        let mut nhdr = ElfNhdr::default();
        nhdr.as_bytes_mut().copy_from_slice(&notes[off..off + hdr_len]);
        if nhdr.n_namesz == 0 && nhdr.n_descsz == 0 && nhdr.n_type == 0 {
            break;
        }
        let name_start = off + hdr_len;
        let desc_start = name_start + roundup(nhdr.n_namesz as u64, 4) as usize;
        let desc_end = desc_start + nhdr.n_descsz as usize;
        if desc_end > notes.len() {
            return Err(invalid(format!("note at {:x} runs past the note segment", off)));
        }

        let name = &notes[name_start..name_start + nhdr.n_namesz as usize];
        let name = name.strip_suffix(b"\0").unwrap_or(name);
        if name == VMCOREINFO_NOTE_NAME {
            vmcoreinfo = Some(desc_start..desc_end);
        } else if nhdr.n_type == NT_PRSTATUS {
            nr_cpus += 1;
        }
        off = desc_start + roundup(nhdr.n_descsz as u64, 4) as usize;
    }
    Ok((vmcoreinfo, nr_cpus))
}

/// Removes the kernel text load if its physical range is covered by
/// another load.
fn split_kernel_text(loads: &mut Vec<FileLoad>) -> Option<FileLoad> {
    let index = loads.iter().position(|t| {
        let text = t.segment;
        text.virt_start >= START_KERNEL_MAP
            && loads.iter().any(|l| {
                l.segment != text && l.segment.phys_start <= text.phys_start && text.phys_end <= l.segment.phys_end
            })
    })?;
    let text = loads.remove(index);
    debug!("kernel text load {:x?}", text);
    Some(text)
}

/// Reads the program headers and the notes of the image.
pub fn parse_header(backing: &Backing) -> Result<VmcoreHeader> {
    let (ident, phdrs) = program_headers(backing)?;
    let file_len = backing.size()?;

    let mut notes = Vec::new();
    let mut loads = Vec::new();
    for p in phdrs.iter() {
        match p.p_type {
            PT_NOTE => {
                if p.offset.checked_add(p.filesz).map_or(true, |end| end > file_len) {
                    return Err(invalid(format!(
                        "note segment at {:x} of {:x} bytes runs past the end of the image ({:x})",
                        p.offset, p.filesz, file_len
                    )));
                }
                let start = notes.len();
                notes.resize(start + p.filesz as usize, 0);
                backing.read_at(p.offset, &mut notes[start..])?;
            }
            PT_LOAD if p.memsz > 0 => {
                if p.filesz > p.memsz {
                    return Err(invalid(format!("load at {:x} has filesz > memsz", p.paddr)));
                }
                loads.push(FileLoad {
                    segment: LoadSegment::new(p.paddr, p.memsz)
                        .with_virt_start(p.vaddr)
                        .with_file_offset(p.offset),
                    file_size: p.filesz,
                });
            }
            _ => debug!("skipping program header of type {}", p.p_type),
        }
    }
    loads.sort_by_key(|l| l.segment.phys_start);
    let kernel_text = split_kernel_text(&mut loads);
    if loads.is_empty() {
        return Err(invalid("the image has no PT_LOAD segments"));
    }

    let (vmcoreinfo, nr_cpus) = scan_notes(&notes)?;
    info!(
        "vmcore: {:?}, {} loads, {} bytes of notes, {} cpus, vmcoreinfo {}",
        ident.class,
        loads.len(),
        notes.len(),
        nr_cpus,
        if vmcoreinfo.is_some() { "found" } else { "missing" }
    );

    Ok(VmcoreHeader {
        ident,
        loads,
        kernel_text,
        notes,
        vmcoreinfo,
        nr_cpus: nr_cpus.max(1),
    })
}
