use std::fs::File;
use std::io::Write;
use std::path::Path;

use dataview::PodMethods;

use kdumpflow_core::dump::elf::{Elf64Ehdr, Elf64Phdr, ElfNhdr, ELFCLASS64, ELFMAG, ET_CORE, PT_LOAD, PT_NOTE};
use kdumpflow_core::mem::{ELFDATA2LSB, EM_X86_64};
use kdumpflow_core::*;
use kdumpflow_vmcore::elf::NT_PRSTATUS;
use kdumpflow_vmcore::vmcore::{DEFAULT_PAGE_OFFSET, START_KERNEL_MAP};
use kdumpflow_vmcore::{open, MemoryModel, Vmcore};

const PAGE: usize = 0x1000;
const PAGES: usize = 0x400;
/// Pages at the end of memory that are not backed by the file.
const UNBACKED: usize = 0x10;
const DATA_OFFSET: u64 = 0x1000;

const PGD: usize = 0x20_0000;
const VMALLOC: u64 = 0xffff_c900_0000_0000;
const VMALLOC_PHYS: usize = 0x30_0000;
const VMEMMAP: u64 = 0xffff_ea00_0000_0000;
const SECTION3_MEM_MAP: u64 = 0xffff_ea00_0010_0000;
const MEM_SECTION: usize = 0x25_0000;
const PGDAT: usize = 0x26_0000;
const UTS_NS: usize = 0x11_0000;

fn put_u64(mem: &mut [u8], at: usize, value: u64) {
    mem[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn entry_index(vaddr: u64, level: u32) -> usize {
    ((vaddr >> (12 + 9 * (level - 1))) & 0x1ff) as usize
}

/// Physical memory of a small machine with page tables, sections, a node
/// and a utsname.
fn physical_memory() -> Vec<u8> {
    let mut mem = vec![0u8; PAGES * PAGE];
    for pfn in 0..0x100 {
        mem[pfn * PAGE..(pfn + 1) * PAGE].fill(pfn as u8 | 1);
    }

    // one 4k mapping of VMALLOC
    put_u64(&mut mem, PGD + entry_index(VMALLOC, 4) * 8, 0x20_1000 | 1);
    put_u64(&mut mem, 0x20_1000 + entry_index(VMALLOC, 3) * 8, 0x20_2000 | 1);
    put_u64(&mut mem, 0x20_2000 + entry_index(VMALLOC, 2) * 8, 0x20_3000 | 1);
    put_u64(&mut mem, 0x20_3000 + entry_index(VMALLOC, 1) * 8, VMALLOC_PHYS as u64 | 1);
    mem[VMALLOC_PHYS..VMALLOC_PHYS + 15].copy_from_slice(b"behind a walk!!");

    // SPARSEMEM_EXTREME: one root of 16 byte sections, 256 pages each
    put_u64(&mut mem, MEM_SECTION, DEFAULT_PAGE_OFFSET + MEM_SECTION as u64 + 0x1000);
    let sections = MEM_SECTION + 0x1000;
    put_u64(&mut mem, sections, VMEMMAP | 3);
    put_u64(&mut mem, sections + 16, VMEMMAP | 3);
    put_u64(&mut mem, sections + 48, (SECTION3_MEM_MAP - 0x300 * 64) | 3);

    // contig_page_data with two zones, one of them empty
    put_u64(&mut mem, PGDAT + 8, PAGES as u64);
    mem[PGDAT + 0x800..PGDAT + 0x804].copy_from_slice(&2u32.to_le_bytes());

    let name = UTS_NS + 4;
    mem[name..name + 5].copy_from_slice(b"Linux");
    mem[name + 65..name + 73].copy_from_slice(b"crashbox");
    mem[name + 130..name + 140].copy_from_slice(b"6.1.0-test");
    mem
}

fn vmcoreinfo() -> String {
    [
        "OSRELEASE=6.1.0-test".to_string(),
        "PAGESIZE=4096".to_string(),
        format!("SYMBOL(init_top_pgt)={:x}", START_KERNEL_MAP + PGD as u64),
        format!("SYMBOL(mem_section)={:x}", DEFAULT_PAGE_OFFSET + MEM_SECTION as u64),
        "LENGTH(mem_section)=4".to_string(),
        "SIZE(mem_section)=16".to_string(),
        "OFFSET(mem_section.section_mem_map)=0".to_string(),
        "NUMBER(SECTION_SIZE_BITS)=20".to_string(),
        "NUMBER(MAX_PHYSMEM_BITS)=30".to_string(),
        "SIZE(page)=64".to_string(),
        format!("SYMBOL(contig_page_data)={:x}", DEFAULT_PAGE_OFFSET + PGDAT as u64),
        "OFFSET(pglist_data.node_zones)=0".to_string(),
        "SIZE(zone)=256".to_string(),
        "OFFSET(zone.spanned_pages)=8".to_string(),
        "OFFSET(pglist_data.nr_zones)=2048".to_string(),
        format!("SYMBOL(init_uts_ns)={:x}", START_KERNEL_MAP + UTS_NS as u64),
        "OFFSET(uts_namespace.name)=4".to_string(),
    ]
    .join("\n")
        + "\n"
}

fn note(name: &[u8], n_type: u32, desc: &[u8]) -> Vec<u8> {
    let nhdr = ElfNhdr {
        n_namesz: name.len() as u32 + 1,
        n_descsz: desc.len() as u32,
        n_type,
    };
    let mut out = nhdr.as_bytes().to_vec();
    out.extend_from_slice(name);
    out.push(0);
    out.resize((out.len() + 3) & !3, 0);
    out.extend_from_slice(desc);
    out.resize((out.len() + 3) & !3, 0);
    out
}

fn write_vmcore(path: &Path, mem: &[u8]) {
    let mut notes = note(b"CORE", NT_PRSTATUS, &[0xa5; 336]);
    notes.extend(note(b"VMCOREINFO", 0, vmcoreinfo().as_bytes()));

    let ehdr_len = std::mem::size_of::<Elf64Ehdr>();
    let phdr_len = std::mem::size_of::<Elf64Phdr>();
    let notes_offset = (ehdr_len + 3 * phdr_len) as u64;
    assert!(notes_offset + notes.len() as u64 <= DATA_OFFSET);

    let mut ehdr = Elf64Ehdr::default();
    ehdr.e_ident[..4].copy_from_slice(&ELFMAG);
    ehdr.e_ident[4] = ELFCLASS64;
    ehdr.e_ident[5] = ELFDATA2LSB;
    ehdr.e_ident[6] = 1;
    ehdr.e_type = ET_CORE;
    ehdr.e_machine = EM_X86_64;
    ehdr.e_version = 1;
    ehdr.e_phoff = ehdr_len as u64;
    ehdr.e_ehsize = ehdr_len as u16;
    ehdr.e_phentsize = phdr_len as u16;
    ehdr.e_phnum = 3;

    let note_phdr = Elf64Phdr {
        p_type: PT_NOTE,
        p_offset: notes_offset,
        p_filesz: notes.len() as u64,
        p_memsz: notes.len() as u64,
        ..Default::default()
    };
    // the kernel text repeats physical memory at __START_KERNEL_map
    let text_phdr = Elf64Phdr {
        p_type: PT_LOAD,
        p_offset: DATA_OFFSET + 0x10_0000,
        p_vaddr: START_KERNEL_MAP + 0x10_0000,
        p_paddr: 0x10_0000,
        p_filesz: 0x2_0000,
        p_memsz: 0x2_0000,
        ..Default::default()
    };
    let ram_phdr = Elf64Phdr {
        p_type: PT_LOAD,
        p_offset: DATA_OFFSET,
        p_vaddr: DEFAULT_PAGE_OFFSET,
        p_paddr: 0,
        p_filesz: ((PAGES - UNBACKED) * PAGE) as u64,
        p_memsz: (PAGES * PAGE) as u64,
        ..Default::default()
    };

    let mut file = File::create(path).unwrap();
    file.write_all(ehdr.as_bytes()).unwrap();
    for phdr in [note_phdr, text_phdr, ram_phdr].iter() {
        file.write_all(phdr.as_bytes()).unwrap();
    }
    file.write_all(&notes).unwrap();
    let pad = DATA_OFFSET as usize - notes_offset as usize - notes.len();
    file.write_all(&vec![0u8; pad]).unwrap();
    file.write_all(&mem[..(PAGES - UNBACKED) * PAGE]).unwrap();
}

fn fixture() -> (tempfile::TempDir, Vec<u8>) {
    let dir = tempfile::tempdir().unwrap();
    let mem = physical_memory();
    write_vmcore(&dir.path().join("vmcore"), &mem);
    (dir, mem)
}

#[test]
fn image_is_parsed() {
    let (dir, _) = fixture();
    let vmcore = Vmcore::open(dir.path().join("vmcore")).unwrap();
    let info = vmcore.info();
    assert_eq!(info.page_size, PAGE as u64);
    assert_eq!(info.max_mapnr, PAGES as u64);
    assert_eq!(info.nr_cpus, 1);
    assert_eq!(info.loads.len(), 1);
    assert_eq!(vmcore.kernel_text().unwrap().segment.phys_start, 0x10_0000);
    assert!(vmcore.vmcoreinfo_text().unwrap().starts_with("OSRELEASE=6.1.0-test\n"));
}

#[test]
fn kernel_context_is_read() {
    let (dir, _) = fixture();
    let (vmcore, kernel) = open(dir.path().join("vmcore")).unwrap();

    let translation = vmcore.translation();
    assert_eq!(translation.phys_base, 0);
    assert_eq!(translation.page_offset, DEFAULT_PAGE_OFFSET);
    assert_eq!(translation.pgd, Some(PGD as u64));

    let table = kdumpflow_vmcore::layout_table(&vmcore).unwrap();
    assert_eq!(kdumpflow_vmcore::memory_model::detect(&table).unwrap(), MemoryModel::SparsememExtreme);
    let segments = kernel
        .mem_map
        .iter()
        .map(|s| (s.pfn_start, s.pfn_end, s.mem_map))
        .collect::<Vec<_>>();
    assert_eq!(
        segments,
        vec![
            (0, 0x200, Some(VMEMMAP)),
            (0x200, 0x300, None),
            (0x300, 0x400, Some(SECTION3_MEM_MAP)),
        ]
    );

    assert_eq!(kernel.zones.len(), 1);
    assert_eq!(kernel.zones[0].spanned_pages, PAGES as u64);
    assert_eq!(kernel.zones[0].address, DEFAULT_PAGE_OFFSET + PGDAT as u64);

    assert_eq!(Utsname::field_str(&kernel.utsname.sysname), "Linux");
    assert_eq!(Utsname::field_str(&kernel.utsname.nodename), "crashbox");
    assert_eq!(Utsname::field_str(&kernel.utsname.release), "6.1.0-test");
}

#[test]
fn reads_follow_loads_and_page_tables() {
    let (dir, mem) = fixture();
    let (mut vmcore, _) = open(dir.path().join("vmcore")).unwrap();

    let mut buf = vec![0u8; 3 * PAGE];
    vmcore.phys_read_raw_into(0x80 * PAGE as u64, &mut buf).unwrap();
    assert_eq!(&buf[..], &mem[0x80 * PAGE..0x83 * PAGE]);

    // past the file size of the load
    let mut buf = vec![0xffu8; 2 * PAGE];
    vmcore.phys_read_raw_into(((PAGES - 2) * PAGE) as u64, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));

    let mut buf = [0u8; 15];
    vmcore.virt_read_raw_into(VMALLOC, &mut buf).unwrap();
    assert_eq!(&buf, b"behind a walk!!");
    assert_eq!(vmcore.virt_to_phys(VMALLOC + 0x123).unwrap(), VMALLOC_PHYS as u64 + 0x123);
    assert_eq!(vmcore.virt_to_phys(START_KERNEL_MAP + 0x10_0001).unwrap(), 0x10_0001);
    assert!(vmcore.virt_to_phys(VMALLOC + PAGE as u64).is_err());

    assert!(vmcore.phys_read_raw_into((PAGES * PAGE) as u64, &mut buf).is_err());
}

#[test]
fn reopened_image_reads_the_same() {
    let (dir, mem) = fixture();
    let (vmcore, _) = open(dir.path().join("vmcore")).unwrap();
    let mut copy = vmcore.reopen().unwrap();

    let mut buf = [0u8; 15];
    copy.virt_read_raw_into(VMALLOC, &mut buf).unwrap();
    assert_eq!(&buf, b"behind a walk!!");
    let mut page = vec![0u8; PAGE];
    copy.read_page(0x42, &mut page).unwrap();
    assert_eq!(&page[..], &mem[0x42 * PAGE..0x43 * PAGE]);
}

#[test]
fn unmapped_file_is_read_on_demand() {
    let (dir, mem) = fixture();
    let mut vmcore = Vmcore::open(dir.path().join("vmcore")).unwrap();
    let mut page = vec![0u8; PAGE];
    vmcore.read_page(0x10, &mut page).unwrap();
    assert_eq!(&page[..], &mem[0x10 * PAGE..0x11 * PAGE]);
}

#[test]
fn dump_without_zero_pages() {
    let (dir, mem) = fixture();
    let (mut vmcore, kernel) = open(dir.path().join("vmcore")).unwrap();

    let config = DumpConfig::new().with_codecs(&[Codec::Zlib]).with_dump_levels(&[1]);
    let mut target = FileTarget::new(dir.path().join("dumpfile"));
    let report = Dumper::new(&kernel, &config)
        .unwrap()
        .create(&mut vmcore, &mut target)
        .unwrap();

    let zero = (0..PAGES)
        .filter(|&pfn| mem[pfn * PAGE..(pfn + 1) * PAGE].iter().all(|&b| b == 0))
        .count() as u64;
    assert_eq!(report.counters.zero, zero);
    assert_eq!(report.counters.memhole, 0);

    let mut reader = KdumpReader::new(File::open(target.path()).unwrap()).unwrap();
    assert_eq!(reader.max_mapnr(), PAGES as u64);
    assert_eq!(reader.vmcoreinfo().unwrap(), vmcoreinfo().into_bytes());
    for pfn in 0..PAGES {
        let expected = &mem[pfn * PAGE..(pfn + 1) * PAGE];
        match reader.read_page(pfn as u64).unwrap() {
            Some(page) => assert_eq!(&page[..], expected, "pfn {:x}", pfn),
            None => assert!(expected.iter().all(|&b| b == 0), "pfn {:x}", pfn),
        }
    }
}
