use std::fs::File;
use std::io::Cursor;

use kdumpflow_core::mem::dummy::DummyKernel;
use kdumpflow_core::*;

fn machine() -> DummyKernel {
    DummyKernel::builder(0x400)
        .compressible(0..0x80)
        .zero_pages(0x100..0x108)
        .zero_pages(0x2f0..0x300)
        .cache_pages(0x180..0x1c0)
        .hole(0x340..0x360)
        .build()
}

fn assert_same_pages<R: std::io::Read + std::io::Seek>(reader: &mut KdumpReader<R>, dummy: &DummyKernel) {
    for pfn in 0..reader.max_mapnr() {
        let kept = reader.is_dumpable(pfn);
        match reader.read_page(pfn).unwrap() {
            Some(page) => assert_eq!(&page[..], dummy.page(pfn), "pfn {:x}", pfn),
            None => assert!(!kept, "pfn {:x}", pfn),
        }
    }
}

#[test]
fn flattened_stream_is_rearranged() {
    let mut dummy = machine();
    let kernel = dummy.kernel().clone();
    let config = DumpConfig::new()
        .with_codecs(&[Codec::Zlib])
        .with_dump_levels(&[3])
        .with_flatten(true);

    let mut stream: Vec<u8> = Vec::new();
    let mut target = StreamTarget::new(&mut stream);
    Dumper::new(&kernel, &config)
        .unwrap()
        .create(&mut dummy, &mut target)
        .unwrap();

    let mut file: Vec<u8> = Vec::new();
    let records = rearrange(Cursor::new(&stream), &mut file).unwrap();
    assert!(records > 0);

    let mut reader = KdumpReader::new(Cursor::new(file)).unwrap();
    assert_eq!(reader.sub_header().dump_level, 3);
    assert_same_pages(&mut reader, &dummy);

    // the same dump written directly stores the same descriptors
    let config = config.with_flatten(false);
    let dir = tempfile::tempdir().unwrap();
    let mut target = FileTarget::new(dir.path().join("direct"));
    Dumper::new(&kernel, &config)
        .unwrap()
        .create(&mut dummy, &mut target)
        .unwrap();
    let mut direct = KdumpReader::new(File::open(target.path()).unwrap()).unwrap();
    assert_eq!(direct.num_dumpable(), reader.num_dumpable());
    for index in 0..reader.num_dumpable() {
        assert_eq!(direct.page_desc_at(index).unwrap(), reader.page_desc_at(index).unwrap());
    }
}

#[test]
fn truncated_stream_is_an_error() {
    let mut dummy = machine();
    let kernel = dummy.kernel().clone();
    let config = DumpConfig::new().with_dump_levels(&[1]).with_flatten(true);
    let mut stream: Vec<u8> = Vec::new();
    Dumper::new(&kernel, &config)
        .unwrap()
        .create(&mut dummy, &mut StreamTarget::new(&mut stream))
        .unwrap();

    stream.truncate(stream.len() / 2);
    let mut file: Vec<u8> = Vec::new();
    assert!(rearrange(Cursor::new(&stream), &mut file).is_err());
}

fn split_and_reassemble(mode: CyclicMode) {
    let mut dummy = machine();
    let kernel = dummy.kernel().clone();
    let dir = tempfile::tempdir().unwrap();
    let mut targets = (0..3)
        .map(|i| FileTarget::new(dir.path().join(format!("dumpfile.{}", i))))
        .collect::<Vec<_>>();
    let config = DumpConfig::new()
        .with_codecs(&[Codec::Zlib])
        .with_dump_levels(&[3])
        .with_cyclic(mode)
        .with_split(targets.iter().map(|t| t.path().to_path_buf()).collect());

    let report = Dumper::new(&kernel, &config)
        .unwrap()
        .create_split(&mut dummy, &mut targets)
        .unwrap();
    assert_eq!(report.counters.zero, 0x18);
    assert_eq!(report.counters.cache, 0x40);
    assert_eq!(report.counters.memhole, 0x20);

    let open = |targets: &[FileTarget]| {
        targets
            .iter()
            .map(|t| KdumpReader::new(File::open(t.path()).unwrap()).unwrap())
            .collect::<Vec<_>>()
    };

    let parts = open(&targets);
    let mut expected = 0;
    for part in parts.iter() {
        assert_eq!(part.sub_header().split, 1);
        assert_eq!(part.pfn_range().start, expected);
        expected = part.pfn_range().end;
    }
    assert_eq!(expected, 0x400);
    let stored: u64 = parts.iter().map(|p| p.num_dumpable()).sum();

    let mut merged: Vec<u8> = Vec::new();
    let total = reassemble(parts, &mut merged).unwrap();
    assert_eq!(total, stored);

    let mut reader = KdumpReader::new(Cursor::new(merged)).unwrap();
    assert_eq!(reader.sub_header().split, 0);
    assert_eq!(reader.pfn_range(), 0..0x400);
    assert_eq!(reader.num_dumpable(), total);
    assert_same_pages(&mut reader, &dummy);

    let zero = reader.offset_zero_page().unwrap();
    for pfn in (0x100..0x108).chain(0x2f0..0x300) {
        assert_eq!(reader.page_desc(pfn).unwrap().unwrap().offset as u64, zero);
    }

    // without the middle file the parts leave a gap
    let mut parts = open(&targets);
    parts.remove(1);
    let err = reassemble(parts, &mut Vec::<u8>::new()).unwrap_err();
    assert_eq!(err.1, ErrorKind::NotContiguous);
}

#[test]
fn split_with_full_bitmaps() {
    split_and_reassemble(CyclicMode::Full);
}

#[test]
fn split_with_cyclic_bitmaps() {
    split_and_reassemble(CyclicMode::Window(0x80));
}

#[test]
fn split_needs_two_files() {
    let mut dummy = machine();
    let kernel = dummy.kernel().clone();
    let dir = tempfile::tempdir().unwrap();
    let mut targets = vec![FileTarget::new(dir.path().join("only"))];
    let config = DumpConfig::new();
    assert!(Dumper::new(&kernel, &config)
        .unwrap()
        .create_split(&mut dummy, &mut targets)
        .is_err());
}
