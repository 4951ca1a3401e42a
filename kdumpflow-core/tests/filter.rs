use kdumpflow_core::bitmap::{Bitmap, BitmapStore, CyclicBitmap, DumpBitmaps};
use kdumpflow_core::mem::dummy::DummyKernel;
use kdumpflow_core::*;

fn machine() -> DummyKernel {
    DummyKernel::builder(0x1000)
        .hole(0x200..0x280)
        .unmapped(0x600..0x640)
        .zero_pages(0x100..0x120)
        .cache_pages(0x300..0x340)
        .private_cache_pages(0x340..0x350)
        .anon_pages(0x400..0x440)
        .slab_pages(0x480..0x490)
        .hwpoison(0x500)
        .huge_page(0x800, 4)
        .compound_cache(0x900, 3)
        .buddy_block(0xa00, 6)
        // crosses the 0xc60 window boundary
        .buddy_block(0xc40, 6)
        .buddy_block(0xe01, 2)
        .build()
}

fn cyclic_builder(pfn_cyclic: u64, max_mapnr: Pfn) -> BitmapBuilder<CyclicBitmap> {
    BitmapBuilder::new(
        DumpBitmaps::new(CyclicBitmap::new(pfn_cyclic), CyclicBitmap::new(pfn_cyclic)),
        pfn_cyclic,
        max_mapnr,
    )
}

/// Bits of the 2nd bitmap over the whole machine, window by window.
fn second_bitmap<S: SourceMemory, B: Bitmap>(
    builder: &mut BitmapBuilder<B>,
    filter: &PageFilter,
    source: &mut S,
) -> Vec<bool> {
    let mut bits = Vec::new();
    builder
        .for_each_window(filter, source, |_, bitmaps, window| {
            for pfn in window {
                bits.push(bitmaps.is_keep(pfn)?);
            }
            Ok(())
        })
        .unwrap();
    bits
}

#[test]
fn every_frame_is_accounted_once() {
    let mut dummy = machine();
    let kernel = dummy.kernel().clone();
    let max_mapnr = dummy.info().max_mapnr;

    for level in [0u32, 1, 2, 4, 8, 16, 31] {
        let level = DumpLevel::from_level(level).unwrap();
        let filter = PageFilter::new(&kernel, level, true).unwrap();
        let mut builder = cyclic_builder(0x100, max_mapnr);
        let kept = builder.count_dumpable(&filter, &mut dummy, 0..max_mapnr).unwrap();
        let c = builder.counters();
        assert_eq!(kept + c.excluded() + c.memhole, max_mapnr, "dump level {}", level);
        assert_eq!(c.memhole, 0x80);
    }
}

#[test]
fn cyclic_and_full_bitmaps_are_identical() {
    for mut dummy in [
        machine(),
        DummyKernel::builder(0x1000)
            .without_buddy_detection()
            .buddy_block(0xc40, 6)
            .buddy_block(0x400, 3)
            .cache_pages(0x10..0x30)
            .build(),
    ] {
        let kernel = dummy.kernel().clone();
        let info = dummy.info().clone();
        let filter = PageFilter::new(&kernel, DumpLevel::all(), true).unwrap();

        let store = BitmapStore::new(info.max_mapnr, info.page_size).unwrap();
        let mut full = BitmapBuilder::new(store.bitmaps().unwrap(), info.max_mapnr, info.max_mapnr);
        assert!(!full.is_cyclic());
        let full_bits = second_bitmap(&mut full, &filter, &mut dummy);

        let mut cyclic = cyclic_builder(0x60, info.max_mapnr);
        assert!(cyclic.is_cyclic());
        let cyclic_bits = second_bitmap(&mut cyclic, &filter, &mut dummy);

        assert_eq!(full_bits.len() as u64, info.max_mapnr);
        assert_eq!(full_bits, cyclic_bits);
        assert_eq!(full.counters(), cyclic.counters());
    }
}

#[test]
fn free_run_alignment() {
    let mut dummy = DummyKernel::builder(0x200).buddy_block(0x40, 3).build();
    let kernel = dummy.kernel().clone();
    let filter = PageFilter::new(&kernel, DumpLevel::FREE, false).unwrap();
    let mut builder = cyclic_builder(0x200, 0x200);
    let bits = second_bitmap(&mut builder, &filter, &mut dummy);
    assert_eq!(builder.counters().free, 8);
    assert!((0x40..0x48).all(|pfn| !bits[pfn]));
    assert!(bits[0x48]);

    // a misaligned head is trusted for one page only
    let mut dummy = DummyKernel::builder(0x200).buddy_block(0x41, 3).build();
    let kernel = dummy.kernel().clone();
    let filter = PageFilter::new(&kernel, DumpLevel::FREE, false).unwrap();
    let mut builder = cyclic_builder(0x200, 0x200);
    let bits = second_bitmap(&mut builder, &filter, &mut dummy);
    assert_eq!(builder.counters().free, 1);
    assert!(!bits[0x41]);
    assert!(bits[0x42]);
}

#[test]
fn repeated_passes_agree() {
    let mut dummy = machine();
    let kernel = dummy.kernel().clone();
    let max_mapnr = dummy.info().max_mapnr;
    let filter = PageFilter::new(&kernel, DumpLevel::all(), true).unwrap();
    let mut builder = cyclic_builder(0x100, max_mapnr);

    let first = second_bitmap(&mut builder, &filter, &mut dummy);
    let counters = builder.counters();
    let second = second_bitmap(&mut builder, &filter, &mut dummy);
    assert_eq!(first, second);
    assert_eq!(builder.counters(), counters);
}

#[test]
fn broken_free_list_aborts() {
    let mut dummy = DummyKernel::builder(0x200)
        .without_buddy_detection()
        .buddy_block(0x40, 2)
        .broken_free_list()
        .build();
    let kernel = dummy.kernel().clone();
    let filter = PageFilter::new(&kernel, DumpLevel::FREE, false).unwrap();
    let mut builder = cyclic_builder(0x200, 0x200);
    let err = builder.count_dumpable(&filter, &mut dummy, 0..0x200).unwrap_err();
    assert_eq!(err.1, ErrorKind::BrokenFreeList);
}

#[test]
fn order_9_runs_span_many_windows() {
    for mut dummy in [
        DummyKernel::builder(0x1000)
            .buddy_block(0x200, 9)
            .huge_page(0x600, 9)
            .build(),
        DummyKernel::builder(0x1000)
            .without_buddy_detection()
            .buddy_block(0x200, 9)
            .huge_page(0x600, 9)
            .build(),
    ] {
        let kernel = dummy.kernel().clone();
        let info = dummy.info().clone();
        let filter = PageFilter::new(&kernel, DumpLevel::all(), true).unwrap();

        let store = BitmapStore::new(info.max_mapnr, info.page_size).unwrap();
        let mut full = BitmapBuilder::new(store.bitmaps().unwrap(), info.max_mapnr, info.max_mapnr);
        let full_bits = second_bitmap(&mut full, &filter, &mut dummy);

        let mut cyclic = cyclic_builder(0x28, info.max_mapnr);
        let cyclic_bits = second_bitmap(&mut cyclic, &filter, &mut dummy);

        assert_eq!(full_bits, cyclic_bits);
        assert_eq!(full.counters(), cyclic.counters());
        assert_eq!(cyclic.counters().free, 512);
        assert!((0x200..0x400).all(|pfn| !cyclic_bits[pfn]));
        assert!((0x600..0x800).all(|pfn| !cyclic_bits[pfn]));
        assert!(cyclic_bits[0x400] && cyclic_bits[0x800]);
    }
}

/// Records the page descriptors every virtual read touches.
struct DescriptorReads {
    inner: DummyKernel,
    reads: Vec<(Pfn, Pfn)>,
}

impl SourceMemory for DescriptorReads {
    fn info(&self) -> &ImageInfo {
        self.inner.info()
    }

    fn phys_read_raw_into(&mut self, paddr: u64, out: &mut [u8]) -> Result<()> {
        self.inner.phys_read_raw_into(paddr, out)
    }

    fn virt_read_raw_into(&mut self, vaddr: u64, out: &mut [u8]) -> Result<()> {
        let base = DummyKernel::page_descriptor_address(0);
        let size = DummyKernel::page_descriptor_address(1) - base;
        let end = DummyKernel::page_descriptor_address(self.inner.info().max_mapnr);
        if vaddr >= base && vaddr < end && !out.is_empty() {
            let last = vaddr + out.len() as u64 - 1;
            self.reads.push(((vaddr - base) / size, (last - base) / size));
        }
        self.inner.virt_read_raw_into(vaddr, out)
    }
}

#[test]
fn descriptor_batches_stay_in_their_window() {
    let mut source = DescriptorReads {
        inner: machine(),
        reads: Vec::new(),
    };
    let kernel = source.inner.kernel().clone();
    let max_mapnr = source.info().max_mapnr;
    let filter = PageFilter::new(&kernel, DumpLevel::all(), true).unwrap();

    let mut builder = cyclic_builder(0x60, max_mapnr);
    second_bitmap(&mut builder, &filter, &mut source);

    assert!(!source.reads.is_empty());
    for &(first, last) in source.reads.iter() {
        assert_eq!(first / 0x60, last / 0x60, "descriptors {:x}-{:x}", first, last);
    }
}
