/*!
Builds the dump bitmaps for one window of the page frame space.

A window is processed in a fixed order: the 1st bitmap is derived from the
load segments of the source image, copied into the 2nd bitmap, and then
pages are dropped from the 2nd bitmap by the free list walker, by the
descriptor classifier and finally by the zero page check.
*/

use std::ops::Range;

use log::{debug, info, warn};

use crate::bitmap::{Bitmap, DumpBitmaps};
use crate::cycle::{Cycle, Cycles};
use crate::error::{Error, ErrorOrigin, Result};
use crate::kernel::{
    BuddyDetect, Classifier, FreeListScanner, KernelContext, PageClass, PageLayout, Verdict, PGMM_CACHED,
};
use crate::mem::SourceMemory;
use crate::report::ExclusionCounters;
use crate::types::{roundup, DumpLevel, Pfn};

/// Returns true if every byte of the page is zero.
pub fn is_zero_page(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

/// The exclusion rules of one dump level, bound to a kernel.
pub struct PageFilter<'a> {
    kernel: &'a KernelContext,
    level: DumpLevel,
    classifier: Option<(&'a PageLayout, Classifier<'a>)>,
    scan_descriptors: bool,
    zero_pages: bool,
}

impl<'a> PageFilter<'a> {
    /// Creates the filter for `level`.
    ///
    /// With `zero_pages` set, zero filled pages are dropped from the bitmap
    /// here. Otherwise they are left for the writer to detect.
    pub fn new(kernel: &'a KernelContext, level: DumpLevel, zero_pages: bool) -> Result<Self> {
        let descriptor_levels = DumpLevel::CACHE | DumpLevel::CACHE_PRIVATE | DumpLevel::USER_DATA;

        let layout = if level.needs_page_descriptors() {
            Some(kernel.page_layout()?)
        } else {
            kernel.page_layout().ok()
        };

        let classifier = layout.map(|l| (l, Classifier::new(l, level, kernel.buddy())));
        let hwpoison = layout.map(|l| l.flags.hwpoison.is_some()).unwrap_or(false);
        let scan_descriptors = layout.is_some()
            && (level.intersects(descriptor_levels)
                || hwpoison
                || (level.contains(DumpLevel::FREE) && kernel.buddy() != BuddyDetect::None));

        if let Some((_, c)) = &classifier {
            if c.needs_free_list_walk() {
                kernel.free_area_layout()?;
            }
        }

        info!(
            "filter for dump level {}: descriptor scan {}, free list walk {}, zero pages {}",
            level,
            scan_descriptors,
            classifier.as_ref().map(|(_, c)| c.needs_free_list_walk()).unwrap_or(false),
            zero_pages && level.contains(DumpLevel::ZERO)
        );

        Ok(Self {
            kernel,
            level,
            classifier,
            scan_descriptors,
            zero_pages: zero_pages && level.contains(DumpLevel::ZERO),
        })
    }

    pub fn level(&self) -> DumpLevel {
        self.level
    }

    /// Rebuilds both bitmaps for the window of `cycle`.
    pub fn build_window<S, B>(
        &self,
        source: &mut S,
        bitmaps: &mut DumpBitmaps<B>,
        cycle: &mut Cycle,
        counters: &mut ExclusionCounters,
    ) -> Result<()>
    where
        S: SourceMemory,
        B: Bitmap,
    {
        let window = cycle.window();
        debug!("building bitmaps for window {:x}-{:x}", window.start, window.end);

        bitmaps.reset(window.clone())?;
        let shift = source.info().page_shift();
        let mut present = 0;
        for load in source.info().loads.iter() {
            let pfns = load.pfn_range(shift);
            let start = pfns.start.max(window.start);
            let end = pfns.end.min(window.end);
            if start < end {
                present += bitmaps.mark_present(start..end)?;
            }
        }
        counters.memhole += (window.end - window.start) - present;
        bitmaps.seed_second()?;

        if let Some((layout, classifier)) = &self.classifier {
            if classifier.needs_free_list_walk() {
                self.exclude_free_lists(source, bitmaps, window.clone(), counters)?;
            }
            if self.scan_descriptors {
                self.exclude_by_descriptor(layout, classifier, source, bitmaps, cycle, counters)?;
            }
        }

        if self.zero_pages {
            self.exclude_zero_pages(source, bitmaps, window, counters)?;
        }

        bitmaps.flush()
    }

    fn exclude_free_lists<S, B>(
        &self,
        source: &mut S,
        bitmaps: &mut DumpBitmaps<B>,
        window: Range<Pfn>,
        counters: &mut ExclusionCounters,
    ) -> Result<()>
    where
        S: SourceMemory,
        B: Bitmap,
    {
        let layout = self.kernel.free_area_layout()?;
        let scanner = FreeListScanner::new(layout, &self.kernel.mem_map);
        let whole_machine = window.start == 0 && window.end >= source.info().max_mapnr;

        for zone in self.kernel.zones.iter().filter(|z| z.spanned_pages != 0) {
            let stats = scanner.scan_zone(source, zone, |start, nr_pages| {
                let mut excluded = 0;
                for pfn in start.max(window.start)..(start + nr_pages).min(window.end) {
                    if bitmaps.mark_excluded(pfn)? {
                        excluded += 1;
                    }
                }
                Ok(excluded)
            })?;
            counters.free += stats.excluded;

            // the counter is only comparable when every free page was seen
            match stats.expected {
                Some(expected) if whole_machine && expected != stats.excluded => warn!(
                    "node {} zone {}: the number of free pages is different ({} counted, {} reported)",
                    zone.node, zone.index, stats.excluded, expected
                ),
                _ => (),
            }
        }
        Ok(())
    }

    fn exclude_by_descriptor<S, B>(
        &self,
        layout: &PageLayout,
        classifier: &Classifier,
        source: &mut S,
        bitmaps: &mut DumpBitmaps<B>,
        cycle: &mut Cycle,
        counters: &mut ExclusionCounters,
    ) -> Result<()>
    where
        S: SourceMemory,
        B: Bitmap,
    {
        let window = cycle.window();
        let mut skip_until = window.start;

        if let Some((_, class)) = cycle.pending() {
            let end = cycle.exclude_pfn_end;
            let inside = cycle.exclude(cycle.exclude_pfn_start.max(window.start)..end, class);
            exclude_run(bitmaps, inside, class, counters)?;
            skip_until = end;
        }

        let size_page = layout.size_page;
        let slot_len = size_page as usize;
        let mut cache = vec![0u8; (PGMM_CACHED * size_page) as usize];

        for seg in self.kernel.mem_map.mapped_overlapping(window.clone()) {
            let mem_map = match seg.mem_map {
                Some(addr) => addr,
                None => continue,
            };
            let end = seg.pfn_end.min(window.end);
            let mut batch: Range<Pfn> = 0..0;
            let mut pfn = seg.pfn_start.max(skip_until);

            while pfn < end {
                if !bitmaps.is_present(pfn)? {
                    pfn += 1;
                    continue;
                }

                let index = pfn % PGMM_CACHED;
                if !batch.contains(&pfn) {
                    let batch_end = roundup(pfn + 1, PGMM_CACHED).min(end);
                    let from = (index * size_page) as usize;
                    let to = from + ((batch_end - pfn) * size_page) as usize;
                    let vaddr = mem_map + (pfn - seg.pfn_start) * size_page;
                    source.virt_read_raw_into(vaddr, &mut cache[from..to]).map_err(|e| {
                        Error(ErrorOrigin::Classifier, e.1).log_error(format!(
                            "unable to read page descriptors of pfn {:x}-{:x} at {:x}",
                            pfn, batch_end, vaddr
                        ))
                    })?;
                    batch = pfn..batch_end;
                }

                let off = index as usize * slot_len;
                let slot = &cache[off..off + slot_len];
                // the head of a compound page needs its first tail in the batch
                let tail = if index < PGMM_CACHED - 1 && pfn + 1 < batch.end {
                    Some(&cache[off + slot_len..off + 2 * slot_len])
                } else {
                    None
                };
                let desc = layout.decode(pfn, slot, tail);

                match classifier.classify(pfn, &desc) {
                    Verdict::Keep => pfn += 1,
                    Verdict::Exclude { class, nr_pages: 1 } => {
                        if bitmaps.mark_excluded(pfn)? {
                            counters.add(class, 1);
                        }
                        pfn += 1;
                    }
                    Verdict::Exclude { class, nr_pages } => {
                        let inside = cycle.exclude(pfn..pfn + nr_pages, class);
                        exclude_run(bitmaps, inside, class, counters)?;
                        pfn += nr_pages;
                        skip_until = skip_until.max(pfn);
                    }
                }
            }
        }
        Ok(())
    }

    fn exclude_zero_pages<S, B>(
        &self,
        source: &mut S,
        bitmaps: &mut DumpBitmaps<B>,
        window: Range<Pfn>,
        counters: &mut ExclusionCounters,
    ) -> Result<()>
    where
        S: SourceMemory,
        B: Bitmap,
    {
        let mut buf = vec![0u8; source.info().page_size as usize];
        for pfn in window {
            if !bitmaps.is_keep(pfn)? {
                continue;
            }
            source.read_page(pfn, &mut buf).map_err(|e| {
                Error(ErrorOrigin::Source, e.1).log_error(format!("unable to read pfn {:x}", pfn))
            })?;
            if is_zero_page(&buf) {
                bitmaps.mark_excluded(pfn)?;
                counters.zero += 1;
            }
        }
        Ok(())
    }
}

fn exclude_run<B: Bitmap>(
    bitmaps: &mut DumpBitmaps<B>,
    pfns: Range<Pfn>,
    class: PageClass,
    counters: &mut ExclusionCounters,
) -> Result<()> {
    for pfn in pfns {
        if bitmaps.mark_excluded(pfn)? {
            counters.add(class, 1);
        }
    }
    Ok(())
}

/// Drives a [`PageFilter`] over the windows of the address space and keeps
/// the most recently built window.
///
/// Windows have to be prepared in ascending order starting at pfn 0, since
/// an exclusion may carry over from one window into the next.
pub struct BitmapBuilder<B> {
    bitmaps: DumpBitmaps<B>,
    pfn_cyclic: u64,
    max_mapnr: Pfn,
    cycle: Cycle,
    built: Option<Range<Pfn>>,
    counters: ExclusionCounters,
}

impl<B: Bitmap> BitmapBuilder<B> {
    pub fn new(bitmaps: DumpBitmaps<B>, pfn_cyclic: u64, max_mapnr: Pfn) -> Self {
        Self {
            bitmaps,
            pfn_cyclic: pfn_cyclic.min(max_mapnr).max(1),
            max_mapnr,
            cycle: Cycle::new(),
            built: None,
            counters: ExclusionCounters::new(),
        }
    }

    /// Wraps whole-machine bitmaps that were already built elsewhere.
    pub fn prebuilt(bitmaps: DumpBitmaps<B>, max_mapnr: Pfn, counters: ExclusionCounters) -> Self {
        Self {
            bitmaps,
            pfn_cyclic: max_mapnr.max(1),
            max_mapnr,
            cycle: Cycle::new(),
            built: Some(0..max_mapnr),
            counters,
        }
    }

    pub fn windows(&self) -> Cycles {
        Cycles::new(0..self.max_mapnr, self.pfn_cyclic)
    }

    pub fn is_cyclic(&self) -> bool {
        self.pfn_cyclic < self.max_mapnr
    }

    pub fn max_mapnr(&self) -> Pfn {
        self.max_mapnr
    }

    /// Counters of the last complete pass.
    pub fn counters(&self) -> ExclusionCounters {
        self.counters
    }

    pub fn bitmaps(&mut self) -> &mut DumpBitmaps<B> {
        &mut self.bitmaps
    }

    /// Makes the bitmaps describe `window`, rebuilding them if needed.
    pub fn prepare<S: SourceMemory>(
        &mut self,
        filter: &PageFilter,
        source: &mut S,
        window: Range<Pfn>,
    ) -> Result<&mut DumpBitmaps<B>> {
        if self.built.as_ref() != Some(&window) {
            if window.start == 0 {
                self.cycle.clear();
                self.counters = ExclusionCounters::new();
            }
            self.built = None;
            self.cycle.enter(window.clone());
            filter.build_window(source, &mut self.bitmaps, &mut self.cycle, &mut self.counters)?;
            self.built = Some(window);
        }
        Ok(&mut self.bitmaps)
    }

    /// Runs `body` for every window in order, with the bitmaps of that window.
    pub fn for_each_window<S, F>(&mut self, filter: &PageFilter, source: &mut S, mut body: F) -> Result<()>
    where
        S: SourceMemory,
        F: FnMut(&mut S, &mut DumpBitmaps<B>, Range<Pfn>) -> Result<()>,
    {
        for window in self.windows() {
            self.prepare(filter, source, window.clone())?;
            body(source, &mut self.bitmaps, window)?;
        }
        Ok(())
    }

    /// Number of kept pages in `range`.
    pub fn count_dumpable<S: SourceMemory>(
        &mut self,
        filter: &PageFilter,
        source: &mut S,
        range: Range<Pfn>,
    ) -> Result<u64> {
        let mut dumpable = 0;
        self.for_each_window(filter, source, |_, bitmaps, window| {
            for pfn in window.start.max(range.start)..window.end.min(range.end) {
                if bitmaps.is_keep(pfn)? {
                    dumpable += 1;
                }
            }
            Ok(())
        })?;
        Ok(dumpable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::CyclicBitmap;
    use crate::mem::dummy::DummyKernel;

    fn builder(max_mapnr: Pfn, pfn_cyclic: u64) -> BitmapBuilder<CyclicBitmap> {
        BitmapBuilder::new(
            DumpBitmaps::new(CyclicBitmap::new(pfn_cyclic), CyclicBitmap::new(pfn_cyclic)),
            pfn_cyclic,
            max_mapnr,
        )
    }

    #[test]
    fn zero_page_predicate() {
        assert!(is_zero_page(&[0u8; 4096]));
        let mut page = [0u8; 4096];
        page[4095] = 1;
        assert!(!is_zero_page(&page));
    }

    #[test]
    fn holes_are_counted() {
        let mut dummy = DummyKernel::builder(0x400).hole(0x100..0x180).build();
        let kernel = dummy.kernel().clone();
        let filter = PageFilter::new(&kernel, DumpLevel::empty(), false).unwrap();
        let mut b = builder(dummy.info().max_mapnr, 0x80);
        let dumpable = b.count_dumpable(&filter, &mut dummy, 0..0x400).unwrap();
        assert_eq!(b.counters().memhole, 0x80);
        assert_eq!(dumpable, 0x380);
    }

    #[test]
    fn pending_run_continues_in_next_window() {
        let mut dummy = DummyKernel::builder(0x400).buddy_block(0x40, 6).build();
        let kernel = dummy.kernel().clone();
        let filter = PageFilter::new(&kernel, DumpLevel::FREE, false).unwrap();
        // 0x40..0x80 straddles the 0x60 window boundary
        let mut b = builder(dummy.info().max_mapnr, 0x20);
        let dumpable = b.count_dumpable(&filter, &mut dummy, 0..0x400).unwrap();
        assert_eq!(b.counters().free, 0x40);
        assert_eq!(dumpable, 0x400 - 0x40);
    }

    #[test]
    fn missing_page_layout_is_fatal_for_cache_levels() {
        let kernel = KernelContext::new(Default::default(), Default::default(), vec![]);
        assert!(PageFilter::new(&kernel, DumpLevel::CACHE, false).is_err());
        assert!(PageFilter::new(&kernel, DumpLevel::ZERO, false).is_ok());
    }
}
