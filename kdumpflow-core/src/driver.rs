/*!
Runs a whole dump: picks the bitmap strategy and the writer, and falls back
to the next dump level when the output runs out of space.
*/

use std::fs;
use std::io::{self, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};

use crate::bitmap::{Bitmap, BitmapStore, CyclicBitmap, DumpBitmaps};
use crate::config::{BitmapMode, DumpConfig, DumpFormat};
use crate::dump::{DumpSink, ElfWriter, EraseFilter, FileSink, FlatSink, KdumpStats, KdumpWriter, PageCompressor};
use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::filter::{BitmapBuilder, PageFilter};
use crate::kernel::KernelContext;
use crate::mem::{ImageInfo, ReopenSource, SourceMemory};
use crate::report::DumpReport;
use crate::split::{run_workers, split_by_dumpable, split_by_pfn};
use crate::types::{DumpLevel, Pfn};

/// Where a dump is written to.
///
/// A target can be created again after it was discarded, which is how a
/// retry at another dump level starts over.
pub trait DumpTarget {
    type Sink: DumpSink;

    fn create(&mut self) -> Result<Self::Sink>;

    /// Throws away whatever was written by the last sink.
    fn discard(&mut self) -> Result<()>;
}

/// A dump file at a path.
#[derive(Clone, Debug)]
pub struct FileTarget {
    path: PathBuf,
}

impl FileTarget {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DumpTarget for FileTarget {
    type Sink = FileSink;

    fn create(&mut self) -> Result<FileSink> {
        FileSink::create(&self.path)
    }

    fn discard(&mut self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from_io(ErrorOrigin::DumpFile, ErrorKind::UnableToDeleteFile, &e)
                .log_error(format!("{}: {}", self.path.display(), e))),
        }
    }
}

/// A dump in the flattened format written to a stream, e.g. standard output.
///
/// A stream can only be written once.
pub struct StreamTarget<W> {
    out: Option<W>,
}

impl<W: Write> StreamTarget<W> {
    pub fn new(out: W) -> Self {
        Self { out: Some(out) }
    }
}

impl<W: Write> DumpTarget for StreamTarget<W> {
    type Sink = FlatSink<W>;

    fn create(&mut self) -> Result<FlatSink<W>> {
        let out = self.out.take().ok_or_else(|| {
            Error(ErrorOrigin::Flattened, ErrorKind::NotSupported).log_error("the output stream was already used")
        })?;
        FlatSink::new(out)
    }

    fn discard(&mut self) -> Result<()> {
        Err(Error(ErrorOrigin::Flattened, ErrorKind::NotSupported)
            .log_error("a partially written stream cannot be discarded"))
    }
}

fn now() -> (i64, i64) {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_secs() as i64, d.subsec_micros() as i64))
        .unwrap_or_default()
}

/// Dumps one crashed kernel according to a [`DumpConfig`].
pub struct Dumper<'a> {
    kernel: &'a KernelContext,
    config: &'a DumpConfig,
}

impl<'a> Dumper<'a> {
    pub fn new(kernel: &'a KernelContext, config: &'a DumpConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { kernel, config })
    }

    /// Tries the dump levels in order until one fits into `ctx`.
    ///
    /// Only running out of space moves on to the next level. The partial
    /// output is discarded before every retry.
    fn with_fallback<X: ?Sized, F, D>(&self, ctx: &mut X, mut attempt: F, mut discard: D) -> Result<DumpReport>
    where
        F: FnMut(&mut X, DumpLevel) -> Result<DumpReport>,
        D: FnMut(&mut X) -> Result<()>,
    {
        let mut levels = self.config.dump_level_list()?;
        loop {
            let level = levels.current();
            match attempt(ctx, level) {
                Ok(report) => {
                    info!("dump written at dump level {}", level);
                    return Ok(report);
                }
                Err(e) if e.is_no_space() => {
                    discard(ctx)?;
                    match levels.advance() {
                        Some(next) => warn!("no space left at dump level {}, retrying with {}", level, next),
                        None => {
                            return Err(Error(e.0, ErrorKind::NoSpace)
                                .log_error(format!("no space left at the last dump level {}", level)))
                        }
                    }
                }
                Err(e) => {
                    if let Err(d) = discard(ctx) {
                        warn!("unable to discard the partial dump: {}", d);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Writes the dump to `target`.
    pub fn create<S, T>(&self, source: &mut S, target: &mut T) -> Result<DumpReport>
    where
        S: SourceMemory,
        T: DumpTarget,
    {
        let erase = self.config.erase_filter(self.kernel, source)?;
        self.with_fallback(
            target,
            |target, level| {
                let max_mapnr = source.info().max_mapnr;
                match self.config.bitmap_mode(max_mapnr) {
                    BitmapMode::Full => {
                        let store = self.bitmap_store(source.info())?;
                        let builder = BitmapBuilder::new(store.bitmaps()?, max_mapnr, max_mapnr);
                        self.write_single(source, target, level, builder, &erase)
                    }
                    BitmapMode::Cyclic(pfn_cyclic) => {
                        let builder = cyclic_builder(pfn_cyclic, max_mapnr);
                        self.write_single(source, target, level, builder, &erase)
                    }
                }
            },
            |target| target.discard(),
        )
    }

    /// Writes the dump as one file per target, each covering a part of the
    /// page frames.
    pub fn create_split<S, T>(&self, source: &mut S, targets: &mut [T]) -> Result<DumpReport>
    where
        S: ReopenSource + Send,
        T: DumpTarget + Send,
    {
        if targets.len() < 2 {
            return Err(Error(ErrorOrigin::Split, ErrorKind::ArgValidation)
                .log_error("a split dump needs at least two files"));
        }
        let erase = self.config.erase_filter(self.kernel, source)?;
        self.with_fallback(
            targets,
            |targets, level| self.write_split(source, targets, level, &erase),
            |targets| targets.iter_mut().try_for_each(|t| t.discard()),
        )
    }

    /// Classifies every page at the highest dump level without writing a
    /// dump.
    pub fn mem_usage<S: SourceMemory>(&self, source: &mut S) -> Result<DumpReport> {
        let info = source.info().clone();
        let filter = PageFilter::new(self.kernel, DumpLevel::all(), true)?;
        let counters = match self.config.bitmap_mode(info.max_mapnr) {
            BitmapMode::Full => {
                let store = self.bitmap_store(&info)?;
                let mut builder = BitmapBuilder::new(store.bitmaps()?, info.max_mapnr, info.max_mapnr);
                builder.count_dumpable(&filter, source, 0..info.max_mapnr)?;
                builder.counters()
            }
            BitmapMode::Cyclic(pfn_cyclic) => {
                let mut builder = cyclic_builder(pfn_cyclic, info.max_mapnr);
                builder.count_dumpable(&filter, source, 0..info.max_mapnr)?;
                builder.counters()
            }
        };
        Ok(DumpReport::new(info.max_mapnr, info.page_size, counters))
    }

    fn bitmap_store(&self, info: &ImageInfo) -> Result<BitmapStore> {
        match &self.config.tmpdir {
            Some(dir) => BitmapStore::new_in(dir, info.max_mapnr, info.page_size),
            None => BitmapStore::new(info.max_mapnr, info.page_size),
        }
    }

    fn kdump_writer(&self, info: &ImageInfo, erase: &EraseFilter) -> KdumpWriter {
        let (tv_sec, tv_usec) = now();
        KdumpWriter::new(
            info,
            self.kernel.utsname,
            PageCompressor::new(&self.config.codecs),
            erase.clone(),
        )
        .with_timestamp(tv_sec, tv_usec)
        .with_cache_size(self.config.cache_size(info.page_size))
    }

    fn write_single<S, T, B>(
        &self,
        source: &mut S,
        target: &mut T,
        level: DumpLevel,
        mut builder: BitmapBuilder<B>,
        erase: &EraseFilter,
    ) -> Result<DumpReport>
    where
        S: SourceMemory,
        T: DumpTarget,
        B: Bitmap,
    {
        let info = source.info().clone();
        let elf = self.config.format == DumpFormat::Elf;
        // the ELF layout depends on zero pages, so they have to be in the bitmap
        let filter = PageFilter::new(self.kernel, level, elf)?;

        let counters = if elf {
            let writer = ElfWriter::new(&info, erase.clone())
                .with_threshold(self.config.elf_threshold)
                .with_cache_size(self.config.cache_size(info.page_size));
            let layout = writer.plan(source, &mut builder, &filter)?;
            let mut sink = target.create()?;
            writer.write(source, &mut sink, &layout)?;
            sink.finish()?;
            builder.counters()
        } else {
            let writer = self.kdump_writer(&info, erase);
            let mut sink = target.create()?;
            let stats = writer.write(source, &mut sink, &mut builder, &filter)?;
            sink.finish()?;
            stats.counters
        };
        Ok(DumpReport::new(info.max_mapnr, info.page_size, counters))
    }

    fn write_split<S, T>(
        &self,
        source: &mut S,
        targets: &mut [T],
        level: DumpLevel,
        erase: &EraseFilter,
    ) -> Result<DumpReport>
    where
        S: ReopenSource + Send,
        T: DumpTarget + Send,
    {
        let info = source.info().clone();
        let max_mapnr = info.max_mapnr;

        let stats = match self.config.bitmap_mode(max_mapnr) {
            BitmapMode::Full => {
                // built once, then shared read-only by every worker
                let store = self.bitmap_store(&info)?;
                let filter = PageFilter::new(self.kernel, level, false)?;
                let mut builder = BitmapBuilder::new(store.bitmaps()?, max_mapnr, max_mapnr);
                builder.prepare(&filter, source, 0..max_mapnr)?;
                let ranges = split_by_dumpable(builder.bitmaps(), max_mapnr, targets.len())?;
                let counters = builder.counters();

                run_workers(source, targets, &ranges, |source, target, range| {
                    let filter = PageFilter::new(self.kernel, level, false)?;
                    let mut builder = BitmapBuilder::prebuilt(store.bitmaps()?, max_mapnr, counters);
                    self.write_part(source, target, &mut builder, &filter, erase, range)
                })?
            }
            BitmapMode::Cyclic(pfn_cyclic) => {
                let ranges = split_by_pfn(max_mapnr, targets.len());
                run_workers(source, targets, &ranges, |source, target, range| {
                    let filter = PageFilter::new(self.kernel, level, false)?;
                    let mut builder = cyclic_builder(pfn_cyclic, max_mapnr);
                    self.write_part(source, target, &mut builder, &filter, erase, range)
                })?
            }
        };

        // zero pages are found by the writers, each in its own range
        let mut counters = stats.first().map(|s| s.counters).unwrap_or_default();
        counters.zero = stats.iter().map(|s| s.counters.zero).sum();
        Ok(DumpReport::new(max_mapnr, info.page_size, counters))
    }

    fn write_part<S, T, B>(
        &self,
        source: &mut S,
        target: &mut T,
        builder: &mut BitmapBuilder<B>,
        filter: &PageFilter,
        erase: &EraseFilter,
        range: Range<Pfn>,
    ) -> Result<KdumpStats>
    where
        S: SourceMemory,
        T: DumpTarget,
        B: Bitmap,
    {
        let info = source.info().clone();
        let writer = self.kdump_writer(&info, erase).with_split(range);
        let mut sink = target.create()?;
        let stats = writer.write(source, &mut sink, builder, filter)?;
        sink.finish()?;
        Ok(stats)
    }
}

fn cyclic_builder(pfn_cyclic: u64, max_mapnr: Pfn) -> BitmapBuilder<CyclicBitmap> {
    let pfn_cyclic = pfn_cyclic.min(max_mapnr).max(1);
    BitmapBuilder::new(
        DumpBitmaps::new(CyclicBitmap::new(pfn_cyclic), CyclicBitmap::new(pfn_cyclic)),
        pfn_cyclic,
        max_mapnr,
    )
}
