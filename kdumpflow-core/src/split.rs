/*!
Writing one dump as several files in parallel.

Every worker covers a disjoint range of page frames, reads through its own
handle of the source image and writes its own file. Workers do not talk to
each other; the caller only collects how each of them finished.
*/

use std::ops::Range;
use std::thread;

use log::{debug, error, info};

use crate::bitmap::{Bitmap, DumpBitmaps};
use crate::driver::DumpTarget;
use crate::dump::KdumpStats;
use crate::error::{Error, ErrorKind, ErrorOrigin, Result, EXIT_FAILURE, EXIT_INCOMPLETE, EXIT_NOSPACE, EXIT_SUCCESS};
use crate::mem::ReopenSource;
use crate::types::Pfn;

/// How a split worker finished.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkerStatus {
    Ok,
    NoSpace,
    Failed,
    /// The worker stopped without reporting a result.
    Incomplete,
}

impl WorkerStatus {
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => WorkerStatus::Ok,
            Err(e) if e.is_no_space() => WorkerStatus::NoSpace,
            Err(e) if e.1 == ErrorKind::WorkerIncomplete => WorkerStatus::Incomplete,
            Err(_) => WorkerStatus::Failed,
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            WorkerStatus::Ok => EXIT_SUCCESS,
            WorkerStatus::NoSpace => EXIT_NOSPACE,
            WorkerStatus::Failed => EXIT_FAILURE,
            WorkerStatus::Incomplete => EXIT_INCOMPLETE,
        }
    }
}

/// Divides the frames into `num_files` ranges of equal length.
///
/// The last range takes the remainder.
pub fn split_by_pfn(max_mapnr: Pfn, num_files: usize) -> Vec<Range<Pfn>> {
    let num_files = num_files.max(1) as u64;
    let per_file = max_mapnr / num_files;
    (0..num_files)
        .map(|i| {
            let start = i * per_file;
            let end = if i + 1 == num_files { max_mapnr } else { start + per_file };
            start..end
        })
        .collect()
}

/// Divides the frames into `num_files` ranges holding the same number of
/// kept pages, according to whole-machine bitmaps.
///
/// Ranges past the last kept page may be empty.
pub fn split_by_dumpable<B: Bitmap>(
    bitmaps: &mut DumpBitmaps<B>,
    max_mapnr: Pfn,
    num_files: usize,
) -> Result<Vec<Range<Pfn>>> {
    let num_files = num_files.max(1);
    let per_file = (bitmaps.second.count_ones()? / num_files as u64).max(1);

    let mut ranges = Vec::with_capacity(num_files);
    let mut start = 0;
    let mut seen = 0;
    for pfn in 0..max_mapnr {
        if ranges.len() + 1 == num_files {
            break;
        }
        if bitmaps.is_keep(pfn)? {
            seen += 1;
            if seen == per_file {
                ranges.push(start..pfn + 1);
                start = pfn + 1;
                seen = 0;
            }
        }
    }
    ranges.push(start..max_mapnr);
    while ranges.len() < num_files {
        ranges.push(max_mapnr..max_mapnr);
    }
    Ok(ranges)
}

/// Runs `work` once per range on its own thread and waits for all of them.
///
/// Each worker gets a reopened handle of `source` and one of `targets`.
/// A failed worker fails the whole job. Otherwise a worker that ran out of
/// space makes the job report [`ErrorKind::NoSpace`].
pub fn run_workers<S, T, F>(
    source: &S,
    targets: &mut [T],
    ranges: &[Range<Pfn>],
    work: F,
) -> Result<Vec<KdumpStats>>
where
    S: ReopenSource + Send,
    T: DumpTarget + Send,
    F: Fn(&mut S, &mut T, Range<Pfn>) -> Result<KdumpStats> + Sync,
{
    if targets.len() != ranges.len() {
        return Err(Error(ErrorOrigin::Split, ErrorKind::ArgValidation)
            .log_error(format!("{} outputs for {} ranges", targets.len(), ranges.len())));
    }
    let sources = ranges.iter().map(|_| source.reopen()).collect::<Result<Vec<_>>>()?;

    let results = thread::scope(|scope| {
        let work = &work;
        let handles = sources
            .into_iter()
            .zip(targets.iter_mut())
            .zip(ranges.iter().cloned())
            .enumerate()
            .map(|(index, ((mut source, target), range))| {
                thread::Builder::new()
                    .name(format!("split-{}", index))
                    .spawn_scoped(scope, move || {
                        debug!("worker {}: pfn {:x}-{:x}", index, range.start, range.end);
                        work(&mut source, target, range)
                    })
            })
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .enumerate()
            .map(|(index, handle)| match handle {
                Ok(handle) => handle.join().unwrap_or_else(|_| {
                    Err(Error(ErrorOrigin::Split, ErrorKind::WorkerIncomplete)
                        .log_error(format!("worker {} stopped unexpectedly", index)))
                }),
                Err(e) => Err(Error(ErrorOrigin::Split, ErrorKind::WorkerFailed)
                    .log_error(format!("unable to start worker {}: {}", index, e))),
            })
            .collect::<Vec<_>>()
    });

    let statuses = results.iter().map(WorkerStatus::of).collect::<Vec<_>>();
    for (index, status) in statuses.iter().enumerate() {
        if *status != WorkerStatus::Ok {
            error!("worker {} finished with status {:?}", index, status);
        }
    }

    if statuses.contains(&WorkerStatus::Incomplete) {
        return Err(Error(ErrorOrigin::Split, ErrorKind::WorkerIncomplete));
    }
    if statuses.contains(&WorkerStatus::Failed) {
        return Err(Error(ErrorOrigin::Split, ErrorKind::WorkerFailed));
    }
    if statuses.contains(&WorkerStatus::NoSpace) {
        return Err(Error(ErrorOrigin::Split, ErrorKind::NoSpace));
    }

    info!("{} split workers finished", results.len());
    results.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::CyclicBitmap;

    #[test]
    fn equal_pfn_ranges() {
        assert_eq!(split_by_pfn(100, 3), vec![0..33, 33..66, 66..100]);
        assert_eq!(split_by_pfn(100, 1), vec![0..100]);
    }

    #[test]
    fn equal_dumpable_ranges() {
        let mut bitmaps = DumpBitmaps::new(CyclicBitmap::new(64), CyclicBitmap::new(64));
        bitmaps.reset(0..64).unwrap();
        bitmaps.mark_present(0..64).unwrap();
        bitmaps.seed_second().unwrap();
        for pfn in 0..32 {
            bitmaps.mark_excluded(pfn).unwrap();
        }
        // 32 kept pages in 32..64
        let ranges = split_by_dumpable(&mut bitmaps, 64, 2).unwrap();
        assert_eq!(ranges, vec![0..48, 48..64]);

        let ranges = split_by_dumpable(&mut bitmaps, 64, 40).unwrap();
        assert_eq!(ranges.len(), 40);
        assert_eq!(ranges[31], 63..64);
        assert_eq!(ranges[32], 64..64);
    }

    #[test]
    fn status_of_results() {
        assert_eq!(WorkerStatus::of(&Ok(())), WorkerStatus::Ok);
        let full: Result<()> = Err(Error(ErrorOrigin::DumpFile, ErrorKind::NoSpace));
        assert_eq!(WorkerStatus::of(&full), WorkerStatus::NoSpace);
        assert_eq!(WorkerStatus::NoSpace.exit_code(), EXIT_NOSPACE);
        let broken: Result<()> = Err(Error(ErrorOrigin::FreeList, ErrorKind::BrokenFreeList));
        assert_eq!(WorkerStatus::of(&broken), WorkerStatus::Failed);
    }
}
