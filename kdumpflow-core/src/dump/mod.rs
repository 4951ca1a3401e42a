/*!
Dump file formats and the sinks they are written to.
*/

pub mod cache;
pub use cache::{DumpSink, FileSink, WriteCache, DEFAULT_BLOCK_ORDER};

pub mod compress;
pub use compress::{Codec, PageCompressor};

pub mod eraseinfo;
pub use eraseinfo::{EraseEntry, EraseFilter, EraseSize};

pub mod elf;
pub use elf::{ElfLayout, ElfSegment, ElfWriter, PFN_EXCLUDED};

pub mod kdump;
pub use kdump::{DiskDumpHeader, KdumpLayout, KdumpStats, KdumpSubHeader, KdumpWriter, PageDesc};

pub mod flat;
pub use flat::{rearrange, FlatSink, StallReader, STALL_TIMEOUT};

pub mod reader;
pub use reader::KdumpReader;

pub mod reassemble;
pub use reassemble::reassemble;
