/*!
This crate contains the page filter and the dump file writers of kdumpflow.

It reads the memory of a crashed linux kernel through a [source](mem/index.html),
decides page by page what is worth keeping using the
[kernel's own bookkeeping](kernel/index.html), records the decision in the
[dump bitmaps](bitmap/index.html) and writes the result as an ELF core or a
compressed kdump container ([dump](dump/index.html)).

A complete run is driven by a [`Dumper`]:

```no_run
use kdumpflow_core::*;

# fn run<S: SourceMemory>(mut source: S, kernel: KernelContext) -> Result<()> {
let config = DumpConfig::new()
    .with_codecs(&[Codec::Zlib])
    .with_dump_levels(&[31, 11, 1]);
let mut target = FileTarget::new("/var/crash/dumpfile");
let report = Dumper::new(&kernel, &config)?.create(&mut source, &mut target)?;
println!("{}", report);
# Ok(())
# }
```
*/

pub mod error;
#[doc(hidden)]
pub use error::*;

pub mod types;
#[doc(hidden)]
pub use types::*;

pub mod mem;
#[doc(hidden)]
pub use mem::*;

pub mod kernel;
#[doc(hidden)]
pub use kernel::{KernelContext, LayoutTable, Utsname};

pub mod bitmap;

pub mod cycle;

pub mod filter;
#[doc(hidden)]
pub use filter::{BitmapBuilder, PageFilter};

pub mod report;
#[doc(hidden)]
pub use report::{DumpReport, ExclusionCounters};

pub mod dump;
#[doc(hidden)]
pub use dump::{rearrange, reassemble, Codec, DumpSink, FileSink, KdumpReader, StallReader, STALL_TIMEOUT};

pub mod split;

pub mod config;
#[doc(hidden)]
pub use config::{CyclicMode, DumpConfig, DumpFormat, EraseConfig};

pub mod driver;
#[doc(hidden)]
pub use driver::{DumpTarget, Dumper, FileTarget, StreamTarget};
