/*!
Source memory backed by an ELF `/proc/vmcore` image of a crashed x86_64
linux kernel.

[`open`] parses the program headers and the VMCOREINFO note of the image,
sets up kernel virtual address translation and reads everything the page
filter needs to know about the kernel: where its page descriptors live,
its memory zones and its name.

# Examples

```no_run
use kdumpflow_vmcore::open;

let (vmcore, kernel) = open("/proc/vmcore").unwrap();
println!("{} page frames", kdumpflow_core::SourceMemory::info(&vmcore).max_mapnr);
```
*/

use std::path::Path;

use log::warn;

use kdumpflow_core::error::{Error, ErrorKind, ErrorOrigin, Result};
use kdumpflow_core::kernel::{KernelContext, LayoutTable, Utsname};

pub mod elf;
mod file;
pub mod memory_model;
pub mod nodes;
pub mod vmcore;
pub mod vtop;

pub use memory_model::MemoryModel;
pub use vmcore::{Translation, Vmcore};

/// Parses the VMCOREINFO note of `vmcore` into a layout table.
pub fn layout_table(vmcore: &Vmcore) -> Result<LayoutTable> {
    let text = vmcore.vmcoreinfo_text().ok_or_else(|| {
        Error(ErrorOrigin::Source, ErrorKind::MissingLayout).log_error("the image has no VMCOREINFO note")
    })?;
    Ok(LayoutTable::parse_vmcoreinfo(&text)?.with_word_size(8))
}

/// Sets up address translation of `vmcore` and reads the kernel context.
///
/// Missing zone descriptions only disable the free list walk, so they are
/// logged and an empty zone list is used.
pub fn kernel_context(vmcore: &mut Vmcore) -> Result<KernelContext> {
    let table = layout_table(vmcore)?;
    let loads = vmcore.loads().iter().copied().chain(vmcore.kernel_text()).collect::<Vec<_>>();
    let translation = Translation::from_table(&table, &loads)?;
    vmcore.set_translation(translation);

    let model = memory_model::detect(&table)?;
    let mem_map = memory_model::build_mem_map(vmcore, &table, model)?;

    let zones = nodes::zones(vmcore, &table).unwrap_or_else(|e| {
        warn!("unable to enumerate memory zones ({}), free pages can only be found by their descriptors", e);
        Vec::new()
    });
    let utsname = nodes::utsname(vmcore, &table).unwrap_or_else(|e| {
        warn!("unable to read init_uts_ns ({}), using OSRELEASE", e);
        Utsname::with_release(table.osrelease().unwrap_or(""))
    });

    Ok(KernelContext::new(table, mem_map, zones).with_utsname(utsname))
}

/// Opens a vmcore image and reads its kernel context.
///
/// The image is mapped when the `filemap` feature is enabled.
pub fn open<P: AsRef<Path>>(path: P) -> Result<(Vmcore, KernelContext)> {
    #[cfg(feature = "filemap")]
    let mut vmcore = Vmcore::map(path)?;
    #[cfg(not(feature = "filemap"))]
    let mut vmcore = Vmcore::open(path)?;

    let kernel = kernel_context(&mut vmcore)?;
    Ok((vmcore, kernel))
}
