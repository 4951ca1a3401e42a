/*!
x86_64 4-level page table walk.
*/

use log::trace;

use kdumpflow_core::error::{Error, ErrorKind, ErrorOrigin, Result};

pub const fn make_bit_mask(a: u32, b: u32) -> u64 {
    (0xffff_ffff_ffff_ffff >> (63 - b)) & !((1u64 << a) - 1)
}

const fn get_bit(a: u64, b: u32) -> bool {
    a & (1u64 << b) != 0
}

const fn is_present(entry: u64) -> bool {
    get_bit(entry, 0)
}

const fn is_large_page(entry: u64) -> bool {
    get_bit(entry, 7)
}

const ENTRY_ADDR_MASK: u64 = make_bit_mask(12, 51);

/// Byte offset of the entry for `vaddr` in the table at `level` (4 = PML4).
const fn entry_offset(vaddr: u64, level: u32) -> u64 {
    let shift = 12 + 9 * (level - 1);
    ((vaddr >> shift) & 0x1ff) * 8
}

/// Translates `vaddr` with the page tables rooted at physical `pgd`.
///
/// `read_entry` reads one little endian table entry at a physical address.
pub fn vtop<F>(pgd: u64, vaddr: u64, mut read_entry: F) -> Result<u64>
where
    F: FnMut(u64) -> Result<u64>,
{
    let unmapped = |what: &str| {
        Error(ErrorOrigin::Source, ErrorKind::UnableToReadMemory)
            .log_trace(format!("{} of {:x} is not present", what, vaddr))
    };

    let pml4e = read_entry((pgd & ENTRY_ADDR_MASK) | entry_offset(vaddr, 4))?;
    if !is_present(pml4e) {
        return Err(unmapped("pml4e"));
    }

    let pdpte = read_entry((pml4e & ENTRY_ADDR_MASK) | entry_offset(vaddr, 3))?;
    if !is_present(pdpte) {
        return Err(unmapped("pdpte"));
    }
    if is_large_page(pdpte) {
        trace!("found 1gb page");
        return Ok((pdpte & make_bit_mask(30, 51)) | (vaddr & make_bit_mask(0, 29)));
    }

    let pde = read_entry((pdpte & ENTRY_ADDR_MASK) | entry_offset(vaddr, 2))?;
    if !is_present(pde) {
        return Err(unmapped("pde"));
    }
    if is_large_page(pde) {
        trace!("found 2mb page");
        return Ok((pde & make_bit_mask(21, 51)) | (vaddr & make_bit_mask(0, 20)));
    }

    let pte = read_entry((pde & ENTRY_ADDR_MASK) | entry_offset(vaddr, 1))?;
    if !is_present(pte) {
        return Err(unmapped("pte"));
    }
    Ok((pte & ENTRY_ADDR_MASK) | (vaddr & make_bit_mask(0, 11)))
}
