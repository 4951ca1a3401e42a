/*!
Module with basic types used in kdumpflow.
*/

pub mod dump_level;
pub use dump_level::{DumpLevel, DumpLevelList, MAX_DUMP_LEVEL, NUM_DUMP_LEVELS};

/// A page frame number.
pub type Pfn = u64;

/// Divides `value` by `divisor`, rounding up.
///
/// `divisor` must not be zero.
pub const fn divideup(value: u64, divisor: u64) -> u64 {
    (value + divisor - 1) / divisor
}

/// Rounds `value` up to the next multiple of `align`.
pub const fn roundup(value: u64, align: u64) -> u64 {
    divideup(value, align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(divideup(0, 8), 0);
        assert_eq!(divideup(1, 8), 1);
        assert_eq!(divideup(16, 8), 2);
        assert_eq!(roundup(4097, 4096), 8192);
        assert_eq!(roundup(4096, 4096), 4096);
    }
}
