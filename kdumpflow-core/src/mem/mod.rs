/*!
This module covers the memory of the crashed system as seen by the filter:
raw reads from the captured image and the layout of the kernel's page
descriptor arrays.
*/

pub mod source;
#[doc(hidden)]
pub use source::*;

pub mod mem_map;
#[doc(hidden)]
pub use mem_map::{MemMapSegment, MemMapTable};

#[cfg(any(feature = "dummy_mem", test))]
pub mod dummy;
