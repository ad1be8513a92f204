//! Guest storage and address-translation building blocks.
//!
//! [`GuestRam`] is the configuration's main storage: a contiguous byte array shared by every CPU,
//! plus one storage key per 4 KiB frame. Byte accesses take a shared lock; compare-and-swap and
//! key updates take the exclusive lock, which makes them indivisible with respect to all other
//! CPUs.
//!
//! [`dat`] implements the small slice of dynamic address translation the helper layer needs to
//! answer translation queries (segment-table designations with 4 KiB pages). It is a stand-in for
//! the machine's MMU, not a replacement for it.

#![forbid(unsafe_code)]

pub mod dat;
mod storage;
mod tlb;

pub use dat::{DatFault, Translation};
pub use storage::{GuestRam, MemError, StorageKey};
pub use tlb::{Tlb, TlbEntry};

/// Size of a translation page and of a storage-key frame.
pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// Size of the prefix area swapped in by prefixing.
pub const PREFIX_AREA_SIZE: u64 = 0x2000;

/// Applies prefixing to a real address, producing the absolute address.
///
/// Real locations `0..8192` map to the CPU's prefix area and the prefix area maps back to
/// absolute zero; all other addresses are unchanged.
#[inline]
pub fn real_to_absolute(real: u64, prefix: u64) -> u64 {
    if real < PREFIX_AREA_SIZE {
        real + prefix
    } else if real >= prefix && real < prefix + PREFIX_AREA_SIZE {
        real - prefix
    } else {
        real
    }
}
