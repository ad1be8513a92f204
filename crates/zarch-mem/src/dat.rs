//! Segment/page table walk for address-space-control elements that designate a segment table.
//!
//! Only the two lowest translation levels are modelled (2 GiB address spaces, 1 MiB segments,
//! 4 KiB pages). Region tables and large pages are reported as [`DatFault::AsceType`] and
//! [`DatFault::TranslationSpecification`] respectively.

use thiserror::Error;

use crate::{GuestRam, MemError};

pub const ASCE_ORIGIN_MASK: u64 = !0xfff;
pub const ASCE_TYPE_MASK: u64 = 0x0c;
pub const ASCE_LENGTH_MASK: u64 = 0x03;

pub const SEGMENT_ENTRY_ORIGIN_MASK: u64 = !0x7ff;
pub const SEGMENT_ENTRY_PROTECT: u64 = 0x200;
pub const SEGMENT_ENTRY_INVALID: u64 = 0x20;
pub const SEGMENT_ENTRY_TYPE_MASK: u64 = 0x0c;
/// Format-control bit: the entry maps a 1 MiB frame directly.
pub const SEGMENT_ENTRY_LARGE: u64 = 0x400;

pub const PAGE_ENTRY_ORIGIN_MASK: u64 = !0xfff;
pub const PAGE_ENTRY_INVALID: u64 = 0x400;
pub const PAGE_ENTRY_PROTECT: u64 = 0x200;
pub const PAGE_ENTRY_RESERVED: u64 = 0x800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DatFault {
    #[error("ASCE type not supported for this address")]
    AsceType,
    #[error("segment-translation exception")]
    SegmentTranslation,
    #[error("page-translation exception")]
    PageTranslation,
    #[error("translation-specification exception")]
    TranslationSpecification,
    #[error("addressing exception fetching a table entry at 0x{addr:x}")]
    Addressing { addr: u64 },
}

impl From<MemError> for DatFault {
    fn from(err: MemError) -> Self {
        match err {
            MemError::OutOfRange { addr, .. } | MemError::Protection { addr } => {
                DatFault::Addressing { addr }
            }
            MemError::InvalidSize { .. } => DatFault::Addressing { addr: 0 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Real address of the translated byte.
    pub real: u64,
    /// DAT protection: stores through this translation are not permitted.
    pub protected: bool,
}

#[inline]
pub fn segment_index(vaddr: u64) -> u64 {
    (vaddr >> 20) & 0x7ff
}

#[inline]
pub fn page_index(vaddr: u64) -> u64 {
    (vaddr >> 12) & 0xff
}

/// Absolute address of the page-table entry for `vaddr` in the page table at `pto`.
#[inline]
pub fn page_entry_addr(pto: u64, vaddr: u64) -> u64 {
    (pto & SEGMENT_ENTRY_ORIGIN_MASK) + page_index(vaddr) * 8
}

/// Translates `vaddr` through the tables designated by `asce`.
pub fn translate(ram: &GuestRam, asce: u64, vaddr: u64) -> Result<Translation, DatFault> {
    if asce & ASCE_TYPE_MASK != 0 || vaddr >> 31 != 0 {
        return Err(DatFault::AsceType);
    }
    let sx = segment_index(vaddr);
    if (sx >> 9) > (asce & ASCE_LENGTH_MASK) {
        return Err(DatFault::SegmentTranslation);
    }

    let ste = ram.read_u64_be((asce & ASCE_ORIGIN_MASK) + sx * 8)?;
    if ste & SEGMENT_ENTRY_INVALID != 0 {
        return Err(DatFault::SegmentTranslation);
    }
    if ste & (SEGMENT_ENTRY_TYPE_MASK | SEGMENT_ENTRY_LARGE) != 0 {
        return Err(DatFault::TranslationSpecification);
    }

    let pte = ram.read_u64_be(page_entry_addr(ste, vaddr))?;
    if pte & PAGE_ENTRY_INVALID != 0 {
        return Err(DatFault::PageTranslation);
    }
    if pte & PAGE_ENTRY_RESERVED != 0 {
        return Err(DatFault::TranslationSpecification);
    }

    Ok(Translation {
        real: (pte & PAGE_ENTRY_ORIGIN_MASK) | (vaddr & 0xfff),
        protected: (ste | pte) & PAGE_ENTRY_PROTECT != 0,
    })
}

/// Sets the invalid bit of the page-table entry mapping `vaddr` in the table at `pto`.
///
/// Returns the entry's previous contents.
pub fn invalidate_page_entry(ram: &GuestRam, pto: u64, vaddr: u64) -> Result<u64, MemError> {
    let addr = page_entry_addr(pto, vaddr);
    let mut old = ram.read_u64_be(addr)?;
    loop {
        let seen = ram.cmpxchg_u64_be(addr, old, old | PAGE_ENTRY_INVALID)?;
        if seen == old {
            tracing::trace!(pte_addr = addr, old, "page-table entry invalidated");
            return Ok(old);
        }
        old = seen;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEGMENT_TABLE: u64 = 0x4000;
    const PAGE_TABLE: u64 = 0x8000;

    fn setup() -> GuestRam {
        let ram = GuestRam::new(0x40000).unwrap();
        // Mark every segment invalid, then map segment 0 through one page table.
        for sx in 0..512 {
            ram.write_u64_be(SEGMENT_TABLE + sx * 8, SEGMENT_ENTRY_INVALID)
                .unwrap();
        }
        ram.write_u64_be(SEGMENT_TABLE, PAGE_TABLE).unwrap();
        for px in 0..256 {
            ram.write_u64_be(PAGE_TABLE + px * 8, PAGE_ENTRY_INVALID)
                .unwrap();
        }
        // vpage 1 -> frame 0x20000, vpage 2 -> frame 0x21000 (protected).
        ram.write_u64_be(PAGE_TABLE + 8, 0x20000).unwrap();
        ram.write_u64_be(PAGE_TABLE + 16, 0x21000 | PAGE_ENTRY_PROTECT)
            .unwrap();
        ram
    }

    #[test]
    fn walks_segment_and_page_tables() {
        let ram = setup();
        let t = translate(&ram, SEGMENT_TABLE, 0x1234).unwrap();
        assert_eq!(t.real, 0x20234);
        assert!(!t.protected);
        assert!(translate(&ram, SEGMENT_TABLE, 0x2000).unwrap().protected);
    }

    #[test]
    fn reports_faults_per_level() {
        let ram = setup();
        assert_eq!(
            translate(&ram, SEGMENT_TABLE, 0x3000),
            Err(DatFault::PageTranslation)
        );
        assert_eq!(
            translate(&ram, SEGMENT_TABLE, 0x10_0000),
            Err(DatFault::SegmentTranslation)
        );
        // Segment index 600 lies beyond a one-unit segment table.
        assert_eq!(
            translate(&ram, SEGMENT_TABLE, 600 << 20),
            Err(DatFault::SegmentTranslation)
        );
        assert_eq!(
            translate(&ram, SEGMENT_TABLE | 0x04, 0),
            Err(DatFault::AsceType)
        );
        assert_eq!(
            translate(&ram, SEGMENT_TABLE, 1 << 31),
            Err(DatFault::AsceType)
        );
    }

    #[test]
    fn invalidation_sets_invalid_bit() {
        let ram = setup();
        let old = invalidate_page_entry(&ram, PAGE_TABLE, 0x1000).unwrap();
        assert_eq!(old, 0x20000);
        assert_eq!(
            translate(&ram, SEGMENT_TABLE, 0x1000),
            Err(DatFault::PageTranslation)
        );
    }
}
