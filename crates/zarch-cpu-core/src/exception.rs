//! Architected program-interruption conditions.
//!
//! Helpers never unwind: a detected violation is returned as `Err(Exception)` and the caller
//! (the dispatch engine) abandons the instruction and delivers the program interruption through
//! [`crate::interrupts::deliver_program_interrupt`].

use thiserror::Error;
use zarch_mem::{DatFault, MemError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Exception {
    #[error("operation exception")]
    Operation,
    #[error("privileged-operation exception")]
    PrivilegedOperation,
    #[error("execute exception")]
    Execute,
    #[error("protection exception at {addr:#x}")]
    Protection { addr: u64 },
    #[error("addressing exception at {addr:#x}")]
    Addressing { addr: u64 },
    #[error("specification exception")]
    Specification,
    #[error("data exception (DXC {dxc:#04x})")]
    Data { dxc: u8 },
    #[error("fixed-point-overflow exception")]
    FixedPointOverflow,
    #[error("fixed-point-divide exception")]
    FixedPointDivide,
    #[error("decimal-overflow exception")]
    DecimalOverflow,
    #[error("decimal-divide exception")]
    DecimalDivide,
    #[error("segment-translation exception at {addr:#x}")]
    SegmentTranslation { addr: u64 },
    #[error("page-translation exception at {addr:#x}")]
    PageTranslation { addr: u64 },
    #[error("translation-specification exception")]
    TranslationSpecification,
    #[error("special-operation exception")]
    SpecialOperation,
    #[error("ASCE-type exception at {addr:#x}")]
    AsceType { addr: u64 },
}

/// Data-exception codes stored in the FPC and at lowcore 0x93.
pub mod dxc {
    pub const DECIMAL: u8 = 0x00;
    pub const IEEE_INVALID: u8 = 0x80;
    pub const IEEE_DIVIDE_BY_ZERO: u8 = 0x40;
    pub const IEEE_OVERFLOW: u8 = 0x20;
    pub const IEEE_UNDERFLOW: u8 = 0x10;
    pub const IEEE_INEXACT: u8 = 0x08;
}

impl Exception {
    /// Malformed operand: odd register pair, misalignment, reserved bits.
    #[inline]
    pub const fn specification() -> Self {
        Exception::Specification
    }

    /// The exception for a bare interruption code, as raised by translated code that detected
    /// the condition inline. Codes that need context (addresses, DXC) get zero context.
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x01 => Exception::Operation,
            0x02 => Exception::PrivilegedOperation,
            0x03 => Exception::Execute,
            0x04 => Exception::Protection { addr: 0 },
            0x05 => Exception::Addressing { addr: 0 },
            0x06 => Exception::Specification,
            0x07 => Exception::Data { dxc: 0 },
            0x08 => Exception::FixedPointOverflow,
            0x09 => Exception::FixedPointDivide,
            0x0a => Exception::DecimalOverflow,
            0x0b => Exception::DecimalDivide,
            0x10 => Exception::SegmentTranslation { addr: 0 },
            0x11 => Exception::PageTranslation { addr: 0 },
            0x12 => Exception::TranslationSpecification,
            0x13 => Exception::SpecialOperation,
            0x38 => Exception::AsceType { addr: 0 },
            _ => return None,
        })
    }

    /// The program-interruption code stored at lowcore 0x8e.
    pub const fn code(self) -> u16 {
        match self {
            Exception::Operation => 0x01,
            Exception::PrivilegedOperation => 0x02,
            Exception::Execute => 0x03,
            Exception::Protection { .. } => 0x04,
            Exception::Addressing { .. } => 0x05,
            Exception::Specification => 0x06,
            Exception::Data { .. } => 0x07,
            Exception::FixedPointOverflow => 0x08,
            Exception::FixedPointDivide => 0x09,
            Exception::DecimalOverflow => 0x0a,
            Exception::DecimalDivide => 0x0b,
            Exception::SegmentTranslation { .. } => 0x10,
            Exception::PageTranslation { .. } => 0x11,
            Exception::TranslationSpecification => 0x12,
            Exception::SpecialOperation => 0x13,
            Exception::AsceType { .. } => 0x38,
        }
    }

    /// Nullifying exceptions leave the old PSW pointing at the failing instruction so it is
    /// re-executed once the handler has resolved the condition.
    pub const fn nullifies(self) -> bool {
        matches!(
            self,
            Exception::SegmentTranslation { .. }
                | Exception::PageTranslation { .. }
                | Exception::AsceType { .. }
        )
    }

    /// Address reported in the translation-exception identification.
    pub const fn translation_address(self) -> Option<u64> {
        match self {
            Exception::SegmentTranslation { addr }
            | Exception::PageTranslation { addr }
            | Exception::AsceType { addr }
            | Exception::Protection { addr } => Some(addr),
            _ => None,
        }
    }

    pub const fn data_exception_code(self) -> Option<u8> {
        match self {
            Exception::Data { dxc } => Some(dxc),
            _ => None,
        }
    }

    /// Maps a table-walk failure for `vaddr` to the architected exception.
    pub fn from_dat(fault: DatFault, vaddr: u64) -> Self {
        match fault {
            DatFault::AsceType => Exception::AsceType { addr: vaddr },
            DatFault::SegmentTranslation => Exception::SegmentTranslation { addr: vaddr },
            DatFault::PageTranslation => Exception::PageTranslation { addr: vaddr },
            DatFault::TranslationSpecification => Exception::TranslationSpecification,
            DatFault::Addressing { addr } => Exception::Addressing { addr },
        }
    }
}

impl From<MemError> for Exception {
    fn from(err: MemError) -> Self {
        match err {
            MemError::OutOfRange { addr, .. } => Exception::Addressing { addr },
            MemError::Protection { addr } => Exception::Protection { addr },
            MemError::InvalidSize { .. } => Exception::Addressing { addr: 0 },
        }
    }
}
