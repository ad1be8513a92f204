use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use zarch_time::CpuTimer;

use crate::exception::Exception;

bitflags! {
    /// PSW mask bits (bit 0 is the most significant bit of the first doubleword).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PswMask: u64 {
        const PER = 1 << 62;
        const DAT = 1 << 58;
        const IO = 1 << 57;
        const EXT = 1 << 56;
        const KEY = 0xf << 52;
        const MCHECK = 1 << 50;
        const WAIT = 1 << 49;
        const PROBLEM = 1 << 48;
        const ASC = 3 << 46;
        const CC = 3 << 44;
        const PM_FIXED_OVERFLOW = 1 << 43;
        const PM_DECIMAL_OVERFLOW = 1 << 42;
        const PM_HFP_UNDERFLOW = 1 << 41;
        const PM_HFP_SIGNIFICANCE = 1 << 40;
        const EA = 1 << 32;
        const BA = 1 << 31;
    }
}

impl PswMask {
    pub const PROGRAM_MASK_SHIFT: u32 = 40;
    pub const CC_SHIFT: u32 = 44;
    pub const ASC_SHIFT: u32 = 46;
    pub const KEY_SHIFT: u32 = 52;
}

// Control register bits used by the helper layer.
pub const CR0_SECONDARY_SPACE: u64 = 1 << 26;
pub const CR0_EMERGENCY_SIGNAL: u64 = 1 << 14;
pub const CR0_EXTERNAL_CALL: u64 = 1 << 13;
pub const CR0_CLOCK_COMPARATOR: u64 = 1 << 11;
pub const CR0_CPU_TIMER: u64 = 1 << 10;
pub const CR0_SERVICE_SIGNAL: u64 = 1 << 9;

/// Control registers whose contents feed address translation.
pub const TRANSLATION_CONTROL_REGS: [usize; 4] = [0, 1, 7, 13];

pub const PREFIX_MASK: u64 = 0x7fff_e000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    Bits24,
    Bits31,
    Bits64,
}

impl AddressingMode {
    #[inline]
    pub fn mask(self) -> u64 {
        match self {
            AddressingMode::Bits24 => 0x00ff_ffff,
            AddressingMode::Bits31 => 0x7fff_ffff,
            AddressingMode::Bits64 => u64::MAX,
        }
    }
}

/// Address-space control selected by PSW bits 16-17.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpace {
    Primary = 0,
    AccessRegister = 1,
    Secondary = 2,
    Home = 3,
}

impl AddressSpace {
    pub fn from_bits(bits: u64) -> Self {
        match bits & 3 {
            0 => AddressSpace::Primary,
            1 => AddressSpace::AccessRegister,
            2 => AddressSpace::Secondary,
            _ => AddressSpace::Home,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Psw {
    pub mask: PswMask,
    pub addr: u64,
}

impl Default for Psw {
    fn default() -> Self {
        Self {
            mask: PswMask::EA | PswMask::BA,
            addr: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CpuState {
    pub psw: Psw,
    /// Condition code, kept apart from `psw.mask` and folded in when the PSW is stored.
    pub cc: u8,
    pub gpr: [u64; 16],
    pub fpr: [u64; 16],
    pub fpc: u32,
    pub cr: [u64; 16],
    pub ar: [u32; 16],
    pub prefix: u64,
    pub clock_comparator: u64,
    pub cpu_timer: CpuTimer,
    pub cpu_addr: u16,
    pub halted: bool,
    /// Raised by other CPUs (through the machine) when an interruption is waiting for us.
    attention: Arc<AtomicBool>,
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new(0)
    }
}

impl CpuState {
    pub fn new(cpu_addr: u16) -> Self {
        let mut cr = [0u64; 16];
        // Architected initial CPU reset values.
        cr[0] = 0xe0;
        cr[14] = 0xc200_0000;
        Self {
            psw: Psw::default(),
            cc: 0,
            gpr: [0; 16],
            fpr: [0; 16],
            fpc: 0,
            cr,
            ar: [0; 16],
            prefix: 0,
            clock_comparator: 0,
            cpu_timer: CpuTimer::default(),
            cpu_addr,
            halted: false,
            attention: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn with_attention(cpu_addr: u16, attention: Arc<AtomicBool>) -> Self {
        Self {
            attention,
            ..Self::new(cpu_addr)
        }
    }

    /// Whether another CPU has posted an interruption request that is waiting to be serviced.
    ///
    /// Interruptible instructions poll this between units of operation.
    #[inline]
    pub fn interrupt_pending(&self) -> bool {
        self.attention.load(Ordering::Acquire)
    }

    pub(crate) fn attention(&self) -> &Arc<AtomicBool> {
        &self.attention
    }

    #[inline]
    pub fn problem_state(&self) -> bool {
        self.psw.mask.contains(PswMask::PROBLEM)
    }

    /// Fails with a privileged-operation exception in problem state.
    #[inline]
    pub fn check_privileged(&self) -> Result<(), Exception> {
        if self.problem_state() {
            return Err(Exception::PrivilegedOperation);
        }
        Ok(())
    }

    #[inline]
    pub fn psw_key(&self) -> u8 {
        ((self.psw.mask.bits() >> PswMask::KEY_SHIFT) & 0xf) as u8
    }

    #[inline]
    pub fn dat_enabled(&self) -> bool {
        self.psw.mask.contains(PswMask::DAT)
    }

    #[inline]
    pub fn address_space(&self) -> AddressSpace {
        AddressSpace::from_bits(self.psw.mask.bits() >> PswMask::ASC_SHIFT)
    }

    pub fn set_address_space(&mut self, space: AddressSpace) {
        let bits = (self.psw.mask.bits() & !PswMask::ASC.bits())
            | ((space as u64) << PswMask::ASC_SHIFT);
        self.psw.mask = PswMask::from_bits_retain(bits);
    }

    #[inline]
    pub fn program_mask(&self) -> u8 {
        ((self.psw.mask.bits() >> PswMask::PROGRAM_MASK_SHIFT) & 0xf) as u8
    }

    pub fn addressing_mode(&self) -> AddressingMode {
        match (
            self.psw.mask.contains(PswMask::EA),
            self.psw.mask.contains(PswMask::BA),
        ) {
            (true, _) => AddressingMode::Bits64,
            (false, true) => AddressingMode::Bits31,
            (false, false) => AddressingMode::Bits24,
        }
    }

    pub fn set_addressing_mode(&mut self, mode: AddressingMode) {
        let mut mask = self.psw.mask - (PswMask::EA | PswMask::BA);
        match mode {
            AddressingMode::Bits24 => {}
            AddressingMode::Bits31 => mask |= PswMask::BA,
            AddressingMode::Bits64 => mask |= PswMask::EA | PswMask::BA,
        }
        self.psw.mask = mask;
    }

    /// Truncates an effective address to the current addressing mode.
    #[inline]
    pub fn wrap_address(&self, addr: u64) -> u64 {
        addr & self.addressing_mode().mask()
    }

    /// Reads an address out of a general register, honouring the addressing mode.
    #[inline]
    pub fn address_reg(&self, r: usize) -> u64 {
        self.wrap_address(self.gpr[r])
    }

    /// Stores an updated address back into a general register.
    ///
    /// In 24- and 31-bit mode the bits to the left of the address are left untouched.
    pub fn set_address_reg(&mut self, r: usize, addr: u64) {
        let mask = match self.addressing_mode() {
            AddressingMode::Bits64 => u64::MAX,
            AddressingMode::Bits31 => 0x7fff_ffff,
            AddressingMode::Bits24 => 0x00ff_ffff,
        };
        self.gpr[r] = (self.gpr[r] & !mask) | (addr & mask);
    }

    /// Lengths of the 24/31-bit long operand forms live in the low 32 bits in those modes, and
    /// in all 64 bits in 64-bit mode.
    #[inline]
    pub fn length_reg(&self, r: usize) -> u64 {
        match self.addressing_mode() {
            AddressingMode::Bits64 => self.gpr[r],
            _ => self.gpr[r] & 0xffff_ffff,
        }
    }

    pub fn set_length_reg(&mut self, r: usize, len: u64) {
        match self.addressing_mode() {
            AddressingMode::Bits64 => self.gpr[r] = len,
            _ => self.set_gpr32(r, len as u32),
        }
    }

    #[inline]
    pub fn gpr32(&self, r: usize) -> u32 {
        self.gpr[r] as u32
    }

    /// Replaces the low word of a general register, keeping the high word.
    #[inline]
    pub fn set_gpr32(&mut self, r: usize, value: u32) {
        self.gpr[r] = (self.gpr[r] & 0xffff_ffff_0000_0000) | value as u64;
    }

    #[inline]
    pub fn set_gpr32_high(&mut self, r: usize, value: u32) {
        self.gpr[r] = (self.gpr[r] & 0xffff_ffff) | ((value as u64) << 32);
    }

    /// The architected PSW with the condition code folded in.
    pub fn psw_mask_with_cc(&self) -> u64 {
        (self.psw.mask.bits() & !PswMask::CC.bits()) | ((self.cc as u64 & 3) << PswMask::CC_SHIFT)
    }

    /// Loads a new PSW, splitting the condition code back out of the mask.
    pub fn load_psw(&mut self, mask: u64, addr: u64) {
        self.cc = ((mask >> PswMask::CC_SHIFT) & 3) as u8;
        self.psw.mask = PswMask::from_bits_retain(mask & !PswMask::CC.bits());
        self.psw.addr = addr;
        self.halted = self.psw.mask.contains(PswMask::WAIT);
    }

    /// Primary, secondary and home address-space-control elements.
    #[inline]
    pub fn asce(&self, space: AddressSpace) -> u64 {
        match space {
            AddressSpace::Primary | AddressSpace::AccessRegister => self.cr[1],
            AddressSpace::Secondary => self.cr[7],
            AddressSpace::Home => self.cr[13],
        }
    }

    /// Architected initial CPU reset of the parts of the state the helper layer owns.
    pub fn initial_reset(&mut self) {
        let cpu_addr = self.cpu_addr;
        let attention = Arc::clone(&self.attention);
        *self = Self::with_attention(cpu_addr, attention);
    }

    /// CPU reset: leaves registers alone but clears the PSW and the halted state.
    pub fn cpu_reset(&mut self) {
        self.psw = Psw::default();
        self.cc = 0;
        self.halted = false;
    }
}

/// Length of an instruction given its first opcode byte.
#[inline]
pub fn insn_len(opcode: u8) -> u8 {
    match opcode >> 6 {
        0 => 2,
        1 | 2 => 4,
        _ => 6,
    }
}

/// Checks that `r` designates the even register of an even/odd pair.
#[inline]
pub fn check_even_pair(r: usize) -> Result<(), Exception> {
    if r & 1 != 0 {
        return Err(Exception::Specification);
    }
    Ok(())
}
