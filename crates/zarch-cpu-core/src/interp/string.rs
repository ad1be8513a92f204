//! Storage-to-storage and long-operand instructions.
//!
//! The SS forms take a length code `l` (operand length minus one) and process bytes left to
//! right. Operands are staged in a buffer, but the result is computed as if each byte were
//! fetched and stored one at a time, so overlapping operands behave architecturally (MVC with
//! the destination one byte past the source propagates the first byte).
//!
//! The long forms keep their operand addresses and lengths in register pairs and update them
//! after every byte, so a fault or an interruption leaves a valid resumption point.

use std::cmp::Ordering;

use super::{load_byte, probe_write, read_operand, store_byte, write_operand, Completion};
use crate::cc;
use crate::exception::Exception;
use crate::mem::{CpuBus, Space};
use crate::state::{check_even_pair, CpuState, PswMask, CR0_SECONDARY_SPACE};
use zarch_mem::PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogicalOp {
    And,
    Or,
    Xor,
}

/// Value of source byte `i` as seen after the first `i` destination bytes were stored.
#[inline]
fn source_byte(cpu: &CpuState, out: &[u8], src_buf: &[u8], dest: u64, src: u64, i: usize) -> u8 {
    let mask = cpu.addressing_mode().mask();
    let off = (src.wrapping_add(i as u64).wrapping_sub(dest)) & mask;
    if (off as u128) < i as u128 {
        out[off as usize]
    } else {
        src_buf[i]
    }
}

fn logical<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    op: LogicalOp,
    l: u8,
    dest: u64,
    src: u64,
) -> Result<(), Exception> {
    let len = l as usize + 1;
    let mut src_buf = [0u8; 256];
    let mut out = [0u8; 256];
    read_operand(cpu, bus, src, &mut src_buf[..len])?;
    read_operand(cpu, bus, dest, &mut out[..len])?;
    let dest = cpu.wrap_address(dest);
    let src = cpu.wrap_address(src);

    let mut any = 0u8;
    for i in 0..len {
        let s = source_byte(cpu, &out, &src_buf, dest, src, i);
        let d = out[i];
        let r = match op {
            LogicalOp::And => d & s,
            LogicalOp::Or => d | s,
            LogicalOp::Xor => d ^ s,
        };
        out[i] = r;
        any |= r;
    }
    write_operand(cpu, bus, dest, &out[..len])?;
    cpu.cc = cc::nz_u32(any as u32);
    Ok(())
}

/// AND (NC): cc 0 when every result byte is zero, else 1.
pub fn nc<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    l: u8,
    dest: u64,
    src: u64,
) -> Result<(), Exception> {
    logical(cpu, bus, LogicalOp::And, l, dest, src)
}

pub fn oc<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    l: u8,
    dest: u64,
    src: u64,
) -> Result<(), Exception> {
    logical(cpu, bus, LogicalOp::Or, l, dest, src)
}

/// EXCLUSIVE OR (XC). With identical operands this clears the field.
pub fn xc<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    l: u8,
    dest: u64,
    src: u64,
) -> Result<(), Exception> {
    logical(cpu, bus, LogicalOp::Xor, l, dest, src)
}

/// MOVE (MVC). Does not set the condition code.
pub fn mvc<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    l: u8,
    dest: u64,
    src: u64,
) -> Result<(), Exception> {
    let len = l as usize + 1;
    let mut src_buf = [0u8; 256];
    let mut out = [0u8; 256];
    read_operand(cpu, bus, src, &mut src_buf[..len])?;
    let dest = cpu.wrap_address(dest);
    let src = cpu.wrap_address(src);
    for i in 0..len {
        out[i] = source_byte(cpu, &out, &src_buf, dest, src, i);
    }
    write_operand(cpu, bus, dest, &out[..len])
}

/// COMPARE LOGICAL (CLC): 0 equal, 1 first operand low, 2 high.
pub fn clc<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    l: u8,
    a1: u64,
    a2: u64,
) -> Result<(), Exception> {
    let len = l as usize + 1;
    let mut b1 = [0u8; 256];
    let mut b2 = [0u8; 256];
    read_operand(cpu, bus, a1, &mut b1[..len])?;
    read_operand(cpu, bus, a2, &mut b2[..len])?;
    cpu.cc = match b1[..len].cmp(&b2[..len]) {
        Ordering::Equal => 0,
        Ordering::Less => 1,
        Ordering::Greater => 2,
    };
    Ok(())
}

/// TRANSLATE (TR): each first-operand byte is replaced by the table byte it indexes.
pub fn tr<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    l: u8,
    addr: u64,
    table: u64,
) -> Result<(), Exception> {
    let len = l as usize + 1;
    probe_write(cpu, bus, addr, len)?;
    for i in 0..len as u64 {
        let b = load_byte(cpu, bus, addr.wrapping_add(i))?;
        let t = load_byte(cpu, bus, table.wrapping_add(b as u64))?;
        store_byte(cpu, bus, addr.wrapping_add(i), t)?;
    }
    Ok(())
}

/// TRANSLATE AND TEST (TRT).
///
/// Stops at the first byte whose function byte is nonzero: its address goes into GR1 and the
/// function byte into the rightmost byte of GR2. cc 0 when none was found, 1 when the stop was
/// before the last byte, 2 at the last byte.
pub fn trt<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    l: u8,
    addr: u64,
    table: u64,
) -> Result<(), Exception> {
    let len = l as u64 + 1;
    for i in 0..len {
        let at = cpu.wrap_address(addr.wrapping_add(i));
        let b = bus.read_u8(at)?;
        let function = load_byte(cpu, bus, table.wrapping_add(b as u64))?;
        if function != 0 {
            cpu.set_address_reg(1, at);
            cpu.gpr[2] = (cpu.gpr[2] & !0xff) | function as u64;
            cpu.cc = if i == len - 1 { 2 } else { 1 };
            return Ok(());
        }
    }
    cpu.cc = 0;
    Ok(())
}

#[inline]
fn mask_bytes(mask: u8) -> impl Iterator<Item = u32> {
    (0..4u32).filter(move |i| mask & (8 >> i) != 0)
}

/// COMPARE LOGICAL CHARACTERS UNDER MASK against the low (shift 0) or high (shift 32) word.
fn clm_at<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    mask: u8,
    addr: u64,
    shift: u32,
) -> Result<(), Exception> {
    let word = (cpu.gpr[r1] >> shift) as u32;
    let mut at = addr;
    cpu.cc = 0;
    for i in mask_bytes(mask) {
        let reg_byte = (word >> (24 - i * 8)) as u8;
        let mem_byte = load_byte(cpu, bus, at)?;
        at = at.wrapping_add(1);
        if reg_byte != mem_byte {
            cpu.cc = if reg_byte < mem_byte { 1 } else { 2 };
            return Ok(());
        }
    }
    Ok(())
}

pub fn clm<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    mask: u8,
    addr: u64,
) -> Result<(), Exception> {
    clm_at(cpu, bus, r1, mask, addr, 0)
}

pub fn clmh<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    mask: u8,
    addr: u64,
) -> Result<(), Exception> {
    clm_at(cpu, bus, r1, mask, addr, 32)
}

fn stcm_at<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    mask: u8,
    addr: u64,
    shift: u32,
) -> Result<(), Exception> {
    let word = (cpu.gpr[r1] >> shift) as u32;
    let bytes: Vec<u8> = mask_bytes(mask)
        .map(|i| (word >> (24 - i * 8)) as u8)
        .collect();
    write_operand(cpu, bus, addr, &bytes)
}

/// STORE CHARACTERS UNDER MASK: the selected register bytes are stored contiguously.
pub fn stcm<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    mask: u8,
    addr: u64,
) -> Result<(), Exception> {
    stcm_at(cpu, bus, r1, mask, addr, 0)
}

pub fn stcmh<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    mask: u8,
    addr: u64,
) -> Result<(), Exception> {
    stcm_at(cpu, bus, r1, mask, addr, 32)
}

fn icm_at<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    mask: u8,
    addr: u64,
    shift: u32,
) -> Result<(), Exception> {
    let count = mask_bytes(mask).count();
    let mut bytes = [0u8; 4];
    read_operand(cpu, bus, addr, &mut bytes[..count])?;
    let mut word = (cpu.gpr[r1] >> shift) as u32;
    let mut inserted = 0u32;
    for (n, i) in mask_bytes(mask).enumerate() {
        let pos = 24 - i * 8;
        word = (word & !(0xff << pos)) | ((bytes[n] as u32) << pos);
        inserted |= (bytes[n] as u32) << pos;
    }
    if shift == 0 {
        cpu.set_gpr32(r1, word);
    } else {
        cpu.set_gpr32_high(r1, word);
    }
    cpu.cc = cc::icm(mask, inserted);
    Ok(())
}

/// INSERT CHARACTERS UNDER MASK into the low word.
pub fn icm<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    mask: u8,
    addr: u64,
) -> Result<(), Exception> {
    icm_at(cpu, bus, r1, mask, addr, 0)
}

pub fn icmh<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    mask: u8,
    addr: u64,
) -> Result<(), Exception> {
    icm_at(cpu, bus, r1, mask, addr, 32)
}

fn check_word_aligned(addr: u64) -> Result<(), Exception> {
    if addr & 3 != 0 {
        return Err(Exception::Specification);
    }
    Ok(())
}

/// STORE ACCESS MULTIPLE: access registers r1 through r3, wrapping from 15 to 0.
pub fn stam<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r3: usize,
    addr: u64,
) -> Result<(), Exception> {
    check_word_aligned(addr)?;
    let count = ((r3 + 16 - r1) % 16) + 1;
    let mut buf = Vec::with_capacity(count * 4);
    for n in 0..count {
        buf.extend_from_slice(&cpu.ar[(r1 + n) % 16].to_be_bytes());
    }
    write_operand(cpu, bus, addr, &buf)
}

pub fn lam<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r3: usize,
    addr: u64,
) -> Result<(), Exception> {
    check_word_aligned(addr)?;
    let count = ((r3 + 16 - r1) % 16) + 1;
    let mut buf = vec![0u8; count * 4];
    read_operand(cpu, bus, addr, &mut buf)?;
    for (n, word) in buf.chunks_exact(4).enumerate() {
        cpu.ar[(r1 + n) % 16] = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
    }
    Ok(())
}

/// INSERT PROGRAM MASK: cc and program mask go into bits 34-39 of r1, bits 32-33 are zeroed.
pub fn ipm(cpu: &mut CpuState, r1: usize) {
    let byte = ((cpu.cc as u64 & 3) << 4) | cpu.program_mask() as u64;
    cpu.gpr[r1] = (cpu.gpr[r1] & !0xff00_0000) | (byte << 24);
}

const MVCL_LEN_MASK: u64 = 0x00ff_ffff;

#[inline]
fn set_len24(cpu: &mut CpuState, r: usize, len: u64) {
    cpu.gpr[r] = (cpu.gpr[r] & !MVCL_LEN_MASK) | (len & MVCL_LEN_MASK);
}

/// MOVE LONG.
///
/// Lengths are the low 24 bits of R1+1 and R2+1, the pad byte is bits 32-39 of R2+1. The
/// condition code compares the original lengths. Bytes move left to right, so a destination
/// that overlaps the source from above repeats the leading source bytes. The move is
/// interruptible after every byte.
pub fn mvcl<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r2: usize,
) -> Result<Completion, Exception> {
    check_even_pair(r1)?;
    check_even_pair(r2)?;
    let mut dest = cpu.address_reg(r1);
    let mut dest_len = cpu.gpr[r1 + 1] & MVCL_LEN_MASK;
    let mut src = cpu.address_reg(r2);
    let mut src_len = cpu.gpr[r2 + 1] & MVCL_LEN_MASK;
    let pad = (cpu.gpr[r2 + 1] >> 24) as u8;
    let cc = cc::cmp_u64(dest_len, src_len);

    while dest_len > 0 {
        if cpu.interrupt_pending() {
            return Ok(Completion::Interrupted);
        }
        let b = if src_len > 0 {
            load_byte(cpu, bus, src)?
        } else {
            pad
        };
        store_byte(cpu, bus, dest, b)?;
        dest = cpu.wrap_address(dest.wrapping_add(1));
        dest_len -= 1;
        cpu.set_address_reg(r1, dest);
        set_len24(cpu, r1 + 1, dest_len);
        if src_len > 0 {
            src = cpu.wrap_address(src.wrapping_add(1));
            src_len -= 1;
            cpu.set_address_reg(r2, src);
            set_len24(cpu, r2 + 1, src_len);
        }
    }
    cpu.cc = cc;
    Ok(Completion::Done)
}

/// COMPARE LOGICAL LONG: the shorter operand is extended with the pad byte. On inequality the
/// registers address the first unequal byte.
pub fn clcl<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r2: usize,
) -> Result<Completion, Exception> {
    check_even_pair(r1)?;
    check_even_pair(r2)?;
    let mut a1 = cpu.address_reg(r1);
    let mut l1 = cpu.gpr[r1 + 1] & MVCL_LEN_MASK;
    let mut a2 = cpu.address_reg(r2);
    let mut l2 = cpu.gpr[r2 + 1] & MVCL_LEN_MASK;
    let pad = (cpu.gpr[r2 + 1] >> 24) as u8;

    while l1 > 0 || l2 > 0 {
        if cpu.interrupt_pending() {
            return Ok(Completion::Interrupted);
        }
        let b1 = if l1 > 0 { load_byte(cpu, bus, a1)? } else { pad };
        let b2 = if l2 > 0 { load_byte(cpu, bus, a2)? } else { pad };
        if b1 != b2 {
            cpu.cc = if b1 < b2 { 1 } else { 2 };
            return Ok(Completion::Done);
        }
        if l1 > 0 {
            a1 = cpu.wrap_address(a1.wrapping_add(1));
            l1 -= 1;
            cpu.set_address_reg(r1, a1);
            set_len24(cpu, r1 + 1, l1);
        }
        if l2 > 0 {
            a2 = cpu.wrap_address(a2.wrapping_add(1));
            l2 -= 1;
            cpu.set_address_reg(r2, a2);
            set_len24(cpu, r2 + 1, l2);
        }
    }
    cpu.cc = 0;
    Ok(Completion::Done)
}

/// MOVE LONG EXTENDED. The pad byte is the low byte of the second-operand address. At most
/// `limit` bytes are moved per execution; cc 3 means more remain.
pub fn mvcle<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r3: usize,
    a2: u64,
    limit: u64,
) -> Result<(), Exception> {
    check_even_pair(r1)?;
    check_even_pair(r3)?;
    let pad = a2 as u8;
    let mut dest = cpu.address_reg(r1);
    let mut dest_len = cpu.length_reg(r1 + 1);
    let mut src = cpu.address_reg(r3);
    let mut src_len = cpu.length_reg(r3 + 1);
    let cc = cc::cmp_u64(dest_len, src_len);

    let mut budget = limit.max(1);
    while dest_len > 0 {
        if budget == 0 {
            cpu.cc = 3;
            return Ok(());
        }
        budget -= 1;
        let b = if src_len > 0 {
            load_byte(cpu, bus, src)?
        } else {
            pad
        };
        store_byte(cpu, bus, dest, b)?;
        dest = cpu.wrap_address(dest.wrapping_add(1));
        dest_len -= 1;
        cpu.set_address_reg(r1, dest);
        cpu.set_length_reg(r1 + 1, dest_len);
        if src_len > 0 {
            src = cpu.wrap_address(src.wrapping_add(1));
            src_len -= 1;
            cpu.set_address_reg(r3, src);
            cpu.set_length_reg(r3 + 1, src_len);
        }
    }
    cpu.cc = cc;
    Ok(())
}

/// COMPARE LOGICAL LONG EXTENDED, at most `limit` bytes per execution (cc 3 when stopped).
pub fn clcle<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r3: usize,
    a2: u64,
    limit: u64,
) -> Result<(), Exception> {
    check_even_pair(r1)?;
    check_even_pair(r3)?;
    let pad = a2 as u8;
    let mut a1 = cpu.address_reg(r1);
    let mut l1 = cpu.length_reg(r1 + 1);
    let mut a3 = cpu.address_reg(r3);
    let mut l3 = cpu.length_reg(r3 + 1);

    let mut budget = limit.max(1);
    while l1 > 0 || l3 > 0 {
        if budget == 0 {
            cpu.cc = 3;
            return Ok(());
        }
        budget -= 1;
        let b1 = if l1 > 0 { load_byte(cpu, bus, a1)? } else { pad };
        let b3 = if l3 > 0 { load_byte(cpu, bus, a3)? } else { pad };
        if b1 != b3 {
            cpu.cc = if b1 < b3 { 1 } else { 2 };
            return Ok(());
        }
        if l1 > 0 {
            a1 = cpu.wrap_address(a1.wrapping_add(1));
            l1 -= 1;
            cpu.set_address_reg(r1, a1);
            cpu.set_length_reg(r1 + 1, l1);
        }
        if l3 > 0 {
            a3 = cpu.wrap_address(a3.wrapping_add(1));
            l3 -= 1;
            cpu.set_address_reg(r3, a3);
            cpu.set_length_reg(r3 + 1, l3);
        }
    }
    cpu.cc = 0;
    Ok(())
}

/// The terminating character of the string instructions: bits 56-63 of GR0, with bits 32-55
/// required to be zero.
fn string_terminator(cpu: &CpuState) -> Result<u8, Exception> {
    if cpu.gpr[0] & 0xffff_ff00 != 0 {
        return Err(Exception::Specification);
    }
    Ok(cpu.gpr[0] as u8)
}

/// SEARCH STRING: looks for the GR0 character from R2 up to (excluding) R1.
///
/// cc 1 found (R1 gets its address), cc 2 not found, cc 3 stopped after `limit` bytes with R2
/// advanced.
pub fn srst<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r2: usize,
    limit: u64,
) -> Result<(), Exception> {
    let c = string_terminator(cpu)?;
    let end = cpu.address_reg(r1);
    let mut at = cpu.address_reg(r2);
    for _ in 0..limit.max(1) {
        if at == end {
            cpu.cc = 2;
            return Ok(());
        }
        if load_byte(cpu, bus, at)? == c {
            cpu.set_address_reg(r1, at);
            cpu.cc = 1;
            return Ok(());
        }
        at = cpu.wrap_address(at.wrapping_add(1));
    }
    cpu.set_address_reg(r2, at);
    cpu.cc = 3;
    Ok(())
}

/// COMPARE LOGICAL STRING: both strings end at the GR0 character.
///
/// cc 0 equal (registers unchanged), 1 first low, 2 first high (registers address the point of
/// difference), 3 stopped after `limit` bytes with both registers advanced.
pub fn clst<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r2: usize,
    limit: u64,
) -> Result<(), Exception> {
    let c = string_terminator(cpu)?;
    let mut s1 = cpu.address_reg(r1);
    let mut s2 = cpu.address_reg(r2);
    for _ in 0..limit.max(1) {
        let v1 = load_byte(cpu, bus, s1)?;
        let v2 = load_byte(cpu, bus, s2)?;
        if v1 == v2 {
            if v1 == c {
                cpu.cc = 0;
                return Ok(());
            }
        } else {
            cpu.cc = if v1 == c {
                1
            } else if v2 == c {
                2
            } else if v1 < v2 {
                1
            } else {
                2
            };
            cpu.set_address_reg(r1, s1);
            cpu.set_address_reg(r2, s2);
            return Ok(());
        }
        s1 = cpu.wrap_address(s1.wrapping_add(1));
        s2 = cpu.wrap_address(s2.wrapping_add(1));
    }
    cpu.set_address_reg(r1, s1);
    cpu.set_address_reg(r2, s2);
    cpu.cc = 3;
    Ok(())
}

/// MOVE STRING: copies from R2 to R1 up to and including the GR0 character.
///
/// cc 1 when complete (R1 addresses the terminator in the destination), cc 3 after `limit`
/// bytes with both registers advanced.
pub fn mvst<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r2: usize,
    limit: u64,
) -> Result<(), Exception> {
    let c = string_terminator(cpu)?;
    let mut dest = cpu.address_reg(r1);
    let mut src = cpu.address_reg(r2);
    for _ in 0..limit.max(1) {
        let v = load_byte(cpu, bus, src)?;
        store_byte(cpu, bus, dest, v)?;
        if v == c {
            cpu.set_address_reg(r1, dest);
            cpu.cc = 1;
            return Ok(());
        }
        dest = cpu.wrap_address(dest.wrapping_add(1));
        src = cpu.wrap_address(src.wrapping_add(1));
    }
    cpu.set_address_reg(r1, dest);
    cpu.set_address_reg(r2, src);
    cpu.cc = 3;
    Ok(())
}

/// CHECKSUM: 32-bit one's-complement-style sum (end-around carry) of the R2 operand into the
/// low word of R1. A final partial word is padded with zeros on the right.
pub fn cksm<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r2: usize,
    limit: u64,
) -> Result<(), Exception> {
    check_even_pair(r2)?;
    let mut addr = cpu.address_reg(r2);
    let mut len = cpu.length_reg(r2 + 1);
    let mut sum = cpu.gpr32(r1) as u64;
    let mut budget = limit.max(4);

    while len > 0 && budget > 0 {
        let take = len.min(4) as usize;
        let mut word = [0u8; 4];
        read_operand(cpu, bus, addr, &mut word[..take])?;
        sum += u32::from_be_bytes(word) as u64;
        sum = (sum & 0xffff_ffff) + (sum >> 32);
        addr = cpu.wrap_address(addr.wrapping_add(take as u64));
        len -= take as u64;
        budget = budget.saturating_sub(take as u64);
    }
    cpu.set_gpr32(r1, sum as u32);
    cpu.set_address_reg(r2, addr);
    cpu.set_length_reg(r2 + 1, len);
    cpu.cc = if len == 0 { 0 } else { 3 };
    Ok(())
}

/// GR0 bit 55 of MVPG: report unavailable operands through the condition code.
const MVPG_CCO: u64 = 0x100;

/// MOVE PAGE: copies one 4K page from the R2 page to the R1 page.
///
/// With the condition-code option in GR0, a translation fault on the destination yields cc 1
/// and one on the source yields cc 2 instead of a program interruption.
pub fn mvpg<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r2: usize,
) -> Result<(), Exception> {
    let dest = cpu.address_reg(r1) & !(PAGE_SIZE - 1);
    let src = cpu.address_reg(r2) & !(PAGE_SIZE - 1);
    let cco = cpu.gpr[0] & MVPG_CCO != 0;
    let unavailable = |e: &Exception| {
        matches!(
            e,
            Exception::PageTranslation { .. } | Exception::SegmentTranslation { .. }
        )
    };

    let src_abs = match bus.translate(src, Space::Current, false) {
        Ok(abs) => abs,
        Err(e) if cco && unavailable(&e) => {
            cpu.cc = 2;
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    let dest_abs = match bus.translate(dest, Space::Current, true) {
        Ok(abs) => abs,
        Err(e) if cco && unavailable(&e) => {
            cpu.cc = 1;
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    let mut page = vec![0u8; PAGE_SIZE as usize];
    bus.read_abs(src_abs, &mut page)?;
    bus.write_abs(dest_abs, &page)?;
    cpu.cc = 0;
    Ok(())
}

/// Key authorization for the semi-privileged moves: in problem state the key must be enabled
/// in the PSW-key mask (CR3 bits 32-47).
fn check_key_authorized(cpu: &CpuState, key: u8) -> Result<(), Exception> {
    if cpu.problem_state() && (cpu.cr[3] >> (31 - key as u64)) & 1 == 0 {
        return Err(Exception::PrivilegedOperation);
    }
    Ok(())
}

fn move_cross_space<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    len_reg: usize,
    dest: u64,
    src: u64,
    key_reg: usize,
    to_secondary: bool,
) -> Result<(), Exception> {
    if !cpu.psw.mask.contains(PswMask::DAT) || cpu.cr[0] & CR0_SECONDARY_SPACE == 0 {
        return Err(Exception::SpecialOperation);
    }
    let key = ((cpu.gpr[key_reg] >> 4) & 0xf) as u8;
    check_key_authorized(cpu, key)?;

    let requested = cpu.length_reg(len_reg);
    let (len, cc) = if requested > 256 {
        (256, 3)
    } else {
        (requested, 0)
    };
    let psw_key = cpu.psw_key();
    let (dest_space, dest_key, src_space, src_key) = if to_secondary {
        (Space::Secondary, psw_key, Space::Primary, key)
    } else {
        (Space::Primary, key, Space::Secondary, psw_key)
    };

    let mut buf = vec![0u8; len as usize];
    bus.read_bytes_keyed(cpu.wrap_address(src), src_space, src_key, &mut buf)?;
    bus.write_bytes_keyed(cpu.wrap_address(dest), dest_space, dest_key, &buf)?;
    cpu.cc = cc;
    Ok(())
}

/// MOVE TO SECONDARY: the source is fetched from the primary space with the key in R3, the
/// destination is stored in the secondary space with the PSW key.
pub fn mvcs<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    dest: u64,
    src: u64,
    r3: usize,
) -> Result<(), Exception> {
    move_cross_space(cpu, bus, r1, dest, src, r3, true)
}

/// MOVE TO PRIMARY: the mirror image of [`mvcs`].
pub fn mvcp<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    dest: u64,
    src: u64,
    r3: usize,
) -> Result<(), Exception> {
    move_cross_space(cpu, bus, r1, dest, src, r3, false)
}
