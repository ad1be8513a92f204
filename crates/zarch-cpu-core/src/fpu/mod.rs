//! Binary floating-point instruction helpers.
//!
//! Short operands live in the high word of an FPR, long operands fill one FPR and extended
//! operands occupy the pair `r`/`r + 2` (valid for r = 0, 1, 4, 5, 8, 9, 12, 13). The arithmetic
//! itself is done by [`softfloat`]; this module moves values in and out of registers, picks the
//! rounding mode and folds the IEEE conditions into the FPC.

pub mod softfloat;

use softfloat::{Class, Format, FpFlags, RoundingMode};

use crate::exception::{dxc, Exception};
use crate::mem::CpuBus;
use crate::state::CpuState;

const FPC_MASK_SHIFT: u32 = 24;
const FPC_FLAGS_SHIFT: u32 = 16;
const FPC_DXC_SHIFT: u32 = 8;
const FPC_ROUNDING_MODE: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Short,
    Long,
    Extended,
}

impl Precision {
    #[inline]
    pub const fn format(self) -> Format {
        match self {
            Precision::Short => Format::SHORT,
            Precision::Long => Format::LONG,
            Precision::Extended => Format::EXTENDED,
        }
    }
}

#[inline]
fn check_ext_pair(r: usize) -> Result<(), Exception> {
    if r & 2 != 0 {
        return Err(Exception::Specification);
    }
    Ok(())
}

/// Reads a register operand, validating the pair for extended values.
pub fn read_fpr(cpu: &CpuState, prec: Precision, r: usize) -> Result<u128, Exception> {
    Ok(match prec {
        Precision::Short => (cpu.fpr[r] >> 32) as u128,
        Precision::Long => cpu.fpr[r] as u128,
        Precision::Extended => {
            check_ext_pair(r)?;
            ((cpu.fpr[r] as u128) << 64) | cpu.fpr[r + 2] as u128
        }
    })
}

/// Writes a result. Short results leave the low word of the register alone.
fn write_fpr(cpu: &mut CpuState, prec: Precision, r: usize, v: u128) {
    match prec {
        Precision::Short => cpu.fpr[r] = (cpu.fpr[r] & 0xffff_ffff) | ((v as u64) << 32),
        Precision::Long => cpu.fpr[r] = v as u64,
        Precision::Extended => {
            cpu.fpr[r] = (v >> 64) as u64;
            cpu.fpr[r + 2] = v as u64;
        }
    }
}

fn load_operand<B: CpuBus>(
    cpu: &CpuState,
    bus: &mut B,
    prec: Precision,
    addr: u64,
) -> Result<u128, Exception> {
    let addr = cpu.wrap_address(addr);
    Ok(match prec {
        Precision::Short => bus.read_u32(addr)? as u128,
        Precision::Long => bus.read_u64(addr)? as u128,
        Precision::Extended => bus.read_u128(addr)?,
    })
}

/// Rounding mode selected by the FPC.
pub fn fpc_rounding_mode(fpc: u32) -> RoundingMode {
    match fpc & FPC_ROUNDING_MODE {
        1 => RoundingMode::TowardZero,
        2 => RoundingMode::Up,
        3 => RoundingMode::Down,
        7 => RoundingMode::PrepareShorter,
        _ => RoundingMode::NearestEven,
    }
}

/// Rounding mode for an instruction with an M3 rounding-method field; 0 defers to the FPC.
pub fn rounding_modifier(cpu: &CpuState, m3: u8) -> Result<RoundingMode, Exception> {
    Ok(match m3 {
        0 => fpc_rounding_mode(cpu.fpc),
        1 => RoundingMode::NearestAway,
        3 => RoundingMode::PrepareShorter,
        4 => RoundingMode::NearestEven,
        5 => RoundingMode::TowardZero,
        6 => RoundingMode::Up,
        7 => RoundingMode::Down,
        _ => return Err(Exception::Specification),
    })
}

fn data_exception(cpu: &mut CpuState, code: u8) -> Exception {
    cpu.fpc = (cpu.fpc & !(0xff << FPC_DXC_SHIFT)) | ((code as u32) << FPC_DXC_SHIFT);
    Exception::Data { dxc: code }
}

/// Applies the IEEE conditions of one operation.
///
/// Enabled invalid-operation and divide-by-zero conditions suppress the result. Enabled
/// overflow, underflow and inexact conditions let `write` deliver the rounded result first.
/// Conditions whose trap is disabled accumulate in the FPC flag byte.
fn complete(
    cpu: &mut CpuState,
    flags: FpFlags,
    write: impl FnOnce(&mut CpuState),
) -> Result<(), Exception> {
    let enabled = FpFlags::from_bits_truncate((cpu.fpc >> FPC_MASK_SHIFT) as u8);
    let trapped = flags & enabled;
    if trapped.contains(FpFlags::INVALID) {
        return Err(data_exception(cpu, dxc::IEEE_INVALID));
    }
    if trapped.contains(FpFlags::DIVBYZERO) {
        return Err(data_exception(cpu, dxc::IEEE_DIVIDE_BY_ZERO));
    }
    write(cpu);
    cpu.fpc |= ((flags - trapped).bits() as u32) << FPC_FLAGS_SHIFT;
    if trapped.is_empty() {
        return Ok(());
    }
    let code = if trapped.contains(FpFlags::OVERFLOW) {
        dxc::IEEE_OVERFLOW
    } else if trapped.contains(FpFlags::UNDERFLOW) {
        dxc::IEEE_UNDERFLOW
    } else {
        0
    };
    let code = if flags.contains(FpFlags::INEXACT) {
        code | dxc::IEEE_INEXACT
    } else {
        code
    };
    Err(data_exception(cpu, code))
}

/// cc of an arithmetic result: 0 zero, 1 negative, 2 positive, 3 NaN.
fn result_cc(fmt: Format, bits: u128) -> u8 {
    match softfloat::classify(fmt, bits) {
        (_, Class::Zero) => 0,
        (_, Class::QuietNaN | Class::SignalingNaN) => 3,
        (true, _) => 1,
        (false, _) => 2,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
}

fn arith(
    cpu: &mut CpuState,
    prec: Precision,
    op: Arith,
    r1: usize,
    b: u128,
) -> Result<(), Exception> {
    let fmt = prec.format();
    let a = read_fpr(cpu, prec, r1)?;
    let mode = fpc_rounding_mode(cpu.fpc);
    let mut flags = FpFlags::empty();
    let r = match op {
        Arith::Add => softfloat::add(fmt, mode, a, b, &mut flags),
        Arith::Sub => softfloat::sub(fmt, mode, a, b, &mut flags),
        Arith::Mul => softfloat::mul(fmt, mode, a, b, &mut flags),
        Arith::Div => softfloat::div(fmt, mode, a, b, &mut flags),
    };
    let sets_cc = matches!(op, Arith::Add | Arith::Sub);
    complete(cpu, flags, |cpu| {
        write_fpr(cpu, prec, r1, r);
        if sets_cc {
            cpu.cc = result_cc(fmt, r);
        }
    })
}

fn arith_rr(
    cpu: &mut CpuState,
    prec: Precision,
    op: Arith,
    r1: usize,
    r2: usize,
) -> Result<(), Exception> {
    let b = read_fpr(cpu, prec, r2)?;
    arith(cpu, prec, op, r1, b)
}

fn arith_rm<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    prec: Precision,
    op: Arith,
    r1: usize,
    addr: u64,
) -> Result<(), Exception> {
    let b = load_operand(cpu, bus, prec, addr)?;
    arith(cpu, prec, op, r1, b)
}

pub fn aebr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    arith_rr(cpu, Precision::Short, Arith::Add, r1, r2)
}

pub fn adbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    arith_rr(cpu, Precision::Long, Arith::Add, r1, r2)
}

pub fn axbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    arith_rr(cpu, Precision::Extended, Arith::Add, r1, r2)
}

pub fn aeb<B: CpuBus>(cpu: &mut CpuState, bus: &mut B, r1: usize, addr: u64) -> Result<(), Exception> {
    arith_rm(cpu, bus, Precision::Short, Arith::Add, r1, addr)
}

pub fn adb<B: CpuBus>(cpu: &mut CpuState, bus: &mut B, r1: usize, addr: u64) -> Result<(), Exception> {
    arith_rm(cpu, bus, Precision::Long, Arith::Add, r1, addr)
}

pub fn sebr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    arith_rr(cpu, Precision::Short, Arith::Sub, r1, r2)
}

pub fn sdbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    arith_rr(cpu, Precision::Long, Arith::Sub, r1, r2)
}

pub fn sxbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    arith_rr(cpu, Precision::Extended, Arith::Sub, r1, r2)
}

pub fn seb<B: CpuBus>(cpu: &mut CpuState, bus: &mut B, r1: usize, addr: u64) -> Result<(), Exception> {
    arith_rm(cpu, bus, Precision::Short, Arith::Sub, r1, addr)
}

pub fn sdb<B: CpuBus>(cpu: &mut CpuState, bus: &mut B, r1: usize, addr: u64) -> Result<(), Exception> {
    arith_rm(cpu, bus, Precision::Long, Arith::Sub, r1, addr)
}

pub fn meebr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    arith_rr(cpu, Precision::Short, Arith::Mul, r1, r2)
}

pub fn mdbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    arith_rr(cpu, Precision::Long, Arith::Mul, r1, r2)
}

pub fn mxbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    arith_rr(cpu, Precision::Extended, Arith::Mul, r1, r2)
}

pub fn meeb<B: CpuBus>(cpu: &mut CpuState, bus: &mut B, r1: usize, addr: u64) -> Result<(), Exception> {
    arith_rm(cpu, bus, Precision::Short, Arith::Mul, r1, addr)
}

pub fn mdb<B: CpuBus>(cpu: &mut CpuState, bus: &mut B, r1: usize, addr: u64) -> Result<(), Exception> {
    arith_rm(cpu, bus, Precision::Long, Arith::Mul, r1, addr)
}

pub fn debr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    arith_rr(cpu, Precision::Short, Arith::Div, r1, r2)
}

pub fn ddbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    arith_rr(cpu, Precision::Long, Arith::Div, r1, r2)
}

pub fn dxbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    arith_rr(cpu, Precision::Extended, Arith::Div, r1, r2)
}

pub fn deb<B: CpuBus>(cpu: &mut CpuState, bus: &mut B, r1: usize, addr: u64) -> Result<(), Exception> {
    arith_rm(cpu, bus, Precision::Short, Arith::Div, r1, addr)
}

pub fn ddb<B: CpuBus>(cpu: &mut CpuState, bus: &mut B, r1: usize, addr: u64) -> Result<(), Exception> {
    arith_rm(cpu, bus, Precision::Long, Arith::Div, r1, addr)
}

/// MULTIPLY AND ADD / SUBTRACT: `R1 = R3 * op2 +/- R1`, rounded once.
fn fused(
    cpu: &mut CpuState,
    prec: Precision,
    r1: usize,
    r3: usize,
    b: u128,
    subtract: bool,
) -> Result<(), Exception> {
    let fmt = prec.format();
    let a = read_fpr(cpu, prec, r3)?;
    let mut c = read_fpr(cpu, prec, r1)?;
    if subtract && !fmt.is_nan(c) {
        c ^= fmt.sign_bit();
    }
    let mode = fpc_rounding_mode(cpu.fpc);
    let mut flags = FpFlags::empty();
    let r = softfloat::mul_add(fmt, mode, a, b, c, &mut flags);
    complete(cpu, flags, |cpu| write_fpr(cpu, prec, r1, r))
}

pub fn maebr(cpu: &mut CpuState, r1: usize, r3: usize, r2: usize) -> Result<(), Exception> {
    let b = read_fpr(cpu, Precision::Short, r2)?;
    fused(cpu, Precision::Short, r1, r3, b, false)
}

pub fn madbr(cpu: &mut CpuState, r1: usize, r3: usize, r2: usize) -> Result<(), Exception> {
    let b = read_fpr(cpu, Precision::Long, r2)?;
    fused(cpu, Precision::Long, r1, r3, b, false)
}

pub fn madb<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r3: usize,
    addr: u64,
) -> Result<(), Exception> {
    let b = load_operand(cpu, bus, Precision::Long, addr)?;
    fused(cpu, Precision::Long, r1, r3, b, false)
}

pub fn msebr(cpu: &mut CpuState, r1: usize, r3: usize, r2: usize) -> Result<(), Exception> {
    let b = read_fpr(cpu, Precision::Short, r2)?;
    fused(cpu, Precision::Short, r1, r3, b, true)
}

pub fn msdbr(cpu: &mut CpuState, r1: usize, r3: usize, r2: usize) -> Result<(), Exception> {
    let b = read_fpr(cpu, Precision::Long, r2)?;
    fused(cpu, Precision::Long, r1, r3, b, true)
}

pub fn msdb<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r3: usize,
    addr: u64,
) -> Result<(), Exception> {
    let b = load_operand(cpu, bus, Precision::Long, addr)?;
    fused(cpu, Precision::Long, r1, r3, b, true)
}

fn compare(
    cpu: &mut CpuState,
    prec: Precision,
    r1: usize,
    b: u128,
    signaling: bool,
) -> Result<(), Exception> {
    let a = read_fpr(cpu, prec, r1)?;
    let mut flags = FpFlags::empty();
    let cc = softfloat::compare(prec.format(), a, b, signaling, &mut flags);
    complete(cpu, flags, |cpu| cpu.cc = cc)
}

/// COMPARE (short). cc 0 equal, 1 low, 2 high, 3 unordered; only signaling NaNs are invalid.
pub fn cebr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    let b = read_fpr(cpu, Precision::Short, r2)?;
    compare(cpu, Precision::Short, r1, b, false)
}

pub fn cdbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    let b = read_fpr(cpu, Precision::Long, r2)?;
    compare(cpu, Precision::Long, r1, b, false)
}

pub fn cxbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    let b = read_fpr(cpu, Precision::Extended, r2)?;
    compare(cpu, Precision::Extended, r1, b, false)
}

pub fn cdb<B: CpuBus>(cpu: &mut CpuState, bus: &mut B, r1: usize, addr: u64) -> Result<(), Exception> {
    let b = load_operand(cpu, bus, Precision::Long, addr)?;
    compare(cpu, Precision::Long, r1, b, false)
}

/// COMPARE AND SIGNAL (short): any NaN operand is an invalid operation.
pub fn kebr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    let b = read_fpr(cpu, Precision::Short, r2)?;
    compare(cpu, Precision::Short, r1, b, true)
}

pub fn kdbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    let b = read_fpr(cpu, Precision::Long, r2)?;
    compare(cpu, Precision::Long, r1, b, true)
}

pub fn kxbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    let b = read_fpr(cpu, Precision::Extended, r2)?;
    compare(cpu, Precision::Extended, r1, b, true)
}

fn square_root(cpu: &mut CpuState, prec: Precision, r1: usize, r2: usize) -> Result<(), Exception> {
    if prec == Precision::Extended {
        check_ext_pair(r1)?;
    }
    let a = read_fpr(cpu, prec, r2)?;
    let mut flags = FpFlags::empty();
    let r = softfloat::sqrt(prec.format(), fpc_rounding_mode(cpu.fpc), a, &mut flags);
    complete(cpu, flags, |cpu| write_fpr(cpu, prec, r1, r))
}

pub fn sqebr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    square_root(cpu, Precision::Short, r1, r2)
}

pub fn sqdbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    square_root(cpu, Precision::Long, r1, r2)
}

pub fn sqxbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    square_root(cpu, Precision::Extended, r1, r2)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignOp {
    /// LOAD AND TEST: copy, quieting a signaling NaN.
    Test,
    Complement,
    Positive,
    Negative,
}

fn load_signed(
    cpu: &mut CpuState,
    prec: Precision,
    op: SignOp,
    r1: usize,
    r2: usize,
) -> Result<(), Exception> {
    if prec == Precision::Extended {
        check_ext_pair(r1)?;
    }
    let fmt = prec.format();
    let v = read_fpr(cpu, prec, r2)?;
    let mut flags = FpFlags::empty();
    let r = match op {
        SignOp::Test if fmt.is_signaling_nan(v) => {
            flags |= FpFlags::INVALID;
            fmt.quiet(v)
        }
        SignOp::Test => v,
        SignOp::Complement => v ^ fmt.sign_bit(),
        SignOp::Positive => v & !fmt.sign_bit(),
        SignOp::Negative => v | fmt.sign_bit(),
    };
    complete(cpu, flags, |cpu| {
        write_fpr(cpu, prec, r1, r);
        cpu.cc = result_cc(fmt, r);
    })
}

pub fn ltebr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    load_signed(cpu, Precision::Short, SignOp::Test, r1, r2)
}

pub fn ltdbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    load_signed(cpu, Precision::Long, SignOp::Test, r1, r2)
}

pub fn ltxbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    load_signed(cpu, Precision::Extended, SignOp::Test, r1, r2)
}

pub fn lcebr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    load_signed(cpu, Precision::Short, SignOp::Complement, r1, r2)
}

pub fn lcdbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    load_signed(cpu, Precision::Long, SignOp::Complement, r1, r2)
}

pub fn lcxbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    load_signed(cpu, Precision::Extended, SignOp::Complement, r1, r2)
}

pub fn lpebr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    load_signed(cpu, Precision::Short, SignOp::Positive, r1, r2)
}

pub fn lpdbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    load_signed(cpu, Precision::Long, SignOp::Positive, r1, r2)
}

pub fn lpxbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    load_signed(cpu, Precision::Extended, SignOp::Positive, r1, r2)
}

pub fn lnebr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    load_signed(cpu, Precision::Short, SignOp::Negative, r1, r2)
}

pub fn lndbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    load_signed(cpu, Precision::Long, SignOp::Negative, r1, r2)
}

pub fn lnxbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    load_signed(cpu, Precision::Extended, SignOp::Negative, r1, r2)
}

/// LOAD ZERO (short): the low word of the register is unchanged.
pub fn lzer(cpu: &mut CpuState, r1: usize) {
    write_fpr(cpu, Precision::Short, r1, 0);
}

pub fn lzdr(cpu: &mut CpuState, r1: usize) {
    write_fpr(cpu, Precision::Long, r1, 0);
}

pub fn lzxr(cpu: &mut CpuState, r1: usize) -> Result<(), Exception> {
    check_ext_pair(r1)?;
    write_fpr(cpu, Precision::Extended, r1, 0);
    Ok(())
}

/// Format conversion of an already fetched operand into R1.
fn convert(
    cpu: &mut CpuState,
    from: Precision,
    to: Precision,
    r1: usize,
    v: u128,
    mode: RoundingMode,
) -> Result<(), Exception> {
    if to == Precision::Extended || from == Precision::Extended {
        check_ext_pair(r1)?;
    }
    let mut flags = FpFlags::empty();
    let r = softfloat::convert(from.format(), to.format(), mode, v, &mut flags);
    complete(cpu, flags, |cpu| write_fpr(cpu, to, r1, r))
}

/// LOAD LENGTHENED (short to long). Exact; only a signaling NaN raises a condition.
pub fn ldebr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    let v = read_fpr(cpu, Precision::Short, r2)?;
    convert(cpu, Precision::Short, Precision::Long, r1, v, RoundingMode::NearestEven)
}

pub fn lxdbr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    let v = read_fpr(cpu, Precision::Long, r2)?;
    convert(cpu, Precision::Long, Precision::Extended, r1, v, RoundingMode::NearestEven)
}

pub fn lxebr(cpu: &mut CpuState, r1: usize, r2: usize) -> Result<(), Exception> {
    let v = read_fpr(cpu, Precision::Short, r2)?;
    convert(cpu, Precision::Short, Precision::Extended, r1, v, RoundingMode::NearestEven)
}

pub fn ldeb<B: CpuBus>(cpu: &mut CpuState, bus: &mut B, r1: usize, addr: u64) -> Result<(), Exception> {
    let v = load_operand(cpu, bus, Precision::Short, addr)?;
    convert(cpu, Precision::Short, Precision::Long, r1, v, RoundingMode::NearestEven)
}

pub fn lxdb<B: CpuBus>(cpu: &mut CpuState, bus: &mut B, r1: usize, addr: u64) -> Result<(), Exception> {
    let v = load_operand(cpu, bus, Precision::Long, addr)?;
    convert(cpu, Precision::Long, Precision::Extended, r1, v, RoundingMode::NearestEven)
}

/// LOAD ROUNDED (long to short) under the M3 rounding method.
pub fn ledbr(cpu: &mut CpuState, r1: usize, r2: usize, m3: u8) -> Result<(), Exception> {
    let mode = rounding_modifier(cpu, m3)?;
    let v = read_fpr(cpu, Precision::Long, r2)?;
    convert(cpu, Precision::Long, Precision::Short, r1, v, mode)
}

pub fn ldxbr(cpu: &mut CpuState, r1: usize, r2: usize, m3: u8) -> Result<(), Exception> {
    let mode = rounding_modifier(cpu, m3)?;
    let v = read_fpr(cpu, Precision::Extended, r2)?;
    convert(cpu, Precision::Extended, Precision::Long, r1, v, mode)
}

pub fn lexbr(cpu: &mut CpuState, r1: usize, r2: usize, m3: u8) -> Result<(), Exception> {
    let mode = rounding_modifier(cpu, m3)?;
    let v = read_fpr(cpu, Precision::Extended, r2)?;
    convert(cpu, Precision::Extended, Precision::Short, r1, v, mode)
}

fn from_int(
    cpu: &mut CpuState,
    to: Precision,
    r1: usize,
    v: i64,
    m3: u8,
) -> Result<(), Exception> {
    if to == Precision::Extended {
        check_ext_pair(r1)?;
    }
    let mode = rounding_modifier(cpu, m3)?;
    let mut flags = FpFlags::empty();
    let r = softfloat::from_i64(to.format(), mode, v, &mut flags);
    complete(cpu, flags, |cpu| write_fpr(cpu, to, r1, r))
}

/// CONVERT FROM FIXED (32-bit signed GPR to short).
pub fn cefbr(cpu: &mut CpuState, r1: usize, r2: usize, m3: u8) -> Result<(), Exception> {
    let v = cpu.gpr32(r2) as i32 as i64;
    from_int(cpu, Precision::Short, r1, v, m3)
}

pub fn cdfbr(cpu: &mut CpuState, r1: usize, r2: usize, m3: u8) -> Result<(), Exception> {
    let v = cpu.gpr32(r2) as i32 as i64;
    from_int(cpu, Precision::Long, r1, v, m3)
}

pub fn cxfbr(cpu: &mut CpuState, r1: usize, r2: usize, m3: u8) -> Result<(), Exception> {
    let v = cpu.gpr32(r2) as i32 as i64;
    from_int(cpu, Precision::Extended, r1, v, m3)
}

pub fn cegbr(cpu: &mut CpuState, r1: usize, r2: usize, m3: u8) -> Result<(), Exception> {
    let v = cpu.gpr[r2] as i64;
    from_int(cpu, Precision::Short, r1, v, m3)
}

pub fn cdgbr(cpu: &mut CpuState, r1: usize, r2: usize, m3: u8) -> Result<(), Exception> {
    let v = cpu.gpr[r2] as i64;
    from_int(cpu, Precision::Long, r1, v, m3)
}

pub fn cxgbr(cpu: &mut CpuState, r1: usize, r2: usize, m3: u8) -> Result<(), Exception> {
    let v = cpu.gpr[r2] as i64;
    from_int(cpu, Precision::Extended, r1, v, m3)
}

/// CONVERT TO FIXED. cc 0 zero, 1 negative, 2 positive, 3 NaN/infinity/out of range; in the
/// last case the result is the maximum magnitude of the operand's sign (maximum negative for
/// a NaN).
fn to_int(
    cpu: &mut CpuState,
    from: Precision,
    r1: usize,
    r2: usize,
    m3: u8,
    width: u32,
) -> Result<(), Exception> {
    let mode = rounding_modifier(cpu, m3)?;
    let v = read_fpr(cpu, from, r2)?;
    let mut flags = FpFlags::empty();
    let (r, cc) = softfloat::to_int(from.format(), mode, v, width, &mut flags);
    complete(cpu, flags, |cpu| {
        if width == 32 {
            cpu.set_gpr32(r1, r as u32);
        } else {
            cpu.gpr[r1] = r as u64;
        }
        cpu.cc = cc;
    })
}

pub fn cfebr(cpu: &mut CpuState, r1: usize, r2: usize, m3: u8) -> Result<(), Exception> {
    to_int(cpu, Precision::Short, r1, r2, m3, 32)
}

pub fn cfdbr(cpu: &mut CpuState, r1: usize, r2: usize, m3: u8) -> Result<(), Exception> {
    to_int(cpu, Precision::Long, r1, r2, m3, 32)
}

pub fn cfxbr(cpu: &mut CpuState, r1: usize, r2: usize, m3: u8) -> Result<(), Exception> {
    to_int(cpu, Precision::Extended, r1, r2, m3, 32)
}

pub fn cgebr(cpu: &mut CpuState, r1: usize, r2: usize, m3: u8) -> Result<(), Exception> {
    to_int(cpu, Precision::Short, r1, r2, m3, 64)
}

pub fn cgdbr(cpu: &mut CpuState, r1: usize, r2: usize, m3: u8) -> Result<(), Exception> {
    to_int(cpu, Precision::Long, r1, r2, m3, 64)
}

pub fn cgxbr(cpu: &mut CpuState, r1: usize, r2: usize, m3: u8) -> Result<(), Exception> {
    to_int(cpu, Precision::Extended, r1, r2, m3, 64)
}

fn load_fp_integer(
    cpu: &mut CpuState,
    prec: Precision,
    r1: usize,
    r2: usize,
    m3: u8,
) -> Result<(), Exception> {
    if prec == Precision::Extended {
        check_ext_pair(r1)?;
    }
    let mode = rounding_modifier(cpu, m3)?;
    let v = read_fpr(cpu, prec, r2)?;
    let mut flags = FpFlags::empty();
    let r = softfloat::round_to_integral(prec.format(), mode, v, &mut flags);
    complete(cpu, flags, |cpu| write_fpr(cpu, prec, r1, r))
}

pub fn fiebr(cpu: &mut CpuState, r1: usize, r2: usize, m3: u8) -> Result<(), Exception> {
    load_fp_integer(cpu, Precision::Short, r1, r2, m3)
}

pub fn fidbr(cpu: &mut CpuState, r1: usize, r2: usize, m3: u8) -> Result<(), Exception> {
    load_fp_integer(cpu, Precision::Long, r1, r2, m3)
}

pub fn fixbr(cpu: &mut CpuState, r1: usize, r2: usize, m3: u8) -> Result<(), Exception> {
    load_fp_integer(cpu, Precision::Extended, r1, r2, m3)
}

/// Bit of the TEST DATA CLASS mask selecting a sign and class. Bit 0x800 is +0, then -0,
/// normal, subnormal, infinity, quiet NaN and signaling NaN pairs down to 0x001 for -SNaN.
pub fn data_class_bit(sign: bool, class: Class) -> u16 {
    let plus = match class {
        Class::Zero => 11,
        Class::Normal => 9,
        Class::Subnormal => 7,
        Class::Infinity => 5,
        Class::QuietNaN => 3,
        Class::SignalingNaN => 1,
    };
    1 << (plus - sign as u32)
}

/// TEST DATA CLASS: cc 1 when the operand's class is selected by the low 12 bits of the
/// second-operand address, cc 0 otherwise.
fn test_data_class(cpu: &mut CpuState, prec: Precision, r1: usize, mask: u64) -> Result<(), Exception> {
    let v = read_fpr(cpu, prec, r1)?;
    let (sign, class) = softfloat::classify(prec.format(), v);
    cpu.cc = (data_class_bit(sign, class) as u64 & mask & 0xfff != 0) as u8;
    Ok(())
}

pub fn tceb(cpu: &mut CpuState, r1: usize, mask: u64) -> Result<(), Exception> {
    test_data_class(cpu, Precision::Short, r1, mask)
}

pub fn tcdb(cpu: &mut CpuState, r1: usize, mask: u64) -> Result<(), Exception> {
    test_data_class(cpu, Precision::Long, r1, mask)
}

pub fn tcxb(cpu: &mut CpuState, r1: usize, mask: u64) -> Result<(), Exception> {
    test_data_class(cpu, Precision::Extended, r1, mask)
}
