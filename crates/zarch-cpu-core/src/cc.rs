//! Condition-code computation.
//!
//! Every function here is pure. Arithmetic helpers compute their result themselves and call into
//! this module for the code instead of deriving it from a generic sign/zero test, because the
//! meaning of each code is specific to the instruction class.

#[inline]
fn sign_class_i32(r: i32) -> u8 {
    match r {
        0 => 0,
        r if r < 0 => 1,
        _ => 2,
    }
}

#[inline]
fn sign_class_i64(r: i64) -> u8 {
    match r {
        0 => 0,
        r if r < 0 => 1,
        _ => 2,
    }
}

/// Signed add: 0 zero, 1 negative, 2 positive, 3 overflow.
pub fn add_s32(a: i32, b: i32) -> u8 {
    let r = a.wrapping_add(b);
    if (a < 0) == (b < 0) && (r < 0) != (a < 0) {
        3
    } else {
        sign_class_i32(r)
    }
}

pub fn add_s64(a: i64, b: i64) -> u8 {
    let r = a.wrapping_add(b);
    if (a < 0) == (b < 0) && (r < 0) != (a < 0) {
        3
    } else {
        sign_class_i64(r)
    }
}

/// Signed subtract; the operand signs must differ for overflow to be possible.
pub fn sub_s32(a: i32, b: i32) -> u8 {
    let r = a.wrapping_sub(b);
    if (a < 0) != (b < 0) && (r < 0) != (a < 0) {
        3
    } else {
        sign_class_i32(r)
    }
}

pub fn sub_s64(a: i64, b: i64) -> u8 {
    let r = a.wrapping_sub(b);
    if (a < 0) != (b < 0) && (r < 0) != (a < 0) {
        3
    } else {
        sign_class_i64(r)
    }
}

#[inline]
fn logical(carry: bool, nonzero: bool) -> u8 {
    ((carry as u8) << 1) | nonzero as u8
}

/// Unsigned add: 0 zero/no carry, 1 nonzero/no carry, 2 zero/carry, 3 nonzero/carry.
pub fn add_u32(a: u32, b: u32) -> u8 {
    let (r, carry) = a.overflowing_add(b);
    logical(carry, r != 0)
}

pub fn add_u64(a: u64, b: u64) -> u8 {
    let (r, carry) = a.overflowing_add(b);
    logical(carry, r != 0)
}

/// Unsigned subtract. The carry out of `a + !b + 1` is set when no borrow occurs, so a zero
/// result always reports cc 2 and cc 0 never happens.
pub fn sub_u32(a: u32, b: u32) -> u8 {
    logical(a >= b, a != b)
}

pub fn sub_u64(a: u64, b: u64) -> u8 {
    logical(a >= b, a != b)
}

/// ADD LOGICAL WITH CARRY: the carry-in is taken from bit 1 of the current condition code.
pub fn addc_u32(a: u32, b: u32, cc: u8) -> (u32, u8) {
    let sum = a as u64 + b as u64 + ((cc >> 1) & 1) as u64;
    let r = sum as u32;
    (r, logical(sum >> 32 != 0, r != 0))
}

pub fn addc_u64(a: u64, b: u64, cc: u8) -> (u64, u8) {
    let sum = a as u128 + b as u128 + ((cc >> 1) & 1) as u128;
    let r = sum as u64;
    (r, logical(sum >> 64 != 0, r != 0))
}

/// SUBTRACT LOGICAL WITH BORROW (32-bit). A borrow-in is present when cc bit 1 is clear.
pub fn slb(a: u32, b: u32, cc: u8) -> (u32, u8) {
    let borrow_in = ((cc >> 1) & 1 == 0) as u64;
    let subtrahend = b as u64 + borrow_in;
    let r = (a as u64).wrapping_sub(subtrahend) as u32;
    (r, logical(a as u64 >= subtrahend, r != 0))
}

/// SUBTRACT LOGICAL WITH BORROW (64-bit).
pub fn slbg(a: u64, b: u64, cc: u8) -> (u64, u8) {
    let borrow_in = ((cc >> 1) & 1 == 0) as u128;
    let subtrahend = b as u128 + borrow_in;
    let r = (a as u128).wrapping_sub(subtrahend) as u64;
    (r, logical(a as u128 >= subtrahend, r != 0))
}

/// LOAD COMPLEMENT: cc of the negated value, 3 when the operand is the maximum negative number.
pub fn comp_s32(a: i32) -> (i32, u8) {
    match a.checked_neg() {
        Some(r) => (r, sign_class_i32(r)),
        None => (a, 3),
    }
}

pub fn comp_s64(a: i64) -> (i64, u8) {
    match a.checked_neg() {
        Some(r) => (r, sign_class_i64(r)),
        None => (a, 3),
    }
}

/// LOAD POSITIVE: 0 zero, 2 positive, 3 overflow.
pub fn abs_i32(a: i32) -> (i32, u8) {
    match a.checked_abs() {
        Some(0) => (0, 0),
        Some(r) => (r, 2),
        None => (a, 3),
    }
}

pub fn abs_i64(a: i64) -> (i64, u8) {
    match a.checked_abs() {
        Some(0) => (0, 0),
        Some(r) => (r, 2),
        None => (a, 3),
    }
}

/// LOAD NEGATIVE: never overflows.
pub fn nabs_i32(a: i32) -> (i32, u8) {
    let r = if a > 0 { -a } else { a };
    (r, if r == 0 { 0 } else { 1 })
}

pub fn nabs_i64(a: i64) -> (i64, u8) {
    let r = if a > 0 { -a } else { a };
    (r, if r == 0 { 0 } else { 1 })
}

/// INSERT CHARACTERS UNDER MASK.
///
/// `inserted` holds the inserted bytes left-justified in the positions selected by `mask`
/// (bit 3 of the mask selects the leftmost byte of the 32-bit field).
pub fn icm(mask: u8, inserted: u32) -> u8 {
    let mut selected = 0u32;
    for i in 0..4 {
        if mask & (8 >> i) != 0 {
            selected |= 0xff00_0000 >> (i * 8);
        }
    }
    let bits = inserted & selected;
    if mask & 0xf == 0 || bits == 0 {
        return 0;
    }
    let leftmost = 1u32 << (31 - selected.leading_zeros());
    if bits & leftmost != 0 {
        1
    } else {
        2
    }
}

/// TEST UNDER MASK for storage operands: 0 all selected zero, 3 all one, 1 mixed.
pub fn tm_32(value: u32, mask: u32) -> u8 {
    let r = value & mask;
    if r == 0 {
        0
    } else if r == mask {
        3
    } else {
        1
    }
}

/// TEST UNDER MASK for register halves: a mixed result reports whether the leftmost selected
/// bit is one (cc 2) or zero (cc 1).
pub fn tm_64(value: u64, mask: u64) -> u8 {
    let r = value & mask;
    if r == 0 {
        0
    } else if r == mask {
        3
    } else {
        let top = 1u64 << (63 - mask.leading_zeros());
        if r & top != 0 {
            2
        } else {
            1
        }
    }
}

#[inline]
pub fn nz_u32(r: u32) -> u8 {
    (r != 0) as u8
}

#[inline]
pub fn nz_u64(r: u64) -> u8 {
    (r != 0) as u8
}

#[inline]
fn ordering_cc(o: std::cmp::Ordering) -> u8 {
    match o {
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Less => 1,
        std::cmp::Ordering::Greater => 2,
    }
}

/// Compares: 0 equal, 1 first operand low, 2 first operand high.
pub fn cmp_s32(a: i32, b: i32) -> u8 {
    ordering_cc(a.cmp(&b))
}

pub fn cmp_s64(a: i64, b: i64) -> u8 {
    ordering_cc(a.cmp(&b))
}

pub fn cmp_u32(a: u32, b: u32) -> u8 {
    ordering_cc(a.cmp(&b))
}

pub fn cmp_u64(a: u64, b: u64) -> u8 {
    ordering_cc(a.cmp(&b))
}

/// Deferred condition-code operations, evaluated by [`calc_cc`] from the saved operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcOp {
    /// `dst` already holds the code.
    Static,
    Nz32,
    Nz64,
    LtGt0S32,
    LtGt0S64,
    LtGtS32,
    LtGtS64,
    LtGtU32,
    LtGtU64,
    AddS32,
    AddS64,
    AddU32,
    AddU64,
    AddC32,
    AddC64,
    SubS32,
    SubS64,
    SubU32,
    SubU64,
    SubB32,
    SubB64,
    Comp32,
    Comp64,
    Abs32,
    Abs64,
    Nabs32,
    Nabs64,
    Icm,
    Tm32,
    Tm64,
}

/// Lazily computes the condition code for `op` from the recorded operands.
///
/// `src` and `dst` are the first and second operands (or mask and value for the mask ops) and
/// `vr` is the result; only the carry-propagating ops look at `vr`.
pub fn calc_cc(op: CcOp, src: u64, dst: u64, vr: u64) -> u8 {
    match op {
        CcOp::Static => dst as u8 & 3,
        CcOp::Nz32 => nz_u32(dst as u32),
        CcOp::Nz64 => nz_u64(dst),
        CcOp::LtGt0S32 => sign_class_i32(dst as i32),
        CcOp::LtGt0S64 => sign_class_i64(dst as i64),
        CcOp::LtGtS32 => cmp_s32(src as i32, dst as i32),
        CcOp::LtGtS64 => cmp_s64(src as i64, dst as i64),
        CcOp::LtGtU32 => cmp_u32(src as u32, dst as u32),
        CcOp::LtGtU64 => cmp_u64(src, dst),
        CcOp::AddS32 => add_s32(src as i32, dst as i32),
        CcOp::AddS64 => add_s64(src as i64, dst as i64),
        CcOp::AddU32 => add_u32(src as u32, dst as u32),
        CcOp::AddU64 => add_u64(src, dst),
        CcOp::AddC32 => {
            let carry_in = (vr as u32).wrapping_sub(src as u32).wrapping_sub(dst as u32) & 1;
            addc_u32(src as u32, dst as u32, (carry_in as u8) << 1).1
        }
        CcOp::AddC64 => {
            let carry_in = vr.wrapping_sub(src).wrapping_sub(dst) & 1;
            addc_u64(src, dst, (carry_in as u8) << 1).1
        }
        CcOp::SubS32 => sub_s32(src as i32, dst as i32),
        CcOp::SubS64 => sub_s64(src as i64, dst as i64),
        CcOp::SubU32 => sub_u32(src as u32, dst as u32),
        CcOp::SubU64 => sub_u64(src, dst),
        CcOp::SubB32 => {
            let borrow_in = (src as u32).wrapping_sub(dst as u32).wrapping_sub(vr as u32) & 1;
            slb(src as u32, dst as u32, if borrow_in == 0 { 2 } else { 0 }).1
        }
        CcOp::SubB64 => {
            let borrow_in = src.wrapping_sub(dst).wrapping_sub(vr) & 1;
            slbg(src, dst, if borrow_in == 0 { 2 } else { 0 }).1
        }
        CcOp::Comp32 => comp_s32(dst as i32).1,
        CcOp::Comp64 => comp_s64(dst as i64).1,
        CcOp::Abs32 => abs_i32(dst as i32).1,
        CcOp::Abs64 => abs_i64(dst as i64).1,
        CcOp::Nabs32 => nabs_i32(dst as i32).1,
        CcOp::Nabs64 => nabs_i64(dst as i64).1,
        CcOp::Icm => icm(src as u8, dst as u32),
        CcOp::Tm32 => tm_32(dst as u32, src as u32),
        CcOp::Tm64 => tm_64(dst, src),
    }
}
