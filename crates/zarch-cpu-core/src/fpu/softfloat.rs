//! IEEE 754 binary arithmetic on raw encodings of the short (binary32), long (binary64) and
//! extended (binary128) formats.
//!
//! Values travel as `u128` bit patterns, right-aligned. Every operation unpacks its operands,
//! computes the exact result (or the exact result plus a sticky bit) in wide integer arithmetic
//! and rounds once. Tininess is detected before rounding; underflow is signalled when the result
//! is tiny and inexact.

use bitflags::bitflags;

bitflags! {
    /// IEEE exception conditions, laid out like the FPC flag and mask bytes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FpFlags: u8 {
        const INVALID = 0x80;
        const DIVBYZERO = 0x40;
        const OVERFLOW = 0x20;
        const UNDERFLOW = 0x10;
        const INEXACT = 0x08;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundingMode {
    NearestEven,
    NearestAway,
    TowardZero,
    Up,
    Down,
    /// Round toward zero, then force the last bit to one if inexact ("prepare for shorter
    /// precision"), so a later rounding to a narrower format is not double rounded.
    PrepareShorter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub exp_bits: u32,
    pub frac_bits: u32,
}

impl Format {
    pub const SHORT: Format = Format {
        exp_bits: 8,
        frac_bits: 23,
    };
    pub const LONG: Format = Format {
        exp_bits: 11,
        frac_bits: 52,
    };
    pub const EXTENDED: Format = Format {
        exp_bits: 15,
        frac_bits: 112,
    };

    #[inline]
    pub const fn precision(self) -> u32 {
        self.frac_bits + 1
    }

    #[inline]
    pub const fn bias(self) -> i32 {
        (1 << (self.exp_bits - 1)) - 1
    }

    #[inline]
    pub const fn emin(self) -> i32 {
        1 - self.bias()
    }

    #[inline]
    pub const fn emax(self) -> i32 {
        self.bias()
    }

    #[inline]
    pub const fn sign_bit(self) -> u128 {
        1 << (self.exp_bits + self.frac_bits)
    }

    #[inline]
    const fn exp_all_ones(self) -> u128 {
        (1 << self.exp_bits) - 1
    }

    #[inline]
    const fn frac_mask(self) -> u128 {
        (1 << self.frac_bits) - 1
    }

    #[inline]
    const fn quiet_bit(self) -> u128 {
        1 << (self.frac_bits - 1)
    }

    #[inline]
    fn exp_field(self, bits: u128) -> u128 {
        (bits >> self.frac_bits) & self.exp_all_ones()
    }

    #[inline]
    fn frac(self, bits: u128) -> u128 {
        bits & self.frac_mask()
    }

    #[inline]
    fn encode(self, sign: bool, exp_field: u128, frac: u128) -> u128 {
        ((sign as u128) << (self.exp_bits + self.frac_bits)) | (exp_field << self.frac_bits) | frac
    }

    pub fn zero(self, sign: bool) -> u128 {
        self.encode(sign, 0, 0)
    }

    pub fn infinity(self, sign: bool) -> u128 {
        self.encode(sign, self.exp_all_ones(), 0)
    }

    /// The default NaN: positive, quiet, no payload.
    pub fn default_nan(self) -> u128 {
        self.encode(false, self.exp_all_ones(), self.quiet_bit())
    }

    fn max_finite(self, sign: bool) -> u128 {
        self.encode(sign, self.exp_all_ones() - 1, self.frac_mask())
    }

    #[inline]
    pub fn is_negative(self, bits: u128) -> bool {
        bits & self.sign_bit() != 0
    }

    pub fn is_nan(self, bits: u128) -> bool {
        self.exp_field(bits) == self.exp_all_ones() && self.frac(bits) != 0
    }

    pub fn is_signaling_nan(self, bits: u128) -> bool {
        self.is_nan(bits) && bits & self.quiet_bit() == 0
    }

    #[inline]
    pub fn quiet(self, bits: u128) -> u128 {
        bits | self.quiet_bit()
    }

    fn unpack(self, bits: u128) -> (bool, Value) {
        let sign = self.is_negative(bits);
        let e = self.exp_field(bits);
        let f = self.frac(bits);
        let value = if e == self.exp_all_ones() {
            if f == 0 {
                Value::Inf
            } else {
                Value::NaN
            }
        } else if e == 0 {
            if f == 0 {
                Value::Zero
            } else {
                // Subnormal: normalize so the leading one sits at bit p-1.
                let msb = 127 - f.leading_zeros();
                let shift = self.frac_bits - msb;
                Value::Finite {
                    exp: self.emin() - shift as i32,
                    sig: f << shift,
                }
            }
        } else {
            Value::Finite {
                exp: e as i32 - self.bias(),
                sig: f | (1 << self.frac_bits),
            }
        };
        (sign, value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Value {
    Zero,
    Inf,
    NaN,
    /// `sig * 2^(exp - (p - 1))` with the leading one of `sig` at bit `p - 1`.
    Finite { exp: i32, sig: u128 },
}

/// Data classes as used by TEST DATA CLASS and LOAD AND TEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Zero,
    Normal,
    Subnormal,
    Infinity,
    QuietNaN,
    SignalingNaN,
}

pub fn classify(fmt: Format, bits: u128) -> (bool, Class) {
    let sign = fmt.is_negative(bits);
    let e = fmt.exp_field(bits);
    let f = fmt.frac(bits);
    let class = if e == fmt.exp_all_ones() {
        if f == 0 {
            Class::Infinity
        } else if f & fmt.quiet_bit() != 0 {
            Class::QuietNaN
        } else {
            Class::SignalingNaN
        }
    } else if e == 0 {
        if f == 0 {
            Class::Zero
        } else {
            Class::Subnormal
        }
    } else {
        Class::Normal
    };
    (sign, class)
}

/// Unsigned 256-bit integer, just wide enough for exact products and aligned sums of
/// binary128 significands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
struct U256 {
    hi: u128,
    lo: u128,
}

impl U256 {
    const ZERO: U256 = U256 { hi: 0, lo: 0 };

    #[inline]
    fn from_u128(lo: u128) -> Self {
        U256 { hi: 0, lo }
    }

    #[inline]
    fn is_zero(self) -> bool {
        self.hi == 0 && self.lo == 0
    }

    /// Number of significant bits.
    fn bits(self) -> u32 {
        if self.hi != 0 {
            256 - self.hi.leading_zeros()
        } else {
            128 - self.lo.leading_zeros()
        }
    }

    fn shl(self, n: u32) -> Self {
        match n {
            0 => self,
            1..=127 => U256 {
                hi: (self.hi << n) | (self.lo >> (128 - n)),
                lo: self.lo << n,
            },
            128..=255 => U256 {
                hi: self.lo << (n - 128),
                lo: 0,
            },
            _ => U256::ZERO,
        }
    }

    fn shr(self, n: u32) -> Self {
        match n {
            0 => self,
            1..=127 => U256 {
                hi: self.hi >> n,
                lo: (self.lo >> n) | (self.hi << (128 - n)),
            },
            128..=255 => U256 {
                hi: 0,
                lo: self.hi >> (n - 128),
            },
            _ => U256::ZERO,
        }
    }

    /// Right shift that ORs any lost bits into the least significant bit.
    fn shr_jam(self, n: u32) -> Self {
        let r = self.shr(n);
        if r.shl(n) != self || (n >= 256 && !self.is_zero()) {
            U256 {
                hi: r.hi,
                lo: r.lo | 1,
            }
        } else {
            r
        }
    }

    fn add(self, o: Self) -> Self {
        let (lo, carry) = self.lo.overflowing_add(o.lo);
        U256 {
            hi: self.hi.wrapping_add(o.hi).wrapping_add(carry as u128),
            lo,
        }
    }

    fn sub(self, o: Self) -> Self {
        let (lo, borrow) = self.lo.overflowing_sub(o.lo);
        U256 {
            hi: self.hi.wrapping_sub(o.hi).wrapping_sub(borrow as u128),
            lo,
        }
    }

    /// Full 128 x 128 -> 256-bit product.
    fn mul(a: u128, b: u128) -> Self {
        const M: u128 = u64::MAX as u128;
        let (a0, a1) = (a & M, a >> 64);
        let (b0, b1) = (b & M, b >> 64);
        let p00 = a0 * b0;
        let p01 = a0 * b1;
        let p10 = a1 * b0;
        let p11 = a1 * b1;
        let mid = (p00 >> 64) + (p01 & M) + (p10 & M);
        U256 {
            hi: p11 + (p01 >> 64) + (p10 >> 64) + (mid >> 64),
            lo: (p00 & M) | (mid << 64),
        }
    }

    /// Integer square root and whether a remainder was left.
    fn isqrt(self) -> (u128, bool) {
        if self.is_zero() {
            return (0, false);
        }
        let mut x = self;
        let mut res = U256::ZERO;
        let top = (self.bits() - 1) & !1;
        let mut bit = U256::from_u128(1).shl(top);
        while !bit.is_zero() {
            let trial = res.add(bit);
            if x >= trial {
                x = x.sub(trial);
                res = res.shr(1).add(bit);
            } else {
                res = res.shr(1);
            }
            bit = bit.shr(2);
        }
        (res.lo, !x.is_zero())
    }
}

/// Rounds `sig` (leading one at bit p+2, three extra bits below the kept precision) with
/// unbiased exponent `exp` and packs it.
fn round_pack(
    fmt: Format,
    mode: RoundingMode,
    sign: bool,
    mut exp: i32,
    mut sig: u128,
    mut sticky: bool,
    flags: &mut FpFlags,
) -> u128 {
    let p = fmt.precision();
    let tiny = exp < fmt.emin();
    if tiny {
        let shift = (fmt.emin() - exp) as u32;
        if shift >= 128 {
            sticky |= sig != 0;
            sig = 0;
        } else {
            sticky |= sig & ((1u128 << shift) - 1) != 0;
            sig >>= shift;
        }
        exp = fmt.emin();
    }

    let rem = sig & 7;
    let mut m = sig >> 3;
    let inexact = rem != 0 || sticky;
    let round_up = match mode {
        RoundingMode::NearestEven => rem > 4 || (rem == 4 && (sticky || m & 1 == 1)),
        RoundingMode::NearestAway => rem >= 4,
        RoundingMode::TowardZero | RoundingMode::PrepareShorter => false,
        RoundingMode::Up => inexact && !sign,
        RoundingMode::Down => inexact && sign,
    };
    if round_up {
        m += 1;
        if m == 1u128 << p {
            m >>= 1;
            exp += 1;
        }
    }
    if mode == RoundingMode::PrepareShorter && inexact {
        m |= 1;
    }

    if exp > fmt.emax() {
        *flags |= FpFlags::OVERFLOW | FpFlags::INEXACT;
        let to_infinity = match mode {
            RoundingMode::NearestEven | RoundingMode::NearestAway => true,
            RoundingMode::TowardZero | RoundingMode::PrepareShorter => false,
            RoundingMode::Up => !sign,
            RoundingMode::Down => sign,
        };
        return if to_infinity {
            fmt.infinity(sign)
        } else {
            fmt.max_finite(sign)
        };
    }
    if inexact {
        *flags |= FpFlags::INEXACT;
        if tiny {
            *flags |= FpFlags::UNDERFLOW;
        }
    }
    if m == 0 {
        return fmt.zero(sign);
    }
    let biased = if m >> (p - 1) != 0 {
        (exp + fmt.bias()) as u128
    } else {
        0
    };
    fmt.encode(sign, biased, m & fmt.frac_mask())
}

/// Rounds the exact value `sig * 2^exp0` (nonzero `sig`, plus `sticky` for nonzero bits below
/// bit 0) to `fmt`.
fn round_wide(
    fmt: Format,
    mode: RoundingMode,
    sign: bool,
    exp0: i32,
    sig: U256,
    sticky: bool,
    flags: &mut FpFlags,
) -> u128 {
    let msb = sig.bits() - 1;
    let target = fmt.precision() + 2;
    let aligned = if msb > target {
        sig.shr_jam(msb - target)
    } else {
        sig.shl(target - msb)
    };
    round_pack(fmt, mode, sign, exp0 + msb as i32, aligned.lo, sticky, flags)
}

fn propagate_nan(fmt: Format, operands: &[u128], flags: &mut FpFlags) -> u128 {
    if let Some(&snan) = operands.iter().find(|&&x| fmt.is_signaling_nan(x)) {
        *flags |= FpFlags::INVALID;
        return fmt.quiet(snan);
    }
    operands
        .iter()
        .copied()
        .find(|&x| fmt.is_nan(x))
        .unwrap_or_else(|| fmt.default_nan())
}

fn invalid(fmt: Format, flags: &mut FpFlags) -> u128 {
    *flags |= FpFlags::INVALID;
    fmt.default_nan()
}

/// Sign of an exact zero sum of operands with opposite signs.
#[inline]
fn zero_sum_sign(mode: RoundingMode) -> bool {
    mode == RoundingMode::Down
}

/// Exact sum of two nonzero finite values given as `(sign, exp0, sig)` with `value = sig *
/// 2^exp0`, both significands already widened so the larger one has its leading bit high in the
/// 256-bit range. Returns `None` for an exact zero.
fn add_aligned(
    a: (bool, i32, U256),
    b: (bool, i32, U256),
) -> Option<(bool, i32, U256)> {
    let (big, small) = if a.1 >= b.1 { (a, b) } else { (b, a) };
    let diff = (big.1 - small.1) as u32;
    let small_sig = small.2.shr_jam(diff);
    if big.0 == small.0 {
        return Some((big.0, big.1, big.2.add(small_sig)));
    }
    match big.2.cmp(&small_sig) {
        std::cmp::Ordering::Equal => None,
        std::cmp::Ordering::Greater => Some((big.0, big.1, big.2.sub(small_sig))),
        std::cmp::Ordering::Less => Some((small.0, big.1, small_sig.sub(big.2))),
    }
}

/// Left-aligns a finite significand so its leading one sits at bit 250.
#[inline]
fn widen(exp0: i32, sig: U256) -> (i32, U256) {
    let shift = 250 - (sig.bits() - 1);
    (exp0 - shift as i32, sig.shl(shift))
}

pub fn add(fmt: Format, mode: RoundingMode, a: u128, b: u128, flags: &mut FpFlags) -> u128 {
    let (sa, va) = fmt.unpack(a);
    let (sb, vb) = fmt.unpack(b);
    let p1 = fmt.precision() as i32 - 1;
    match (va, vb) {
        (Value::NaN, _) | (_, Value::NaN) => propagate_nan(fmt, &[a, b], flags),
        (Value::Inf, Value::Inf) if sa != sb => invalid(fmt, flags),
        (Value::Inf, _) => fmt.infinity(sa),
        (_, Value::Inf) => fmt.infinity(sb),
        (Value::Zero, Value::Zero) => {
            fmt.zero(if sa == sb { sa } else { zero_sum_sign(mode) })
        }
        (Value::Zero, _) => b,
        (_, Value::Zero) => a,
        (Value::Finite { exp: ea, sig: ma }, Value::Finite { exp: eb, sig: mb }) => {
            let (xa, wa) = widen(ea - p1, U256::from_u128(ma));
            let (xb, wb) = widen(eb - p1, U256::from_u128(mb));
            match add_aligned((sa, xa, wa), (sb, xb, wb)) {
                None => fmt.zero(zero_sum_sign(mode)),
                Some((sign, exp0, sig)) => round_wide(fmt, mode, sign, exp0, sig, false, flags),
            }
        }
    }
}

pub fn sub(fmt: Format, mode: RoundingMode, a: u128, b: u128, flags: &mut FpFlags) -> u128 {
    let b = if fmt.is_nan(b) { b } else { b ^ fmt.sign_bit() };
    add(fmt, mode, a, b, flags)
}

pub fn mul(fmt: Format, mode: RoundingMode, a: u128, b: u128, flags: &mut FpFlags) -> u128 {
    let (sa, va) = fmt.unpack(a);
    let (sb, vb) = fmt.unpack(b);
    let sign = sa != sb;
    let p1 = fmt.precision() as i32 - 1;
    match (va, vb) {
        (Value::NaN, _) | (_, Value::NaN) => propagate_nan(fmt, &[a, b], flags),
        (Value::Inf, Value::Zero) | (Value::Zero, Value::Inf) => invalid(fmt, flags),
        (Value::Inf, _) | (_, Value::Inf) => fmt.infinity(sign),
        (Value::Zero, _) | (_, Value::Zero) => fmt.zero(sign),
        (Value::Finite { exp: ea, sig: ma }, Value::Finite { exp: eb, sig: mb }) => {
            let product = U256::mul(ma, mb);
            round_wide(fmt, mode, sign, ea + eb - 2 * p1, product, false, flags)
        }
    }
}

pub fn div(fmt: Format, mode: RoundingMode, a: u128, b: u128, flags: &mut FpFlags) -> u128 {
    let (sa, va) = fmt.unpack(a);
    let (sb, vb) = fmt.unpack(b);
    let sign = sa != sb;
    match (va, vb) {
        (Value::NaN, _) | (_, Value::NaN) => propagate_nan(fmt, &[a, b], flags),
        (Value::Inf, Value::Inf) | (Value::Zero, Value::Zero) => invalid(fmt, flags),
        (Value::Inf, _) => fmt.infinity(sign),
        (_, Value::Inf) => fmt.zero(sign),
        (Value::Zero, _) => fmt.zero(sign),
        (_, Value::Zero) => {
            *flags |= FpFlags::DIVBYZERO;
            fmt.infinity(sign)
        }
        (Value::Finite { exp: ea, sig: ma }, Value::Finite { exp: eb, sig: mb }) => {
            // Restoring division: q = floor(ma * 2^(n-1) / mb) with enough bits for rounding.
            let n = fmt.precision() + 4;
            let mut rem = ma;
            let mut q: u128 = 0;
            for _ in 0..n {
                q <<= 1;
                if rem >= mb {
                    rem -= mb;
                    q |= 1;
                }
                rem <<= 1;
            }
            round_wide(
                fmt,
                mode,
                sign,
                ea - eb - (n as i32 - 1),
                U256::from_u128(q),
                rem != 0,
                flags,
            )
        }
    }
}

pub fn sqrt(fmt: Format, mode: RoundingMode, a: u128, flags: &mut FpFlags) -> u128 {
    let (sign, v) = fmt.unpack(a);
    match v {
        Value::NaN => propagate_nan(fmt, &[a], flags),
        Value::Zero => a,
        _ if sign => invalid(fmt, flags),
        Value::Inf => a,
        Value::Finite { exp, sig } => {
            let mut e = exp - (fmt.precision() as i32 - 1);
            let mut m = U256::from_u128(sig);
            if e.rem_euclid(2) != 0 {
                m = m.shl(1);
                e -= 1;
            }
            // Scale by 2^(2k) so the root carries at least p+3 significant bits.
            let k = (fmt.precision() + 6) / 2 + 1;
            let (root, inexact) = m.shl(2 * k).isqrt();
            round_wide(
                fmt,
                mode,
                false,
                e / 2 - k as i32,
                U256::from_u128(root),
                inexact,
                flags,
            )
        }
    }
}

/// Fused multiply-add: `a * b + c` with a single rounding.
pub fn mul_add(
    fmt: Format,
    mode: RoundingMode,
    a: u128,
    b: u128,
    c: u128,
    flags: &mut FpFlags,
) -> u128 {
    let (sa, va) = fmt.unpack(a);
    let (sb, vb) = fmt.unpack(b);
    let (sc, vc) = fmt.unpack(c);
    let sp = sa != sb;
    let p1 = fmt.precision() as i32 - 1;

    if matches!(va, Value::NaN) || matches!(vb, Value::NaN) || matches!(vc, Value::NaN) {
        return propagate_nan(fmt, &[a, b, c], flags);
    }
    match (va, vb) {
        (Value::Inf, Value::Zero) | (Value::Zero, Value::Inf) => return invalid(fmt, flags),
        (Value::Inf, _) | (_, Value::Inf) => {
            return match vc {
                Value::Inf if sc != sp => invalid(fmt, flags),
                _ => fmt.infinity(sp),
            };
        }
        _ => {}
    }
    if vc == Value::Inf {
        return fmt.infinity(sc);
    }

    let product = match (va, vb) {
        (Value::Finite { exp: ea, sig: ma }, Value::Finite { exp: eb, sig: mb }) => {
            Some((ea + eb - 2 * p1, U256::mul(ma, mb)))
        }
        _ => None,
    };
    // Infinite and NaN addends are gone by now.
    match (product, vc) {
        (None, Value::Zero) => fmt.zero(if sp == sc { sp } else { zero_sum_sign(mode) }),
        (None, _) => c,
        (Some((exp0, sig)), Value::Finite { exp: ec, sig: mc }) => {
            let (xp, wp) = widen(exp0, sig);
            let (xc, wc) = widen(ec - p1, U256::from_u128(mc));
            match add_aligned((sp, xp, wp), (sc, xc, wc)) {
                None => fmt.zero(zero_sum_sign(mode)),
                Some((sign, e, s)) => round_wide(fmt, mode, sign, e, s, false, flags),
            }
        }
        (Some((exp0, sig)), _) => round_wide(fmt, mode, sp, exp0, sig, false, flags),
    }
}

/// Compare: 0 equal, 1 first low, 2 first high, 3 unordered. A signaling compare flags invalid
/// for any NaN, a quiet compare only for signaling NaNs.
pub fn compare(fmt: Format, a: u128, b: u128, signaling: bool, flags: &mut FpFlags) -> u8 {
    if fmt.is_nan(a) || fmt.is_nan(b) {
        if signaling || fmt.is_signaling_nan(a) || fmt.is_signaling_nan(b) {
            *flags |= FpFlags::INVALID;
        }
        return 3;
    }
    let mag = !fmt.sign_bit();
    let (ma, mb) = (a & mag, b & mag);
    if ma == 0 && mb == 0 {
        return 0;
    }
    let (na, nb) = (fmt.is_negative(a), fmt.is_negative(b));
    if na != nb {
        return if na { 1 } else { 2 };
    }
    let ord = if na { mb.cmp(&ma) } else { ma.cmp(&mb) };
    match ord {
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Less => 1,
        std::cmp::Ordering::Greater => 2,
    }
}

/// Converts between formats, rounding when narrowing.
pub fn convert(
    from: Format,
    to: Format,
    mode: RoundingMode,
    bits: u128,
    flags: &mut FpFlags,
) -> u128 {
    let (sign, v) = from.unpack(bits);
    match v {
        Value::NaN => {
            if from.is_signaling_nan(bits) {
                *flags |= FpFlags::INVALID;
            }
            let payload = from.frac(bits);
            let frac = if to.frac_bits >= from.frac_bits {
                payload << (to.frac_bits - from.frac_bits)
            } else {
                payload >> (from.frac_bits - to.frac_bits)
            };
            to.encode(sign, to.exp_all_ones(), (frac & to.frac_mask()) | to.quiet_bit())
        }
        Value::Inf => to.infinity(sign),
        Value::Zero => to.zero(sign),
        Value::Finite { exp, sig } => round_wide(
            to,
            mode,
            sign,
            exp - (from.precision() as i32 - 1),
            U256::from_u128(sig),
            false,
            flags,
        ),
    }
}

pub fn from_i64(fmt: Format, mode: RoundingMode, v: i64, flags: &mut FpFlags) -> u128 {
    if v == 0 {
        return fmt.zero(false);
    }
    let mag = v.unsigned_abs() as u128;
    round_wide(fmt, mode, v < 0, 0, U256::from_u128(mag), false, flags)
}

/// Shifts `sig` right by `s` bits, rounding the discarded part per `mode`.
fn shr_round(sig: u128, s: u32, mode: RoundingMode, sign: bool) -> (u128, bool) {
    if s == 0 {
        return (sig, false);
    }
    let (q, half, sticky) = match s {
        1..=127 => (
            sig >> s,
            (sig >> (s - 1)) & 1 == 1,
            sig & ((1u128 << (s - 1)) - 1) != 0,
        ),
        128 => (0, sig >> 127 == 1, sig & (u128::MAX >> 1) != 0),
        _ => (0, false, sig != 0),
    };
    let inexact = half || sticky;
    let up = match mode {
        RoundingMode::NearestEven => half && (sticky || q & 1 == 1),
        RoundingMode::NearestAway => half,
        RoundingMode::TowardZero => false,
        RoundingMode::PrepareShorter => inexact && q & 1 == 0,
        RoundingMode::Up => inexact && !sign,
        RoundingMode::Down => inexact && sign,
    };
    (q + up as u128, inexact)
}

/// Converts to a signed integer of `width` bits (32 or 64).
///
/// Returns the result and the condition code: 0 zero, 1 negative, 2 positive, 3 for NaN,
/// infinity or an out-of-range value (which also flags invalid and yields the maximum
/// magnitude of the operand's sign, the maximum negative number for NaN).
pub fn to_int(
    fmt: Format,
    mode: RoundingMode,
    bits: u128,
    width: u32,
    flags: &mut FpFlags,
) -> (i64, u8) {
    let min = -(1i128 << (width - 1));
    let max = (1i128 << (width - 1)) - 1;
    let saturate = |sign: bool| if sign { min as i64 } else { max as i64 };
    let (sign, v) = fmt.unpack(bits);
    match v {
        Value::NaN => {
            *flags |= FpFlags::INVALID;
            (min as i64, 3)
        }
        Value::Inf => {
            *flags |= FpFlags::INVALID;
            (saturate(sign), 3)
        }
        Value::Zero => (0, 0),
        Value::Finite { exp, sig } => {
            if exp >= width as i32 {
                *flags |= FpFlags::INVALID;
                return (saturate(sign), 3);
            }
            let shift = fmt.precision() as i32 - 1 - exp;
            let (mag, inexact) = if shift <= 0 {
                (sig << (-shift) as u32, false)
            } else {
                shr_round(sig, shift as u32, mode, sign)
            };
            let value = if sign { -(mag as i128) } else { mag as i128 };
            if value < min || value > max {
                *flags |= FpFlags::INVALID;
                return (saturate(sign), 3);
            }
            if inexact {
                *flags |= FpFlags::INEXACT;
            }
            (value as i64, if sign { 1 } else { 2 })
        }
    }
}

/// Rounds to an integral value in the same format.
pub fn round_to_integral(fmt: Format, mode: RoundingMode, bits: u128, flags: &mut FpFlags) -> u128 {
    let (sign, v) = fmt.unpack(bits);
    match v {
        Value::NaN => propagate_nan(fmt, &[bits], flags),
        Value::Inf | Value::Zero => bits,
        Value::Finite { exp, sig } => {
            let p1 = fmt.precision() as i32 - 1;
            if exp >= p1 {
                return bits;
            }
            let (mag, inexact) = shr_round(sig, (p1 - exp) as u32, mode, sign);
            if inexact {
                *flags |= FpFlags::INEXACT;
            }
            if mag == 0 {
                return fmt.zero(sign);
            }
            let mut exact = FpFlags::empty();
            round_wide(fmt, mode, sign, 0, U256::from_u128(mag), false, &mut exact)
        }
    }
}
