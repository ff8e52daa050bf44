// SPDX-License-Identifier: LGPL-2.1-or-later
// See Notices.txt for copyright information

use bitflags::bitflags;
use num_bigint::BigInt;
use num_integer::Integer;
use num_rational::Ratio;
use num_traits::One;
use num_traits::Signed;
use num_traits::ToPrimitive;
use num_traits::Zero;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// widest total bit count for which every value of a format is exactly
/// representable in an IEEE 754 double; formats beyond this use the
/// arbitrary-precision representation
pub const MAX_NARROW_WIDTH: u32 = 53;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(u8)]
pub enum RoundingMode {
    /// discard the bits below the target LSB (floor toward negative infinity)
    Trunc = 0,
    /// round to nearest, ties toward positive infinity (`floor(x + 0.5)`)
    NonSymPos = 1,
    /// round to nearest, ties toward negative infinity
    NonSymNeg = 2,
    /// round to nearest, ties outward away from zero
    SymInf = 3,
    /// round to nearest, ties inward toward zero
    SymZero = 4,
    /// round to nearest, ties to the even result
    ConvEven = 5,
    /// round to nearest, ties to the odd result
    ConvOdd = 6,
}

impl Default for RoundingMode {
    fn default() -> Self {
        RoundingMode::Trunc
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(u8)]
pub enum SaturationMode {
    /// wrap with two's-complement semantics, no report
    None = 0,
    /// wrap with two's-complement semantics, report out-of-range values
    Warn = 1,
    /// clip to the nearest representable boundary, no report
    Sat = 2,
    /// clip to the nearest representable boundary, report when clipping
    SatWarn = 3,
}

impl Default for SaturationMode {
    fn default() -> Self {
        SaturationMode::None
    }
}

impl SaturationMode {
    #[inline]
    pub fn clips(self) -> bool {
        match self {
            SaturationMode::Sat | SaturationMode::SatWarn => true,
            SaturationMode::None | SaturationMode::Warn => false,
        }
    }
    #[inline]
    pub fn warns(self) -> bool {
        match self {
            SaturationMode::Warn | SaturationMode::SatWarn => true,
            SaturationMode::None | SaturationMode::Sat => false,
        }
    }
}

macro_rules! impl_mode_names {
    ($t:ident, $parse_error:ident, $($variant:ident,)+) => {
        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                match self {
                    $($t::$variant => f.write_str(stringify!($variant)),)+
                }
            }
        }

        impl FromStr for $t {
            type Err = FixError;
            fn from_str(text: &str) -> Result<Self> {
                match text {
                    $(stringify!($variant) => Ok($t::$variant),)+
                    _ => Err(FixError::$parse_error(text.into())),
                }
            }
        }
    };
}

impl_mode_names!(
    RoundingMode,
    InvalidRoundingMode,
    Trunc,
    NonSymPos,
    NonSymNeg,
    SymInf,
    SymZero,
    ConvEven,
    ConvOdd,
);

impl_mode_names!(SaturationMode, InvalidSaturationMode, None, Warn, Sat, SatWarn,);

bitflags! {
    pub struct StatusFlags: u32 {
        const OUT_OF_RANGE = 0b1;
    }
}

impl Default for StatusFlags {
    fn default() -> Self {
        StatusFlags::empty()
    }
}

/// diagnostic side channel threaded through the operations; the `Warn` and
/// `SatWarn` saturation modes report out-of-range values here without
/// affecting the numeric result
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
#[non_exhaustive]
pub struct FixState {
    pub status_flags: StatusFlags,
}

#[derive(Clone, Eq, PartialEq, Debug, Error)]
pub enum FixError {
    #[error("invalid format ({signed},{int_bits},{frac_bits}): int_bits + frac_bits must be >= 1")]
    InvalidFormat {
        signed: bool,
        int_bits: i32,
        frac_bits: i32,
    },
    #[error("malformed format descriptor: {0:?}")]
    MalformedFormat(String),
    #[error("invalid rounding mode: {0:?}")]
    InvalidRoundingMode(String),
    #[error("invalid saturation mode: {0:?}")]
    InvalidSaturationMode(String),
    #[error("cannot negate a value in unsigned format {0}")]
    UnsignedNegation(FixFormat),
    #[error("shift by {n} overflows the bit counts of format {fmt}")]
    ShiftOverflow { fmt: FixFormat, n: i32 },
    #[error("bit index {index} out of range for width {width}")]
    IndexOutOfRange { index: u32, width: u32 },
    #[error("operand format mismatch: expected {expected}, got {got}")]
    FormatMismatch { expected: FixFormat, got: FixFormat },
    #[error("operand length mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, FixError>;

/// fixed-point format: `signed` selects a sign bit, `int_bits` counts bits
/// above the binary point and `frac_bits` bits below it; a value is a
/// two's-complement integer scaled by `2^-frac_bits`. `int_bits` and
/// `frac_bits` may be negative, describing an implicit leading/trailing
/// truncation offset, as long as at least one representable bit remains.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct FixFormat {
    signed: bool,
    int_bits: i32,
    frac_bits: i32,
}

impl FixFormat {
    pub fn new(signed: bool, int_bits: i32, frac_bits: i32) -> Result<Self> {
        if int_bits.checked_add(frac_bits).map_or(true, |v| v < 1) {
            return Err(FixError::InvalidFormat {
                signed,
                int_bits,
                frac_bits,
            });
        }
        Ok(Self {
            signed,
            int_bits,
            frac_bits,
        })
    }
    #[inline]
    pub const fn signed(self) -> bool {
        self.signed
    }
    #[inline]
    pub const fn int_bits(self) -> i32 {
        self.int_bits
    }
    #[inline]
    pub const fn frac_bits(self) -> i32 {
        self.frac_bits
    }
    #[inline]
    pub const fn sign_bits(self) -> i32 {
        self.signed as i32
    }
    #[inline]
    pub fn width(self) -> u32 {
        (self.sign_bits() + self.int_bits + self.frac_bits) as u32
    }
    #[inline]
    pub fn is_wide(self) -> bool {
        self.width() > MAX_NARROW_WIDTH
    }
    /// magnitude bits below the sign, used for raw two's-complement spans
    #[inline]
    fn raw_bits(self) -> usize {
        (self.int_bits + self.frac_bits) as usize
    }
    /// largest representable value in raw LSB units: `2^(I+F) - 1`
    pub fn max_raw(self) -> BigInt {
        (BigInt::one() << self.raw_bits()) - 1i32
    }
    /// smallest representable value in raw LSB units: `-2^(I+F)` when signed,
    /// `0` when unsigned
    pub fn min_raw(self) -> BigInt {
        if self.signed {
            -(BigInt::one() << self.raw_bits())
        } else {
            BigInt::zero()
        }
    }
    /// format large enough to hold any sum or difference of values in `self`
    /// and `rhs` without rounding or saturation
    pub fn for_add_sub(self, rhs: Self) -> Self {
        Self {
            signed: self.signed | rhs.signed,
            int_bits: self.int_bits.max(rhs.int_bits) + 1,
            frac_bits: self.frac_bits.max(rhs.frac_bits),
        }
    }
    /// format large enough to hold any product of values in `self` and `rhs`
    pub fn for_mult(self, rhs: Self) -> Self {
        let signed = self.signed | rhs.signed;
        Self {
            signed,
            int_bits: self.int_bits + rhs.int_bits + signed as i32,
            frac_bits: self.frac_bits + rhs.frac_bits,
        }
    }
    /// format large enough to hold the negation of any value in `self`
    pub fn for_neg(self) -> Result<Self> {
        if !self.signed {
            return Err(FixError::UnsignedNegation(self));
        }
        Ok(Self {
            signed: true,
            int_bits: self.int_bits + 1,
            frac_bits: self.frac_bits,
        })
    }
    /// format large enough to hold the absolute value of any value in `self`;
    /// the identity for unsigned formats
    pub fn for_abs(self) -> Self {
        if self.signed {
            Self {
                signed: true,
                int_bits: self.int_bits + 1,
                frac_bits: self.frac_bits,
            }
        } else {
            self
        }
    }
    /// format describing `self` shifted left by `n` bits (negative `n` shifts
    /// right); the raw bit pattern is unchanged, only the binary point moves
    pub fn for_shift(self, n: i32) -> Result<Self> {
        match (self.int_bits.checked_add(n), self.frac_bits.checked_sub(n)) {
            (Some(int_bits), Some(frac_bits)) => Ok(Self {
                signed: self.signed,
                int_bits,
                frac_bits,
            }),
            _ => Err(FixError::ShiftOverflow { fmt: self, n }),
        }
    }
}

impl fmt::Display for FixFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({},{},{})", self.signed, self.int_bits, self.frac_bits)
    }
}

impl fmt::Debug for FixFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "FixFormat({},{},{})",
            self.signed, self.int_bits, self.frac_bits
        )
    }
}

impl FromStr for FixFormat {
    type Err = FixError;
    fn from_str(text: &str) -> Result<Self> {
        let malformed = || FixError::MalformedFormat(text.into());
        let inner = text.trim();
        let inner = inner.strip_prefix('(').ok_or_else(malformed)?;
        let inner = inner.strip_suffix(')').ok_or_else(malformed)?;
        let mut fields = inner.splitn(3, ',').map(str::trim);
        let signed = match fields.next() {
            Some("true") => true,
            Some("false") => false,
            _ => return Err(malformed()),
        };
        let int_bits = fields
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(malformed)?;
        let frac_bits = fields
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(malformed)?;
        Self::new(signed, int_bits, frac_bits)
    }
}

fn exp2(n: i32) -> f64 {
    (2.0f64).powi(n)
}

/// double-backed implementations, exact while every format involved stays
/// within [`MAX_NARROW_WIDTH`] total bits
pub(crate) mod narrow {
    use super::{exp2, FixFormat, RoundingMode, SaturationMode};

    /// round `value`, known to carry `src_frac` fractional bits, to
    /// `dst_frac` fractional bits; a no-op when no bits are discarded
    pub(crate) fn round(value: f64, src_frac: i32, dst_frac: i32, mode: RoundingMode) -> f64 {
        if dst_frac >= src_frac {
            return value;
        }
        let scaled = value * exp2(dst_frac);
        // one source LSB, in units of the target LSB
        let eps = exp2(dst_frac - src_frac);
        let biased = match mode {
            RoundingMode::Trunc => scaled,
            RoundingMode::NonSymPos => scaled + 0.5,
            RoundingMode::NonSymNeg => scaled + 0.5 - eps,
            RoundingMode::SymInf => {
                if value < 0.0 {
                    scaled + 0.5 - eps
                } else {
                    scaled + 0.5
                }
            }
            RoundingMode::SymZero => {
                if value < 0.0 {
                    scaled + 0.5
                } else {
                    scaled + 0.5 - eps
                }
            }
            RoundingMode::ConvEven => {
                if (scaled + 0.5).floor().rem_euclid(2.0) == 1.0 {
                    scaled + 0.5 - eps
                } else {
                    scaled + 0.5
                }
            }
            RoundingMode::ConvOdd => {
                if (scaled + 0.5).floor().rem_euclid(2.0) == 0.0 {
                    scaled + 0.5 - eps
                } else {
                    scaled + 0.5
                }
            }
        };
        biased.floor() * exp2(-dst_frac)
    }

    /// force `value` into the representable range of `fmt`; the returned flag
    /// is the out-of-range verdict, computed before any clipping or wrapping
    pub(crate) fn saturate(value: f64, fmt: FixFormat, mode: SaturationMode) -> (f64, bool) {
        let max = exp2(fmt.int_bits()) - exp2(-fmt.frac_bits());
        let min = if fmt.signed() {
            -exp2(fmt.int_bits())
        } else {
            0.0
        };
        if value >= min && value <= max {
            return (value, false);
        }
        let result = if mode.clips() {
            if value < min {
                min
            } else {
                max
            }
        } else if fmt.signed() {
            let span = exp2(fmt.int_bits() + 1);
            let wrapped = value.rem_euclid(span);
            if wrapped >= exp2(fmt.int_bits()) {
                wrapped - span
            } else {
                wrapped
            }
        } else {
            value.rem_euclid(exp2(fmt.int_bits()))
        };
        (result, true)
    }

    pub(crate) fn resize(
        value: f64,
        src: FixFormat,
        dst: FixFormat,
        rounding: RoundingMode,
        saturation: SaturationMode,
    ) -> (f64, bool) {
        let rounded = round(value, src.frac_bits(), dst.frac_bits(), rounding);
        saturate(rounded, dst, saturation)
    }
}

/// arbitrary-precision implementations operating on raw values (the number
/// scaled by `2^frac_bits`); required beyond [`MAX_NARROW_WIDTH`] bits and
/// bit-for-bit equivalent to [`narrow`] below it
pub(crate) mod wide {
    use super::{BigInt, FixFormat, Integer, One, RoundingMode, SaturationMode, Signed};

    pub(crate) fn round_raw(
        raw: &BigInt,
        src_frac: i32,
        dst_frac: i32,
        mode: RoundingMode,
    ) -> BigInt {
        if dst_frac >= src_frac {
            return raw.clone() << (dst_frac - src_frac) as usize;
        }
        let shift = (src_frac - dst_frac) as usize;
        let divisor = BigInt::one() << shift;
        let half = BigInt::one() << (shift - 1);
        let biased = match mode {
            RoundingMode::Trunc => raw.clone(),
            RoundingMode::NonSymPos => raw + &half,
            RoundingMode::NonSymNeg => raw + &half - 1i32,
            RoundingMode::SymInf => {
                if raw.is_negative() {
                    raw + &half - 1i32
                } else {
                    raw + &half
                }
            }
            RoundingMode::SymZero => {
                if raw.is_negative() {
                    raw + &half
                } else {
                    raw + &half - 1i32
                }
            }
            RoundingMode::ConvEven => {
                if (raw + &half).div_floor(&divisor).is_odd() {
                    raw + &half - 1i32
                } else {
                    raw + &half
                }
            }
            RoundingMode::ConvOdd => {
                if (raw + &half).div_floor(&divisor).is_even() {
                    raw + &half - 1i32
                } else {
                    raw + &half
                }
            }
        };
        biased.div_floor(&divisor)
    }

    /// raw-unit counterpart of [`super::narrow::saturate`]
    pub(crate) fn saturate_raw(
        raw: &BigInt,
        fmt: FixFormat,
        mode: SaturationMode,
    ) -> (BigInt, bool) {
        let max = fmt.max_raw();
        let min = fmt.min_raw();
        if *raw >= min && *raw <= max {
            return (raw.clone(), false);
        }
        let result = if mode.clips() {
            if *raw < min {
                min
            } else {
                max
            }
        } else {
            let span_bits = (fmt.int_bits() + fmt.frac_bits() + fmt.sign_bits()) as usize;
            let span = BigInt::one() << span_bits;
            let wrapped = raw.mod_floor(&span);
            if fmt.signed() && wrapped >= BigInt::one() << (span_bits - 1) {
                wrapped - span
            } else {
                wrapped
            }
        };
        (result, true)
    }

    pub(crate) fn resize_raw(
        raw: &BigInt,
        src: FixFormat,
        dst: FixFormat,
        rounding: RoundingMode,
        saturation: SaturationMode,
    ) -> (BigInt, bool) {
        let rounded = round_raw(raw, src.frac_bits(), dst.frac_bits(), rounding);
        saturate_raw(&rounded, dst, saturation)
    }
}

#[derive(Clone, PartialEq)]
enum Raw {
    Narrow(f64),
    Wide(BigInt),
}

/// a fixed-point value paired with its format; always exactly reducible to
/// the rational `raw / 2^frac_bits`
#[derive(Clone, PartialEq)]
pub struct FixValue {
    raw: Raw,
    fmt: FixFormat,
}

impl FixValue {
    /// build a value from an in-range raw integer, picking the representation
    /// the format's width demands
    fn make(raw: BigInt, fmt: FixFormat) -> Self {
        if fmt.is_wide() {
            Self {
                raw: Raw::Wide(raw),
                fmt,
            }
        } else {
            let raw = raw.to_i64().expect("narrow raw doesn't fit in i64");
            Self {
                raw: Raw::Narrow(raw as f64 * exp2(-fmt.frac_bits())),
                fmt,
            }
        }
    }
    fn make_narrow(value: f64, fmt: FixFormat) -> Self {
        debug_assert!(!fmt.is_wide());
        Self {
            raw: Raw::Narrow(value),
            fmt,
        }
    }
    fn narrow_value(&self) -> f64 {
        match &self.raw {
            Raw::Narrow(value) => *value,
            Raw::Wide(_) => unreachable!("wide representation in narrow format {:?}", self.fmt),
        }
    }
    fn raw_big(&self) -> BigInt {
        match &self.raw {
            Raw::Wide(raw) => raw.clone(),
            Raw::Narrow(value) => {
                let scaled = value * exp2(self.fmt.frac_bits());
                BigInt::from(scaled as i64)
            }
        }
    }
    #[inline]
    pub fn format(&self) -> FixFormat {
        self.fmt
    }
    pub fn zero(fmt: FixFormat) -> Self {
        Self::make(BigInt::zero(), fmt)
    }
    pub fn max_value(fmt: FixFormat) -> Self {
        Self::make(fmt.max_raw(), fmt)
    }
    pub fn min_value(fmt: FixFormat) -> Self {
        Self::make(fmt.min_raw(), fmt)
    }
    /// `floor(value * 2^frac_bits + 1/2)` computed in exact rational
    /// arithmetic
    fn quantize_wide(value: f64, frac_bits: i32) -> BigInt {
        let ratio = Ratio::<BigInt>::from_float(value).expect("known to be finite");
        let (mut numer, mut denom) = ratio.into();
        if frac_bits >= 0 {
            numer <<= frac_bits as usize;
        } else {
            denom <<= (-frac_bits) as usize;
        }
        // floor(numer/denom + 1/2) without leaving integer arithmetic
        (numer * 2i32 + &denom).div_floor(&(denom * 2i32))
    }
    /// quantize a real number into `fmt`, rounding with `NonSymPos` and then
    /// saturating per `saturation`; the input must be finite
    pub fn from_real(
        value: f64,
        fmt: FixFormat,
        saturation: SaturationMode,
        state: Option<&mut FixState>,
    ) -> Self {
        assert!(value.is_finite(), "from_real requires a finite input");
        let mut default_state = FixState::default();
        let state = state.unwrap_or(&mut default_state);
        let scaled = value * exp2(fmt.frac_bits());
        if fmt.is_wide() || !scaled.is_finite() {
            let raw = Self::quantize_wide(value, fmt.frac_bits());
            let (raw, out_of_range) = wide::saturate_raw(&raw, fmt, saturation);
            if out_of_range && saturation.warns() {
                state.status_flags |= StatusFlags::OUT_OF_RANGE;
            }
            Self::make(raw, fmt)
        } else {
            // a double at or above 2^52 in magnitude is already integral;
            // adding the nearest-up bias there forms an f64 tie that rounds
            // half-to-even and corrupts odd raw values
            let quantized = if scaled.abs() >= exp2(52) {
                value
            } else {
                (scaled + 0.5).floor() * exp2(-fmt.frac_bits())
            };
            let (value, out_of_range) = narrow::saturate(quantized, fmt, saturation);
            if out_of_range && saturation.warns() {
                state.status_flags |= StatusFlags::OUT_OF_RANGE;
            }
            Self::make_narrow(value, fmt)
        }
    }
    /// the value as a double; exact for narrow formats, nearest double for
    /// wide ones
    pub fn to_real(&self) -> f64 {
        match &self.raw {
            Raw::Narrow(value) => *value,
            Raw::Wide(raw) => {
                let approx = raw.to_f64().expect("conversion to f64 doesn't fail");
                approx * exp2(-self.fmt.frac_bits())
            }
        }
    }
    /// the exact rational value `raw / 2^frac_bits`
    pub fn to_ratio(&self) -> Ratio<BigInt> {
        let raw = self.raw_big();
        if self.fmt.frac_bits() >= 0 {
            Ratio::new(raw, BigInt::one() << self.fmt.frac_bits() as usize)
        } else {
            Ratio::from(raw << (-self.fmt.frac_bits()) as usize)
        }
    }
    /// reinterpret the low `width` bits of `raw` (in LSB units) as a value of
    /// `fmt`, with two's-complement wraparound
    pub fn from_raw(raw: BigInt, fmt: FixFormat) -> Self {
        let (wrapped, _) = wide::saturate_raw(&raw, fmt, SaturationMode::None);
        Self::make(wrapped, fmt)
    }
    /// the value in raw LSB units (the value scaled by `2^frac_bits`)
    pub fn to_raw(&self) -> BigInt {
        self.raw_big()
    }
    pub fn from_int(
        value: i64,
        fmt: FixFormat,
        rounding: RoundingMode,
        saturation: SaturationMode,
        state: Option<&mut FixState>,
    ) -> Self {
        // any i64 is exactly representable in this staging format
        let staging = FixFormat {
            signed: true,
            int_bits: 64,
            frac_bits: 0,
        };
        let staged = Self {
            raw: Raw::Wide(BigInt::from(value)),
            fmt: staging,
        };
        staged.resize(fmt, rounding, saturation, state)
    }
    pub fn to_int(&self, rounding: RoundingMode, state: Option<&mut FixState>) -> BigInt {
        // one extra integer bit so rounding up at the top of the range cannot
        // saturate
        let target = FixFormat {
            signed: self.fmt.signed,
            int_bits: self.fmt.int_bits.max(0) + 1,
            frac_bits: 0,
        };
        self.resize(target, rounding, SaturationMode::None, state)
            .to_raw()
    }
    /// convert to `target`: round (when fractional bits are discarded), then
    /// saturate. Rounding happens first so a value that rounds to exactly the
    /// range boundary is judged in-range.
    pub fn resize(
        &self,
        target: FixFormat,
        rounding: RoundingMode,
        saturation: SaturationMode,
        state: Option<&mut FixState>,
    ) -> Self {
        let mut default_state = FixState::default();
        let state = state.unwrap_or(&mut default_state);
        if self.fmt.is_wide() || target.is_wide() {
            let (raw, out_of_range) =
                wide::resize_raw(&self.raw_big(), self.fmt, target, rounding, saturation);
            if out_of_range && saturation.warns() {
                state.status_flags |= StatusFlags::OUT_OF_RANGE;
            }
            Self::make(raw, target)
        } else {
            let (value, out_of_range) =
                narrow::resize(self.narrow_value(), self.fmt, target, rounding, saturation);
            if out_of_range && saturation.warns() {
                state.status_flags |= StatusFlags::OUT_OF_RANGE;
            }
            Self::make_narrow(value, target)
        }
    }
    /// `self + rhs` when `is_add`, `self - rhs` otherwise; the shared
    /// implementation lets callers batch-select the operation per element
    pub fn add_sub(
        &self,
        rhs: &Self,
        is_add: bool,
        result_fmt: FixFormat,
        rounding: RoundingMode,
        saturation: SaturationMode,
        state: Option<&mut FixState>,
    ) -> Self {
        let mid = self.fmt.for_add_sub(rhs.fmt);
        let staged = if mid.is_wide() {
            let a = self.raw_big() << (mid.frac_bits() - self.fmt.frac_bits()) as usize;
            let b = rhs.raw_big() << (mid.frac_bits() - rhs.fmt.frac_bits()) as usize;
            Self {
                raw: Raw::Wide(if is_add { a + b } else { a - b }),
                fmt: mid,
            }
        } else {
            let a = self.narrow_value();
            let b = rhs.narrow_value();
            Self {
                raw: Raw::Narrow(if is_add { a + b } else { a - b }),
                fmt: mid,
            }
        };
        staged.resize(result_fmt, rounding, saturation, state)
    }
    pub fn add(
        &self,
        rhs: &Self,
        result_fmt: FixFormat,
        rounding: RoundingMode,
        saturation: SaturationMode,
        state: Option<&mut FixState>,
    ) -> Self {
        self.add_sub(rhs, true, result_fmt, rounding, saturation, state)
    }
    pub fn sub(
        &self,
        rhs: &Self,
        result_fmt: FixFormat,
        rounding: RoundingMode,
        saturation: SaturationMode,
        state: Option<&mut FixState>,
    ) -> Self {
        self.add_sub(rhs, false, result_fmt, rounding, saturation, state)
    }
    pub fn mult(
        &self,
        rhs: &Self,
        result_fmt: FixFormat,
        rounding: RoundingMode,
        saturation: SaturationMode,
        state: Option<&mut FixState>,
    ) -> Self {
        let mid = self.fmt.for_mult(rhs.fmt);
        let staged = if mid.is_wide() {
            Self {
                raw: Raw::Wide(self.raw_big() * rhs.raw_big()),
                fmt: mid,
            }
        } else {
            Self {
                raw: Raw::Narrow(self.narrow_value() * rhs.narrow_value()),
                fmt: mid,
            }
        };
        staged.resize(result_fmt, rounding, saturation, state)
    }
    /// exact negation through the lossless intermediate format; fails on
    /// unsigned input
    pub fn neg(
        &self,
        result_fmt: FixFormat,
        rounding: RoundingMode,
        saturation: SaturationMode,
        state: Option<&mut FixState>,
    ) -> Result<Self> {
        let mid = self.fmt.for_neg()?;
        let staged = if mid.is_wide() {
            Self {
                raw: Raw::Wide(-self.raw_big()),
                fmt: mid,
            }
        } else {
            Self {
                raw: Raw::Narrow(-self.narrow_value()),
                fmt: mid,
            }
        };
        Ok(staged.resize(result_fmt, rounding, saturation, state))
    }
    /// conditional resource-cheap negation: when `negate` is set the result
    /// is `-x - 2^-frac_bits`, one LSB below the exact negation. This is a
    /// deliberate precision/resource trade-off (a hardware bit inversion
    /// without the carry increment), not an approximation bug; use [`neg`]
    /// for the exact operation.
    ///
    /// [`neg`]: FixValue::neg
    pub fn sneg(
        &self,
        negate: bool,
        result_fmt: FixFormat,
        rounding: RoundingMode,
        saturation: SaturationMode,
        state: Option<&mut FixState>,
    ) -> Self {
        let mid = FixFormat {
            signed: true,
            int_bits: self.fmt.int_bits,
            frac_bits: self.fmt.frac_bits,
        };
        let staged = if mid.is_wide() {
            let raw = self.raw_big();
            Self {
                raw: Raw::Wide(if negate { -raw - 1i32 } else { raw }),
                fmt: mid,
            }
        } else {
            let value = self.narrow_value();
            Self {
                raw: Raw::Narrow(if negate {
                    -value - exp2(-self.fmt.frac_bits)
                } else {
                    value
                }),
                fmt: mid,
            }
        };
        staged.resize(result_fmt, rounding, saturation, state)
    }
    pub fn abs(
        &self,
        result_fmt: FixFormat,
        rounding: RoundingMode,
        saturation: SaturationMode,
        state: Option<&mut FixState>,
    ) -> Self {
        let mid = self.fmt.for_abs();
        let staged = if mid.is_wide() {
            let raw = self.raw_big();
            Self {
                raw: Raw::Wide(if raw.is_negative() { -raw } else { raw }),
                fmt: mid,
            }
        } else {
            Self {
                raw: Raw::Narrow(self.narrow_value().abs()),
                fmt: mid,
            }
        };
        staged.resize(result_fmt, rounding, saturation, state)
    }
    /// arithmetic shift left by `n` bits (negative `n` shifts right),
    /// expressed as a resize from the binary-point-adjusted source format;
    /// fails when the adjusted bit counts overflow
    pub fn shift(
        &self,
        n: i32,
        result_fmt: FixFormat,
        rounding: RoundingMode,
        saturation: SaturationMode,
        state: Option<&mut FixState>,
    ) -> Result<Self> {
        let src = self.fmt.for_shift(n)?;
        let staged = if src.is_wide() {
            Self {
                raw: Raw::Wide(self.raw_big()),
                fmt: src,
            }
        } else {
            Self {
                raw: Raw::Narrow(self.narrow_value() * exp2(n)),
                fmt: src,
            }
        };
        Ok(staged.resize(result_fmt, rounding, saturation, state))
    }
    /// `(self + rhs) / 2` with a single rounding step: the sum is formed in
    /// its lossless format and halved by moving the binary point
    pub fn mean(
        &self,
        rhs: &Self,
        result_fmt: FixFormat,
        rounding: RoundingMode,
        saturation: SaturationMode,
        state: Option<&mut FixState>,
    ) -> Self {
        let sum_fmt = self.fmt.for_add_sub(rhs.fmt);
        let mid = sum_fmt.for_shift(-1).expect("overflow halving the sum format");
        let staged = if mid.is_wide() {
            let a = self.raw_big() << (sum_fmt.frac_bits() - self.fmt.frac_bits()) as usize;
            let b = rhs.raw_big() << (sum_fmt.frac_bits() - rhs.fmt.frac_bits()) as usize;
            Self {
                raw: Raw::Wide(a + b),
                fmt: mid,
            }
        } else {
            Self {
                raw: Raw::Narrow((self.narrow_value() + rhs.narrow_value()) * 0.5),
                fmt: mid,
            }
        };
        staged.resize(result_fmt, rounding, saturation, state)
    }
    fn bit_position(&self, index: u32, msb_based: bool) -> Result<usize> {
        let width = self.fmt.width();
        if index >= width {
            return Err(FixError::IndexOutOfRange { index, width });
        }
        Ok(if msb_based {
            (width - 1 - index) as usize
        } else {
            index as usize
        })
    }
    /// read one bit of the two's-complement raw pattern; `msb_based` counts
    /// index 0 from the top of the word instead of the bottom
    pub fn get_bit(&self, index: u32, msb_based: bool) -> Result<bool> {
        let position = self.bit_position(index, msb_based)?;
        let span = BigInt::one() << self.fmt.width() as usize;
        let pattern = self.raw_big().mod_floor(&span);
        Ok((pattern >> position).is_odd())
    }
    /// the value with one bit of the two's-complement raw pattern replaced
    pub fn with_bit(&self, index: u32, msb_based: bool, bit: bool) -> Result<Self> {
        let position = self.bit_position(index, msb_based)?;
        let span = BigInt::one() << self.fmt.width() as usize;
        let mut pattern = self.raw_big().mod_floor(&span);
        let is_set = (pattern.clone() >> position).is_odd();
        if bit && !is_set {
            pattern += BigInt::one() << position;
        } else if !bit && is_set {
            pattern -= BigInt::one() << position;
        }
        Ok(Self::from_raw(pattern, self.fmt))
    }
}

impl fmt::Debug for FixValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "FixValue {{ fmt: {}, raw: {:#x}, value: {} }}",
            self.fmt,
            self.raw_big(),
            self.to_ratio()
        )
    }
}

impl fmt::Display for FixValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_ratio())
    }
}

/// elementwise views of the scalar operations. Validation is call-scoped:
/// operand slices must be format-homogeneous and length-matched, and any
/// validation error fails the whole call before any element is computed.
pub mod elementwise {
    use super::{FixError, FixFormat, FixState, FixValue, Result, RoundingMode, SaturationMode};

    fn check_same_format(values: &[FixValue]) -> Result<()> {
        if let Some(first) = values.first() {
            let expected = first.format();
            for value in values {
                if value.format() != expected {
                    return Err(FixError::FormatMismatch {
                        expected,
                        got: value.format(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_len(expected: usize, got: usize) -> Result<()> {
        if expected != got {
            return Err(FixError::LengthMismatch { expected, got });
        }
        Ok(())
    }

    macro_rules! unary_elementwise {
        ($name:ident) => {
            pub fn $name(
                values: &[FixValue],
                result_fmt: FixFormat,
                rounding: RoundingMode,
                saturation: SaturationMode,
                state: Option<&mut FixState>,
            ) -> Result<Vec<FixValue>> {
                check_same_format(values)?;
                let mut default_state = FixState::default();
                let state = state.unwrap_or(&mut default_state);
                let mut retval = Vec::with_capacity(values.len());
                for value in values {
                    retval.push(value.$name(result_fmt, rounding, saturation, Some(&mut *state)));
                }
                Ok(retval)
            }
        };
    }

    macro_rules! binary_elementwise {
        ($name:ident) => {
            pub fn $name(
                lhs: &[FixValue],
                rhs: &[FixValue],
                result_fmt: FixFormat,
                rounding: RoundingMode,
                saturation: SaturationMode,
                state: Option<&mut FixState>,
            ) -> Result<Vec<FixValue>> {
                check_same_format(lhs)?;
                check_same_format(rhs)?;
                check_len(lhs.len(), rhs.len())?;
                let mut default_state = FixState::default();
                let state = state.unwrap_or(&mut default_state);
                let mut retval = Vec::with_capacity(lhs.len());
                for (a, b) in lhs.iter().zip(rhs) {
                    retval.push(a.$name(b, result_fmt, rounding, saturation, Some(&mut *state)));
                }
                Ok(retval)
            }
        };
    }

    pub fn resize(
        values: &[FixValue],
        target: FixFormat,
        rounding: RoundingMode,
        saturation: SaturationMode,
        state: Option<&mut FixState>,
    ) -> Result<Vec<FixValue>> {
        check_same_format(values)?;
        let mut default_state = FixState::default();
        let state = state.unwrap_or(&mut default_state);
        let mut retval = Vec::with_capacity(values.len());
        for value in values {
            retval.push(value.resize(target, rounding, saturation, Some(&mut *state)));
        }
        Ok(retval)
    }

    binary_elementwise!(add);
    binary_elementwise!(sub);
    binary_elementwise!(mult);
    binary_elementwise!(mean);
    unary_elementwise!(abs);

    /// per-element add/subtract selection: `is_add[i]` picks the operation
    /// applied to `lhs[i]` and `rhs[i]`
    pub fn add_sub(
        lhs: &[FixValue],
        rhs: &[FixValue],
        is_add: &[bool],
        result_fmt: FixFormat,
        rounding: RoundingMode,
        saturation: SaturationMode,
        state: Option<&mut FixState>,
    ) -> Result<Vec<FixValue>> {
        check_same_format(lhs)?;
        check_same_format(rhs)?;
        check_len(lhs.len(), rhs.len())?;
        check_len(lhs.len(), is_add.len())?;
        let mut default_state = FixState::default();
        let state = state.unwrap_or(&mut default_state);
        let mut retval = Vec::with_capacity(lhs.len());
        for ((a, b), &add) in lhs.iter().zip(rhs).zip(is_add) {
            retval.push(a.add_sub(b, add, result_fmt, rounding, saturation, Some(&mut *state)));
        }
        Ok(retval)
    }

    pub fn neg(
        values: &[FixValue],
        result_fmt: FixFormat,
        rounding: RoundingMode,
        saturation: SaturationMode,
        state: Option<&mut FixState>,
    ) -> Result<Vec<FixValue>> {
        check_same_format(values)?;
        if let Some(first) = values.first() {
            // fail the whole call up front; the slice is format-homogeneous
            first.format().for_neg()?;
        }
        let mut default_state = FixState::default();
        let state = state.unwrap_or(&mut default_state);
        let mut retval = Vec::with_capacity(values.len());
        for value in values {
            retval.push(
                value
                    .neg(result_fmt, rounding, saturation, Some(&mut *state))
                    .expect("format validated above"),
            );
        }
        Ok(retval)
    }

    /// per-element conditional cheap negation (see [`FixValue::sneg`])
    pub fn sneg(
        values: &[FixValue],
        negate: &[bool],
        result_fmt: FixFormat,
        rounding: RoundingMode,
        saturation: SaturationMode,
        state: Option<&mut FixState>,
    ) -> Result<Vec<FixValue>> {
        check_same_format(values)?;
        check_len(values.len(), negate.len())?;
        let mut default_state = FixState::default();
        let state = state.unwrap_or(&mut default_state);
        let mut retval = Vec::with_capacity(values.len());
        for (value, &negate) in values.iter().zip(negate) {
            retval.push(value.sneg(negate, result_fmt, rounding, saturation, Some(&mut *state)));
        }
        Ok(retval)
    }

    pub fn shift(
        values: &[FixValue],
        n: i32,
        result_fmt: FixFormat,
        rounding: RoundingMode,
        saturation: SaturationMode,
        state: Option<&mut FixState>,
    ) -> Result<Vec<FixValue>> {
        check_same_format(values)?;
        if let Some(first) = values.first() {
            // fail the whole call up front; the slice is format-homogeneous
            first.format().for_shift(n)?;
        }
        let mut default_state = FixState::default();
        let state = state.unwrap_or(&mut default_state);
        let mut retval = Vec::with_capacity(values.len());
        for value in values {
            retval.push(
                value
                    .shift(n, result_fmt, rounding, saturation, Some(&mut *state))
                    .expect("shift validated above"),
            );
        }
        Ok(retval)
    }
}


macro_rules! doctest {
    ($x:expr) => {
        #[doc = $x]
        extern {}
    };
}

doctest!(include_str!("../README.md"));
