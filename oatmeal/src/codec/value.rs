//! Scalar argument coding.
//!
//! One value at a time: integers of every width, reals with a significant-
//! figures budget, booleans, the null marker, and the escape coding shared
//! by strings and byte blobs. Encoders return the number of bytes written
//! and parsers the number consumed, with zero (or `None`) meaning failure.
//! On failure nothing partial is exposed: the destination is not advanced
//! and callers may retry with a different type or a larger buffer.

use core::fmt::Write as _;

use heapless::String;

use super::{DEFAULT_SIG_FIGS, MAX_SIG_FIGS};

/// A value that can be encoded as a single frame argument.
pub trait Encode {
    /// Write the wire form into the front of `dst`.
    ///
    /// Returns the number of bytes written, or zero if the value does not
    /// fit or cannot be represented (non-finite reals).
    fn encode(&self, dst: &mut [u8]) -> usize;
}

/// A value that can be parsed from the front of an argument payload.
pub trait Decode: Sized {
    /// Parse from the start of `src`, returning the value and the number of
    /// bytes consumed. `None` means `src` does not begin with a value of
    /// this type, or the value is out of range for it.
    fn decode(src: &[u8]) -> Option<(Self, usize)>;
}

/// Marker for argument types whose encoding fits [`SCALAR_BUF_LEN`] bytes,
/// so streaming writers can format them on the stack.
pub trait ScalarArg: Encode {}

/// Worst case scalar encoding: a real at 14 significant figures with a
/// negative three-digit exponent (`-9.9999999999999e-308`, 22 bytes).
pub const SCALAR_BUF_LEN: usize = 24;

/// A real number carrying its own significant-figures budget.
///
/// Plain `f32`/`f64` arguments encode with [`DEFAULT_SIG_FIGS`]; wrap a
/// value in `Real` to choose the precision per argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Real(pub f64, pub u8);

/// A byte-blob argument, encoded as `0"…"`.
///
/// The wire coding is identical to a string apart from the leading `0`, so
/// this wrapper exists only to pick the blob form over the string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blob<'a>(pub &'a [u8]);

/* -- escape coding -- */

/// The two-byte escape for `b`, or `None` if `b` is emitted literally.
pub(crate) fn escaped(b: u8) -> Option<[u8; 2]> {
    match b {
        b'\\' => Some(*br"\\"),
        b'"' => Some(*br#"\""#),
        b'<' => Some(*br"\("),
        b'>' => Some(*br"\)"),
        b'\n' => Some(*br"\n"),
        b'\r' => Some(*br"\r"),
        0 => Some(*br"\0"),
        _ => None,
    }
}

/// The byte named by the escape character `c` (the byte after a `\`).
pub(crate) fn unescaped(c: u8) -> Option<u8> {
    match c {
        b'\\' => Some(b'\\'),
        b'"' => Some(b'"'),
        b'(' => Some(b'<'),
        b')' => Some(b'>'),
        b'n' => Some(b'\n'),
        b'r' => Some(b'\r'),
        b'0' => Some(0),
        _ => None,
    }
}

/// Escape-encode `src` into `dst` without surrounding quotes.
///
/// Returns the encoded length, or zero if `dst` is too small.
pub fn encode_bytes(dst: &mut [u8], src: &[u8]) -> usize {
    let mut n = 0;
    for &b in src {
        match escaped(b) {
            Some(pair) => {
                if n + 2 > dst.len() {
                    return 0;
                }
                dst[n] = pair[0];
                dst[n + 1] = pair[1];
                n += 2;
            }
            None => {
                if n + 1 > dst.len() {
                    return 0;
                }
                dst[n] = b;
                n += 1;
            }
        }
    }
    n
}

/// Decode a quoted payload (`"…"`) from the front of `src` into `dst`.
///
/// Returns `(consumed, produced)` covering both quotes. Fails on a missing
/// open or close quote, an unknown escape, a bare frame delimiter inside
/// the quotes, or a decoded result longer than `dst`.
pub fn parse_quoted(src: &[u8], dst: &mut [u8]) -> Option<(usize, usize)> {
    if src.first() != Some(&b'"') {
        return None;
    }
    let mut produced = 0;
    let mut i = 1;
    while i < src.len() {
        let b = src[i];
        match b {
            b'"' => return Some((i + 1, produced)),
            b'\\' => {
                let c = *src.get(i + 1)?;
                let decoded = unescaped(c)?;
                if produced == dst.len() {
                    return None;
                }
                dst[produced] = decoded;
                produced += 1;
                i += 2;
            }
            // Frame delimiters are never legal in the clear inside quotes.
            b'<' | b'>' => return None,
            _ => {
                if produced == dst.len() {
                    return None;
                }
                dst[produced] = b;
                produced += 1;
                i += 1;
            }
        }
    }
    // Ran out of input before the closing quote.
    None
}

/// Decode a byte-blob payload (`0"…"`) from the front of `src` into `dst`.
pub fn parse_blob(src: &[u8], dst: &mut [u8]) -> Option<(usize, usize)> {
    if src.first() != Some(&b'0') {
        return None;
    }
    let (consumed, produced) = parse_quoted(&src[1..], dst)?;
    Some((consumed + 1, produced))
}

/// Encode a string argument (`"…"`) into `dst`.
pub fn format_str(dst: &mut [u8], src: &[u8]) -> usize {
    if dst.len() < 2 {
        return 0;
    }
    let dst_len = dst.len();
    let n = encode_bytes(&mut dst[1..dst_len - 1], src);
    if n == 0 && !src.is_empty() {
        return 0;
    }
    dst[0] = b'"';
    dst[n + 1] = b'"';
    n + 2
}

/// Encode a byte-blob argument (`0"…"`) into `dst`.
pub fn format_blob(dst: &mut [u8], src: &[u8]) -> usize {
    if dst.is_empty() {
        return 0;
    }
    dst[0] = b'0';
    let n = format_str(&mut dst[1..], src);
    if n == 0 {
        return 0;
    }
    n + 1
}

/* -- integers -- */

/// Render a sign/magnitude pair in decimal. Zero means `dst` was too small.
fn format_int_parts(dst: &mut [u8], neg: bool, mag: u64) -> usize {
    let mut digits = [0u8; 20];
    let mut ndig = 0;
    let mut v = mag;
    loop {
        digits[ndig] = b'0' + (v % 10) as u8;
        ndig += 1;
        v /= 10;
        if v == 0 {
            break;
        }
    }
    let total = ndig + neg as usize;
    if total > dst.len() {
        return 0;
    }
    let mut n = 0;
    if neg {
        dst[0] = b'-';
        n = 1;
    }
    for i in (0..ndig).rev() {
        dst[n] = digits[i];
        n += 1;
    }
    total
}

/// Scan `[-+]?[0-9]+` from the front of `src` into a sign/magnitude pair.
///
/// Fails on a missing digit run or a magnitude beyond 64 bits; width checks
/// against the requested type happen in the callers.
fn parse_int_prefix(src: &[u8]) -> Option<(bool, u64, usize)> {
    let mut i = 0;
    let neg = match *src.first()? {
        b'-' => {
            i = 1;
            true
        }
        b'+' => {
            i = 1;
            false
        }
        _ => false,
    };
    let first_digit = i;
    let mut mag: u64 = 0;
    while i < src.len() && src[i].is_ascii_digit() {
        mag = mag
            .checked_mul(10)?
            .checked_add(u64::from(src[i] - b'0'))?;
        i += 1;
    }
    if i == first_digit {
        return None;
    }
    Some((neg, mag, i))
}

macro_rules! impl_signed_arg {
    ($($t:ty),* $(,)?) => {$(
        impl Encode for $t {
            fn encode(&self, dst: &mut [u8]) -> usize {
                format_int_parts(dst, *self < 0, u64::from(self.unsigned_abs()))
            }
        }

        impl Decode for $t {
            fn decode(src: &[u8]) -> Option<(Self, usize)> {
                let (neg, mag, n) = parse_int_prefix(src)?;
                let wide: i64 = if neg {
                    if mag > i64::MAX as u64 + 1 {
                        return None;
                    }
                    (mag as i64).wrapping_neg()
                } else {
                    i64::try_from(mag).ok()?
                };
                Some((<$t>::try_from(wide).ok()?, n))
            }
        }

        impl ScalarArg for $t {}
    )*};
}

macro_rules! impl_unsigned_arg {
    ($($t:ty),* $(,)?) => {$(
        impl Encode for $t {
            fn encode(&self, dst: &mut [u8]) -> usize {
                format_int_parts(dst, false, u64::from(*self))
            }
        }

        impl Decode for $t {
            fn decode(src: &[u8]) -> Option<(Self, usize)> {
                let (neg, mag, n) = parse_int_prefix(src)?;
                if neg {
                    return None;
                }
                Some((<$t>::try_from(mag).ok()?, n))
            }
        }

        impl ScalarArg for $t {}
    )*};
}

impl_signed_arg!(i8, i16, i32, i64);
impl_unsigned_arg!(u8, u16, u32, u64);

/* -- reals -- */

/// Format `val` in shortest general form with at most `sig_figs`
/// significant figures.
///
/// Moderate magnitudes render in plain decimal, very large or very small
/// ones in scientific notation with a signed two-digit-minimum exponent.
/// Trailing zeros are dropped, so the output round-trips through
/// [`parse_real_prefix`] within one unit in the last requested figure.
/// Non-finite values are not representable and return zero.
pub fn format_real(dst: &mut [u8], val: f64, sig_figs: u8) -> usize {
    if !val.is_finite() {
        return 0;
    }
    let sig = usize::from(sig_figs.clamp(1, MAX_SIG_FIGS));

    // Round to `sig` significant digits by way of exponential formatting,
    // then re-render below. Worst case: "-9.9999999999999e-308".
    let mut sci: String<24> = String::new();
    if write!(sci, "{:.*e}", sig - 1, val).is_err() {
        return 0;
    }
    let bytes = sci.as_bytes();
    let Some(e_at) = bytes.iter().position(|&b| b == b'e') else {
        return 0;
    };

    let neg = bytes[0] == b'-';
    let mut exp: i32 = 0;
    let mut exp_neg = false;
    for &b in &bytes[e_at + 1..] {
        if b == b'-' {
            exp_neg = true;
        } else {
            exp = exp * 10 + i32::from(b - b'0');
        }
    }
    if exp_neg {
        exp = -exp;
    }

    let mut digits = [0u8; MAX_SIG_FIGS as usize];
    let mut ndig = 0;
    for &b in &bytes[..e_at] {
        if b.is_ascii_digit() {
            digits[ndig] = b;
            ndig += 1;
        }
    }
    while ndig > 1 && digits[ndig - 1] == b'0' {
        ndig -= 1;
    }
    let digits = &digits[..ndig];

    let mut out = ByteWriter { dst, n: 0 };
    let ok = if exp < -4 || exp >= sig as i32 {
        write_scientific(&mut out, neg, digits, exp)
    } else {
        write_decimal(&mut out, neg, digits, exp)
    };
    if ok { out.n } else { 0 }
}

struct ByteWriter<'a> {
    dst: &'a mut [u8],
    n: usize,
}

impl ByteWriter<'_> {
    fn push(&mut self, b: u8) -> bool {
        if self.n < self.dst.len() {
            self.dst[self.n] = b;
            self.n += 1;
            true
        } else {
            false
        }
    }

    fn push_all(&mut self, bytes: &[u8]) -> bool {
        bytes.iter().all(|&b| self.push(b))
    }

    fn push_zeros(&mut self, count: usize) -> bool {
        (0..count).all(|_| self.push(b'0'))
    }
}

fn write_decimal(out: &mut ByteWriter, neg: bool, digits: &[u8], exp: i32) -> bool {
    if neg && !out.push(b'-') {
        return false;
    }
    if exp < 0 {
        return out.push(b'0')
            && out.push(b'.')
            && out.push_zeros((-exp - 1) as usize)
            && out.push_all(digits);
    }
    let int_digits = exp as usize + 1;
    if digits.len() <= int_digits {
        out.push_all(digits) && out.push_zeros(int_digits - digits.len())
    } else {
        out.push_all(&digits[..int_digits])
            && out.push(b'.')
            && out.push_all(&digits[int_digits..])
    }
}

fn write_scientific(out: &mut ByteWriter, neg: bool, digits: &[u8], exp: i32) -> bool {
    if neg && !out.push(b'-') {
        return false;
    }
    if !out.push(digits[0]) {
        return false;
    }
    if digits.len() > 1 && !(out.push(b'.') && out.push_all(&digits[1..])) {
        return false;
    }
    if !out.push(b'e') || !out.push(if exp < 0 { b'-' } else { b'+' }) {
        return false;
    }
    let mag = exp.unsigned_abs();
    // Exponents carry at least two digits.
    if mag >= 100 && !out.push(b'0' + (mag / 100) as u8) {
        return false;
    }
    out.push(b'0' + (mag / 10 % 10) as u8) && out.push(b'0' + (mag % 10) as u8)
}

/// Scan a decimal or scientific real from the front of `src`.
///
/// Returns the value and the number of bytes consumed. Values that
/// overflow to infinity fail.
pub fn parse_real_prefix(src: &[u8]) -> Option<(f64, usize)> {
    let mut i = 0;
    if matches!(src.first(), Some(b'-') | Some(b'+')) {
        i = 1;
    }
    let int_start = i;
    while i < src.len() && src[i].is_ascii_digit() {
        i += 1;
    }
    let mut digit_count = i - int_start;
    if i < src.len() && src[i] == b'.' {
        i += 1;
        let frac_start = i;
        while i < src.len() && src[i].is_ascii_digit() {
            i += 1;
        }
        digit_count += i - frac_start;
    }
    if digit_count == 0 {
        return None;
    }
    // Take an exponent only if at least one digit follows it.
    if i < src.len() && (src[i] == b'e' || src[i] == b'E') {
        let mut j = i + 1;
        if j < src.len() && (src[j] == b'-' || src[j] == b'+') {
            j += 1;
        }
        let exp_start = j;
        while j < src.len() && src[j].is_ascii_digit() {
            j += 1;
        }
        if j > exp_start {
            i = j;
        }
    }
    let text = core::str::from_utf8(&src[..i]).ok()?;
    let val: f64 = text.parse().ok()?;
    if !val.is_finite() {
        return None;
    }
    Some((val, i))
}

impl Encode for f64 {
    fn encode(&self, dst: &mut [u8]) -> usize {
        format_real(dst, *self, DEFAULT_SIG_FIGS)
    }
}

impl Decode for f64 {
    fn decode(src: &[u8]) -> Option<(Self, usize)> {
        parse_real_prefix(src)
    }
}

impl ScalarArg for f64 {}

impl Encode for f32 {
    fn encode(&self, dst: &mut [u8]) -> usize {
        format_real(dst, f64::from(*self), DEFAULT_SIG_FIGS)
    }
}

impl Decode for f32 {
    fn decode(src: &[u8]) -> Option<(Self, usize)> {
        let (val, n) = parse_real_prefix(src)?;
        let narrowed = val as f32;
        if !narrowed.is_finite() {
            return None;
        }
        Some((narrowed, n))
    }
}

impl ScalarArg for f32 {}

impl Encode for Real {
    fn encode(&self, dst: &mut [u8]) -> usize {
        format_real(dst, self.0, self.1)
    }
}

impl ScalarArg for Real {}

/* -- booleans, null, strings -- */

impl Encode for bool {
    fn encode(&self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }
        dst[0] = if *self { b'T' } else { b'F' };
        1
    }
}

impl Decode for bool {
    fn decode(src: &[u8]) -> Option<(Self, usize)> {
        match *src.first()? {
            b'T' | b't' => Some((true, 1)),
            b'F' | b'f' => Some((false, 1)),
            _ => None,
        }
    }
}

impl ScalarArg for bool {}

/// Encode the null marker `N`.
pub fn format_none(dst: &mut [u8]) -> usize {
    if dst.is_empty() {
        return 0;
    }
    dst[0] = b'N';
    1
}

impl Encode for &str {
    fn encode(&self, dst: &mut [u8]) -> usize {
        format_str(dst, self.as_bytes())
    }
}

impl Encode for Blob<'_> {
    fn encode(&self, dst: &mut [u8]) -> usize {
        format_blob(dst, self.0)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, dst: &mut [u8]) -> usize {
        match self {
            Some(v) => v.encode(dst),
            None => format_none(dst),
        }
    }
}

/* -- dict keys, hex -- */

/// Whether `b` may appear in a dict key.
pub(crate) fn is_key_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Length of the maximal dict-key run (`[A-Za-z0-9_]*`) at the front of
/// `src`.
pub fn dict_key_len(src: &[u8]) -> usize {
    src.iter().take_while(|&&b| is_key_byte(b)).count()
}

/// `val` as exactly eight uppercase hex digits.
pub fn u32_to_hex(val: u32) -> [u8; 8] {
    const HEX_CHARS: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = [0u8; 8];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = HEX_CHARS[(val >> (28 - i * 4)) as usize & 0xf];
    }
    out
}
