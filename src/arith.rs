//! Pure 32-bit machine-word arithmetic
//!
//! Every operation here takes and returns [`Word`]s and never panics on
//! overflow — wraparound is the defined behavior of this ISA, not a bug.
//! Division by zero is the one exception: it is rejected by the caller
//! before `div32`/`div32_signed` are invoked (see `interpreter::dispatch`).

use crate::consts::Word;

/// Reinterpret a machine word as its two's-complement signed value.
pub const fn uint32_to_int32(u: Word) -> i32 {
    u as i32
}

/// Narrow any signed 64-bit quantity to a machine word, keeping its low 32
/// bits (two's-complement wraparound, matching `i & 0xFFFF_FFFF`).
pub const fn to_u32(i: i64) -> Word {
    i as u32
}

/// Decompose a word into its four little-endian bytes.
pub const fn word_to_bytes(u: Word) -> [u8; 4] {
    u.to_le_bytes()
}

/// Reassemble a word from four little-endian bytes.
pub const fn bytes_to_word(b: [u8; 4]) -> Word {
    Word::from_le_bytes(b)
}

/// Bitwise NOT.
pub const fn not32(u: Word) -> Word {
    u ^ Word::MAX
}

/// Bitwise XOR.
pub const fn xor32(u1: Word, u2: Word) -> Word {
    u1 ^ u2
}

/// Bitwise AND.
pub const fn and32(u1: Word, u2: Word) -> Word {
    u1 & u2
}

/// Bitwise OR.
pub const fn or32(u1: Word, u2: Word) -> Word {
    u1 | u2
}

/// Logical shift left. Shift counts of 32 or more saturate to zero rather
/// than wrapping the count modulo 32.
pub const fn shl32(u1: Word, u2: Word) -> Word {
    if u2 >= 32 {
        0
    } else {
        u1 << u2
    }
}

/// Alias of [`shl32`]; the source ISA names the arithmetic and logical
/// left shifts separately even though they behave identically.
pub const fn sal32(u1: Word, u2: Word) -> Word {
    shl32(u1, u2)
}

/// Logical shift right. Shift counts of 32 or more saturate to zero.
pub const fn shr32(u1: Word, u2: Word) -> Word {
    if u2 >= 32 {
        0
    } else {
        u1 >> u2
    }
}

/// Arithmetic shift right: sign-extends rather than zero-fills. Shift
/// counts of 32 or more saturate to all-zero or all-one bits depending on
/// the sign of `u1`.
pub const fn sar32(u1: Word, u2: Word) -> Word {
    let signed = uint32_to_int32(u1);
    if u2 >= 32 {
        if signed < 0 {
            Word::MAX
        } else {
            0
        }
    } else {
        (signed >> u2) as Word
    }
}

/// Rotate `u1` left by `u2` bit positions, `u2` taken modulo 32.
pub const fn rol32(u1: Word, u2: Word) -> Word {
    let n = u2 % 32;
    if n == 0 {
        u1
    } else {
        shl32(u1, n) | shr32(u1, 32 - n)
    }
}

/// Rotate `u1` right by `u2` bit positions, `u2` taken modulo 32.
pub const fn ror32(u1: Word, u2: Word) -> Word {
    let n = u2 % 32;
    if n == 0 {
        u1
    } else {
        shr32(u1, n) | shl32(u1, 32 - n)
    }
}

/// Wrapping 32-bit addition.
pub const fn add32(u1: Word, u2: Word) -> Word {
    u1.wrapping_add(u2)
}

/// Wrapping 32-bit subtraction.
pub const fn sub32(u1: Word, u2: Word) -> Word {
    u1.wrapping_sub(u2)
}

/// Unsigned 32x32-bit multiplication, returning `(low, high)` words of the
/// full 64-bit product.
pub const fn mulu32(u1: Word, u2: Word) -> (Word, Word) {
    let product = (u1 as u64) * (u2 as u64);
    (product as Word, (product >> 32) as Word)
}

/// Signed 32x32-bit multiplication, returning `(low, high)` words of the
/// full 64-bit product, each still encoded as a plain machine word
/// (wraparound, not sign-extension, on the high word).
pub const fn mul32(u1: Word, u2: Word) -> (Word, Word) {
    let product = (uint32_to_int32(u1) as i64) * (uint32_to_int32(u2) as i64);
    (product as Word, (product >> 32) as Word)
}

/// Unsigned 32-bit division, returning `(quotient, remainder)`.
///
/// # Panics
/// Panics if `u2` is zero; callers must reject a zero divisor before
/// calling (see the fatal `DIV`/`DIVu`-by-zero behavior in the dispatch
/// loop).
pub fn divu32(u1: Word, u2: Word) -> (Word, Word) {
    (u1 / u2, u1 % u2)
}

/// Signed 32-bit division, returning `(quotient, remainder)` truncated
/// toward zero (not Python-style floor division).
///
/// # Panics
/// Panics if `u2` is zero, with the same caller contract as [`divu32`].
pub fn div32(u1: Word, u2: Word) -> (Word, Word) {
    let (a, b) = (uint32_to_int32(u1), uint32_to_int32(u2));
    (a.wrapping_div(b) as Word, a.wrapping_rem(b) as Word)
}

/// Equality.
pub const fn eq32(u1: Word, u2: Word) -> bool {
    u1 == u2
}

/// Inequality.
pub const fn neq32(u1: Word, u2: Word) -> bool {
    u1 != u2
}

/// Signed greater-than.
pub const fn gt32(u1: Word, u2: Word) -> bool {
    uint32_to_int32(u1) > uint32_to_int32(u2)
}

/// Unsigned greater-than.
pub const fn gtu32(u1: Word, u2: Word) -> bool {
    u1 > u2
}

/// Signed greater-than-or-equal.
pub const fn gte32(u1: Word, u2: Word) -> bool {
    uint32_to_int32(u1) >= uint32_to_int32(u2)
}

/// Unsigned greater-than-or-equal.
pub const fn gteu32(u1: Word, u2: Word) -> bool {
    u1 >= u2
}

/// Signed less-than.
pub const fn lt32(u1: Word, u2: Word) -> bool {
    uint32_to_int32(u1) < uint32_to_int32(u2)
}

/// Unsigned less-than.
pub const fn ltu32(u1: Word, u2: Word) -> bool {
    u1 < u2
}

/// Signed less-than-or-equal.
pub const fn lte32(u1: Word, u2: Word) -> bool {
    uint32_to_int32(u1) <= uint32_to_int32(u2)
}

/// Unsigned less-than-or-equal.
pub const fn lteu32(u1: Word, u2: Word) -> bool {
    u1 <= u2
}

/// True if the half-open ranges `[s1, e1)` and `[s2, e2)` overlap.
pub const fn range_collide(s1: Word, e1: Word, s2: Word, e2: Word) -> bool {
    (s1 >= s2 && s1 < e2) || (s2 >= s1 && s2 < e1)
}
