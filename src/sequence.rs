//! 16-bit sequence number and 32-bit millisecond time comparisons.
//!
//! Ported from Yojimbo's wraparound heuristic for sequence numbers, and from
//! the 24-hour half-overflow constant used for service-time comparisons.

/// Compares two 16 bit sequence numbers and returns true if the first one is
/// greater than the second (considering wrapping).
/// IMPORTANT: This is not the same as s1 > s2!
/// Thus, sequence_greater_than(1, 0) returns true, and so does
/// sequence_greater_than(0, 65535)!
#[inline(always)]
pub(crate) fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= 32768)) || ((s1 < s2) && (s2 - s1 > 32768))
}

#[inline(always)]
pub(crate) fn sequence_less_than(s1: u16, s2: u16) -> bool {
    sequence_greater_than(s2, s1)
}

/// A 24-hour half-overflow window for `u32` millisecond service-time
/// comparisons; kept verbatim from the source rather than a generic
/// half-range fold, since `serviceTime` deltas this large are never
/// meaningful within one session.
const TIME_OVERFLOW: u32 = 86_400_000;

#[inline(always)]
pub(crate) fn time_less(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) >= TIME_OVERFLOW
}

#[inline(always)]
pub(crate) fn time_greater_equal(a: u32, b: u32) -> bool {
    !time_less(a, b)
}

#[inline(always)]
pub(crate) fn time_difference(a: u32, b: u32) -> u32 {
    if a.wrapping_sub(b) >= TIME_OVERFLOW {
        b.wrapping_sub(a)
    } else {
        a.wrapping_sub(b)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sequence_wraps() {
        assert!(sequence_greater_than(1, 0));
        assert!(sequence_greater_than(0, 65535));
        assert!(sequence_less_than(65535, 0));
        assert!(!sequence_greater_than(0, 0));
    }

    #[test]
    fn time_wraps() {
        assert!(time_greater_equal(100, 50));
        assert!(time_less(50, 100));
        assert_eq!(time_difference(100, 50), 50);
        assert_eq!(time_difference(50, 100), 50);
    }
}
