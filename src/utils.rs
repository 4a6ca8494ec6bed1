use std::ops::{BitAnd, Shl, Shr};

use num::Integer;

/// Make an n_bits-long mask (all ones)
pub fn mask<T>(n_bits: T) -> T
where
    T: Integer + Shl<Output = T>,
{
    (T::one() << n_bits) - T::one()
}

/// Obtain value[end:start] (verilog notation) from value
pub fn extract_field<T>(value: T, end: T, start: T) -> T
where
    T: Copy + Integer + Shl<Output = T> + Shr<Output = T> + BitAnd<Output = T>,
{
    mask(end - start + T::one()) & (value >> start)
}

pub fn interpret_i32_as_unsigned(value: i32) -> u32 {
    u32::from_ne_bytes(value.to_ne_bytes())
}

pub fn interpret_u64_as_signed(value: u64) -> i64 {
    i64::from_ne_bytes(value.to_ne_bytes())
}

pub fn interpret_i64_as_unsigned(value: i64) -> u64 {
    u64::from_ne_bytes(value.to_ne_bytes())
}

/// Treat bit `bits - 1` of value as the sign bit and extend it
/// through the upper bits of an i64.
pub fn sign_extend(value: u64, bits: u32) -> i64 {
    if bits >= 64 {
        return interpret_u64_as_signed(value);
    }
    let shift = 64 - bits;
    interpret_u64_as_signed(value << shift) >> shift
}

/// True if value is representable as a two's complement
/// immediate of the given width
pub fn fits_signed(value: i64, bits: u32) -> bool {
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    value >= min && value <= max
}

/// Position of the lowest set bit, or None for zero
pub fn lowest_set_bit(value: u64) -> Option<u32> {
    if value == 0 {
        None
    } else {
        Some(value.trailing_zeros())
    }
}

/// Round addr up to the next multiple of align (a power of two)
pub fn align_up(addr: u64, align: u64) -> u64 {
    (addr + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn check_mask_and_extract() {
        assert_eq!(mask(5u32), 0b11111);
        assert_eq!(extract_field(0x1800u64, 12, 11), 0b11);
        assert_eq!(extract_field(0xdead_beefu32, 15, 8), 0xbe);
    }

    #[test]
    fn check_sign_extend() {
        assert_eq!(sign_extend(0xfff, 12), -1);
        assert_eq!(sign_extend(0x7ff, 12), 2047);
        assert_eq!(sign_extend(0x800, 12), -2048);
        assert_eq!(sign_extend(0x8000_0000, 32), -0x8000_0000);
    }

    #[test]
    fn check_fits_signed() {
        assert!(fits_signed(2047, 12));
        assert!(fits_signed(-2048, 12));
        assert!(!fits_signed(2048, 12));
        assert!(!fits_signed(-2049, 12));
        assert!(fits_signed(-(1 << 20), 21));
    }

    #[test]
    fn check_lowest_set_bit_and_align() {
        assert_eq!(lowest_set_bit(0), None);
        assert_eq!(lowest_set_bit(0x1800), Some(11));
        assert_eq!(align_up(0x1001, 64), 0x1040);
        assert_eq!(align_up(0x1040, 64), 0x1040);
    }
}
