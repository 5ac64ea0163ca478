//! Significant-bit truncation.
//!
//! Reduces a value to its `n` highest-order significant bits with
//! round-to-nearest, clearing everything below the retained window. The
//! kept bits stay at their original positions, so the result is directly
//! comparable with the input:
//!
//! ```text
//!   value      0b1_0110  (22), keep 3 bits
//!   round bit        ^   set -> add 0b10
//!   rounded    0b1_1000  (24)
//!   masked     0b1_1000  (24)
//! ```
//!
//! A result at or above the field ceiling saturates to `max - 1`.

use crate::constants::QuantizedField;
use crate::settings::CompressionSettings;

/// Number of bits needed to represent `value` (0 for 0).
#[inline]
pub const fn bit_length(value: u64) -> u32 {
    u64::BITS - value.leading_zeros()
}

/// Truncate `value` to `bits_to_keep` significant bits, saturating below `max_value`.
///
/// `bits_to_keep == 0` disables truncation. Values that already fit in
/// `bits_to_keep` bits are returned unchanged. The rounding carry is
/// computed in 64 bits so it cannot wrap.
#[inline]
pub const fn truncate_significant_bits(value: u32, bits_to_keep: u32, max_value: u32) -> u32 {
    if bits_to_keep == 0 || value == 0 {
        return value;
    }

    let mut val = value as u64;
    let mut used = bit_length(val);
    if used <= bits_to_keep {
        return value;
    }

    let round_bit = 1u64 << (used - bits_to_keep - 1);
    if val & round_bit != 0 {
        val += round_bit;
        used = bit_length(val);
    }

    let window = ((1u64 << used) - 1) ^ ((1u64 << (used - bits_to_keep)) - 1);
    val &= window;

    if val >= max_value as u64 {
        val = max_value.saturating_sub(1) as u64;
    }
    val as u32
}

/// Integer types that quantized fields are stored in.
pub trait SignificantBits: Copy {
    /// Width of the type in bytes.
    const SIZE: usize;

    /// Apply [`truncate_significant_bits`], saturating at the type's maximum.
    fn truncated(self, bits_to_keep: u32, max_value: u32) -> Self;

    /// Truncate in place.
    fn truncate_in_place(&mut self, bits_to_keep: u32, max_value: u32) {
        *self = self.truncated(bits_to_keep, max_value);
    }
}

macro_rules! impl_significant_bits {
    ($($ty:ty),*) => {
        $(
            impl SignificantBits for $ty {
                const SIZE: usize = core::mem::size_of::<$ty>();

                #[inline]
                fn truncated(self, bits_to_keep: u32, max_value: u32) -> Self {
                    let out = truncate_significant_bits(u32::from(self), bits_to_keep, max_value);
                    <$ty>::try_from(out).unwrap_or(<$ty>::MAX)
                }
            }
        )*
    };
}

impl_significant_bits!(u8, u16, u32);

/// Truncate a field value with the precision configured for that field.
#[inline]
pub fn truncate_field<T: SignificantBits>(
    value: T,
    field: QuantizedField,
    settings: &CompressionSettings,
) -> T {
    value.truncated(settings.bits_for(field), field.max_value())
}

/// Truncate a total-charge value.
#[inline]
pub fn truncate_charge(charge: u16, settings: &CompressionSettings) -> u16 {
    truncate_field(charge, QuantizedField::Charge, settings)
}

/// Truncate a maximum-charge value.
#[inline]
pub fn truncate_charge_max(charge: u16, settings: &CompressionSettings) -> u16 {
    truncate_field(charge, QuantizedField::ChargeMax, settings)
}

/// Truncate a cluster width.
#[inline]
pub fn truncate_width(width: u8, settings: &CompressionSettings) -> u8 {
    truncate_field(width, QuantizedField::Width, settings)
}

/// Truncate a packed little-endian array of `elem_size`-byte integers in place.
///
/// Trailing bytes that do not form a whole element are left untouched.
/// Returns the number of elements whose value changed.
pub fn truncate_le_elements(
    bytes: &mut [u8],
    elem_size: usize,
    bits_to_keep: u32,
    max_value: u32,
) -> usize {
    if bits_to_keep == 0 {
        return 0;
    }
    let mut changed = 0;
    match elem_size {
        1 => {
            for b in bytes.iter_mut() {
                let t = b.truncated(bits_to_keep, max_value);
                changed += usize::from(t != *b);
                *b = t;
            }
        }
        2 => {
            for chunk in bytes.chunks_exact_mut(2) {
                let v = u16::from_le_bytes([chunk[0], chunk[1]]);
                let t = v.truncated(bits_to_keep, max_value);
                changed += usize::from(t != v);
                chunk.copy_from_slice(&t.to_le_bytes());
            }
        }
        4 => {
            for chunk in bytes.chunks_exact_mut(4) {
                let v = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let t = v.truncated(bits_to_keep, max_value);
                changed += usize::from(t != v);
                chunk.copy_from_slice(&t.to_le_bytes());
            }
        }
        _ => {}
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{P_MAX_QMAX, P_MAX_QTOT};

    #[test]
    fn test_rounds_up_discarded_half() {
        assert_eq!(truncate_significant_bits(0b10110, 3, 1 << 10), 24);
    }

    #[test]
    fn test_rounds_down() {
        // 0b10100: discarded MSB (bit 1) clear
        assert_eq!(truncate_significant_bits(0b10100, 3, 1 << 10), 0b10100);
        assert_eq!(truncate_significant_bits(0b10101, 3, 1 << 10), 0b10100);
    }

    #[test]
    fn test_zero_bits_is_noop() {
        assert_eq!(truncate_significant_bits(12345, 0, 10), 12345);
    }

    #[test]
    fn test_zero_value_is_noop() {
        assert_eq!(truncate_significant_bits(0, 4, 1024), 0);
    }

    #[test]
    fn test_value_that_fits_is_unchanged() {
        assert_eq!(truncate_significant_bits(0b111, 3, 1 << 10), 0b111);
        assert_eq!(truncate_significant_bits(u32::MAX, 32, u32::MAX), u32::MAX);
        assert_eq!(truncate_significant_bits(5, 40, 1024), 5);
    }

    #[test]
    fn test_carry_grows_bit_length() {
        // 0b1111 -> +0b10 -> 0b10001 -> top 3 bits of 5 -> 0b10000
        assert_eq!(truncate_significant_bits(0b1111, 3, 1 << 10), 0b10000);
    }

    #[test]
    fn test_saturates_below_ceiling() {
        // 1023 rounds to 1024 at 3 bits, which is the ceiling
        assert_eq!(truncate_significant_bits(1023, 3, P_MAX_QMAX), P_MAX_QMAX - 1);
    }

    #[test]
    fn test_carry_out_of_u32_does_not_wrap() {
        let out = truncate_significant_bits(u32::MAX, 1, u32::MAX);
        assert_eq!(out, u32::MAX - 1);
    }

    #[test]
    fn test_zero_ceiling_clamps_to_zero() {
        assert_eq!(truncate_significant_bits(0b1011, 2, 0), 0);
    }

    #[test]
    fn test_narrow_types_saturate_at_type_max() {
        // 255 -> 256 at 4 bits; does not fit a u8
        assert_eq!(255u8.truncated(4, 1 << 16), u8::MAX);
        assert_eq!(200u16.truncated(2, P_MAX_QTOT), 192);
    }

    #[test]
    fn test_field_wrappers_use_settings() {
        let settings = CompressionSettings {
            sig_bits_charge: 4,
            sig_bits_width: 3,
            ..CompressionSettings::default()
        };
        assert_eq!(truncate_charge(1000, &settings), 1024);
        assert_eq!(truncate_charge_max(1000, &settings), (P_MAX_QMAX - 1) as u16);
        assert_eq!(truncate_width(0b1101_1000, &settings), 0b1110_0000);
    }

    #[test]
    fn test_le_elements() {
        let mut bytes = Vec::new();
        for v in [22u16, 7, 1023, 0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let changed = truncate_le_elements(&mut bytes, 2, 3, P_MAX_QMAX);
        let out: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(out, vec![24, 7, 1023, 0]);
        assert_eq!(changed, 1);
    }
}
