//! Detector and format constants.
//!
//! These ceilings are fixed by the readout hardware and the on-disk format.
//! They are not tunables and are deliberately not exposed through any
//! runtime configuration.

use serde::{Deserialize, Serialize};

/// Ceiling of the maximum-charge field.
pub const P_MAX_QMAX: u32 = 1 << 10;

/// Ceiling of the total-charge field.
pub const P_MAX_QTOT: u32 = 5 * 5 * P_MAX_QMAX;

/// Ceiling of the time field.
pub const P_MAX_TIME: u32 = 1 << 24;

/// Ceiling of the pad field.
pub const P_MAX_PAD: u32 = 1 << 16;

/// Ceiling of the cluster width (sigma) fields.
pub const P_MAX_SIGMA: u32 = 1 << 8;

/// Ceiling of the cluster flag field.
pub const P_MAX_FLAGS: u32 = 1 << 8;

/// Ceiling of the quantized inverse transverse momentum.
pub const P_MAX_QPT: u32 = 1 << 8;

/// Number of detector sectors.
pub const NSLICES: u32 = 36;

/// Number of pad rows per sector.
pub const ROW_COUNT: u32 = 152;

/// Alignment of every array start in a dataset region.
pub const BUFFER_ALIGNMENT: usize = 64;

/// Cluster capacities are rounded up to a multiple of this.
pub const CLUSTER_COUNT_ROUNDING: u32 = 16;

/// Above this cluster count the unattached cache factor is applied.
pub const CLUSTER_FACTOR_THRESHOLD: u32 = 100_000_000;

/// A numeric attribute stored with reduced precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuantizedField {
    /// Total cluster charge.
    Charge,
    /// Maximum cluster charge.
    ChargeMax,
    /// Time coordinate.
    Time,
    /// Pad coordinate.
    Pad,
    /// Cluster width in pad or time direction.
    Width,
    /// Cluster flags.
    Flags,
    /// Quantized inverse transverse momentum.
    InverseQPt,
}

impl QuantizedField {
    /// All quantized fields.
    pub const ALL: [QuantizedField; 7] = [
        QuantizedField::Charge,
        QuantizedField::ChargeMax,
        QuantizedField::Time,
        QuantizedField::Pad,
        QuantizedField::Width,
        QuantizedField::Flags,
        QuantizedField::InverseQPt,
    ];

    /// Exclusive ceiling of the field.
    pub const fn max_value(self) -> u32 {
        match self {
            QuantizedField::Charge => P_MAX_QTOT,
            QuantizedField::ChargeMax => P_MAX_QMAX,
            QuantizedField::Time => P_MAX_TIME,
            QuantizedField::Pad => P_MAX_PAD,
            QuantizedField::Width => P_MAX_SIGMA,
            QuantizedField::Flags => P_MAX_FLAGS,
            QuantizedField::InverseQPt => P_MAX_QPT,
        }
    }

    /// Width in bits of the integer type the field is stored in.
    pub const fn storage_bits(self) -> u32 {
        match self {
            QuantizedField::Charge | QuantizedField::ChargeMax => 16,
            QuantizedField::Time => 32,
            QuantizedField::Pad => 16,
            QuantizedField::Width | QuantizedField::Flags | QuantizedField::InverseQPt => 8,
        }
    }

    /// Stable numeric code, used when the field is passed to device work.
    pub const fn code(self) -> u32 {
        match self {
            QuantizedField::Charge => 0,
            QuantizedField::ChargeMax => 1,
            QuantizedField::Time => 2,
            QuantizedField::Pad => 3,
            QuantizedField::Width => 4,
            QuantizedField::Flags => 5,
            QuantizedField::InverseQPt => 6,
        }
    }

    /// Inverse of [`QuantizedField::code`].
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.code() == code)
    }

    /// Field name.
    pub const fn name(self) -> &'static str {
        match self {
            QuantizedField::Charge => "charge",
            QuantizedField::ChargeMax => "charge_max",
            QuantizedField::Time => "time",
            QuantizedField::Pad => "pad",
            QuantizedField::Width => "width",
            QuantizedField::Flags => "flags",
            QuantizedField::InverseQPt => "inverse_qpt",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceilings() {
        assert_eq!(P_MAX_QTOT, 25_600);
        assert_eq!(QuantizedField::Time.max_value(), 1 << 24);
    }

    #[test]
    fn test_field_codes_roundtrip() {
        for field in QuantizedField::ALL {
            assert_eq!(QuantizedField::from_code(field.code()), Some(field));
        }
        assert_eq!(QuantizedField::from_code(99), None);
    }

    #[test]
    fn test_ceilings_fit_storage() {
        for field in QuantizedField::ALL {
            let storage_max = if field.storage_bits() == 32 {
                u64::from(u32::MAX) + 1
            } else {
                1u64 << field.storage_bits()
            };
            assert!(u64::from(field.max_value()) <= storage_max, "{}", field.name());
        }
    }
}
