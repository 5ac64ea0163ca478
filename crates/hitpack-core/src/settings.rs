//! Precision and storage-mode settings for the encoder.

use crate::constants::QuantizedField;
use crate::error::{Error, Result};
use crate::truncate::bit_length;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Encoder configuration.
///
/// Bit counts of `0` disable truncation for the corresponding fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    /// Significant bits retained for total and maximum charge.
    pub sig_bits_charge: u32,
    /// Significant bits retained for cluster widths.
    pub sig_bits_width: u32,
    /// Drop the residual fields of the first cluster of every track.
    pub reduced_attached: bool,
    /// Fraction of clusters (in units of 1/1024) cached as unattached
    /// when the event exceeds the cluster threshold.
    pub unattached_factor_base1024: u32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        CompressionSettings {
            sig_bits_charge: 4,
            sig_bits_width: 3,
            reduced_attached: true,
            unattached_factor_base1024: 1024,
        }
    }
}

impl CompressionSettings {
    /// Settings with truncation disabled.
    pub fn lossless() -> Self {
        CompressionSettings {
            sig_bits_charge: 0,
            sig_bits_width: 0,
            ..Self::default()
        }
    }

    /// Parse settings from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: CompressionSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let settings = Self::from_json(&json)?;
        tracing::debug!(
            path = %path.display(),
            charge = settings.sig_bits_charge,
            width = settings.sig_bits_width,
            "compression settings loaded"
        );
        Ok(settings)
    }

    /// Significant bits configured for `field` (0 when the field is not truncated).
    pub fn bits_for(&self, field: QuantizedField) -> u32 {
        match field {
            QuantizedField::Charge | QuantizedField::ChargeMax => self.sig_bits_charge,
            QuantizedField::Width => self.sig_bits_width,
            _ => 0,
        }
    }

    /// Reject precision settings that are inconsistent with their field.
    pub fn validate(&self) -> Result<()> {
        for field in [
            QuantizedField::Charge,
            QuantizedField::ChargeMax,
            QuantizedField::Width,
        ] {
            validate_precision(field, self.bits_for(field))?;
        }
        if self.unattached_factor_base1024 == 0 || self.unattached_factor_base1024 > 1024 {
            return Err(Error::InvalidRecord(format!(
                "unattached factor {} outside 1..=1024",
                self.unattached_factor_base1024
            )));
        }
        Ok(())
    }

    /// Header encoding of the bit widths in effect.
    pub(crate) fn header_bits(&self) -> (u8, u8) {
        (self.sig_bits_charge as u8, self.sig_bits_width as u8)
    }
}

/// Check that `bits` significant bits make sense for `field`.
pub fn validate_precision(field: QuantizedField, bits: u32) -> Result<()> {
    if bits == 0 {
        return Ok(());
    }
    let max = field.max_value();
    let representable = bit_length(u64::from(max.saturating_sub(1)));
    if max == 0 || bits > representable || bits > field.storage_bits() {
        return Err(Error::PrecisionConfiguration {
            field: field.name(),
            bits,
            max,
        });
    }
    Ok(())
}
