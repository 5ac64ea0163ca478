//! Encode kernels.
//!
//! The precision settings travel to the device once per pass through the
//! constant region, as a fixed little-endian block:
//!
//! ```text
//! offset  0: sig_bits_charge            u32
//! offset  4: sig_bits_width             u32
//! offset  8: reduced_attached           u32 (0 | 1)
//! offset 12: unattached_factor_base1024 u32
//! ```

use hitpack_core::{truncate_le_elements, CompressionSettings, QuantizedField};
use hitpack_device::{
    DeviceError, KernelContext, KernelDescriptor, KernelId, KernelRegistry, ResolvedArg,
};
use rayon::prelude::*;

/// Truncate one structure-of-arrays array in place.
///
/// Arguments: the array bytes, the element size (`u32`) and the
/// [`QuantizedField::code`] governing the array (`u32`).
pub const TRUNCATE_FIELD: KernelId = KernelId("compression.truncate_field");

/// Build the per-track first-cluster table in scratch memory.
///
/// Arguments: the `nTrackClusters` array (`u16` per track), the
/// `attachedClusterFirstIndex` scratch array (`u32` per track) and the
/// stored attached cluster count (`u32`). Faults when the per-track counts
/// do not add up to the stored count.
pub const TRACK_FIRST_INDEX: KernelId = KernelId("compression.track_first_index");

/// Offset of the settings block in the constant region.
pub const SETTINGS_OFFSET: usize = 0;

/// Size of the settings block.
pub const SETTINGS_BLOCK_SIZE: usize = 16;

/// Elements per parallel work item.
const ELEMENTS_PER_CHUNK: usize = 4096;

/// Encode `settings` as the constant-region block.
pub fn encode_settings(settings: &CompressionSettings) -> [u8; SETTINGS_BLOCK_SIZE] {
    let mut block = [0u8; SETTINGS_BLOCK_SIZE];
    block[0..4].copy_from_slice(&settings.sig_bits_charge.to_le_bytes());
    block[4..8].copy_from_slice(&settings.sig_bits_width.to_le_bytes());
    block[8..12].copy_from_slice(&u32::from(settings.reduced_attached).to_le_bytes());
    block[12..16].copy_from_slice(&settings.unattached_factor_base1024.to_le_bytes());
    block
}

/// Decode a settings block.
pub fn decode_settings(block: &[u8]) -> Option<CompressionSettings> {
    let word = |i: usize| -> Option<u32> {
        let bytes = block.get(i..i + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    };
    Some(CompressionSettings {
        sig_bits_charge: word(0)?,
        sig_bits_width: word(4)?,
        reduced_attached: word(8)? != 0,
        unattached_factor_base1024: word(12)?,
    })
}

fn truncate_field(ctx: &KernelContext, args: &[ResolvedArg]) -> hitpack_device::Result<()> {
    let [buffer, elem_size, field] = args else {
        return Err(DeviceError::kernel(format!(
            "{} takes 3 arguments, got {}",
            ctx.kernel(),
            args.len()
        )));
    };
    let buffer = buffer.buffer()?;
    let elem_size = elem_size.u32()? as usize;
    let field = QuantizedField::from_code(field.u32()?)
        .ok_or_else(|| DeviceError::kernel(format!("{}: unknown field code", ctx.kernel())))?;
    if !matches!(elem_size, 1 | 2 | 4) || buffer.len() % elem_size != 0 {
        return Err(DeviceError::kernel(format!(
            "{}: {} bytes is not a whole number of {}-byte elements",
            ctx.kernel(),
            buffer.len(),
            elem_size
        )));
    }

    let settings = ctx
        .with_constant(|c| decode_settings(c.get(SETTINGS_OFFSET..).unwrap_or_default()))?
        .ok_or_else(|| DeviceError::kernel("constant region too small for settings"))?;
    let bits = settings.bits_for(field);
    if bits == 0 {
        return Ok(());
    }
    let max = field.max_value();

    let changed: usize = buffer.with_mut(|bytes| {
        bytes
            .par_chunks_mut(ELEMENTS_PER_CHUNK * elem_size)
            .map(|chunk| truncate_le_elements(chunk, elem_size, bits, max))
            .sum()
    })?;
    tracing::trace!(field = field.name(), bits, changed, "field truncated");
    Ok(())
}

fn track_first_index(ctx: &KernelContext, args: &[ResolvedArg]) -> hitpack_device::Result<()> {
    let [counts, first_index, attached] = args else {
        return Err(DeviceError::kernel(format!(
            "{} takes 3 arguments, got {}",
            ctx.kernel(),
            args.len()
        )));
    };
    let first_index = first_index.buffer()?;
    let attached = attached.u32()?;
    let counts: Vec<u32> = counts.buffer()?.with(|bytes| {
        bytes
            .chunks_exact(2)
            .map(|c| u32::from(u16::from_le_bytes([c[0], c[1]])))
            .collect()
    })?;
    if first_index.len() < counts.len() * 4 {
        return Err(DeviceError::kernel(format!(
            "{}: table of {} bytes cannot index {} tracks",
            ctx.kernel(),
            first_index.len(),
            counts.len()
        )));
    }

    let mut table = Vec::with_capacity(counts.len());
    let mut next = 0u32;
    for n in &counts {
        table.push(next);
        next = next.saturating_add(*n);
    }
    if next != attached {
        return Err(DeviceError::kernel(format!(
            "{}: tracks reference {} clusters, dataset stores {}",
            ctx.kernel(),
            next,
            attached
        )));
    }
    first_index.with_mut(|bytes| {
        for (dst, first) in bytes.chunks_exact_mut(4).zip(&table) {
            dst.copy_from_slice(&first.to_le_bytes());
        }
    })?;
    tracing::trace!(tracks = table.len(), attached, "first-index table built");
    Ok(())
}

/// Registry holding the encode kernels and the built-in ones.
pub fn compression_kernels() -> hitpack_device::Result<KernelRegistry> {
    let mut registry = KernelRegistry::new();
    registry.register(KernelDescriptor::new(TRUNCATE_FIELD, truncate_field))?;
    registry.register(KernelDescriptor::new(TRACK_FIRST_INDEX, track_first_index))?;
    Ok(registry)
}
