//! Compressed cluster datasets.
//!
//! A dataset is one byte region laid out by an output [`LayoutPlan`]. The
//! region *is* the flat serialized form: a header carrying the stored
//! counts, capacities and precision bits, followed by the structure of
//! arrays. [`DatasetView`] and [`DatasetViewMut`] are typed windows onto
//! those bytes, so the flat form and the per-array view can never
//! disagree.
//!
//! Mutation goes through a narrow API (`append_*`, `set_counts`, `clear`)
//! that checks every capacity before the first byte is written.

use crate::constants::{QuantizedField, BUFFER_ALIGNMENT, NSLICES, ROW_COUNT};
use crate::error::{Error, Result};
use crate::layout::{ArrayId, ArraySpan, Counts, DatasetCapacity, LayoutPlan, HEADER_SIZE};
use crate::settings::CompressionSettings;
use crate::truncate::truncate_le_elements;

/// Header magic.
pub const DATASET_MAGIC: [u8; 4] = *b"HPK1";

/// Header format version.
pub const DATASET_VERSION: u16 = 1;

const FLAG_REDUCED: u16 = 1;

/// Arrays subject to significant-bit truncation and the field that governs each.
pub const TRUNCATED_ARRAYS: [(ArrayId, QuantizedField); 8] = [
    (ArrayId::QTotA, QuantizedField::Charge),
    (ArrayId::QMaxA, QuantizedField::ChargeMax),
    (ArrayId::SigmaPadA, QuantizedField::Width),
    (ArrayId::SigmaTimeA, QuantizedField::Width),
    (ArrayId::QTotU, QuantizedField::Charge),
    (ArrayId::QMaxU, QuantizedField::ChargeMax),
    (ArrayId::SigmaPadU, QuantizedField::Width),
    (ArrayId::SigmaTimeU, QuantizedField::Width),
];

/// Decoded dataset header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetHeader {
    pub counts: Counts,
    pub capacity: DatasetCapacity,
    pub sig_bits_charge: u8,
    pub sig_bits_width: u8,
    pub total_size: u64,
}

impl DatasetHeader {
    /// Serialize into the first [`HEADER_SIZE`] bytes of `out`.
    pub fn write(&self, out: &mut [u8]) {
        let out = &mut out[..HEADER_SIZE];
        out.fill(0);
        out[0..4].copy_from_slice(&DATASET_MAGIC);
        out[4..6].copy_from_slice(&DATASET_VERSION.to_le_bytes());
        let flags = if self.capacity.reduced { FLAG_REDUCED } else { 0 };
        out[6..8].copy_from_slice(&flags.to_le_bytes());
        out[8..12].copy_from_slice(&self.counts.tracks.to_le_bytes());
        out[12..16].copy_from_slice(&self.counts.attached.to_le_bytes());
        out[16..20].copy_from_slice(&self.counts.unattached.to_le_bytes());
        out[20..24].copy_from_slice(&self.capacity.tracks.to_le_bytes());
        out[24..28].copy_from_slice(&self.capacity.attached.to_le_bytes());
        out[28..32].copy_from_slice(&self.capacity.unattached.to_le_bytes());
        out[32] = self.sig_bits_charge;
        out[33] = self.sig_bits_width;
        out[40..48].copy_from_slice(&self.total_size.to_le_bytes());
    }

    /// Parse a header.
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::corrupted(format!(
                "header needs {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }
        if bytes[0..4] != DATASET_MAGIC {
            return Err(Error::corrupted("bad dataset magic"));
        }
        let version = read_u16(bytes, 4);
        if version != DATASET_VERSION {
            return Err(Error::corrupted(format!("unsupported dataset version {}", version)));
        }
        let flags = read_u16(bytes, 6);
        Ok(DatasetHeader {
            counts: Counts {
                tracks: read_u32(bytes, 8),
                attached: read_u32(bytes, 12),
                unattached: read_u32(bytes, 16),
            },
            capacity: DatasetCapacity {
                tracks: read_u32(bytes, 20),
                attached: read_u32(bytes, 24),
                unattached: read_u32(bytes, 28),
                reduced: flags & FLAG_REDUCED != 0,
            },
            sig_bits_charge: bytes[32],
            sig_bits_width: bytes[33],
            total_size: u64::from_le_bytes(bytes[40..48].try_into().unwrap_or([0; 8])),
        })
    }
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_elem(bytes: &[u8], span: &ArraySpan, index: u32) -> u32 {
    let at = span.offset + index as usize * span.elem_size;
    match span.elem_size {
        1 => u32::from(bytes[at]),
        2 => u32::from(read_u16(bytes, at)),
        _ => read_u32(bytes, at),
    }
}

fn write_elem(bytes: &mut [u8], span: &ArraySpan, index: u32, value: u32) {
    let at = span.offset + index as usize * span.elem_size;
    match span.elem_size {
        1 => bytes[at] = value as u8,
        2 => bytes[at..at + 2].copy_from_slice(&(value as u16).to_le_bytes()),
        _ => bytes[at..at + 4].copy_from_slice(&value.to_le_bytes()),
    }
}

/// Per-track fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackFields {
    pub q_pt: u8,
    pub row: u8,
    pub slice: u8,
    pub time: u32,
    pub pad: u16,
}

/// Per-attached-cluster fields.
///
/// In reduced mode the residual fields (`row_diff`, `slice_leg_diff`,
/// `pad_res`, `time_res`) of a track's first cluster are not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttachedClusterFields {
    pub q_tot: u16,
    pub q_max: u16,
    pub flags: u8,
    pub row_diff: u8,
    pub slice_leg_diff: u8,
    pub pad_res: u16,
    pub time_res: u32,
    pub sigma_pad: u8,
    pub sigma_time: u8,
}

/// Per-unattached-cluster fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnattachedClusterFields {
    pub q_tot: u16,
    pub q_max: u16,
    pub flags: u8,
    pub pad_diff: u16,
    pub time_diff: u32,
    pub sigma_pad: u8,
    pub sigma_time: u8,
}

/// Read-only typed view over a dataset region.
#[derive(Debug, Clone)]
pub struct DatasetView<'a> {
    bytes: &'a [u8],
    plan: LayoutPlan,
}

/// Mutable typed view over a dataset region.
#[derive(Debug)]
pub struct DatasetViewMut<'a> {
    bytes: &'a mut [u8],
    plan: LayoutPlan,
}

/// Bind a read-only view to an already sized region without touching its bytes.
///
/// The region must start at an address congruent to `plan.base()` modulo
/// [`BUFFER_ALIGNMENT`], so every array keeps the alignment it was sized with.
pub fn place<'a>(plan: &LayoutPlan, region: &'a [u8]) -> Result<DatasetView<'a>> {
    check_placement(plan, region.as_ptr() as usize, region.len())?;
    Ok(DatasetView {
        bytes: &region[..plan.total_size()],
        plan: plan.clone(),
    })
}

/// Bind a mutable view to an already sized region without touching its bytes.
pub fn place_mut<'a>(plan: &LayoutPlan, region: &'a mut [u8]) -> Result<DatasetViewMut<'a>> {
    check_placement(plan, region.as_ptr() as usize, region.len())?;
    Ok(DatasetViewMut {
        bytes: &mut region[..plan.total_size()],
        plan: plan.clone(),
    })
}

fn check_placement(plan: &LayoutPlan, address: usize, len: usize) -> Result<()> {
    if !plan.has_header() {
        return Err(Error::InvalidRecord(format!(
            "{:?} plan does not describe a dataset region",
            plan.phase()
        )));
    }
    if address % BUFFER_ALIGNMENT != plan.base() % BUFFER_ALIGNMENT {
        return Err(Error::InvalidRecord(format!(
            "region at {:#x} breaks the {}-byte alignment of a plan based at {:#x}",
            address,
            BUFFER_ALIGNMENT,
            plan.base()
        )));
    }
    plan.check_region(len)
}

/// Re-derive the plan a flat buffer was written with and check it against the header.
fn plan_from_flat(bytes: &[u8]) -> Result<(DatasetHeader, LayoutPlan)> {
    let header = DatasetHeader::read(bytes)?;
    let plan = LayoutPlan::host_output(header.capacity, 0)?;
    if header.total_size != plan.total_size() as u64 {
        return Err(Error::corrupted(format!(
            "header size {} does not match layout size {}",
            header.total_size,
            plan.total_size()
        )));
    }
    if bytes.len() < plan.total_size() {
        return Err(Error::corrupted(format!(
            "buffer holds {} bytes, layout needs {}",
            bytes.len(),
            plan.total_size()
        )));
    }
    header
        .capacity
        .check(&header.counts)
        .map_err(|e| Error::corrupted(format!("stored counts exceed capacity: {}", e)))?;
    check_track_clusters(bytes, &header, &plan)?;
    Ok((header, plan))
}

/// The per-track cluster counts must cover exactly the stored attached
/// clusters, with at least one cluster per track in reduced storage.
fn check_track_clusters(bytes: &[u8], header: &DatasetHeader, plan: &LayoutPlan) -> Result<()> {
    let Some(span) = plan.span(ArrayId::NTrackClusters) else {
        return Ok(());
    };
    let mut total = 0u64;
    for t in 0..header.counts.tracks {
        let n = read_elem(bytes, &span, t);
        if n == 0 && header.capacity.reduced {
            return Err(Error::corrupted(format!(
                "track {} has no clusters in reduced storage",
                t
            )));
        }
        total += u64::from(n);
    }
    if total != u64::from(header.counts.attached) {
        return Err(Error::corrupted(format!(
            "tracks reference {} clusters, header stores {}",
            total, header.counts.attached
        )));
    }
    Ok(())
}

macro_rules! view_readers {
    () => {
        /// Layout this view was placed with.
        pub fn plan(&self) -> &LayoutPlan {
            &self.plan
        }

        /// Total size of the region in bytes.
        pub fn total_bytes(&self) -> usize {
            self.plan.total_size()
        }

        /// The flat serialized form.
        pub fn as_flat(&self) -> &[u8] {
            &self.bytes[..]
        }

        /// Decoded header.
        pub fn header(&self) -> Result<DatasetHeader> {
            DatasetHeader::read(&self.bytes[..])
        }

        /// Stored record counts.
        pub fn counts(&self) -> Counts {
            Counts {
                tracks: read_u32(&self.bytes[..], 8),
                attached: read_u32(&self.bytes[..], 12),
                unattached: read_u32(&self.bytes[..], 16),
            }
        }

        /// Capacity of the arrays.
        pub fn capacity(&self) -> DatasetCapacity {
            self.plan.capacity()
        }

        /// Raw bytes of one array (full capacity).
        pub fn array_bytes(&self, id: ArrayId) -> Option<&[u8]> {
            let span = self.plan.span(id)?;
            Some(&self.bytes[span.range()])
        }

        /// Element `index` of array `id`, widened to `u32`.
        pub fn get(&self, id: ArrayId, index: u32) -> Option<u32> {
            let span = self.plan.span(id)?;
            (index < span.len).then(|| read_elem(&self.bytes[..], &span, index))
        }

        /// Fields of track `index`.
        pub fn track(&self, index: u32) -> Option<TrackFields> {
            if index >= self.counts().tracks {
                return None;
            }
            Some(TrackFields {
                q_pt: self.get(ArrayId::QPtA, index)? as u8,
                row: self.get(ArrayId::RowA, index)? as u8,
                slice: self.get(ArrayId::SliceA, index)? as u8,
                time: self.get(ArrayId::TimeA, index)?,
                pad: self.get(ArrayId::PadA, index)? as u16,
            })
        }

        /// Clusters attached to track `index`, in storage order.
        pub fn track_clusters(&self, index: u32) -> Option<Vec<AttachedClusterFields>> {
            let counts = self.counts();
            if index >= counts.tracks {
                return None;
            }
            let reduced = self.plan.capacity().reduced;
            let mut first = 0u32;
            for t in 0..index {
                first = first.checked_add(self.get(ArrayId::NTrackClusters, t)?)?;
            }
            let n = self.get(ArrayId::NTrackClusters, index)?;
            if first.checked_add(n)? > counts.attached {
                return None;
            }
            let mut clusters = Vec::with_capacity(n as usize);
            for j in 0..n {
                let c = first + j;
                let residual = if !reduced {
                    Some(c)
                } else if j == 0 {
                    None
                } else {
                    Some(c.checked_sub(index + 1)?)
                };
                let mut fields = AttachedClusterFields {
                    q_tot: self.get(ArrayId::QTotA, c)? as u16,
                    q_max: self.get(ArrayId::QMaxA, c)? as u16,
                    flags: self.get(ArrayId::FlagsA, c)? as u8,
                    sigma_pad: self.get(ArrayId::SigmaPadA, c)? as u8,
                    sigma_time: self.get(ArrayId::SigmaTimeA, c)? as u8,
                    ..AttachedClusterFields::default()
                };
                if let Some(r) = residual {
                    fields.row_diff = self.get(ArrayId::RowDiffA, r)? as u8;
                    fields.slice_leg_diff = self.get(ArrayId::SliceLegDiffA, r)? as u8;
                    fields.pad_res = self.get(ArrayId::PadResA, r)? as u16;
                    fields.time_res = self.get(ArrayId::TimeResA, r)?;
                }
                clusters.push(fields);
            }
            Some(clusters)
        }

        /// Fields of unattached cluster `index`.
        pub fn unattached_cluster(&self, index: u32) -> Option<UnattachedClusterFields> {
            if index >= self.counts().unattached {
                return None;
            }
            Some(UnattachedClusterFields {
                q_tot: self.get(ArrayId::QTotU, index)? as u16,
                q_max: self.get(ArrayId::QMaxU, index)? as u16,
                flags: self.get(ArrayId::FlagsU, index)? as u8,
                pad_diff: self.get(ArrayId::PadDiffU, index)? as u16,
                time_diff: self.get(ArrayId::TimeDiffU, index)?,
                sigma_pad: self.get(ArrayId::SigmaPadU, index)? as u8,
                sigma_time: self.get(ArrayId::SigmaTimeU, index)? as u8,
            })
        }

        /// Unattached clusters recorded for a slice and row.
        pub fn slice_row_clusters(&self, slice: u32, row: u32) -> Option<u32> {
            if slice >= NSLICES || row >= ROW_COUNT {
                return None;
            }
            self.get(ArrayId::NSliceRowClusters, slice * ROW_COUNT + row)
        }
    };
}

impl<'a> DatasetView<'a> {
    /// Parse a flat buffer into a view.
    pub fn from_flat(bytes: &'a [u8]) -> Result<Self> {
        let (_, plan) = plan_from_flat(bytes)?;
        Ok(DatasetView {
            bytes: &bytes[..plan.total_size()],
            plan,
        })
    }

    view_readers!();
}

impl<'a> DatasetViewMut<'a> {
    view_readers!();

    /// Write a fresh header with zero counts for the settings in effect.
    pub fn initialize(&mut self, settings: &CompressionSettings) {
        let (sig_bits_charge, sig_bits_width) = settings.header_bits();
        let header = DatasetHeader {
            counts: Counts::default(),
            capacity: self.plan.capacity(),
            sig_bits_charge,
            sig_bits_width,
            total_size: self.plan.total_size() as u64,
        };
        header.write(&mut self.bytes[..]);
    }

    /// Read-only view of the same bytes.
    pub fn as_view(&self) -> DatasetView<'_> {
        DatasetView {
            bytes: &self.bytes[..],
            plan: self.plan.clone(),
        }
    }

    /// Mutable raw bytes of one array.
    pub fn array_bytes_mut(&mut self, id: ArrayId) -> Option<&mut [u8]> {
        let span = self.plan.span(id)?;
        Some(&mut self.bytes[span.range()])
    }

    fn write_counts(&mut self, counts: Counts) {
        self.bytes[8..12].copy_from_slice(&counts.tracks.to_le_bytes());
        self.bytes[12..16].copy_from_slice(&counts.attached.to_le_bytes());
        self.bytes[16..20].copy_from_slice(&counts.unattached.to_le_bytes());
    }

    fn put(&mut self, id: ArrayId, index: u32, value: u32) -> Result<()> {
        let span = self
            .plan
            .span(id)
            .ok_or_else(|| Error::InvalidRecord(format!("{} not in layout", id.name())))?;
        if index >= span.len {
            return Err(Error::sizing(id.name(), u64::from(index) + 1, u64::from(span.len)));
        }
        write_elem(&mut self.bytes[..], &span, index, value);
        Ok(())
    }

    /// Overwrite the stored counts after checking them against the capacity.
    pub fn set_counts(&mut self, counts: Counts) -> Result<()> {
        self.plan.capacity().check(&counts)?;
        self.write_counts(counts);
        Ok(())
    }

    /// Zero every array and reset the counts.
    pub fn clear(&mut self) {
        self.bytes[HEADER_SIZE..].fill(0);
        self.write_counts(Counts::default());
    }

    /// Append one track and its attached clusters.
    ///
    /// Fails without writing anything if any array would overflow.
    pub fn append_track(
        &mut self,
        track: TrackFields,
        clusters: &[AttachedClusterFields],
    ) -> Result<()> {
        let capacity = self.plan.capacity();
        let counts = self.counts();
        let n = u32::try_from(clusters.len())
            .ok()
            .filter(|&n| n <= u32::from(u16::MAX))
            .ok_or_else(|| Error::InvalidRecord(format!("{} clusters on one track", clusters.len())))?;
        if capacity.reduced && n == 0 {
            return Err(Error::InvalidRecord(
                "reduced storage needs at least one cluster per track".into(),
            ));
        }

        let next = Counts {
            tracks: counts
                .tracks
                .checked_add(1)
                .ok_or_else(|| Error::sizing("tracks", u64::from(u32::MAX) + 1, capacity.tracks.into()))?,
            attached: counts
                .attached
                .checked_add(n)
                .ok_or_else(|| Error::sizing("attached clusters", u64::from(counts.attached) + u64::from(n), capacity.attached.into()))?,
            unattached: counts.unattached,
        };
        capacity.check(&next)?;
        let residual_base = counts.residual_attached(capacity.reduced)?;

        let t = counts.tracks;
        self.put(ArrayId::QPtA, t, track.q_pt.into())?;
        self.put(ArrayId::RowA, t, track.row.into())?;
        self.put(ArrayId::SliceA, t, track.slice.into())?;
        self.put(ArrayId::TimeA, t, track.time)?;
        self.put(ArrayId::PadA, t, track.pad.into())?;
        self.put(ArrayId::NTrackClusters, t, n)?;

        for (j, cluster) in clusters.iter().enumerate() {
            let j = j as u32;
            let c = counts.attached + j;
            self.put(ArrayId::QTotA, c, cluster.q_tot.into())?;
            self.put(ArrayId::QMaxA, c, cluster.q_max.into())?;
            self.put(ArrayId::FlagsA, c, cluster.flags.into())?;
            self.put(ArrayId::SigmaPadA, c, cluster.sigma_pad.into())?;
            self.put(ArrayId::SigmaTimeA, c, cluster.sigma_time.into())?;

            let residual = if capacity.reduced {
                if j == 0 {
                    continue;
                }
                residual_base + j - 1
            } else {
                c
            };
            self.put(ArrayId::RowDiffA, residual, cluster.row_diff.into())?;
            self.put(ArrayId::SliceLegDiffA, residual, cluster.slice_leg_diff.into())?;
            self.put(ArrayId::PadResA, residual, cluster.pad_res.into())?;
            self.put(ArrayId::TimeResA, residual, cluster.time_res)?;
        }

        self.write_counts(next);
        Ok(())
    }

    /// Append one unattached cluster belonging to `slice` and `row`.
    pub fn append_unattached_cluster(
        &mut self,
        slice: u32,
        row: u32,
        cluster: UnattachedClusterFields,
    ) -> Result<()> {
        if slice >= NSLICES || row >= ROW_COUNT {
            return Err(Error::InvalidRecord(format!(
                "slice {} row {} outside detector",
                slice, row
            )));
        }
        let capacity = self.plan.capacity();
        let counts = self.counts();
        if counts.unattached >= capacity.unattached {
            return Err(Error::sizing(
                "unattached clusters",
                u64::from(counts.unattached) + 1,
                capacity.unattached.into(),
            ));
        }

        let u = counts.unattached;
        self.put(ArrayId::QTotU, u, cluster.q_tot.into())?;
        self.put(ArrayId::QMaxU, u, cluster.q_max.into())?;
        self.put(ArrayId::FlagsU, u, cluster.flags.into())?;
        self.put(ArrayId::PadDiffU, u, cluster.pad_diff.into())?;
        self.put(ArrayId::TimeDiffU, u, cluster.time_diff)?;
        self.put(ArrayId::SigmaPadU, u, cluster.sigma_pad.into())?;
        self.put(ArrayId::SigmaTimeU, u, cluster.sigma_time.into())?;

        let slot = slice * ROW_COUNT + row;
        let in_row = self.get(ArrayId::NSliceRowClusters, slot).unwrap_or(0);
        self.put(ArrayId::NSliceRowClusters, slot, in_row.wrapping_add(1))?;

        self.write_counts(Counts {
            unattached: u + 1,
            ..counts
        });
        Ok(())
    }

    /// Apply significant-bit truncation to every stored charge and width.
    ///
    /// Returns the number of values that changed.
    pub fn truncate_fields(&mut self, settings: &CompressionSettings) -> usize {
        let counts = self.counts();
        let mut changed = 0;
        for (id, field) in TRUNCATED_ARRAYS {
            let stored = match id {
                ArrayId::QTotU | ArrayId::QMaxU | ArrayId::SigmaPadU | ArrayId::SigmaTimeU => {
                    counts.unattached
                }
                _ => counts.attached,
            };
            let Some(span) = self.plan.span(id) else {
                continue;
            };
            let end = span.offset + stored.min(span.len) as usize * span.elem_size;
            changed += truncate_le_elements(
                &mut self.bytes[span.offset..end],
                span.elem_size,
                settings.bits_for(field),
                field.max_value(),
            );
        }
        changed
    }
}

/// An owned dataset region.
#[derive(Debug, Clone)]
pub struct CompressedDataset {
    bytes: Vec<u8>,
    plan: LayoutPlan,
}

impl CompressedDataset {
    /// Allocate a zeroed host dataset of the given capacity.
    pub fn allocate(capacity: DatasetCapacity, settings: &CompressionSettings) -> Result<Self> {
        let plan = LayoutPlan::host_output(capacity, 0)?;
        let mut dataset = CompressedDataset {
            bytes: vec![0u8; plan.total_size()],
            plan,
        };
        dataset.view_mut().initialize(settings);
        Ok(dataset)
    }

    /// Take ownership of a flat buffer after validating it.
    pub fn from_flat(mut bytes: Vec<u8>) -> Result<Self> {
        let (_, plan) = plan_from_flat(&bytes)?;
        bytes.truncate(plan.total_size());
        Ok(CompressedDataset { bytes, plan })
    }

    /// Layout of the region.
    pub fn plan(&self) -> &LayoutPlan {
        &self.plan
    }

    /// Typed read-only view.
    pub fn view(&self) -> DatasetView<'_> {
        DatasetView {
            bytes: &self.bytes,
            plan: self.plan.clone(),
        }
    }

    /// Typed mutable view.
    pub fn view_mut(&mut self) -> DatasetViewMut<'_> {
        DatasetViewMut {
            bytes: &mut self.bytes,
            plan: self.plan.clone(),
        }
    }

    /// The flat serialized form.
    pub fn as_flat(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume into the flat serialized form.
    pub fn into_flat(self) -> Vec<u8> {
        self.bytes
    }

    /// Stored record counts.
    pub fn counts(&self) -> Counts {
        self.view().counts()
    }

    /// Copy into a dataset whose capacity equals the stored counts.
    pub fn compact(&self) -> Result<Self> {
        let src = self.view();
        let header = src.header()?;
        let capacity = DatasetCapacity::from_counts(header.counts, header.capacity.reduced);
        let plan = LayoutPlan::host_output(capacity, 0)?;
        let mut bytes = vec![0u8; plan.total_size()];
        DatasetHeader {
            capacity,
            total_size: plan.total_size() as u64,
            ..header
        }
        .write(&mut bytes);

        for (id, dst) in plan.spans() {
            let Some(from) = self.plan.span(id) else {
                continue;
            };
            let n = dst.byte_len().min(from.byte_len());
            bytes[dst.offset..dst.offset + n].copy_from_slice(&self.bytes[from.offset..from.offset + n]);
        }
        tracing::trace!(from = self.bytes.len(), to = bytes.len(), "dataset compacted");
        Ok(CompressedDataset { bytes, plan })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::CapacityParams;

    fn capacity(reduced: bool) -> DatasetCapacity {
        DatasetCapacity {
            tracks: 4,
            attached: 16,
            unattached: 8,
            reduced,
        }
    }

    fn cluster(q: u16) -> AttachedClusterFields {
        AttachedClusterFields {
            q_tot: q,
            q_max: q / 2,
            flags: 1,
            row_diff: 2,
            slice_leg_diff: 0,
            pad_res: 300,
            time_res: 70_000,
            sigma_pad: 9,
            sigma_time: 10,
        }
    }

    #[test]
    fn test_fresh_dataset_views_agree() {
        let params = CapacityParams {
            max_tracks: 100,
            max_clusters: 10_000,
            max_track_clusters: 10_000,
            max_clusters_in_cache: 10_000,
            cluster_factor_base1024: 1024,
            reduced_attached: false,
        };
        let dataset =
            CompressedDataset::allocate(params.output_capacity(), &CompressionSettings::default())
                .unwrap();
        let view = dataset.view();
        assert_eq!(view.total_bytes(), dataset.as_flat().len());
        assert_eq!(view.counts(), Counts::default());

        let parsed = DatasetView::from_flat(dataset.as_flat()).unwrap();
        assert_eq!(parsed.total_bytes(), view.total_bytes());
        assert_eq!(parsed.counts().tracks, 0);
    }

    #[test]
    fn test_append_track_and_read_back() {
        let mut dataset = CompressedDataset::allocate(capacity(false), &CompressionSettings::default()).unwrap();
        let track = TrackFields {
            q_pt: 7,
            row: 12,
            slice: 3,
            time: 123_456,
            pad: 4000,
        };
        dataset.view_mut().append_track(track, &[cluster(100), cluster(200)]).unwrap();
        dataset.view_mut().append_track(track, &[cluster(300)]).unwrap();

        let view = dataset.view();
        assert_eq!(
            view.counts(),
            Counts {
                tracks: 2,
                attached: 3,
                unattached: 0
            }
        );
        assert_eq!(view.track(1), Some(track));
        let clusters = view.track_clusters(1).unwrap();
        assert_eq!(clusters, vec![cluster(300)]);
        assert_eq!(view.track_clusters(0).unwrap()[1], cluster(200));
        assert!(view.track(2).is_none());
    }

    #[test]
    fn test_reduced_mode_drops_first_residual() {
        let mut dataset = CompressedDataset::allocate(capacity(true), &CompressionSettings::default()).unwrap();
        let track = TrackFields::default();
        dataset.view_mut().append_track(track, &[cluster(10), cluster(20), cluster(30)]).unwrap();
        dataset.view_mut().append_track(track, &[cluster(40), cluster(50)]).unwrap();

        let view = dataset.view();
        let first = view.track_clusters(0).unwrap();
        assert_eq!(first[0].pad_res, 0);
        assert_eq!(first[0].q_tot, 10);
        assert_eq!(first[1], cluster(20));
        let second = view.track_clusters(1).unwrap();
        assert_eq!(second[1], cluster(50));
        assert_eq!(view.get(ArrayId::PadResA, 2), Some(300));
    }

    #[test]
    fn test_reduced_mode_rejects_empty_track() {
        let mut dataset = CompressedDataset::allocate(capacity(true), &CompressionSettings::default()).unwrap();
        let err = dataset.view_mut().append_track(TrackFields::default(), &[]).unwrap_err();
        assert_eq!(err.category(), "invalid_record");
    }

    #[test]
    fn test_overflow_fails_closed() {
        let mut dataset = CompressedDataset::allocate(capacity(false), &CompressionSettings::default()).unwrap();
        let clusters: Vec<_> = (0..10).map(cluster).collect();
        dataset.view_mut().append_track(TrackFields::default(), &clusters).unwrap();
        let before = dataset.as_flat().to_vec();

        let err = dataset
            .view_mut()
            .append_track(TrackFields { q_pt: 1, ..TrackFields::default() }, &clusters)
            .unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(dataset.as_flat(), &before[..]);
    }

    #[test]
    fn test_reduced_residual_capacity_checked() {
        // residual capacity is attached - tracks = 2
        let cap = DatasetCapacity {
            tracks: 2,
            attached: 4,
            unattached: 0,
            reduced: true,
        };
        let mut dataset = CompressedDataset::allocate(cap, &CompressionSettings::default()).unwrap();
        let err = dataset
            .view_mut()
            .append_track(TrackFields::default(), &[cluster(1), cluster(2), cluster(3), cluster(4)])
            .unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(dataset.counts(), Counts::default());
    }

    #[test]
    fn test_unattached_counts_per_row() {
        let mut dataset = CompressedDataset::allocate(capacity(false), &CompressionSettings::default()).unwrap();
        let c = UnattachedClusterFields {
            q_tot: 55,
            q_max: 20,
            flags: 0,
            pad_diff: 1,
            time_diff: 2,
            sigma_pad: 3,
            sigma_time: 4,
        };
        let mut view = dataset.view_mut();
        view.append_unattached_cluster(5, 100, c).unwrap();
        view.append_unattached_cluster(5, 100, c).unwrap();
        view.append_unattached_cluster(35, 151, c).unwrap();
        assert!(view.append_unattached_cluster(36, 0, c).is_err());
        assert_eq!(view.slice_row_clusters(5, 100), Some(2));
        assert_eq!(view.slice_row_clusters(35, 151), Some(1));
        assert_eq!(view.unattached_cluster(2), Some(c));
        assert_eq!(view.counts().unattached, 3);
    }

    #[test]
    fn test_set_counts_checks_capacity() {
        let mut dataset = CompressedDataset::allocate(capacity(false), &CompressionSettings::default()).unwrap();
        let mut view = dataset.view_mut();
        assert!(view
            .set_counts(Counts {
                tracks: 5,
                attached: 0,
                unattached: 0
            })
            .is_err());
        view.set_counts(Counts {
            tracks: 4,
            attached: 16,
            unattached: 8,
        })
        .unwrap();
        view.clear();
        assert_eq!(view.counts(), Counts::default());
    }

    #[test]
    fn test_truncate_fields_only_touches_stored_entries() {
        let settings = CompressionSettings::default();
        let mut dataset = CompressedDataset::allocate(capacity(false), &settings).unwrap();
        let mut view = dataset.view_mut();
        view.append_track(TrackFields::default(), &[cluster(1000)]).unwrap();
        // stale value past the stored count
        view.array_bytes_mut(ArrayId::QTotA).unwrap()[2..4].copy_from_slice(&1000u16.to_le_bytes());

        let changed = view.truncate_fields(&settings);
        assert!(changed >= 1);
        assert_eq!(view.get(ArrayId::QTotA, 0), Some(1024));
        assert_eq!(view.get(ArrayId::QTotA, 1), Some(1000));
    }

    #[test]
    fn test_compact_preserves_records() {
        let settings = CompressionSettings::default();
        let mut dataset = CompressedDataset::allocate(capacity(true), &settings).unwrap();
        dataset
            .view_mut()
            .append_track(TrackFields { pad: 9, ..TrackFields::default() }, &[cluster(5), cluster(6)])
            .unwrap();
        let compact = dataset.compact().unwrap();
        assert!(compact.as_flat().len() < dataset.as_flat().len());
        let view = compact.view();
        assert_eq!(view.capacity().tracks, 1);
        assert_eq!(view.track(0).unwrap().pad, 9);
        assert_eq!(view.track_clusters(0).unwrap()[1], cluster(6));
        DatasetView::from_flat(compact.as_flat()).unwrap();
    }

    #[test]
    fn test_from_flat_rejects_garbage() {
        assert!(DatasetView::from_flat(&[0u8; 10]).is_err());
        let mut bytes = CompressedDataset::allocate(capacity(false), &CompressionSettings::default())
            .unwrap()
            .into_flat();
        bytes[0] = b'X';
        assert!(CompressedDataset::from_flat(bytes).is_err());
    }

    #[test]
    fn test_header_records_precision() {
        let settings = CompressionSettings {
            sig_bits_charge: 6,
            sig_bits_width: 2,
            ..CompressionSettings::default()
        };
        let dataset = CompressedDataset::allocate(capacity(false), &settings).unwrap();
        let header = dataset.view().header().unwrap();
        assert_eq!((header.sig_bits_charge, header.sig_bits_width), (6, 2));
        assert_eq!(header.total_size as usize, dataset.as_flat().len());
    }

    #[test]
    fn test_place_requires_output_plan() {
        let params = CapacityParams::default();
        let scratch = LayoutPlan::scratch(&params, 0).unwrap();
        let mut region = vec![0u8; scratch.total_size() + HEADER_SIZE];
        assert!(place_mut(&scratch, &mut region).is_err());

        let plan = LayoutPlan::device_output(capacity(false), 0).unwrap();
        let mut short = vec![0u8; plan.total_size() - 1];
        assert!(place_mut(&plan, &mut short).is_err());
    }

    #[test]
    fn test_place_checks_region_alignment() {
        let plan = LayoutPlan::device_output(capacity(false), 0).unwrap();
        let mut region = vec![0u8; plan.total_size() + 2 * BUFFER_ALIGNMENT];
        let pad = region.as_ptr().align_offset(BUFFER_ALIGNMENT);
        let aligned = &mut region[pad..];

        let mut view = place_mut(&plan, aligned).unwrap();
        view.initialize(&CompressionSettings::default());
        assert_eq!(place(&plan, aligned).unwrap().counts(), Counts::default());

        let err = place(&plan, &aligned[1..]).unwrap_err();
        assert_eq!(err.category(), "invalid_record");
        assert!(place_mut(&plan, &mut aligned[1..]).is_err());
    }

    fn reduced_pair() -> CompressedDataset {
        let capacity = DatasetCapacity {
            tracks: 2,
            attached: 4,
            unattached: 1,
            reduced: true,
        };
        let mut dataset = CompressedDataset::allocate(capacity, &CompressionSettings::default()).unwrap();
        let mut view = dataset.view_mut();
        view.append_track(TrackFields::default(), &[cluster(100)]).unwrap();
        view.append_track(TrackFields::default(), &[cluster(200)]).unwrap();
        dataset
    }

    fn set_track_clusters(dataset: &mut CompressedDataset, counts: [u16; 2]) {
        let mut view = dataset.view_mut();
        let bytes = view.array_bytes_mut(ArrayId::NTrackClusters).unwrap();
        bytes[0..2].copy_from_slice(&counts[0].to_le_bytes());
        bytes[2..4].copy_from_slice(&counts[1].to_le_bytes());
    }

    #[test]
    fn test_from_flat_rejects_track_clusters_beyond_attached() {
        let mut dataset = reduced_pair();
        assert_eq!(DatasetView::from_flat(dataset.as_flat()).unwrap().counts().attached, 2);

        set_track_clusters(&mut dataset, [1, 2]);
        let err = DatasetView::from_flat(dataset.as_flat()).unwrap_err();
        assert_eq!(err.category(), "corrupted_data");
        assert!(CompressedDataset::from_flat(dataset.as_flat().to_vec()).is_err());

        // unchecked views stay in bounds
        let view = dataset.view();
        assert!(view.track_clusters(0).is_some());
        assert!(view.track_clusters(1).is_none());
    }

    #[test]
    fn test_from_flat_rejects_empty_reduced_track() {
        let mut dataset = reduced_pair();
        set_track_clusters(&mut dataset, [0, 2]);
        let err = DatasetView::from_flat(dataset.as_flat()).unwrap_err();
        assert_eq!(err.category(), "corrupted_data");
        assert!(dataset.view().track_clusters(1).is_none());
    }
}
