//! Structure-of-arrays layout of a compressed cluster dataset.
//!
//! A sizing pass turns capacity parameters into a [`LayoutPlan`]: a set of
//! named, aligned byte spans inside one contiguous region. Planning never
//! touches memory, and the same parameters and base address always yield
//! the same plan.
//!
//! ```text
//! output region
//! ┌────────┬──────────────────────┬──────────────┬─────────────────────┬────────────┐
//! │ header │ unattached (7 arrays)│ slice/row    │ attached (9 arrays) │ tracks (6) │
//! │ 64 B   │ nClU each            │ 36 * 152     │ nClA / nClAreduced  │ nTr each   │
//! └────────┴──────────────────────┴──────────────┴─────────────────────┴────────────┘
//! every array start aligned to BUFFER_ALIGNMENT
//! ```

use crate::constants::{
    BUFFER_ALIGNMENT, CLUSTER_COUNT_ROUNDING, CLUSTER_FACTOR_THRESHOLD, NSLICES, ROW_COUNT,
};
use crate::error::{Error, Result};
use crate::settings::CompressionSettings;
use serde::{Deserialize, Serialize};

/// Size of the self-describing header in front of every output region.
pub const HEADER_SIZE: usize = 64;

/// Number of per-slice-row cluster counters.
pub const SLICE_ROW_COUNT: u32 = NSLICES * ROW_COUNT;

/// Destination of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationPhase {
    /// Device-resident working space, released after the encode step.
    Scratch,
    /// Device-resident encode destination.
    DeviceOutput,
    /// Final host-resident destination.
    HostOutput,
}

/// How many elements an array holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extent {
    Unattached,
    SliceRows,
    Attached,
    AttachedResidual,
    Tracks,
    MaxClusters,
    MaxTracks,
}

/// Every array a dataset region can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ArrayId {
    QTotU,
    QMaxU,
    FlagsU,
    PadDiffU,
    TimeDiffU,
    SigmaPadU,
    SigmaTimeU,
    NSliceRowClusters,
    QTotA,
    QMaxA,
    FlagsA,
    RowDiffA,
    SliceLegDiffA,
    PadResA,
    TimeResA,
    SigmaPadA,
    SigmaTimeA,
    QPtA,
    RowA,
    SliceA,
    TimeA,
    PadA,
    NTrackClusters,
    ClusterStatus,
    AttachedClusterFirstIndex,
}

impl ArrayId {
    /// Number of array identifiers.
    pub const COUNT: usize = 25;

    /// Arrays of a dataset, in placement order.
    pub const DATASET: [ArrayId; 23] = [
        ArrayId::QTotU,
        ArrayId::QMaxU,
        ArrayId::FlagsU,
        ArrayId::PadDiffU,
        ArrayId::TimeDiffU,
        ArrayId::SigmaPadU,
        ArrayId::SigmaTimeU,
        ArrayId::NSliceRowClusters,
        ArrayId::QTotA,
        ArrayId::QMaxA,
        ArrayId::FlagsA,
        ArrayId::RowDiffA,
        ArrayId::SliceLegDiffA,
        ArrayId::PadResA,
        ArrayId::TimeResA,
        ArrayId::SigmaPadA,
        ArrayId::SigmaTimeA,
        ArrayId::QPtA,
        ArrayId::RowA,
        ArrayId::SliceA,
        ArrayId::TimeA,
        ArrayId::PadA,
        ArrayId::NTrackClusters,
    ];

    /// Element width in bytes.
    pub const fn elem_size(self) -> usize {
        match self {
            ArrayId::QTotU | ArrayId::QMaxU | ArrayId::PadDiffU => 2,
            ArrayId::TimeDiffU => 4,
            ArrayId::FlagsU | ArrayId::SigmaPadU | ArrayId::SigmaTimeU => 1,
            ArrayId::NSliceRowClusters => 4,
            ArrayId::QTotA | ArrayId::QMaxA | ArrayId::PadResA => 2,
            ArrayId::TimeResA => 4,
            ArrayId::FlagsA
            | ArrayId::RowDiffA
            | ArrayId::SliceLegDiffA
            | ArrayId::SigmaPadA
            | ArrayId::SigmaTimeA => 1,
            ArrayId::QPtA | ArrayId::RowA | ArrayId::SliceA => 1,
            ArrayId::TimeA => 4,
            ArrayId::PadA | ArrayId::NTrackClusters => 2,
            ArrayId::ClusterStatus => 1,
            ArrayId::AttachedClusterFirstIndex => 4,
        }
    }

    /// Array name, as used in diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            ArrayId::QTotU => "qTotU",
            ArrayId::QMaxU => "qMaxU",
            ArrayId::FlagsU => "flagsU",
            ArrayId::PadDiffU => "padDiffU",
            ArrayId::TimeDiffU => "timeDiffU",
            ArrayId::SigmaPadU => "sigmaPadU",
            ArrayId::SigmaTimeU => "sigmaTimeU",
            ArrayId::NSliceRowClusters => "nSliceRowClusters",
            ArrayId::QTotA => "qTotA",
            ArrayId::QMaxA => "qMaxA",
            ArrayId::FlagsA => "flagsA",
            ArrayId::RowDiffA => "rowDiffA",
            ArrayId::SliceLegDiffA => "sliceLegDiffA",
            ArrayId::PadResA => "padResA",
            ArrayId::TimeResA => "timeResA",
            ArrayId::SigmaPadA => "sigmaPadA",
            ArrayId::SigmaTimeA => "sigmaTimeA",
            ArrayId::QPtA => "qPtA",
            ArrayId::RowA => "rowA",
            ArrayId::SliceA => "sliceA",
            ArrayId::TimeA => "timeA",
            ArrayId::PadA => "padA",
            ArrayId::NTrackClusters => "nTrackClusters",
            ArrayId::ClusterStatus => "clusterStatus",
            ArrayId::AttachedClusterFirstIndex => "attachedClusterFirstIndex",
        }
    }

    fn extent(self) -> Extent {
        match self {
            ArrayId::QTotU
            | ArrayId::QMaxU
            | ArrayId::FlagsU
            | ArrayId::PadDiffU
            | ArrayId::TimeDiffU
            | ArrayId::SigmaPadU
            | ArrayId::SigmaTimeU => Extent::Unattached,
            ArrayId::NSliceRowClusters => Extent::SliceRows,
            ArrayId::QTotA
            | ArrayId::QMaxA
            | ArrayId::FlagsA
            | ArrayId::SigmaPadA
            | ArrayId::SigmaTimeA => Extent::Attached,
            ArrayId::RowDiffA | ArrayId::SliceLegDiffA | ArrayId::PadResA | ArrayId::TimeResA => {
                Extent::AttachedResidual
            }
            ArrayId::QPtA
            | ArrayId::RowA
            | ArrayId::SliceA
            | ArrayId::TimeA
            | ArrayId::PadA
            | ArrayId::NTrackClusters => Extent::Tracks,
            ArrayId::ClusterStatus => Extent::MaxClusters,
            ArrayId::AttachedClusterFirstIndex => Extent::MaxTracks,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Element counts of each array group in a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatasetCapacity {
    /// Track records.
    pub tracks: u32,
    /// Attached cluster records.
    pub attached: u32,
    /// Unattached cluster records.
    pub unattached: u32,
    /// Residual fields omitted for the first cluster of each track.
    pub reduced: bool,
}

impl DatasetCapacity {
    /// Capacity that holds exactly the given counts.
    pub fn from_counts(counts: Counts, reduced: bool) -> Self {
        DatasetCapacity {
            tracks: counts.tracks,
            attached: counts.attached,
            unattached: counts.unattached,
            reduced,
        }
    }

    /// Elements in the attached residual arrays.
    pub fn residual_attached(&self) -> Result<u32> {
        if !self.reduced {
            return Ok(self.attached);
        }
        self.attached
            .checked_sub(self.tracks)
            .ok_or_else(|| Error::sizing("attached clusters", u64::from(self.tracks), u64::from(self.attached)))
    }

    /// Check that `counts` fits this capacity.
    pub fn check(&self, counts: &Counts) -> Result<()> {
        if counts.tracks > self.tracks {
            return Err(Error::sizing("tracks", counts.tracks.into(), self.tracks.into()));
        }
        if counts.attached > self.attached {
            return Err(Error::sizing("attached clusters", counts.attached.into(), self.attached.into()));
        }
        if counts.unattached > self.unattached {
            return Err(Error::sizing(
                "unattached clusters",
                counts.unattached.into(),
                self.unattached.into(),
            ));
        }
        if self.reduced {
            let needed = counts.residual_attached(true)?;
            let cap = self.residual_attached()?;
            if needed > cap {
                return Err(Error::sizing("attached residuals", needed.into(), cap.into()));
            }
        }
        Ok(())
    }
}

/// Stored record counts of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Counts {
    /// `nStoredTracks`.
    pub tracks: u32,
    /// `nStoredAttachedClusters`.
    pub attached: u32,
    /// `nStoredUnattachedClusters`.
    pub unattached: u32,
}

impl Counts {
    /// Residual entries in use for these counts.
    pub fn residual_attached(&self, reduced: bool) -> Result<u32> {
        if !reduced {
            return Ok(self.attached);
        }
        self.attached
            .checked_sub(self.tracks)
            .ok_or_else(|| Error::InvalidRecord(format!(
                "{} tracks but only {} attached clusters in reduced mode",
                self.tracks, self.attached
            )))
    }
}

/// Event sizes the capacities are derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InputSizes {
    /// Total number of clusters in the event.
    pub clusters: u32,
    /// Number of tracks produced by the merger.
    pub tracks: u32,
    /// Number of clusters attached to those tracks.
    pub track_clusters: u32,
}

/// Capacity parameters fixed at allocation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapacityParams {
    pub max_tracks: u32,
    pub max_clusters: u32,
    pub max_track_clusters: u32,
    pub max_clusters_in_cache: u32,
    pub cluster_factor_base1024: u32,
    pub reduced_attached: bool,
}

impl CapacityParams {
    /// Derive capacities from event sizes.
    pub fn from_input(input: InputSizes, settings: &CompressionSettings) -> Result<Self> {
        let factor = if input.clusters > CLUSTER_FACTOR_THRESHOLD {
            settings.unattached_factor_base1024
        } else {
            1024
        };
        let in_cache = u64::from(input.clusters) * u64::from(factor) / 1024;
        let max_clusters_in_cache = u32::try_from(in_cache)
            .map_err(|_| Error::sizing("cluster cache", in_cache, u64::from(u32::MAX)))?;

        let mut max_clusters = input.clusters;
        let rem = max_clusters % CLUSTER_COUNT_ROUNDING;
        if rem != 0 {
            max_clusters = max_clusters
                .checked_add(CLUSTER_COUNT_ROUNDING - rem)
                .ok_or_else(|| Error::sizing("clusters", u64::from(input.clusters), u64::from(u32::MAX)))?;
        }

        Ok(CapacityParams {
            max_tracks: input.tracks,
            max_clusters,
            max_track_clusters: input.track_clusters,
            max_clusters_in_cache,
            cluster_factor_base1024: factor,
            reduced_attached: settings.reduced_attached,
        })
    }

    /// Capacity of the scratch arrays (always full residual storage).
    pub fn scratch_capacity(&self) -> DatasetCapacity {
        DatasetCapacity {
            tracks: self.max_tracks,
            attached: self.max_track_clusters,
            unattached: self.max_clusters_in_cache,
            reduced: false,
        }
    }

    /// Capacity of the output datasets.
    pub fn output_capacity(&self) -> DatasetCapacity {
        DatasetCapacity {
            reduced: self.reduced_attached,
            ..self.scratch_capacity()
        }
    }
}

/// One array inside a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArraySpan {
    /// Byte offset from the start of the region.
    pub offset: usize,
    /// Number of elements.
    pub len: u32,
    /// Element width in bytes.
    pub elem_size: usize,
}

impl ArraySpan {
    /// Size in bytes.
    pub fn byte_len(&self) -> usize {
        self.len as usize * self.elem_size
    }

    /// Offset one past the last byte.
    pub fn end(&self) -> usize {
        self.offset + self.byte_len()
    }

    /// Byte range within the region.
    pub fn range(&self) -> core::ops::Range<usize> {
        self.offset..self.end()
    }
}

/// Result of a sizing pass: where every array lives inside one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutPlan {
    phase: AllocationPhase,
    base: usize,
    capacity: DatasetCapacity,
    header: bool,
    spans: Vec<Option<ArraySpan>>,
    total_size: usize,
}

/// Aligning bump cursor used by the sizing pass.
struct Cursor {
    base: usize,
    pos: usize,
    spans: Vec<Option<ArraySpan>>,
}

impl Cursor {
    fn new(base: usize) -> Self {
        Cursor {
            base,
            pos: 0,
            spans: vec![None; ArrayId::COUNT],
        }
    }

    fn reserve(&mut self, bytes: usize) -> Result<()> {
        self.pos = self
            .pos
            .checked_add(bytes)
            .ok_or_else(|| Error::sizing("region", bytes as u64, usize::MAX as u64))?;
        Ok(())
    }

    fn push(&mut self, id: ArrayId, len: u32) -> Result<()> {
        let overflow = || Error::sizing(id.name(), u64::from(len), usize::MAX as u64);
        let absolute = self.base.checked_add(self.pos).ok_or_else(overflow)?;
        let aligned = absolute
            .checked_next_multiple_of(BUFFER_ALIGNMENT)
            .ok_or_else(overflow)?;
        let offset = aligned - self.base;
        let bytes = (len as usize).checked_mul(id.elem_size()).ok_or_else(overflow)?;
        self.pos = offset.checked_add(bytes).ok_or_else(overflow)?;
        // the whole region must stay addressable from its base
        self.base.checked_add(self.pos).ok_or_else(overflow)?;
        self.spans[id.index()] = Some(ArraySpan {
            offset,
            len,
            elem_size: id.elem_size(),
        });
        Ok(())
    }

    fn push_dataset(&mut self, capacity: &DatasetCapacity) -> Result<()> {
        let residual = capacity.residual_attached()?;
        for id in ArrayId::DATASET {
            let len = match id.extent() {
                Extent::Unattached => capacity.unattached,
                Extent::SliceRows => SLICE_ROW_COUNT,
                Extent::Attached => capacity.attached,
                Extent::AttachedResidual => residual,
                Extent::Tracks => capacity.tracks,
                Extent::MaxClusters | Extent::MaxTracks => continue,
            };
            self.push(id, len)?;
        }
        Ok(())
    }
}

impl LayoutPlan {
    /// Plan the scratch region: cluster status, full-size arrays, first-index table.
    pub fn scratch(params: &CapacityParams, base: usize) -> Result<Self> {
        let capacity = params.scratch_capacity();
        let mut cursor = Cursor::new(base);
        cursor.push(ArrayId::ClusterStatus, params.max_clusters)?;
        cursor.push_dataset(&capacity)?;
        cursor.push(ArrayId::AttachedClusterFirstIndex, params.max_tracks)?;
        Ok(Self::finish(AllocationPhase::Scratch, cursor, capacity, false))
    }

    /// Plan the device-resident output region.
    pub fn device_output(capacity: DatasetCapacity, base: usize) -> Result<Self> {
        Self::output(AllocationPhase::DeviceOutput, capacity, base)
    }

    /// Plan the host-resident output region.
    ///
    /// Uses the same arrangement as the device output, so one copy moves a
    /// device dataset into a host dataset of equal capacity.
    pub fn host_output(capacity: DatasetCapacity, base: usize) -> Result<Self> {
        Self::output(AllocationPhase::HostOutput, capacity, base)
    }

    fn output(phase: AllocationPhase, capacity: DatasetCapacity, base: usize) -> Result<Self> {
        let mut cursor = Cursor::new(base);
        cursor.reserve(HEADER_SIZE)?;
        cursor.push_dataset(&capacity)?;
        Ok(Self::finish(phase, cursor, capacity, true))
    }

    fn finish(phase: AllocationPhase, cursor: Cursor, capacity: DatasetCapacity, header: bool) -> Self {
        LayoutPlan {
            phase,
            base: cursor.base,
            capacity,
            header,
            spans: cursor.spans,
            total_size: cursor.pos,
        }
    }

    /// Destination this plan was sized for.
    pub fn phase(&self) -> AllocationPhase {
        self.phase
    }

    /// Base address the alignment was computed against.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Capacity of the dataset arrays.
    pub fn capacity(&self) -> DatasetCapacity {
        self.capacity
    }

    /// Whether the region starts with a dataset header.
    pub fn has_header(&self) -> bool {
        self.header
    }

    /// Bytes the region must provide.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Span of `id`, if this plan contains it.
    pub fn span(&self, id: ArrayId) -> Option<ArraySpan> {
        self.spans[id.index()]
    }

    /// All spans in placement order.
    pub fn spans(&self) -> impl Iterator<Item = (ArrayId, ArraySpan)> + '_ {
        let mut entries: Vec<(ArrayId, ArraySpan)> = [ArrayId::ClusterStatus]
            .into_iter()
            .chain(ArrayId::DATASET)
            .chain([ArrayId::AttachedClusterFirstIndex])
            .filter_map(|id| self.span(id).map(|s| (id, s)))
            .collect();
        entries.sort_by_key(|(_, s)| s.offset);
        entries.into_iter()
    }

    /// Check that a region of `len` bytes can hold this plan.
    pub fn check_region(&self, len: usize) -> Result<()> {
        if len < self.total_size {
            return Err(Error::sizing("region", len as u64, self.total_size as u64));
        }
        Ok(())
    }
}
