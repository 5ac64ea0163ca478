//! End-to-end encode passes on the host-emulated backend.

use hitpack::{compression_kernels, CompressionProcessor, Error};
use hitpack_core::{
    ArrayId, AttachedClusterFields, CompressedDataset, CompressionSettings, DatasetView, InputSizes,
    TrackFields, UnattachedClusterFields, NSLICES, P_MAX_QMAX, P_MAX_QTOT, ROW_COUNT,
};
use hitpack_device::{create_backend, ComputeBackend, DeviceBackendConfig, StreamId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn backend() -> Box<dyn ComputeBackend> {
    init_tracing();
    let config = DeviceBackendConfig {
        num_streams: 2,
        max_memory: 64 << 20,
        ..DeviceBackendConfig::host()
    };
    create_backend(&config, compression_kernels().unwrap()).unwrap()
}

fn sizes() -> InputSizes {
    InputSizes {
        clusters: 6000,
        tracks: 100,
        track_clusters: 4000,
    }
}

fn attached(rng: &mut StdRng) -> AttachedClusterFields {
    AttachedClusterFields {
        q_tot: rng.gen_range(0..P_MAX_QTOT) as u16,
        q_max: rng.gen_range(0..P_MAX_QMAX) as u16,
        flags: rng.gen(),
        row_diff: rng.gen(),
        slice_leg_diff: rng.gen(),
        pad_res: rng.gen(),
        time_res: rng.gen_range(0..1 << 24),
        sigma_pad: rng.gen(),
        sigma_time: rng.gen(),
    }
}

fn unattached(rng: &mut StdRng) -> UnattachedClusterFields {
    UnattachedClusterFields {
        q_tot: rng.gen_range(0..P_MAX_QTOT) as u16,
        q_max: rng.gen_range(0..P_MAX_QMAX) as u16,
        flags: rng.gen(),
        pad_diff: rng.gen(),
        time_diff: rng.gen_range(0..1 << 24),
        sigma_pad: rng.gen(),
        sigma_time: rng.gen(),
    }
}

fn fill(dataset: &mut CompressedDataset, tracks: u32, per_track: usize, loose: u32, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut view = dataset.view_mut();
    for t in 0..tracks {
        let clusters: Vec<_> = (0..per_track).map(|_| attached(&mut rng)).collect();
        let track = TrackFields {
            q_pt: rng.gen(),
            row: (t % ROW_COUNT) as u8,
            slice: (t % NSLICES) as u8,
            time: rng.gen_range(0..1 << 24),
            pad: rng.gen(),
        };
        view.append_track(track, &clusters).unwrap();
    }
    for i in 0..loose {
        view.append_unattached_cluster(i % NSLICES, i % ROW_COUNT, unattached(&mut rng))
            .unwrap();
    }
}

fn processor(settings: CompressionSettings, backend: &mut dyn ComputeBackend) -> CompressionProcessor {
    let mut processor = CompressionProcessor::new(settings).unwrap();
    processor.set_max_data(sizes()).unwrap();
    processor.allocate(backend).unwrap();
    processor
}

#[test]
fn test_device_pass_matches_host_truncation() {
    let mut backend = backend();
    let settings = CompressionSettings::default();
    let mut processor = processor(settings, backend.as_mut());
    let params = *processor.capacity_params().unwrap();

    let mut dataset = CompressedDataset::allocate(params.output_capacity(), &settings).unwrap();
    fill(&mut dataset, 80, 30, 1500, 7);

    let done = processor.encode_pass(backend.as_mut(), &dataset, StreamId(1)).unwrap();
    backend.synchronize_events(&[&done]).unwrap();
    assert!(backend.is_event_done(&[&done]).unwrap());
    let encoded = processor.output_dataset().unwrap();

    let mut expected = dataset.clone();
    let changed = processor.truncate_on_host(&mut expected);
    assert!(changed > 0);
    assert_eq!(encoded.as_flat(), expected.as_flat());

    let report = processor.last_pass().unwrap();
    assert_eq!(report.counts, dataset.counts());
    // eight truncated arrays plus the first-index table
    assert_eq!(report.kernels, 9);
    let first: Vec<u32> = (0..80).map(|t| t * 30).collect();
    assert_eq!(processor.first_index_table(backend.as_mut()).unwrap(), first);
    backend.release_event(done).unwrap();
}

#[test]
fn test_untouched_fields_survive() {
    let mut backend = backend();
    let settings = CompressionSettings::default();
    let mut processor = processor(settings, backend.as_mut());
    let params = *processor.capacity_params().unwrap();

    let mut dataset = CompressedDataset::allocate(params.output_capacity(), &settings).unwrap();
    fill(&mut dataset, 10, 5, 20, 11);

    let done = processor.encode_pass(backend.as_mut(), &dataset, StreamId(0)).unwrap();
    backend.synchronize_events(&[&done]).unwrap();
    let encoded = processor.output_dataset().unwrap();

    for t in 0..10 {
        assert_eq!(encoded.view().track(t), dataset.view().track(t));
        let before = dataset.view().track_clusters(t).unwrap();
        let after = encoded.view().track_clusters(t).unwrap();
        for (b, a) in before.iter().zip(&after) {
            assert_eq!(a.flags, b.flags);
            assert_eq!(a.time_res, b.time_res);
            assert_eq!(a.pad_res, b.pad_res);
            assert!(u32::from(a.q_max) < P_MAX_QMAX);
        }
    }
    for u in 0..20 {
        let before = dataset.view().unattached_cluster(u).unwrap();
        let after = encoded.view().unattached_cluster(u).unwrap();
        assert_eq!(after.time_diff, before.time_diff);
        assert_eq!(after.pad_diff, before.pad_diff);
    }
}

#[test]
fn test_lossless_pass_is_identity() {
    let mut backend = backend();
    let settings = CompressionSettings::lossless();
    let mut processor = processor(settings, backend.as_mut());
    let params = *processor.capacity_params().unwrap();

    let mut dataset = CompressedDataset::allocate(params.output_capacity(), &settings).unwrap();
    fill(&mut dataset, 20, 10, 100, 3);

    let done = processor.encode_pass(backend.as_mut(), &dataset, StreamId::DEFAULT).unwrap();
    assert!(backend.is_event_done(&[&done]).unwrap());
    assert_eq!(processor.last_pass().unwrap().kernels, 1);
    assert_eq!(processor.output_dataset().unwrap().as_flat(), dataset.as_flat());
}

#[test]
fn test_flat_output_reparses() {
    let mut backend = backend();
    let settings = CompressionSettings::default();
    let mut processor = processor(settings, backend.as_mut());
    let params = *processor.capacity_params().unwrap();

    let mut dataset = CompressedDataset::allocate(params.output_capacity(), &settings).unwrap();
    fill(&mut dataset, 5, 4, 9, 5);
    let done = processor.encode_pass(backend.as_mut(), &dataset, StreamId(1)).unwrap();
    backend.synchronize_stream(StreamId(1)).unwrap();
    assert!(backend.is_event_done(&[&done]).unwrap());

    let flat = processor.output_dataset().unwrap().into_flat();
    let view = DatasetView::from_flat(&flat).unwrap();
    assert_eq!(view.counts(), dataset.counts());
    let header = view.header().unwrap();
    assert_eq!(u32::from(header.sig_bits_charge), settings.sig_bits_charge);
    assert_eq!(u32::from(header.sig_bits_width), settings.sig_bits_width);

    let compact = CompressedDataset::from_flat(flat).unwrap().compact().unwrap();
    assert_eq!(compact.counts(), dataset.counts());
    assert!(compact.as_flat().len() < dataset.as_flat().len());
}

#[test]
fn test_dataset_larger_than_capacity_is_sizing_failure() {
    let mut backend = backend();
    let settings = CompressionSettings::default();
    let mut processor = CompressionProcessor::new(settings).unwrap();
    let params = processor
        .set_max_data(InputSizes {
            clusters: 64,
            tracks: 2,
            track_clusters: 8,
        })
        .unwrap();
    processor.allocate(backend.as_mut()).unwrap();

    let mut big = params.output_capacity();
    big.tracks = 4;
    big.attached = 32;
    let mut dataset = CompressedDataset::allocate(big, &settings).unwrap();
    fill(&mut dataset, 3, 4, 0, 9);

    let err = processor
        .encode_pass(backend.as_mut(), &dataset, StreamId(0))
        .unwrap_err();
    assert_eq!(err.category(), "sizing_failure");
    assert!(err.is_recoverable());
    assert!(processor.last_pass().is_none());
}

#[test]
fn test_append_beyond_capacity_fails_closed() {
    let settings = CompressionSettings::default();
    let processor = {
        let mut p = CompressionProcessor::new(settings).unwrap();
        p.set_max_data(InputSizes {
            clusters: 32,
            tracks: 2,
            track_clusters: 6,
        })
        .unwrap();
        p
    };
    let capacity = processor.capacity_params().unwrap().output_capacity();
    let mut dataset = CompressedDataset::allocate(capacity, &settings).unwrap();
    let cluster = AttachedClusterFields::default();
    dataset
        .view_mut()
        .append_track(TrackFields::default(), &[cluster; 4])
        .unwrap();
    let before = dataset.as_flat().to_vec();

    let err = dataset
        .view_mut()
        .append_track(TrackFields::default(), &[cluster; 3])
        .unwrap_err();
    assert_eq!(err.category(), "sizing_failure");
    assert_eq!(dataset.as_flat(), &before[..]);
}

#[test]
fn test_encode_requires_allocation() {
    let mut backend = backend();
    let settings = CompressionSettings::default();
    let mut processor = CompressionProcessor::new(settings).unwrap();
    processor.set_max_data(sizes()).unwrap();
    let capacity = processor.capacity_params().unwrap().output_capacity();
    let dataset = CompressedDataset::allocate(capacity, &settings).unwrap();

    let err = processor
        .encode_pass(backend.as_mut(), &dataset, StreamId(0))
        .unwrap_err();
    assert!(matches!(err, Error::NotReady(_)));
    assert!(processor.output_dataset().is_err());
}

#[test]
fn test_repeated_passes_reuse_buffers() {
    let mut backend = backend();
    let settings = CompressionSettings::default();
    let mut processor = processor(settings, backend.as_mut());
    let capacity = processor.capacity_params().unwrap().output_capacity();
    let live = backend.memory_stats().live_allocations;

    for seed in 0..3 {
        let mut dataset = CompressedDataset::allocate(capacity, &settings).unwrap();
        fill(&mut dataset, 8, 6, 40, seed);
        let done = processor.encode_pass(backend.as_mut(), &dataset, StreamId(0)).unwrap();
        backend.synchronize_events(&[&done]).unwrap();
        backend.release_event(done).unwrap();

        let mut expected = dataset.clone();
        processor.truncate_on_host(&mut expected);
        assert_eq!(processor.output_dataset().unwrap().as_flat(), expected.as_flat());
    }
    assert_eq!(backend.memory_stats().live_allocations, live);
    processor.release(backend.as_mut()).unwrap();
    assert_eq!(backend.memory_stats().live_allocations, 0);
}

#[test]
fn test_inconsistent_track_table_faults_without_leaking_events() {
    init_tracing();
    let config = DeviceBackendConfig {
        num_streams: 2,
        num_events: 1,
        debug_level: 1,
        max_memory: 64 << 20,
        ..DeviceBackendConfig::host()
    };
    let mut backend = create_backend(&config, compression_kernels().unwrap()).unwrap();
    let settings = CompressionSettings::default();
    let mut processor = processor(settings, backend.as_mut());
    let capacity = processor.capacity_params().unwrap().output_capacity();

    let mut dataset = CompressedDataset::allocate(capacity, &settings).unwrap();
    fill(&mut dataset, 3, 2, 4, 21);
    let set_last_track = |dataset: &mut CompressedDataset, n: u16| {
        let mut view = dataset.view_mut();
        let bytes = view.array_bytes_mut(ArrayId::NTrackClusters).unwrap();
        bytes[4..6].copy_from_slice(&n.to_le_bytes());
    };

    set_last_track(&mut dataset, 5);
    for _ in 0..2 {
        let err = processor
            .encode_pass(backend.as_mut(), &dataset, StreamId(1))
            .unwrap_err();
        assert_eq!(err.category(), "kernel_launch");
    }

    set_last_track(&mut dataset, 2);
    let done = processor.encode_pass(backend.as_mut(), &dataset, StreamId(1)).unwrap();
    backend.synchronize_events(&[&done]).unwrap();
    assert_eq!(processor.first_index_table(backend.as_mut()).unwrap(), vec![0, 2, 4]);
    backend.release_event(done).unwrap();
}

#[test]
fn test_faulted_pass_never_returns_previous_output() {
    let mut backend = backend();
    let settings = CompressionSettings::default();
    let mut processor = processor(settings, backend.as_mut());
    let capacity = processor.capacity_params().unwrap().output_capacity();

    let mut first = CompressedDataset::allocate(capacity, &settings).unwrap();
    fill(&mut first, 3, 2, 4, 31);
    let done = processor.encode_pass(backend.as_mut(), &first, StreamId(1)).unwrap();
    backend.synchronize_events(&[&done]).unwrap();
    backend.release_event(done).unwrap();
    let mut expected = first.clone();
    processor.truncate_on_host(&mut expected);
    assert_eq!(processor.output_dataset().unwrap().as_flat(), expected.as_flat());

    // third track claims more clusters than the dataset stores
    let mut second = CompressedDataset::allocate(capacity, &settings).unwrap();
    fill(&mut second, 3, 2, 4, 32);
    second
        .view_mut()
        .array_bytes_mut(ArrayId::NTrackClusters)
        .unwrap()[4..6]
        .copy_from_slice(&5u16.to_le_bytes());

    let done = processor.encode_pass(backend.as_mut(), &second, StreamId(1)).unwrap();
    let err = backend.synchronize_events(&[&done]).unwrap_err();
    assert_eq!(err.category(), "kernel_launch");
    assert_eq!(backend.is_event_done(&[&done]).unwrap_err().category(), "kernel_launch");
    assert_eq!(processor.output_dataset().unwrap_err().category(), "corrupted_data");

    // taking the fault leaves the stream usable for the next pass
    assert!(backend.synchronize_stream(StreamId(1)).is_err());
    backend.release_event(done).unwrap();
    second
        .view_mut()
        .array_bytes_mut(ArrayId::NTrackClusters)
        .unwrap()[4..6]
        .copy_from_slice(&2u16.to_le_bytes());
    let done = processor.encode_pass(backend.as_mut(), &second, StreamId(1)).unwrap();
    backend.synchronize_events(&[&done]).unwrap();
    let mut expected = second.clone();
    processor.truncate_on_host(&mut expected);
    assert_eq!(processor.output_dataset().unwrap().as_flat(), expected.as_flat());
    backend.release_event(done).unwrap();
}
