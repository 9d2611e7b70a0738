//! Integration tests for the row cache service.
//!
//! Exercises the build/fetch lifecycle end to end: ingestion, phase
//! transitions, schema caching, miss reporting, and batch fetch through the
//! worker queues.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use bytes::BytesMut;
use protocol_rowcache::{BatchDescriptor, RowHeader};
use row_store::DataLocator;
use server::buffer::FetchBuffer;
use server::config::Config;
use server::error::CacheError;
use server::layout;
use server::service::CacheService;
use server::state::ServiceState;

/// A small two-queue service instance.
fn service(generate_id: bool) -> CacheService {
    let mut config = Config::default();
    config.service.memory_size_mb = 16;
    config.service.generate_id = generate_id;
    config.workers.queues = Some(2);
    config.workers.slots_per_queue = 16;
    config.workers.numa_affinity = false;
    CacheService::new(&config).expect("service start")
}

/// Deterministic row content.
fn payload(len: usize, seed: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_add(seed) % 251) as u8).collect()
}

/// A contiguous row for the fast path on explicit-id services: header
/// declaring one column, followed by that column's payload.
fn contiguous_row(row_id: i64, payload_len: usize) -> Vec<u8> {
    let header = RowHeader {
        row_id,
        column_sizes: vec![payload_len as u64],
    };
    let mut buf = BytesMut::with_capacity(header.encoded_len() + payload_len);
    header.encode(&mut buf);
    buf.extend_from_slice(&payload(payload_len, row_id as usize));
    buf.to_vec()
}

#[test]
fn test_generated_ids_strictly_increasing() {
    let service = service(true);
    let mut previous = -1;
    for seed in 0..20 {
        let id = service.fast_cache_row(&payload(64, seed)).unwrap();
        assert!(id > previous, "id {id} not greater than {previous}");
        previous = id;
    }
}

#[test]
fn test_multipart_cache_row_roundtrip() {
    let service = service(false);

    let header = RowHeader {
        row_id: 11,
        column_sizes: vec![5, 7],
    };
    let mut header_buf = BytesMut::new();
    header.encode(&mut header_buf);
    let col_a = payload(5, 1);
    let col_b = payload(7, 2);

    let id = service
        .cache_row(&[&header_buf, &col_a, &col_b])
        .unwrap();
    assert_eq!(id, 11);

    let descriptor = service.pre_batch_fetch(1, &[11]).unwrap();
    let row_size = descriptor.rows[0].size as usize;
    assert_eq!(row_size, header_buf.len() + 12);

    let offsets = layout::offset_table(&[row_size as u64]);
    let out = FetchBuffer::new(layout::required_size(&offsets));
    service.batch_fetch(&descriptor, &out).unwrap();

    let start = offsets[0] as usize;
    let mut expected = header_buf.to_vec();
    expected.extend_from_slice(&col_a);
    expected.extend_from_slice(&col_b);
    assert_eq!(&out.as_slice()[start..start + row_size], &expected[..]);
}

#[test]
fn test_multipart_part_count_mismatch() {
    let service = service(false);

    let header = RowHeader {
        row_id: 0,
        column_sizes: vec![4, 4],
    };
    let mut header_buf = BytesMut::new();
    header.encode(&mut header_buf);

    let only_column = payload(4, 0);
    let err = service.cache_row(&[&header_buf, &only_column]).unwrap_err();
    assert!(matches!(err, CacheError::SizeMismatch(_)));
}

#[test]
fn test_multipart_declared_size_mismatch() {
    let service = service(false);

    let header = RowHeader {
        row_id: 0,
        column_sizes: vec![4],
    };
    let mut header_buf = BytesMut::new();
    header.encode(&mut header_buf);

    let wrong = payload(6, 0);
    let err = service.cache_row(&[&header_buf, &wrong]).unwrap_err();
    assert!(matches!(err, CacheError::SizeMismatch(_)));
}

#[test]
fn test_negative_client_row_id_rejected() {
    let service = service(false);
    let err = service
        .fast_cache_row(&contiguous_row(-3, 8))
        .unwrap_err();
    assert!(matches!(err, CacheError::Unexpected(_)));
}

#[test]
fn test_writes_rejected_after_build_phase_done() {
    let service = service(true);
    service.fast_cache_row(&payload(32, 0)).unwrap();

    service.build_phase_done().unwrap();
    assert_eq!(service.state(), ServiceState::FetchPhase);

    let err = service.fast_cache_row(&payload(32, 1)).unwrap_err();
    assert!(matches!(err, CacheError::InvalidState(_)));

    let header = RowHeader {
        row_id: 0,
        column_sizes: vec![4],
    };
    let mut header_buf = BytesMut::new();
    header.encode(&mut header_buf);
    let col = payload(4, 0);
    let err = service.cache_row(&[&header_buf, &col]).unwrap_err();
    assert!(matches!(err, CacheError::InvalidState(_)));
}

#[test]
fn test_batch_fetch_rejected_in_build_phase() {
    let service = service(true);
    service.fast_cache_row(&payload(32, 0)).unwrap();

    let descriptor = service.pre_batch_fetch(1, &[0]).unwrap();
    let out = FetchBuffer::new(64 * 1024);
    let err = service.batch_fetch(&descriptor, &out).unwrap_err();
    assert!(matches!(err, CacheError::InvalidState(_)));
}

#[test]
fn test_build_phase_done_requires_build_phase() {
    let service = service(false);
    let err = service.build_phase_done().unwrap_err();
    assert!(matches!(err, CacheError::InvalidState(_)));
}

#[test]
fn test_toggle_write_mode() {
    let service = service(false);
    service.fast_cache_row(&contiguous_row(0, 16)).unwrap();

    service.toggle_write_mode(false).unwrap();
    assert_eq!(service.state(), ServiceState::NoLocking);
    assert_eq!(
        service.fast_cache_row(&contiguous_row(1, 16)).unwrap_err(),
        CacheError::OutOfMemory
    );

    service.toggle_write_mode(true).unwrap();
    assert_eq!(service.state(), ServiceState::None);
    service.fast_cache_row(&contiguous_row(1, 16)).unwrap();
}

#[test]
fn test_toggle_write_mode_rejected_with_build_phase() {
    let service = service(true);
    let err = service.toggle_write_mode(false).unwrap_err();
    assert!(matches!(err, CacheError::InvalidState(_)));
}

#[test]
fn test_schema_first_writer_wins() {
    let service = service(false);

    assert!(matches!(
        service.fetch_schema().unwrap_err(),
        CacheError::NotFound(_)
    ));

    service.cache_schema(b"alpha").unwrap();
    service.cache_schema(b"beta").unwrap();
    assert_eq!(service.fetch_schema().unwrap().as_ref(), b"alpha");
}

#[test]
fn test_schema_fetch_blocked_in_build_phase() {
    let service = service(true);
    service.cache_schema(b"alpha").unwrap();

    assert!(matches!(
        service.fetch_schema().unwrap_err(),
        CacheError::InvalidState(_)
    ));

    service.build_phase_done().unwrap();
    assert_eq!(service.fetch_schema().unwrap().as_ref(), b"alpha");
}

#[test]
fn test_find_keys_miss_memoized() {
    let service = service(false);
    for id in [0i64, 1, 2, 5, 7] {
        service.fast_cache_row(&contiguous_row(id, 8)).unwrap();
    }

    let mut first = Vec::new();
    service.find_keys_miss(&mut first);
    assert_eq!(first, vec![0, 7, 3, 4, 6]);

    // Later inserts don't change the memoized report.
    service.fast_cache_row(&contiguous_row(3, 8)).unwrap();
    let mut second = Vec::new();
    service.find_keys_miss(&mut second);
    assert_eq!(second, first);
}

#[test]
fn test_batch_fetch_roundtrip_with_zero_size_row() {
    let service = service(true);
    let sizes = [100usize, 0, 4096, 1, 5000];
    for (seed, &size) in sizes.iter().enumerate() {
        service.fast_cache_row(&payload(size, seed)).unwrap();
    }
    service.build_phase_done().unwrap();

    let descriptor = service.pre_batch_fetch(7, &[0, 1, 2, 3, 4]).unwrap();
    assert_eq!(descriptor.connection_id, 7);
    let reported: Vec<u64> = descriptor.rows.iter().map(|r| r.size).collect();
    assert_eq!(reported, vec![100, 0, 4096, 1, 5000]);

    let table_len = 6 * 8;
    let expected_total = table_len + 4096 + 0 + 4096 + 4096 + 8192;
    let offsets = layout::offset_table(&reported);
    assert_eq!(layout::required_size(&offsets), expected_total);

    let out = FetchBuffer::new(expected_total);
    service.batch_fetch(&descriptor, &out).unwrap();

    let table = out.offset_table(5).unwrap();
    assert_eq!(table[0], table_len as i64);
    for (i, &size) in sizes.iter().enumerate() {
        assert_eq!(
            table[i + 1] - table[i],
            layout::round_up_4k(size as u64) as i64
        );
    }
    // The zero-size row advances the offset by nothing.
    assert_eq!(table[2], table[1]);

    for (i, &size) in sizes.iter().enumerate() {
        let start = table[i] as usize;
        assert_eq!(
            &out.as_slice()[start..start + size],
            &payload(size, i)[..],
            "row {i} content mismatch"
        );
    }
}

#[test]
fn test_batch_fetch_missing_key_reports_length_error() {
    let service = service(false);
    service.fast_cache_row(&contiguous_row(0, 44)).unwrap();

    let good = service.pre_batch_fetch(1, &[0]).unwrap().rows[0];
    // A stale descriptor naming a key that was never cached.
    let descriptor = BatchDescriptor {
        connection_id: 1,
        rows: vec![
            good,
            DataLocator {
                key: 999,
                node_id: 0,
                size: 32,
                source: None,
            },
        ],
    };

    let sizes: Vec<u64> = descriptor.rows.iter().map(|r| r.size).collect();
    let offsets = layout::offset_table(&sizes);
    let out = FetchBuffer::new(layout::required_size(&offsets));

    let err = service.batch_fetch(&descriptor, &out).unwrap_err();
    assert!(matches!(err, CacheError::SizeMismatch(_)));

    // The good row's region is intact despite the failed sub-request.
    let start = offsets[0] as usize;
    let expected = contiguous_row(0, 44);
    assert_eq!(good.size as usize, expected.len());
    assert_eq!(&out.as_slice()[start..start + expected.len()], &expected[..]);
}

#[test]
fn test_batch_fetch_buffer_too_small() {
    let service = service(true);
    service.fast_cache_row(&payload(128, 0)).unwrap();
    service.build_phase_done().unwrap();

    let descriptor = service.pre_batch_fetch(1, &[0]).unwrap();
    let out = FetchBuffer::new(64);
    let err = service.batch_fetch(&descriptor, &out).unwrap_err();
    assert!(matches!(err, CacheError::SizeMismatch(_)));
}

#[test]
fn test_duplicate_explicit_id_is_idempotent() {
    let service = service(false);

    let first = contiguous_row(5, 24);
    let id = service.fast_cache_row(&first).unwrap();
    assert_eq!(id, 5);

    // Same id, different content: succeeds, first content wins.
    let mut second = contiguous_row(5, 24);
    let len = second.len();
    second[len - 1] ^= 0xff;
    assert_eq!(service.fast_cache_row(&second).unwrap(), 5);

    let descriptor = service.pre_batch_fetch(1, &[5]).unwrap();
    let size = descriptor.rows[0].size as usize;
    assert_eq!(size, first.len());
    let offsets = layout::offset_table(&[size as u64]);
    let out = FetchBuffer::new(layout::required_size(&offsets));
    service.batch_fetch(&descriptor, &out).unwrap();

    let start = offsets[0] as usize;
    assert_eq!(&out.as_slice()[start..start + size], &first[..]);
}

#[test]
fn test_concurrent_ingestion() {
    let service = Arc::new(service(true));
    let threads = 4;
    let rows_per_thread = 50;

    let mut handles = Vec::new();
    for t in 0..threads {
        let service = Arc::clone(&service);
        handles.push(thread::spawn(move || {
            let mut ids = Vec::with_capacity(rows_per_thread);
            for r in 0..rows_per_thread {
                let id = service
                    .fast_cache_row(&payload(64, t * rows_per_thread + r))
                    .expect("ingestion");
                ids.push(id);
            }
            ids
        }));
    }

    let mut all_ids = HashSet::new();
    for handle in handles {
        for id in handle.join().expect("thread") {
            assert!(all_ids.insert(id), "duplicate generated id {id}");
        }
    }
    assert_eq!(all_ids.len(), threads * rows_per_thread);

    let stat = service.get_stat();
    assert_eq!(stat.state, ServiceState::BuildPhase);
    assert_eq!(
        stat.stat.num_mem_cached + stat.stat.num_disk_cached,
        (threads * rows_per_thread) as u64
    );
    assert_eq!(stat.stat.min_key, 0);
    assert_eq!(stat.stat.max_key, (threads * rows_per_thread - 1) as i64);
}

#[test]
fn test_get_stat_reports_state_and_key_range() {
    let service = service(false);
    for id in [2i64, 4, 9] {
        service.fast_cache_row(&contiguous_row(id, 8)).unwrap();
    }

    let stat = service.get_stat();
    assert_eq!(stat.state, ServiceState::None);
    assert_eq!(stat.stat.min_key, 2);
    assert_eq!(stat.stat.max_key, 9);
    assert!(stat.stat.memory_usage > 0);
}
