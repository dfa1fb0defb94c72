use std::sync::Arc;

use qring::{BufferConfig, Error, MessageBuffer};
use tempfile::tempdir;

fn small_config() -> BufferConfig {
    BufferConfig {
        segment_length: 4096,
        max_payload_size: 1024,
        auto_sync_interval: None,
        ..BufferConfig::default()
    }
}

#[test]
fn ten_appends_yield_monotonic_ids() {
    let dir = tempdir().expect("tempdir");
    let buffer = MessageBuffer::open(dir.path(), small_config()).expect("open");

    let mut ids = Vec::new();
    for i in 0..10 {
        let id = buffer
            .append(1000 + i, "", &[0x41; 10])
            .expect("append");
        ids.push(id);
    }
    assert_eq!(buffer.message_count().expect("count"), 10);

    let mut cursor = buffer.cursor(0).expect("cursor");
    let mut seen = Vec::new();
    while cursor.next().expect("next") {
        seen.push(cursor.id().expect("id"));
    }
    assert_eq!(seen, ids);
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn records_round_trip_in_order() {
    let dir = tempdir().expect("tempdir");
    let buffer = MessageBuffer::open(dir.path(), small_config()).expect("open");

    let messages: Vec<(i64, String, Vec<u8>)> = (0..20)
        .map(|i| {
            (
                2000 + i as i64,
                format!("topic-{}", i % 3),
                vec![i as u8; 16 + i],
            )
        })
        .collect();
    for (ts, key, payload) in &messages {
        buffer.append(*ts, key, payload).expect("append");
    }

    let mut cursor = buffer.cursor(0).expect("cursor");
    for (ts, key, payload) in &messages {
        assert!(cursor.next().expect("next"));
        assert_eq!(cursor.timestamp().expect("ts"), *ts);
        assert_eq!(cursor.routing_key().expect("key"), key);
        assert_eq!(cursor.payload().expect("payload"), payload.as_slice());
        assert_eq!(cursor.payload_size().expect("size"), payload.len());
    }
    assert!(!cursor.next().expect("next"));
}

#[test]
fn oversize_payload_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let buffer = MessageBuffer::open(dir.path(), small_config()).expect("open");
    let err = buffer.append(1, "", &[0u8; 2048]).expect_err("oversize");
    assert!(matches!(err, Error::Oversize { size: 2048, max: 1024 }));
}

#[test]
fn cursor_past_end_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let buffer = MessageBuffer::open(dir.path(), small_config()).expect("open");
    buffer.append(1, "", b"x").expect("append");
    let next = buffer.next_message_id().expect("next id");
    assert!(buffer.cursor(next).is_ok());
    assert!(matches!(
        buffer.cursor(next + 1),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn first_message_id_is_settable_only_while_empty() {
    let dir = tempdir().expect("tempdir");
    let buffer = MessageBuffer::open(dir.path(), small_config()).expect("open");
    buffer.set_first_message_id(5000).expect("set");
    assert_eq!(buffer.first_message_id().expect("first"), 5000);

    let id = buffer.append(1, "", b"x").expect("append");
    assert_eq!(id, 5000);
    assert!(matches!(
        buffer.set_first_message_id(0),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn closed_buffer_rejects_operations() {
    let dir = tempdir().expect("tempdir");
    let buffer = MessageBuffer::open(dir.path(), small_config()).expect("open");
    buffer.append(1, "", b"x").expect("append");
    assert!(buffer.is_open());
    buffer.close().expect("close");
    assert!(!buffer.is_open());
    // Closing again is benign.
    buffer.close().expect("close twice");
    assert!(matches!(buffer.append(2, "", b"y"), Err(Error::Closed)));
    assert!(matches!(buffer.cursor(0), Err(Error::Closed)));
    assert!(matches!(buffer.sync(), Err(Error::Closed)));
}

#[test]
fn append_now_uses_the_clock() {
    let dir = tempdir().expect("tempdir");
    let buffer = MessageBuffer::open(dir.path(), small_config()).expect("open");
    let before = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("epoch")
        .as_millis() as i64;
    buffer.append_now("clocked", b"x").expect("append");
    let mut cursor = buffer.cursor(0).expect("cursor");
    assert!(cursor.next().expect("next"));
    assert!(cursor.timestamp().expect("ts") >= before);
}

#[test]
fn buffer_is_shareable_across_threads() {
    let dir = tempdir().expect("tempdir");
    let buffer = MessageBuffer::open(dir.path(), small_config()).expect("open");

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                let mut ids = Vec::new();
                for i in 0..25 {
                    let id = buffer
                        .append(1000, "shared", &[worker as u8; 32])
                        .expect("append");
                    ids.push((worker, i, id));
                }
                ids
            })
        })
        .collect();
    let mut all: Vec<u64> = workers
        .into_iter()
        .flat_map(|worker| worker.join().expect("join"))
        .map(|(_, _, id)| id)
        .collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 100);
    assert_eq!(buffer.message_count().expect("count"), 100);
}
