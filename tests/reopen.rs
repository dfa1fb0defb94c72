use qring::{BufferConfig, MessageBuffer};
use tempfile::tempdir;

fn config() -> BufferConfig {
    BufferConfig {
        segment_length: 4096,
        max_payload_size: 1024,
        auto_sync_interval: None,
        ..BufferConfig::default()
    }
}

#[test]
fn reopened_buffer_replays_the_same_sequence() {
    let dir = tempdir().expect("tempdir");
    let messages: Vec<(i64, String, Vec<u8>)> = (0..9)
        .map(|i| (3000 + i as i64, format!("key-{i}"), vec![i as u8; 700]))
        .collect();

    {
        let buffer = MessageBuffer::open(dir.path(), config()).expect("open");
        for (ts, key, payload) in &messages {
            buffer.append(*ts, key, payload).expect("append");
        }
        buffer.close().expect("close");
    }

    let buffer = MessageBuffer::open(dir.path(), config()).expect("reopen");
    assert_eq!(buffer.message_count().expect("count"), 9);
    let mut cursor = buffer.cursor(0).expect("cursor");
    for (ts, key, payload) in &messages {
        assert!(cursor.next().expect("next"));
        assert_eq!(cursor.timestamp().expect("ts"), *ts);
        assert_eq!(cursor.routing_key().expect("key"), key);
        assert_eq!(cursor.payload().expect("payload"), payload.as_slice());
    }
    assert!(!cursor.next().expect("next"));
}

#[test]
fn appends_continue_after_reopen() {
    let dir = tempdir().expect("tempdir");
    let first_run_next = {
        let buffer = MessageBuffer::open(dir.path(), config()).expect("open");
        for i in 0..4 {
            buffer.append(1000 + i, "", &[0x22; 512]).expect("append");
        }
        let next = buffer.next_message_id().expect("next id");
        buffer.close().expect("close");
        next
    };

    let buffer = MessageBuffer::open(dir.path(), config()).expect("reopen");
    assert_eq!(buffer.next_message_id().expect("next id"), first_run_next);
    let id = buffer.append(2000, "", b"afterwards").expect("append");
    assert_eq!(id, first_run_next);
    assert_eq!(buffer.message_count().expect("count"), 5);

    let mut cursor = buffer.cursor(id).expect("cursor");
    assert!(cursor.next().expect("next"));
    assert_eq!(cursor.payload().expect("payload"), b"afterwards");
}

#[test]
fn synced_records_survive_an_unclean_shutdown() {
    let dir = tempdir().expect("tempdir");
    {
        let buffer = MessageBuffer::open(dir.path(), config()).expect("open");
        for i in 0..3 {
            buffer.append(1000 + i, "durable", &[0x33; 256]).expect("append");
        }
        buffer.sync().expect("sync");
        // Simulate a crash: the buffer is never closed, so the active
        // segment keeps its count-0 name.
        std::mem::forget(buffer);
    }

    let buffer = MessageBuffer::open(dir.path(), config()).expect("reopen");
    assert_eq!(buffer.message_count().expect("count"), 3);
    let mut cursor = buffer.cursor(0).expect("cursor");
    let mut seen = 0;
    while cursor.next().expect("next") {
        assert_eq!(cursor.routing_key().expect("key"), "durable");
        assert_eq!(cursor.payload().expect("payload"), &[0x33; 256]);
        seen += 1;
    }
    assert_eq!(seen, 3);
}

#[test]
fn foreign_file_names_fail_construction() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join("0123-bogus.qdb"), b"junk").expect("write");
    assert!(matches!(
        MessageBuffer::open(dir.path(), config()),
        Err(qring::Error::CorruptName(_))
    ));
}
