use std::sync::Arc;
use std::time::{Duration, Instant};

use qring::{BufferConfig, Error, MessageBuffer};
use tempfile::tempdir;

fn config() -> BufferConfig {
    BufferConfig {
        segment_length: 8192,
        max_payload_size: 1024,
        auto_sync_interval: None,
        ..BufferConfig::default()
    }
}

#[test]
fn blocked_cursor_wakes_on_append() {
    let dir = tempdir().expect("tempdir");
    let buffer = MessageBuffer::open(dir.path(), config()).expect("open");

    let mut cursor = buffer.cursor(0).expect("cursor");
    let reader = std::thread::spawn(move || {
        let got = cursor.next_wait(Some(Duration::from_secs(5))).expect("wait");
        assert!(got, "append never arrived");
        cursor.payload().expect("payload").to_vec()
    });

    std::thread::sleep(Duration::from_millis(50));
    buffer.append(1000, "", b"wake up").expect("append");
    assert_eq!(reader.join().expect("join"), b"wake up");
}

#[test]
fn wait_times_out_without_producers() {
    let dir = tempdir().expect("tempdir");
    let buffer = MessageBuffer::open(dir.path(), config()).expect("open");
    let mut cursor = buffer.cursor(0).expect("cursor");

    let started = Instant::now();
    let got = cursor
        .next_wait(Some(Duration::from_millis(50)))
        .expect("wait");
    assert!(!got);
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn buffer_close_interrupts_a_blocked_cursor() {
    let dir = tempdir().expect("tempdir");
    let buffer = MessageBuffer::open(dir.path(), config()).expect("open");

    let mut cursor = buffer.cursor(0).expect("cursor");
    let reader = std::thread::spawn(move || cursor.next_wait(Some(Duration::from_secs(30))));

    std::thread::sleep(Duration::from_millis(50));
    buffer.close().expect("close");
    let result = reader.join().expect("join");
    assert!(
        matches!(result, Err(Error::Closed) | Err(Error::Interrupted)),
        "unexpected result: {result:?}"
    );
}

#[test]
fn empty_cursor_adopts_records_that_arrive_later() {
    let dir = tempdir().expect("tempdir");
    let buffer = MessageBuffer::open(dir.path(), config()).expect("open");

    // Created while the buffer is empty.
    let mut cursor = buffer.cursor(0).expect("cursor");
    assert!(!cursor.next().expect("next"));

    buffer.append(1000, "late", b"first").expect("append");
    assert!(cursor.next().expect("next"));
    assert_eq!(cursor.routing_key().expect("key"), "late");
    assert_eq!(cursor.payload().expect("payload"), b"first");
    assert!(!cursor.next().expect("next"));
}

#[test]
fn waiting_cursor_streams_a_live_feed() {
    let dir = tempdir().expect("tempdir");
    let buffer = MessageBuffer::open(dir.path(), config()).expect("open");
    let total = 50u8;

    let mut cursor = buffer.cursor(0).expect("cursor");
    let reader = std::thread::spawn(move || {
        let mut seen = Vec::new();
        while seen.len() < total as usize {
            if cursor.next_wait(Some(Duration::from_secs(5))).expect("wait") {
                seen.push(cursor.payload().expect("payload")[0]);
            } else {
                break;
            }
        }
        seen
    });

    let producer = {
        let buffer = Arc::clone(&buffer);
        std::thread::spawn(move || {
            for i in 0..total {
                buffer.append(1000 + i as i64, "", &[i; 8]).expect("append");
                if i % 16 == 0 {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        })
    };

    producer.join().expect("producer");
    let seen = reader.join().expect("reader");
    assert_eq!(seen, (0..total).collect::<Vec<u8>>());
}

#[test]
fn closed_cursor_rejects_further_reads() {
    let dir = tempdir().expect("tempdir");
    let buffer = MessageBuffer::open(dir.path(), config()).expect("open");
    buffer.append(1000, "", b"x").expect("append");

    let mut cursor = buffer.cursor(0).expect("cursor");
    assert!(cursor.next().expect("next"));
    cursor.close();
    assert!(matches!(cursor.next(), Err(Error::Closed)));
    assert!(matches!(
        cursor.next_wait(Some(Duration::from_millis(10))),
        Err(Error::Closed)
    ));
}
