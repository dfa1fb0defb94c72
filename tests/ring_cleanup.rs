use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use qring::{BufferConfig, MessageBuffer, TaskExecutor};
use tempfile::tempdir;

fn ring_config() -> BufferConfig {
    BufferConfig {
        max_size: 4096,
        segment_length: 3072,
        max_payload_size: 1024,
        auto_sync_interval: None,
        ..BufferConfig::default()
    }
}

fn qdb_count(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .expect("read dir")
        .filter(|entry| {
            entry
                .as_ref()
                .expect("entry")
                .file_name()
                .to_string_lossy()
                .ends_with(".qdb")
        })
        .count()
}

#[test]
fn ring_cap_reclaims_oldest_segments() {
    let dir = tempdir().expect("tempdir");
    let buffer = MessageBuffer::open(dir.path(), ring_config()).expect("open");

    // Two 1088-byte records fit a 3072-byte segment; five appends reach a
    // third segment and trip the cap.
    for i in 0..5 {
        buffer.append(1000 + i, "", &[0xEE; 1024]).expect("append");
        assert!(
            buffer.size().expect("size") <= 4096 || qdb_count(dir.path()) == 1,
            "cap violated after append {i}"
        );
    }

    assert!(qdb_count(dir.path()) <= 2);
    assert!(buffer.first_message_id().expect("first") > 0);
}

#[test]
fn cursor_on_reclaimed_id_clamps_to_the_head() {
    let dir = tempdir().expect("tempdir");
    let buffer = MessageBuffer::open(dir.path(), ring_config()).expect("open");
    for i in 0..5 {
        buffer.append(1000 + i, "", &[i as u8; 1024]).expect("append");
    }
    let oldest = buffer.first_message_id().expect("first");
    assert!(oldest > 0, "nothing was reclaimed");

    // Id 0 is long gone; the cursor clamps to the surviving head.
    let mut cursor = buffer.cursor(0).expect("cursor");
    assert!(cursor.next().expect("next"));
    assert_eq!(cursor.id().expect("id"), oldest);
}

#[test]
fn zero_cap_never_reclaims() {
    let dir = tempdir().expect("tempdir");
    let config = BufferConfig {
        max_size: 0,
        segment_length: 3072,
        max_payload_size: 1024,
        auto_sync_interval: None,
        ..BufferConfig::default()
    };
    let buffer = MessageBuffer::open(dir.path(), config).expect("open");
    for i in 0..9 {
        buffer.append(1000 + i, "", &[0x11; 1024]).expect("append");
    }
    assert_eq!(qdb_count(dir.path()), 5);
    assert_eq!(buffer.first_message_id().expect("first"), 0);
    assert_eq!(buffer.message_count().expect("count"), 9);
}

struct CountingExecutor {
    jobs: AtomicUsize,
}

impl TaskExecutor for CountingExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        self.jobs.fetch_add(1, Ordering::SeqCst);
        task();
    }
}

#[test]
fn configured_executor_carries_the_cleanup() {
    let dir = tempdir().expect("tempdir");
    let executor = Arc::new(CountingExecutor {
        jobs: AtomicUsize::new(0),
    });
    let config = BufferConfig {
        executor: Some(Arc::clone(&executor) as Arc<dyn TaskExecutor>),
        ..ring_config()
    };
    let buffer = MessageBuffer::open(dir.path(), config).expect("open");
    for i in 0..5 {
        buffer.append(1000 + i, "", &[0x44; 1024]).expect("append");
    }
    assert!(executor.jobs.load(Ordering::SeqCst) > 0);
    assert!(buffer.size().expect("size") <= 4096);
    assert!(buffer.first_message_id().expect("first") > 0);
}

#[test]
fn explicit_cleanup_is_a_noop_within_cap() {
    let dir = tempdir().expect("tempdir");
    let buffer = MessageBuffer::open(dir.path(), ring_config()).expect("open");
    buffer.append(1000, "", b"tiny").expect("append");
    assert_eq!(buffer.cleanup().expect("cleanup"), 0);
    assert_eq!(buffer.message_count().expect("count"), 1);
}
