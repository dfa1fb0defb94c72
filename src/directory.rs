use std::path::{Path, PathBuf};

use crate::segment::{parse_segment_name, segment_file_name, SEGMENT_SUFFIX};
use crate::{Error, Result};

/// Headroom added when the parallel arrays grow.
const GROW_HEADROOM: usize = 512;

/// In-memory index of the segment files, kept in first-ID order.
///
/// Three parallel arrays hold `(first_id, first_ts, count)` per segment; a
/// `[head, tail)` window marks the live ring so dropping the oldest segment is
/// a head bump, not a shift. Growth compacts the window back to offset 0 and
/// reallocates with headroom.
///
/// `count` is only authoritative for sealed segments; the live count of the
/// active segment is owned by its handle.
pub struct SegmentDirectory {
    first_id: Vec<u64>,
    first_ts: Vec<i64>,
    count: Vec<u32>,
    head: usize,
    tail: usize,
}

impl SegmentDirectory {
    pub fn new() -> Self {
        Self {
            first_id: Vec::new(),
            first_ts: Vec::new(),
            count: Vec::new(),
            head: 0,
            tail: 0,
        }
    }

    /// Builds the index by scanning a buffer directory.
    ///
    /// Sorting the fixed-width names lexicographically reconstructs first-ID
    /// order. Any `.qdb` file whose name does not parse is a fatal
    /// construction error.
    pub fn scan(dir: &Path) -> Result<Self> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name
                .to_str()
                .ok_or_else(|| Error::CorruptName(name.to_string_lossy().into_owned()))?;
            if !name.ends_with(SEGMENT_SUFFIX) {
                continue;
            }
            names.push(name.to_string());
        }
        names.sort_unstable();

        let mut index = Self::new();
        for name in &names {
            let (first_id, first_ts, count) = parse_segment_name(name)?;
            if index.len() > 0 && first_id <= index.first_id[index.tail - 1] {
                return Err(Error::CorruptName(name.clone()));
            }
            index.push(first_id, first_ts);
            index.set_count(index.tail - 1, count);
        }
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn tail(&self) -> usize {
        self.tail
    }

    pub fn first_id(&self, i: usize) -> u64 {
        debug_assert!(i >= self.head && i < self.tail);
        self.first_id[i]
    }

    pub fn first_ts(&self, i: usize) -> i64 {
        debug_assert!(i >= self.head && i < self.tail);
        self.first_ts[i]
    }

    pub fn count(&self, i: usize) -> u32 {
        debug_assert!(i >= self.head && i < self.tail);
        self.count[i]
    }

    pub fn set_count(&mut self, i: usize, count: u32) {
        debug_assert!(i >= self.head && i < self.tail);
        self.count[i] = count;
    }

    /// File path of segment `i` under `dir`, derived from the indexed name
    /// fields.
    pub fn path(&self, dir: &Path, i: usize) -> PathBuf {
        dir.join(segment_file_name(
            self.first_id(i),
            self.first_ts(i),
            self.count(i),
        ))
    }

    /// Index of the segment whose ID range covers `id`.
    ///
    /// IDs below the ring head clamp to the head segment. Returns `None` only
    /// on an empty window.
    pub fn find_by_id(&self, id: u64) -> Option<usize> {
        self.predecessor(&self.first_id, id)
    }

    /// Index of the segment whose time range covers `ts`, with the same
    /// clamping as [`find_by_id`].
    pub fn find_by_ts(&self, ts: i64) -> Option<usize> {
        self.predecessor(&self.first_ts, ts)
    }

    /// Appends a new segment at the tail, growing the arrays when full.
    pub fn push(&mut self, first_id: u64, first_ts: i64) {
        if self.head > 0 && self.first_id.len() == self.first_id.capacity() {
            // Compact the window to offset 0 before reallocating.
            self.first_id.drain(..self.head);
            self.first_ts.drain(..self.head);
            self.count.drain(..self.head);
            self.tail -= self.head;
            self.head = 0;
            self.first_id.reserve(GROW_HEADROOM);
            self.first_ts.reserve(GROW_HEADROOM);
            self.count.reserve(GROW_HEADROOM);
        }
        self.first_id.push(first_id);
        self.first_ts.push(first_ts);
        self.count.push(0);
        self.tail += 1;
    }

    /// Advances the window past the oldest segment. Does not resize.
    pub fn drop_head(&mut self) {
        debug_assert!(self.head < self.tail);
        self.head += 1;
    }

    fn predecessor<T: Ord + Copy>(&self, keys: &[T], target: T) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let window = &keys[self.head..self.tail];
        let upper = window.partition_point(|&key| key <= target);
        if upper == 0 {
            // Target precedes the ring head; clamp.
            return Some(self.head);
        }
        Some(self.head + upper - 1)
    }
}
