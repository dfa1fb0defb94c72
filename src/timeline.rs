/// Histogram-like view of a message range, suitable for UI rendering.
///
/// Holds `n + 1` parallel entries: one per bin plus a trailing sentinel whose
/// ID is the first ID past the range. Byte and time widths of bin `i` fall out
/// of the ID-is-byte-offset invariant as plain deltas between entries.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    first_id: Vec<u64>,
    first_ts: Vec<i64>,
    count: Vec<u32>,
}

impl Timeline {
    pub(crate) fn push(&mut self, first_id: u64, first_ts: i64, count: u32) {
        self.first_id.push(first_id);
        self.first_ts.push(first_ts);
        self.count.push(count);
    }

    /// Number of entries, including the trailing sentinel.
    pub fn entries(&self) -> usize {
        self.first_id.len()
    }

    /// Number of bins (entries minus the sentinel).
    pub fn bins(&self) -> usize {
        self.first_id.len().saturating_sub(1)
    }

    pub fn first_id(&self, i: usize) -> u64 {
        self.first_id[i]
    }

    pub fn first_timestamp(&self, i: usize) -> i64 {
        self.first_ts[i]
    }

    pub fn count(&self, i: usize) -> u32 {
        self.count[i]
    }

    /// Encoded byte width of bin `i`.
    pub fn bytes(&self, i: usize) -> u64 {
        self.first_id[i + 1] - self.first_id[i]
    }

    /// Time width of bin `i` in milliseconds.
    pub fn millis(&self, i: usize) -> i64 {
        self.first_ts[i + 1] - self.first_ts[i]
    }
}
