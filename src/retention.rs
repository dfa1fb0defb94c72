use std::path::Path;

use log::debug;

use crate::directory::SegmentDirectory;
use crate::segment::FILE_HEADER_SIZE;
use crate::Result;

/// Total on-disk size of the ring.
///
/// ID deltas cover the sealed segments' record bytes; the header term and the
/// active segment's live length are added on top. `active_len` is the active
/// segment's record byte length, or the last known value when no segment is
/// open for append.
pub(crate) fn ring_size(index: &SegmentDirectory, active_len: u64) -> u64 {
    let window = index.len() as u64;
    if window == 0 {
        return 0;
    }
    (window - 1) * FILE_HEADER_SIZE as u64
        + (index.first_id(index.tail() - 1) - index.first_id(index.head()))
        + active_len
}

/// Enforces the ring cap by unlinking the oldest segments.
///
/// Runs while the cap is exceeded and at least two segments remain, so the
/// active segment is never deleted. A failed unlink aborts the invocation.
/// Must be called with the buffer lock held; the caller serializes it against
/// appends.
pub(crate) fn enforce_ring_cap(
    dir: &Path,
    index: &mut SegmentDirectory,
    active_len: u64,
    max_size: u64,
) -> Result<usize> {
    if max_size == 0 {
        return Ok(0);
    }
    let mut reclaimed = 0;
    while ring_size(index, active_len) > max_size && index.len() >= 2 {
        let head = index.head();
        let path = index.path(dir, head);
        std::fs::remove_file(&path)?;
        debug!(
            "reclaimed segment {} ({} messages)",
            path.display(),
            index.count(head)
        );
        index.drop_head();
        reclaimed += 1;
    }
    Ok(reclaimed)
}
