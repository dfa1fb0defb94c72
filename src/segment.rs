use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::header::{record_len, RecordHeader, HEADER_SIZE};
use crate::mmap::MmapFile;
use crate::timeline::Timeline;
use crate::{Error, Result};

pub const FILE_HEADER_SIZE: usize = 64;
pub const FILE_MAGIC: u32 = 0x51524230; // 'QRB0'
pub const FILE_VERSION: u32 = 1;
pub const SEGMENT_SUFFIX: &str = ".qdb";

/// Widest per-segment timeline returned by [`Segment::timeline`].
const TIMELINE_BINS: usize = 16;

/// File name of a segment: 16 hex digits of the first message ID, 16 hex
/// digits of the first message timestamp, decimal message count. The active
/// segment carries count 0 and is renamed with the final count when sealed.
pub fn segment_file_name(first_id: u64, first_ts: i64, count: u32) -> String {
    format!("{:016x}-{:016x}-{}{}", first_id, first_ts as u64, count, SEGMENT_SUFFIX)
}

pub fn segment_path(dir: &Path, first_id: u64, first_ts: i64, count: u32) -> PathBuf {
    dir.join(segment_file_name(first_id, first_ts, count))
}

/// Parses a segment file name, enforcing the fixed-width pattern
/// `^[0-9a-f]{16}-[0-9a-f]{16}-\d+\.qdb$`.
pub fn parse_segment_name(name: &str) -> Result<(u64, i64, u32)> {
    let corrupt = || Error::CorruptName(name.to_string());
    let stem = name.strip_suffix(SEGMENT_SUFFIX).ok_or_else(corrupt)?;
    let bytes = stem.as_bytes();
    if bytes.len() < 35 || bytes[16] != b'-' || bytes[33] != b'-' {
        return Err(corrupt());
    }
    let id_field = &stem[0..16];
    let ts_field = &stem[17..33];
    let count_field = &stem[34..];
    if !is_lower_hex(id_field) || !is_lower_hex(ts_field) {
        return Err(corrupt());
    }
    if count_field.is_empty() || !count_field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(corrupt());
    }
    let first_id = u64::from_str_radix(id_field, 16).map_err(|_| corrupt())?;
    let first_ts = u64::from_str_radix(ts_field, 16).map_err(|_| corrupt())? as i64;
    let count = count_field.parse::<u32>().map_err(|_| corrupt())?;
    Ok((first_id, first_ts, count))
}

fn is_lower_hex(field: &str) -> bool {
    field
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

pub fn validate_segment_len(segment_len: u64) -> Result<usize> {
    let len = usize::try_from(segment_len)
        .map_err(|_| Error::InvalidArgument("segment length exceeds addressable range"))?;
    if len < FILE_HEADER_SIZE + record_len(0, 0) {
        return Err(Error::InvalidArgument("segment length too small"));
    }
    Ok(len)
}

/// One decoded message, owned by the cursor that read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub timestamp: i64,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

/// One on-disk segment file.
///
/// The handle is shared through `Arc`: the appender and any cursors positioned
/// on the active segment use the same instance, and the OS file stays open
/// for as long as any clone lives, even after the ring unlinks the path.
/// Reads and writes are serialized by the handle's own lock, never by the
/// buffer lock.
pub struct Segment {
    first_id: u64,
    first_ts: i64,
    writable: bool,
    state: Mutex<SegmentState>,
}

struct SegmentState {
    mmap: MmapFile,
    path: PathBuf,
    /// File offset of the next free byte.
    write_offset: usize,
    count: u32,
    last_ts: i64,
    sealed: bool,
    dirty: bool,
}

struct RecordMeta {
    header: RecordHeader,
    payload_len: usize,
    record_len: usize,
}

impl Segment {
    /// Creates a fresh active segment file, preallocated to `segment_len`
    /// bytes and named with count 0.
    pub fn create(dir: &Path, first_id: u64, first_ts: i64, segment_len: usize) -> Result<Arc<Self>> {
        let path = segment_path(dir, first_id, first_ts, 0);
        let mut mmap = MmapFile::create(&path, segment_len)?;
        write_file_header(&mut mmap, first_id, first_ts)?;
        Ok(Arc::new(Self {
            first_id,
            first_ts,
            writable: true,
            state: Mutex::new(SegmentState {
                mmap,
                path,
                write_offset: FILE_HEADER_SIZE,
                count: 0,
                last_ts: first_ts,
                sealed: false,
                dirty: true,
            }),
        }))
    }

    /// Opens an existing segment for reading.
    ///
    /// `count` comes from the file name; 0 means the segment was never sealed
    /// (the buffer crashed while it was active) and the committed tail is
    /// discovered by scanning.
    pub fn open_read(path: &Path, first_id: u64, first_ts: i64, count: u32) -> Result<Arc<Self>> {
        let mmap = MmapFile::open(path)?;
        read_file_header(&mmap, first_id)?;
        let count_hint = if count > 0 { Some(count) } else { None };
        let (write_offset, scanned, last_ts) = scan_committed(&mmap, first_id, first_ts, count_hint)?;
        Ok(Arc::new(Self {
            first_id,
            first_ts,
            writable: false,
            state: Mutex::new(SegmentState {
                mmap,
                path: path.to_path_buf(),
                write_offset,
                count: scanned,
                last_ts,
                sealed: count > 0,
                dirty: false,
            }),
        }))
    }

    /// Reopens the last segment of a ring for append continuation: renames
    /// the sealed file back to count 0 and positions the writer after the
    /// last committed record.
    pub fn reopen_append(
        dir: &Path,
        first_id: u64,
        first_ts: i64,
        prior_count: u32,
    ) -> Result<Arc<Self>> {
        let sealed_path = segment_path(dir, first_id, first_ts, prior_count);
        let active_path = segment_path(dir, first_id, first_ts, 0);
        if sealed_path != active_path {
            std::fs::rename(&sealed_path, &active_path)?;
        }
        let mmap = MmapFile::open(&active_path)?;
        read_file_header(&mmap, first_id)?;
        let (write_offset, count, last_ts) = scan_committed(&mmap, first_id, first_ts, None)?;
        Ok(Arc::new(Self {
            first_id,
            first_ts,
            writable: true,
            state: Mutex::new(SegmentState {
                mmap,
                path: active_path,
                write_offset,
                count,
                last_ts,
                sealed: false,
                dirty: false,
            }),
        }))
    }

    pub fn first_message_id(&self) -> u64 {
        self.first_id
    }

    pub fn first_timestamp(&self) -> i64 {
        self.first_ts
    }

    /// Appends one record. Returns the assigned ID, or `None` when the record
    /// does not fit and the segment must roll.
    pub fn append(&self, timestamp: i64, routing_key: &str, payload: &[u8]) -> Result<Option<u64>> {
        let mut state = self.lock()?;
        if state.sealed || !self.writable {
            return Err(Error::Corrupt("append to sealed segment"));
        }
        let key = routing_key.as_bytes();
        let framed = record_len(key.len(), payload.len());
        let offset = state.write_offset;
        if offset + framed > state.mmap.len() {
            return Ok(None);
        }

        let id = self.first_id + (offset - FILE_HEADER_SIZE) as u64;
        state
            .mmap
            .range_mut(offset + HEADER_SIZE, key.len())?
            .copy_from_slice(key);
        state
            .mmap
            .range_mut(offset + HEADER_SIZE + key.len(), payload.len())?
            .copy_from_slice(payload);

        let checksum = RecordHeader::crc32(key, payload);
        let header = RecordHeader::new_uncommitted(id, timestamp, key.len() as u16, checksum);
        state
            .mmap
            .range_mut(offset, HEADER_SIZE)?
            .copy_from_slice(&header.to_bytes());

        // Commit last so concurrent cursors never see a partial record.
        let commit_len = RecordHeader::commit_len_for_payload(payload.len())?;
        let header_ptr = unsafe { state.mmap.as_mut_slice().as_mut_ptr().add(offset) };
        RecordHeader::store_commit_len(header_ptr, commit_len);

        state.write_offset = offset + framed;
        state.count += 1;
        state.last_ts = timestamp;
        state.dirty = true;
        Ok(Some(id))
    }

    /// ID one past the last committed record.
    pub fn next_message_id(&self) -> Result<u64> {
        let state = self.lock()?;
        Ok(self.first_id + (state.write_offset - FILE_HEADER_SIZE) as u64)
    }

    pub fn message_count(&self) -> Result<u32> {
        Ok(self.lock()?.count)
    }

    pub fn most_recent_timestamp(&self) -> Result<i64> {
        Ok(self.lock()?.last_ts)
    }

    /// Encoded byte length of the committed records (excludes the file
    /// header).
    pub fn length(&self) -> Result<u64> {
        let state = self.lock()?;
        Ok((state.write_offset - FILE_HEADER_SIZE) as u64)
    }

    /// Flushes committed records to disk. `force_fsync` makes the checkpoint
    /// durable; otherwise the flush is asynchronous.
    pub fn checkpoint(&self, force_fsync: bool) -> Result<()> {
        let mut state = self.lock()?;
        if !state.dirty && !force_fsync {
            return Ok(());
        }
        if force_fsync {
            state.mmap.flush_sync()?;
        } else {
            state.mmap.flush_async()?;
        }
        state.dirty = false;
        Ok(())
    }

    /// Seals the segment: durable flush, then rename to embed the final
    /// count. Idempotent.
    pub fn seal(&self) -> Result<u32> {
        let mut state = self.lock()?;
        if state.sealed {
            return Ok(state.count);
        }
        state.mmap.flush_sync()?;
        state.dirty = false;
        let sealed_path = state
            .path
            .parent()
            .map(|dir| segment_path(dir, self.first_id, self.first_ts, state.count))
            .ok_or(Error::Corrupt("segment path has no parent"))?;
        std::fs::rename(&state.path, &sealed_path)?;
        state.path = sealed_path;
        state.sealed = true;
        Ok(state.count)
    }

    pub fn is_sealed(&self) -> Result<bool> {
        Ok(self.lock()?.sealed)
    }

    pub fn file_path(&self) -> Result<PathBuf> {
        Ok(self.lock()?.path.clone())
    }

    /// Cursor positioned just before the first record whose ID is `>= from_id`.
    pub fn cursor(self: &Arc<Self>, from_id: u64) -> Result<SegmentCursor> {
        let mut cursor = SegmentCursor::new(Arc::clone(self));
        cursor.seek_id(from_id)?;
        Ok(cursor)
    }

    /// Cursor positioned at the last record with timestamp `<= ts`, or at the
    /// first record when every record is later than `ts`.
    pub fn cursor_by_timestamp(self: &Arc<Self>, ts: i64) -> Result<SegmentCursor> {
        let mut cursor = SegmentCursor::new(Arc::clone(self));
        cursor.seek_timestamp(ts)?;
        Ok(cursor)
    }

    /// Histogram of this segment's records in at most 16 byte-range bins.
    pub fn timeline(&self) -> Result<Timeline> {
        let state = self.lock()?;
        let mut records = Vec::with_capacity(state.count as usize);
        let mut offset = FILE_HEADER_SIZE;
        let mut remaining = state.count;
        while remaining > 0 {
            let meta = match read_meta(&state, offset)? {
                Some(meta) => meta,
                None => break,
            };
            records.push((
                self.first_id + (offset - FILE_HEADER_SIZE) as u64,
                meta.header.timestamp,
            ));
            offset += meta.record_len;
            remaining -= 1;
        }

        let mut timeline = Timeline::default();
        if records.is_empty() {
            return Ok(timeline);
        }
        let per_bin = records.len().div_ceil(TIMELINE_BINS);
        for bin in records.chunks(per_bin) {
            timeline.push(bin[0].0, bin[0].1, bin.len() as u32);
        }
        let next_id = self.first_id + (state.write_offset - FILE_HEADER_SIZE) as u64;
        timeline.push(next_id, state.last_ts, 0);
        Ok(timeline)
    }

    fn lock(&self) -> Result<MutexGuard<'_, SegmentState>> {
        self.state
            .lock()
            .map_err(|_| Error::Corrupt("segment lock poisoned"))
    }
}

/// Forward cursor over one segment's committed records.
pub struct SegmentCursor {
    segment: Arc<Segment>,
    read_offset: usize,
    read_count: u32,
    current: Option<Message>,
}

impl SegmentCursor {
    fn new(segment: Arc<Segment>) -> Self {
        Self {
            segment,
            read_offset: FILE_HEADER_SIZE,
            read_count: 0,
            current: None,
        }
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// ID of the record this cursor would read next.
    pub fn next_id(&self) -> u64 {
        self.segment.first_id + (self.read_offset - FILE_HEADER_SIZE) as u64
    }

    pub fn current(&self) -> Option<&Message> {
        self.current.as_ref()
    }

    /// Advances to the next committed record. `Ok(false)` means the cursor
    /// reached the end of committed data; on the active segment more records
    /// may appear later.
    pub fn next(&mut self) -> Result<bool> {
        let state = self.segment.lock()?;
        if self.at_end(&state) {
            return Ok(false);
        }
        let offset = self.read_offset;
        let meta = match read_meta(&state, offset)? {
            Some(meta) => meta,
            None => return Ok(false),
        };

        let key_len = meta.header.key_len as usize;
        let key_start = offset + HEADER_SIZE;
        let slice = state.mmap.as_slice();
        let key_bytes = &slice[key_start..key_start + key_len];
        let payload = slice[key_start + key_len..key_start + key_len + meta.payload_len].to_vec();
        meta.header.validate_crc(key_bytes, &payload)?;
        let routing_key = String::from_utf8(key_bytes.to_vec())
            .map_err(|_| Error::Corrupt("routing key is not valid UTF-8"))?;

        let id = self.segment.first_id + (offset - FILE_HEADER_SIZE) as u64;
        if meta.header.message_id != id {
            return Err(Error::Corrupt("record id does not match its offset"));
        }

        self.current = Some(Message {
            id,
            timestamp: meta.header.timestamp,
            routing_key,
            payload,
        });
        self.read_offset = offset + meta.record_len;
        self.read_count += 1;
        Ok(true)
    }

    fn seek_id(&mut self, from_id: u64) -> Result<()> {
        let state = self.segment.lock()?;
        while !self.at_end(&state) {
            let id = self.segment.first_id + (self.read_offset - FILE_HEADER_SIZE) as u64;
            if id >= from_id {
                break;
            }
            let meta = match read_meta(&state, self.read_offset)? {
                Some(meta) => meta,
                None => break,
            };
            self.read_offset += meta.record_len;
            self.read_count += 1;
        }
        Ok(())
    }

    fn seek_timestamp(&mut self, ts: i64) -> Result<()> {
        let state = self.segment.lock()?;
        let mut best: Option<(usize, u32)> = None;
        let mut offset = FILE_HEADER_SIZE;
        let mut count = 0u32;
        loop {
            if self.ended_at(&state, offset, count) {
                break;
            }
            let meta = match read_meta(&state, offset)? {
                Some(meta) => meta,
                None => break,
            };
            if meta.header.timestamp > ts {
                break;
            }
            best = Some((offset, count));
            offset += meta.record_len;
            count += 1;
        }
        if let Some((offset, count)) = best {
            self.read_offset = offset;
            self.read_count = count;
        }
        Ok(())
    }

    fn at_end(&self, state: &SegmentState) -> bool {
        self.ended_at(state, self.read_offset, self.read_count)
    }

    fn ended_at(&self, state: &SegmentState, offset: usize, count: u32) -> bool {
        if state.sealed || !self.segment.writable {
            if count >= state.count {
                return true;
            }
        }
        offset + HEADER_SIZE > state.mmap.len()
    }
}

fn read_meta(state: &SegmentState, offset: usize) -> Result<Option<RecordMeta>> {
    if offset + HEADER_SIZE > state.mmap.len() {
        return Ok(None);
    }
    let slice = state.mmap.as_slice();
    let commit = RecordHeader::load_commit_len(&slice[offset] as *const u8);
    if commit == 0 {
        return Ok(None);
    }
    let payload_len = RecordHeader::payload_len_from_commit(commit)?;
    let mut header_buf = [0u8; HEADER_SIZE];
    header_buf.copy_from_slice(&slice[offset..offset + HEADER_SIZE]);
    let header = RecordHeader::from_bytes(&header_buf)?;
    let framed = record_len(header.key_len as usize, payload_len);
    if offset + framed > state.mmap.len() {
        return Err(Error::Corrupt("record overruns segment"));
    }
    Ok(Some(RecordMeta {
        header,
        payload_len,
        record_len: framed,
    }))
}

/// Scans committed records from the start of the data area.
///
/// Returns `(end_offset, count, last_ts)`. With a count hint (sealed
/// segments) the scan stops after that many records; otherwise the first zero
/// commit word ends it.
fn scan_committed(
    mmap: &MmapFile,
    first_id: u64,
    first_ts: i64,
    count_hint: Option<u32>,
) -> Result<(usize, u32, i64)> {
    let mut offset = FILE_HEADER_SIZE;
    let mut count = 0u32;
    let mut last_ts = first_ts;
    loop {
        if let Some(hint) = count_hint {
            if count >= hint {
                break;
            }
        }
        if offset + HEADER_SIZE > mmap.len() {
            break;
        }
        let slice = mmap.as_slice();
        let commit = RecordHeader::load_commit_len(&slice[offset] as *const u8);
        if commit == 0 {
            break;
        }
        let payload_len = RecordHeader::payload_len_from_commit(commit)?;
        let mut header_buf = [0u8; HEADER_SIZE];
        header_buf.copy_from_slice(&slice[offset..offset + HEADER_SIZE]);
        let header = RecordHeader::from_bytes(&header_buf)?;
        let framed = record_len(header.key_len as usize, payload_len);
        if offset + framed > mmap.len() {
            break;
        }
        let expected_id = first_id + (offset - FILE_HEADER_SIZE) as u64;
        if header.message_id != expected_id {
            break;
        }
        last_ts = header.timestamp;
        offset += framed;
        count += 1;
    }
    Ok((offset, count, last_ts))
}

fn write_file_header(mmap: &mut MmapFile, first_id: u64, first_ts: i64) -> Result<()> {
    let mut buf = [0u8; FILE_HEADER_SIZE];
    buf[0..4].copy_from_slice(&FILE_MAGIC.to_le_bytes());
    buf[4..8].copy_from_slice(&FILE_VERSION.to_le_bytes());
    buf[8..16].copy_from_slice(&first_id.to_le_bytes());
    buf[16..24].copy_from_slice(&first_ts.to_le_bytes());
    mmap.range_mut(0, FILE_HEADER_SIZE)?.copy_from_slice(&buf);
    Ok(())
}

fn read_file_header(mmap: &MmapFile, first_id: u64) -> Result<()> {
    if mmap.len() < FILE_HEADER_SIZE {
        return Err(Error::Corrupt("segment too small for file header"));
    }
    let slice = mmap.as_slice();
    let magic = u32::from_le_bytes(slice[0..4].try_into().expect("slice length"));
    let version = u32::from_le_bytes(slice[4..8].try_into().expect("slice length"));
    let header_id = u64::from_le_bytes(slice[8..16].try_into().expect("slice length"));
    if magic != FILE_MAGIC {
        return Err(Error::Corrupt("segment magic mismatch"));
    }
    if version != FILE_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    if header_id != first_id {
        return Err(Error::Corrupt("segment first id mismatch"));
    }
    Ok(())
}
