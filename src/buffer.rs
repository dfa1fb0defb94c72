use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, warn};

use crate::clock::{Clock, SystemClock};
use crate::cursor::MessageCursor;
use crate::directory::SegmentDirectory;
use crate::header::MAX_ROUTING_KEY_LEN;
use crate::retention::{enforce_ring_cap, ring_size};
use crate::segment::{validate_segment_len, Segment, SegmentCursor};
use crate::shutdown::{self, ShutdownHandle};
use crate::tasks::{shared_timer, TaskExecutor, TaskHandle, Timer};

use crate::timeline::Timeline;
use crate::waiter::WaiterList;
use crate::{Error, Result};

pub const DEFAULT_MAX_SIZE: u64 = 100_000_000_000;
pub const DEFAULT_SEGMENT_COUNT: u32 = 1000;
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 128 * 1024;
pub const DEFAULT_AUTO_SYNC_INTERVAL: Duration = Duration::from_secs(1);
/// Slack reserved per segment for the file header and record framing.
const SEGMENT_RESERVE: u64 = 2048;
const MAX_SEGMENT_LEN: u64 = 1 << 30;

/// Configuration for [`MessageBuffer::open`].
#[derive(Clone)]
pub struct BufferConfig {
    /// Ring cap in bytes; 0 disables cleanup.
    pub max_size: u64,
    /// Target segment count when the ring is full; guides the implicit
    /// segment length.
    pub segment_count: u32,
    /// Fixed segment file size in bytes; 0 derives it from `max_size` and
    /// `segment_count`.
    pub segment_length: u64,
    /// Per-record payload cap; 0 derives it from the segment length.
    pub max_payload_size: usize,
    /// Delay between an append and the scheduled fsync; `None` disables
    /// auto-sync.
    pub auto_sync_interval: Option<Duration>,
    /// First message ID of a fresh ring.
    pub first_message_id: u64,
    /// Async sink for ring cleanup; cleanup runs inline when absent.
    pub executor: Option<Arc<dyn TaskExecutor>>,
    /// Scheduler for the auto-sync task; the process-private timer when
    /// absent.
    pub timer: Option<Arc<Timer>>,
    /// Timestamp source for [`MessageBuffer::append_now`].
    pub clock: Arc<dyn Clock>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            segment_count: DEFAULT_SEGMENT_COUNT,
            segment_length: 0,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            auto_sync_interval: Some(DEFAULT_AUTO_SYNC_INTERVAL),
            first_message_id: 0,
            executor: None,
            timer: None,
            clock: Arc::new(SystemClock),
        }
    }
}

/// Append-only durable message buffer over a directory of segment files.
///
/// Producers call [`append`](Self::append); consumers open forward
/// [`MessageCursor`]s by ID or timestamp. Once the on-disk size exceeds
/// `max_size` the oldest segments are reclaimed, so the buffer behaves as a
/// bounded ring.
///
/// One coarse lock serializes the directory index, the active segment pointer
/// and the timer state. Blocked cursors are signalled outside that lock,
/// through their own conditions.
pub struct MessageBuffer {
    dir: PathBuf,
    max_size: u64,
    segment_length: usize,
    max_payload: usize,
    auto_sync: Option<Duration>,
    executor: Option<Arc<dyn TaskExecutor>>,
    timer: Arc<Timer>,
    clock: Arc<dyn Clock>,
    state: Mutex<BufferState>,
    pub(crate) waiters: WaiterList,
}

struct BufferState {
    index: SegmentDirectory,
    active: Option<Arc<Segment>>,
    /// Record byte length of the last segment (live while active, last known
    /// otherwise).
    last_len: u64,
    /// Message count of the last segment (live while active).
    last_count: u32,
    next_id: u64,
    last_ts: i64,
    sync_pending: bool,
    sync_task: Option<TaskHandle>,
    shutdown: Option<ShutdownHandle>,
    closed: bool,
}

impl MessageBuffer {
    /// Opens (or creates) a buffer over `dir`.
    ///
    /// Every `.qdb` file already present must conform to the segment naming
    /// pattern; anything else fails construction with
    /// [`Error::CorruptName`].
    pub fn open(dir: impl AsRef<Path>, config: BufferConfig) -> Result<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        if config.segment_count == 0 {
            return Err(Error::InvalidArgument("segment count must be non-zero"));
        }
        let (segment_length, max_payload) = resolve_sizes(&config)?;

        let index = SegmentDirectory::scan(&dir)?;
        let segment_total = index.len();
        let (next_id, last_len, last_count, last_ts) = if index.is_empty() {
            (config.first_message_id, 0, 0, 0)
        } else {
            let last = index.tail() - 1;
            let segment = Segment::open_read(
                &index.path(&dir, last),
                index.first_id(last),
                index.first_ts(last),
                index.count(last),
            )?;
            (
                segment.next_message_id()?,
                segment.length()?,
                segment.message_count()?,
                segment.most_recent_timestamp()?,
            )
        };

        let buffer = Arc::new(Self {
            dir,
            max_size: config.max_size,
            segment_length,
            max_payload,
            auto_sync: config.auto_sync_interval,
            executor: config.executor,
            timer: config.timer.unwrap_or_else(shared_timer),
            clock: config.clock,
            state: Mutex::new(BufferState {
                index,
                active: None,
                last_len,
                last_count,
                next_id,
                last_ts,
                sync_pending: false,
                sync_task: None,
                shutdown: None,
                closed: false,
            }),
            waiters: WaiterList::new(),
        });
        let handle = shutdown::register(&buffer);
        buffer.lock()?.shutdown = Some(handle);
        debug!(
            "opened buffer at {} (next id {next_id}, {segment_total} segments)",
            buffer.dir.display()
        );
        Ok(buffer)
    }

    /// Appends one message and returns its ID.
    ///
    /// IDs are strictly monotonic and equal the byte offset of the record in
    /// the buffer's logical stream.
    pub fn append(
        self: &Arc<Self>,
        timestamp: i64,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<u64> {
        if payload.len() > self.max_payload {
            return Err(Error::Oversize {
                size: payload.len(),
                max: self.max_payload,
            });
        }
        if routing_key.len() > MAX_ROUTING_KEY_LEN {
            return Err(Error::InvalidArgument("routing key too long"));
        }

        let mut needs_cleanup = false;
        let id = {
            let mut state = self.lock()?;
            if state.closed {
                return Err(Error::Closed);
            }
            self.ensure_active(&mut state, timestamp)?;
            let active = state
                .active
                .clone()
                .ok_or(Error::Corrupt("active segment missing"))?;
            let id = match active.append(timestamp, routing_key, payload)? {
                Some(id) => id,
                None => {
                    self.roll_segment(&mut state, timestamp)?;
                    needs_cleanup = true;
                    let active = state
                        .active
                        .clone()
                        .ok_or(Error::Corrupt("active segment missing"))?;
                    active
                        .append(timestamp, routing_key, payload)?
                        .ok_or(Error::Corrupt("record does not fit a fresh segment"))?
                }
            };
            let active = state
                .active
                .clone()
                .ok_or(Error::Corrupt("active segment missing"))?;
            state.next_id = active.next_message_id()?;
            state.last_len = active.length()?;
            state.last_count = active.message_count()?;
            state.last_ts = timestamp;

            if let Some(interval) = self.auto_sync {
                if !state.sync_pending {
                    state.sync_pending = true;
                    state.sync_task = Some(self.schedule_sync(interval));
                }
            }
            needs_cleanup = needs_cleanup
                || (self.max_size > 0 && ring_size(&state.index, state.last_len) > self.max_size);
            id
        };

        // The buffer lock is released; wake blocked cursors through their own
        // conditions.
        for waiter in self.waiters.snapshot()? {
            waiter.signal();
        }
        if needs_cleanup {
            self.spawn_cleanup()?;
        }
        Ok(id)
    }

    /// [`append`](Self::append) with the timestamp taken from the configured
    /// clock.
    pub fn append_now(self: &Arc<Self>, routing_key: &str, payload: &[u8]) -> Result<u64> {
        self.append(self.clock.now_ms(), routing_key, payload)
    }

    /// Forces a durable checkpoint of the active segment. Idempotent; a noop
    /// when no segment is open for append.
    pub fn sync(&self) -> Result<()> {
        let active = {
            let state = self.lock()?;
            if state.closed {
                return Err(Error::Closed);
            }
            state.active.clone()
        };
        if let Some(active) = active {
            active.checkpoint(true)?;
        }
        Ok(())
    }

    /// Opens a cursor positioned at the record with ID `id`.
    ///
    /// IDs the ring has already reclaimed clamp to the oldest surviving
    /// record; IDs past [`next_message_id`](Self::next_message_id) are
    /// rejected.
    pub fn cursor(self: &Arc<Self>, id: u64) -> Result<MessageCursor> {
        let state = self.lock()?;
        if state.closed {
            return Err(Error::Closed);
        }
        if id > state.next_id {
            return Err(Error::InvalidArgument("message id past end of buffer"));
        }
        if state.index.is_empty() {
            return Ok(MessageCursor::unpositioned(Arc::clone(self)));
        }
        let from = id.max(state.index.first_id(state.index.head()));
        let i = state
            .index
            .find_by_id(from)
            .ok_or(Error::Corrupt("directory empty with segments present"))?;
        let segment = self.open_segment_at(&state, i)?;
        let inner = segment.cursor(from)?;
        Ok(MessageCursor::positioned(Arc::clone(self), inner))
    }

    /// Opens a cursor positioned at the last record with a timestamp at or
    /// before `ts` (predecessor rule); timestamps before the ring clamp to
    /// the oldest record.
    pub fn cursor_by_timestamp(self: &Arc<Self>, ts: i64) -> Result<MessageCursor> {
        let state = self.lock()?;
        if state.closed {
            return Err(Error::Closed);
        }
        if state.index.is_empty() {
            return Ok(MessageCursor::unpositioned(Arc::clone(self)));
        }
        let i = state
            .index
            .find_by_ts(ts)
            .ok_or(Error::Corrupt("directory empty with segments present"))?;
        let segment = self.open_segment_at(&state, i)?;
        let inner = segment.cursor_by_timestamp(ts)?;
        Ok(MessageCursor::positioned(Arc::clone(self), inner))
    }

    /// Total on-disk size of the ring in bytes.
    pub fn size(&self) -> Result<u64> {
        let state = self.lock()?;
        Ok(ring_size(&state.index, state.last_len))
    }

    /// Number of messages currently in the ring.
    pub fn message_count(&self) -> Result<u64> {
        let state = self.lock()?;
        if state.index.is_empty() {
            return Ok(0);
        }
        let mut total = state.last_count as u64;
        for i in state.index.head()..state.index.tail() - 1 {
            total += state.index.count(i) as u64;
        }
        Ok(total)
    }

    /// Timestamp of the oldest message, or `None` on an empty buffer.
    pub fn oldest_message_time(&self) -> Result<Option<i64>> {
        let state = self.lock()?;
        if state.index.is_empty() {
            return Ok(None);
        }
        Ok(Some(state.index.first_ts(state.index.head())))
    }

    /// ID the next appended message will be assigned.
    pub fn next_message_id(&self) -> Result<u64> {
        Ok(self.lock()?.next_id)
    }

    /// ID of the oldest message still in the ring (the configured first ID on
    /// an empty buffer).
    pub fn first_message_id(&self) -> Result<u64> {
        let state = self.lock()?;
        if state.index.is_empty() {
            return Ok(state.next_id);
        }
        Ok(state.index.first_id(state.index.head()))
    }

    /// Sets the ID the first appended message will get. Only legal while the
    /// buffer is empty.
    pub fn set_first_message_id(&self, id: u64) -> Result<()> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(Error::Closed);
        }
        if !state.index.is_empty() {
            return Err(Error::InvalidArgument(
                "first message id can only be set on an empty buffer",
            ));
        }
        state.next_id = id;
        Ok(())
    }

    /// Per-segment histogram of the whole ring: one entry per segment plus a
    /// trailing sentinel carrying `(next_id, most_recent_ts, live_count)`.
    pub fn timeline(&self) -> Result<Timeline> {
        let state = self.lock()?;
        let mut timeline = Timeline::default();
        if state.index.is_empty() {
            return Ok(timeline);
        }
        let last = state.index.tail() - 1;
        for i in state.index.head()..=last {
            let count = if i == last {
                state.last_count
            } else {
                state.index.count(i)
            };
            timeline.push(state.index.first_id(i), state.index.first_ts(i), count);
        }
        timeline.push(state.next_id, state.last_ts, state.last_count);
        Ok(timeline)
    }

    /// Intra-segment histogram of the segment containing `id`.
    pub fn timeline_for(&self, id: u64) -> Result<Timeline> {
        let segment = {
            let state = self.lock()?;
            if state.closed {
                return Err(Error::Closed);
            }
            if id > state.next_id {
                return Err(Error::InvalidArgument("message id past end of buffer"));
            }
            if state.index.is_empty() {
                return Ok(Timeline::default());
            }
            let from = id.max(state.index.first_id(state.index.head()));
            let i = state
                .index
                .find_by_id(from)
                .ok_or(Error::Corrupt("directory empty with segments present"))?;
            self.open_segment_at(&state, i)?
        };
        segment.timeline()
    }

    /// Enforces the ring cap, deleting the oldest segments.
    ///
    /// Runs inline after every rollover unless an executor is configured.
    pub fn cleanup(&self) -> Result<usize> {
        let mut state = self.lock()?;
        if state.closed {
            return Ok(0);
        }
        let active_len = state.last_len;
        enforce_ring_cap(&self.dir, &mut state.index, active_len, self.max_size)
    }

    pub fn is_open(&self) -> bool {
        self.lock().map(|state| !state.closed).unwrap_or(false)
    }

    /// Closes the buffer: cancels the auto-sync task, seals the active
    /// segment, deregisters the shutdown hook and interrupts every blocked
    /// cursor. Idempotent.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.lock()?;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            if let Some(task) = state.sync_task.take() {
                task.cancel();
            }
            state.sync_pending = false;
            if let Some(handle) = state.shutdown.take() {
                shutdown::unregister(handle);
            }
            if let Some(active) = state.active.take() {
                let count = active.seal()?;
                let last = state.index.tail() - 1;
                state.index.set_count(last, count);
            }
        }
        self.waiters.interrupt_all()?;
        debug!("closed buffer at {}", self.dir.display());
        Ok(())
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Effective segment file length after derivation.
    pub fn segment_length(&self) -> usize {
        self.segment_length
    }

    /// Effective per-record payload cap after derivation.
    pub fn max_payload_size(&self) -> usize {
        self.max_payload
    }

    /// Opens (or shares) the handle for segment `i`: the appender's own
    /// handle for the active segment, an independent read-only handle
    /// otherwise.
    fn open_segment_at(&self, state: &BufferState, i: usize) -> Result<Arc<Segment>> {
        if i == state.index.tail() - 1 {
            if let Some(active) = &state.active {
                return Ok(Arc::clone(active));
            }
        }
        Segment::open_read(
            &state.index.path(&self.dir, i),
            state.index.first_id(i),
            state.index.first_ts(i),
            state.index.count(i),
        )
    }

    /// Adopts the ring head for a cursor created on an empty buffer, if
    /// messages have arrived since.
    pub(crate) fn adopt_head_cursor(&self) -> Result<Option<SegmentCursor>> {
        let state = self.lock()?;
        if state.closed {
            return Err(Error::Closed);
        }
        if state.index.is_empty() {
            return Ok(None);
        }
        let head = state.index.head();
        let segment = self.open_segment_at(&state, head)?;
        let from = state.index.first_id(head);
        Ok(Some(segment.cursor(from)?))
    }

    /// Moves an exhausted cursor to the segment covering its next ID.
    ///
    /// `None` means the cursor sits at the end of the stream (the wait
    /// point): either on the active segment or with nothing committed beyond
    /// it.
    pub(crate) fn advance_cursor(&self, inner: &SegmentCursor) -> Result<Option<SegmentCursor>> {
        let state = self.lock()?;
        if state.closed {
            return Err(Error::Closed);
        }
        if let Some(active) = &state.active {
            if Arc::ptr_eq(active, inner.segment()) {
                return Ok(None);
            }
        }
        if state.index.is_empty() {
            return Ok(None);
        }
        let target = inner.next_id();
        if target >= state.next_id {
            return Ok(None);
        }
        let from = target.max(state.index.first_id(state.index.head()));
        let i = state
            .index
            .find_by_id(from)
            .ok_or(Error::Corrupt("directory empty with segments present"))?;
        let segment = self.open_segment_at(&state, i)?;
        Ok(Some(segment.cursor(from)?))
    }

    pub(crate) fn is_closed(&self) -> Result<bool> {
        Ok(self.lock()?.closed)
    }

    fn ensure_active(&self, state: &mut BufferState, timestamp: i64) -> Result<()> {
        if state.active.is_some() {
            return Ok(());
        }
        if state.index.is_empty() {
            let first_id = state.next_id;
            let segment = Segment::create(&self.dir, first_id, timestamp, self.segment_length)?;
            state.index.push(first_id, timestamp);
            state.last_len = 0;
            state.last_count = 0;
            state.active = Some(segment);
        } else {
            // Append continuation after an orderly close and reopen.
            let last = state.index.tail() - 1;
            let segment = Segment::reopen_append(
                &self.dir,
                state.index.first_id(last),
                state.index.first_ts(last),
                state.index.count(last),
            )?;
            state.index.set_count(last, 0);
            state.last_len = segment.length()?;
            state.last_count = segment.message_count()?;
            state.active = Some(segment);
        }
        Ok(())
    }

    fn roll_segment(&self, state: &mut BufferState, timestamp: i64) -> Result<()> {
        let active = state
            .active
            .take()
            .ok_or(Error::Corrupt("rollover without active segment"))?;
        let final_count = active.seal()?;
        let last = state.index.tail() - 1;
        state.index.set_count(last, final_count);
        let next_id = active.next_message_id()?;
        debug!(
            "sealed segment at id {} with {final_count} messages, rolling to {next_id}",
            active.first_message_id()
        );
        // The appender's handle drops here; cursors may still hold theirs.
        drop(active);

        let segment = Segment::create(&self.dir, next_id, timestamp, self.segment_length)?;
        state.index.push(next_id, timestamp);
        state.last_len = 0;
        state.last_count = 0;
        state.active = Some(segment);
        Ok(())
    }

    fn schedule_sync(self: &Arc<Self>, interval: Duration) -> TaskHandle {
        let weak = Arc::downgrade(self);
        self.timer.schedule(
            interval,
            Box::new(move || {
                let Some(buffer) = weak.upgrade() else {
                    return;
                };
                // Clear the pending flag first so the next append can
                // reschedule.
                if let Ok(mut state) = buffer.state.lock() {
                    state.sync_pending = false;
                    state.sync_task = None;
                }
                match buffer.sync() {
                    Ok(()) | Err(Error::Closed) => {}
                    Err(err) => warn!("scheduled sync failed: {err}"),
                }
            }),
        )
    }

    fn spawn_cleanup(self: &Arc<Self>) -> Result<()> {
        match &self.executor {
            Some(executor) => {
                let weak = Arc::downgrade(self);
                executor.execute(Box::new(move || {
                    let Some(buffer) = weak.upgrade() else {
                        return;
                    };
                    if let Err(err) = buffer.cleanup() {
                        error!("ring cleanup failed: {err}");
                    }
                }));
                Ok(())
            }
            None => self.cleanup().map(|_| ()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BufferState>> {
        self.state
            .lock()
            .map_err(|_| Error::Corrupt("buffer lock poisoned"))
    }
}

impl Drop for MessageBuffer {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn resolve_sizes(config: &BufferConfig) -> Result<(usize, usize)> {
    let segment_length = if config.segment_length > 0 {
        config.segment_length
    } else {
        let max_payload = if config.max_payload_size > 0 {
            config.max_payload_size as u64
        } else {
            DEFAULT_MAX_PAYLOAD_SIZE as u64
        };
        (config.max_size / config.segment_count as u64)
            .max(max_payload + SEGMENT_RESERVE)
            .min(MAX_SEGMENT_LEN)
    };
    let segment_length = validate_segment_len(segment_length)?;

    let max_payload = if config.max_payload_size > 0 {
        config.max_payload_size
    } else {
        segment_length
            .checked_sub(SEGMENT_RESERVE as usize)
            .ok_or(Error::InvalidArgument("segment length too small"))?
    };
    if max_payload as u64 + SEGMENT_RESERVE > segment_length as u64 {
        return Err(Error::InvalidArgument(
            "max payload size does not fit the segment length",
        ));
    }
    Ok((segment_length, max_payload))
}
