use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffer::MessageBuffer;
use crate::segment::{Message, SegmentCursor};
use crate::waiter::{WaitOutcome, Waiter};
use crate::{Error, Result};

/// Forward cursor over the whole buffer.
///
/// Walks records in ID order, crossing segment boundaries transparently. At
/// the end of the stream [`next`](Self::next) returns `Ok(false)`;
/// [`next_wait`](Self::next_wait) instead blocks until a producer appends,
/// the timeout elapses, or the cursor or buffer is closed.
pub struct MessageCursor {
    buffer: Arc<MessageBuffer>,
    inner: Option<SegmentCursor>,
    waiter: Arc<Waiter>,
    closed: bool,
}

impl MessageCursor {
    pub(crate) fn positioned(buffer: Arc<MessageBuffer>, inner: SegmentCursor) -> Self {
        Self {
            buffer,
            inner: Some(inner),
            waiter: Waiter::new(),
            closed: false,
        }
    }

    /// Cursor over a buffer that had no messages at creation time; it adopts
    /// the ring head once messages arrive.
    pub(crate) fn unpositioned(buffer: Arc<MessageBuffer>) -> Self {
        Self {
            buffer,
            inner: None,
            waiter: Waiter::new(),
            closed: false,
        }
    }

    /// Advances to the next record. `Ok(false)` means the cursor caught up
    /// with the producers.
    pub fn next(&mut self) -> Result<bool> {
        if self.closed {
            return Err(Error::Closed);
        }
        if self.buffer.is_closed()? {
            return Err(Error::Closed);
        }
        if self.inner.is_none() {
            match self.buffer.adopt_head_cursor()? {
                Some(inner) => self.inner = Some(inner),
                None => return Ok(false),
            }
        }
        loop {
            let inner = self.inner.as_mut().ok_or(Error::Corrupt("cursor lost"))?;
            if inner.next()? {
                return Ok(true);
            }
            match self.buffer.advance_cursor(inner)? {
                Some(next_inner) => self.inner = Some(next_inner),
                None => return Ok(false),
            }
        }
    }

    /// Blocking [`next`](Self::next): waits up to `timeout` for a producer
    /// (`None` waits indefinitely).
    ///
    /// Returns `Ok(false)` on timeout. Closing the cursor or the buffer while
    /// a thread waits here surfaces [`Error::Interrupted`].
    pub fn next_wait(&mut self, timeout: Option<Duration>) -> Result<bool> {
        if self.closed {
            return Err(Error::Closed);
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let slot = self.buffer.waiters.register(Arc::clone(&self.waiter))?;
        let result = self.wait_loop(deadline);
        self.buffer.waiters.deregister(slot);
        result
    }

    fn wait_loop(&mut self, deadline: Option<Instant>) -> Result<bool> {
        loop {
            // Consume any pending signal before probing, so an append that
            // lands between the probe and the wait still wakes us.
            self.waiter.clear_signal()?;
            if self.next()? {
                return Ok(true);
            }
            match self.waiter.wait(deadline)? {
                WaitOutcome::Signalled => continue,
                WaitOutcome::TimedOut => return Ok(false),
                WaitOutcome::Interrupted => {
                    if self.buffer.is_closed()? {
                        return Err(Error::Closed);
                    }
                    return Err(Error::Interrupted);
                }
            }
        }
    }

    /// The record the last successful [`next`](Self::next) stopped on.
    pub fn message(&self) -> Option<&Message> {
        self.inner.as_ref().and_then(|inner| inner.current())
    }

    pub fn id(&self) -> Result<u64> {
        Ok(self.current()?.id)
    }

    pub fn timestamp(&self) -> Result<i64> {
        Ok(self.current()?.timestamp)
    }

    pub fn routing_key(&self) -> Result<&str> {
        Ok(&self.current()?.routing_key)
    }

    pub fn payload(&self) -> Result<&[u8]> {
        Ok(&self.current()?.payload)
    }

    pub fn payload_size(&self) -> Result<usize> {
        Ok(self.current()?.payload.len())
    }

    /// Releases the segment handle and wakes any thread blocked in
    /// [`next_wait`](Self::next_wait). Idempotent; dropping the cursor does
    /// the same.
    pub fn close(&mut self) {
        self.closed = true;
        self.inner = None;
        self.waiter.interrupt();
    }

    fn current(&self) -> Result<&Message> {
        self.message()
            .ok_or(Error::InvalidArgument("cursor is not positioned on a record"))
    }
}

impl Drop for MessageCursor {
    fn drop(&mut self) {
        self.close();
    }
}
