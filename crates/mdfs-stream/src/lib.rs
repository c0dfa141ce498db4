#![forbid(unsafe_code)]
//! Streaming buffer for track contents being recovered from the device.
//!
//! A [`TrackBuffer`] holds the partial payload of one track. The recovery
//! worker appends chunks as they arrive; readers block until their byte
//! threshold is reached or the buffer is sealed. The protocol:
//!
//! - The first reader that observes uninitialized contents claims the fill
//!   (see [`try_claim_fill`](TrackBuffer::try_claim_fill)) and is responsible
//!   for starting the device transfer. Later readers only wait.
//! - [`append`](TrackBuffer::append) and
//!   [`mark_complete`](TrackBuffer::mark_complete) wake all waiters whose
//!   threshold is now satisfied.
//! - A device failure is surfaced by sealing the buffer with whatever bytes
//!   arrived; readers then drain to EOF.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug)]
struct BufferState {
    /// `None` until the fill is claimed; append-only afterwards.
    contents: Option<Vec<u8>>,
    /// Monotonic false→true.
    complete: bool,
}

/// Partial contents of a single track, shared between one writer and any
/// number of readers.
#[derive(Debug)]
pub struct TrackBuffer {
    state: Mutex<BufferState>,
    condvar: Condvar,
}

/// Outcome of waiting for a byte threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The requested threshold is buffered.
    Ready,
    /// The buffer was sealed below the threshold; reads hit EOF early.
    Complete,
}

impl TrackBuffer {
    /// New, unclaimed buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BufferState {
                contents: None,
                complete: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Buffer pre-filled with `bytes` and already sealed.
    ///
    /// Used for files whose payload is fully in memory (fresh writes, empty
    /// files with no on-disc backing).
    #[must_use]
    pub fn sealed(bytes: Vec<u8>) -> Self {
        Self {
            state: Mutex::new(BufferState {
                contents: Some(bytes),
                complete: true,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Empty, claimed, growable buffer for the write path.
    #[must_use]
    pub fn for_writing() -> Self {
        Self {
            state: Mutex::new(BufferState {
                contents: Some(Vec::new()),
                complete: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Claim responsibility for filling this buffer.
    ///
    /// Returns `true` for exactly one caller over the buffer's lifetime; that
    /// caller must start the device transfer. The check and the
    /// initialization happen under one lock acquisition.
    pub fn try_claim_fill(&self) -> bool {
        let mut state = self.lock();
        if state.contents.is_some() {
            return false;
        }
        state.contents = Some(Vec::new());
        true
    }

    /// Append recovered bytes and wake satisfied waiters.
    pub fn append(&self, bytes: &[u8]) {
        {
            let mut state = self.lock();
            state.contents.get_or_insert_with(Vec::new).extend_from_slice(bytes);
            trace!(
                target: "mdfs::stream",
                appended = bytes.len(),
                total = state.contents.as_ref().map_or(0, Vec::len),
                "append"
            );
        }
        self.condvar.notify_all();
    }

    /// Seal the buffer. All waiters are released.
    pub fn mark_complete(&self) {
        {
            let mut state = self.lock();
            state.complete = true;
        }
        self.condvar.notify_all();
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.lock().complete
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().contents.as_ref().map_or(0, Vec::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until at least `threshold` bytes are buffered or the buffer is
    /// sealed.
    pub fn wait_for(&self, threshold: usize) -> WaitOutcome {
        let mut state = self.lock();
        loop {
            if state.contents.as_ref().map_or(0, Vec::len) >= threshold {
                return WaitOutcome::Ready;
            }
            if state.complete {
                return WaitOutcome::Complete;
            }
            state = self
                .condvar
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Like [`wait_for`](Self::wait_for) with a deadline.
    ///
    /// Returns `None` if the timeout elapsed before resolution; the caller
    /// surfaces an I/O error.
    pub fn wait_for_timeout(&self, threshold: usize, timeout: Duration) -> Option<WaitOutcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.contents.as_ref().map_or(0, Vec::len) >= threshold {
                return Some(WaitOutcome::Ready);
            }
            if state.complete {
                return Some(WaitOutcome::Complete);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (next, result) = self
                .condvar
                .wait_timeout(state, remaining)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = next;
            if result.timed_out() {
                // One more check before giving up.
                if state.contents.as_ref().map_or(0, Vec::len) >= threshold {
                    return Some(WaitOutcome::Ready);
                }
                if state.complete {
                    return Some(WaitOutcome::Complete);
                }
                return None;
            }
        }
    }

    /// Copy up to `length` bytes at `start` out of the buffered prefix.
    ///
    /// May return fewer bytes than requested at EOF. Callers wanting blocking
    /// semantics call [`wait_for`](Self::wait_for) first.
    #[must_use]
    pub fn read_at(&self, start: usize, length: usize) -> Vec<u8> {
        let state = self.lock();
        let Some(contents) = state.contents.as_ref() else {
            return Vec::new();
        };
        if start >= contents.len() {
            return Vec::new();
        }
        let end = start.saturating_add(length).min(contents.len());
        contents[start..end].to_vec()
    }

    /// Write `data` at `offset`, zero-filling any gap, and return the new
    /// total length. Used by the host write path; the buffer must have been
    /// created with [`for_writing`](Self::for_writing).
    pub fn write_at(&self, offset: usize, data: &[u8]) -> usize {
        let mut state = self.lock();
        let contents = state.contents.get_or_insert_with(Vec::new);
        let end = offset + data.len();
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[offset..end].copy_from_slice(data);
        contents.len()
    }

    /// Full copy of the buffered contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().contents.clone().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for TrackBuffer {
    fn default() -> Self {
        Self::new()
    }
}
