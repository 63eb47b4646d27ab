//! Buffer Sequences and Buffer Managers
//!
//! A [`BufferSequence`] is the ordered list of byte segments that forms one
//! message. Segments may come from a [`BufferManager`] pool, in which case
//! dropping the sequence hands them back; one-shot heap segments are simply
//! freed. Sequences are owned by exactly one party at a time: the sender until
//! the send, then the transport (or the receiver it hands the data to).

use crate::error::{BusError, Result};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of message segments
pub trait BufferManager: Send + Sync + fmt::Debug {
    /// Acquire an empty segment. The returned capacity is at least one byte
    /// and at most the manager's segment limit; callers fill as much as they
    /// need and acquire again for the remainder.
    fn acquire(&self, size_hint: usize) -> Result<BytesMut>;

    /// Return a segment previously handed out by [`BufferManager::acquire`]
    fn release(&self, segment: Bytes);

    /// Short manager name used in logs and reports
    fn name(&self) -> &'static str;
}

/// One-shot heap allocation
#[derive(Debug, Default)]
pub struct HeapBufferManager {
    max_segment: Option<usize>,
}

impl HeapBufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split messages into segments of at most `max_segment` bytes
    pub fn with_max_segment(max_segment: usize) -> Self {
        Self {
            max_segment: Some(max_segment.max(1)),
        }
    }
}

impl BufferManager for HeapBufferManager {
    fn acquire(&self, size_hint: usize) -> Result<BytesMut> {
        let size = match self.max_segment {
            Some(max) => size_hint.clamp(1, max),
            None => size_hint.max(1),
        };
        Ok(BytesMut::with_capacity(size))
    }

    fn release(&self, _segment: Bytes) {}

    fn name(&self) -> &'static str {
        "heap"
    }
}

/// Fixed-size segment pool with an outstanding byte ceiling.
///
/// Exhaustion is reported as [`BusError::ResourceExhausted`] so that message
/// builders can yield and retry.
#[derive(Debug)]
pub struct PooledBufferManager {
    segment_size: usize,
    max_segments: usize,
    state: Mutex<PoolState>,
    exhausted: AtomicU64,
}

#[derive(Debug, Default)]
struct PoolState {
    free: Vec<BytesMut>,
    outstanding: usize,
}

impl PooledBufferManager {
    pub fn new(segment_size: usize, max_bytes: usize) -> Self {
        let segment_size = segment_size.max(1);
        Self {
            segment_size,
            max_segments: (max_bytes / segment_size).max(1),
            state: Mutex::new(PoolState::default()),
            exhausted: AtomicU64::new(0),
        }
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Segments currently held by callers
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Number of acquisitions refused because the ceiling was reached
    pub fn exhausted_count(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }
}

impl BufferManager for PooledBufferManager {
    fn acquire(&self, _size_hint: usize) -> Result<BytesMut> {
        let mut state = self.state.lock();
        if state.outstanding >= self.max_segments {
            drop(state);
            self.exhausted.fetch_add(1, Ordering::Relaxed);
            return Err(BusError::resource_exhausted(
                "buffers",
                format!("{} segments of {} bytes outstanding", self.max_segments, self.segment_size),
            ));
        }
        state.outstanding += 1;
        Ok(state
            .free
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.segment_size)))
    }

    fn release(&self, segment: Bytes) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        // Shared segments stay with their other owners
        if let Ok(mut reclaimed) = segment.try_into_mut() {
            if reclaimed.capacity() >= self.segment_size && state.free.len() < self.max_segments {
                reclaimed.clear();
                state.free.push(reclaimed);
            }
        }
    }

    fn name(&self) -> &'static str {
        "pooled"
    }
}

/// Buffer manager selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BufferManagerKind {
    #[default]
    Heap,
    Pooled,
}

/// Buffer manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub manager: BufferManagerKind,
    /// Segment size used to split messages
    pub segment_size: usize,
    /// Outstanding byte ceiling for the pooled manager
    pub max_pooled_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            manager: BufferManagerKind::Heap,
            segment_size: 64 * 1024,
            max_pooled_bytes: 256 * 1024 * 1024,
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.segment_size == 0 {
            return Err(BusError::configuration("must be positive", Some("segment_size")));
        }
        if self.manager == BufferManagerKind::Pooled && self.max_pooled_bytes < self.segment_size {
            return Err(BusError::configuration(
                "must hold at least one segment",
                Some("max_pooled_bytes"),
            ));
        }
        Ok(())
    }

    /// Largest message the pooled manager can hold at once, `None` when unbounded
    pub fn pooled_capacity(&self) -> Option<usize> {
        match self.manager {
            BufferManagerKind::Heap => None,
            BufferManagerKind::Pooled => {
                let segment_size = self.segment_size.max(1);
                Some((self.max_pooled_bytes / segment_size).max(1) * segment_size)
            }
        }
    }

    pub fn build(&self) -> Result<Arc<dyn BufferManager>> {
        self.validate()?;
        Ok(match self.manager {
            BufferManagerKind::Heap => Arc::new(HeapBufferManager::with_max_segment(self.segment_size)),
            BufferManagerKind::Pooled => {
                Arc::new(PooledBufferManager::new(self.segment_size, self.max_pooled_bytes))
            }
        })
    }
}

/// Ordered list of segments forming one logical message
#[derive(Default)]
pub struct BufferSequence {
    segments: Vec<Bytes>,
    manager: Option<Arc<dyn BufferManager>>,
}

impl BufferSequence {
    /// Unmanaged sequence; segments are freed when the last reference drops
    pub fn new(segments: Vec<Bytes>) -> Self {
        Self {
            segments,
            manager: None,
        }
    }

    /// Sequence whose segments return to `manager` on disposal
    pub fn managed(segments: Vec<Bytes>, manager: Arc<dyn BufferManager>) -> Self {
        Self {
            segments,
            manager: Some(manager),
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::new(vec![bytes.into()])
    }

    /// Total byte length across segments
    pub fn len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(Bytes::is_empty)
    }

    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Unmanaged view sharing the same immutable segments
    pub fn share(&self) -> Self {
        Self::new(self.segments.clone())
    }

    /// Copy the leading bytes into `dst`, returning how many were copied
    pub fn copy_prefix(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for segment in &self.segments {
            if copied == dst.len() {
                break;
            }
            let n = segment.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&segment[..n]);
            copied += n;
        }
        copied
    }

    /// Contiguous copy of the whole sequence (zero-copy for one segment)
    pub fn to_bytes(&self) -> Bytes {
        match self.segments.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            many => {
                let mut out = BytesMut::with_capacity(self.len());
                for segment in many {
                    out.extend_from_slice(segment);
                }
                out.freeze()
            }
        }
    }

    /// Release the segments; equivalent to dropping the sequence
    pub fn dispose(self) {}
}

impl Drop for BufferSequence {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.take() {
            for segment in self.segments.drain(..) {
                manager.release(segment);
            }
        }
    }
}

impl fmt::Debug for BufferSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferSequence")
            .field("segments", &self.segments.len())
            .field("len", &self.len())
            .field("manager", &self.manager.as_ref().map(|m| m.name()))
            .finish()
    }
}
