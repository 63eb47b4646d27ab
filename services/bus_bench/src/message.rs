//! Workload Message Format
//!
//! Every workload message starts with a fixed 21-byte big-endian header:
//!
//! ```text
//! offset  size  field
//! 0       4     sender id (i32): transmitter index in the low 16 bits,
//!               request sequence in the high 16 bits
//! 4       1     response flag
//! 5       8     timestamp (i64): 0 = no latency sample,
//!               -1 = blocking request without a sample
//! 13      8     payload length (i64)
//! 21      ..    payload
//! ```
//!
//! The [`MessageFactory`] writes headers and payload across segments acquired
//! from the configured [`BufferManager`], retrying with a yield when a
//! pooled manager is exhausted.

use crate::error::{BenchError, Result};
use crate::stats::ErrorCounter;
use bytes::{BufMut, Bytes, BytesMut};
use exabus::{BufferManager, BufferSequence};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

pub const HEADER_SIZE: usize = 21;

/// Timestamp marking a blocking request that carries no latency sample
pub const BLOCKING_NO_SAMPLE: i64 = -1;

const PAYLOAD_FILL: u8 = 0x5a;

/// How long an exhausted buffer manager may refuse segments before the
/// builder gives up
pub const EXHAUSTION_TIMEOUT: Duration = Duration::from_secs(2);

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: i32,
    pub response: bool,
    pub timestamp: i64,
    pub payload_len: i64,
}

impl MessageHeader {
    pub fn new(id: i32, response: bool, timestamp: i64, payload_len: usize) -> Self {
        Self {
            id,
            response,
            timestamp,
            payload_len: payload_len as i64,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.id.to_be_bytes());
        out[4] = self.response as u8;
        out[5..13].copy_from_slice(&self.timestamp.to_be_bytes());
        out[13..21].copy_from_slice(&self.payload_len.to_be_bytes());
        out
    }

    /// Read the header from the front of a sequence
    pub fn decode(sequence: &BufferSequence) -> Result<Self> {
        let mut raw = [0u8; HEADER_SIZE];
        let copied = sequence.copy_prefix(&mut raw);
        if copied < HEADER_SIZE {
            return Err(BenchError::header(format!(
                "message of {} bytes is shorter than the {} byte header",
                copied, HEADER_SIZE
            )));
        }

        let mut word = [0u8; 8];
        let id = i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        word.copy_from_slice(&raw[5..13]);
        let timestamp = i64::from_be_bytes(word);
        word.copy_from_slice(&raw[13..21]);
        let payload_len = i64::from_be_bytes(word);

        Ok(Self {
            id,
            response: raw[4] != 0,
            timestamp,
            payload_len,
        })
    }

    /// Check the declared payload length against the received total
    pub fn validate(&self, total_len: usize) -> Result<()> {
        let actual = total_len.saturating_sub(HEADER_SIZE) as i64;
        if self.payload_len != actual {
            return Err(BenchError::header(format!(
                "declared payload of {} bytes, received {}",
                self.payload_len, actual
            )));
        }
        Ok(())
    }

    /// Transmitter index of a request id
    pub fn sender_index(&self) -> usize {
        (self.id as u32 & 0xFFFF) as usize
    }

    /// Request sequence of a request id
    pub fn sequence(&self) -> u32 {
        self.id as u32 >> 16
    }
}

/// Compose a request id from a transmitter index and a send counter
pub fn request_id(sequence: u64, index: usize) -> i32 {
    (((sequence & 0xFFFF) << 16) as u32 | (index as u32 & 0xFFFF)) as i32
}

/// Inclusive-exclusive message size range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeRange {
    pub min: usize,
    pub max: usize,
}

impl SizeRange {
    pub fn new(min: usize, max: usize) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    pub fn fixed(size: usize) -> Self {
        Self::new(size, size)
    }

    pub fn is_fixed(&self) -> bool {
        self.min == self.max
    }

    pub fn average(&self) -> usize {
        self.max - (self.max - self.min) / 2
    }

    pub fn sample(&self, rng: &mut impl Rng) -> usize {
        if self.is_fixed() {
            self.min
        } else {
            rng.gen_range(self.min..self.max)
        }
    }
}

/// Builds request and response messages
pub struct MessageFactory {
    sizes: SizeRange,
    chunk_size: usize,
    manager: Arc<dyn BufferManager>,
    errors: Arc<ErrorCounter>,
    stop: Arc<AtomicBool>,
    cached_payload: Option<Vec<Bytes>>,
    exhaustion_timeout: Duration,
}

impl MessageFactory {
    pub fn new(
        sizes: SizeRange,
        chunk_size: usize,
        manager: Arc<dyn BufferManager>,
        errors: Arc<ErrorCounter>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            sizes,
            chunk_size,
            manager,
            errors,
            stop,
            cached_payload: None,
            exhaustion_timeout: EXHAUSTION_TIMEOUT,
        }
    }

    pub fn with_exhaustion_timeout(mut self, timeout: Duration) -> Self {
        self.exhaustion_timeout = timeout;
        self
    }

    /// Reuse one immutable payload for every message; requires a fixed size
    pub fn with_cached_payload(mut self) -> Result<Self> {
        if !self.sizes.is_fixed() {
            return Err(BenchError::config("cached messages require a fixed size", Some("cached")));
        }
        let payload_len = self.sizes.min.saturating_sub(HEADER_SIZE);
        let mut payload = BytesMut::with_capacity(payload_len);
        payload.put_bytes(PAYLOAD_FILL, payload_len);
        self.cached_payload = Some(vec![payload.freeze()]);
        Ok(self)
    }

    pub fn sizes(&self) -> SizeRange {
        self.sizes
    }

    pub fn is_cached(&self) -> bool {
        self.cached_payload.is_some()
    }

    /// Build a message with a randomly chosen size
    pub fn build(&self, id: i32, response: bool, timestamp: i64) -> Result<BufferSequence> {
        let size = self.sizes.sample(&mut rand::thread_rng());
        self.build_sized(id, response, timestamp, size)
    }

    pub fn build_sized(&self, id: i32, response: bool, timestamp: i64, size: usize) -> Result<BufferSequence> {
        if let Some(payload) = &self.cached_payload {
            let header = MessageHeader::new(id, response, timestamp, self.sizes.min.saturating_sub(HEADER_SIZE));
            let mut segments = Vec::with_capacity(payload.len() + 1);
            segments.push(Bytes::copy_from_slice(&header.encode()));
            segments.extend(payload.iter().cloned());
            return Ok(BufferSequence::new(segments));
        }

        let size = size.max(HEADER_SIZE);
        let header = MessageHeader::new(id, response, timestamp, size - HEADER_SIZE);
        let mut writer = SegmentWriter::new(self, size);
        writer.put(&header.encode())?;

        let chunk = if self.chunk_size == 0 { size } else { self.chunk_size };
        let mut remaining = size - HEADER_SIZE;
        while remaining > 0 {
            let n = remaining.min(chunk);
            writer.fill(PAYLOAD_FILL, n)?;
            remaining -= n;
        }
        Ok(writer.finish())
    }

    /// Acquire a segment, yielding while the manager is exhausted. A manager
    /// that stays exhausted past the timeout fails the build with its error.
    fn acquire(&self, size_hint: usize) -> Result<BytesMut> {
        let mut exhausted_since: Option<Instant> = None;
        loop {
            match self.manager.acquire(size_hint) {
                Ok(segment) => return Ok(segment),
                Err(error) if error.is_recoverable() => {
                    self.errors.record(error.category());
                    if self.stop.load(Ordering::Acquire) {
                        return Err(BenchError::Stopped);
                    }
                    let since = *exhausted_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= self.exhaustion_timeout {
                        warn!(
                            manager = self.manager.name(),
                            timeout = ?self.exhaustion_timeout,
                            %error,
                            "Buffer manager made no progress"
                        );
                        return Err(error.into());
                    }
                    thread::yield_now();
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}

/// Sequential writer over manager-provided segments. Segments still held
/// when the writer is dropped unfinished go back to the manager.
struct SegmentWriter<'a> {
    factory: &'a MessageFactory,
    segments: Vec<Bytes>,
    current: Option<BytesMut>,
    remaining: usize,
}

impl<'a> SegmentWriter<'a> {
    fn new(factory: &'a MessageFactory, total: usize) -> Self {
        Self {
            factory,
            segments: Vec::new(),
            current: None,
            remaining: total,
        }
    }

    /// Writable space in the current segment, acquiring a new one when full
    fn reserve(&mut self) -> Result<&mut BytesMut> {
        let full = self
            .current
            .as_ref()
            .map_or(true, |segment| segment.capacity() == segment.len());
        if full {
            let next = self.factory.acquire(self.remaining)?;
            if let Some(done) = self.current.replace(next) {
                self.segments.push(done.freeze());
            }
        }
        match self.current.as_mut() {
            Some(segment) => Ok(segment),
            None => Err(BenchError::Stopped),
        }
    }

    fn put(&mut self, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let segment = self.reserve()?;
            let n = (segment.capacity() - segment.len()).min(src.len());
            segment.put_slice(&src[..n]);
            self.remaining -= n;
            src = &src[n..];
        }
        Ok(())
    }

    fn fill(&mut self, byte: u8, mut count: usize) -> Result<()> {
        while count > 0 {
            let segment = self.reserve()?;
            let n = (segment.capacity() - segment.len()).min(count);
            segment.put_bytes(byte, n);
            self.remaining -= n;
            count -= n;
        }
        Ok(())
    }

    fn finish(mut self) -> BufferSequence {
        if let Some(last) = self.current.take() {
            self.segments.push(last.freeze());
        }
        BufferSequence::managed(std::mem::take(&mut self.segments), self.factory.manager.clone())
    }
}

impl Drop for SegmentWriter<'_> {
    fn drop(&mut self) {
        if let Some(partial) = self.current.take() {
            self.segments.push(partial.freeze());
        }
        for segment in self.segments.drain(..) {
            self.factory.manager.release(segment);
        }
    }
}

/// Read the payload in `chunk`-sized pieces, returning a digest of its bytes
pub fn consume_payload(sequence: &BufferSequence, chunk: usize) -> u64 {
    let mut digest = 0u64;
    let mut skip = HEADER_SIZE;
    for segment in sequence.segments() {
        let body = if skip >= segment.len() {
            skip -= segment.len();
            continue;
        } else {
            let body = &segment[skip..];
            skip = 0;
            body
        };
        let step = if chunk == 0 { body.len().max(1) } else { chunk };
        for piece in body.chunks(step) {
            digest = piece
                .iter()
                .fold(digest, |acc, byte| acc.wrapping_mul(31).wrapping_add(*byte as u64));
        }
    }
    std::hint::black_box(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use exabus::{HeapBufferManager, PooledBufferManager};

    fn factory(sizes: SizeRange, chunk: usize, manager: Arc<dyn BufferManager>) -> MessageFactory {
        MessageFactory::new(
            sizes,
            chunk,
            manager,
            Arc::new(ErrorCounter::new()),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn test_header_round_trip_and_truncation() {
        let timestamp = exabus::clock::now_nanos();
        let factory = factory(SizeRange::fixed(HEADER_SIZE + 1024), 100, Arc::new(HeapBufferManager::new()));
        let message = factory.build(0x1234, false, timestamp).unwrap();
        assert_eq!(message.len(), HEADER_SIZE + 1024);

        let header = MessageHeader::decode(&message).unwrap();
        assert_eq!(header, MessageHeader::new(0x1234, false, timestamp, 1024));
        header.validate(message.len()).unwrap();

        let bytes = message.to_bytes();
        let truncated = BufferSequence::from_bytes(bytes.slice(..bytes.len() - 1));
        let header = MessageHeader::decode(&truncated).unwrap();
        assert!(matches!(header.validate(truncated.len()), Err(BenchError::Header { .. })));
    }

    #[test]
    fn test_short_message_rejected() {
        let short = BufferSequence::from_bytes(vec![0u8; HEADER_SIZE - 1]);
        assert!(MessageHeader::decode(&short).is_err());
    }

    #[test]
    fn test_request_id_layout() {
        let id = request_id(0x1_0007, 3);
        let header = MessageHeader::new(id, true, 0, 0);
        assert_eq!(header.sender_index(), 3);
        assert_eq!(header.sequence(), 7);

        let high = MessageHeader::new(request_id(0xFFFF, 0xFFFF), false, 0, 0);
        assert_eq!(high.sender_index(), 0xFFFF);
        assert_eq!(high.sequence(), 0xFFFF);
    }

    #[test]
    fn test_header_spans_small_segments() {
        let factory = factory(SizeRange::fixed(64), 0, Arc::new(HeapBufferManager::with_max_segment(8)));
        let message = factory.build(-7, true, BLOCKING_NO_SAMPLE).unwrap();
        assert!(message.segment_count() > 1);

        let header = MessageHeader::decode(&message).unwrap();
        assert_eq!(header.id, -7);
        assert!(header.response);
        assert_eq!(header.timestamp, BLOCKING_NO_SAMPLE);
        header.validate(message.len()).unwrap();
    }

    #[test]
    fn test_cached_payload_is_shared() {
        let factory = factory(SizeRange::fixed(256), 0, Arc::new(HeapBufferManager::new()))
            .with_cached_payload()
            .unwrap();
        let first = factory.build(1, false, 0).unwrap();
        let second = factory.build(2, false, 5).unwrap();
        assert_eq!(first.segments()[1].as_ptr(), second.segments()[1].as_ptr());
        assert_eq!(MessageHeader::decode(&second).unwrap().timestamp, 5);
        assert_eq!(second.len(), 256);

        let variable = self::factory(SizeRange::new(64, 128), 0, Arc::new(HeapBufferManager::new()));
        assert!(matches!(variable.with_cached_payload(), Err(e) if e.is_configuration()));
    }

    #[test]
    fn test_exhausted_pool_counts_and_stops() {
        let pool = Arc::new(PooledBufferManager::new(32, 32));
        let errors = Arc::new(ErrorCounter::new());
        let stop = Arc::new(AtomicBool::new(true));
        let factory = MessageFactory::new(SizeRange::fixed(64), 0, pool, errors.clone(), stop);

        assert_eq!(factory.build(1, false, 0).unwrap_err(), BenchError::Stopped);
        assert_eq!(errors.count("resource_exhausted"), 1);
    }

    #[test]
    fn test_oversized_message_escalates_exhaustion() {
        let pool = Arc::new(PooledBufferManager::new(1024, 4096));
        let errors = Arc::new(ErrorCounter::new());
        let factory = MessageFactory::new(
            SizeRange::fixed(8192),
            0,
            pool.clone(),
            errors.clone(),
            Arc::new(AtomicBool::new(false)),
        )
        .with_exhaustion_timeout(Duration::from_millis(50));

        let started = Instant::now();
        let error = factory.build(1, false, 0).unwrap_err();
        assert!(matches!(error, BenchError::Bus(ref e) if e.category() == "resource_exhausted"));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(errors.count("resource_exhausted") >= 1);
        // the partial message went back to the pool
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_exhausted_pool_recovers_when_segments_return() {
        let pool = Arc::new(PooledBufferManager::new(256, 512));
        let errors = Arc::new(ErrorCounter::new());
        let factory = factory_with(pool.clone(), errors.clone());

        let held = factory.build(1, false, 0).unwrap();
        let held_too = factory.build(2, false, 0).unwrap();
        assert_eq!(pool.outstanding(), 2);

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            held.dispose();
            held_too.dispose();
        });
        let message = factory.build(3, false, 0).unwrap();
        releaser.join().unwrap();

        assert_eq!(MessageHeader::decode(&message).unwrap().id, 3);
        assert!(errors.count("resource_exhausted") >= 1);
    }

    fn factory_with(pool: Arc<PooledBufferManager>, errors: Arc<ErrorCounter>) -> MessageFactory {
        MessageFactory::new(SizeRange::fixed(256), 0, pool, errors, Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_sizes() {
        let range = SizeRange::new(200, 100);
        assert_eq!((range.min, range.max), (100, 200));
        assert_eq!(range.average(), 150);
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let size = range.sample(&mut rng);
            assert!((100..200).contains(&size));
        }
        assert_eq!(SizeRange::fixed(64).sample(&mut rng), 64);
    }

    #[test]
    fn test_consume_payload_skips_header() {
        let a = factory(SizeRange::fixed(HEADER_SIZE + 50), 7, Arc::new(HeapBufferManager::with_max_segment(16)))
            .build(1, false, 0)
            .unwrap();
        let b = factory(SizeRange::fixed(HEADER_SIZE + 50), 0, Arc::new(HeapBufferManager::new()))
            .build(2, true, 9)
            .unwrap();
        assert_eq!(consume_payload(&a, 7), consume_payload(&b, 0));
    }
}
