//! Event Collectors
//!
//! Buses deliver every event to exactly one [`EventCollector`]. Two
//! strategies are provided:
//!
//! - [`QueueingEventCollector`]: a FIFO the application polls. A transport
//!   may bind a [`BusProcessor`] so that polling drives the transport
//!   directly instead of a dedicated delivery thread.
//! - [`DemultiplexingCollector`]: fans events out to N [`Shard`] workers by
//!   peer identity, so all events for one peer land on one worker.

use crate::bus::{AnyBus, WeakBus};
use crate::endpoint::EndPoint;
use crate::error::{BusError, Result};
use crate::event::{Event, EventType};
use crate::notifier;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Sink for bus events
pub trait EventCollector: Send + Sync {
    /// Accept an event; the collector (or whoever it hands the event to) now
    /// owns its disposal
    fn add(&self, event: Event);

    /// Called by the transport when it has no further events queued
    fn flush(&self);

    /// Offer a transport-driven processor. Returns `true` when the collector
    /// takes over driving the transport, in which case the bus must not
    /// start its own delivery thread.
    fn bind_processor(&self, _processor: Arc<dyn BusProcessor>) -> Result<bool> {
        Ok(false)
    }
}

/// Transport hook for collectors that drive event production themselves
pub trait BusProcessor: Send + Sync {
    /// Produce pending events into the bound collector, waiting up to
    /// `timeout` (forever when `None`) for at least one
    fn poll(&self, timeout: Option<Duration>) -> Result<()>;

    /// Cause an in-flight or the next `poll` to return promptly
    fn cancel(&self);
}

/// FIFO collector with optional transport binding
pub struct QueueingEventCollector {
    tx: Sender<Event>,
    rx: Receiver<Event>,
    processor: OnceCell<Arc<dyn BusProcessor>>,
}

impl QueueingEventCollector {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            processor: OnceCell::new(),
        }
    }

    /// Bind the transport processor; permitted once
    pub fn bind(&self, processor: Arc<dyn BusProcessor>) -> Result<()> {
        self.processor
            .set(processor)
            .map_err(|_| BusError::illegal_state("collector is already bound to a bus processor"))
    }

    pub fn is_bound(&self) -> bool {
        self.processor.get().is_some()
    }

    /// Block until an event is available
    pub fn poll(&self) -> Result<Option<Event>> {
        self.poll_timeout(None)
    }

    /// Wait up to `timeout` for an event; `None` waits indefinitely
    pub fn poll_timeout(&self, timeout: Option<Duration>) -> Result<Option<Event>> {
        match self.processor.get() {
            None => Ok(match timeout {
                None => self.rx.recv().ok(),
                Some(timeout) => match self.rx.recv_timeout(timeout) {
                    Ok(event) => Some(event),
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
                },
            }),
            Some(processor) => {
                if let Ok(event) = self.rx.try_recv() {
                    return Ok(Some(event));
                }
                processor.poll(timeout)?;
                Ok(self.rx.try_recv().ok())
            }
        }
    }

    /// Events queued and not yet polled
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for QueueingEventCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl EventCollector for QueueingEventCollector {
    fn add(&self, event: Event) {
        // Both channel ends live in self, so the send cannot fail
        let _ = self.tx.send(event);
    }

    fn flush(&self) {
        if let Some(processor) = self.processor.get() {
            processor.cancel();
        }
        notifier::flush();
    }

    fn bind_processor(&self, processor: Arc<dyn BusProcessor>) -> Result<bool> {
        self.bind(processor).map(|_| true)
    }
}

/// Worker fed by a [`DemultiplexingCollector`]
pub trait Shard: Send + Sync {
    /// Accept an event; returns `true` when the bus should be flushed on the
    /// collector's next `flush`
    fn add(&self, event: Event) -> bool;
}

/// Fans events out to shards by `hash(endpoint) mod N`
pub struct DemultiplexingCollector<S: Shard> {
    shards: Vec<Arc<S>>,
    received_bytes: Vec<AtomicU64>,
    flush_pending: AtomicBool,
    bus: RwLock<WeakBus>,
}

impl<S: Shard> DemultiplexingCollector<S> {
    pub fn new(shards: Vec<Arc<S>>) -> Result<Self> {
        if shards.is_empty() {
            return Err(BusError::configuration("at least one shard is required", Some("shards")));
        }
        let received_bytes = shards.iter().map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            shards,
            received_bytes,
            flush_pending: AtomicBool::new(false),
            bus: RwLock::new(WeakBus::Detached),
        })
    }

    /// Attach the bus flushed on behalf of the shards
    pub fn set_bus(&self, bus: &AnyBus) {
        *self.bus.write() = bus.downgrade();
    }

    pub fn shards(&self) -> &[Arc<S>] {
        &self.shards
    }

    /// Shard index for an event scope
    pub fn shard_index(&self, endpoint: Option<&EndPoint>) -> usize {
        EndPoint::shard_of(endpoint, self.shards.len())
    }

    /// Total message bytes received across shards
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
            .iter()
            .map(|counter| counter.load(Ordering::Relaxed))
            .sum()
    }

    /// Message bytes received by one shard
    pub fn shard_received_bytes(&self, index: usize) -> u64 {
        self.received_bytes
            .get(index)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl<S: Shard> EventCollector for DemultiplexingCollector<S> {
    fn add(&self, event: Event) {
        let index = self.shard_index(event.endpoint());

        let event = match event.kind() {
            EventType::Receipt if event.as_receipt().is_some_and(|r| r.has_timestamp()) => event.stamp(),
            EventType::Message => {
                self.received_bytes[index].fetch_add(event.message_len() as u64, Ordering::Relaxed);
                event
            }
            _ => event,
        };

        if self.shards[index].add(event) {
            self.flush_pending.store(true, Ordering::Release);
        }
    }

    fn flush(&self) {
        if self.flush_pending.swap(false, Ordering::AcqRel) {
            let bus = self.bus.read().clone();
            match bus.upgrade() {
                Some(bus) => bus.flush(),
                None => debug!("Flush requested with no live bus attached"),
            }
        }
        notifier::flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferSequence;
    use crate::receipt::Receipt;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingShard {
        events: Mutex<Vec<(EventType, Option<EndPoint>, Option<i64>)>>,
        wants_flush: bool,
    }

    impl Shard for RecordingShard {
        fn add(&self, event: Event) -> bool {
            self.events
                .lock()
                .push((event.kind(), event.endpoint().cloned(), event.stamp_nanos()));
            event.dispose();
            self.wants_flush
        }
    }

    struct StubProcessor {
        feed: Sender<Event>,
        polls: AtomicU64,
        cancels: AtomicU64,
    }

    impl BusProcessor for StubProcessor {
        fn poll(&self, _timeout: Option<Duration>) -> Result<()> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let _ = self.feed.send(Event::new(EventType::Open, None));
            Ok(())
        }

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_unbound_poll_is_fifo() {
        let collector = QueueingEventCollector::new();
        collector.add(Event::new(EventType::Open, None));
        collector.add(Event::new(EventType::Close, None));

        assert_eq!(collector.poll().unwrap().unwrap().kind(), EventType::Open);
        assert_eq!(collector.poll().unwrap().unwrap().kind(), EventType::Close);
        assert!(collector
            .poll_timeout(Some(Duration::from_millis(10)))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_bound_poll_drives_processor() {
        let collector = Arc::new(QueueingEventCollector::new());
        let processor = Arc::new(StubProcessor {
            feed: collector.tx.clone(),
            polls: AtomicU64::new(0),
            cancels: AtomicU64::new(0),
        });
        assert!(collector.bind_processor(processor.clone()).unwrap());

        collector.add(Event::new(EventType::Connect, None));
        assert_eq!(collector.poll().unwrap().unwrap().kind(), EventType::Connect);
        assert_eq!(processor.polls.load(Ordering::SeqCst), 0);

        assert_eq!(collector.poll().unwrap().unwrap().kind(), EventType::Open);
        assert_eq!(processor.polls.load(Ordering::SeqCst), 1);

        collector.flush();
        assert_eq!(processor.cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bind_twice_is_illegal() {
        let collector = QueueingEventCollector::new();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let processor = Arc::new(StubProcessor {
            feed: tx,
            polls: AtomicU64::new(0),
            cancels: AtomicU64::new(0),
        });
        collector.bind(processor.clone()).unwrap();
        assert!(matches!(
            collector.bind(processor),
            Err(BusError::IllegalState { .. })
        ));
    }

    #[test]
    fn test_demux_stamps_timed_receipts_and_tallies_bytes() {
        let shards: Vec<_> = (0..4).map(|_| Arc::new(RecordingShard::default())).collect();
        let demux = DemultiplexingCollector::new(shards.clone()).unwrap();
        let peer = EndPoint::parse("lb://peer").unwrap();
        let index = demux.shard_index(Some(&peer));

        demux.add(Event::receipt(peer.clone(), Receipt::new(10)));
        demux.add(Event::receipt(peer.clone(), Receipt::untimed()));
        demux.add(Event::message(peer.clone(), BufferSequence::from_bytes(vec![0u8; 100])));
        demux.add(Event::new(EventType::BacklogExcessive, None));

        {
            let events = shards[index].events.lock();
            assert!(events[0].2.is_some());
            assert!(events[1].2.is_none());
        }
        assert_eq!(demux.received_bytes(), 100);
        assert_eq!(demux.shard_received_bytes(index), 100);
        assert_eq!(shards[0].events.lock().last().unwrap().0, EventType::BacklogExcessive);
    }

    #[test]
    fn test_demux_rejects_empty_shard_set() {
        assert!(DemultiplexingCollector::<RecordingShard>::new(Vec::new()).is_err());
    }
}
