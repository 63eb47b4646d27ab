//! Event Processor
//!
//! Consumes the event stream of one bus shard. A processor runs either
//! threaded (its own worker draining a queue, or polling the bus's
//! [`QueueingEventCollector`]) or reentrant (inline on the thread that
//! delivers the event).
//!
//! Reentrant processing splits work across two reentrant locks so that
//! transmit-side bookkeeping (peer and global backlog, receipts) does not
//! wait behind inbound message handling. Lock order is always receive then
//! transmit.

use crate::error::{BenchError, Result};
use crate::message::{consume_payload, MessageFactory, MessageHeader};
use crate::relay::RelayLedger;
use crate::stats::{ErrorCounter, ProcessorStats};
use crate::throttle::RateThrottle;
use crate::transmitter::Correlator;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use exabus::{
    notifier, AnyBus, BusKind, EndPoint, Event, EventType, FlowControl, FlowSignal, QueueingEventCollector, Shard,
    WeakBus,
};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const IDLE_WAIT: Duration = Duration::from_millis(100);

/// State shared by every processor and transmitter of one bus
pub struct BusContext {
    bus: WeakBus,
    local: EndPoint,
    kind: BusKind,
    pub flow: Arc<FlowControl>,
    pub targets: Vec<EndPoint>,
    pub correlators: Vec<Arc<Correlator>>,
    pub factory: Arc<MessageFactory>,
    pub ledger: Arc<RelayLedger>,
    pub errors: Arc<ErrorCounter>,
    relay_cursor: AtomicUsize,
}

impl BusContext {
    pub fn new(
        bus: &AnyBus,
        flow: Arc<FlowControl>,
        targets: Vec<EndPoint>,
        correlators: Vec<Arc<Correlator>>,
        factory: Arc<MessageFactory>,
        ledger: Arc<RelayLedger>,
        errors: Arc<ErrorCounter>,
    ) -> Self {
        Self {
            bus: bus.downgrade(),
            local: bus.local_endpoint().clone(),
            kind: bus.kind(),
            flow,
            targets,
            correlators,
            factory,
            ledger,
            errors,
            relay_cursor: AtomicUsize::new(0),
        }
    }

    pub fn local(&self) -> &EndPoint {
        &self.local
    }

    pub fn kind(&self) -> BusKind {
        self.kind
    }

    pub fn bus(&self) -> Option<AnyBus> {
        self.bus.upgrade()
    }

    fn next_relay_target(&self) -> Option<&EndPoint> {
        if self.targets.is_empty() {
            return None;
        }
        let index = self.relay_cursor.fetch_add(1, Ordering::Relaxed);
        self.targets.get(index % self.targets.len())
    }
}

/// Processor options resolved from the workload configuration
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub relay: bool,
    pub blocking: bool,
    /// Flush the bus after this many response-producing events
    pub flush_on: u64,
    pub chunk_size: usize,
    pub single_use: bool,
    /// Inbound rate target in bytes per second
    pub rx_rate: Option<u64>,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            relay: false,
            blocking: false,
            flush_on: 1,
            chunk_size: 0,
            single_use: false,
            rx_rate: None,
        }
    }
}

/// Where a threaded processor takes its events from
pub enum EventSource {
    /// A queue fed by [`EventProcessor::add`]
    Queue,
    /// The bus's polled collector
    Polled(Arc<QueueingEventCollector>),
}

enum Dispatch {
    Reentrant,
    Queue(Sender<Event>),
    Polled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockClass {
    Receive,
    Transmit,
    Both,
}

pub struct EventProcessor {
    index: usize,
    context: Arc<BusContext>,
    settings: ProcessorSettings,
    stats: Arc<ProcessorStats>,
    dispatch: OnceCell<Dispatch>,
    failure: Mutex<Option<BenchError>>,
    failed: AtomicBool,
    rx_lock: ReentrantMutex<()>,
    tx_lock: ReentrantMutex<()>,
}

impl EventProcessor {
    pub fn new(index: usize, context: Arc<BusContext>, settings: ProcessorSettings) -> Self {
        Self {
            index,
            context,
            settings,
            stats: Arc::new(ProcessorStats::new()),
            dispatch: OnceCell::new(),
            failure: Mutex::new(None),
            failed: AtomicBool::new(false),
            rx_lock: ReentrantMutex::new(()),
            tx_lock: ReentrantMutex::new(()),
        }
    }

    pub fn stats(&self) -> &Arc<ProcessorStats> {
        &self.stats
    }

    pub fn context(&self) -> &Arc<BusContext> {
        &self.context
    }

    /// First fatal error observed, if any
    pub fn failure(&self) -> Option<BenchError> {
        self.failure.lock().clone()
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Process events inline on the delivering thread
    pub fn start_reentrant(&self) -> Result<()> {
        self.dispatch
            .set(Dispatch::Reentrant)
            .map_err(|_| BenchError::config("processor already started", None))
    }

    /// Spawn the worker thread
    pub fn start_threaded(self: &Arc<Self>, source: EventSource, stop: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        let name = format!("exabus-rx-{}-{}", self.context.local.address(), self.index);
        let spawn = |body: Box<dyn FnOnce() + Send>| {
            thread::Builder::new()
                .name(name.clone())
                .spawn(body)
                .map_err(|e| BenchError::config(format!("cannot spawn {}: {}", name, e), None))
        };

        match source {
            EventSource::Queue => {
                let (tx, rx) = crossbeam_channel::unbounded();
                self.dispatch
                    .set(Dispatch::Queue(tx))
                    .map_err(|_| BenchError::config("processor already started", None))?;
                let processor = self.clone();
                spawn(Box::new(move || processor.run_queue(rx, stop)))
            }
            EventSource::Polled(collector) => {
                self.dispatch
                    .set(Dispatch::Polled)
                    .map_err(|_| BenchError::config("processor already started", None))?;
                let processor = self.clone();
                spawn(Box::new(move || processor.run_polled(collector, stop)))
            }
        }
    }

    /// Accept an event from the collector. Returns `true` when the bus
    /// should be flushed.
    pub fn dispatch(&self, event: Event) -> bool {
        if self.has_failed() {
            return false;
        }
        match self.dispatch.get() {
            Some(Dispatch::Reentrant) => self.handle_reentrant(event),
            Some(Dispatch::Queue(tx)) => {
                // The receiver only goes away when the worker has exited
                let _ = tx.send(event);
                false
            }
            Some(Dispatch::Polled) | None => {
                debug!(kind = %event.kind(), "Event before processor start, disposing");
                false
            }
        }
    }

    fn run_queue(&self, rx: Receiver<Event>, stop: Arc<AtomicBool>) {
        let mut worker = Worker::new(self);
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    if !worker.process(event) {
                        break;
                    }
                    continue;
                }
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            worker.idle();
            if stop.load(Ordering::Acquire) {
                break;
            }
            match rx.recv_timeout(IDLE_WAIT) {
                Ok(event) => {
                    if !worker.process(event) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        worker.idle();
        debug!(processor = self.index, local = %self.context.local, "Processor stopped");
    }

    fn run_polled(&self, collector: Arc<QueueingEventCollector>, stop: Arc<AtomicBool>) {
        let mut worker = Worker::new(self);
        loop {
            match collector.poll_timeout(Some(Duration::ZERO)) {
                Ok(Some(event)) => {
                    if !worker.process(event) {
                        break;
                    }
                    continue;
                }
                Ok(None) => {}
                Err(error) => {
                    debug!(%error, "Polling ended");
                    break;
                }
            }

            worker.idle();
            if stop.load(Ordering::Acquire) {
                break;
            }
            match collector.poll_timeout(Some(IDLE_WAIT)) {
                Ok(Some(event)) => {
                    if !worker.process(event) {
                        break;
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    debug!(%error, "Polling ended");
                    break;
                }
            }
        }
        worker.idle();
        debug!(processor = self.index, local = %self.context.local, "Processor stopped");
    }

    fn lock_class(&self, event: &Event) -> LockClass {
        match event.kind() {
            EventType::Message => LockClass::Receive,
            EventType::Receipt => LockClass::Transmit,
            kind if kind.is_backlog() => {
                if event.endpoint() == Some(&self.context.local) {
                    LockClass::Receive
                } else {
                    LockClass::Transmit
                }
            }
            _ => LockClass::Both,
        }
    }

    fn handle_reentrant(&self, event: Event) -> bool {
        let class = self.lock_class(&event);
        let _rx = matches!(class, LockClass::Receive | LockClass::Both).then(|| self.rx_lock.lock());
        let _tx = matches!(class, LockClass::Transmit | LockClass::Both).then(|| self.tx_lock.lock());
        self.handle(event)
    }

    /// Run one event, recording fatal failures. Returns whether a response
    /// was produced.
    fn handle(&self, event: Event) -> bool {
        if self.has_failed() {
            return false;
        }
        match self.on_event(event) {
            Ok(responded) => responded,
            Err(error) if error.is_fatal() => {
                error!(processor = self.index, local = %self.context.local, %error, "Processor failed");
                self.context.errors.record(error.category());
                self.failure.lock().get_or_insert(error);
                self.failed.store(true, Ordering::Release);
                false
            }
            Err(error) => {
                debug!(%error, "Recoverable processing error");
                self.context.errors.record(error.category());
                false
            }
        }
    }

    fn on_event(&self, event: Event) -> Result<bool> {
        let kind = event.kind();
        match kind {
            EventType::Open => info!(local = %self.context.local, "Bus opened"),
            EventType::Close => info!(local = %self.context.local, "Bus closed"),
            EventType::Connect => {
                self.stats.connections.fetch_add(1, Ordering::Relaxed);
                if !self.settings.single_use {
                    debug!(local = %self.context.local, peer = ?event.endpoint(), "Connected");
                }
                self.apply_flow(kind, event.endpoint())?;
            }
            EventType::BacklogExcessive | EventType::BacklogNormal => {
                self.apply_flow(kind, event.endpoint())?;
            }
            EventType::Disconnect => {
                if let Some(peer) = event.endpoint() {
                    if !self.settings.single_use {
                        debug!(local = %self.context.local, %peer, cause = ?event.failure(), "Disconnected");
                    }
                    // Release before readiness changes so a reconnect sees the old link gone
                    if let Some(bus) = self.context.bus() {
                        if let Err(error) = bus.release(peer) {
                            warn!(%peer, %error, "Release after disconnect failed");
                        }
                    }
                }
                self.apply_flow(kind, event.endpoint())?;
            }
            EventType::Release => {
                self.stats.connections.fetch_sub(1, Ordering::Relaxed);
                self.apply_flow(kind, event.endpoint())?;
            }
            EventType::Message => return self.on_message(event),
            EventType::Receipt => self.on_receipt(event),
        }
        Ok(false)
    }

    fn apply_flow(&self, kind: EventType, endpoint: Option<&EndPoint>) -> Result<()> {
        match self.context.flow.on_event(kind, endpoint)? {
            FlowSignal::LocalExcessive => {
                self.stats.local_backlog_events.fetch_add(1, Ordering::Relaxed);
            }
            FlowSignal::LocalNormal(duration) => {
                self.stats
                    .local_backlog_nanos
                    .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
            }
            FlowSignal::GlobalExcessive | FlowSignal::PeerExcessive(_) => {
                self.stats.remote_backlog_events.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        Ok(())
    }

    fn on_receipt(&self, event: Event) {
        if let Some(receipt) = event.as_receipt() {
            let latency = receipt.has_timestamp().then(|| {
                let completed = event.stamp_nanos().unwrap_or_else(exabus::clock::now_nanos);
                completed.saturating_sub(receipt.timestamp_nanos()).max(0) as u64
            });
            self.stats.record_receipt(latency);
            // A memory operation's receipt is its response
            if let (BusKind::Memory, Some(nanos)) = (self.context.kind, latency) {
                self.stats.record_latency_sample(nanos);
            }
        }
        event.dispose();
    }

    fn on_message(&self, event: Event) -> Result<bool> {
        let len = event.message_len();
        let sender = match event.endpoint() {
            Some(sender) => sender.clone(),
            None => return Err(BenchError::header("message without sender")),
        };

        // Memory buses deliver 8-byte signals rather than workload messages
        if self.context.kind == BusKind::Memory {
            self.stats.record_in(len);
            event.dispose();
            return Ok(false);
        }

        let header = match event.sequence() {
            Some(sequence) => {
                let header = MessageHeader::decode(sequence)?;
                header.validate(len)?;
                consume_payload(sequence, self.settings.chunk_size);
                header
            }
            None => return Err(BenchError::header("message without content")),
        };
        self.stats.record_in(len);
        event.dispose();

        if header.response {
            return self.on_response(&header);
        }

        if self.settings.relay && !self.context.flow.is_target(&sender) {
            if let Some(peer) = self.context.next_relay_target().cloned() {
                if header.timestamp != 0 && self.settings.blocking {
                    let relay_id = self.context.ledger.register(sender, header.id);
                    self.send(&peer, relay_id, false, header.timestamp)?;
                } else {
                    // Downstream answers timestamped requests back to this relay
                    self.send(&peer, header.id, false, header.timestamp)?;
                    if header.timestamp != 0 {
                        self.send(&sender, header.id, true, header.timestamp)?;
                    }
                }
                return Ok(true);
            }
        }

        if header.timestamp != 0 {
            self.send(&sender, header.id, true, header.timestamp)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn on_response(&self, header: &MessageHeader) -> Result<bool> {
        if self.settings.relay && self.settings.blocking {
            return match self.context.ledger.complete(header.id) {
                Some(entry) => {
                    self.send(&entry.origin, entry.origin_id, true, header.timestamp)?;
                    Ok(true)
                }
                None => {
                    warn!(relay_id = header.id, "Response for unknown relay entry");
                    self.context.errors.record("relay_unknown");
                    Ok(false)
                }
            };
        }

        let latency = (header.timestamp > 0).then(|| exabus::clock::elapsed_since(header.timestamp));
        self.stats.record_response(latency);

        if self.settings.blocking {
            let index = header.sender_index();
            match self.context.correlators.get(index) {
                Some(correlator) => correlator.signal_result(header.sequence())?,
                None => {
                    return Err(BenchError::header(format!(
                        "response for unknown transmitter {}",
                        index
                    )))
                }
            }
        }
        Ok(false)
    }

    /// Send a workload message; a peer released concurrently is counted
    fn send(&self, peer: &EndPoint, id: i32, response: bool, timestamp: i64) -> Result<()> {
        let bus = match self.context.bus() {
            Some(bus) => bus,
            None => return Ok(()),
        };
        let message_bus = bus
            .as_message()
            .ok_or_else(|| BenchError::config("responses require a message bus", None))?;

        let message = self.context.factory.build(id, response, timestamp)?;
        let len = message.len();
        match message_bus.send(peer, message, None) {
            Ok(()) => {
                self.stats.record_out(len);
                Ok(())
            }
            Err(rejected) => {
                let error = rejected.into_error();
                if error.is_benign_race() {
                    debug!(%peer, %error, "Send raced with peer release");
                    self.context.errors.record(error.category());
                    Ok(())
                } else {
                    Err(error.into())
                }
            }
        }
    }
}

impl Shard for EventProcessor {
    fn add(&self, event: Event) -> bool {
        self.dispatch(event)
    }
}

/// Per-thread loop state for threaded processors
struct Worker<'a> {
    processor: &'a EventProcessor,
    pending_flushes: u64,
    throttle: Option<RateThrottle>,
}

impl<'a> Worker<'a> {
    fn new(processor: &'a EventProcessor) -> Self {
        Self {
            processor,
            pending_flushes: 0,
            throttle: processor.settings.rx_rate.map(RateThrottle::for_receive),
        }
    }

    /// Returns `false` once the processor has failed
    fn process(&mut self, event: Event) -> bool {
        let inbound = (event.kind() == EventType::Message).then(|| event.message_len());

        if self.processor.handle(event) {
            self.pending_flushes += 1;
            if self.pending_flushes >= self.processor.settings.flush_on.max(1) {
                self.flush();
            }
        }

        if let (Some(throttle), Some(bytes)) = (self.throttle.as_mut(), inbound) {
            if let Some(pause) = throttle.record(bytes) {
                self.flush();
                thread::sleep(pause);
            }
        }
        !self.processor.has_failed()
    }

    fn flush(&mut self) {
        self.pending_flushes = 0;
        if let Some(bus) = self.processor.context.bus() {
            bus.flush();
        }
        notifier::flush();
    }

    fn idle(&mut self) {
        if self.pending_flushes > 0 {
            self.flush();
        } else {
            notifier::flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{request_id, SizeRange, HEADER_SIZE};
    use crate::relay::RelayLedger;
    use exabus::{BufferSequence, Bus, Depot, DepotConfig, HeapBufferManager, MessageBus, Receipt};

    struct Fixture {
        _depot: Arc<Depot>,
        bus: AnyBus,
        peer: Arc<dyn MessageBus>,
        peer_events: Arc<QueueingEventCollector>,
        processor: Arc<EventProcessor>,
        correlator: Arc<Correlator>,
    }

    fn next(collector: &QueueingEventCollector) -> Event {
        collector
            .poll_timeout(Some(Duration::from_secs(2)))
            .unwrap()
            .expect("event expected")
    }

    fn factory(size: usize) -> Arc<MessageFactory> {
        Arc::new(MessageFactory::new(
            SizeRange::fixed(size),
            0,
            Arc::new(HeapBufferManager::new()),
            Arc::new(ErrorCounter::new()),
            Arc::new(AtomicBool::new(false)),
        ))
    }

    /// A reentrant processor on `lb://proc`, connected to a polled `lb://peer`
    fn fixture(settings: ProcessorSettings) -> Fixture {
        let depot = Depot::from_config(&DepotConfig::default()).unwrap();
        let local = depot.resolve_endpoint("lb://proc").unwrap();
        let peer_ep = depot.resolve_endpoint("lb://peer").unwrap();

        let peer = depot.create_message_bus(Some(&peer_ep)).unwrap();
        let peer_events = Arc::new(QueueingEventCollector::new());
        peer.set_event_collector(peer_events.clone()).unwrap();
        peer.open().unwrap();
        assert_eq!(next(&peer_events).kind(), EventType::Open);

        let bus = depot.create_bus(Some(&local), BusKind::Message).unwrap();
        let errors = Arc::new(ErrorCounter::new());
        let correlator = Arc::new(Correlator::new(Duration::ZERO));
        let flow = Arc::new(FlowControl::new(local.clone(), [peer_ep.clone()], true));
        let context = Arc::new(BusContext::new(
            &bus,
            flow,
            vec![peer_ep.clone()],
            vec![correlator.clone()],
            factory(64),
            Arc::new(RelayLedger::new(16, Duration::from_secs(30), errors.clone())),
            errors,
        ));
        let processor = Arc::new(EventProcessor::new(0, context, settings));
        processor.start_reentrant().unwrap();

        let demux = Arc::new(exabus::DemultiplexingCollector::new(vec![processor.clone()]).unwrap());
        bus.set_event_collector(demux.clone()).unwrap();
        demux.set_bus(&bus);
        bus.open().unwrap();
        bus.connect(&peer_ep).unwrap();
        assert_eq!(next(&peer_events).kind(), EventType::Connect);

        Fixture {
            _depot: depot,
            bus,
            peer,
            peer_events,
            processor,
            correlator,
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(std::time::Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_timestamped_request_gets_response() {
        let f = fixture(ProcessorSettings::default());
        let local = f.bus.local_endpoint().clone();
        let request = factory(100).build(request_id(5, 2), false, 42).unwrap();
        f.peer.send(&local, request, None).unwrap();

        let response = next(&f.peer_events);
        assert_eq!(response.kind(), EventType::Message);
        let header = MessageHeader::decode(response.sequence().unwrap()).unwrap();
        assert!(header.response);
        assert_eq!(header.id, request_id(5, 2));
        assert_eq!(header.timestamp, 42);
        assert_eq!(response.message_len(), 64);

        let stats = f.processor.stats();
        wait_for(|| stats.messages_out.load(Ordering::Relaxed) == 1);
        assert_eq!(stats.messages_in.load(Ordering::Relaxed), 1);
        assert_eq!(stats.bytes_in.load(Ordering::Relaxed), 100);
        assert_eq!(stats.connections.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_untimed_request_is_only_counted() {
        let f = fixture(ProcessorSettings::default());
        let local = f.bus.local_endpoint().clone();
        f.peer
            .send(&local, factory(HEADER_SIZE).build(1, false, 0).unwrap(), Some(Receipt::untimed()))
            .unwrap();

        // The receipt proves the processor disposed the message
        assert_eq!(next(&f.peer_events).kind(), EventType::Receipt);
        assert_eq!(f.processor.stats().messages_out.load(Ordering::Relaxed), 0);
        assert!(f.peer_events.is_empty());
    }

    #[test]
    fn test_truncated_message_fails_processor() {
        let f = fixture(ProcessorSettings::default());
        let local = f.bus.local_endpoint().clone();
        let bytes = factory(HEADER_SIZE + 1024).build(1, false, 7).unwrap().to_bytes();
        f.peer
            .send(&local, BufferSequence::from_bytes(bytes.slice(..bytes.len() - 1)), None)
            .unwrap();

        wait_for(|| f.processor.has_failed());
        assert!(matches!(f.processor.failure(), Some(BenchError::Header { .. })));
        assert_eq!(f.processor.context().errors.count("header"), 1);
    }

    #[test]
    fn test_blocking_response_signals_correlator() {
        let f = fixture(ProcessorSettings {
            blocking: true,
            ..ProcessorSettings::default()
        });
        let local = f.bus.local_endpoint().clone();
        f.correlator.expect();
        let response = factory(64).build(request_id(9, 0), true, exabus::clock::now_nanos()).unwrap();
        f.peer.send(&local, response, None).unwrap();

        let stop = AtomicBool::new(false);
        assert_eq!(f.correlator.await_result(&stop), Some(9));
        let stats = f.processor.stats();
        wait_for(|| stats.responses_in.load(Ordering::Relaxed) == 1);
        assert_eq!(stats.response_samples.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_unexpected_response_is_a_disposal_violation() {
        let f = fixture(ProcessorSettings {
            blocking: true,
            ..ProcessorSettings::default()
        });
        let local = f.bus.local_endpoint().clone();
        f.peer
            .send(&local, factory(64).build(request_id(1, 0), true, -1).unwrap(), None)
            .unwrap();
        wait_for(|| f.processor.has_failed());
        assert!(matches!(f.processor.failure(), Some(BenchError::Disposal { .. })));
    }

    #[test]
    fn test_disconnect_releases_peer() {
        let f = fixture(ProcessorSettings::default());
        let peer_ep = f.peer.local_endpoint().clone();
        wait_for(|| f.processor.context().flow.ready().contains(&peer_ep));

        f.peer.disconnect(f.bus.local_endpoint()).unwrap();
        wait_for(|| f.processor.stats().connections.load(Ordering::Relaxed) == 0);
        assert!(!f.processor.context().flow.ready().contains(&peer_ep));
    }
}
