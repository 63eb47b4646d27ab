//! In-process loopback transport.
//!
//! Buses created by one [`LoopbackDriver`] share a fabric and can connect to
//! each other by endpoint. Two protocols are served:
//!
//! - `lb://name` message buses
//! - `lbm://name?capacity=N` memory buses exposing an N byte region
//!
//! Every bus owns an inbound queue. Unless its collector binds the bus as a
//! [`BusProcessor`], a delivery thread drains the queue into the collector
//! and flushes the collector whenever the queue runs dry.
//!
//! Backlog is tracked by byte watermarks for three scopes: each peer link and
//! the whole bus on the sending side (bytes sent but not yet disposed by the
//! receiver), and the local endpoint on the receiving side (bytes queued but
//! not yet disposed). Transitions are decided and enqueued under the owning
//! bus's state lock, so each scope's events strictly alternate.

use crate::buffers::BufferSequence;
use crate::bus::{AnyBus, Bus, BusKind, MemoryBus, MessageBus, OpResult, Rejected};
use crate::collector::{BusProcessor, EventCollector};
use crate::driver::{Depot, Driver};
use crate::endpoint::EndPoint;
use crate::error::{BusError, Result};
use crate::event::{Event, EventType};
use crate::receipt::{Garbage, Receipt};
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

pub const MESSAGE_PROTOCOL: &str = "lb";
pub const MEMORY_PROTOCOL: &str = "lbm";

/// Byte watermarks for one backlog scope; `high == 0` disables tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    pub high: usize,
    pub low: usize,
}

impl Watermarks {
    pub const fn new(high: usize, low: usize) -> Self {
        Self { high, low }
    }

    pub const fn disabled() -> Self {
        Self { high: 0, low: 0 }
    }

    pub fn is_enabled(&self) -> bool {
        self.high > 0
    }
}

/// Loopback transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Resolve scheme-less names such as `host:80` as `lb://` endpoints
    pub accept_bare_names: bool,
    /// Per-peer outbound backlog
    pub peer_backlog: Watermarks,
    /// Whole-bus outbound backlog
    pub global_backlog: Watermarks,
    /// Inbound backlog of the local endpoint
    pub local_backlog: Watermarks,
    /// Region size of memory buses without a `capacity` query
    pub default_capacity: usize,
    /// Idle wait of the delivery thread in milliseconds
    pub idle_wait_ms: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            accept_bare_names: true,
            peer_backlog: Watermarks::new(4 * 1024 * 1024, 1024 * 1024),
            global_backlog: Watermarks::new(16 * 1024 * 1024, 4 * 1024 * 1024),
            local_backlog: Watermarks::new(8 * 1024 * 1024, 2 * 1024 * 1024),
            default_capacity: 0,
            idle_wait_ms: 50,
        }
    }
}

impl LoopbackConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, marks) in [
            ("peer_backlog", self.peer_backlog),
            ("global_backlog", self.global_backlog),
            ("local_backlog", self.local_backlog),
        ] {
            if marks.is_enabled() && marks.low >= marks.high {
                return Err(BusError::configuration(
                    format!("low watermark {} must be below high watermark {}", marks.low, marks.high),
                    Some(field),
                ));
            }
        }
        if self.idle_wait_ms == 0 {
            return Err(BusError::configuration("must be positive", Some("idle_wait_ms")));
        }
        Ok(())
    }

    fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }
}

/// Outstanding byte counter with hysteresis
#[derive(Debug)]
struct Gauge {
    marks: Watermarks,
    outstanding: usize,
    excessive: bool,
}

impl Gauge {
    fn new(marks: Watermarks) -> Self {
        Self {
            marks,
            outstanding: 0,
            excessive: false,
        }
    }

    /// Returns `true` on the transition into excessive
    fn add(&mut self, bytes: usize) -> bool {
        self.outstanding += bytes;
        if self.marks.is_enabled() && !self.excessive && self.outstanding >= self.marks.high {
            self.excessive = true;
            return true;
        }
        false
    }

    /// Returns `true` on the transition back to normal
    fn sub(&mut self, bytes: usize) -> bool {
        self.outstanding = self.outstanding.saturating_sub(bytes);
        if self.excessive && self.outstanding <= self.marks.low {
            self.excessive = false;
            return true;
        }
        false
    }
}

#[derive(Debug)]
struct Link {
    id: u64,
    connected: bool,
    gauge: Gauge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Open,
    Closed,
}

#[derive(Debug)]
struct CoreState {
    phase: Phase,
    links: HashMap<EndPoint, Link>,
    global: Gauge,
    local: Gauge,
}

/// Buses reachable through one driver
#[derive(Default)]
struct Fabric {
    buses: DashMap<EndPoint, Weak<Core>>,
    next_link: AtomicU64,
}

impl Fabric {
    fn register(&self, core: &Arc<Core>) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.buses.entry(core.local.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().upgrade().is_some_and(|existing| !existing.is_closed()) {
                    return Err(BusError::AddressInUse {
                        endpoint: core.local.to_string(),
                    });
                }
                entry.insert(Arc::downgrade(core));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::downgrade(core));
            }
        }
        Ok(())
    }

    fn unregister(&self, core: &Core) {
        self.buses
            .remove_if(&core.local, |_, weak| std::ptr::eq(weak.as_ptr(), core));
    }

    fn lookup(&self, endpoint: &EndPoint) -> Option<Arc<Core>> {
        self.buses.get(endpoint).and_then(|weak| weak.upgrade())
    }

    fn next_link_id(&self) -> u64 {
        self.next_link.fetch_add(1, Ordering::Relaxed)
    }
}

/// Shared state behind both bus flavours
struct Core {
    local: EndPoint,
    kind: BusKind,
    config: LoopbackConfig,
    fabric: Arc<Fabric>,
    state: Mutex<CoreState>,
    collector: RwLock<Option<Arc<dyn EventCollector>>>,
    inbound_tx: Sender<Event>,
    inbound_rx: Receiver<Event>,
    region: Option<Mutex<Vec<u8>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Core {
    fn new(local: EndPoint, kind: BusKind, config: LoopbackConfig, fabric: Arc<Fabric>) -> Result<Arc<Self>> {
        let region = match kind {
            BusKind::Message => None,
            BusKind::Memory => {
                let capacity = match local.query_param("capacity") {
                    Some(raw) => raw.parse::<usize>().map_err(|_| {
                        BusError::invalid_endpoint(local.to_string(), format!("invalid capacity '{}'", raw))
                    })?,
                    None => config.default_capacity,
                };
                Some(Mutex::new(vec![0u8; capacity]))
            }
        };

        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        let core = Arc::new(Self {
            state: Mutex::new(CoreState {
                phase: Phase::Created,
                links: HashMap::new(),
                global: Gauge::new(config.global_backlog),
                local: Gauge::new(config.local_backlog),
            }),
            local,
            kind,
            config,
            fabric,
            collector: RwLock::new(None),
            inbound_tx,
            inbound_rx,
            region,
            worker: Mutex::new(None),
        });
        core.fabric.register(&core)?;
        Ok(core)
    }

    fn is_open(&self) -> bool {
        self.state.lock().phase == Phase::Open
    }

    fn is_closed(&self) -> bool {
        self.state.lock().phase == Phase::Closed
    }

    fn enqueue(&self, event: Event) {
        // The receiver lives in self, so the send cannot fail
        let _ = self.inbound_tx.send(event);
    }

    fn collector(&self) -> Option<Arc<dyn EventCollector>> {
        self.collector.read().clone()
    }

    fn deliver(&self, event: Event) {
        match self.collector() {
            Some(collector) => collector.add(event),
            None => trace!(endpoint = %self.local, kind = %event.kind(), "Dropping event without collector"),
        }
    }

    /// Deliver everything queued; returns the number of events delivered
    fn drain(&self) -> usize {
        let mut delivered = 0;
        while let Ok(event) = self.inbound_rx.try_recv() {
            self.deliver(event);
            delivered += 1;
        }
        delivered
    }

    fn flush_collector(&self) {
        if let Some(collector) = self.collector() {
            collector.flush();
        }
    }

    fn open(core: &Arc<Core>) -> Result<()> {
        {
            let mut state = core.state.lock();
            match state.phase {
                Phase::Created => state.phase = Phase::Open,
                Phase::Open => return Err(BusError::illegal_state(format!("{} is already open", core.local))),
                Phase::Closed => return Err(BusError::closed(&core.local)),
            }
        }

        let polled = match core.collector() {
            Some(collector) => match collector.bind_processor(Arc::new(Poller::new(Arc::downgrade(core)))) {
                Ok(polled) => polled,
                Err(e) => {
                    core.state.lock().phase = Phase::Created;
                    return Err(e);
                }
            },
            None => false,
        };
        core.enqueue(Event::new(EventType::Open, None));

        if !polled {
            let runner = Arc::clone(core);
            let handle = thread::Builder::new()
                .name(format!("exabus-lb-{}", core.local.address()))
                .spawn(move || runner.run_delivery())
                .map_err(|e| BusError::resource_exhausted("threads", e.to_string()))?;
            *core.worker.lock() = Some(handle);
        }

        info!(endpoint = %core.local, kind = %core.kind, polled, "Loopback bus opened");
        Ok(())
    }

    fn run_delivery(&self) {
        debug!(endpoint = %self.local, "Delivery thread started");
        let idle = self.config.idle_wait();
        loop {
            match self.inbound_rx.recv_timeout(idle) {
                Ok(event) => {
                    self.deliver(event);
                    self.drain();
                    self.flush_collector();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.is_closed() && self.inbound_rx.is_empty() {
                break;
            }
        }
        debug!(endpoint = %self.local, "Delivery thread stopped");
    }

    fn close(&self) -> Result<()> {
        let links = {
            let mut state = self.state.lock();
            let previous = state.phase;
            state.phase = Phase::Closed;
            match previous {
                Phase::Closed => return Ok(()),
                Phase::Created => {
                    drop(state);
                    self.fabric.unregister(self);
                    return Ok(());
                }
                Phase::Open => std::mem::take(&mut state.links),
            }
        };

        self.fabric.unregister(self);
        for (peer, link) in links {
            if link.connected {
                if let Some(target) = self.fabric.lookup(&peer) {
                    target.peer_lost(&self.local, BusError::closed(&self.local));
                }
            }
        }
        self.enqueue(Event::new(EventType::Close, None));

        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if handle.thread().id() != thread::current().id() {
                if handle.join().is_err() {
                    warn!(endpoint = %self.local, "Delivery thread panicked");
                }
            }
        }

        info!(endpoint = %self.local, "Loopback bus closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BusError::closed(&self.local))
        }
    }

    /// Bring a link up; emits `Connect` when it was not already connected
    fn link_up(&self, peer: &EndPoint) {
        let mut state = self.state.lock();
        if state.phase != Phase::Open {
            return;
        }
        if state.links.get(peer).is_some_and(|link| link.connected) {
            return;
        }
        let link = Link {
            id: self.fabric.next_link_id(),
            connected: true,
            gauge: Gauge::new(self.config.peer_backlog),
        };
        state.links.insert(peer.clone(), link);
        self.enqueue(Event::new(EventType::Connect, Some(peer.clone())));
    }

    /// Record a link that failed to come up; the application must release it
    fn link_failed(&self, peer: &EndPoint, cause: BusError) {
        let mut state = self.state.lock();
        state.links.entry(peer.clone()).or_insert_with(|| Link {
            id: self.fabric.next_link_id(),
            connected: false,
            gauge: Gauge::new(self.config.peer_backlog),
        });
        self.enqueue(Event::disconnect(peer.clone(), Some(cause)));
    }

    /// The remote side went away
    fn peer_lost(&self, peer: &EndPoint, cause: BusError) {
        let mut state = self.state.lock();
        if let Some(link) = state.links.get_mut(peer) {
            if link.connected {
                link.connected = false;
                self.enqueue(Event::disconnect(peer.clone(), Some(cause)));
            }
        }
    }

    fn connect(&self, peer: &EndPoint) -> Result<()> {
        self.ensure_open()?;
        if *peer == self.local {
            return Err(BusError::illegal_state(format!("{} cannot connect to itself", peer)));
        }

        match self.fabric.lookup(peer) {
            Some(target) if target.is_open() && target.kind == self.kind => {
                debug!(local = %self.local, %peer, "Connecting");
                self.link_up(peer);
                target.link_up(&self.local);
            }
            Some(target) if target.kind != self.kind => {
                self.link_failed(peer, BusError::protocol(format!("{} is a {} bus", peer, target.kind)));
            }
            _ => {
                self.link_failed(peer, BusError::unknown_peer(peer, "no open bus bound"));
            }
        }
        Ok(())
    }

    fn disconnect(&self, peer: &EndPoint) -> Result<()> {
        {
            let mut state = self.state.lock();
            match state.links.get_mut(peer) {
                Some(link) if link.connected => {
                    link.connected = false;
                    self.enqueue(Event::disconnect(peer.clone(), None));
                }
                Some(_) => return Ok(()),
                None => return Err(BusError::unknown_peer(peer, "not connected")),
            }
        }
        if let Some(target) = self.fabric.lookup(peer) {
            target.peer_lost(&self.local, BusError::unknown_peer(&self.local, "disconnected by peer"));
        }
        Ok(())
    }

    fn release(&self, peer: &EndPoint) -> Result<()> {
        let was_connected = {
            let mut state = self.state.lock();
            match state.links.remove(peer) {
                Some(link) => {
                    self.enqueue(Event::new(EventType::Release, Some(peer.clone())));
                    link.connected
                }
                None => return Err(BusError::unknown_peer(peer, "not connected")),
            }
        };
        if was_connected {
            if let Some(target) = self.fabric.lookup(peer) {
                target.peer_lost(&self.local, BusError::unknown_peer(&self.local, "released by peer"));
            }
        }
        Ok(())
    }

    /// Connected, open target for a data operation
    fn target(&self, peer: &EndPoint) -> Result<(Arc<Core>, u64)> {
        let link_id = {
            let state = self.state.lock();
            if state.phase != Phase::Open {
                return Err(BusError::closed(&self.local));
            }
            match state.links.get(peer) {
                Some(link) if link.connected => link.id,
                Some(_) => return Err(BusError::unknown_peer(peer, "disconnected")),
                None => return Err(BusError::unknown_peer(peer, "not connected")),
            }
        };
        match self.fabric.lookup(peer) {
            Some(target) if target.is_open() => Ok((target, link_id)),
            _ => Err(BusError::unknown_peer(peer, "peer bus is gone")),
        }
    }

    /// Hand a message to `peer`, accounting outbound backlog
    fn send(self: &Arc<Self>, peer: &EndPoint, sequence: BufferSequence, receipt: Option<Receipt>) -> OpResult {
        let (target, link_id) = match self.target(peer) {
            Ok(found) => found,
            Err(error) => return Err(Rejected::new(error, Some(sequence), receipt)),
        };

        let len = sequence.len();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.links.get_mut(peer) {
                Some(link) if link.connected && link.id == link_id => {
                    if link.gauge.add(len) {
                        self.enqueue(Event::new(EventType::BacklogExcessive, Some(peer.clone())));
                    }
                }
                _ => {
                    return Err(Rejected::new(
                        BusError::unknown_peer(peer, "released during send"),
                        Some(sequence),
                        receipt,
                    ))
                }
            }
            if state.global.add(len) {
                self.enqueue(Event::new(EventType::BacklogExcessive, None));
            }
        }

        target.accept(self, peer.clone(), link_id, sequence, receipt);
        Ok(())
    }

    /// Queue an inbound message from `sender`
    fn accept(
        self: &Arc<Self>,
        sender: &Arc<Core>,
        as_seen_by_sender: EndPoint,
        link_id: u64,
        sequence: BufferSequence,
        receipt: Option<Receipt>,
    ) {
        let len = sequence.len();
        let receiver = Arc::downgrade(self);
        let origin = Arc::downgrade(sender);
        let event = Event::message(sender.local.clone(), sequence).with_dispose_hook(move || {
            if let Some(receiver) = receiver.upgrade() {
                receiver.consumed(len);
            }
            if let Some(origin) = origin.upgrade() {
                origin.completed(&as_seen_by_sender, link_id, len, receipt);
            }
        });

        let mut state = self.state.lock();
        if state.local.add(len) {
            self.enqueue(Event::new(EventType::BacklogExcessive, Some(self.local.clone())));
        }
        self.enqueue(event);
    }

    /// Receiver side: the application disposed an inbound message
    fn consumed(&self, len: usize) {
        let mut state = self.state.lock();
        if state.local.sub(len) {
            self.enqueue(Event::new(EventType::BacklogNormal, Some(self.local.clone())));
        }
    }

    /// Sender side: the receiver disposed a message we sent
    fn completed(&self, peer: &EndPoint, link_id: u64, len: usize, receipt: Option<Receipt>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(link) = state.links.get_mut(peer).filter(|link| link.id == link_id) {
            if link.gauge.sub(len) {
                self.enqueue(Event::new(EventType::BacklogNormal, Some(peer.clone())));
            }
        }
        if state.global.sub(len) {
            self.enqueue(Event::new(EventType::BacklogNormal, None));
        }
        if let Some(receipt) = receipt {
            self.enqueue(Event::receipt(peer.clone(), receipt));
        }
    }

    /// Immediate completion for memory operations
    fn complete_now(&self, peer: &EndPoint, receipt: Option<Receipt>) {
        if let Some(receipt) = receipt {
            self.enqueue(Event::receipt(peer.clone(), receipt));
        }
    }

    fn region_len(&self) -> usize {
        self.region.as_ref().map(|region| region.lock().len()).unwrap_or(0)
    }

    fn with_region<T>(&self, f: impl FnOnce(&mut Vec<u8>) -> Result<T>) -> Result<T> {
        match &self.region {
            Some(region) => {
                let mut guard = region.lock();
                f(&mut *guard)
            }
            None => Err(BusError::protocol(format!("{} has no memory region", self.local))),
        }
    }
}

fn check_bounds(offset: usize, len: usize, capacity: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(BusError::protocol(format!(
            "range {}+{} exceeds region capacity {}",
            offset, len, capacity
        ))),
    }
}

/// Drives a polled bus from its bound collector
struct Poller {
    core: Weak<Core>,
    cancelled: AtomicBool,
}

impl Poller {
    const SLICE: Duration = Duration::from_millis(10);

    fn new(core: Weak<Core>) -> Self {
        Self {
            core,
            cancelled: AtomicBool::new(false),
        }
    }
}

impl BusProcessor for Poller {
    fn poll(&self, timeout: Option<Duration>) -> Result<()> {
        let core = self
            .core
            .upgrade()
            .ok_or_else(|| BusError::closed("loopback bus (dropped)"))?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            match core.inbound_rx.try_recv() {
                Ok(event) => {
                    core.deliver(event);
                    core.drain();
                    return Ok(());
                }
                Err(TryRecvError::Disconnected) => return Err(BusError::closed(&core.local)),
                Err(TryRecvError::Empty) => {}
            }

            if self.cancelled.swap(false, Ordering::AcqRel) || core.is_closed() {
                return Ok(());
            }

            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    (deadline - now).min(Self::SLICE)
                }
                None => Self::SLICE,
            };

            match core.inbound_rx.recv_timeout(slice) {
                Ok(event) => {
                    core.deliver(event);
                    core.drain();
                    return Ok(());
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(BusError::closed(&core.local)),
            }
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

macro_rules! impl_loopback_bus {
    ($bus:ty) => {
        impl Bus for $bus {
            fn local_endpoint(&self) -> &EndPoint {
                &self.core.local
            }

            fn open(&self) -> Result<()> {
                Core::open(&self.core)
            }

            fn close(&self) -> Result<()> {
                self.core.close()
            }

            fn connect(&self, peer: &EndPoint) -> Result<()> {
                self.core.connect(peer)
            }

            fn disconnect(&self, peer: &EndPoint) -> Result<()> {
                self.core.disconnect(peer)
            }

            fn release(&self, peer: &EndPoint) -> Result<()> {
                self.core.release(peer)
            }

            fn flush(&self) {
                // Sends are queued on the receiver eagerly; nothing is batched
            }

            fn set_event_collector(&self, collector: Arc<dyn EventCollector>) -> Result<()> {
                if self.core.state.lock().phase != Phase::Created {
                    return Err(BusError::illegal_state("collector must be set before open"));
                }
                *self.core.collector.write() = Some(collector);
                Ok(())
            }

            fn event_collector(&self) -> Option<Arc<dyn EventCollector>> {
                self.core.collector()
            }
        }

        impl Drop for $bus {
            fn drop(&mut self) {
                if let Err(e) = self.core.close() {
                    debug!(endpoint = %self.core.local, error = %e, "Close on drop failed");
                }
            }
        }
    };
}

/// Loopback message bus (`lb://`)
pub struct LoopbackMessageBus {
    core: Arc<Core>,
}

impl_loopback_bus!(LoopbackMessageBus);

impl MessageBus for LoopbackMessageBus {
    fn send(&self, peer: &EndPoint, sequence: BufferSequence, receipt: Option<Receipt>) -> OpResult {
        self.core.send(peer, sequence, receipt)
    }
}

/// Loopback memory bus (`lbm://`)
pub struct LoopbackMemoryBus {
    core: Arc<Core>,
}

impl_loopback_bus!(LoopbackMemoryBus);

impl MemoryBus for LoopbackMemoryBus {
    fn capacity(&self, peer: Option<&EndPoint>) -> Result<usize> {
        match peer {
            None => Ok(self.core.region_len()),
            Some(peer) => self
                .core
                .fabric
                .lookup(peer)
                .map(|target| target.region_len())
                .ok_or_else(|| BusError::unknown_peer(peer, "no bus bound")),
        }
    }

    fn read(&self, peer: &EndPoint, offset: usize, len: usize, receipt: Option<Receipt>) -> OpResult {
        let data = match self.core.target(peer).and_then(|(target, _)| {
            target.with_region(|region| {
                check_bounds(offset, len, region.len())?;
                Ok(Bytes::copy_from_slice(&region[offset..offset + len]))
            })
        }) {
            Ok(data) => data,
            Err(error) => return Err(Rejected::new(error, None, receipt)),
        };

        let receipt = receipt.map(|mut receipt| {
            receipt.set_result(len as i64);
            receipt.with_garbage(Garbage::Sequence(BufferSequence::from_bytes(data)))
        });
        self.core.complete_now(peer, receipt);
        Ok(())
    }

    fn write(&self, peer: &EndPoint, offset: usize, sequence: BufferSequence, receipt: Option<Receipt>) -> OpResult {
        let outcome = self.core.target(peer).and_then(|(target, _)| {
            target.with_region(|region| {
                check_bounds(offset, sequence.len(), region.len())?;
                let mut at = offset;
                for segment in sequence.segments() {
                    region[at..at + segment.len()].copy_from_slice(segment);
                    at += segment.len();
                }
                Ok(())
            })
        });
        if let Err(error) = outcome {
            return Err(Rejected::new(error, Some(sequence), receipt));
        }

        sequence.dispose();
        self.core.complete_now(peer, receipt);
        Ok(())
    }

    fn signal(&self, peer: &EndPoint, value: i64, receipt: Option<Receipt>) -> OpResult {
        let payload = BufferSequence::from_bytes(value.to_be_bytes().to_vec());
        self.core.send(peer, payload, receipt)
    }

    fn get_and_add(&self, peer: &EndPoint, offset: usize, delta: i64, receipt: Option<Receipt>) -> OpResult {
        let prior = match self.core.target(peer).and_then(|(target, _)| {
            target.with_region(|region| {
                check_bounds(offset, 8, region.len())?;
                let mut word = [0u8; 8];
                word.copy_from_slice(&region[offset..offset + 8]);
                let prior = i64::from_be_bytes(word);
                region[offset..offset + 8].copy_from_slice(&prior.wrapping_add(delta).to_be_bytes());
                Ok(prior)
            })
        }) {
            Ok(prior) => prior,
            Err(error) => return Err(Rejected::new(error, None, receipt)),
        };

        let receipt = receipt.map(|mut receipt| {
            receipt.set_result(prior);
            receipt
        });
        self.core.complete_now(peer, receipt);
        Ok(())
    }
}

/// Driver for `lb://` and `lbm://` endpoints
pub struct LoopbackDriver {
    config: LoopbackConfig,
    fabric: Arc<Fabric>,
    depot: RwLock<Weak<Depot>>,
}

impl LoopbackDriver {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            config,
            fabric: Arc::new(Fabric::default()),
            depot: RwLock::new(Weak::new()),
        }
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    /// Buses currently registered on the fabric
    pub fn bound_endpoints(&self) -> Vec<EndPoint> {
        self.fabric
            .buses
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

impl Driver for LoopbackDriver {
    fn resolve_endpoint(&self, name: &str) -> Result<Option<EndPoint>> {
        match name.split_once("://") {
            Some((MESSAGE_PROTOCOL, _)) | Some((MEMORY_PROTOCOL, _)) => EndPoint::parse(name).map(Some),
            Some(_) => Ok(None),
            None if self.config.accept_bare_names
                && !name.is_empty()
                && !name.contains(|c: char| c.is_whitespace() || c == '/' || c == '?') =>
            {
                Ok(Some(EndPoint::new(MESSAGE_PROTOCOL, name, None)))
            }
            None => Ok(None),
        }
    }

    fn is_supported(&self, endpoint: Option<&EndPoint>) -> bool {
        match endpoint {
            None => true,
            Some(ep) => matches!(ep.protocol(), MESSAGE_PROTOCOL | MEMORY_PROTOCOL),
        }
    }

    fn create_bus(&self, endpoint: &EndPoint) -> Result<AnyBus> {
        let kind = match endpoint.protocol() {
            MESSAGE_PROTOCOL => BusKind::Message,
            MEMORY_PROTOCOL => BusKind::Memory,
            _ => return Err(BusError::unsupported(endpoint)),
        };
        let core = Core::new(endpoint.clone(), kind, self.config.clone(), self.fabric.clone())?;
        Ok(match kind {
            BusKind::Message => AnyBus::Message(Arc::new(LoopbackMessageBus { core })),
            BusKind::Memory => AnyBus::Memory(Arc::new(LoopbackMemoryBus { core })),
        })
    }

    fn set_depot(&self, depot: Weak<Depot>) {
        *self.depot.write() = depot;
    }

    fn depot(&self) -> Option<Arc<Depot>> {
        self.depot.read().upgrade()
    }
}
