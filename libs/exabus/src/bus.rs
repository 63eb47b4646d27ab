//! Bus Capability Traits
//!
//! A [`Bus`] is bound to a local [`EndPoint`] and exchanges data with peers.
//! Concrete buses expose one of two capability sets: [`MessageBus`] (send
//! buffer sequences) or [`MemoryBus`] (remote memory region operations).
//! [`AnyBus`] is the closed sum over both, as produced by drivers.
//!
//! Life-cycle: install the event collector, `open`, `connect` peers, exchange
//! data, `release` peers on `Disconnect`, `close`. All operations are
//! asynchronous; outcomes arrive as events on the collector.

use crate::buffers::BufferSequence;
use crate::collector::EventCollector;
use crate::endpoint::EndPoint;
use crate::error::{BusError, Result};
use crate::receipt::Receipt;
use std::fmt;
use std::sync::{Arc, Weak};

/// Operations common to every bus
pub trait Bus: Send + Sync {
    /// Endpoint this bus is bound to
    fn local_endpoint(&self) -> &EndPoint;

    /// Start delivering events; emits `Open`
    fn open(&self) -> Result<()>;

    /// Stop the bus; emits `Close` as the final event
    fn close(&self) -> Result<()>;

    /// Establish a connection; emits `Connect` (or `Disconnect` on failure)
    fn connect(&self, peer: &EndPoint) -> Result<()>;

    /// Drop a connection; emits `Disconnect`
    fn disconnect(&self, peer: &EndPoint) -> Result<()>;

    /// Free all resources for a disconnected peer; emits `Release`
    fn release(&self, peer: &EndPoint) -> Result<()>;

    /// Push batched outbound work to the transport
    fn flush(&self);

    /// Install the collector; only permitted before `open`
    fn set_event_collector(&self, collector: Arc<dyn EventCollector>) -> Result<()>;

    fn event_collector(&self) -> Option<Arc<dyn EventCollector>>;
}

/// A data operation the bus refused. Ownership of everything the caller
/// handed over comes back so it can be reused or dropped.
pub struct Rejected {
    pub error: BusError,
    pub sequence: Option<BufferSequence>,
    pub receipt: Option<Receipt>,
}

impl Rejected {
    pub fn new(error: BusError, sequence: Option<BufferSequence>, receipt: Option<Receipt>) -> Self {
        Self {
            error,
            sequence,
            receipt,
        }
    }

    /// Discard the returned resources without completing the receipt
    pub fn into_error(self) -> BusError {
        if let Some(receipt) = self.receipt {
            receipt.abandon();
        }
        self.error
    }
}

impl From<Rejected> for BusError {
    fn from(rejected: Rejected) -> Self {
        rejected.into_error()
    }
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .field("sequence", &self.sequence)
            .field("receipt", &self.receipt)
            .finish()
    }
}

/// Result of a data operation
pub type OpResult = std::result::Result<(), Rejected>;

/// Message-oriented bus
pub trait MessageBus: Bus {
    /// Send a message. With a receipt, a `Receipt` event carrying it is
    /// emitted once the transport has finished with the data.
    fn send(&self, peer: &EndPoint, sequence: BufferSequence, receipt: Option<Receipt>) -> OpResult;
}

/// Memory-region bus
pub trait MemoryBus: Bus {
    /// Region size in bytes of the local bus (`None`) or of a peer
    fn capacity(&self, peer: Option<&EndPoint>) -> Result<usize>;

    /// Read `len` bytes at `offset` of the peer region. The data is attached
    /// to the receipt as its buffer sequence; the result is the byte count.
    fn read(&self, peer: &EndPoint, offset: usize, len: usize, receipt: Option<Receipt>) -> OpResult;

    /// Write the sequence into the peer region at `offset`
    fn write(&self, peer: &EndPoint, offset: usize, sequence: BufferSequence, receipt: Option<Receipt>) -> OpResult;

    /// Deliver an 8-byte signal value to the peer as a `Message` event
    fn signal(&self, peer: &EndPoint, value: i64, receipt: Option<Receipt>) -> OpResult;

    /// Atomically add to the 8-byte word at `offset`; the result is the prior value
    fn get_and_add(&self, peer: &EndPoint, offset: usize, delta: i64, receipt: Option<Receipt>) -> OpResult;
}

/// Requested bus capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Message,
    Memory,
}

impl BusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusKind::Message => "message",
            BusKind::Memory => "memory",
        }
    }
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bus of either capability
#[derive(Clone)]
pub enum AnyBus {
    Message(Arc<dyn MessageBus>),
    Memory(Arc<dyn MemoryBus>),
}

macro_rules! delegate {
    ($self:ident, $bus:ident => $call:expr) => {
        match $self {
            AnyBus::Message($bus) => $call,
            AnyBus::Memory($bus) => $call,
        }
    };
}

impl AnyBus {
    pub fn kind(&self) -> BusKind {
        match self {
            AnyBus::Message(_) => BusKind::Message,
            AnyBus::Memory(_) => BusKind::Memory,
        }
    }

    pub fn local_endpoint(&self) -> &EndPoint {
        delegate!(self, bus => bus.local_endpoint())
    }

    pub fn open(&self) -> Result<()> {
        delegate!(self, bus => bus.open())
    }

    pub fn close(&self) -> Result<()> {
        delegate!(self, bus => bus.close())
    }

    pub fn connect(&self, peer: &EndPoint) -> Result<()> {
        delegate!(self, bus => bus.connect(peer))
    }

    pub fn disconnect(&self, peer: &EndPoint) -> Result<()> {
        delegate!(self, bus => bus.disconnect(peer))
    }

    pub fn release(&self, peer: &EndPoint) -> Result<()> {
        delegate!(self, bus => bus.release(peer))
    }

    pub fn flush(&self) {
        delegate!(self, bus => bus.flush())
    }

    pub fn set_event_collector(&self, collector: Arc<dyn EventCollector>) -> Result<()> {
        delegate!(self, bus => bus.set_event_collector(collector))
    }

    pub fn event_collector(&self) -> Option<Arc<dyn EventCollector>> {
        delegate!(self, bus => bus.event_collector())
    }

    pub fn as_message(&self) -> Option<&Arc<dyn MessageBus>> {
        match self {
            AnyBus::Message(bus) => Some(bus),
            AnyBus::Memory(_) => None,
        }
    }

    pub fn as_memory(&self) -> Option<&Arc<dyn MemoryBus>> {
        match self {
            AnyBus::Memory(bus) => Some(bus),
            AnyBus::Message(_) => None,
        }
    }

    /// Non-owning handle for collectors and processors
    pub fn downgrade(&self) -> WeakBus {
        match self {
            AnyBus::Message(bus) => WeakBus::Message(Arc::downgrade(bus)),
            AnyBus::Memory(bus) => WeakBus::Memory(Arc::downgrade(bus)),
        }
    }
}

impl fmt::Debug for AnyBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnyBus::{:?}({})", self.kind(), self.local_endpoint())
    }
}

/// Weak counterpart of [`AnyBus`]
#[derive(Clone, Default)]
pub enum WeakBus {
    #[default]
    Detached,
    Message(Weak<dyn MessageBus>),
    Memory(Weak<dyn MemoryBus>),
}

impl WeakBus {
    pub fn upgrade(&self) -> Option<AnyBus> {
        match self {
            WeakBus::Detached => None,
            WeakBus::Message(bus) => bus.upgrade().map(AnyBus::Message),
            WeakBus::Memory(bus) => bus.upgrade().map(AnyBus::Memory),
        }
    }

    /// Flush the bus if it is still alive
    pub fn flush(&self) {
        if let Some(bus) = self.upgrade() {
            bus.flush();
        }
    }
}

impl fmt::Debug for WeakBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(bus) => write!(f, "WeakBus({:?})", bus),
            None => f.write_str("WeakBus(detached)"),
        }
    }
}
