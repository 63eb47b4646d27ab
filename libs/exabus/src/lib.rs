//! Exabus
//!
//! Pluggable asynchronous transport abstraction. Applications resolve
//! endpoints through a [`Depot`], create message or memory buses from the
//! registered [`Driver`]s, install an [`EventCollector`] and react to the
//! typed [`Event`] stream, including backlog flow-control signals.
//!
//! Built-in transports: `echo` (self-delivery) and the in-process loopback
//! fabric (`lb://` message buses, `lbm://` memory buses).

pub mod backlog;
pub mod buffers;
pub mod bus;
pub mod clock;
pub mod collector;
pub mod driver;
pub mod echo;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod loopback;
pub mod notifier;
pub mod receipt;

// Re-export commonly used types
pub use backlog::{BacklogState, CreditLimiter, FlowControl, FlowSignal, GlobalBacklog, ReadySet};
pub use buffers::{
    BufferConfig, BufferManager, BufferManagerKind, BufferSequence, HeapBufferManager, PooledBufferManager,
};
pub use bus::{AnyBus, Bus, BusKind, MemoryBus, MessageBus, OpResult, Rejected, WeakBus};
pub use collector::{BusProcessor, DemultiplexingCollector, EventCollector, QueueingEventCollector, Shard};
pub use driver::{parse_endpoints, Depot, DepotConfig, Driver};
pub use echo::{EchoBus, EchoDriver};
pub use endpoint::EndPoint;
pub use error::{BusError, Result};
pub use event::{Event, EventContent, EventType};
pub use loopback::{LoopbackConfig, LoopbackDriver, LoopbackMemoryBus, LoopbackMessageBus, Watermarks};
pub use notifier::SingleWaiterNotifier;
pub use receipt::{Garbage, Receipt};
