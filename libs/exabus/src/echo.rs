//! Echo transport.
//!
//! `echo` buses deliver every sent message straight back to their own
//! collector as a `Message` from the local endpoint. A supplied receipt is
//! emitted once that echoed message has been disposed. Useful for exercising
//! collectors and processors without a peer.

use crate::bus::{AnyBus, Bus, MessageBus, OpResult, Rejected};
use crate::buffers::BufferSequence;
use crate::collector::EventCollector;
use crate::driver::{Depot, Driver};
use crate::endpoint::EndPoint;
use crate::error::{BusError, Result};
use crate::event::{Event, EventType};
use crate::receipt::Receipt;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

pub const ECHO_PROTOCOL: &str = "echo";

/// Driver for `echo` and `echo://name` endpoints
#[derive(Default)]
pub struct EchoDriver {
    depot: RwLock<Weak<Depot>>,
}

impl EchoDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Driver for EchoDriver {
    fn resolve_endpoint(&self, name: &str) -> Result<Option<EndPoint>> {
        if name == ECHO_PROTOCOL {
            return Ok(Some(EndPoint::new(ECHO_PROTOCOL, "local", None)));
        }
        if !name.starts_with("echo://") {
            return Ok(None);
        }
        EndPoint::parse(name).map(Some)
    }

    fn is_supported(&self, endpoint: Option<&EndPoint>) -> bool {
        endpoint.is_some_and(|ep| ep.protocol() == ECHO_PROTOCOL)
    }

    fn create_bus(&self, endpoint: &EndPoint) -> Result<AnyBus> {
        if !self.is_supported(Some(endpoint)) {
            return Err(BusError::unsupported(endpoint));
        }
        Ok(AnyBus::Message(Arc::new(EchoBus::new(endpoint.clone()))))
    }

    fn set_depot(&self, depot: Weak<Depot>) {
        *self.depot.write() = depot;
    }

    fn depot(&self) -> Option<Arc<Depot>> {
        self.depot.read().upgrade()
    }
}

/// Message bus that talks only to itself
pub struct EchoBus {
    local: EndPoint,
    collector: RwLock<Option<Arc<dyn EventCollector>>>,
    open: AtomicBool,
}

impl EchoBus {
    pub fn new(local: EndPoint) -> Self {
        Self {
            local,
            collector: RwLock::new(None),
            open: AtomicBool::new(false),
        }
    }

    fn emit(&self, event: Event) {
        // Without a collector the event is disposed here
        if let Some(collector) = self.event_collector() {
            collector.add(event);
        }
    }

    fn emit_and_flush(&self, event: Event) {
        if let Some(collector) = self.event_collector() {
            collector.add(event);
            collector.flush();
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BusError::closed(&self.local))
        }
    }
}

impl Bus for EchoBus {
    fn local_endpoint(&self) -> &EndPoint {
        &self.local
    }

    fn open(&self) -> Result<()> {
        if self.open.swap(true, Ordering::AcqRel) {
            return Err(BusError::illegal_state(format!("{} is already open", self.local)));
        }
        debug!(endpoint = %self.local, "Echo bus opened");
        self.emit_and_flush(Event::new(EventType::Open, None));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!(endpoint = %self.local, "Echo bus closed");
            self.emit_and_flush(Event::new(EventType::Close, None));
        }
        Ok(())
    }

    fn connect(&self, peer: &EndPoint) -> Result<()> {
        self.ensure_open()?;
        self.emit_and_flush(Event::new(EventType::Connect, Some(peer.clone())));
        Ok(())
    }

    fn disconnect(&self, peer: &EndPoint) -> Result<()> {
        self.ensure_open()?;
        self.emit_and_flush(Event::disconnect(peer.clone(), None));
        Ok(())
    }

    fn release(&self, peer: &EndPoint) -> Result<()> {
        self.emit_and_flush(Event::new(EventType::Release, Some(peer.clone())));
        Ok(())
    }

    fn flush(&self) {
        if let Some(collector) = self.event_collector() {
            collector.flush();
        }
    }

    fn set_event_collector(&self, collector: Arc<dyn EventCollector>) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            return Err(BusError::illegal_state("collector must be set before open"));
        }
        *self.collector.write() = Some(collector);
        Ok(())
    }

    fn event_collector(&self) -> Option<Arc<dyn EventCollector>> {
        self.collector.read().clone()
    }
}

impl MessageBus for EchoBus {
    fn send(&self, peer: &EndPoint, sequence: BufferSequence, receipt: Option<Receipt>) -> OpResult {
        if let Err(error) = self.ensure_open() {
            return Err(Rejected::new(error, Some(sequence), receipt));
        }

        let mut event = Event::message(self.local.clone(), sequence);
        if let Some(receipt) = receipt {
            let sink: Weak<dyn EventCollector> = match self.event_collector() {
                Some(collector) => Arc::downgrade(&collector),
                None => return Ok(()),
            };
            let peer = peer.clone();
            event = event.with_dispose_hook(move || {
                if let Some(collector) = sink.upgrade() {
                    collector.add(Event::receipt(peer, receipt));
                }
            });
        }
        self.emit(event);
        Ok(())
    }
}
