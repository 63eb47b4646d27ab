//! Bus Events
//!
//! Every state change or delivery on a bus reaches the application as an
//! [`Event`]: a type tag, an optional endpoint (absent means bus-wide scope)
//! and optional content. Events must be disposed exactly once. Disposal
//! consumes the event, and an event dropped on any other path (including
//! unwinding) is disposed by its `Drop`, so the contract holds by ownership.
//!
//! Disposing an event releases its content: message buffers go back to their
//! manager and a carried receipt is disposed (firing its completion hooks).
//! [`Event::take_content`] instead transfers the content to the caller.

use crate::buffers::BufferSequence;
use crate::clock;
use crate::endpoint::EndPoint;
use crate::error::BusError;
use crate::receipt::Receipt;
use std::fmt;

/// Event type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Bus opened
    Open,
    /// Bus closed; no further events follow
    Close,
    /// Connection to a peer established
    Connect,
    /// Connection lost; the application should release the peer
    Disconnect,
    /// Peer released; resources for it are gone
    Release,
    /// Inbound message
    Message,
    /// Completion of an earlier send
    Receipt,
    /// A scope left the excessive backlog state
    BacklogNormal,
    /// A scope cannot currently accept more outbound work
    BacklogExcessive,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Open => "OPEN",
            EventType::Close => "CLOSE",
            EventType::Connect => "CONNECT",
            EventType::Disconnect => "DISCONNECT",
            EventType::Release => "RELEASE",
            EventType::Message => "MESSAGE",
            EventType::Receipt => "RECEIPT",
            EventType::BacklogNormal => "BACKLOG_NORMAL",
            EventType::BacklogExcessive => "BACKLOG_EXCESSIVE",
        }
    }

    pub fn is_backlog(&self) -> bool {
        matches!(self, EventType::BacklogNormal | EventType::BacklogExcessive)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payload, determined by the event type
#[derive(Debug)]
pub enum EventContent {
    /// `Message` payload
    Message(BufferSequence),
    /// `Receipt` payload
    Receipt(Receipt),
    /// `Disconnect` cause
    Failure(BusError),
}

type DisposeHook = Box<dyn FnOnce() + Send>;

/// A typed bus event. See the module docs for the disposal contract.
pub struct Event {
    kind: EventType,
    endpoint: Option<EndPoint>,
    content: Option<EventContent>,
    stamp_nanos: Option<i64>,
    on_dispose: Option<DisposeHook>,
}

impl Event {
    /// Event without content
    pub fn new(kind: EventType, endpoint: Option<EndPoint>) -> Self {
        Self {
            kind,
            endpoint,
            content: None,
            stamp_nanos: None,
            on_dispose: None,
        }
    }

    /// Inbound message from `sender`
    pub fn message(sender: EndPoint, sequence: BufferSequence) -> Self {
        let mut event = Self::new(EventType::Message, Some(sender));
        event.content = Some(EventContent::Message(sequence));
        event
    }

    /// Completion of a send to `peer`
    pub fn receipt(peer: EndPoint, receipt: Receipt) -> Self {
        let mut event = Self::new(EventType::Receipt, Some(peer));
        event.content = Some(EventContent::Receipt(receipt));
        event
    }

    /// Lost connection, with an optional cause
    pub fn disconnect(peer: EndPoint, cause: Option<BusError>) -> Self {
        let mut event = Self::new(EventType::Disconnect, Some(peer));
        event.content = cause.map(EventContent::Failure);
        event
    }

    /// Register an action to run once the event is disposed
    pub fn with_dispose_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_dispose = Some(match self.on_dispose.take() {
            Some(previous) => Box::new(move || {
                previous();
                hook();
            }),
            None => Box::new(hook),
        });
        self
    }

    pub fn kind(&self) -> EventType {
        self.kind
    }

    /// Event scope; `None` is the bus-wide scope
    pub fn endpoint(&self) -> Option<&EndPoint> {
        self.endpoint.as_ref()
    }

    pub fn content(&self) -> Option<&EventContent> {
        self.content.as_ref()
    }

    pub fn sequence(&self) -> Option<&BufferSequence> {
        match &self.content {
            Some(EventContent::Message(seq)) => Some(seq),
            _ => None,
        }
    }

    /// Receipt carried by a RECEIPT event
    pub fn as_receipt(&self) -> Option<&Receipt> {
        match &self.content {
            Some(EventContent::Receipt(receipt)) => Some(receipt),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&BusError> {
        match &self.content {
            Some(EventContent::Failure(cause)) => Some(cause),
            _ => None,
        }
    }

    /// Message length in bytes, zero for other event types
    pub fn message_len(&self) -> usize {
        self.sequence().map(BufferSequence::len).unwrap_or(0)
    }

    /// Fix a capture-time timestamp on the event
    pub fn stamp(mut self) -> Self {
        self.stamp_nanos = Some(clock::now_nanos());
        self
    }

    /// Capture-time timestamp, if the event was stamped
    pub fn stamp_nanos(&self) -> Option<i64> {
        self.stamp_nanos
    }

    /// Dispose the event, releasing its content
    pub fn dispose(self) {}

    /// Dispose the event, handing its content to the caller
    pub fn take_content(mut self) -> Option<EventContent> {
        self.content.take()
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        match self.content.take() {
            Some(EventContent::Receipt(receipt)) => receipt.dispose(),
            Some(EventContent::Message(seq)) => seq.dispose(),
            Some(EventContent::Failure(_)) | None => {}
        }
        if let Some(hook) = self.on_dispose.take() {
            hook();
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("content", &self.content)
            .field("stamp_nanos", &self.stamp_nanos)
            .finish()
    }
}
