//! Backlog Flow Control
//!
//! Transports report per-scope backpressure with `BacklogExcessive` and
//! `BacklogNormal` events. A scope is the whole bus (no endpoint), the local
//! endpoint (inbound backlog) or a single peer. Transitions per scope must
//! strictly alternate; a repeated state is an ordering violation and is
//! reported as [`BusError::BacklogOrdering`], never ignored.
//!
//! [`FlowControl`] is the application-side consumer: it tracks the global
//! flag and the set of ready peers that transmitters iterate over.
//! [`CreditLimiter`] is the independent sender-side byte credit bound.

use crate::endpoint::EndPoint;
use crate::error::{BusError, Result};
use crate::event::EventType;
use crate::notifier::SingleWaiterNotifier;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Backlog state of one scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BacklogState {
    #[default]
    Normal,
    Excessive,
}

impl BacklogState {
    /// State a backlog event moves its scope into
    pub fn from_event(kind: EventType) -> Option<Self> {
        match kind {
            EventType::BacklogNormal => Some(BacklogState::Normal),
            EventType::BacklogExcessive => Some(BacklogState::Excessive),
            _ => None,
        }
    }
}

/// Bus-wide backlog flag with waiters
#[derive(Debug, Default)]
pub struct GlobalBacklog {
    excessive: Mutex<bool>,
    cond: Condvar,
}

impl GlobalBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_excessive(&self) -> bool {
        *self.excessive.lock()
    }

    pub fn enter_excessive(&self) -> Result<()> {
        let mut excessive = self.excessive.lock();
        if *excessive {
            return Err(BusError::ordering("global BACKLOG_EXCESSIVE while already excessive"));
        }
        *excessive = true;
        Ok(())
    }

    pub fn exit_excessive(&self) -> Result<()> {
        let mut excessive = self.excessive.lock();
        if !*excessive {
            return Err(BusError::ordering("global BACKLOG_NORMAL without prior BACKLOG_EXCESSIVE"));
        }
        *excessive = false;
        self.cond.notify_all();
        Ok(())
    }

    /// Block while excessive, up to `timeout`. Returns `true` once normal.
    pub fn wait_normal(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut excessive = self.excessive.lock();
        while *excessive {
            if self.cond.wait_until(&mut excessive, deadline).timed_out() {
                return !*excessive;
            }
        }
        true
    }

    /// Wake all waiters without changing state (used on shutdown)
    pub fn wake_all(&self) {
        let _guard = self.excessive.lock();
        self.cond.notify_all();
    }
}

/// Peers currently able to accept sends
#[derive(Debug, Default)]
pub struct ReadySet {
    peers: Mutex<Vec<EndPoint>>,
    cond: Condvar,
}

impl ReadySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer; returns `false` when it was already present
    pub fn insert(&self, peer: &EndPoint) -> bool {
        let mut peers = self.peers.lock();
        if peers.contains(peer) {
            return false;
        }
        peers.push(peer.clone());
        self.cond.notify_all();
        true
    }

    /// Remove a peer; returns `false` when it was absent
    pub fn remove(&self, peer: &EndPoint) -> bool {
        let mut peers = self.peers.lock();
        match peers.iter().position(|p| p == peer) {
            Some(index) => {
                peers.remove(index);
                self.cond.notify_all();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, peer: &EndPoint) -> bool {
        self.peers.lock().contains(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<EndPoint> {
        self.peers.lock().clone()
    }

    /// Round-robin over ready peers. Blocks up to `timeout` while empty.
    pub fn next_ready(&self, cursor: &mut usize, timeout: Duration) -> Option<EndPoint> {
        let deadline = Instant::now() + timeout;
        let mut peers = self.peers.lock();
        while peers.is_empty() {
            if self.cond.wait_until(&mut peers, deadline).timed_out() && peers.is_empty() {
                return None;
            }
        }
        let peer = peers[*cursor % peers.len()].clone();
        *cursor = cursor.wrapping_add(1);
        Some(peer)
    }

    /// Block until `peer` has left the set, up to `timeout`
    pub fn wait_absent(&self, peer: &EndPoint, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut peers = self.peers.lock();
        while peers.contains(peer) {
            if self.cond.wait_until(&mut peers, deadline).timed_out() {
                return !peers.contains(peer);
            }
        }
        true
    }

    /// Wake all waiters without changing membership
    pub fn wake_all(&self) {
        let _guard = self.peers.lock();
        self.cond.notify_all();
    }
}

/// What a flow-control event changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowSignal {
    GlobalExcessive,
    GlobalNormal,
    LocalExcessive,
    /// Local backlog ended after the given duration
    LocalNormal(Duration),
    PeerExcessive(EndPoint),
    PeerReady(EndPoint),
    PeerRemoved(EndPoint),
    /// Event for a peer that is not a configured target
    Untracked,
    /// Flow control disabled, or not a flow-control event
    Ignored,
}

/// Application-side backlog consumer shared by processors and transmitters
#[derive(Debug)]
pub struct FlowControl {
    local: EndPoint,
    targets: HashSet<EndPoint>,
    enabled: bool,
    global: GlobalBacklog,
    ready: ReadySet,
    local_since: Mutex<Option<Instant>>,
}

impl FlowControl {
    /// `targets` are the peers transmitters send to; only they are tracked
    /// in the ready set. With `enabled == false` backlog events are ignored
    /// while connection events still maintain readiness.
    pub fn new(local: EndPoint, targets: impl IntoIterator<Item = EndPoint>, enabled: bool) -> Self {
        Self {
            local,
            targets: targets.into_iter().collect(),
            enabled,
            global: GlobalBacklog::new(),
            ready: ReadySet::new(),
            local_since: Mutex::new(None),
        }
    }

    pub fn local(&self) -> &EndPoint {
        &self.local
    }

    pub fn is_target(&self, peer: &EndPoint) -> bool {
        self.targets.contains(peer)
    }

    pub fn global(&self) -> &GlobalBacklog {
        &self.global
    }

    pub fn ready(&self) -> &ReadySet {
        &self.ready
    }

    /// Whether the local endpoint is currently backlogged
    pub fn is_local_excessive(&self) -> bool {
        self.local_since.lock().is_some()
    }

    /// Apply a connection or backlog event
    pub fn on_event(&self, kind: EventType, endpoint: Option<&EndPoint>) -> Result<FlowSignal> {
        match kind {
            EventType::BacklogExcessive | EventType::BacklogNormal if !self.enabled => Ok(FlowSignal::Ignored),
            EventType::BacklogExcessive => self.on_excessive(endpoint),
            EventType::BacklogNormal => self.on_normal(endpoint),
            EventType::Connect => match endpoint {
                Some(peer) => self.mark_ready(peer),
                None => Ok(FlowSignal::Ignored),
            },
            EventType::Release | EventType::Disconnect => match endpoint {
                Some(peer) => {
                    self.ready.remove(peer);
                    Ok(FlowSignal::PeerRemoved(peer.clone()))
                }
                None => Ok(FlowSignal::Ignored),
            },
            _ => Ok(FlowSignal::Ignored),
        }
    }

    fn on_excessive(&self, endpoint: Option<&EndPoint>) -> Result<FlowSignal> {
        match endpoint {
            None => {
                self.global.enter_excessive()?;
                debug!("Global backlog excessive");
                Ok(FlowSignal::GlobalExcessive)
            }
            Some(ep) if *ep == self.local => {
                let mut since = self.local_since.lock();
                if since.is_some() {
                    return Err(BusError::ordering(format!(
                        "local BACKLOG_EXCESSIVE on {} while already excessive",
                        ep
                    )));
                }
                *since = Some(Instant::now());
                Ok(FlowSignal::LocalExcessive)
            }
            Some(peer) => {
                if !self.ready.remove(peer) && self.is_target(peer) {
                    return Err(BusError::ordering(format!(
                        "BACKLOG_EXCESSIVE for {} which was not ready",
                        peer
                    )));
                }
                trace!(%peer, "Peer backlog excessive");
                Ok(FlowSignal::PeerExcessive(peer.clone()))
            }
        }
    }

    fn on_normal(&self, endpoint: Option<&EndPoint>) -> Result<FlowSignal> {
        match endpoint {
            None => {
                self.global.exit_excessive()?;
                debug!("Global backlog normal");
                Ok(FlowSignal::GlobalNormal)
            }
            Some(ep) if *ep == self.local => match self.local_since.lock().take() {
                Some(since) => Ok(FlowSignal::LocalNormal(since.elapsed())),
                None => Err(BusError::ordering(format!(
                    "local BACKLOG_NORMAL on {} without prior BACKLOG_EXCESSIVE",
                    ep
                ))),
            },
            Some(peer) => self.mark_ready(peer).map_err(|_| {
                BusError::ordering(format!(
                    "BACKLOG_NORMAL for {} without prior BACKLOG_EXCESSIVE",
                    peer
                ))
            }),
        }
    }

    fn mark_ready(&self, peer: &EndPoint) -> Result<FlowSignal> {
        if !self.is_target(peer) {
            return Ok(FlowSignal::Untracked);
        }
        if !self.ready.insert(peer) {
            return Err(BusError::ordering(format!("{} is already ready", peer)));
        }
        Ok(FlowSignal::PeerReady(peer.clone()))
    }

    /// Wake every blocked transmitter (shutdown)
    pub fn wake_all(&self) {
        self.global.wake_all();
        self.ready.wake_all();
    }
}

/// Sender-side byte credit bound.
///
/// Each send acquires an average-message credit; each receipt disposal
/// releases it. When the outstanding credit exceeds the maximum the sender
/// flushes and waits; a release that takes the counter from above a third of
/// the maximum to below the maximum signals the waiting sender.
#[derive(Debug)]
pub struct CreditLimiter {
    outstanding: AtomicI64,
    max: i64,
    notifier: Arc<SingleWaiterNotifier>,
}

impl CreditLimiter {
    pub fn new(max: i64) -> Arc<Self> {
        Arc::new(Self {
            outstanding: AtomicI64::new(0),
            max: max.max(1),
            notifier: SingleWaiterNotifier::new(),
        })
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    pub fn outstanding(&self) -> i64 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Add credit for a send; returns `true` when the sender must wait
    pub fn acquire(&self, credit: i64) -> bool {
        self.outstanding.fetch_add(credit, Ordering::AcqRel) + credit > self.max
    }

    /// Return credit on receipt disposal
    pub fn release(&self, credit: i64) {
        let pre = self.outstanding.fetch_sub(credit, Ordering::AcqRel);
        if pre > self.max / 3 && pre - credit < self.max {
            self.notifier.signal();
        }
    }

    /// Wait for a release signal, up to `timeout`
    pub fn await_credit(&self, timeout: Duration) -> bool {
        self.notifier.await_signal(Some(timeout))
    }
}
