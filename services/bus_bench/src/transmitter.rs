//! Transmitter
//!
//! One transmitter thread drives requests over a bus: it waits out global
//! backlog, round-robins over ready peers, builds and sends a message (or a
//! memory operation), applies the credit limiter, flushes periodically and,
//! in blocking mode, waits for the correlated response before continuing.

use crate::error::{BenchError, Result};
use crate::message::{request_id, BLOCKING_NO_SAMPLE};
use crate::processor::BusContext;
use crate::stats::TransmitterStats;
use crate::throttle::RateThrottle;
use exabus::{notifier, AnyBus, CreditLimiter, EndPoint, MemoryBus, MessageBus, Receipt, SingleWaiterNotifier};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

const BACKLOG_WAIT: Duration = Duration::from_millis(100);
const RESPONSE_PARK: Duration = Duration::from_millis(10);
const RECONNECT_WAIT: Duration = Duration::from_secs(1);

/// Value carried by memory-bus signals
const SIGNAL_VALUE: i64 = 1234;

/// Request/response correlation for one blocking transmitter.
///
/// The transmitter raises `pending` before each request; the processor that
/// receives the response lowers it and, on reaching zero, publishes the
/// response sequence and wakes the transmitter.
#[derive(Debug)]
pub struct Correlator {
    pending: AtomicI64,
    result: AtomicU32,
    notifier: Arc<SingleWaiterNotifier>,
    spin: Duration,
}

impl Correlator {
    /// `spin` bounds the busy wait before parking
    pub fn new(spin: Duration) -> Self {
        Self {
            pending: AtomicI64::new(0),
            result: AtomicU32::new(0),
            notifier: SingleWaiterNotifier::new(),
            spin,
        }
    }

    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Register an outstanding request
    pub fn expect(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Withdraw a request whose send was rejected
    pub fn cancel(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    /// Record a response carrying `sequence`
    pub fn signal_result(&self, sequence: u32) -> Result<()> {
        let left = self.pending.fetch_sub(1, Ordering::AcqRel) - 1;
        if left < 0 {
            self.pending.fetch_add(1, Ordering::AcqRel);
            return Err(BenchError::disposal(format!(
                "response {} with no request outstanding",
                sequence
            )));
        }
        if left == 0 {
            self.result.store(sequence, Ordering::Release);
            self.notifier.signal();
        }
        Ok(())
    }

    /// Wait until every outstanding request has been answered. Spins for
    /// the configured duration, then parks. Returns `None` when stopped.
    pub fn await_result(&self, stop: &AtomicBool) -> Option<u32> {
        let spin_until = Instant::now() + self.spin;
        while self.pending() > 0 && Instant::now() < spin_until {
            std::hint::spin_loop();
        }
        while self.pending() > 0 {
            if stop.load(Ordering::Acquire) {
                return None;
            }
            self.notifier.await_signal(Some(RESPONSE_PARK));
        }
        Some(self.result.load(Ordering::Acquire))
    }
}

/// Transmitter options resolved from the workload configuration
#[derive(Debug, Clone)]
pub struct TransmitterSettings {
    pub index: usize,
    pub blocking: bool,
    pub receipts: bool,
    /// Timestamp every n-th request; 0 disables latency samples
    pub latency_frequency: u64,
    /// Flush after this many sends; 0 leaves flushing to the transport
    pub flush_on: u64,
    pub single_use: bool,
    /// Transmit rate target in bytes per second
    pub tx_rate: Option<u64>,
    /// Outstanding byte ceiling enforced through receipts
    pub max_backlog: Option<i64>,
}

impl Default for TransmitterSettings {
    fn default() -> Self {
        Self {
            index: 0,
            blocking: false,
            receipts: true,
            latency_frequency: 100,
            flush_on: 0,
            single_use: false,
            tx_rate: None,
            max_backlog: None,
        }
    }
}

/// Memory operation chosen from the local and peer region sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOp {
    Signal,
    Write,
    GetAndAdd,
    Read,
}

impl MemoryOp {
    /// Local capacity 0 selects signal (empty peer) or write, 8 selects
    /// atomics, anything else reads
    pub fn select(local_capacity: usize, peer_capacity: usize) -> Self {
        match local_capacity {
            0 if peer_capacity == 0 => MemoryOp::Signal,
            0 => MemoryOp::Write,
            8 => MemoryOp::GetAndAdd,
            _ => MemoryOp::Read,
        }
    }

    /// Bytes accounted per operation; `None` means the message size
    fn fixed_size(&self) -> Option<usize> {
        match self {
            MemoryOp::Signal => Some(8),
            MemoryOp::GetAndAdd => Some(16),
            MemoryOp::Write | MemoryOp::Read => None,
        }
    }
}

pub struct Transmitter {
    settings: TransmitterSettings,
    bus: AnyBus,
    context: Arc<BusContext>,
    correlator: Arc<Correlator>,
    limiter: Option<Arc<CreditLimiter>>,
    stats: Arc<TransmitterStats>,
    stop: Arc<AtomicBool>,
    average: usize,
}

impl Transmitter {
    pub fn new(
        settings: TransmitterSettings,
        bus: AnyBus,
        context: Arc<BusContext>,
        correlator: Arc<Correlator>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let average = context.factory.sizes().average();
        let limiter = settings.max_backlog.map(CreditLimiter::new);
        Self {
            settings,
            bus,
            context,
            correlator,
            limiter,
            stats: Arc::new(TransmitterStats::new()),
            stop,
            average,
        }
    }

    pub fn stats(&self) -> &Arc<TransmitterStats> {
        &self.stats
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Run until stopped or a fatal error occurs
    pub fn run(self) -> Result<()> {
        info!(
            local = %self.context.local(),
            index = self.settings.index,
            blocking = self.settings.blocking,
            "Transmitter started"
        );
        let result = self.transmit();
        self.bus.flush();
        match &result {
            Ok(()) => debug!(index = self.settings.index, "Transmitter stopped"),
            Err(error) => {
                error!(index = self.settings.index, %error, "Transmitter failed");
                self.context.errors.record(error.category());
            }
        }
        result
    }

    fn transmit(&self) -> Result<()> {
        let flow = self.context.flow.clone();
        let mut throttle = self
            .settings
            .tx_rate
            .map(|rate| RateThrottle::for_transmit(rate, self.average));
        let mut cursor = 0usize;
        let mut sent: u64 = 0;

        while !self.stopped() {
            if flow.global().is_excessive() {
                self.stats.begin_backlog();
                self.bus.flush();
                notifier::flush();
                while flow.global().is_excessive() && !self.stopped() {
                    flow.global().wait_normal(BACKLOG_WAIT);
                }
                self.stats.end_backlog();
                continue;
            }

            let peer = match flow.ready().next_ready(&mut cursor, Duration::ZERO) {
                Some(peer) => peer,
                None => {
                    self.bus.flush();
                    notifier::flush();
                    match flow.ready().next_ready(&mut cursor, BACKLOG_WAIT) {
                        Some(peer) => peer,
                        None => continue,
                    }
                }
            };

            let sample = self.settings.latency_frequency > 0 && sent % self.settings.latency_frequency == 0;
            let timestamp = if sample {
                exabus::clock::now_nanos()
            } else if self.settings.blocking {
                BLOCKING_NO_SAMPLE
            } else {
                0
            };
            if self.settings.blocking {
                self.correlator.expect();
            }

            let id = request_id(sent, self.settings.index);
            let bytes = match self.send_one(&peer, id, timestamp) {
                Ok(bytes) => bytes,
                Err(BenchError::Bus(error)) if error.is_benign_race() => {
                    if self.settings.blocking {
                        self.correlator.cancel();
                    }
                    debug!(%peer, %error, "Send raced with peer release");
                    self.context.errors.record(error.category());
                    continue;
                }
                Err(BenchError::Stopped) => break,
                Err(error) => return Err(error),
            };
            self.stats.record_out(bytes);
            sent += 1;

            if let Some(limiter) = &self.limiter {
                if limiter.acquire(self.average as i64) {
                    self.bus.flush();
                    notifier::flush();
                    while limiter.outstanding() > limiter.max() && !self.stopped() {
                        limiter.await_credit(RESPONSE_PARK);
                    }
                }
            }

            if self.settings.flush_on > 0 && sent % self.settings.flush_on == 0 {
                self.bus.flush();
                notifier::flush();
                if self.settings.blocking {
                    let sequence = match self.correlator.await_result(&self.stop) {
                        Some(sequence) => sequence,
                        None => break,
                    };
                    let expected = ((sent - 1) & 0xFFFF) as u32;
                    if self.settings.flush_on == 1 && sequence != 0 && sequence != expected {
                        return Err(BenchError::Correlation {
                            expected,
                            actual: sequence,
                        });
                    }
                }
            }

            if self.settings.single_use {
                self.reconnect(&peer)?;
            }

            if let Some(pause) = throttle.as_mut().and_then(|t| t.record(bytes)) {
                self.bus.flush();
                thread::sleep(pause);
            }
        }
        Ok(())
    }

    /// Drop the connection, wait until the processor has released it, and
    /// connect again
    fn reconnect(&self, peer: &EndPoint) -> Result<()> {
        if let Err(error) = self.bus.disconnect(peer) {
            if !error.is_benign_race() {
                return Err(error.into());
            }
        }
        self.context.flow.ready().wait_absent(peer, RECONNECT_WAIT);
        match self.bus.connect(peer) {
            Err(error) if !error.is_benign_race() => Err(error.into()),
            _ => Ok(()),
        }
    }

    fn receipt(&self, timestamp: i64) -> Option<Receipt> {
        let memory_blocking = self.settings.blocking && self.bus.as_memory().is_some();
        if !self.settings.receipts && !memory_blocking {
            return None;
        }

        let mut receipt = Receipt::new(timestamp.max(0));
        if let Some(limiter) = &self.limiter {
            let limiter = limiter.clone();
            let credit = self.average as i64;
            receipt = receipt.on_completion(move |_| limiter.release(credit));
        }
        if memory_blocking {
            let correlator = self.correlator.clone();
            receipt = receipt.on_completion(move |_| {
                if let Err(error) = correlator.signal_result(0) {
                    error!(%error, "Memory operation completed twice");
                }
            });
        }
        Some(receipt)
    }

    /// Send one request; returns the bytes accounted
    fn send_one(&self, peer: &EndPoint, id: i32, timestamp: i64) -> Result<usize> {
        match &self.bus {
            AnyBus::Message(bus) => self.send_message(bus.as_ref(), peer, id, timestamp),
            AnyBus::Memory(bus) => self.memory_op(bus.as_ref(), peer, id, timestamp),
        }
    }

    fn send_message(&self, bus: &dyn MessageBus, peer: &EndPoint, id: i32, timestamp: i64) -> Result<usize> {
        let message = self.context.factory.build(id, false, timestamp)?;
        let len = message.len();
        bus.send(peer, message, self.receipt(timestamp))
            .map_err(|rejected| rejected.into_error())?;
        Ok(len)
    }

    fn memory_op(&self, bus: &dyn MemoryBus, peer: &EndPoint, id: i32, timestamp: i64) -> Result<usize> {
        let local_capacity = bus.capacity(None)?;
        let peer_capacity = bus.capacity(Some(peer))?;
        let op = MemoryOp::select(local_capacity, peer_capacity);

        let size = op.fixed_size().unwrap_or_else(|| self.context.factory.sizes().max);
        let span = if op == MemoryOp::GetAndAdd { 8 } else { size };
        if op != MemoryOp::Signal && span > peer_capacity {
            return Err(BenchError::config(
                format!(
                    "{} byte operation does not fit the {} byte region of {}",
                    span, peer_capacity, peer
                ),
                Some("message_size"),
            ));
        }
        let offset = rand::thread_rng().gen_range(0..=peer_capacity - span.min(peer_capacity));
        let receipt = self.receipt(timestamp);

        let outcome = match op {
            MemoryOp::Signal => bus.signal(peer, SIGNAL_VALUE, receipt),
            MemoryOp::Write => {
                let message = self.context.factory.build_sized(id, false, timestamp, size)?;
                bus.write(peer, offset, message, receipt)
            }
            MemoryOp::GetAndAdd => bus.get_and_add(peer, offset - offset % 8, 1, receipt),
            MemoryOp::Read => bus.read(peer, offset, size, receipt),
        };
        outcome.map_err(|rejected| rejected.into_error())?;
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_op_selection() {
        assert_eq!(MemoryOp::select(0, 0), MemoryOp::Signal);
        assert_eq!(MemoryOp::select(0, 64), MemoryOp::Write);
        assert_eq!(MemoryOp::select(8, 64), MemoryOp::GetAndAdd);
        assert_eq!(MemoryOp::select(4096, 64), MemoryOp::Read);
        assert_eq!(MemoryOp::Signal.fixed_size(), Some(8));
        assert_eq!(MemoryOp::GetAndAdd.fixed_size(), Some(16));
    }

    #[test]
    fn test_correlator_publishes_last_response() {
        let correlator = Correlator::new(Duration::from_micros(50));
        let stop = AtomicBool::new(false);
        correlator.expect();
        correlator.expect();
        correlator.signal_result(4).unwrap();
        assert_eq!(correlator.pending(), 1);
        correlator.signal_result(5).unwrap();
        assert_eq!(correlator.await_result(&stop), Some(5));
    }

    #[test]
    fn test_correlator_rejects_unsolicited_response() {
        let correlator = Correlator::new(Duration::ZERO);
        let error = correlator.signal_result(1).unwrap_err();
        assert!(matches!(error, BenchError::Disposal { .. }));
        assert_eq!(correlator.pending(), 0);
    }

    #[test]
    fn test_correlator_wakes_parked_waiter() {
        let correlator = Arc::new(Correlator::new(Duration::ZERO));
        correlator.expect();
        let responder = {
            let correlator = correlator.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                correlator.signal_result(77).unwrap();
                notifier::flush();
            })
        };
        let stop = AtomicBool::new(false);
        assert_eq!(correlator.await_result(&stop), Some(77));
        responder.join().unwrap();
    }

    #[test]
    fn test_correlator_wait_observes_stop() {
        let correlator = Correlator::new(Duration::ZERO);
        correlator.expect();
        let stop = AtomicBool::new(true);
        assert_eq!(correlator.await_result(&stop), None);
    }
}
