//! Workload Harness
//!
//! Wires one bus to its collector, processors and transmitters according to
//! the resolved [`WorkloadSettings`], and owns their threads until
//! [`Workload::stop`].

use crate::config::{BenchConfig, ReceiveMode, WorkloadSettings};
use crate::error::{BenchError, Result};
use crate::message::MessageFactory;
use crate::processor::{BusContext, EventProcessor, EventSource, ProcessorSettings};
use crate::relay::RelayLedger;
use crate::stats::{ErrorCounter, StatsSample, TransmitterStats};
use crate::transmitter::{Correlator, Transmitter, TransmitterSettings};
use exabus::{
    parse_endpoints, AnyBus, BusError, BusKind, DemultiplexingCollector, Depot, EndPoint, FlowControl,
    QueueingEventCollector,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct Workload {
    settings: WorkloadSettings,
    depot: Arc<Depot>,
    bus: AnyBus,
    context: Arc<BusContext>,
    processors: Vec<Arc<EventProcessor>>,
    demux: Option<Arc<DemultiplexingCollector<EventProcessor>>>,
    processor_threads: Vec<JoinHandle<()>>,
    transmitter_stats: Vec<Arc<TransmitterStats>>,
    transmitters: Vec<JoinHandle<Result<()>>>,
    stop: Arc<AtomicBool>,
    errors: Arc<ErrorCounter>,
}

impl Workload {
    /// Start with a depot built from the configuration
    pub fn start(config: &BenchConfig) -> Result<Self> {
        let depot = Depot::from_config(&config.depot)?;
        Self::start_with_depot(config, depot)
    }

    /// Start on an existing depot, sharing its transports with other workloads
    pub fn start_with_depot(config: &BenchConfig, depot: Arc<Depot>) -> Result<Self> {
        let settings = config.resolve()?;
        let stop = Arc::new(AtomicBool::new(false));
        let errors = Arc::new(ErrorCounter::new());

        let bus = bind(&depot, &settings)?;
        let local = bus.local_endpoint().clone();
        let targets: Vec<EndPoint> = parse_endpoints(&depot, &settings.peers)?
            .into_iter()
            .filter(|peer| *peer != local)
            .collect();
        if settings.tx_threads > 0 && targets.is_empty() && !settings.polite {
            warn!(%local, "No peers to transmit to");
        }

        let mut factory = MessageFactory::new(
            settings.sizes,
            settings.chunk_size,
            settings.buffers.build()?,
            errors.clone(),
            stop.clone(),
        );
        if settings.cached {
            factory = factory.with_cached_payload()?;
        }

        let correlators: Vec<Arc<Correlator>> = (0..settings.tx_threads)
            .map(|_| Arc::new(Correlator::new(settings.block_spin)))
            .collect();
        let flow = Arc::new(FlowControl::new(local.clone(), targets.clone(), settings.flow_control));
        let context = Arc::new(BusContext::new(
            &bus,
            flow,
            targets.clone(),
            correlators.clone(),
            Arc::new(factory),
            Arc::new(RelayLedger::from_config(&settings.relay_ledger, errors.clone())?),
            errors.clone(),
        ));

        let shards = settings.receive.shards();
        let processor_settings = ProcessorSettings {
            relay: settings.relay,
            blocking: settings.blocking,
            flush_on: settings.flush_frequency.max(1),
            chunk_size: settings.chunk_size,
            single_use: settings.single_use,
            rx_rate: settings.rx_rate.map(|rate| (rate / shards as u64).max(1)),
        };
        let processors: Vec<Arc<EventProcessor>> = (0..shards)
            .map(|index| Arc::new(EventProcessor::new(index, context.clone(), processor_settings.clone())))
            .collect();

        let mut processor_threads = Vec::new();
        let mut demux = None;
        match settings.receive {
            ReceiveMode::Polled => {
                let collector = Arc::new(QueueingEventCollector::new());
                bus.set_event_collector(collector.clone())?;
                processor_threads.push(processors[0].start_threaded(EventSource::Polled(collector), stop.clone())?);
            }
            ReceiveMode::Threaded { .. } | ReceiveMode::Reentrant { .. } => {
                for processor in &processors {
                    if matches!(settings.receive, ReceiveMode::Reentrant { .. }) {
                        processor.start_reentrant()?;
                    } else {
                        processor_threads.push(processor.start_threaded(EventSource::Queue, stop.clone())?);
                    }
                }
                let collector = Arc::new(DemultiplexingCollector::new(processors.clone())?);
                bus.set_event_collector(collector.clone())?;
                collector.set_bus(&bus);
                demux = Some(collector);
            }
        }

        bus.open()?;
        info!(
            %local,
            kind = %bus.kind(),
            receive = ?settings.receive,
            tx_threads = settings.tx_threads,
            peers = targets.len(),
            "Workload started"
        );

        if !settings.polite {
            for peer in &targets {
                match bus.connect(peer) {
                    Ok(()) => debug!(%local, %peer, "Connect requested"),
                    Err(error) if error.is_benign_race() => warn!(%peer, %error, "Connect failed"),
                    Err(error) => {
                        stop.store(true, Ordering::Release);
                        return Err(error.into());
                    }
                }
            }
        }

        let mut transmitter_stats = Vec::new();
        let mut transmitters = Vec::new();
        for (index, correlator) in correlators.into_iter().enumerate() {
            let transmitter = Transmitter::new(
                TransmitterSettings {
                    index,
                    blocking: settings.blocking,
                    receipts: settings.receipts,
                    latency_frequency: settings.latency_frequency,
                    flush_on: settings.transmit_flush(),
                    single_use: settings.single_use,
                    tx_rate: settings
                        .tx_rate
                        .map(|rate| (rate / settings.tx_threads as u64).max(1)),
                    max_backlog: settings.tx_max_backlog,
                },
                bus.clone(),
                context.clone(),
                correlator,
                stop.clone(),
            );
            transmitter_stats.push(transmitter.stats().clone());
            let name = format!("exabus-tx-{}-{}", local.address(), index);
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || transmitter.run())
                .map_err(|e| BenchError::config(format!("cannot spawn {}: {}", name, e), None))?;
            transmitters.push(handle);
        }

        Ok(Self {
            settings,
            depot,
            bus,
            context,
            processors,
            demux,
            processor_threads,
            transmitter_stats,
            transmitters,
            stop,
            errors,
        })
    }

    pub fn settings(&self) -> &WorkloadSettings {
        &self.settings
    }

    pub fn depot(&self) -> &Arc<Depot> {
        &self.depot
    }

    pub fn local(&self) -> &EndPoint {
        self.context.local()
    }

    pub fn processors(&self) -> &[Arc<EventProcessor>] {
        &self.processors
    }

    pub fn errors(&self) -> &Arc<ErrorCounter> {
        &self.errors
    }

    /// Sum the counters of every worker
    pub fn sample(&self) -> StatsSample {
        let mut sample = StatsSample::empty(Instant::now());
        for processor in &self.processors {
            sample.add_processor(processor.stats());
        }
        for stats in &self.transmitter_stats {
            sample.add_transmitter(stats);
        }
        if let Some(demux) = &self.demux {
            sample.add_collected(demux.received_bytes());
        }
        sample.errors = self.errors.total();
        sample
    }

    /// True once a processor failed or a transmitter exited on its own
    pub fn has_failed(&self) -> bool {
        self.processors.iter().any(|p| p.has_failed())
            || (!self.stop.load(Ordering::Acquire) && self.transmitters.iter().any(|t| t.is_finished()))
    }

    /// Fatal errors recorded by the processors so far
    pub fn failures(&self) -> Vec<BenchError> {
        self.processors.iter().filter_map(|p| p.failure()).collect()
    }

    /// Stop every worker, close the bus, and return the fatal errors observed
    pub fn stop(mut self) -> Vec<BenchError> {
        info!(local = %self.context.local(), "Stopping workload");
        self.stop.store(true, Ordering::Release);
        self.context.flow.wake_all();

        let mut failures = Vec::new();
        for handle in self.transmitters.drain(..) {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(error)) => failures.push(error),
                Err(_) => failures.push(BenchError::disposal("transmitter panicked")),
            }
        }

        if let Err(error) = self.bus.close() {
            if !is_closed(&error) {
                warn!(%error, "Close failed");
            }
        }

        for handle in self.processor_threads.drain(..) {
            if handle.join().is_err() {
                failures.push(BenchError::disposal("processor panicked"));
            }
        }
        failures.extend(self.failures());
        failures
    }
}

fn is_closed(error: &BusError) -> bool {
    matches!(error, BusError::Closed { .. })
}

/// Create the local bus: a message bus when the transport offers one,
/// otherwise a memory bus
fn bind(depot: &Depot, settings: &WorkloadSettings) -> Result<AnyBus> {
    let name = if settings.bind.is_empty() {
        depot.default_endpoint()
    } else {
        settings.bind.as_str()
    };
    let endpoint = depot.resolve_endpoint(name)?;
    match depot.create_bus(Some(&endpoint), BusKind::Message) {
        Ok(bus) => Ok(bus),
        Err(BusError::UnsupportedBusKind { .. }) => {
            debug!(%endpoint, "No message bus, binding a memory bus");
            Ok(depot.create_bus(Some(&endpoint), BusKind::Memory)?)
        }
        Err(error) => Err(error.into()),
    }
}
