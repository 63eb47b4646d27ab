//! Workload configuration.
//!
//! `BenchConfig` is the raw, serde-loaded option set: an optional TOML file
//! layered with `EXABUS_`-prefixed environment variables (nested keys use
//! `__`, e.g. `EXABUS_DEPOT__DEFAULT_ENDPOINT`). [`BenchConfig::resolve`]
//! parses units, applies option constraints and produces the
//! [`WorkloadSettings`] the harness runs from.

use crate::error::{BenchError, Result};
use crate::message::{SizeRange, HEADER_SIZE};
use crate::relay::RelayLedgerConfig;
use crate::report::{ReportFormat, Warmup};
use crate::units::{parse_duration, parse_rate, parse_size, parse_size_range};
use anyhow::Context;
use config_crate::{Config, Environment, File};
use exabus::{BufferConfig, DepotConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Shards per available core for reentrant processing
const REENTRANT_SHARDS_PER_CORE: usize = 17;

/// Raw workload options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub log_level: String,

    /// Local endpoint; empty uses the depot default
    pub bind: String,
    /// Whitespace separated peer endpoints, ranges allowed
    pub peers: String,

    /// Processor threads; unset or 0 processes reentrantly
    pub rx_threads: Option<usize>,
    /// Transmitter threads; unset means 1, or 0 in relay mode
    pub tx_threads: Option<usize>,

    /// Fixed size (`4KB`) or range (`1KB..64KB`)
    pub message_size: String,
    /// Payload write/read granularity; `0` writes whole messages
    pub chunk_size: String,
    /// Reuse one payload for every message
    pub cached: bool,
    /// Flush after this many sends; 0 leaves flushing to the transport
    pub flush_frequency: u64,

    pub tx_rate: Option<String>,
    pub rx_rate: Option<String>,
    /// Outstanding transmit bytes before the sender waits for receipts
    pub tx_max_backlog: Option<String>,

    /// Timestamp every n-th request
    pub latency_frequency: u64,
    pub receipts: bool,

    /// Do not connect to peers; wait to be connected
    pub polite: bool,
    /// Wait for each response before the next request
    pub block: bool,
    /// Busy-wait bound before parking for a response
    pub block_spin: Option<String>,
    pub relay: bool,
    pub ignore_flow_control: bool,
    /// Pull events from a polled collector instead of a delivery thread
    pub poll: bool,
    /// Reconnect after every request
    pub single_use: bool,

    pub report_format: ReportFormat,
    pub report_interval: String,
    /// Message count (`10000`) or duration (`5s`) excluded from lifetime stats
    pub warmup: Option<String>,

    pub relay_ledger: RelayLedgerConfig,
    pub depot: DepotConfig,
    pub buffers: BufferConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            bind: String::new(),
            peers: String::new(),
            rx_threads: None,
            tx_threads: None,
            message_size: "4096".to_string(),
            chunk_size: "0".to_string(),
            cached: false,
            flush_frequency: 0,
            tx_rate: None,
            rx_rate: None,
            tx_max_backlog: None,
            latency_frequency: 100,
            receipts: true,
            polite: false,
            block: false,
            block_spin: None,
            relay: false,
            ignore_flow_control: false,
            poll: false,
            single_use: false,
            report_format: ReportFormat::Text,
            report_interval: "5s".to_string(),
            warmup: None,
            relay_ledger: RelayLedgerConfig::default(),
            depot: DepotConfig::default(),
            buffers: BufferConfig::default(),
        }
    }
}

/// How inbound events reach the processors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Inline on the delivering thread, sharded by peer
    Reentrant { shards: usize },
    /// One queue-fed worker thread per shard
    Threaded { threads: usize },
    /// A single worker polling the bus
    Polled,
}

impl ReceiveMode {
    pub fn shards(&self) -> usize {
        match self {
            ReceiveMode::Reentrant { shards } => *shards,
            ReceiveMode::Threaded { threads } => *threads,
            ReceiveMode::Polled => 1,
        }
    }
}

/// Validated workload options
#[derive(Debug, Clone)]
pub struct WorkloadSettings {
    pub bind: String,
    pub peers: String,
    pub receive: ReceiveMode,
    pub tx_threads: usize,
    pub sizes: SizeRange,
    pub chunk_size: usize,
    pub cached: bool,
    pub flush_frequency: u64,
    pub tx_rate: Option<u64>,
    pub rx_rate: Option<u64>,
    pub tx_max_backlog: Option<i64>,
    pub latency_frequency: u64,
    pub receipts: bool,
    pub polite: bool,
    pub blocking: bool,
    pub block_spin: Duration,
    pub relay: bool,
    pub flow_control: bool,
    pub single_use: bool,
    pub report_format: ReportFormat,
    pub report_interval: Duration,
    pub warmup: Option<Warmup>,
    pub relay_ledger: RelayLedgerConfig,
    pub depot: DepotConfig,
    pub buffers: BufferConfig,
}

impl BenchConfig {
    /// Load from an optional TOML file with environment overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!("Loading workload config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        // Override with environment variables (EXABUS_ prefix)
        builder = builder.add_source(
            Environment::with_prefix("EXABUS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Parse and cross-check the options
    pub fn resolve(&self) -> Result<WorkloadSettings> {
        self.depot.validate()?;
        self.buffers.validate()?;

        let tx_threads = self
            .tx_threads
            .unwrap_or(if self.relay { 0 } else { 1 });
        if self.relay && tx_threads > 0 {
            return Err(BenchError::config(
                "relay mode cannot run transmit threads",
                Some("tx_threads"),
            ));
        }

        let tx_max_backlog = self
            .tx_max_backlog
            .as_deref()
            .map(parse_size)
            .transpose()?
            .map(|bytes| bytes as i64);
        if tx_max_backlog.is_some() && !self.receipts {
            return Err(BenchError::config(
                "a transmit backlog limit needs receipts",
                Some("tx_max_backlog"),
            ));
        }

        let (mut min, mut max) = parse_size_range(&self.message_size)?;
        if min < HEADER_SIZE || max < HEADER_SIZE {
            warn!(
                message_size = %self.message_size,
                header = HEADER_SIZE,
                "Message size raised to the header size"
            );
            min = min.max(HEADER_SIZE);
            max = max.max(HEADER_SIZE);
        }
        let sizes = SizeRange::new(min, max);
        if self.cached && !sizes.is_fixed() {
            return Err(BenchError::config(
                "cached messages need a fixed size",
                Some("cached"),
            ));
        }
        if let Some(capacity) = self.buffers.pooled_capacity().filter(|_| !self.cached) {
            if sizes.max > capacity {
                return Err(BenchError::config(
                    format!(
                        "messages of up to {} bytes cannot fit a {} byte buffer pool",
                        sizes.max, capacity
                    ),
                    Some("buffers.max_pooled_bytes"),
                ));
            }
        }
        let chunk_size = parse_size(&self.chunk_size)?.min(sizes.min);

        let rx_rate = self.rx_rate.as_deref().map(parse_rate).transpose()?;
        let receive = self.receive_mode(rx_rate.is_some())?;

        let warmup = self.warmup.as_deref().map(Warmup::parse).transpose()?;
        let report_interval = parse_duration(&self.report_interval)?;
        if report_interval.is_zero() {
            return Err(BenchError::config("must be positive", Some("report_interval")));
        }

        Ok(WorkloadSettings {
            bind: self.bind.trim().to_string(),
            peers: self.peers.clone(),
            receive,
            tx_threads,
            sizes,
            chunk_size,
            cached: self.cached,
            flush_frequency: self.flush_frequency,
            tx_rate: self.tx_rate.as_deref().map(parse_rate).transpose()?,
            rx_rate,
            tx_max_backlog,
            latency_frequency: self.latency_frequency,
            receipts: self.receipts,
            polite: self.polite,
            blocking: self.block,
            block_spin: self
                .block_spin
                .as_deref()
                .map(parse_duration)
                .transpose()?
                .unwrap_or(Duration::ZERO),
            relay: self.relay,
            flow_control: !self.ignore_flow_control,
            single_use: self.single_use,
            report_format: self.report_format,
            report_interval,
            warmup,
            relay_ledger: self.relay_ledger.clone(),
            depot: self.depot.clone(),
            buffers: self.buffers.clone(),
        })
    }

    /// Inbound throttling and polling need a processor thread
    fn receive_mode(&self, throttled: bool) -> Result<ReceiveMode> {
        let needs_thread = throttled || self.poll;
        match self.rx_threads {
            Some(threads) if threads > 0 => {
                if self.poll && threads > 1 {
                    warn!(rx_threads = threads, "Polling uses a single processor thread");
                }
                Ok(if self.poll {
                    ReceiveMode::Polled
                } else {
                    ReceiveMode::Threaded { threads }
                })
            }
            Some(_) if needs_thread => Err(BenchError::config(
                "polling and receive rate limits need processor threads",
                Some("rx_threads"),
            )),
            None if needs_thread => {
                info!("Switching to threaded processing");
                Ok(if self.poll {
                    ReceiveMode::Polled
                } else {
                    ReceiveMode::Threaded { threads: 1 }
                })
            }
            _ => {
                let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
                Ok(ReceiveMode::Reentrant {
                    shards: cores * REENTRANT_SHARDS_PER_CORE,
                })
            }
        }
    }
}

impl WorkloadSettings {
    /// Flush interval of a transmitter; blocking always flushes each request batch
    pub fn transmit_flush(&self) -> u64 {
        if self.blocking {
            self.flush_frequency.max(1)
        } else {
            self.flush_frequency
        }
    }
}
