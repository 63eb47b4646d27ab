//! Bus Bench
//!
//! Producer/consumer workload over exabus transports. Transmitters drive
//! requests to peers under backlog flow control, event processors consume
//! and answer them (optionally relaying to a further hop), and the reporter
//! turns the collected counters into throughput and latency lines.

pub mod config;
pub mod error;
pub mod harness;
pub mod message;
pub mod processor;
pub mod relay;
pub mod report;
pub mod stats;
pub mod throttle;
pub mod transmitter;
pub mod units;

pub use config::{BenchConfig, ReceiveMode, WorkloadSettings};
pub use error::{BenchError, Result};
pub use harness::Workload;
pub use message::{MessageFactory, MessageHeader, SizeRange, HEADER_SIZE};
pub use processor::{BusContext, EventProcessor, EventSource, ProcessorSettings};
pub use relay::{RelayLedger, RelayLedgerConfig};
pub use report::{ReportFormat, ReportLine, Reporter, Warmup};
pub use stats::{ErrorCounter, ProcessorStats, StatsSample, TransmitterStats};
pub use throttle::RateThrottle;
pub use transmitter::{Correlator, Transmitter, TransmitterSettings};
