//! Bus bench entry point

use anyhow::{Context, Result};
use bus_bench::units::parse_duration;
use bus_bench::{BenchConfig, ReportFormat, Reporter, Workload};
use clap::Parser;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local endpoint to bind
    #[arg(short, long)]
    bind: Option<String>,

    /// Peer endpoints, whitespace separated; `host:80..82` ranges expand
    #[arg(short, long)]
    peers: Option<String>,

    /// Message size or range, e.g. `4KB` or `1KB..64KB`
    #[arg(short = 's', long)]
    message_size: Option<String>,

    /// Transmitter threads
    #[arg(long)]
    tx_threads: Option<usize>,

    /// Processor threads; 0 processes reentrantly
    #[arg(long)]
    rx_threads: Option<usize>,

    /// Wait for each response before sending the next request
    #[arg(long)]
    block: bool,

    /// Forward requests to the peers instead of answering them
    #[arg(long)]
    relay: bool,

    /// Do not connect; wait for peers to connect
    #[arg(long)]
    polite: bool,

    /// Poll the bus from a processor thread
    #[arg(long)]
    poll: bool,

    /// Report format
    #[arg(long, value_parser = ["text", "tabular", "json"])]
    report_format: Option<String>,

    /// Stop after this long, e.g. `30s`
    #[arg(short, long)]
    duration: Option<String>,

    /// Log level used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn apply(self, config: &mut BenchConfig) {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(peers) = self.peers {
            config.peers = peers;
        }
        if let Some(size) = self.message_size {
            config.message_size = size;
        }
        if self.tx_threads.is_some() {
            config.tx_threads = self.tx_threads;
        }
        if self.rx_threads.is_some() {
            config.rx_threads = self.rx_threads;
        }
        config.block |= self.block;
        config.relay |= self.relay;
        config.polite |= self.polite;
        config.poll |= self.poll;
        config.report_format = match self.report_format.as_deref() {
            Some("tabular") => ReportFormat::Tabular,
            Some("json") => ReportFormat::Json,
            Some(_) => ReportFormat::Text,
            None => config.report_format,
        };
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = BenchConfig::load(args.config.as_deref())?;
    let duration = args
        .duration
        .as_deref()
        .map(parse_duration)
        .transpose()
        .context("Invalid --duration")?;
    let print_config = args.print_config;
    args.apply(&mut config);
    if print_config {
        print!("{}", toml::to_string_pretty(&config).context("Failed to render configuration")?);
        return Ok(());
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!("bus_bench={level},exabus={level},warn", level = config.log_level).into()
        }))
        .with(fmt::layer())
        .init();

    info!("Starting bus bench");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let workload = Workload::start(&config).context("Failed to start workload")?;
    let settings = workload.settings().clone();
    let mut reporter = Reporter::new(
        settings.report_format,
        settings.warmup,
        settings.tx_threads,
        workload.sample(),
    );

    let started = Instant::now();
    let tick = Duration::from_millis(100).min(settings.report_interval);
    let mut next_report = started + settings.report_interval;
    loop {
        if workload.has_failed() {
            error!("Workload failed, stopping");
            break;
        }
        if duration.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        if Instant::now() >= next_report {
            next_report += settings.report_interval;
            for line in reporter.update(workload.sample()) {
                println!("{}", reporter.render(&line));
            }
        }
        thread::sleep(tick);
    }

    let final_sample = workload.sample();
    let failures = workload.stop();
    for line in reporter.update(final_sample) {
        println!("{}", reporter.render(&line));
    }

    if failures.is_empty() {
        info!("Bus bench finished");
        Ok(())
    } else {
        for failure in &failures {
            error!(%failure, category = failure.category(), "Workload error");
        }
        anyhow::bail!("{} fatal workload error(s)", failures.len())
    }
}
