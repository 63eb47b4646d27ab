//! Periodic Reporting
//!
//! The reporter turns consecutive [`StatsSample`]s into a "now" line (the
//! last interval) and a "life" line (everything since warm-up ended).
//! Warm-up, given as a message count or a duration, restarts whenever the
//! workload loses all of its connections.

use crate::error::{BenchError, Result};
use crate::stats::{HistogramSnapshot, StatsSample};
use crate::units::{format_bit_rate, format_bytes, format_nanos, parse_duration};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::{Duration, Instant};

/// Tabular output repeats its header every this many rows
const TABLE_HEADER_EVERY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Text,
    Tabular,
    Json,
}

/// Portion of the run excluded from lifetime statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Warmup {
    Messages(u64),
    Duration(Duration),
}

impl Warmup {
    /// A bare integer is a message count; anything with a unit a duration
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if let Ok(count) = trimmed.parse::<u64>() {
            return Ok(Warmup::Messages(count));
        }
        parse_duration(trimmed)
            .map(Warmup::Duration)
            .map_err(|_| BenchError::config(format!("invalid warm-up '{}'", text), Some("warmup")))
    }
}

/// One rendered report line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportLine {
    pub scope: &'static str,
    pub elapsed_secs: f64,
    pub messages_in_per_sec: f64,
    pub messages_out_per_sec: f64,
    pub bytes_in_per_sec: f64,
    pub bytes_out_per_sec: f64,
    pub receipt_latency_nanos: Option<f64>,
    pub response_latency_nanos: Option<f64>,
    /// Interval time per response received
    pub effective_latency_nanos: Option<f64>,
    pub response_min_nanos: Option<u64>,
    pub response_max_nanos: Option<u64>,
    pub latency_p50_micros: Option<u64>,
    pub latency_p99_micros: Option<u64>,
    pub local_backlog_pct: f64,
    pub transmit_backlog_pct: f64,
    pub remote_backlog_per_sec: f64,
    pub pending_out_messages: u64,
    pub pending_in_bytes: Option<u64>,
    pub connections: i64,
    pub errors: u64,
}

pub struct Reporter {
    format: ReportFormat,
    warmup: Option<Warmup>,
    tx_threads: usize,
    last: StatsSample,
    baseline: StatsSample,
    warm_since: Instant,
    warm_messages: u64,
    warm: bool,
    life_min: Option<u64>,
    life_max: Option<u64>,
    rows: usize,
}

impl Reporter {
    pub fn new(format: ReportFormat, warmup: Option<Warmup>, tx_threads: usize, initial: StatsSample) -> Self {
        Self {
            format,
            warm: warmup.is_none(),
            warmup,
            tx_threads,
            warm_since: initial.at,
            warm_messages: initial.messages_in + initial.messages_out,
            baseline: initial.clone(),
            last: initial,
            life_min: None,
            life_max: None,
            rows: 0,
        }
    }

    pub fn is_warm(&self) -> bool {
        self.warm
    }

    /// Fold in a new sample; returns the "now" line and, once warm, the "life" line
    pub fn update(&mut self, sample: StatsSample) -> Vec<ReportLine> {
        if self.last.connections > 0 && sample.connections <= 0 && self.warmup.is_some() {
            self.restart_warmup(&sample);
        }

        let now = line("now", &self.last, &sample, self.tx_threads, sample.response_min, sample.response_max);
        let mut lines = vec![now];

        if self.warm {
            self.life_min = merge(self.life_min, sample.response_min, u64::min);
            self.life_max = merge(self.life_max, sample.response_max, u64::max);
            lines.push(line(
                "life",
                &self.baseline,
                &sample,
                self.tx_threads,
                self.life_min,
                self.life_max,
            ));
        } else if self.warmed_up(&sample) {
            tracing::info!("Warm-up complete");
            self.warm = true;
            self.baseline = sample.clone();
        } else {
            self.baseline = sample.clone();
        }

        self.last = sample;
        lines
    }

    fn restart_warmup(&mut self, sample: &StatsSample) {
        tracing::info!("All connections lost, restarting warm-up");
        self.warm = false;
        self.warm_since = sample.at;
        self.warm_messages = sample.messages_in + sample.messages_out;
        self.baseline = sample.clone();
        self.life_min = None;
        self.life_max = None;
    }

    fn warmed_up(&self, sample: &StatsSample) -> bool {
        match self.warmup {
            None => true,
            Some(Warmup::Duration(duration)) => sample.at.saturating_duration_since(self.warm_since) >= duration,
            Some(Warmup::Messages(count)) => {
                (sample.messages_in + sample.messages_out).saturating_sub(self.warm_messages) >= count
            }
        }
    }

    /// Render a line in the configured format
    pub fn render(&mut self, line: &ReportLine) -> String {
        match self.format {
            ReportFormat::Text => render_text(line),
            ReportFormat::Json => serde_json::to_string(line).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e)),
            ReportFormat::Tabular => {
                let mut out = String::new();
                if self.rows % TABLE_HEADER_EVERY == 0 {
                    out.push_str(TABLE_HEADER);
                    out.push('\n');
                }
                self.rows += 1;
                out.push_str(&render_row(line));
                out
            }
        }
    }
}

fn merge(a: Option<u64>, b: Option<u64>, f: fn(u64, u64) -> u64) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(f(a, b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn per_sec(delta: u64, secs: f64) -> f64 {
    if secs > 0.0 {
        delta as f64 / secs
    } else {
        0.0
    }
}

fn average(total: u64, samples: u64) -> Option<f64> {
    (samples > 0).then(|| total as f64 / samples as f64)
}

fn line(
    scope: &'static str,
    from: &StatsSample,
    to: &StatsSample,
    tx_threads: usize,
    response_min: Option<u64>,
    response_max: Option<u64>,
) -> ReportLine {
    let elapsed = to.at.saturating_duration_since(from.at);
    let secs = elapsed.as_secs_f64();
    let nanos = elapsed.as_nanos() as f64;
    let histogram: HistogramSnapshot = to.histogram.diff(&from.histogram);
    let responses = to.responses_in.saturating_sub(from.responses_in);

    let pct = |delta: u64, lanes: usize| {
        if nanos > 0.0 && lanes > 0 {
            (delta as f64 * 100.0 / (nanos * lanes as f64)).min(100.0)
        } else {
            0.0
        }
    };

    ReportLine {
        scope,
        elapsed_secs: secs,
        messages_in_per_sec: per_sec(to.messages_in.saturating_sub(from.messages_in), secs),
        messages_out_per_sec: per_sec(to.messages_out.saturating_sub(from.messages_out), secs),
        bytes_in_per_sec: per_sec(to.bytes_in.saturating_sub(from.bytes_in), secs),
        bytes_out_per_sec: per_sec(to.bytes_out.saturating_sub(from.bytes_out), secs),
        receipt_latency_nanos: average(
            to.receipt_nanos.saturating_sub(from.receipt_nanos),
            to.receipt_samples.saturating_sub(from.receipt_samples),
        ),
        response_latency_nanos: average(
            to.response_nanos.saturating_sub(from.response_nanos),
            to.response_samples.saturating_sub(from.response_samples),
        ),
        effective_latency_nanos: (responses > 0).then(|| nanos / responses as f64),
        response_min_nanos: response_min,
        response_max_nanos: response_max,
        latency_p50_micros: histogram.percentile(50.0),
        latency_p99_micros: histogram.percentile(99.0),
        local_backlog_pct: pct(to.local_backlog_nanos.saturating_sub(from.local_backlog_nanos), 1),
        transmit_backlog_pct: pct(to.tx_backlog_nanos.saturating_sub(from.tx_backlog_nanos), tx_threads),
        remote_backlog_per_sec: per_sec(
            to.remote_backlog_events.saturating_sub(from.remote_backlog_events),
            secs,
        ),
        pending_out_messages: to.messages_out.saturating_sub(to.receipts_in),
        pending_in_bytes: to.collected_bytes.map(|collected| collected.saturating_sub(to.bytes_in)),
        connections: to.connections,
        errors: to.errors.saturating_sub(from.errors),
    }
}

fn latency(nanos: Option<f64>) -> String {
    nanos.map(format_nanos).unwrap_or_else(|| "-".to_string())
}

fn render_text(line: &ReportLine) -> String {
    let mut out = format!(
        "{:<4} in {:.0} msg/s {} | out {:.0} msg/s {}",
        line.scope,
        line.messages_in_per_sec,
        format_bit_rate(line.bytes_in_per_sec),
        line.messages_out_per_sec,
        format_bit_rate(line.bytes_out_per_sec),
    );
    if line.receipt_latency_nanos.is_some() {
        let _ = write!(out, " | receipt {}", latency(line.receipt_latency_nanos));
    }
    if line.response_latency_nanos.is_some() || line.effective_latency_nanos.is_some() {
        let _ = write!(
            out,
            " | response avg {} eff {} min {} max {}",
            latency(line.response_latency_nanos),
            latency(line.effective_latency_nanos),
            latency(line.response_min_nanos.map(|n| n as f64)),
            latency(line.response_max_nanos.map(|n| n as f64)),
        );
    }
    let _ = write!(
        out,
        " | backlog local {:.1}% tx {:.1}% remote {:.1}/s | pending out {} in {} | conn {} | errors +{}",
        line.local_backlog_pct,
        line.transmit_backlog_pct,
        line.remote_backlog_per_sec,
        line.pending_out_messages,
        line.pending_in_bytes.map(format_bytes).unwrap_or_else(|| "-".to_string()),
        line.connections,
        line.errors,
    );
    out
}

const TABLE_HEADER: &str =
    "scope    in/s     in-rate    out/s    out-rate   receipt    response   eff        p99us   tx-bl%  conn  err";

fn render_row(line: &ReportLine) -> String {
    format!(
        "{:<5} {:>8.0} {:>11} {:>8.0} {:>11} {:>10} {:>10} {:>10} {:>7} {:>7.1} {:>5} {:>4}",
        line.scope,
        line.messages_in_per_sec,
        format_bit_rate(line.bytes_in_per_sec),
        line.messages_out_per_sec,
        format_bit_rate(line.bytes_out_per_sec),
        latency(line.receipt_latency_nanos),
        latency(line.response_latency_nanos),
        latency(line.effective_latency_nanos),
        line.latency_p99_micros
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string()),
        line.transmit_backlog_pct,
        line.connections,
        line.errors,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(at: Instant, messages_out: u64, connections: i64) -> StatsSample {
        let mut sample = StatsSample::empty(at);
        sample.messages_out = messages_out;
        sample.bytes_out = messages_out * 1_000;
        sample.receipts_in = messages_out;
        sample.connections = connections;
        sample
    }

    #[test]
    fn test_warmup_parsing() {
        assert_eq!(Warmup::parse("10000").unwrap(), Warmup::Messages(10_000));
        assert_eq!(Warmup::parse("5s").unwrap(), Warmup::Duration(Duration::from_secs(5)));
        assert!(Warmup::parse("soon").is_err());
    }

    #[test]
    fn test_now_line_rates() {
        let t0 = Instant::now();
        let mut reporter = Reporter::new(ReportFormat::Text, None, 1, sample(t0, 0, 1));
        let mut second = sample(t0 + Duration::from_secs(2), 1_000, 1);
        second.responses_in = 500;
        second.response_samples = 5;
        second.response_nanos = 50_000;
        second.tx_backlog_nanos = 500_000_000;

        let lines = reporter.update(second);
        assert_eq!(lines.len(), 2);
        let now = &lines[0];
        assert_eq!(now.scope, "now");
        assert_eq!(now.messages_out_per_sec, 500.0);
        assert_eq!(now.bytes_out_per_sec, 500_000.0);
        assert_eq!(now.response_latency_nanos, Some(10_000.0));
        assert_eq!(now.effective_latency_nanos, Some(4_000_000.0));
        assert_eq!(now.transmit_backlog_pct, 25.0);
        assert_eq!(now.pending_out_messages, 0);
        assert_eq!(now.receipt_latency_nanos, None);

        let text = reporter.render(now);
        assert!(text.starts_with("now"));
        assert!(text.contains("response avg 10.0us"));
    }

    #[test]
    fn test_message_warmup_delays_life_line() {
        let t0 = Instant::now();
        let second = Duration::from_secs(1);
        let mut reporter = Reporter::new(ReportFormat::Json, Some(Warmup::Messages(100)), 1, sample(t0, 0, 1));

        assert_eq!(reporter.update(sample(t0 + second, 50, 1)).len(), 1);
        assert!(!reporter.is_warm());
        assert_eq!(reporter.update(sample(t0 + second * 2, 200, 1)).len(), 1);
        assert!(reporter.is_warm());

        let lines = reporter.update(sample(t0 + second * 4, 400, 1));
        let life = &lines[1];
        assert_eq!(life.scope, "life");
        assert_eq!(life.messages_out_per_sec, 100.0);

        let json = reporter.render(life);
        assert!(json.contains("\"scope\":\"life\""));
    }

    #[test]
    fn test_losing_connections_restarts_warmup() {
        let t0 = Instant::now();
        let second = Duration::from_secs(1);
        let warmup = Some(Warmup::Duration(Duration::from_secs(1)));
        let mut reporter = Reporter::new(ReportFormat::Text, warmup, 1, sample(t0, 0, 1));

        reporter.update(sample(t0 + second, 10, 1));
        assert!(reporter.is_warm());
        assert_eq!(reporter.update(sample(t0 + second * 2, 20, 0)).len(), 1);
        assert!(!reporter.is_warm());
    }

    #[test]
    fn test_tabular_repeats_header() {
        let t0 = Instant::now();
        let mut reporter = Reporter::new(ReportFormat::Tabular, None, 1, sample(t0, 0, 1));
        let lines = reporter.update(sample(t0 + Duration::from_secs(1), 10, 1));
        assert!(reporter.render(&lines[0]).starts_with("scope"));
        assert!(reporter.render(&lines[1]).starts_with("life"));
    }
}
