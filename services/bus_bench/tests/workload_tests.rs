//! Workloads running against each other over a shared loopback fabric.

use bus_bench::{BenchConfig, BenchError, StatsSample, Workload};
use exabus::{BufferConfig, BufferManagerKind, Depot, DepotConfig};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn depot() -> Arc<Depot> {
    Depot::from_config(&DepotConfig::default()).unwrap()
}

/// A workload that only answers
fn server(bind: &str) -> BenchConfig {
    BenchConfig {
        bind: bind.to_string(),
        polite: true,
        tx_threads: Some(0),
        message_size: "256".to_string(),
        ..BenchConfig::default()
    }
}

fn client(bind: &str, peers: &str) -> BenchConfig {
    BenchConfig {
        bind: bind.to_string(),
        peers: peers.to_string(),
        message_size: "256".to_string(),
        latency_frequency: 10,
        ..BenchConfig::default()
    }
}

fn wait_until(workload: &Workload, mut condition: impl FnMut(&StatsSample) -> bool) -> StatsSample {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let sample = workload.sample();
        if condition(&sample) {
            return sample;
        }
        assert!(!workload.has_failed(), "workload failed: {:?}", workload.failures());
        assert!(Instant::now() < deadline, "condition not reached: {:?}", sample);
        thread::sleep(Duration::from_millis(10));
    }
}

fn assert_clean(failures: Vec<BenchError>) {
    assert!(failures.is_empty(), "unexpected failures: {:?}", failures);
}

#[test_log::test]
fn test_streaming_requests_are_answered_when_timestamped() {
    let depot = depot();
    let server = Workload::start_with_depot(&server("lb://server"), depot.clone()).unwrap();
    let client = Workload::start_with_depot(&client("lb://client", "lb://server"), depot).unwrap();

    let served = wait_until(&server, |s| s.messages_in >= 200 && s.messages_out >= 10);
    assert_eq!(served.bytes_in % 256, 0);
    assert!(served.connections >= 1);

    let sent = wait_until(&client, |s| s.responses_in >= 10 && s.receipts_in >= 100);
    assert!(sent.response_samples >= 1);
    assert!(sent.histogram.count() >= 1);

    assert_clean(client.stop());
    assert_clean(server.stop());
}

#[test_log::test]
fn test_blocking_client_correlates_every_response() {
    let depot = depot();
    let server = Workload::start_with_depot(&server("lb://server"), depot.clone()).unwrap();
    let client = Workload::start_with_depot(
        &BenchConfig {
            block: true,
            ..client("lb://client", "lb://server")
        },
        depot,
    )
    .unwrap();

    wait_until(&client, |s| s.responses_in >= 100);
    assert_eq!(client.errors().count("correlation"), 0);

    assert_clean(client.stop());
    assert_clean(server.stop());
}

#[test_log::test]
fn test_polled_server_answers() {
    let depot = depot();
    let server = Workload::start_with_depot(
        &BenchConfig {
            poll: true,
            rx_threads: Some(1),
            ..server("lb://server")
        },
        depot.clone(),
    )
    .unwrap();
    let client = Workload::start_with_depot(
        &BenchConfig {
            block: true,
            ..client("lb://client", "lb://server")
        },
        depot,
    )
    .unwrap();

    wait_until(&client, |s| s.responses_in >= 20);
    let served = server.sample();
    assert_eq!(served.collected_bytes, None);
    assert!(served.messages_in >= 20);

    assert_clean(client.stop());
    assert_clean(server.stop());
}

#[test_log::test]
fn test_memory_bus_atomics_complete_through_receipts() {
    let depot = depot();
    let server = Workload::start_with_depot(&server("lbm://y?capacity=8"), depot.clone()).unwrap();
    let client = Workload::start_with_depot(
        &BenchConfig {
            block: true,
            ..client("lbm://x?capacity=8", "lbm://y?capacity=8")
        },
        depot,
    )
    .unwrap();

    let sample = wait_until(&client, |s| s.messages_out >= 100 && s.receipts_in >= 100);
    // get-and-add accounts offset plus operand
    assert_eq!(sample.bytes_out % 16, 0);
    assert!(sample.bytes_out >= 1_600);

    assert_clean(client.stop());
    assert_clean(server.stop());
}

#[test_log::test]
fn test_blocking_relay_routes_responses_to_origin() {
    let depot = depot();
    let server = Workload::start_with_depot(&server("lb://srv"), depot.clone()).unwrap();
    let relay = Workload::start_with_depot(
        &BenchConfig {
            bind: "lb://relay".to_string(),
            peers: "lb://srv".to_string(),
            relay: true,
            block: true,
            message_size: "256".to_string(),
            ..BenchConfig::default()
        },
        depot.clone(),
    )
    .unwrap();
    let client = Workload::start_with_depot(
        &BenchConfig {
            block: true,
            ..client("lb://cli", "lb://relay")
        },
        depot,
    )
    .unwrap();

    wait_until(&client, |s| s.responses_in >= 50);
    let relayed = relay.sample();
    // every request forwarded and every response returned
    assert!(relayed.messages_out >= 100);
    assert!(server.sample().messages_in >= 50);
    assert_eq!(relay.errors().count("relay_unknown"), 0);

    assert_clean(client.stop());
    assert_clean(relay.stop());
    assert_clean(server.stop());
}

#[test_log::test]
fn test_small_buffer_pool_recycles_under_load() {
    let depot = depot();
    let server = Workload::start_with_depot(&server("lb://server"), depot.clone()).unwrap();
    let client = Workload::start_with_depot(
        &BenchConfig {
            buffers: BufferConfig {
                manager: BufferManagerKind::Pooled,
                segment_size: 256,
                max_pooled_bytes: 1024,
            },
            ..client("lb://client", "lb://server")
        },
        depot,
    )
    .unwrap();

    // four segments in the pool, so every one is reused many times over
    let sent = wait_until(&client, |s| s.messages_out >= 400 && s.receipts_in >= 400);
    assert_eq!(sent.bytes_out % 256, 0);
    assert!(!client.has_failed());

    assert_clean(client.stop());
    assert_clean(server.stop());
}

#[test_log::test]
fn test_streaming_relay_keeps_downstream_responses() {
    let depot = depot();
    let server = Workload::start_with_depot(&server("lb://srv"), depot.clone()).unwrap();
    let relay = Workload::start_with_depot(
        &BenchConfig {
            bind: "lb://relay".to_string(),
            peers: "lb://srv".to_string(),
            relay: true,
            message_size: "256".to_string(),
            ..BenchConfig::default()
        },
        depot.clone(),
    )
    .unwrap();
    let client = Workload::start_with_depot(&client("lb://cli", "lb://relay"), depot).unwrap();

    // the relay answers the client itself and hears back from the server
    wait_until(&client, |s| s.responses_in >= 10);
    let relayed = wait_until(&relay, |s| s.responses_in >= 10);
    assert!(relayed.response_samples >= 1);
    assert!(server.sample().messages_out >= 10);

    assert_clean(client.stop());
    assert_clean(relay.stop());
    assert_clean(server.stop());
}

#[test_log::test]
fn test_relay_with_transmitters_is_rejected() {
    let result = Workload::start(&BenchConfig {
        bind: "lb://relay".to_string(),
        relay: true,
        tx_threads: Some(1),
        ..BenchConfig::default()
    });
    assert!(matches!(result, Err(ref e) if e.is_configuration()));
}
