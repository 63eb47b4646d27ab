//! End-to-end tests across the depot, loopback fabric and flow control.

use exabus::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn next(collector: &QueueingEventCollector) -> Event {
    collector
        .poll_timeout(Some(Duration::from_secs(2)))
        .unwrap()
        .expect("event expected")
}

fn open_message_bus(depot: &Depot, name: &str) -> (Arc<dyn MessageBus>, Arc<QueueingEventCollector>) {
    let endpoint = depot.resolve_endpoint(name).unwrap();
    let bus = depot.create_message_bus(Some(&endpoint)).unwrap();
    let collector = Arc::new(QueueingEventCollector::new());
    bus.set_event_collector(collector.clone()).unwrap();
    bus.open().unwrap();
    assert_eq!(next(&collector).kind(), EventType::Open);
    (bus, collector)
}

#[test_log::test]
fn test_depot_default_endpoint_and_drivers() {
    let depot = Depot::from_config(&DepotConfig::default()).unwrap();
    assert_eq!(depot.driver_names(), vec!["echo", "loopback"]);

    let bus = depot.create_message_bus(None).unwrap();
    assert_eq!(bus.local_endpoint().to_string(), "lb://default");

    let echo = depot.resolve_endpoint("echo").unwrap();
    assert_eq!(echo.protocol(), "echo");
    assert!(depot.create_message_bus(Some(&echo)).is_ok());
    assert!(depot.driver("loopback").unwrap().depot().is_some());
}

#[test_log::test]
fn test_kind_mismatch_is_reported_and_recycled() {
    let depot = Depot::from_config(&DepotConfig::default()).unwrap();
    let memory = depot.resolve_endpoint("lbm://region?capacity=64").unwrap();

    match depot.create_message_bus(Some(&memory)) {
        Err(err) => assert!(matches!(err, BusError::UnsupportedBusKind { kind: "message", .. })),
        Ok(bus) => panic!("memory endpoint produced a message bus at {}", bus.local_endpoint()),
    }

    // The mismatched bus was closed, so the address is free again
    let bus = depot.create_memory_bus(Some(&memory)).unwrap();
    assert_eq!(bus.capacity(None).unwrap(), 64);
}

#[test_log::test]
fn test_bare_name_ranges_expand_in_both_directions() {
    let depot = Depot::from_config(&DepotConfig::default()).unwrap();

    let names = |list: &str| -> Vec<String> {
        parse_endpoints(&depot, list)
            .unwrap()
            .iter()
            .map(|ep| ep.to_string())
            .collect()
    };
    assert_eq!(names("host:80..82"), vec!["lb://host:80", "lb://host:81", "lb://host:82"]);
    assert_eq!(names("lb://host:3..1"), vec!["lb://host:3", "lb://host:2", "lb://host:1"]);
    assert_eq!(names("echo lb://x"), vec!["echo://local", "lb://x"]);
    assert!(parse_endpoints(&depot, "host:a..3").is_err());
}

#[test_log::test]
fn test_flow_control_follows_loopback_backlog() {
    let config = DepotConfig {
        loopback: LoopbackConfig {
            peer_backlog: Watermarks::new(1000, 100),
            global_backlog: Watermarks::disabled(),
            local_backlog: Watermarks::disabled(),
            ..LoopbackConfig::default()
        },
        ..DepotConfig::default()
    };
    let depot = Depot::from_config(&config).unwrap();
    let (a, ca) = open_message_bus(&depot, "lb://producer");
    let (b, cb) = open_message_bus(&depot, "lb://consumer");
    let b_ep = b.local_endpoint().clone();

    let flow = FlowControl::new(a.local_endpoint().clone(), [b_ep.clone()], true);
    a.connect(&b_ep).unwrap();
    let connect = next(&ca);
    assert_eq!(flow.on_event(connect.kind(), connect.endpoint()).unwrap(), FlowSignal::PeerReady(b_ep.clone()));
    assert_eq!(next(&cb).kind(), EventType::Connect);

    for _ in 0..4 {
        a.send(&b_ep, BufferSequence::from_bytes(vec![0u8; 300]), Some(Receipt::untimed()))
            .unwrap();
    }
    let excessive = next(&ca);
    assert_eq!(excessive.kind(), EventType::BacklogExcessive);
    assert_eq!(
        flow.on_event(excessive.kind(), excessive.endpoint()).unwrap(),
        FlowSignal::PeerExcessive(b_ep.clone())
    );
    assert!(flow.ready().is_empty());

    let mut held: Vec<Event> = (0..4).map(|_| next(&cb)).collect();
    assert!(held.iter().all(|event| event.kind() == EventType::Message));

    // 1200 -> 900 -> 600 -> 300 outstanding; still above the low watermark
    for _ in 0..3 {
        held.pop().unwrap().dispose();
        assert_eq!(next(&ca).kind(), EventType::Receipt);
    }
    assert!(!flow.ready().contains(&b_ep));

    held.pop().unwrap().dispose();
    let normal = next(&ca);
    assert_eq!(normal.kind(), EventType::BacklogNormal);
    assert_eq!(
        flow.on_event(normal.kind(), normal.endpoint()).unwrap(),
        FlowSignal::PeerReady(b_ep.clone())
    );
    assert_eq!(next(&ca).kind(), EventType::Receipt);
    assert!(flow.ready().contains(&b_ep));
}

#[test_log::test]
fn test_delivery_thread_feeds_demultiplexer() {
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Sink {
        kinds: Mutex<Vec<EventType>>,
    }

    impl Shard for Sink {
        fn add(&self, event: Event) -> bool {
            self.kinds.lock().push(event.kind());
            event.kind() == EventType::Message
        }
    }

    let depot = Depot::from_config(&DepotConfig::default()).unwrap();
    let (sender, _sender_events) = open_message_bus(&depot, "lb://fan-in");

    let shards: Vec<Arc<Sink>> = (0..4).map(|_| Arc::new(Sink::default())).collect();
    let demux = Arc::new(DemultiplexingCollector::new(shards).unwrap());
    let receiver = depot
        .create_bus(Some(&depot.resolve_endpoint("lb://fan-out").unwrap()), BusKind::Message)
        .unwrap();
    receiver.set_event_collector(demux.clone()).unwrap();
    demux.set_bus(&receiver);
    receiver.open().unwrap();

    let target = receiver.local_endpoint().clone();
    sender.connect(&target).unwrap();
    for _ in 0..10 {
        sender.send(&target, BufferSequence::from_bytes(vec![5u8; 10]), None).unwrap();
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while demux.received_bytes() < 100 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(demux.received_bytes(), 100);

    let index = demux.shard_index(Some(sender.local_endpoint()));
    assert_eq!(demux.shard_received_bytes(index), 100);
    let kinds = demux.shards()[index].kinds.lock().clone();
    assert_eq!(kinds.iter().filter(|kind| **kind == EventType::Message).count(), 10);
    assert!(kinds.contains(&EventType::Connect));
}

#[test_log::test]
fn test_credit_limiter_converges_under_async_completion() {
    const AVG: i64 = 64;
    const MAX: i64 = 640;
    const SENDS: usize = 1000;

    let limiter = CreditLimiter::new(MAX);
    let (tx, rx) = crossbeam_channel::bounded::<i64>(64);

    let completer = {
        let limiter = limiter.clone();
        thread::spawn(move || {
            let mut completed = 0;
            for credit in rx {
                limiter.release(credit);
                exabus::notifier::flush();
                completed += 1;
            }
            completed
        })
    };

    let mut peak = 0;
    for _ in 0..SENDS {
        if limiter.acquire(AVG) {
            while limiter.outstanding() > limiter.max() {
                limiter.await_credit(Duration::from_millis(10));
            }
        }
        peak = peak.max(limiter.outstanding());
        tx.send(AVG).unwrap();
    }
    drop(tx);

    assert_eq!(completer.join().unwrap(), SENDS);
    assert_eq!(limiter.outstanding(), 0);
    assert!(peak <= MAX + AVG, "peak {} exceeded bound", peak);
}

#[test_log::test]
fn test_depot_config_from_toml() {
    let config: DepotConfig = toml::from_str(
        r#"
        default_endpoint = "lb://node-1"

        [loopback]
        accept_bare_names = false
        peer_backlog = { high = 2048, low = 512 }
        "#,
    )
    .unwrap();
    assert_eq!(config.default_endpoint, "lb://node-1");
    assert!(!config.loopback.accept_bare_names);
    assert_eq!(config.loopback.peer_backlog, Watermarks::new(2048, 512));
    assert_eq!(config.loopback.idle_wait_ms, LoopbackConfig::default().idle_wait_ms);

    let depot = Depot::from_config(&config).unwrap();
    assert!(depot.resolve_endpoint("host:80").is_err());

    let inverted: DepotConfig = toml::from_str(
        r#"
        [loopback]
        local_backlog = { high = 10, low = 10 }
        "#,
    )
    .unwrap();
    assert!(Depot::from_config(&inverted).unwrap_err().is_configuration());
}
