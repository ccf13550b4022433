//! End-to-end detection behavior through the public API

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Duration, TimeZone, Utc};

use arpwarden::rules::Condition;
use arpwarden::state::{CounterKey, StoreSettings};
use arpwarden::{
    Config, DetectionEngine, MacAddr, OutputHandler, Packet, Rule, RuleSet, Severity,
    ShardedEngine, WindowedStateStore,
};

fn t(secs: f64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::milliseconds((secs * 1000.0) as i64)
}

fn ip(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, last)
}

fn mac(last: u8) -> MacAddr {
    MacAddr::new(0x02, 0, 0, 0, 0, last)
}

fn engine_with(config: &Config) -> DetectionEngine {
    let engine = DetectionEngine::from_config(config).unwrap();
    engine.start();
    engine
}

fn fired(events: &[arpwarden::DetectionEvent], rule_id: &str) -> usize {
    events.iter().filter(|e| e.rule_id == rule_id).count()
}

#[test]
fn window_counts_exclude_old_events() {
    let mut store = WindowedStateStore::new(StoreSettings::default());
    let key = CounterKey::Replies(mac(1));
    let start = t(0.0);

    // Irregular arrivals over 40s, in milliseconds
    let offsets: [i64; 11] = [0, 500, 3000, 7500, 12000, 12100, 20000, 31000, 33300, 39900, 40000];
    for (i, offset) in offsets.iter().enumerate() {
        store.record_event(key, start + Duration::milliseconds(*offset));

        for window in [1000i64, 5000, 10000, 30000] {
            let expected = offsets[..=i]
                .iter()
                .filter(|o| offset - **o <= window)
                .count();
            let counted = store.count_in_window(&key, Duration::milliseconds(window));
            assert_eq!(counted, expected, "window {}ms at {}ms", window, offset);
        }
    }
}

#[test]
fn mac_change_fires_only_on_second_binding() {
    let engine = engine_with(&Config::default());

    let first = engine
        .ingest(Packet::reply(t(0.0), MacAddr([0xaa; 6]), ip(5), mac(1), ip(1)))
        .unwrap();
    assert_eq!(fired(&first, "arp_spoofing"), 0);

    let second = engine
        .ingest(Packet::reply(t(1.0), MacAddr([0xbb; 6]), ip(5), mac(1), ip(1)))
        .unwrap();
    assert_eq!(fired(&second, "arp_spoofing"), 1);
}

#[test]
fn gateway_impersonation_is_critical() {
    let engine = engine_with(&Config::default());
    let gw = Ipv4Addr::new(192, 168, 1, 1);
    assert!(engine.update_gateway(gw, MacAddr([0xaa; 6]), true));

    let spoofed = engine
        .ingest(Packet::reply(
            t(0.0),
            MacAddr([0xbb; 6]),
            gw,
            mac(1),
            Ipv4Addr::new(192, 168, 1, 20),
        ))
        .unwrap();
    let event = spoofed
        .iter()
        .find(|e| e.rule_id == "gateway_impersonation")
        .expect("impersonation not detected");
    assert_eq!(event.severity, Severity::Critical);
    assert_eq!(event.source.mac, MacAddr([0xbb; 6]));

    // Fresh engine so the earlier spoof does not affect bindings
    let engine = engine_with(&Config::default());
    engine.update_gateway(gw, MacAddr([0xaa; 6]), true);
    let genuine = engine
        .ingest(Packet::reply(
            t(0.0),
            MacAddr([0xaa; 6]),
            gw,
            mac(1),
            Ipv4Addr::new(192, 168, 1, 20),
        ))
        .unwrap();
    assert!(genuine.is_empty());
}

#[test]
fn fallback_gateway_protects_at_startup() {
    let mut config = Config::default();
    config.gateway.fallback_ip = Some(Ipv4Addr::new(192, 168, 1, 1));
    config.gateway.fallback_mac = Some(MacAddr([0xaa; 6]));
    let engine = engine_with(&config);

    let events = engine
        .ingest(Packet::reply(
            t(0.0),
            MacAddr([0xbb; 6]),
            Ipv4Addr::new(192, 168, 1, 1),
            mac(1),
            ip(1),
        ))
        .unwrap();
    assert_eq!(fired(&events, "gateway_impersonation"), 1);
}

#[test]
fn cooldown_suppresses_repeats() {
    let engine = engine_with(&Config::default());
    let victim = ip(5);

    // arp_spoofing cooldown is 60s
    engine
        .ingest(Packet::reply(t(0.0), mac(0xa), victim, mac(1), ip(1)))
        .unwrap();
    let first = engine
        .ingest(Packet::reply(t(1.0), mac(0xb), victim, mac(1), ip(1)))
        .unwrap();
    let flip_back = engine
        .ingest(Packet::reply(t(2.0), mac(0xa), victim, mac(1), ip(1)))
        .unwrap();
    let flip_again = engine
        .ingest(Packet::reply(t(3.0), mac(0xb), victim, mac(1), ip(1)))
        .unwrap();
    assert_eq!(fired(&first, "arp_spoofing"), 1);
    // mac(0xa) is a different source, so it has its own cooldown
    assert_eq!(fired(&flip_back, "arp_spoofing"), 1);
    assert_eq!(fired(&flip_again, "arp_spoofing"), 0);

    let later = engine
        .ingest(Packet::reply(t(62.0), mac(0xa), victim, mac(1), ip(1)))
        .unwrap();
    let after_cooldown = engine
        .ingest(Packet::reply(t(63.0), mac(0xb), victim, mac(1), ip(1)))
        .unwrap();
    assert_eq!(fired(&later, "arp_spoofing"), 1);
    assert_eq!(fired(&after_cooldown, "arp_spoofing"), 1);
    assert!(engine.stats().detections_suppressed >= 1);
}

#[test]
fn request_flood_boundary() {
    let engine = engine_with(&Config::default());
    let attacker = mac(0x66);

    for i in 0..20 {
        let events = engine
            .ingest(Packet::request(t(i as f64 * 0.2), attacker, ip(66), ip(1)))
            .unwrap();
        assert_eq!(fired(&events, "request_flood"), 0, "fired at request {}", i + 1);
    }

    let events = engine
        .ingest(Packet::request(t(4.5), attacker, ip(66), ip(1)))
        .unwrap();
    let flood = events
        .iter()
        .find(|e| e.rule_id == "request_flood")
        .expect("21st request should fire");
    assert_eq!(flood.severity, Severity::High);
    assert!(flood.has_tag("dos"));
}

#[test]
fn scan_and_mitm_patterns() {
    let engine = engine_with(&Config::default());
    let scanner = mac(0x5c);

    let mut scan_events = 0;
    for last in 1..=15u8 {
        let events = engine
            .ingest(Packet::request(t(last as f64 * 0.2), scanner, ip(200), ip(last)))
            .unwrap();
        scan_events += fired(&events, "sequential_scan");
    }
    assert_eq!(scan_events, 1);

    let victim = mac(1);
    let gw = ip(254);
    engine
        .ingest(Packet::request(t(10.0), victim, ip(1), gw))
        .unwrap();
    engine
        .ingest(Packet::reply(t(10.1), mac(0xaa), gw, victim, ip(1)))
        .unwrap();
    let raced = engine
        .ingest(Packet::reply(t(10.2), mac(0xbb), gw, victim, ip(1)))
        .unwrap();
    assert_eq!(fired(&raced, "multiple_replies_same_request"), 1);
    assert_eq!(fired(&raced, "arp_spoofing"), 1);
}

#[test]
fn malformed_and_unusual_packets() {
    let engine = engine_with(&Config::default());

    let zero_sender = Packet::request(t(0.0), MacAddr::ZERO, ip(1), ip(2));
    assert!(engine.ingest(zero_sender).unwrap().is_empty());
    assert_eq!(engine.stats().malformed_dropped, 1);

    let odd = Packet::request(t(1.0), mac(1), ip(1), ip(2)).with_header(6, 0x0800, 6, 4);
    let events = engine.ingest(odd).unwrap();
    let unusual = events
        .iter()
        .find(|e| e.rule_id == "unusual_flags")
        .expect("unusual header not flagged");
    assert_eq!(unusual.confidence, 0.75);
}

fn tagged_set(tag: &str) -> RuleSet {
    RuleSet::new(vec![
        Rule::new("first", Condition::GratuitousArp, Severity::Low)
            .with_cooldown(0.0)
            .with_tags(&[tag]),
        Rule::new("second", Condition::GratuitousArp, Severity::Low)
            .with_cooldown(0.0)
            .with_tags(&[tag]),
    ])
    .unwrap()
}

#[test]
fn reload_never_mixes_rule_sets() {
    let engine = Arc::new(engine_with(&Config::default()));
    engine.reload_rules(tagged_set("set-a")).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let reloader = {
        let engine = engine.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut flip = false;
            while !done.load(Ordering::SeqCst) {
                let tag = if flip { "set-a" } else { "set-b" };
                engine.reload_rules(tagged_set(tag)).unwrap();
                flip = !flip;
            }
        })
    };

    for i in 0..2000u32 {
        let sender = MacAddr::new(0x02, 0, 0, 0, (i >> 8) as u8, i as u8);
        let events = engine
            .ingest(Packet::gratuitous(t(i as f64), sender, ip(9)))
            .unwrap();
        assert_eq!(events.len(), 2);
        let version = events[0].ruleset_version;
        let tags = events[0].tags.clone();
        for event in &events {
            assert_eq!(event.ruleset_version, version);
            assert_eq!(event.tags, tags);
        }
    }

    done.store(true, Ordering::SeqCst);
    reloader.join().unwrap();
    assert!(engine.stats().reloads > 0);
}

#[test]
fn reload_from_file_swaps_and_keeps_on_error() {
    let engine = engine_with(&Config::default());
    let dir = tempfile::tempdir().unwrap();

    let good = dir.path().join("good.toml");
    std::fs::write(
        &good,
        r#"
[rules.only_gratuitous]
severity = "LOW"
condition = { type = "gratuitous_arp" }
"#,
    )
    .unwrap();
    assert_eq!(engine.reload_from_file(&good).unwrap(), 2);
    assert_eq!(engine.rules().len(), 1);

    let bad = dir.path().join("bad.toml");
    std::fs::write(&bad, "[rules.broken]\ncondition = { type = \"nope\" }\n").unwrap();
    assert!(engine.reload_from_file(&bad).is_err());
    assert_eq!(engine.rules().len(), 1);
    assert_eq!(engine.stats().ruleset_version, 2);
}

#[test]
fn idle_keys_are_evicted() {
    let mut config = Config::default();
    config.settings.history_window = 10.0;
    let engine = engine_with(&config);

    for last in 1..=50u8 {
        engine
            .ingest(Packet::reply(t(last as f64 * 0.01), mac(last), ip(last), mac(0xfe), ip(254)))
            .unwrap();
    }
    let before = engine.state_key_count();
    assert!(before >= 100);

    // Idle horizon is 10 x 10s; this packet arrives well after it
    engine
        .ingest(Packet::request(t(500.0), mac(0xf0), ip(240), ip(241)))
        .unwrap();
    let after = engine.state_key_count();
    assert!(after < before);
    assert!(after <= 3, "{} keys survived the sweep", after);
}

#[test]
fn stop_waits_for_in_flight_ingests() {
    let engine = Arc::new(engine_with(&Config::default()));
    let accepted = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4u8)
        .map(|w| {
            let engine = engine.clone();
            let accepted = accepted.clone();
            thread::spawn(move || {
                for i in 0..500u32 {
                    let packet = Packet::request(t(i as f64), mac(w + 1), ip(w + 1), ip(100));
                    match engine.ingest(packet) {
                        Ok(_) => {
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(_) => break,
                    }
                }
            })
        })
        .collect();

    thread::sleep(std::time::Duration::from_millis(5));
    engine.stop();
    let at_stop = engine.stats().packets_ingested;

    for worker in workers {
        worker.join().unwrap();
    }
    let stats = engine.stats();
    assert_eq!(stats.packets_ingested, at_stop);
    assert_eq!(stats.packets_ingested, accepted.load(Ordering::SeqCst) as u64);
}

#[test]
fn sharded_engine_matches_sequential_detections() {
    let config = Config::default();
    let sequential = engine_with(&config);
    let sharded = ShardedEngine::from_config(&config, 4, None).unwrap();
    sharded.start();

    let mut packets = Vec::new();
    for i in 0..30u32 {
        packets.push(Packet::request(t(i as f64 * 0.1), mac(0x66), ip(66), ip(1)));
    }
    packets.push(Packet::reply(t(4.0), mac(0xa), ip(5), mac(1), ip(1)));
    packets.push(Packet::reply(t(4.5), mac(0xb), ip(5), mac(1), ip(1)));

    let mut expected: Vec<String> = Vec::new();
    let mut actual: Vec<String> = Vec::new();
    for packet in packets {
        expected.extend(sequential.ingest(packet.clone()).unwrap().into_iter().map(|e| e.rule_id));
        actual.extend(sharded.ingest(packet).unwrap().into_iter().map(|e| e.rule_id));
    }
    expected.sort();
    actual.sort();
    assert_eq!(expected, actual);
    sharded.shutdown();
}

#[tokio::test]
async fn broadcast_subscribers_receive_detections() {
    let handler = OutputHandler::new(16);
    let mut rx = handler.subscribe();

    let engine = DetectionEngine::from_config(&Config::default())
        .unwrap()
        .with_sink(Arc::new(handler));
    engine.start();
    engine
        .ingest(Packet::gratuitous(t(0.0), mac(1), ip(1)))
        .unwrap();

    let event = rx.recv().await.unwrap();
    assert_eq!(event.rule_id, "gratuitous_arp");
    assert_eq!(event.severity, Severity::Low);
}
