use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use sensor_logger::{
    discovery::{DiscoveryEngine, DiscoveryOutcome, ProbeFailure, ProbeSettings},
    transport::mock::{MockPort, MockProvider},
    utils::logging::{Level, MemoryLog, SilentLog},
};

const REPLY: &str = r#"{"temperature":23.1,"humidity":45.0,"pressure":1012.0,"airQuality":12,"lightLevel":640,"date":"2024-05-01","time":"08:30:00"}"#;

fn fast_settings() -> ProbeSettings {
    ProbeSettings {
        settle_delay: Duration::ZERO,
        response_window: Duration::from_millis(60),
        poll_interval: Duration::from_millis(5),
        ..ProbeSettings::default()
    }
}

#[test]
fn stops_at_first_responder_and_never_opens_later_ports() {
    let ports = vec![
        MockPort::new("COM1"),
        MockPort::new("COM2"),
        MockPort::responder("COM3", REPLY),
        MockPort::new("COM4"),
    ];
    let provider = Arc::new(MockProvider::new(ports.clone()));
    let engine = DiscoveryEngine::new(provider.clone(), fast_settings(), SilentLog::shared());

    let device = match engine.discover() {
        DiscoveryOutcome::Confirmed(device) => device,
        DiscoveryOutcome::Exhausted { failures } => panic!("expected COM3, got {failures:?}"),
    };

    assert_eq!(device.port, "COM3");
    assert_eq!(device.handshake_frame, REPLY);
    assert_eq!(
        provider.open_attempts(),
        vec!["COM1".to_string(), "COM2".to_string(), "COM3".to_string()]
    );
    assert_eq!(ports[3].open_count(), 0);

    // Failed candidates were closed; only the confirmed handle is alive.
    assert_eq!(ports[0].open_handles(), 0);
    assert_eq!(ports[1].open_handles(), 0);
    assert_eq!(ports[2].open_handles(), 1);
    drop(device);
    assert_eq!(ports[2].open_handles(), 0);
}

#[test]
fn busy_port_is_skipped_and_the_next_one_is_tried() {
    let busy = MockPort::responder("/dev/ttyUSB0", REPLY);
    let gateway = MockPort::responder("/dev/ttyUSB1", REPLY);
    let provider = Arc::new(
        MockProvider::new(vec![busy.clone(), gateway.clone()]).with_busy("/dev/ttyUSB0"),
    );
    let memory = MemoryLog::new();
    let engine = DiscoveryEngine::new(provider.clone(), fast_settings(), memory.clone());

    match engine.discover() {
        DiscoveryOutcome::Confirmed(device) => assert_eq!(device.port, "/dev/ttyUSB1"),
        DiscoveryOutcome::Exhausted { .. } => panic!("expected ttyUSB1"),
    }
    assert_eq!(busy.open_count(), 0);
    assert!(memory.contains(Level::Warn, "port is busy"));
}

#[test]
fn silent_ports_exhaust_with_one_failure_each() {
    let ports = vec![MockPort::new("COM1"), MockPort::new("COM2")];
    let provider = Arc::new(MockProvider::new(ports.clone()).with_busy("COM2"));
    let engine = DiscoveryEngine::new(provider, fast_settings(), SilentLog::shared());

    let failures = match engine.discover() {
        DiscoveryOutcome::Exhausted { failures } => failures,
        DiscoveryOutcome::Confirmed(device) => panic!("nothing should answer, got {}", device.port),
    };

    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].port, "COM1");
    assert_eq!(failures[0].failure, ProbeFailure::NoResponse);
    assert!(matches!(failures[1].failure, ProbeFailure::Transport(_)));
    assert_eq!(ports[0].request_count(), 1);
    assert!(ports.iter().all(|port| port.open_handles() == 0));
}

#[test]
fn frame_without_required_keys_does_not_confirm() {
    let port = MockPort::responder("COM5", r#"{"temperature":20.0}"#);
    let provider = Arc::new(MockProvider::new(vec![port.clone()]));
    let engine = DiscoveryEngine::new(provider, fast_settings(), SilentLog::shared());

    assert!(matches!(engine.discover(), DiscoveryOutcome::Exhausted { .. }));
    assert_eq!(port.open_handles(), 0);
}
