// End-to-end switch tests over loopback UDP.

use std::net::UdpSocket;
use std::time::{Duration, Instant};

use torq_switch::packet::{Frame, SwitchHeader, HEADER_LEN};
use torq_switch::switch::{ConfigError, SwitchError};
use torq_switch::{ForwardingTable, Switch, SwitchConfig};

fn test_config() -> SwitchConfig {
    SwitchConfig {
        queue_capacity: 8,
        calendar_queues: 2,
        priority_queues: 2,
        ingress_binds: vec!["127.0.0.1:0".parse().unwrap()],
        stats_interval: Duration::from_millis(50),
        ..SwitchConfig::default()
    }
}

fn encode_frame(egress_port: u16, traffic_class: u8, payload: &[u8]) -> Vec<u8> {
    let mut datagram = vec![0u8; HEADER_LEN + payload.len()];
    SwitchHeader {
        egress_port,
        traffic_class,
    }
    .write(&mut datagram);
    datagram[HEADER_LEN..].copy_from_slice(payload);
    datagram
}

#[test]
fn frames_traverse_the_switch() {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut table = ForwardingTable::default();
    table.add_route(5, receiver.local_addr().unwrap());

    let switch = Switch::new(test_config(), table).unwrap();
    switch.start().unwrap();
    let ingress_addr = switch.ingress().local_addrs()[0];

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .send_to(&encode_frame(5, 1, b"through"), ingress_addr)
        .unwrap();

    let mut buf = [0u8; 64];
    let (len, _) = receiver.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"through");
    assert_eq!(switch.ingress().drop_counts().queue_full, 0);

    switch.shutdown();
    assert_eq!(switch.egress().sent(), 1);
}

#[test]
fn drop_port_frames_vanish_in_the_pipeline() {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();

    let mut table = ForwardingTable::default();
    table.add_route(5, receiver.local_addr().unwrap());

    let switch = Switch::new(test_config(), table).unwrap();
    switch.start().unwrap();
    let ingress_addr = switch.ingress().local_addrs()[0];

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .send_to(&encode_frame(511, 0, b"discard"), ingress_addr)
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while switch.ingress().drop_counts().drop_port == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(switch.ingress().drop_counts().drop_port, 1);
    assert_eq!(switch.mux().overall_occupancy(), 0);

    let mut buf = [0u8; 64];
    assert!(receiver.recv_from(&mut buf).is_err());
    switch.shutdown();
}

#[test]
fn runt_datagrams_count_as_malformed() {
    let switch = Switch::new(test_config(), ForwardingTable::default()).unwrap();
    switch.start().unwrap();
    let ingress_addr = switch.ingress().local_addrs()[0];

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.send_to(&[0x00, 0x05], ingress_addr).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while switch.ingress().drop_counts().malformed == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(switch.ingress().drop_counts().malformed, 1);
    switch.shutdown();
}

#[test]
fn swapped_routes_take_effect_for_new_frames() {
    let old_receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    let new_receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    new_receiver
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut table = ForwardingTable::default();
    table.add_route(9, old_receiver.local_addr().unwrap());

    let config = SwitchConfig {
        enable_swap: true,
        ..test_config()
    };
    let switch = Switch::new(config, table).unwrap();
    switch.start().unwrap();
    let ingress_addr = switch.ingress().local_addrs()[0];

    let mut swapped = ForwardingTable::default();
    swapped.add_route(9, new_receiver.local_addr().unwrap());
    switch.swap_forwarding(swapped).unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .send_to(&encode_frame(9, 0, b"rerouted"), ingress_addr)
        .unwrap();

    let mut buf = [0u8; 64];
    let (len, _) = new_receiver.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"rerouted");
    switch.shutdown();
}

#[test]
fn snapshots_reflect_traffic() {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut table = ForwardingTable::default();
    table.add_route(5, receiver.local_addr().unwrap());

    let switch = Switch::new(test_config(), table).unwrap();
    let snapshots = switch.snapshots();
    switch.start().unwrap();
    let ingress_addr = switch.ingress().local_addrs()[0];

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .send_to(&encode_frame(5, 0, b"counted"), ingress_addr)
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut saw_port = false;
    while Instant::now() < deadline {
        if let Ok(snapshot) = snapshots.recv_timeout(Duration::from_millis(200)) {
            if snapshot.ports.get(&5).is_some_and(|stats| stats.frames >= 1) {
                saw_port = true;
                break;
            }
        }
    }
    assert!(saw_port, "no snapshot reported traffic on port 5");
    switch.shutdown();
}

#[test]
fn invalid_configs_never_build_a_switch() {
    for (config, expected_option) in [
        (
            SwitchConfig {
                queue_capacity: 0,
                ..test_config()
            },
            "queue-capacity",
        ),
        (
            SwitchConfig {
                calendar_queues: 0,
                ..test_config()
            },
            "calendar-queues",
        ),
        (
            SwitchConfig {
                priority_queues: 0,
                ..test_config()
            },
            "priority-queues",
        ),
    ] {
        let err = Switch::new(config, ForwardingTable::default())
            .err()
            .expect("config must be rejected");
        match err {
            SwitchError::Config(ConfigError::ZeroNotAllowed { option }) => {
                assert_eq!(option, expected_option);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

#[test]
fn frame_helpers_agree_with_the_wire_format() {
    let frame = Frame::new(5, 1, b"abc");
    let encoded = encode_frame(5, 1, b"abc");
    assert_eq!(frame.payload(), &encoded[HEADER_LEN..]);
    assert_eq!(
        SwitchHeader::parse(&encoded).unwrap().egress_port,
        frame.header.egress_port
    );
}
