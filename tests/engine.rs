// Engine-level behavior against a loopback wire server.
use kobwire::config::Config;
use kobwire::engine::{Engine, EngineCallbacks};
use kobwire::morse::{DISCONTINUITY, LATCH, UNLATCH};
use kobwire::wire::packet::{decode, Packet, CMD_CONNECT, CMD_DATA};
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct Harness {
    engine: Engine,
    server: UdpSocket,
    text: Arc<Mutex<String>>,
}

fn harness() -> Harness {
    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    server
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    let addr = server.local_addr().unwrap();
    let cfg = Config {
        server_url: addr.to_string(),
        station: "TEST STATION".into(),
        wire: 42,
        sound: false,
        sounder: false,
        use_serial: false,
        use_gpio: false,
        auto_connect: false,
        ..Config::default()
    };
    let text = Arc::new(Mutex::new(String::new()));
    let text_sink = Arc::clone(&text);
    let engine = Engine::new(
        cfg,
        EngineCallbacks {
            text: Some(Box::new(move |t| {
                text_sink.lock().unwrap().push_str(t);
            })),
            sender: None,
            station: None,
            status: None,
        },
    )
    .unwrap();
    engine.start();
    Harness {
        engine,
        server,
        text,
    }
}

fn recv_long(server: &UdpSocket) -> (kobwire::wire::packet::LongPacket, SocketAddr) {
    let mut buf = [0u8; 1024];
    loop {
        let (n, from) = server.recv_from(&mut buf).expect("packet from client");
        match decode(&buf[..n]).unwrap() {
            Packet::Long(p) => return (p, from),
            Packet::Short(_) => continue,
        }
    }
}

fn expect_connect(server: &UdpSocket) -> SocketAddr {
    let mut buf = [0u8; 1024];
    let (n, from) = server.recv_from(&mut buf).unwrap();
    assert_eq!(decode(&buf[..n]).unwrap(), Packet::Short(CMD_CONNECT));
    let (id, _) = recv_long(server);
    assert!(id.is_id());
    assert_eq!(id.station_id, "TEST STATION");
    assert_eq!(id.status, 42);
    from
}

#[test]
fn closer_directives_ride_the_wire_as_latch_codes() {
    let h = harness();
    h.engine.connect().unwrap();
    expect_connect(&h.server);

    // '+' closes the virtual closer: the wire sees the canonical latch code.
    h.engine.send_text("+");
    let (p, _) = recv_long(&h.server);
    assert_eq!(p.cmd, CMD_DATA);
    assert_eq!(p.code, vec![DISCONTINUITY, LATCH]);
    assert!(!h.engine.virtual_closer_is_open());

    // Directives decode as marks only, never as letters.
    let text = h.text.lock().unwrap().clone();
    assert!(
        !text.chars().any(|c| c.is_ascii_alphanumeric()),
        "text sink saw {text:?}"
    );

    // Latching again is a no-op: no second packet.
    h.engine.set_virtual_closer_closed(true);
    h.server
        .set_read_timeout(Some(Duration::from_millis(400)))
        .unwrap();
    let mut buf = [0u8; 1024];
    assert!(h.server.recv_from(&mut buf).is_err(), "unexpected packet");

    // '~' reopens: the unlatch code follows.
    h.server
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    h.engine.send_text("~");
    let (p, _) = recv_long(&h.server);
    assert_eq!(p.code, vec![DISCONTINUITY, UNLATCH]);
    assert!(h.engine.virtual_closer_is_open());
    h.engine.exit();
}

#[test]
fn keyboard_code_is_ordered_with_sequence_steps_of_two() {
    let h = harness();
    h.engine.connect().unwrap();
    expect_connect(&h.server);

    h.engine.send_text("EE");
    let (p1, _) = recv_long(&h.server);
    let (p2, _) = recv_long(&h.server);
    // Both are single-dit codes, in emit order, sequence advancing by 2.
    assert_eq!(p1.code.len(), 2);
    assert!(p1.code[0] < 0 && p1.code[1] > 2);
    assert_eq!(p2.seq_no, p1.seq_no + 2);
    h.engine.exit();
}

#[test]
fn remote_station_activity_follows_trailing_latch() {
    let h = harness();
    h.engine.connect().unwrap();
    let client_addr = expect_connect(&h.server);

    // A code packet without a trailing latch marks the remote station busy.
    let pkt = kobwire::wire::packet::encode_long("REMOTE KA", 10, &[-200, 60], 42);
    h.server.send_to(&pkt, client_addr).unwrap();
    wait_for(|| h.engine.internet_station_active(), true);
    assert_eq!(h.engine.current_sender(), "REMOTE KA");

    // A trailing +1 closes the remote circuit again.
    let pkt = kobwire::wire::packet::encode_long("REMOTE KA", 11, &[-200, LATCH], 42);
    h.server.send_to(&pkt, client_addr).unwrap();
    wait_for(|| h.engine.internet_station_active(), false);
    h.engine.exit();
}

fn wait_for(f: impl Fn() -> bool, want: bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if f() == want {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("condition did not become {want} in time");
}
