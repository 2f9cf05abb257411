//! End-to-end coverage for the six literal request/reply scenarios the
//! dispatcher and transport engine are expected to reproduce exactly, plus
//! the `CNXN` handshake's literal field values. Each test drives a real
//! `Engine` on a background thread against real TCP sockets, mirroring how
//! `flux-network`'s own `tests/*.rs` exercise its connector end to end
//! rather than through any in-process fixture.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bridge_transport::{
    decode_length_prefix, encode_length_prefix, ConnectionState, DeviceEndpoint, Engine, Registry, TcpEndpoint,
    Transport, TransportKind,
};
use bridge_wire::{Message, Packet};
use crossbeam_channel::Sender;

fn local_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Runs `engine` on a background thread until `stop` is set.
fn spawn_loop(mut engine: Engine, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        engine.run(|| stop.load(Ordering::Relaxed)).unwrap();
    })
}

fn connect_and_send(addr: SocketAddr, body: &[u8]) -> StdTcpStream {
    let mut s = StdTcpStream::connect(addr).unwrap();
    s.write_all(&encode_length_prefix(body.len())).unwrap();
    s.write_all(body).unwrap();
    s
}

/// Reads an `OKAY`/`FAIL` + length-prefixed reply, the shape every one-shot
/// smart-socket response uses (distinct from `forward:`'s bare `OKAYOKAY`).
fn read_reply(stream: &mut StdTcpStream) -> (bool, String) {
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut status = [0u8; 4];
    stream.read_exact(&mut status).unwrap();
    let ok = &status == b"OKAY";
    let body = read_length_prefixed(stream);
    (ok, body)
}

fn read_length_prefixed(stream: &mut StdTcpStream) -> String {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).unwrap();
    let len = decode_length_prefix(&len_buf).unwrap();
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    String::from_utf8(body).unwrap()
}

/// Connects a loopback pair and wraps one end as a `TcpEndpoint`, the other
/// kept by the caller to play the part of the device.
fn make_device_pair() -> (StdTcpStream, StdTcpStream) {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let device_side = StdTcpStream::connect(addr).unwrap();
    let (host_side, _) = listener.accept().unwrap();
    (host_side, device_side)
}

/// Spawns a `Transport` directly against a loopback pair and inserts it into
/// `registry`, bypassing `Engine::accept_device` so the test controls the
/// serial/kind precisely. Returns the stream standing in for the device.
fn spawn_device_transport(
    registry: &Registry,
    loop_tx: Sender<bridge_transport::LoopEvent>,
    waker: Arc<mio::Waker>,
    id: u32,
    kind: TransportKind,
    serial: &str,
) -> StdTcpStream {
    let (host_side, device_side) = make_device_pair();
    let endpoint: Box<dyn DeviceEndpoint> = Box::new(TcpEndpoint::new(host_side).unwrap());
    let transport = Transport::spawn(id, kind, serial.to_string(), endpoint, loop_tx, waker);
    registry.insert(transport);
    device_side
}

fn read_frame(stream: &mut StdTcpStream) -> Packet {
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut header = [0u8; Message::SIZE];
    stream.read_exact(&mut header).unwrap();
    let msg = Message::from_le_bytes(header);
    let mut payload = vec![0u8; msg.data_length as usize];
    stream.read_exact(&mut payload).unwrap();
    Packet::with_payload(msg, &payload)
}

fn write_frame(stream: &mut StdTcpStream, command: u32, arg0: u32, arg1: u32, payload: &[u8]) {
    let mut pkt = Packet::with_payload(Message { command, arg0, arg1, ..Default::default() }, payload);
    bridge_wire::encode(&mut pkt);
    stream.write_all(&pkt.msg.to_le_bytes()).unwrap();
    stream.write_all(pkt.payload.as_slice()).unwrap();
}

/// Scenario 1: `devices` against an empty registry replies `OKAY` with an
/// empty body.
#[test]
fn enumerate_with_no_devices() {
    let mut engine = Engine::new().unwrap();
    let control_addr = engine.bind_control(local_addr(0)).unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_loop(engine, Arc::clone(&stop));

    let mut client = connect_and_send(control_addr, b"host:devices");
    let (ok, body) = read_reply(&mut client);
    assert!(ok);
    assert_eq!(body, "");

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

/// Scenario 2: one USB device, serial `abc123`, state `device`, name
/// `dev0`, lists as `abc123\tdevice\tdev0\n`.
#[test]
fn enumerate_with_one_usb_device() {
    let mut engine = Engine::new().unwrap();
    let control_addr = engine.bind_control(local_addr(0)).unwrap();
    let registry = engine.registry();
    let loop_tx = engine.loop_sender();
    let waker = engine.waker();

    let _device_stream = spawn_device_transport(&registry, loop_tx, waker, 1, TransportKind::Usb, "abc123");
    registry.with_transport(1, |t| {
        t.state = ConnectionState::Device;
        t.name = "dev0".to_string();
    });

    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_loop(engine, Arc::clone(&stop));

    let mut client = connect_and_send(control_addr, b"host:devices");
    let (ok, body) = read_reply(&mut client);
    assert!(ok);
    assert_eq!(body, "abc123\tdevice\tdev0\n");

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

/// Scenario 3: the first frame a newly connected device receives is a
/// `CNXN` with these exact fields.
#[test]
fn initial_cnxn_handshake_fields() {
    let mut engine = Engine::new().unwrap();
    let device_addr = engine.bind_device_port(local_addr(0)).unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_loop(engine, Arc::clone(&stop));

    let mut device = StdTcpStream::connect(device_addr).unwrap();
    let handshake = read_frame(&mut device);

    assert_eq!(handshake.msg.command, bridge_wire::CNXN);
    assert_eq!(handshake.msg.arg0, 0x0100_0000);
    assert_eq!(handshake.msg.arg1, 0x0000_1000);
    assert_eq!(handshake.payload.as_slice(), b"host::\0");
    assert_eq!(handshake.msg.data_check, bridge_wire::checksum(b"host::\0"));
    assert_eq!(handshake.msg.magic, 0xb1a7_b1bc);

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

/// Scenario 4: `forward:` installs a listener and replies the bare
/// `OKAYOKAY`; a subsequent connect to the forwarded port emits an `OPEN`
/// for the forwarded service on the right transport.
#[test]
fn forward_install_and_connect_opens_remote_service() {
    let mut engine = Engine::new().unwrap();
    let control_addr = engine.bind_control(local_addr(0)).unwrap();
    let registry = engine.registry();
    let loop_tx = engine.loop_sender();
    let waker = engine.waker();

    let mut device_stream = spawn_device_transport(&registry, loop_tx, waker, 1, TransportKind::Usb, "abc123");
    let _handshake = read_frame(&mut device_stream);

    // Bind a probe to grab a free port, then reuse its number for the
    // forward spec (mirrors flux-network's own tests/tcp_*.rs idiom).
    let probe = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let local_port = probe.local_addr().unwrap().port();
    drop(probe);

    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_loop(engine, Arc::clone(&stop));

    let request = format!("host-serial:abc123:forward:tcp:{local_port};tcp:8888");
    let mut client = connect_and_send(control_addr, request.as_bytes());
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"OKAYOKAY");

    let _forward_client = StdTcpStream::connect(local_addr(local_port)).unwrap();
    let open_pkt = read_frame(&mut device_stream);
    assert_eq!(open_pkt.msg.command, bridge_wire::OPEN);
    assert_eq!(open_pkt.msg.arg1, 0);
    assert_eq!(open_pkt.payload.as_slice(), b"tcp:8888");

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

/// Scenario 5: once a `CLSE` referring to a bound local socket arrives, the
/// host destroys it and emits nothing further for that id — observed here
/// as the client's own fd reaching EOF.
#[test]
fn peer_initiated_close_destroys_local_socket() {
    let mut engine = Engine::new().unwrap();
    let control_addr = engine.bind_control(local_addr(0)).unwrap();
    let registry = engine.registry();
    let loop_tx = engine.loop_sender();
    let waker = engine.waker();

    let mut device_stream = spawn_device_transport(&registry, loop_tx, waker, 1, TransportKind::Usb, "abc123");

    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_loop(engine, Arc::clone(&stop));

    let _handshake = read_frame(&mut device_stream);

    let mut client = connect_and_send(control_addr, b"host-serial:abc123:shell:");
    let open_pkt = read_frame(&mut device_stream);
    assert_eq!(open_pkt.msg.command, bridge_wire::OPEN);
    let local_id = open_pkt.msg.arg0;

    write_frame(&mut device_stream, bridge_wire::CLSE, 77, local_id, &[]);

    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(n, 0, "host should close the bridged socket once the device sends CLSE");

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

/// Scenario 6: `track-devices` immediately replies `OKAY` plus a
/// length-prefixed device list, then pushes a fresh length-prefixed list on
/// every registry mutation, in order, on the same connection.
#[test]
fn track_devices_pushes_on_every_mutation() {
    let mut engine = Engine::new().unwrap();
    let control_addr = engine.bind_control(local_addr(0)).unwrap();
    let registry = engine.registry();
    let loop_tx = engine.loop_sender();
    let waker = engine.waker();

    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_loop(engine, Arc::clone(&stop));

    let mut client = connect_and_send(control_addr, b"host:track-devices");
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut status = [0u8; 4];
    client.read_exact(&mut status).unwrap();
    assert_eq!(&status, b"OKAY");
    assert_eq!(read_length_prefixed(&mut client), "");

    // `Registry::insert` itself is the mutation that wakes waiters; the
    // freshly spawned transport is still mid-handshake, so it lists as
    // `connecting`/`unknown` until its `CNXN` banner arrives.
    let _device_stream = spawn_device_transport(&registry, loop_tx, waker, 1, TransportKind::Usb, "abc123");

    let first_push = read_length_prefixed(&mut client);
    assert_eq!(first_push, "abc123\tconnecting\tunknown\n");

    registry.remove(1);
    let second_push = read_length_prefixed(&mut client);
    assert_eq!(second_push, "");

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}
