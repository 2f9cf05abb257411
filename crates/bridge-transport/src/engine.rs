use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bridge_utils::OpenMap;
use bridge_wire::{self as wire, Message, Packet};
use crossbeam_channel::{Receiver, Sender};
use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Events, Interest, Token};
use tracing::{debug, info, warn};

use crate::dispatch::{self, HostAction, Request};
use crate::endpoint::DeviceEndpoint;
use crate::error::SelectionError;
use crate::event::{EventCore, WAKE_TOKEN};
use crate::ids::LocalIdAllocator;
use crate::listener::{Listener, ListenerKind};
use crate::local_socket::{status, LocalSocket};
use crate::registry::{Registry, TransportSelector, Waiter};
use crate::transport::{self, ConnectionState, LoopEvent, Transport, TransportKind};

/// Parse/response state of one accepted smart-socket client connection that
/// hasn't been bound to a transport yet. Grounded on the request/response
/// framing in the original `handle_host_request`, adapted to nonblocking
/// reads split across however many poll turns it takes to fill the buffer.
enum ConnStage {
    ReadingLength(Vec<u8>),
    ReadingBody { len: usize, buf: Vec<u8> },
    WritingResponse { buf: Vec<u8>, pos: usize, close_after: bool },
    /// `track-devices`: stays open, resending the device list whenever the
    /// registry notifies `notify`.
    TrackDevices { notify: Receiver<()>, outbox: VecDeque<u8> },
    /// Parked waiting for a transport matching `selector` to appear, e.g.
    /// `host-serial:<not-yet-connected>:get-state`. Woken the same way a
    /// `track-devices` client is, then `tail` is dispatched as if it had
    /// just resolved normally (wait-for-device-style deferred dispatch).
    AwaitingTransport { selector: TransportSelector, tail: String, notify: Receiver<()> },
}

struct ControlConn {
    stream: mio::net::TcpStream,
    stage: ConnStage,
}

/// One fd-keyed slot the loop thread dispatches on: either a smart-socket
/// client still in the request/response phase, or a client bound to a
/// transport, bridging raw bytes through a [`LocalSocket`].
enum ConnSlot {
    Control(ControlConn),
    Bridge(LocalSocket),
}

/// What a readable/writable callback did to the slot it was handed,
/// expressed as ownership transfer rather than a `&mut` poke — needed
/// because dispatching a request can move a `ControlConn`'s stream into a
/// brand new [`LocalSocket`] (an `open_bridge`/`transport:` bind), which a
/// borrow of the old slot can't express.
enum StepResult {
    Again(ConnSlot),
    Pending(ConnSlot),
    Moved,
    Closed,
}

/// Owns every fd the loop thread touches: listening sockets, accepted
/// smart-socket client connections, and the channel transports' reader
/// threads feed packets through. This is the single non-blocking loop;
/// all device I/O happens off it, on the per-transport reader/writer
/// threads in `transport.rs`.
pub struct Engine {
    core: EventCore,
    registry: Arc<Registry>,
    listeners: Vec<Listener>,
    conns: OpenMap<ConnSlot>,
    id_alloc: LocalIdAllocator,
    /// Separate id space from `id_alloc`: transport ids and local-socket
    /// ids are unrelated numberings in the original protocol.
    next_transport_id: LocalIdAllocator,
    loop_tx: Sender<LoopEvent>,
    loop_rx: Receiver<LoopEvent>,
    /// local_id -> (transport_id, conn token) for packets arriving from a
    /// transport that must be routed back to a bridged client connection.
    local_to_conn: OpenMap<(u32, Token)>,
    /// Set once `kill` has been dispatched; `run`'s loop exits once every
    /// pending reply has flushed.
    shutdown: Arc<AtomicBool>,
    /// `CNXN` handshake `arg0`, overridable via `BRIDGE_PROTOCOL_VERSION`.
    protocol_version: u32,
}

impl Engine {
    pub fn new() -> io::Result<Self> {
        let core = EventCore::new()?;
        let (loop_tx, loop_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            core,
            registry: Arc::new(Registry::new()),
            listeners: Vec::new(),
            conns: OpenMap::default(),
            id_alloc: LocalIdAllocator::default(),
            next_transport_id: LocalIdAllocator::default(),
            loop_tx,
            loop_rx,
            local_to_conn: OpenMap::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
            protocol_version: wire::PROTOCOL_VERSION,
        })
    }

    /// Overrides the `CNXN` handshake's advertised protocol version,
    /// threaded from `bridged`'s `BRIDGE_PROTOCOL_VERSION` environment
    /// override.
    #[must_use]
    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn loop_sender(&self) -> Sender<LoopEvent> {
        self.loop_tx.clone()
    }

    pub fn waker(&self) -> Arc<mio::Waker> {
        self.core.waker()
    }

    /// Binds and registers the control listener clients connect to for
    /// every smart-socket request.
    pub fn bind_control(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        self.bind_listener(addr, ListenerKind::Control)
    }

    /// Binds and registers the port host-proxy/emulator TCP transports
    /// connect to. USB transports have no analogous bind step (USB
    /// enumeration is out of scope here); this is the only way a
    /// `Transport` comes into being passively in this port (the other way
    /// is dialing out via `connect:`/`emulator:`).
    pub fn bind_device_port(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        self.bind_listener(addr, ListenerKind::QemuControl)
    }

    fn bind_listener(&mut self, addr: SocketAddr, kind: ListenerKind) -> io::Result<SocketAddr> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let mut mio_listener = MioTcpListener::from_std(std_listener);
        let bound_addr = mio_listener.local_addr()?;
        let token = self.core.next_token();
        self.core.register(&mut mio_listener, token, Interest::READABLE)?;
        self.listeners.push(Listener::new(token, mio_listener, kind));
        Ok(bound_addr)
    }

    /// Runs the event loop until `should_stop` returns true (checked once
    /// per wake, so a signal handler setting an `AtomicBool`/`AtomicUsize`
    /// unblocks this promptly via the waker) or until `kill` has been
    /// dispatched and every pending reply has flushed.
    pub fn run(&mut self, mut should_stop: impl FnMut() -> bool) -> io::Result<()> {
        let mut events = Events::with_capacity(256);
        loop {
            if should_stop() {
                info!("engine stopping");
                return Ok(());
            }
            self.core.poll(&mut events, Some(std::time::Duration::from_millis(250)))?;
            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                if let Some(listener_idx) = self.listeners.iter().position(|l| l.token == token) {
                    self.accept_loop(listener_idx);
                    continue;
                }
                if event.is_readable() {
                    self.on_readable(token);
                }
                if event.is_writable() {
                    self.on_writable(token);
                }
            }
            // Drained every tick (not only on an explicit wake) so a
            // `track-devices`/parked deferred-dispatch client is flushed
            // even when the registry change that woke its waiter raced a
            // quiet poll timeout rather than a real fd event.
            self.drain_loop_events();
            if self.shutdown.load(Ordering::Relaxed) && self.replies_drained() {
                info!("engine stopping (kill)");
                return Ok(());
            }
        }
    }

    fn replies_drained(&self) -> bool {
        !self.conns.iter().any(|(_, slot)| {
            matches!(slot, ConnSlot::Control(c) if matches!(c.stage, ConnStage::WritingResponse { .. }))
        })
    }

    fn accept_loop(&mut self, listener_idx: usize) {
        let kind = self.listeners[listener_idx].kind.clone();
        loop {
            let accepted = self.listeners[listener_idx].listener.accept();
            match accepted {
                Ok((stream, peer)) => match &kind {
                    ListenerKind::QemuControl => self.accept_device(stream, peer),
                    ListenerKind::Control => self.accept_control(stream, peer),
                    ListenerKind::Forward { transport_id, device_service } => {
                        self.accept_forward(stream, peer, *transport_id, device_service.clone());
                    }
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn accept_control(&mut self, mut stream: mio::net::TcpStream, peer: SocketAddr) {
        let token = self.core.next_token();
        if let Err(e) = self.core.register(&mut stream, token, Interest::READABLE) {
            warn!(error = %e, "failed to register accepted connection");
            return;
        }
        debug!(%peer, "accepted smart-socket connection");
        self.conns.insert(
            token.0,
            ConnSlot::Control(ControlConn { stream, stage: ConnStage::ReadingLength(Vec::with_capacity(4)) }),
        );
    }

    /// Turns an accepted nonblocking `mio` stream back into a blocking
    /// `std` one and hands it to `Transport::spawn`, which owns it from its
    /// dedicated reader/writer threads from here on — it never touches
    /// this struct's `mio::Poll` again.
    fn accept_device(&mut self, stream: mio::net::TcpStream, peer: SocketAddr) {
        let std_stream = match into_blocking_std(stream) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to prepare device connection");
                return;
            }
        };
        let endpoint: Box<dyn DeviceEndpoint> = match crate::endpoint::TcpEndpoint::new(std_stream) {
            Ok(ep) => Box::new(ep),
            Err(e) => {
                warn!(error = %e, "failed to wrap device endpoint");
                return;
            }
        };
        let id = self.next_transport_id.alloc();
        info!(transport = id, %peer, "device connected");
        let transport = Transport::spawn_with_version(
            id,
            TransportKind::HostProxy,
            peer.to_string(),
            endpoint,
            self.loop_tx.clone(),
            self.core.waker(),
            self.protocol_version,
        );
        self.registry.insert(transport);
    }

    fn accept_forward(&mut self, mut stream: mio::net::TcpStream, peer: SocketAddr, transport_id: u32, device_service: String) {
        let token = self.core.next_token();
        if let Err(e) = self.core.register(&mut stream, token, Interest::READABLE) {
            warn!(error = %e, "failed to register forward connection");
            return;
        }
        let Some(local_id) = self.begin_bridge(token, transport_id, &device_service) else {
            warn!(transport = transport_id, "forward target transport gone");
            let _ = self.core.deregister(&mut stream);
            return;
        };
        let mut socket = LocalSocket::new(local_id, token, stream);
        socket.transport_id = Some(transport_id);
        debug!(%peer, transport = transport_id, local = local_id, "forward connection opened");
        self.conns.insert(token.0, ConnSlot::Bridge(socket));
    }

    fn drain_loop_events(&mut self) {
        while let Ok(event) = self.loop_rx.try_recv() {
            match event {
                LoopEvent::Packet { transport_id, packet } => self.handle_transport_packet(transport_id, packet),
                LoopEvent::ReaderDown { transport_id } => self.handle_transport_down(transport_id),
            }
        }
        for slot in self.conns.values_mut() {
            if let ConnSlot::Control(conn) = slot {
                if let ConnStage::TrackDevices { notify, outbox } = &mut conn.stage {
                    if notify.try_recv().is_ok() {
                        outbox.extend(framed_device_list(&self.registry));
                    }
                }
            }
        }
        let ready: Vec<Token> = self
            .conns
            .iter()
            .filter_map(|(k, slot)| match slot {
                ConnSlot::Control(conn) => match &conn.stage {
                    ConnStage::AwaitingTransport { notify, .. } if notify.try_recv().is_ok() => Some(Token(k)),
                    _ => None,
                },
                ConnSlot::Bridge(_) => None,
            })
            .collect();
        for token in ready {
            let Some(ConnSlot::Control(conn)) = self.conns.remove(token.0) else { continue };
            let ConnStage::AwaitingTransport { selector, tail, .. } = conn.stage else { unreachable!() };
            self.resume_awaiting(conn, token, selector, tail);
        }
    }

    fn resume_awaiting(&mut self, conn: ControlConn, token: Token, selector: TransportSelector, tail: String) {
        let result = match self.registry.acquire_one(&selector) {
            Ok(transport_id) => self.dispatch_resolved(conn, token, transport_id, &tail),
            Err(SelectionError::TargetNotFound) => self.park_for_transport(conn, token, selector, tail),
            Err(e) => self.write_reply(conn, token, Err(e.as_wire_str().to_string())),
        };
        match result {
            StepResult::Pending(slot) | StepResult::Again(slot) => {
                self.conns.insert(token.0, slot);
            }
            StepResult::Moved | StepResult::Closed => {}
        }
    }

    fn park_for_transport(&mut self, mut conn: ControlConn, token: Token, selector: TransportSelector, tail: String) -> StepResult {
        let (notify_tx, notify_rx) = crossbeam_channel::unbounded();
        self.registry.register_waiter(Waiter { selector: selector.clone(), notify: notify_tx });
        conn.stage = ConnStage::AwaitingTransport { selector, tail, notify: notify_rx };
        let _ = self.core.reregister(&mut conn.stream, token, Interest::READABLE);
        StepResult::Pending(ConnSlot::Control(conn))
    }

    fn handle_transport_packet(&mut self, transport_id: u32, packet: Box<Packet>) {
        match packet.msg.command {
            wire::CNXN => {
                let len = packet.msg.data_length as usize;
                let banner = String::from_utf8_lossy(&packet.payload.as_slice()[..len]).into_owned();
                let name = transport::parse_banner_name(&banner);
                self.registry.with_transport(transport_id, |t| {
                    t.state = ConnectionState::Device;
                    if let Some(name) = name {
                        t.name = name;
                    }
                    info!(transport = transport_id, serial = %t.serial, name = %t.name, "device online");
                });
            }
            wire::OKAY | wire::WRTE | wire::CLSE => {
                self.route_to_bridged(transport_id, &packet);
            }
            wire::STAT => {
                // STAT has no host-visible effect in this port; the original
                // uses it only for a diagnostics branch that is otherwise
                // dead code.
                debug!(transport = transport_id, "received STAT, no-op");
            }
            other => {
                debug!(transport = transport_id, command = other, "unhandled command");
            }
        }
        // Hand the buffer back to the reader thread's pool now that routing
        // is done; a transport that's already gone just drops it.
        self.registry.with_transport(transport_id, |t| t.release_packet(packet));
    }

    /// Routes an inbound `OKAY`/`WRTE`/`CLSE` to the bridged local socket
    /// it targets, keyed by the echoed local id in `arg1`. `OKAY` binds
    /// `remote_id` on first sight; `WRTE` both enqueues the payload for the
    /// client fd and acks the frame back to the device — exactly one
    /// `OKAY` per `WRTE`.
    fn route_to_bridged(&mut self, transport_id: u32, packet: &Packet) {
        let local_id = packet.msg.arg1;
        let Some(&(expected_transport, token)) = self.local_to_conn.get(local_id as usize) else {
            return;
        };
        if expected_transport != transport_id {
            return;
        }

        match packet.msg.command {
            wire::OKAY => {
                if let Some(ConnSlot::Bridge(sock)) = self.conns.get_mut(token.0) {
                    if sock.remote_id == 0 {
                        sock.remote_id = packet.msg.arg0;
                    }
                }
            }
            wire::WRTE => {
                let remote_id = match self.conns.get_mut(token.0) {
                    Some(ConnSlot::Bridge(sock)) => {
                        let len = packet.msg.data_length as usize;
                        sock.enqueue(Box::new(Packet::with_payload(Message::default(), &packet.payload.as_slice()[..len])));
                        let _ = self.core.reregister(&mut sock.stream, token, Interest::READABLE | Interest::WRITABLE);
                        sock.remote_id
                    }
                    _ => return,
                };
                let ack = build_packet(wire::OKAY, local_id, remote_id, &[]);
                let _ = self.registry.with_transport(transport_id, |t| t.send(ack));
            }
            wire::CLSE => {
                if let Some(ConnSlot::Bridge(sock)) = self.conns.get_mut(token.0) {
                    sock.closing = true;
                    let _ = self.core.reregister(&mut sock.stream, token, Interest::WRITABLE);
                }
                self.local_to_conn.remove(local_id as usize);
            }
            _ => {}
        }
    }

    fn handle_transport_down(&mut self, transport_id: u32) {
        warn!(transport = transport_id, "transport reader stopped");
        if let Some(t) = self.registry.remove(transport_id) {
            self.teardown_transport(t);
        }
    }

    fn teardown_transport(&mut self, mut t: Transport) {
        t.kick();
        let _ = t.join();
        self.close_bridged_for_transport(t.id);
        self.remove_listeners_for_transport(t.id);
    }

    /// Closes every bridged connection multiplexed over `transport_id`.
    /// Dropping the `LocalSocket` drops its `TcpStream`, closing the fd;
    /// `mio` tears down the registration along with it, so there is no
    /// explicit `deregister` call needed here.
    fn close_bridged_for_transport(&mut self, transport_id: u32) {
        let targets: Vec<(Token, u32)> = self
            .conns
            .iter()
            .filter_map(|(k, slot)| match slot {
                ConnSlot::Bridge(sock) if sock.transport_id == Some(transport_id) => Some((Token(k), sock.local_id)),
                _ => None,
            })
            .collect();
        for (token, local_id) in targets {
            self.local_to_conn.remove(local_id as usize);
            self.conns.remove(token.0);
        }
    }

    fn remove_listeners_for_transport(&mut self, transport_id: u32) {
        let mut i = 0;
        while i < self.listeners.len() {
            let matches = matches!(&self.listeners[i].kind, ListenerKind::Forward { transport_id: t, .. } if *t == transport_id);
            if matches {
                let mut l = self.listeners.remove(i);
                let _ = self.core.deregister(&mut l.listener);
            } else {
                i += 1;
            }
        }
    }

    /// Drives one slot's state machine forward on a readable event. The
    /// slot is taken out of `self.conns` for the duration so this (and
    /// everything it calls) can freely touch other `self` fields — e.g.
    /// sending an `OPEN` packet to a transport, or moving the slot into a
    /// bridge — without fighting the borrow checker over `self.conns`
    /// being reborrowed.
    fn on_readable(&mut self, token: Token) {
        let Some(slot) = self.conns.remove(token.0) else { return };
        let mut current = slot;
        loop {
            match self.readable_step(current, token) {
                StepResult::Again(slot) => current = slot,
                StepResult::Pending(slot) => {
                    self.conns.insert(token.0, slot);
                    return;
                }
                StepResult::Moved | StepResult::Closed => return,
            }
        }
    }

    fn readable_step(&mut self, slot: ConnSlot, token: Token) -> StepResult {
        match slot {
            ConnSlot::Control(mut conn) => match &mut conn.stage {
                ConnStage::ReadingLength(buf) => {
                    if !pump_read(&mut conn.stream, buf, 4) || buf.len() < 4 {
                        return StepResult::Pending(ConnSlot::Control(conn));
                    }
                    match dispatch::decode_length_prefix(buf) {
                        Some(len) => {
                            conn.stage = ConnStage::ReadingBody { len, buf: Vec::with_capacity(len) };
                            StepResult::Again(ConnSlot::Control(conn))
                        }
                        None => self.write_reply(conn, token, Err("bad request length".to_string())),
                    }
                }
                ConnStage::ReadingBody { len, buf } => {
                    let target = *len;
                    if !pump_read(&mut conn.stream, buf, target) || buf.len() < target {
                        return StepResult::Pending(ConnSlot::Control(conn));
                    }
                    let service = String::from_utf8_lossy(buf).into_owned();
                    self.begin_response(conn, token, &service)
                }
                ConnStage::WritingResponse { .. } | ConnStage::TrackDevices { .. } | ConnStage::AwaitingTransport { .. } => {
                    // Client isn't expected to send more; drain and detect
                    // disconnects so a parked/tracked connection doesn't
                    // leak once its owner goes away.
                    let mut scratch = [0u8; 256];
                    match conn.stream.read(&mut scratch) {
                        Ok(0) => StepResult::Closed,
                        _ => StepResult::Pending(ConnSlot::Control(conn)),
                    }
                }
            },
            ConnSlot::Bridge(mut sock) => {
                let mut buf = [0u8; wire::MAX_PAYLOAD];
                match sock.read_available(&mut buf) {
                    Ok(0) => {
                        self.send_close(&sock);
                        self.local_to_conn.remove(sock.local_id as usize);
                        StepResult::Closed
                    }
                    Ok(n) => {
                        if let Some(transport_id) = sock.transport_id {
                            let pkt = build_packet(wire::WRTE, sock.local_id, sock.remote_id, &buf[..n]);
                            let _ = self.registry.with_transport(transport_id, |t| t.send(pkt));
                        }
                        StepResult::Pending(ConnSlot::Bridge(sock))
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => StepResult::Pending(ConnSlot::Bridge(sock)),
                    Err(_) => {
                        self.send_close(&sock);
                        self.local_to_conn.remove(sock.local_id as usize);
                        StepResult::Closed
                    }
                }
            }
        }
    }

    fn on_writable(&mut self, token: Token) {
        let Some(slot) = self.conns.remove(token.0) else { return };
        match slot {
            ConnSlot::Control(mut conn) => {
                let closed = match &mut conn.stage {
                    ConnStage::WritingResponse { buf, pos, close_after } => match conn.stream.write(&buf[*pos..]) {
                        Ok(n) => {
                            *pos += n;
                            *pos >= buf.len() && *close_after
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => false,
                        Err(_) => true,
                    },
                    ConnStage::TrackDevices { outbox, .. } => {
                        drain_outbox(&mut conn.stream, outbox);
                        false
                    }
                    ConnStage::ReadingLength(_) | ConnStage::ReadingBody { .. } | ConnStage::AwaitingTransport { .. } => false,
                };
                if !closed {
                    self.conns.insert(token.0, ConnSlot::Control(conn));
                }
                // Dropping `conn` here (the `closed` branch) closes the fd;
                // mio drops its registration along with it.
            }
            ConnSlot::Bridge(mut sock) => {
                loop {
                    match sock.flush_one() {
                        Ok(true) => {
                            if sock.is_drained() {
                                break;
                            }
                        }
                        Ok(false) => break,
                        Err(_) => {
                            self.local_to_conn.remove(sock.local_id as usize);
                            return;
                        }
                    }
                }
                if sock.closing && sock.is_drained() {
                    self.local_to_conn.remove(sock.local_id as usize);
                } else {
                    self.conns.insert(token.0, ConnSlot::Bridge(sock));
                }
            }
        }
    }

    fn begin_response(&mut self, conn: ControlConn, token: Token, service: &str) -> StepResult {
        if service == "track-devices" {
            let (notify_tx, notify_rx) = crossbeam_channel::unbounded();
            self.registry.register_waiter(Waiter { selector: TransportSelector::Any, notify: notify_tx });
            let mut outbox = VecDeque::new();
            outbox.extend(b"OKAY");
            outbox.extend(framed_device_list(&self.registry));
            let mut conn = conn;
            conn.stage = ConnStage::TrackDevices { notify: notify_rx, outbox };
            let _ = self.core.reregister(&mut conn.stream, token, Interest::READABLE | Interest::WRITABLE);
            return StepResult::Pending(ConnSlot::Control(conn));
        }

        match dispatch::dispatch_host_scoped(&self.registry, service) {
            Some(HostAction::Reply(reply)) => return self.write_reply(conn, token, reply),
            Some(HostAction::Kill) => {
                self.shutdown.store(true, Ordering::Relaxed);
                return self.write_reply(conn, token, Ok(String::new()));
            }
            Some(HostAction::Connect { host, port }) => return self.handle_connect(conn, token, &host, port),
            Some(HostAction::Disconnect { serial }) => return self.handle_disconnect(conn, token, serial),
            Some(HostAction::Emulator { port, name }) => return self.handle_emulator(conn, token, port, name),
            None => {}
        }

        let Request { selector, service: tail } = dispatch::parse_request(service);

        if let Some(rest) = tail.strip_prefix("forward:") {
            return self.handle_forward(conn, token, &selector, rest, false);
        }
        if let Some(rest) = tail.strip_prefix("killforward:") {
            return self.handle_forward(conn, token, &selector, rest, true);
        }
        if tail == "transport-any" || tail == "transport-usb" || tail == "transport-local" || tail.starts_with("transport:") {
            return self.handle_transport_bind(conn, token, tail);
        }

        let transport_id = match self.registry.acquire_one(&selector) {
            Ok(id) => id,
            Err(SelectionError::TargetNotFound) => return self.park_for_transport(conn, token, selector, tail.to_string()),
            Err(e) => return self.write_reply(conn, token, Err(e.as_wire_str().to_string())),
        };
        self.dispatch_resolved(conn, token, transport_id, tail)
    }

    fn dispatch_resolved(&mut self, conn: ControlConn, token: Token, transport_id: u32, tail: &str) -> StepResult {
        match tail {
            "get-state" | "get-serialno" => {
                let reply = dispatch::dispatch_transport_scoped(&self.registry, transport_id, tail);
                self.write_reply(conn, token, reply)
            }
            // Anything else is a device-bound service request (e.g.
            // `shell:`), opened as a bridged byte stream rather than a
            // one-shot reply.
            _ => self.open_bridge(conn, token, transport_id, tail),
        }
    }

    fn write_reply(&mut self, mut conn: ControlConn, token: Token, reply: dispatch::Reply) -> StepResult {
        let ok = reply.is_ok();
        let body = match reply {
            Ok(s) => s,
            Err(e) => e,
        };
        let mut buf = Vec::with_capacity(8 + body.len());
        buf.extend_from_slice(if ok { b"OKAY" } else { b"FAIL" });
        buf.extend_from_slice(&dispatch::encode_length_prefix(body.len()));
        buf.extend_from_slice(body.as_bytes());
        conn.stage = ConnStage::WritingResponse { buf, pos: 0, close_after: true };
        let _ = self.core.reregister(&mut conn.stream, token, Interest::WRITABLE);
        StepResult::Pending(ConnSlot::Control(conn))
    }

    /// Allocates a local id, sends the `OPEN` that asks the device to
    /// start `device_service`, and registers the id-to-conn routing entry.
    /// Does not touch the client stream — callers own moving it into a
    /// `LocalSocket` once this succeeds.
    fn begin_bridge(&mut self, token: Token, transport_id: u32, device_service: &str) -> Option<u32> {
        let local_id = self.id_alloc.alloc();
        let pkt = build_packet(wire::OPEN, local_id, 0, device_service.as_bytes());
        match self.registry.with_transport(transport_id, |t| t.send(pkt)) {
            Some(Ok(())) => {
                self.local_to_conn.insert(local_id as usize, (transport_id, token));
                Some(local_id)
            }
            _ => None,
        }
    }

    fn open_bridge(&mut self, conn: ControlConn, token: Token, transport_id: u32, device_service: &str) -> StepResult {
        match self.begin_bridge(token, transport_id, device_service) {
            Some(local_id) => {
                let mut socket = LocalSocket::new(local_id, token, conn.stream);
                socket.transport_id = Some(transport_id);
                let _ = self.core.reregister(&mut socket.stream, token, Interest::READABLE);
                self.conns.insert(token.0, ConnSlot::Bridge(socket));
                StepResult::Moved
            }
            None => self.write_reply(conn, token, Err("target not found".to_string())),
        }
    }

    /// `transport(-any|-usb|-local|:<id>)`: binds the socket to a resolved
    /// transport and replies `OKAY`; subsequent writes go straight to the
    /// transport rather than through an `OPEN`'d service.
    fn handle_transport_bind(&mut self, conn: ControlConn, token: Token, tail: &str) -> StepResult {
        let selector = if tail == "transport-any" {
            TransportSelector::Any
        } else if tail == "transport-usb" {
            TransportSelector::AnyUsb
        } else if tail == "transport-local" {
            TransportSelector::AnyLocal
        } else if let Some(id_str) = tail.strip_prefix("transport:") {
            return match id_str.parse::<u32>() {
                Ok(id) => match self.registry.with_transport(id, |_| ()) {
                    Some(()) => self.bind_transport_socket(conn, token, id),
                    None => self.write_reply(conn, token, Err(SelectionError::TargetNotFound.as_wire_str().to_string())),
                },
                Err(_) => self.write_reply(conn, token, Err("invalid transport id".to_string())),
            };
        } else {
            return self.write_reply(conn, token, Err("unknown service".to_string()));
        };

        match self.registry.acquire_one(&selector) {
            Ok(id) => self.bind_transport_socket(conn, token, id),
            Err(e) => self.write_reply(conn, token, Err(e.as_wire_str().to_string())),
        }
    }

    fn bind_transport_socket(&mut self, conn: ControlConn, token: Token, transport_id: u32) -> StepResult {
        let local_id = self.id_alloc.alloc();
        self.local_to_conn.insert(local_id as usize, (transport_id, token));
        let mut socket = LocalSocket::new(local_id, token, conn.stream);
        socket.transport_id = Some(transport_id);
        socket.set_flag(status::REMOTE_BOUND);
        socket.enqueue(Box::new(Packet::with_payload(Message::default(), b"OKAY")));
        let _ = self.core.reregister(&mut socket.stream, token, Interest::READABLE | Interest::WRITABLE);
        self.conns.insert(token.0, ConnSlot::Bridge(socket));
        StepResult::Moved
    }

    /// `forward:<local>;<remote>` and `killforward:<local>;<remote>`.
    fn handle_forward(&mut self, conn: ControlConn, token: Token, selector: &TransportSelector, rest: &str, kill: bool) -> StepResult {
        let transport_id = match self.registry.acquire_one(selector) {
            Ok(id) => id,
            Err(e) => return self.write_reply(conn, token, Err(e.as_wire_str().to_string())),
        };
        let Some((local_port, remote_spec)) = dispatch::parse_forward_spec(rest) else {
            return self.write_reply(conn, token, Err("bad forward spec".to_string()));
        };
        if kill {
            match self.remove_forward(transport_id, local_port) {
                Ok(()) => self.write_reply(conn, token, Ok(String::new())),
                Err(e) => self.write_reply(conn, token, Err(e)),
            }
        } else {
            match self.install_forward(transport_id, local_port, remote_spec) {
                Ok(()) => self.write_double_okay(conn, token),
                Err(e) => self.write_reply(conn, token, Err(e)),
            }
        }
    }

    fn install_forward(&mut self, transport_id: u32, local_port: u16, remote_spec: String) -> Result<(), String> {
        self.remove_forward_listener_on_port(local_port);
        let addr = SocketAddr::from(([127, 0, 0, 1], local_port));
        let std_listener = std::net::TcpListener::bind(addr).map_err(|e| e.to_string())?;
        std_listener.set_nonblocking(true).map_err(|e| e.to_string())?;
        let mut mio_listener = MioTcpListener::from_std(std_listener);
        let token = self.core.next_token();
        self.core.register(&mut mio_listener, token, Interest::READABLE).map_err(|e| e.to_string())?;
        self.listeners.push(Listener::new(token, mio_listener, ListenerKind::Forward { transport_id, device_service: remote_spec }));
        Ok(())
    }

    fn remove_forward(&mut self, transport_id: u32, local_port: u16) -> Result<(), String> {
        let mut i = 0;
        let mut removed = false;
        while i < self.listeners.len() {
            let is_match = match &self.listeners[i].kind {
                ListenerKind::Forward { transport_id: t, .. } if *t == transport_id => {
                    self.listeners[i].local_addr().ok().map(|a| a.port()) == Some(local_port)
                }
                _ => false,
            };
            if is_match {
                let mut l = self.listeners.remove(i);
                let _ = self.core.deregister(&mut l.listener);
                removed = true;
            } else {
                i += 1;
            }
        }
        if removed { Ok(()) } else { Err("listener not found".to_string()) }
    }

    fn remove_forward_listener_on_port(&mut self, local_port: u16) {
        let mut i = 0;
        while i < self.listeners.len() {
            let matches = matches!(self.listeners[i].kind, ListenerKind::Forward { .. })
                && self.listeners[i].local_addr().ok().map(|a| a.port()) == Some(local_port);
            if matches {
                let mut l = self.listeners.remove(i);
                let _ = self.core.deregister(&mut l.listener);
            } else {
                i += 1;
            }
        }
    }

    /// `forward:`'s success reply: two back-to-back `OKAY`s with no
    /// length prefix, distinct from the usual one-`OKAY`-plus-body reply
    /// shape.
    fn write_double_okay(&mut self, mut conn: ControlConn, token: Token) -> StepResult {
        conn.stage = ConnStage::WritingResponse { buf: b"OKAYOKAY".to_vec(), pos: 0, close_after: true };
        let _ = self.core.reregister(&mut conn.stream, token, Interest::WRITABLE);
        StepResult::Pending(ConnSlot::Control(conn))
    }

    /// `connect:<host>[:<port>]` — dials a TCP transport nonblockingly so
    /// the loop thread's callback stays bounded, then hands the connection
    /// off the same way `accept_device` does.
    fn handle_connect(&mut self, conn: ControlConn, token: Token, host: &str, port: u16) -> StepResult {
        let reply = self.dial_tcp_transport(host, port).map(|_| format!("connected to {host}:{port}"));
        self.write_reply(conn, token, reply)
    }

    fn dial_tcp_transport(&mut self, host: &str, port: u16) -> Result<u32, String> {
        let addr_str = format!("{host}:{port}");
        let addr: SocketAddr = addr_str.parse().map_err(|_| format!("failed to resolve {addr_str}"))?;
        let stream = MioTcpStream::connect(addr).map_err(|e| e.to_string())?;
        match stream.take_error() {
            Ok(Some(e)) => return Err(e.to_string()),
            Err(e) => return Err(e.to_string()),
            Ok(None) => {}
        }
        let std_stream = into_blocking_std(stream).map_err(|e| e.to_string())?;
        let endpoint: Box<dyn DeviceEndpoint> = match crate::endpoint::TcpEndpoint::new(std_stream) {
            Ok(ep) => Box::new(ep),
            Err(e) => return Err(e.to_string()),
        };
        let id = self.next_transport_id.alloc();
        info!(transport = id, %addr, "dialed tcp transport");
        let transport = Transport::spawn_with_version(
            id,
            TransportKind::Local,
            addr_str,
            endpoint,
            self.loop_tx.clone(),
            self.core.waker(),
            self.protocol_version,
        );
        self.registry.insert(transport);
        Ok(id)
    }

    /// `disconnect:[<serial>]` — an empty tail tears down every TCP
    /// transport, a non-empty one only the matching serial. USB transports
    /// are never a `disconnect:` target.
    fn handle_disconnect(&mut self, conn: ControlConn, token: Token, serial: Option<String>) -> StepResult {
        let removed = self.registry.remove_by(|t| {
            if t.kind == TransportKind::Usb {
                return false;
            }
            match &serial {
                Some(s) => &t.serial == s,
                None => true,
            }
        });
        for t in removed {
            self.teardown_transport(t);
        }
        self.write_reply(conn, token, Ok(String::new()))
    }

    /// `emulator:<port>[,<name>]` — dials `127.0.0.1:<port>` and tags the
    /// resulting transport with the conventional `emulator-<port>` serial.
    fn handle_emulator(&mut self, conn: ControlConn, token: Token, port: u16, name: Option<String>) -> StepResult {
        let serial = format!("emulator-{port}");
        match self.dial_tcp_transport("127.0.0.1", port) {
            Ok(id) => {
                self.registry.with_transport(id, |t| {
                    t.serial = serial.clone();
                    if let Some(name) = &name {
                        t.name = name.clone();
                    }
                });
                self.write_reply(conn, token, Ok(String::new()))
            }
            Err(e) => self.write_reply(conn, token, Err(e)),
        }
    }

    /// Sends the `CLSE` that tells the transport a bridged stream is gone.
    fn send_close(&mut self, sock: &LocalSocket) {
        let Some(transport_id) = sock.transport_id else { return };
        let pkt = build_packet(wire::CLSE, sock.local_id, sock.remote_id, &[]);
        let _ = self.registry.with_transport(transport_id, |t| t.send(pkt));
    }
}

/// Builds a fully encoded outbound device-bound packet (header fields set,
/// checksum/magic computed), ready to hand to `Transport::send`.
fn build_packet(command: u32, arg0: u32, arg1: u32, payload: &[u8]) -> Box<Packet> {
    let mut pkt = Box::new(Packet::with_payload(Message { command, arg0, arg1, ..Default::default() }, payload));
    wire::encode(&mut pkt);
    pkt
}

/// Hands a freshly accepted `mio` stream's fd to a blocking `std`
/// `TcpStream`, for the device connection to be driven by a transport's own
/// reader/writer threads rather than this struct's `mio::Poll`.
#[cfg(unix)]
fn into_blocking_std(stream: mio::net::TcpStream) -> io::Result<std::net::TcpStream> {
    use std::os::unix::io::{FromRawFd, IntoRawFd};
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(stream.into_raw_fd()) };
    std_stream.set_nonblocking(false)?;
    Ok(std_stream)
}

fn pump_read(stream: &mut mio::net::TcpStream, buf: &mut Vec<u8>, target: usize) -> bool {
    let mut scratch = [0u8; 256];
    loop {
        if buf.len() >= target {
            return true;
        }
        match stream.read(&mut scratch) {
            Ok(0) => return false,
            Ok(n) => buf.extend_from_slice(&scratch[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return buf.len() >= target,
            Err(_) => return false,
        }
    }
}

fn drain_outbox(stream: &mut mio::net::TcpStream, outbox: &mut VecDeque<u8>) {
    let chunk: Vec<u8> = outbox.iter().copied().collect();
    if chunk.is_empty() {
        return;
    }
    match stream.write(&chunk) {
        Ok(n) => {
            outbox.drain(..n);
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
        Err(_) => {}
    }
}

/// Length-prefixed device-list push for a `track-devices` stream: every
/// registry mutation sends one of these frames, distinct from the
/// `OKAY` + length-prefix shape of a one-shot `devices` reply (only the
/// very first push is preceded by that `OKAY`).
fn framed_device_list(registry: &Registry) -> Vec<u8> {
    let body = dispatch::render_devices_list(registry);
    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&dispatch::encode_length_prefix(body.len()));
    framed.extend_from_slice(body.as_bytes());
    framed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as StdTcpStream;
    use std::time::Duration;

    fn connect_and_send(addr: SocketAddr, body: &[u8]) -> StdTcpStream {
        let mut s = StdTcpStream::connect(addr).unwrap();
        s.write_all(&dispatch::encode_length_prefix(body.len())).unwrap();
        s.write_all(body).unwrap();
        s
    }

    fn read_reply(stream: &mut StdTcpStream) -> (bool, String) {
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut status = [0u8; 4];
        stream.read_exact(&mut status).unwrap();
        let ok = &status == b"OKAY";
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).unwrap();
        let len = dispatch::decode_length_prefix(&len_buf).unwrap();
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).unwrap();
        (ok, String::from_utf8(body).unwrap())
    }

    /// Runs `engine` on a background thread until `stop` is set, returning
    /// the join handle. Caller drives the connection(s) against `addr`s
    /// obtained before calling this, then sets `stop` and joins.
    fn spawn_loop(mut engine: Engine, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            engine.run(|| stop.load(Ordering::Relaxed)).unwrap();
        })
    }

    #[test]
    fn devices_request_round_trips_empty_list() {
        let mut engine = Engine::new().unwrap();
        let addr = engine.bind_control(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let loop_handle = spawn_loop(engine, Arc::clone(&stop));

        let mut s = connect_and_send(addr, b"host:devices");
        let (ok, body) = read_reply(&mut s);
        assert!(ok);
        assert_eq!(body, "");

        stop.store(true, Ordering::Relaxed);
        loop_handle.join().unwrap();
    }

    /// A request for a transport that doesn't exist yet parks
    /// (`ConnStage::AwaitingTransport`) instead of failing immediately, and
    /// resumes once a matching transport shows up — the deferred-dispatch
    /// behavior `track-devices` already relied on, generalized to any
    /// transport-scoped request.
    #[test]
    fn get_state_on_unknown_transport_parks_then_resumes() {
        let mut engine = Engine::new().unwrap();
        let control_addr = engine.bind_control(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let device_addr = engine.bind_device_port(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let loop_handle = spawn_loop(engine, Arc::clone(&stop));

        let mut s = connect_and_send(control_addr, b"host:get-state");
        // Give the loop time to park the request before any transport exists.
        std::thread::sleep(Duration::from_millis(100));

        let _device = StdTcpStream::connect(device_addr).unwrap();

        let (ok, body) = read_reply(&mut s);
        assert!(ok);
        assert_eq!(body, "connecting");

        stop.store(true, Ordering::Relaxed);
        loop_handle.join().unwrap();
    }

    #[test]
    fn install_then_remove_forward_listener() {
        let mut engine = Engine::new().unwrap();
        let transport_id = 42;
        engine.install_forward(transport_id, 0, "tcp:9000".to_string()).unwrap();
        assert_eq!(engine.listeners.len(), 1);
        assert!(matches!(
            &engine.listeners[0].kind,
            ListenerKind::Forward { transport_id: t, device_service } if *t == transport_id && device_service == "tcp:9000"
        ));

        let bound_port = engine.listeners[0].local_addr().unwrap().port();
        engine.remove_forward(transport_id, bound_port).unwrap();
        assert!(engine.listeners.is_empty());
    }
}
