use std::io::{self};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use bridge_wire::{self as wire, Message, Packet, PacketPool};
use crossbeam_channel::Sender;
use mio::Waker;
use tracing::{debug, trace, warn};

use crate::endpoint::{DeviceEndpoint, DeviceKicker};

/// In-flight packet budget per transport: one being decoded by the reader
/// thread, a few queued in the loop thread waiting to be routed. Chosen
/// generously since exhaustion drops the transport — single-owner
/// destruction applies here too, a reader that can't get a buffer can't
/// keep going.
const PACKET_POOL_CAPACITY: usize = 16;

/// Which physical transport family a `Transport` rides on. Selection
/// commands (`transport-usb`, `transport-local`) filter on this; USB
/// enumeration itself is out of scope, so in this port the
/// only producer of `Usb` transports is a test double.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Usb,
    Local,
    /// `connect:`/`emulator:`-originated TCP transport used in tests and by
    /// the `host-proxy` development mode.
    HostProxy,
}

/// Connection state machine driven entirely by the loop thread as it
/// observes `CNXN`/`STAT` packets and reader/writer shutdown. Mirrors the
/// `ctype` transitions in the original `transport.c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Offline,
    WaitingForCnxn,
    Device,
    Bootloader,
    Recovery,
    Sideload,
    PasswordLocked,
}

impl ConnectionState {
    pub fn as_wire_str(self) -> &'static str {
        match self {
            ConnectionState::Offline => "offline",
            ConnectionState::WaitingForCnxn => "connecting",
            ConnectionState::Device => "device",
            ConnectionState::Bootloader => "bootloader",
            ConnectionState::Recovery => "recovery",
            ConnectionState::Sideload => "sideload",
            ConnectionState::PasswordLocked => "unauthorized",
        }
    }
}

/// Events the per-transport reader thread hands to the loop thread. The
/// loop thread is the only consumer; `Engine` matches on these alongside
/// local-socket fd readiness in its single `mio::Poll` dispatch.
pub enum LoopEvent {
    Packet { transport_id: u32, packet: Box<Packet> },
    ReaderDown { transport_id: u32 },
}

/// A live connection to one device, plus the bookkeeping the loop thread
/// needs to route `OPEN`/`WRTE`/`CLSE`/`OKAY` packets to the right local
/// socket. Grounded on `atransport` in the original `transport.c`, reshaped
/// around this port's reader-thread/loop-thread split.
pub struct Transport {
    pub id: u32,
    pub kind: TransportKind,
    pub serial: String,
    /// Human-readable device name parsed out of its `CNXN` banner
    /// (`<mode>::<name>\0`), distinct from `serial`. Defaults to `"unknown"`
    /// until the banner arrives.
    pub name: String,
    pub state: ConnectionState,
    /// Outstanding local-socket opens attributed to this transport; it is
    /// destroyed only once this reaches zero after going offline.
    pub req_count: AtomicU32,
    pub res_count: AtomicU32,
    to_device: Sender<Box<Packet>>,
    kicker: Arc<dyn DeviceKicker>,
    reader_handle: Option<JoinHandle<()>>,
    writer_handle: Option<JoinHandle<()>>,
    /// Shared with the reader thread: it acquires a buffer per inbound
    /// frame, the loop thread releases it back once routing is done.
    pool: Arc<Mutex<PacketPool>>,
}

impl Transport {
    /// Spawns the reader and writer threads for `endpoint` and returns the
    /// `Transport` handle the loop thread retains. `to_loop` is the shared
    /// channel all transports funnel `LoopEvent`s through; `waker` wakes
    /// the loop thread's blocked `mio::Poll::poll` whenever a new event is
    /// queued.
    pub fn spawn(
        id: u32,
        kind: TransportKind,
        serial: String,
        endpoint: Box<dyn DeviceEndpoint>,
        to_loop: Sender<LoopEvent>,
        waker: Arc<Waker>,
    ) -> Self {
        Self::spawn_with_version(id, kind, serial, endpoint, to_loop, waker, wire::PROTOCOL_VERSION)
    }

    /// Same as [`Transport::spawn`] but lets the caller override the
    /// `CNXN` handshake's advertised protocol version (the
    /// `BRIDGE_PROTOCOL_VERSION` override), threaded down from
    /// `bridged`'s CLI/environment.
    pub fn spawn_with_version(
        id: u32,
        kind: TransportKind,
        serial: String,
        endpoint: Box<dyn DeviceEndpoint>,
        to_loop: Sender<LoopEvent>,
        waker: Arc<Waker>,
        protocol_version: u32,
    ) -> Self {
        let (mut reader, mut writer, kicker) = endpoint.split();
        let (to_device, from_loop) = crossbeam_channel::unbounded::<Box<Packet>>();
        let pool = Arc::new(Mutex::new(PacketPool::new(PACKET_POOL_CAPACITY)));

        // First frame sent to every newly connected device: announces the
        // host side and lets the device echo back its own `CNXN` with a
        // name banner.
        let mut handshake = Box::new(Packet::with_payload(
            Message { command: wire::CNXN, arg0: protocol_version, arg1: wire::MAX_PAYLOAD as u32, ..Default::default() },
            b"host::\0",
        ));
        wire::encode(&mut handshake);
        let _ = to_device.send(handshake);

        let reader_loop = to_loop.clone();
        let reader_waker = Arc::clone(&waker);
        let reader_id = id;
        let reader_pool = Arc::clone(&pool);
        let reader_handle = thread::spawn(move || {
            loop {
                let mut header = [0u8; wire::HEADER_SIZE];
                if let Err(e) = reader.read_exact(&mut header) {
                    debug!(transport = reader_id, error = %e, "reader thread stopping");
                    break;
                }
                let msg = Message::from_le_bytes(&header);
                if msg.data_length as usize > wire::MAX_PAYLOAD {
                    warn!(transport = reader_id, len = msg.data_length, "oversized frame, dropping transport");
                    break;
                }
                let mut pkt = match reader_pool.lock().unwrap().acquire() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(transport = reader_id, capacity = e.capacity, "packet pool exhausted, dropping transport");
                        break;
                    }
                };
                pkt.msg = msg;
                if msg.data_length > 0 {
                    let mut payload = vec![0u8; msg.data_length as usize];
                    if let Err(e) = reader.read_exact(&mut payload) {
                        debug!(transport = reader_id, error = %e, "reader thread stopping mid-payload");
                        break;
                    }
                    pkt.payload.extend(payload.iter().copied());
                }
                if wire::validate_header(&pkt).is_err() || wire::validate_data(&pkt).is_err() {
                    warn!(transport = reader_id, "malformed frame, dropping transport");
                    break;
                }
                trace!(
                    transport = reader_id,
                    command = pkt.msg.command,
                    payload = ?pkt.payload.as_slice(),
                    "received frame"
                );
                if reader_loop.send(LoopEvent::Packet { transport_id: reader_id, packet: pkt }).is_err() {
                    break;
                }
                let _ = reader_waker.wake();
            }
            let _ = reader_loop.send(LoopEvent::ReaderDown { transport_id: reader_id });
            let _ = reader_waker.wake();
        });

        let writer_id = id;
        let writer_handle = thread::spawn(move || {
            while let Ok(pkt) = from_loop.recv() {
                trace!(
                    transport = writer_id,
                    command = pkt.msg.command,
                    payload = ?pkt.payload.as_slice(),
                    "sending frame"
                );
                let header = pkt.msg.to_le_bytes();
                if writer.write_all(&header).is_err() {
                    debug!(transport = writer_id, "writer thread stopping");
                    break;
                }
                let payload = &pkt.payload.as_slice()[..pkt.msg.data_length as usize];
                if !payload.is_empty() && writer.write_all(payload).is_err() {
                    debug!(transport = writer_id, "writer thread stopping mid-payload");
                    break;
                }
            }
        });

        Self {
            id,
            kind,
            serial,
            name: "unknown".to_string(),
            state: ConnectionState::WaitingForCnxn,
            req_count: AtomicU32::new(0),
            res_count: AtomicU32::new(0),
            to_device,
            kicker,
            reader_handle: Some(reader_handle),
            writer_handle: Some(writer_handle),
            pool,
        }
    }

    /// Queues `packet` for the writer thread. Never blocks the loop thread.
    pub fn send(&self, packet: Box<Packet>) -> Result<(), crossbeam_channel::SendError<Box<Packet>>> {
        self.to_device.send(packet)
    }

    /// Returns an inbound packet to the pool the reader thread draws from,
    /// once the loop thread is done routing it. Cheap and safe to call even
    /// after the transport has started shutting down.
    pub fn release_packet(&self, packet: Box<Packet>) {
        self.pool.lock().unwrap().release(packet);
    }

    pub fn inflight(&self) -> u32 {
        self.req_count.load(Ordering::Acquire).wrapping_sub(self.res_count.load(Ordering::Acquire))
    }

    /// Unblocks the reader/writer threads so they exit promptly, and marks
    /// the transport offline. Does not join — the loop thread keeps going
    /// and reaps `TCLS` only once `inflight()` drains to zero (single-owner
    /// destruction).
    pub fn kick(&mut self) {
        self.kicker.kick();
        self.state = ConnectionState::Offline;
    }

    pub fn join(&mut self) -> io::Result<()> {
        if let Some(h) = self.reader_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.writer_handle.take() {
            let _ = h.join();
        }
        Ok(())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.kicker.kick();
    }
}

/// Pulls the device name out of a `CNXN` banner payload of the form
/// `<mode>::<name>\0`, e.g. `device::dev0\0`. Returns `None` if the banner
/// doesn't carry a name segment.
pub fn parse_banner_name(banner: &str) -> Option<String> {
    let trimmed = banner.trim_end_matches('\0');
    let (_, name) = trimmed.split_once("::")?;
    if name.is_empty() { None } else { Some(name.to_string()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;
    use std::net::{TcpListener, TcpStream as StdTcpStream};
    use std::io::Write as _;

    use crate::endpoint::TcpEndpoint;

    #[test]
    fn reader_thread_forwards_validated_packet_to_loop() {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), mio::Token(0)).unwrap());
        let (tx, rx) = crossbeam_channel::unbounded();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || {
            let mut s = StdTcpStream::connect(addr).unwrap();
            let mut pkt = Packet::with_payload(Message { command: wire::CNXN, ..Default::default() }, b"host::\0");
            wire::encode(&mut pkt);
            s.write_all(&pkt.msg.to_le_bytes()).unwrap();
            s.write_all(pkt.payload.as_slice()).unwrap();
        });

        let (sock, _) = listener.accept().unwrap();
        let endpoint: Box<dyn DeviceEndpoint> = Box::new(TcpEndpoint::new(sock).unwrap());
        let mut transport = Transport::spawn(1, TransportKind::HostProxy, "test".into(), endpoint, tx, waker);

        let event = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        match event {
            LoopEvent::Packet { transport_id, packet } => {
                assert_eq!(transport_id, 1);
                assert_eq!(packet.msg.command, wire::CNXN);
            }
            LoopEvent::ReaderDown { .. } => panic!("unexpected reader shutdown"),
        }

        client.join().unwrap();
        transport.kick();
        transport.join().unwrap();
    }
}
