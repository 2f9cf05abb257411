use std::collections::VecDeque;
use std::io::{self, Read, Write};

use bridge_wire::Packet;
use mio::net::TcpStream;
use mio::Token;

/// Status bits tracked per local socket. Kept as a plain `u8` bitset rather
/// than an enum set — only four flags exist and none of them are mutually
/// exclusive, matching the original `asocket.flags` field.
pub mod status {
    pub const NOTIFY_PENDING: u8 = 1 << 0;
    pub const DEVICE_TRACKER: u8 = 1 << 1;
    pub const REMOTE_BOUND: u8 = 1 << 2;
    pub const QEMU_CONTROL: u8 = 1 << 3;
}

/// One end of a logical socket multiplexed over a transport: a byte stream
/// bound to an accepted client fd, paired by id with the peer half living on
/// the device side of a `Transport`. Grounded on `asocket` in the original
/// `sockets.c` and on the connection bookkeeping in
/// `flux_network::tcp::stream::TcpStream`.
pub struct LocalSocket {
    pub local_id: u32,
    pub remote_id: u32,
    pub token: Token,
    pub stream: TcpStream,
    /// Transport this socket is multiplexed over; `None` for host-scope
    /// sockets (e.g. a `track-devices` connection) that never pair with a
    /// device-side peer.
    pub transport_id: Option<u32>,
    pub flags: u8,
    /// Packets waiting to be written back out to the client fd.
    pub pkt_list: VecDeque<Box<Packet>>,
    /// Set once a `CLSE` has been seen or the client fd has gone away; the
    /// socket is destroyed only after `pkt_list` drains, not immediately.
    pub closing: bool,
}

impl LocalSocket {
    pub fn new(local_id: u32, token: Token, stream: TcpStream) -> Self {
        Self {
            local_id,
            remote_id: 0,
            token,
            stream,
            transport_id: None,
            flags: 0,
            pkt_list: VecDeque::new(),
            closing: false,
        }
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u8) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u8) {
        self.flags &= !flag;
    }

    pub fn enqueue(&mut self, pkt: Box<Packet>) {
        self.pkt_list.push_back(pkt);
    }

    pub fn is_drained(&self) -> bool {
        self.pkt_list.is_empty()
    }

    /// Pushes as much of the head-of-line packet to the client fd as the
    /// socket will currently accept, advancing its cursor. Returns `true`
    /// once the head packet has been fully written and popped.
    pub fn flush_one(&mut self) -> io::Result<bool> {
        let Some(pkt) = self.pkt_list.front_mut() else {
            return Ok(true);
        };
        if pkt.is_drained() {
            self.pkt_list.pop_front();
            return Ok(true);
        }
        let chunk_len = pkt.remaining().len();
        let cursor = pkt.cursor;
        match self.stream.write(&pkt.payload.as_slice()[cursor..cursor + chunk_len]) {
            Ok(0) => Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                pkt.advance(n);
                if pkt.is_drained() {
                    self.pkt_list.pop_front();
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Reads available client-fd bytes into `buf`, mirroring a nonblocking
    /// `read`. Returns `Ok(0)` on EOF exactly like `Read::read`.
    pub fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_wire::Message;
    use std::net::TcpListener as StdListener;

    fn make_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client)
    }

    #[test]
    fn flags_set_clear_roundtrip() {
        let (stream, _client) = make_pair();
        let mut sock = LocalSocket::new(1, Token(5), stream);
        assert!(!sock.has_flag(status::DEVICE_TRACKER));
        sock.set_flag(status::DEVICE_TRACKER);
        assert!(sock.has_flag(status::DEVICE_TRACKER));
        sock.clear_flag(status::DEVICE_TRACKER);
        assert!(!sock.has_flag(status::DEVICE_TRACKER));
    }

    #[test]
    fn flush_one_drains_small_packet() {
        let (stream, mut client) = make_pair();
        let mut sock = LocalSocket::new(1, Token(5), stream);
        let pkt = Box::new(Packet::with_payload(Message::default(), b"hi"));
        sock.enqueue(pkt);
        assert!(!sock.is_drained());
        let done = sock.flush_one().unwrap();
        assert!(done);
        assert!(sock.is_drained());
        let mut buf = [0u8; 2];
        use std::io::Read as _;
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }
}
