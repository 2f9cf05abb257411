use std::{
    io::{Read, Write},
    net::{Shutdown, TcpStream},
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
};

use crate::error::EndpointError;

/// Blocking read half of a device connection, driven from the per-transport
/// reader thread. Two real backends are expected in production (TCP
/// socket, USB bulk pipe); this crate ships the TCP one plus a loopback
/// double for tests, since USB enumeration is an external collaborator.
pub trait DeviceReader: Send {
    /// Blocks until `buf` is completely filled, EOF is hit, or the endpoint
    /// is kicked. Any short read is an error — there is no partial-read
    /// success case.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), EndpointError>;
}

/// Blocking write half of a device connection, driven from the
/// per-transport writer thread.
pub trait DeviceWriter: Send {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), EndpointError>;
}

/// Unblocks any in-flight read/write on a split endpoint. Kept separate
/// from the reader/writer halves so the loop thread can kick a transport
/// without owning either blocking half itself. Idempotent.
pub trait DeviceKicker: Send + Sync {
    fn kick(&self);
}

/// Full-duplex device connection capability. Implementors must be
/// splittable into independent reader/writer halves so the reader and
/// writer threads never contend on the same `&mut self`.
pub trait DeviceEndpoint: Send {
    #[allow(clippy::type_complexity)]
    fn split(self: Box<Self>) -> (Box<dyn DeviceReader>, Box<dyn DeviceWriter>, Arc<dyn DeviceKicker>);
}

struct KickFlag(AtomicBool);

impl KickFlag {
    fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self) -> bool {
        self.0.swap(true, Ordering::AcqRel)
    }
}

/// TCP-backed device endpoint, used for `connect:`/`emulator:`-originated
/// transports.
pub struct TcpEndpoint {
    stream: TcpStream,
}

impl TcpEndpoint {
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

struct TcpReadHalf {
    stream: TcpStream,
    flag: Arc<KickFlag>,
}

struct TcpWriteHalf {
    stream: TcpStream,
    flag: Arc<KickFlag>,
}

struct TcpKicker {
    stream: TcpStream,
    flag: Arc<KickFlag>,
}

impl DeviceReader for TcpReadHalf {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), EndpointError> {
        if self.flag.is_set() {
            return Err(EndpointError::Kicked);
        }
        match self.stream.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(EndpointError::Eof),
            Err(e) => {
                if self.flag.is_set() { Err(EndpointError::Kicked) } else { Err(EndpointError::Io(e)) }
            }
        }
    }
}

impl DeviceWriter for TcpWriteHalf {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), EndpointError> {
        if self.flag.is_set() {
            return Err(EndpointError::Kicked);
        }
        self.stream.write_all(buf).map_err(|e| {
            if self.flag.is_set() { EndpointError::Kicked } else { EndpointError::Io(e) }
        })
    }
}

impl DeviceKicker for TcpKicker {
    fn kick(&self) {
        if self.flag.set() {
            return;
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl DeviceEndpoint for TcpEndpoint {
    fn split(self: Box<Self>) -> (Box<dyn DeviceReader>, Box<dyn DeviceWriter>, Arc<dyn DeviceKicker>) {
        let flag = Arc::new(KickFlag(AtomicBool::new(false)));
        let read_stream = self.stream.try_clone().expect("tcp stream clone for read half");
        let kicker_stream = self.stream.try_clone().expect("tcp stream clone for kicker");
        let reader = TcpReadHalf { stream: read_stream, flag: Arc::clone(&flag) };
        let writer = TcpWriteHalf { stream: self.stream, flag: Arc::clone(&flag) };
        let kicker = TcpKicker { stream: kicker_stream, flag };
        (Box::new(reader), Box::new(writer), Arc::new(kicker))
    }
}
