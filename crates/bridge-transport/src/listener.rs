use mio::net::TcpListener as MioTcpListener;
use mio::Token;

/// What a bound listening port is for. Grounded on the `alistener.type`
/// distinction in the original `sockets.c`; the qemu control port and
/// ordinary forwards differ only in the smart-socket service string they
/// hand to a newly accepted local socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerKind {
    /// The well-known control port smart-socket clients connect to.
    Control,
    /// `qemu_control` — reserved for the qemu-launched emulator's control
    /// channel.
    QemuControl,
    /// `forward:` / `killforward:` managed port, carrying the transport id
    /// it forwards to and the device-side service spec (e.g. `tcp:8080`).
    Forward { transport_id: u32, device_service: String },
}

/// A bound, listening TCP port registered with the event loop. Mirrors
/// `alistener` from the original source, minus USB enumeration (out of
/// scope here).
pub struct Listener {
    pub token: Token,
    pub listener: MioTcpListener,
    pub kind: ListenerKind,
}

impl Listener {
    pub fn new(token: Token, listener: MioTcpListener, kind: ListenerKind) -> Self {
        Self { token, listener, kind }
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }
}
