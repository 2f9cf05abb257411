use std::io;
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token, Waker};

/// Reserved token handed to `mio::Waker` registrations. Real fds start
/// allocating from `FIRST_DYNAMIC_TOKEN` so they never collide with it.
pub const WAKE_TOKEN: Token = Token(0);
const FIRST_DYNAMIC_TOKEN: usize = 1;

/// Thin wrapper around a single `mio::Poll` plus its waker, grounded on
/// `flux_network::tcp::connector::TcpConnector`'s reactor loop. Token
/// allocation and the fd-to-callback lookup live one layer up (in
/// `Engine`'s `OpenMap`); this type only owns the OS-level primitives.
pub struct EventCore {
    poll: Poll,
    waker: Arc<Waker>,
    next_token: usize,
}

impl EventCore {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self { poll, waker, next_token: FIRST_DYNAMIC_TOKEN })
    }

    /// Handle usable by other threads to interrupt a blocked `poll` call —
    /// the loop thread's side of the reader-thread-to-loop-thread channel.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    pub fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn register(
        &self,
        source: &mut dyn mio::event::Source,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interests)
    }

    pub fn reregister(
        &self,
        source: &mut dyn mio::event::Source,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interests)
    }

    pub fn deregister(&self, source: &mut dyn mio::event::Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Blocks until at least one event is ready or `timeout` elapses, then
    /// invokes `handler` for each event. `timeout: None` blocks forever
    /// (until woken or a real fd fires).
    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(events, timeout)
    }
}
