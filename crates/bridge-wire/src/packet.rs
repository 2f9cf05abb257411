use bridge_utils::ArrayVec;

use crate::{command::MAX_PAYLOAD, message::Message};

/// One on-wire frame: a header plus up to [`MAX_PAYLOAD`] bytes of payload.
///
/// `cursor` tracks how much of `payload` has been consumed (inbound, by a
/// local socket draining it to an fd) or written out (outbound, by a
/// transport writing it to the device endpoint). It only has meaning while
/// the packet is mid-flight through one of those paths; freshly decoded or
/// freshly encoded packets start with `cursor == 0`.
#[derive(Debug, Clone)]
pub struct Packet {
    pub msg: Message,
    pub payload: ArrayVec<u8, MAX_PAYLOAD>,
    pub cursor: usize,
}

impl Packet {
    pub fn new() -> Self {
        Self { msg: Message::default(), payload: ArrayVec::new(), cursor: 0 }
    }

    pub fn with_payload(msg: Message, data: &[u8]) -> Self {
        let mut payload = ArrayVec::new();
        payload.extend(data.iter().copied());
        Self { msg, payload, cursor: 0 }
    }

    /// Bytes of `payload` not yet consumed/written.
    pub fn remaining(&self) -> &[u8] {
        &self.payload.as_slice()[self.cursor.min(self.payload.len())..]
    }

    pub fn advance(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.payload.len());
    }

    pub fn is_drained(&self) -> bool {
        self.cursor >= self.payload.len()
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_tracks_remaining() {
        let mut p = Packet::with_payload(Message::default(), b"hello world");
        assert_eq!(p.remaining(), b"hello world");
        p.advance(6);
        assert_eq!(p.remaining(), b"world");
        assert!(!p.is_drained());
        p.advance(5);
        assert!(p.is_drained());
        assert_eq!(p.remaining(), b"");
    }

    #[test]
    fn advance_saturates_at_len() {
        let mut p = Packet::with_payload(Message::default(), b"ab");
        p.advance(100);
        assert!(p.is_drained());
    }
}
