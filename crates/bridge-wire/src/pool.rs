use crate::{error::PoolExhausted, packet::Packet};

/// Fixed-capacity free-list of boxed packet buffers.
///
/// A real device transport needs at most a handful of in-flight packets at
/// once (one being read, a few queued for the loop thread), so the pool is
/// small and bounded; exhaustion is treated as fatal to whichever caller
/// hit it, never silently falling back to an unbounded allocation.
pub struct PacketPool {
    free: Vec<Box<Packet>>,
    capacity: usize,
}

impl PacketPool {
    pub fn new(capacity: usize) -> Self {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(Box::new(Packet::new()));
        }
        Self { free, capacity }
    }

    /// Takes a packet out of the pool, resetting it to a blank state.
    pub fn acquire(&mut self) -> Result<Box<Packet>, PoolExhausted> {
        match self.free.pop() {
            Some(mut p) => {
                *p = Packet::new();
                Ok(p)
            }
            None => Err(PoolExhausted { capacity: self.capacity }),
        }
    }

    /// Returns a packet to the pool once it's been fully consumed.
    pub fn release(&mut self, packet: Box<Packet>) {
        if self.free.len() < self.capacity {
            self.free.push(packet);
        }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_until_exhausted() {
        let mut pool = PacketPool::new(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_err());
        pool.release(a);
        assert_eq!(pool.available(), 1);
        let _ = pool.acquire().unwrap();
        pool.release(b);
    }

    #[test]
    fn acquired_packet_is_blank() {
        let mut pool = PacketPool::new(1);
        let mut p = pool.acquire().unwrap();
        p.msg.command = 42;
        p.payload.push(1);
        pool.release(p);

        let p2 = pool.acquire().unwrap();
        assert_eq!(p2.msg.command, 0);
        assert!(p2.payload.is_empty());
    }
}
