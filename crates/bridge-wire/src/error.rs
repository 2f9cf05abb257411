use thiserror::Error;

/// Framing failures. Every variant is a reason to close the transport that
/// produced the offending frame; none of them are fatal to the process.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    #[error("bad magic: command {command:#x} magic {magic:#x}")]
    BadMagic { command: u32, magic: u32 },
    #[error("payload length {len} exceeds max payload {max}")]
    LengthOverflow { len: u32, max: u32 },
    #[error("checksum mismatch: expected {expected:#x} got {got:#x}")]
    BadChecksum { expected: u32, got: u32 },
}

/// Packet pool exhaustion. Fatal only to the transport attempting the
/// allocation, never to the process.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("packet pool exhausted (capacity {capacity})")]
pub struct PoolExhausted {
    pub capacity: usize,
}
