mod codec;
mod command;
mod error;
mod message;
mod packet;
mod pool;

pub use codec::{checksum, encode, validate_data, validate_header};
pub use command::{CNXN, CLSE, HEADER_SIZE, MAX_PAYLOAD, OKAY, OPEN, PROTOCOL_VERSION, STAT, TCLS, WRTE, command_name};
pub use error::{FramingError, PoolExhausted};
pub use message::Message;
pub use packet::Packet;
pub use pool::PacketPool;
