mod arrayvec;
mod assert;
mod hex;
mod open_map;

pub use arrayvec::{ArrayStr, ArrayVec};
pub use hex::{decode_hex_prefix, encode_len_prefix4};
pub use open_map::OpenMap;
