/// Maximum payload carried by one frame. Fixed by the wire format, not
/// negotiable by either side.
pub const MAX_PAYLOAD: usize = 4096;

/// Protocol version this host speaks in its initial `CNXN`.
pub const PROTOCOL_VERSION: u32 = 0x0100_0000;

/// 24-byte on-wire message header.
pub const HEADER_SIZE: usize = 24;

macro_rules! command_tags {
    ($($name:ident = $tag:expr;)+) => {
        $(pub const $name: u32 = u32::from_le_bytes(*$tag);)+

        /// Returns the 4-ASCII-character name for a known command tag, for
        /// logging. Unknown tags format as their raw hex value.
        pub fn command_name(cmd: u32) -> &'static str {
            match cmd {
                $($name => stringify!($name),)+
                _ => "UNKNOWN",
            }
        }
    };
}

command_tags! {
    CNXN = b"CNXN";
    OPEN = b"OPEN";
    OKAY = b"OKAY";
    CLSE = b"CLSE";
    WRTE = b"WRTE";
    STAT = b"STAT";
    /// Internal host-only tag: the reader thread posts this to the loop
    /// thread to signal that it has exited and drained all outstanding
    /// frames. Never appears on the wire.
    TCLS = b"TCLS";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_tags_round_trip_to_ascii() {
        assert_eq!(&CNXN.to_le_bytes(), b"CNXN");
        assert_eq!(&OPEN.to_le_bytes(), b"OPEN");
        assert_eq!(&OKAY.to_le_bytes(), b"OKAY");
        assert_eq!(&CLSE.to_le_bytes(), b"CLSE");
        assert_eq!(&WRTE.to_le_bytes(), b"WRTE");
        assert_eq!(&STAT.to_le_bytes(), b"STAT");
    }

    #[test]
    fn names_known_and_unknown() {
        assert_eq!(command_name(CNXN), "CNXN");
        assert_eq!(command_name(0), "UNKNOWN");
    }
}
