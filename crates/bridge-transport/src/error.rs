use thiserror::Error;

/// I/O failures on a device endpoint (USB pipe or TCP socket). Any of these
/// closes the transport that owns the endpoint; none are fatal to the
/// daemon.
#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("device endpoint io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("device endpoint closed (eof)")]
    Eof,
    #[error("device endpoint kicked")]
    Kicked,
}

/// Transport-selection failures, surfaced to a smart-socket client as a
/// `FAIL` reply with one of these exact messages (ported verbatim from the
/// original `sdb_messages.c` strings).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionError {
    #[error("more than one target found. Specify the target with -s option.")]
    MoreThanOneTarget,
    #[error("more than one device found. Specify the device with -d option.")]
    MoreThanOneDevice,
    #[error("more than one emulator found. Specify the emulator with -e option.")]
    MoreThanOneEmulator,
    #[error("target not found")]
    TargetNotFound,
    #[error("device offline (x)")]
    TargetOffline,
    #[error("device locked")]
    TargetLocked,
}

impl SelectionError {
    pub fn as_wire_str(self) -> &'static str {
        match self {
            SelectionError::MoreThanOneTarget => {
                "more than one target found. Specify the target with -s option."
            }
            SelectionError::MoreThanOneDevice => {
                "more than one device found. Specify the device with -d option."
            }
            SelectionError::MoreThanOneEmulator => {
                "more than one emulator found. Specify the emulator with -e option."
            }
            SelectionError::TargetNotFound => "target not found",
            SelectionError::TargetOffline => "device offline (x)",
            SelectionError::TargetLocked => "device locked",
        }
    }
}

/// Smart-socket request-handling failures that don't fit the selection
/// family above.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unknown host service")]
    UnknownService,
    #[error("{0}")]
    Message(String),
}
