/// Errors produced by the protocol, the session and the transports.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A request was built with a payload that does not fit the frame.
    #[error("invalid payload for command {command:#04X}: {length} bytes")]
    InvalidPayload { command: u8, length: usize },
    /// Too short, wrong start byte or an implausible length or field value.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("checksum mismatch - calculated={calculated:#04X} received={received:#04X}")]
    ChecksumMismatch { calculated: u8, received: u8 },
    #[error("unknown command {0:#04X}")]
    UnknownCommand(u8),
    #[error("no response within {0:?}")]
    Timeout(std::time::Duration),
    #[error("link to the device was lost")]
    LinkLost,
    /// Cell count dependent commands need a decoded status first.
    #[error("status has to be read at least once before this command")]
    StatusRequired,
    #[error("invalid device address '{0}'")]
    InvalidAddress(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    /// An error reported by the underlying BLE stack.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Transport(Box::new(err))
    }

    /// Errors that only spoil a single exchange and leave the link usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MalformedFrame(_)
                | Error::ChecksumMismatch { .. }
                | Error::UnknownCommand(_)
                | Error::Timeout(_)
                | Error::StatusRequired
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
