use core::fmt;

/// Result type used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors reported by the hardware collaborators and the buffer-ring engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The DMA engine could not allocate the requested buffer memory.
    ResourceExhausted,
    /// No buffer is available right now. Never waited on.
    NotReady,
    /// A hardware API call failed with the given vendor status code.
    Hardware(u32),
    /// The controller reported a bus speed the device cannot run at.
    UnsupportedSpeed,
    /// Packet size or burst length does not match the negotiated speed.
    SpeedMismatch,
    /// A [`Config`](crate::Config) value is out of range.
    InvalidConfig(&'static str),
    /// No ring with the given identifier exists.
    UnknownRing,
    /// The data path is not active.
    NotActive,
}

impl Error {
    /// Whether the completion dispatcher may log this error and carry on.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NotReady | Error::Hardware(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ResourceExhausted => f.write_str("DMA buffer memory exhausted"),
            Error::NotReady => f.write_str("no buffer available"),
            Error::Hardware(code) => write!(f, "hardware call failed, status {}", code),
            Error::UnsupportedSpeed => f.write_str("unsupported USB speed"),
            Error::SpeedMismatch => f.write_str("endpoint parameters do not match USB speed"),
            Error::InvalidConfig(what) => write!(f, "invalid configuration: {}", what),
            Error::UnknownRing => f.write_str("unknown buffer ring"),
            Error::NotActive => f.write_str("data path not active"),
        }
    }
}
