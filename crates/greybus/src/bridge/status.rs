//! Transfer completion status.

use std::fmt;

/// How a transfer finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Completed,
    /// Device sent more data than the buffer holds.
    Overflow,
    /// Link reset underneath the transfer.
    Reset,
    /// Transfer was killed by the host side (teardown).
    Cancelled,
    /// Host controller is shutting down.
    Shutdown,
    /// Bit-stuffing or CRC error.
    BitStuff,
    /// Low-level protocol error.
    Protocol,
    /// Any other host error code.
    Other(i32),
}

/// What to do with a channel after a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Ok,
    /// Drop this transfer's data and keep the channel posted.
    Transient,
    /// The device is gone; stop resubmitting.
    Terminal,
}

impl TransferStatus {
    pub fn class(self) -> StatusClass {
        match self {
            Self::Completed => StatusClass::Ok,
            Self::Overflow
            | Self::Reset
            | Self::Cancelled
            | Self::Shutdown
            | Self::BitStuff
            | Self::Protocol => StatusClass::Terminal,
            Self::Other(code) => {
                tracing::warn!(code, "Unknown transfer status, treating as transient");
                StatusClass::Transient
            }
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Completed
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Overflow => f.write_str("overflow"),
            Self::Reset => f.write_str("connection reset"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Shutdown => f.write_str("shutdown"),
            Self::BitStuff => f.write_str("bit-stuffing error"),
            Self::Protocol => f.write_str("protocol error"),
            Self::Other(code) => write!(f, "error {code}"),
        }
    }
}
