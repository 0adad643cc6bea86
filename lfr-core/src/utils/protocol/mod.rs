//! 3pi serial slave protocol.
//!
//! - `codec`: opcode catalogue and fixed-width payload encoding
//! - `client`: strictly request/reply exchanges over a [`ByteStream`]
//!
//! [`ByteStream`]: crate::utils::serial::ByteStream

pub mod client;
pub mod codec;

use core::fmt;

pub use client::{ExchangeState, ProtocolClient};
pub use codec::{BatteryVoltage, MotorCommand, Opcode, SensorFrame, Side, Signature};

/// Why a reply that did arrive was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedKind {
    /// Fewer bytes could be read than the poller reported.
    Short,
    /// The signature contained non-ASCII bytes.
    NotAscii,
}

/// A request that cannot be put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidCommand {
    TextTooLong { len: usize },
    NotAscii,
}

/// Errors from a protocol exchange. `E` is the stream's error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError<E> {
    /// The reply did not arrive within the operation's budget.
    Timeout { opcode: Opcode },
    /// A reply arrived but violates the fixed-length or content contract.
    MalformedReply { opcode: Opcode, kind: MalformedKind },
    InvalidCommand(InvalidCommand),
    /// Auto-calibration answered with a failure status (high bit set).
    CalibrationFailed { status: u8 },
    Io(E),
}

impl<E> ProtocolError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::Timeout { .. })
    }
}

impl<E> From<InvalidCommand> for ProtocolError<E> {
    fn from(err: InvalidCommand) -> Self {
        ProtocolError::InvalidCommand(err)
    }
}

impl<E: fmt::Debug> fmt::Display for ProtocolError<E> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            ProtocolError::Timeout { opcode } => write!(f, "no reply to {opcode:?} in time"),
            ProtocolError::MalformedReply { opcode, kind } => {
                write!(f, "malformed reply to {opcode:?}: {kind:?}")
            }
            ProtocolError::InvalidCommand(err) => write!(f, "invalid command: {err:?}"),
            ProtocolError::CalibrationFailed { status } => {
                write!(f, "auto-calibration failed with status {status:#04x}")
            }
            ProtocolError::Io(err) => write!(f, "serial i/o error: {err:?}"),
        }
    }
}

impl<E: fmt::Debug> core::error::Error for ProtocolError<E> {}
