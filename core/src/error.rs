/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the raw byte stream, after local retries were exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Write failed after {attempts} attempts")]
    WriteFailed { attempts: u32 },
    #[error("Read timed out, got {got} of {expected} bytes")]
    ReadTimeout { expected: usize, got: usize },
    #[error("Transport buffer overflow")]
    Overflow,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The firmware answered an operation with a non-zero status token.
    #[error("{op} was not acknowledged (status 0x{status:04X})")]
    Nack { op: &'static str, status: u16 },
    #[error("Unexpected response, expected {expected:02X?}, got {got:02X?}")]
    UnexpectedResponse { expected: Vec<u8>, got: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExploitFailure {
    #[error("Payload of 0x{len:X} bytes was rejected (status 0x{status:04X})")]
    PayloadTooLarge { len: usize, status: u16 },
    #[error("No device-family constant in 0x{start:02X}..=0xFF was accepted, re-seat the device")]
    ConstantNotFound { start: u8 },
    #[error("Verification read returned 0x{got:X} of 0x{expected:X} bytes")]
    VerificationFailed { expected: usize, got: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoEngineFault {
    #[error("Crypto engine reported an error for opcode 0x{opcode:02X}")]
    OperationFailed { opcode: u8 },
    #[error("Crypto engine did not complete within {waited_ms} ms ({what})")]
    Timeout { what: &'static str, waited_ms: u128 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyDerivationUnavailable {
    #[error("Chip profile 0x{hw_code:04X} has no `{field}`")]
    MissingProfileField { hw_code: u16, field: &'static str },
    #[error("No hardware path for {what}")]
    NoHardwarePath { what: String },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Exploit failed: {0}")]
    Exploit(#[from] ExploitFailure),
    #[error("Crypto engine fault: {0}")]
    Crypto(#[from] CryptoEngineFault),
    #[error("Key derivation unavailable: {0}")]
    KeyDerivation(#[from] KeyDerivationUnavailable),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Umbra error: {0}")]
    Umbra(String),
}

impl Error {
    pub fn io(msg: impl Into<String>) -> Self {
        Error::Io(msg.into())
    }

    pub fn conn(msg: impl Into<String>) -> Self {
        Error::Connection(msg.into())
    }

    pub fn umbra(msg: impl Into<String>) -> Self {
        Error::Umbra(msg.into())
    }

    pub fn nack(op: &'static str, status: u16) -> Self {
        Error::Protocol(ProtocolError::Nack { op, status })
    }

    /// Whether the error leaves the device in an unknown state.
    /// Fatal errors close the session; everything else only skips the current operation.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Transport(_) | Error::Io(_) | Error::Connection(_) | Error::Cancelled => true,
            Error::Crypto(CryptoEngineFault::Timeout { .. }) => true,
            Error::Exploit(ExploitFailure::ConstantNotFound { .. }) => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => {
                Error::Transport(TransportError::ReadTimeout { expected: 0, got: 0 })
            }
            _ => Error::Io(err.to_string()),
        }
    }
}

#[cfg(feature = "nusb")]
impl From<nusb::Error> for Error {
    fn from(err: nusb::Error) -> Self {
        Error::Io(format!("USB error: {}", err))
    }
}

#[cfg(feature = "serial")]
impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Error::Io(format!("Serial error: {}", err))
    }
}
