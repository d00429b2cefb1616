use std::io;
use std::net;
use std::num::ParseIntError;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("unexpected end of packet")]
    ErrUnexpectedEof,
    #[error("relay frame magic mismatch")]
    ErrInvalidMagic,
    #[error("relay frame length exceeds limit")]
    ErrOversizedFrame,
    #[error("candidate count out of range")]
    ErrCandidateCountOutOfRange,
    #[error("unknown candidate kind")]
    ErrUnknownCandidateKind,
    #[error("IPv6 endpoints are not supported")]
    ErrIpv6NotSupported,
    #[error("rendezvous: pair table is full")]
    ErrPairTableFull,
    #[error("rendezvous: pair already registered for this key")]
    ErrDuplicatePairKey,
    #[error("rendezvous: client table is full")]
    ErrClientTableFull,
    #[error("rendezvous: main port must not be 0")]
    ErrPortZero,
    #[error("rendezvous: probe port must differ from the main port")]
    ErrProbePortConflict,
    #[error("rendezvous: server already closed")]
    ErrClosed,
    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("parse addr: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}
