use std::{fmt, io};

use quinn::{ConnectError, ConnectionError, ReadExactError, WriteError};

/// Transport and codec failures.
#[derive(Debug)]
pub enum Error {
    ConnectError(ConnectError),
    ConnectionError(ConnectionError),
    Io(io::Error),
    WriteError(WriteError),
    ReadExactError(ReadExactError),
    Tls(rustls::Error),
    Certificate(rcgen::RcgenError),
    /// A peer announced a frame larger than [`super::wire::MAX_FRAME_LEN`].
    FrameTooLarge(u32),
    CouldNotEncodeMessage,
    CouldNotDecodeMessage,
    /// The peer answered with a response that doesn't belong to the request.
    UnexpectedResponse,
    /// The peer understood the request but refused it.
    Rejected(String),
    TimedOut,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConnectError(e) => write!(f, "could not connect: {e}"),
            Error::ConnectionError(e) => write!(f, "connection failed: {e}"),
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::WriteError(e) => write!(f, "could not write to stream: {e}"),
            Error::ReadExactError(e) => {
                write!(f, "could not read from stream: {e}")
            }
            Error::Tls(e) => write!(f, "tls configuration: {e}"),
            Error::Certificate(e) => write!(f, "certificate generation: {e}"),
            Error::FrameTooLarge(len) => {
                write!(f, "peer sent a {len} byte frame, which is over the limit")
            }
            Error::CouldNotEncodeMessage => write!(f, "could not encode message"),
            Error::CouldNotDecodeMessage => write!(f, "could not decode message"),
            Error::UnexpectedResponse => {
                write!(f, "peer answered with an unexpected response")
            }
            Error::Rejected(reason) => write!(f, "peer rejected the request: {reason}"),
            Error::TimedOut => write!(f, "timed out"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ConnectError> for Error {
    fn from(error: ConnectError) -> Self {
        Self::ConnectError(error)
    }
}

impl From<ConnectionError> for Error {
    fn from(error: ConnectionError) -> Self {
        Self::ConnectionError(error)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<WriteError> for Error {
    fn from(e: WriteError) -> Self {
        Self::WriteError(e)
    }
}

impl From<ReadExactError> for Error {
    fn from(e: ReadExactError) -> Self {
        Self::ReadExactError(e)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e)
    }
}

impl From<rcgen::RcgenError> for Error {
    fn from(e: rcgen::RcgenError) -> Self {
        Self::Certificate(e)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::TimedOut
    }
}
