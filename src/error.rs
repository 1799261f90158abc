use std::fmt;
use std::io;
use std::sync::Arc;

use http::{Method, Version};
use thiserror::Error;

use crate::Response;

/// Error type for h1line
///
/// The type is `Clone` since one failing connection fails every request
/// queued on it with the same error.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum Error {
    #[error("bad header: {0}")]
    BadHeader(String),

    #[error("invalid uri: {0}")]
    InvalidUri(String),

    #[error("unsupported http version")]
    UnsupportedVersion,

    #[error("{0} not valid for HTTP version {1:?}")]
    MethodVersionMismatch(Method, Version),

    #[error("more than one host header")]
    TooManyHostHeaders,

    #[error("more than one content-length header")]
    TooManyContentLengthHeaders,

    #[error("content-length header not a number")]
    BadContentLengthHeader,

    #[error("method forbids body: {0}")]
    MethodForbidsBody(Method),

    #[error("chunk length is not ascii")]
    ChunkLenNotAscii,

    #[error("chunk length cannot be read as a number")]
    ChunkLenNotANumber,

    #[error("chunk expected crlf as next character")]
    ChunkExpectedCrLf,

    #[error("attempt to write larger body than content-length")]
    BodyLargerThanContentLength,

    #[error("body ended before content-length was reached")]
    BodyShorterThanContentLength,

    #[error("http parse fail: {0}")]
    HttpParseFail(String),

    #[error("http parse resulted in too many headers")]
    HttpParseTooManyHeaders,

    #[error("Connection closed while awaiting {0}")]
    ClosedWhile(Awaiting),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out")]
    Timeout,

    #[error("Stalled while {0}")]
    Stalled(&'static str),

    #[error("Cancelled")]
    Cancelled,

    #[error("missing a location header")]
    NoLocationHeader,

    #[error("Unrecognised Location: {0}")]
    UnrecognisedLocation(String),

    #[error("location header is malformed: {0}")]
    BadLocationHeader(String),

    #[error("not resolvable: {0}")]
    NotResolvable(String),

    #[error("not contactable: {0}")]
    NotContactable(String),

    #[error("tls: {0}")]
    Tls(String),

    #[error("decode: {0}")]
    Decode(String),

    #[error("io: {0}")]
    Io(Arc<io::Error>),

    #[error("{} {}", .0.status.as_u16(), .0.reason)]
    Status(Box<Response>),
}

impl Error {
    /// The response this error was derived from, if any.
    ///
    /// Only set for `fail_on_error` failures.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Error::Status(r) => Some(r),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}

impl From<httparse::Error> for Error {
    fn from(value: httparse::Error) -> Self {
        match value {
            httparse::Error::TooManyHeaders => Error::HttpParseTooManyHeaders,
            e => Error::HttpParseFail(e.to_string()),
        }
    }
}

impl From<http::Error> for Error {
    fn from(value: http::Error) -> Self {
        Error::BadHeader(value.to_string())
    }
}

/// What the connection was waiting for when the peer closed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Awaiting {
    Header,
    Body,
    Chunk,
    ChunkTrailer,
}

impl fmt::Display for Awaiting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Awaiting::Header => write!(f, "header"),
            Awaiting::Body => write!(f, "body"),
            Awaiting::Chunk => write!(f, "chunk"),
            Awaiting::ChunkTrailer => write!(f, "chunk trailer"),
        }
    }
}
