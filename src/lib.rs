//! Async HTTP/1.1 client with connection pooling and pipelining.
//!
//! The protocol layers are sans-IO: they move bytes between buffers and leave
//! the reading and writing to the connection tasks.
//!
//! * [`Client`] runs requests to completion, following redirects and
//!   applying the overall timeout.
//! * A pool shares connections per host. Connections that are known to
//!   handle it get several requests pipelined at once.
//! * Each connection is a task that writes requests and parses the responses
//!   in order.
//!
//! # Errors
//!
//! [`Error`] is `Clone`. When a connection fails, every request waiting on it
//! gets the same error.
//!
//! # Features
//!
//! * `tls` connect to `https` uris using rustls with the webpki roots.

#![forbid(unsafe_code)]
#![deny(missing_debug_implementations)]

#[macro_use]
extern crate log;

// Re-export this
pub use bytes::Bytes;
pub use http;

mod util;

mod error;
pub use error::{Awaiting, Error};

mod ext;

mod chunk;

mod body;

mod parser;

mod request;
pub use request::{Body, RequestHead};

mod response;
pub use response::Response;

mod timer;

mod connect;
pub use connect::{BoxStream, ByteStream, Connect, ConnectFuture, Target, TcpConnector};

mod decode;
pub use decode::{ContentDecoder, DecoderFactory};

mod conn;

mod pool;

pub mod client;
pub use client::{BodySink, Callbacks, Client, Config, Hooks, OnHeader, OnRedirect, RequestOptions};
