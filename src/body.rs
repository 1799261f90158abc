use std::fmt;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method};

use crate::chunk::{ChunkEvent, Dechunker};
use crate::error::Awaiting;
use crate::util::{compare_lowercase_ascii, tokens};
use crate::Error;

const DEFAULT_CHUNK_SIZE: usize = 10 * 1024;

/// How a request body is framed on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum BodyWriter {
    #[default]
    None,
    /// Delimited by content-length. The value is what's left to send.
    Sized(u64),
    Chunked,
}

impl BodyWriter {
    pub fn has_body(&self) -> bool {
        matches!(self, BodyWriter::Sized(_) | BodyWriter::Chunked)
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self, Self::Chunked)
    }

    pub fn write(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
        if input.is_empty() {
            return Ok(());
        }

        match self {
            BodyWriter::None => return Err(Error::BodyLargerThanContentLength),
            BodyWriter::Sized(left) => {
                if input.len() as u64 > *left {
                    return Err(Error::BodyLargerThanContentLength);
                }
                out.extend_from_slice(input);
                *left -= input.len() as u64;
            }
            BodyWriter::Chunked => {
                // Large inputs are split over several chunks.
                for chunk in input.chunks(DEFAULT_CHUNK_SIZE) {
                    out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
                    out.extend_from_slice(chunk);
                    out.extend_from_slice(b"\r\n");
                }
            }
        }

        Ok(())
    }

    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), Error> {
        match self {
            BodyWriter::Sized(left) if *left > 0 => Err(Error::BodyShorterThanContentLength),
            BodyWriter::Chunked => {
                out.extend_from_slice(b"0\r\n\r\n");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BodyEvent {
    Data(Bytes),
    NeedMore,
    Ended,
}

/// How a response body is framed on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyReader {
    /// No body is expected either due to the status or method.
    NoBody,
    /// Delimited by content-length.
    /// The value is what's left to receive.
    LengthDelimited(u64),
    /// Chunked transfer encoding
    Chunked(Dechunker),
    /// Expect remote to close at end of body.
    CloseDelimited,
}

impl BodyReader {
    pub fn for_response(
        method: &Method,
        status_code: u16,
        headers: &HeaderMap,
    ) -> Result<Self, Error> {
        let is_success = (200..=299).contains(&status_code);
        let is_informational = (100..=199).contains(&status_code);

        let has_no_body =
            // https://datatracker.ietf.org/doc/html/rfc2616#section-4.3
            // All responses to the HEAD request method
            // MUST NOT include a message-body, even though the presence of entity-
            // header fields might lead one to believe they do.
            method == Method::HEAD ||
            // A client MUST ignore any Content-Length or Transfer-Encoding
            // header fields received in a successful response to CONNECT.
            is_success && method == Method::CONNECT ||
            // All 1xx (informational), 204 (no content), and 304 (not modified) responses
            // MUST NOT include a message-body.
            is_informational ||
            matches!(status_code, 204 | 304);

        if has_no_body {
            return Ok(Self::NoBody);
        }

        Self::header_defined(headers)
    }

    fn header_defined(headers: &HeaderMap) -> Result<Self, Error> {
        let chunked = headers
            .get_all("transfer-encoding")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(tokens)
            .any(|v| compare_lowercase_ascii(v, "chunked"));

        if chunked {
            // https://datatracker.ietf.org/doc/html/rfc2616#section-4.4
            // Messages MUST NOT include both a Content-Length header field and a
            // non-identity transfer-coding. If the message does include a non-
            // identity transfer-coding, the Content-Length MUST be ignored.
            return Ok(Self::Chunked(Dechunker::new()));
        }

        let mut content_length: Option<u64> = None;

        for value in headers.get_all("content-length") {
            let v = value
                .to_str()
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or(Error::BadContentLengthHeader)?;

            // Repeated identical values are tolerated.
            if content_length.is_some_and(|c| c != v) {
                return Err(Error::TooManyContentLengthHeaders);
            }
            content_length = Some(v);
        }

        if let Some(len) = content_length {
            return Ok(Self::LengthDelimited(len));
        }

        Ok(Self::CloseDelimited)
    }

    /// Read the next piece of body.
    ///
    /// `closed` tells that no more input will ever arrive.
    pub fn read(&mut self, input: &mut BytesMut, closed: bool) -> Result<BodyEvent, Error> {
        match self {
            BodyReader::NoBody => Ok(BodyEvent::Ended),

            BodyReader::LengthDelimited(left) => {
                if *left == 0 {
                    return Ok(BodyEvent::Ended);
                }

                if input.is_empty() {
                    return if closed {
                        Err(Error::ClosedWhile(Awaiting::Body))
                    } else {
                        Ok(BodyEvent::NeedMore)
                    };
                }

                // Anything past the content-length belongs to the next response.
                let left_usize = (*left).min(usize::MAX as u64) as usize;
                let to_read = input.len().min(left_usize);

                *left -= to_read as u64;

                Ok(BodyEvent::Data(input.split_to(to_read).freeze()))
            }

            BodyReader::Chunked(dechunker) => match dechunker.poll(input)? {
                ChunkEvent::Data(v) => Ok(BodyEvent::Data(v)),
                ChunkEvent::Ended => Ok(BodyEvent::Ended),
                ChunkEvent::NeedMore if closed => Err(Error::ClosedWhile(dechunker.awaiting())),
                ChunkEvent::NeedMore => Ok(BodyEvent::NeedMore),
            },

            BodyReader::CloseDelimited => {
                if !input.is_empty() {
                    Ok(BodyEvent::Data(input.split().freeze()))
                } else if closed {
                    Ok(BodyEvent::Ended)
                } else {
                    Ok(BodyEvent::NeedMore)
                }
            }
        }
    }

    pub fn is_close_delimited(&self) -> bool {
        matches!(self, BodyReader::CloseDelimited)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NoBody => "no body",
            Self::LengthDelimited(_) => "length delimited",
            Self::Chunked(_) => "chunked",
            Self::CloseDelimited => "close delimited",
        }
    }
}

impl fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBody => write!(f, "NoBody"),
            Self::LengthDelimited(arg0) => f.debug_tuple("LengthDelimited").field(arg0).finish(),
            Self::Chunked(_) => write!(f, "Chunked"),
            Self::CloseDelimited => write!(f, "CloseDelimited"),
        }
    }
}

#[cfg(test)]
mod test {
    use http::HeaderValue;

    use super::*;

    fn headers(list: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in list {
            map.append(*k, HeaderValue::from_static(v));
        }
        map
    }

    fn read_all(reader: &mut BodyReader, input: &mut BytesMut, closed: bool) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            match reader.read(input, closed).unwrap() {
                BodyEvent::Data(v) => body.extend_from_slice(&v),
                BodyEvent::Ended | BodyEvent::NeedMore => break,
            }
        }
        body
    }

    #[test]
    fn framing_precedence() {
        let h = headers(&[("content-length", "5"), ("transfer-encoding", "chunked")]);
        let r = BodyReader::for_response(&Method::GET, 200, &h).unwrap();
        assert!(matches!(r, BodyReader::Chunked(_)));

        let h = headers(&[("content-length", "5")]);
        let r = BodyReader::for_response(&Method::GET, 200, &h).unwrap();
        assert_eq!(r, BodyReader::LengthDelimited(5));

        let r = BodyReader::for_response(&Method::GET, 200, &HeaderMap::new()).unwrap();
        assert!(r.is_close_delimited());
    }

    #[test]
    fn no_body_statuses() {
        let h = headers(&[("content-length", "5")]);
        for status in [100, 101, 204, 304] {
            let r = BodyReader::for_response(&Method::GET, status, &h).unwrap();
            assert_eq!(r, BodyReader::NoBody, "status {}", status);
        }
        let r = BodyReader::for_response(&Method::HEAD, 200, &h).unwrap();
        assert_eq!(r, BodyReader::NoBody);
    }

    #[test]
    fn content_length_zero_ends_at_once() {
        let h = headers(&[("content-length", "0")]);
        let mut r = BodyReader::for_response(&Method::GET, 200, &h).unwrap();
        let mut input = BytesMut::new();
        assert_eq!(r.read(&mut input, false).unwrap(), BodyEvent::Ended);
    }

    #[test]
    fn bad_content_length() {
        let h = headers(&[("content-length", "five")]);
        let err = BodyReader::for_response(&Method::GET, 200, &h).unwrap_err();
        assert!(matches!(err, Error::BadContentLengthHeader));

        let h = headers(&[("content-length", "5"), ("content-length", "6")]);
        let err = BodyReader::for_response(&Method::GET, 200, &h).unwrap_err();
        assert!(matches!(err, Error::TooManyContentLengthHeaders));
    }

    #[test]
    fn length_delimited_leaves_next_response() {
        let mut r = BodyReader::LengthDelimited(5);
        let mut input = BytesMut::from(&b"helloHTTP/1.1"[..]);
        assert_eq!(read_all(&mut r, &mut input, false), b"hello");
        assert_eq!(&input[..], b"HTTP/1.1");
        assert_eq!(r.read(&mut input, false).unwrap(), BodyEvent::Ended);
    }

    #[test]
    fn length_delimited_any_split() {
        let body = b"Hello, world!";
        for split in 1..body.len() {
            let mut r = BodyReader::LengthDelimited(body.len() as u64);
            let mut out = Vec::new();
            for part in body.chunks(split) {
                let mut input = BytesMut::from(part);
                out.extend(read_all(&mut r, &mut input, false));
            }
            assert_eq!(&out, body);
            assert_eq!(r.read(&mut BytesMut::new(), false).unwrap(), BodyEvent::Ended);
        }
    }

    #[test]
    fn length_delimited_closed_early() {
        let mut r = BodyReader::LengthDelimited(5);
        let mut input = BytesMut::from(&b"hel"[..]);
        read_all(&mut r, &mut input, false);
        let err = r.read(&mut input, true).unwrap_err();
        assert_eq!(err.to_string(), "Connection closed while awaiting body");
    }

    #[test]
    fn chunked_closed_early() {
        let mut r = BodyReader::Chunked(Dechunker::new());
        let mut input = BytesMut::from(&b"5\r\nhel"[..]);
        assert_eq!(r.read(&mut input, true).unwrap(), BodyEvent::Data(Bytes::from_static(b"hel")));
        let err = r.read(&mut input, true).unwrap_err();
        assert_eq!(err.to_string(), "Connection closed while awaiting chunk");

        let mut r = BodyReader::Chunked(Dechunker::new());
        let mut input = BytesMut::from(&b"0\r\nX-Trailer: 1\r\n"[..]);
        let err = r.read(&mut input, true).unwrap_err();
        assert_eq!(err.to_string(), "Connection closed while awaiting chunk trailer");
    }

    #[test]
    fn close_delimited_ends_on_close() {
        let mut r = BodyReader::CloseDelimited;
        let mut input = BytesMut::from(&b"some"[..]);
        assert_eq!(read_all(&mut r, &mut input, false), b"some");
        assert_eq!(r.read(&mut input, false).unwrap(), BodyEvent::NeedMore);
        assert_eq!(r.read(&mut input, true).unwrap(), BodyEvent::Ended);
    }

    #[test]
    fn writer_sized() {
        let mut w = BodyWriter::Sized(5);
        let mut out = Vec::new();
        w.write(b"hal", &mut out).unwrap();
        assert!(matches!(
            w.finish(&mut out),
            Err(Error::BodyShorterThanContentLength)
        ));
        w.write(b"lo", &mut out).unwrap();
        assert!(matches!(
            w.write(b"!", &mut out),
            Err(Error::BodyLargerThanContentLength)
        ));
        w.finish(&mut out).unwrap();
        assert_eq!(out, b"hallo");
    }

    #[test]
    fn writer_chunked() {
        let mut w = BodyWriter::Chunked;
        let mut out = Vec::new();
        w.write(b"hallo", &mut out).unwrap();
        w.write(b"", &mut out).unwrap();
        w.finish(&mut out).unwrap();
        assert_eq!(out, b"5\r\nhallo\r\n0\r\n\r\n");
    }
}
