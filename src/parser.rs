use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};

use crate::body::{BodyEvent, BodyReader};
use crate::error::Awaiting;
use crate::Error;

/// Max number of headers to parse from an HTTP response
pub(crate) const MAX_RESPONSE_HEADERS: usize = 128;

/// Status line and headers of a received response.
#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub reason: String,
    pub version: Version,
    pub headers: HeaderMap,
}

#[derive(Debug)]
pub(crate) enum Event {
    /// Not enough input to make progress.
    NeedMore,
    /// A `100 Continue` that releases a gated request body.
    Continue,
    /// An informational status that was consumed and ignored.
    Provisional(StatusCode),
    /// The final response header.
    Head(ResponseHead),
    /// A piece of body.
    Data(Bytes),
    /// The response is complete.
    End,
}

#[derive(Debug)]
enum Phase {
    Header,
    Body(BodyReader),
    Done,
}

/// Parser for one response on a connection.
///
/// The parser never owns the input. Bytes it doesn't need are left in the
/// buffer for the next response in the pipeline.
#[derive(Debug)]
pub(crate) struct ResponseParser {
    method: Method,
    phase: Phase,
    expect_continue: bool,
}

impl ResponseParser {
    pub fn new(method: Method, expect_continue: bool) -> Self {
        ResponseParser {
            method,
            phase: Phase::Header,
            expect_continue,
        }
    }

    /// Advance the parser as far as the input allows.
    ///
    /// `closed` tells that the input will not grow anymore.
    pub fn parse(&mut self, input: &mut BytesMut, closed: bool) -> Result<Event, Error> {
        match &mut self.phase {
            Phase::Header => self.parse_header(input, closed),

            Phase::Body(reader) => match reader.read(input, closed)? {
                BodyEvent::Data(v) => Ok(Event::Data(v)),
                BodyEvent::NeedMore => Ok(Event::NeedMore),
                BodyEvent::Ended => {
                    trace!("Response body ended");
                    self.phase = Phase::Done;
                    Ok(Event::End)
                }
            },

            Phase::Done => Ok(Event::End),
        }
    }

    /// Stop treating a `100 Continue` as the release of a gated body.
    pub fn stop_gating(&mut self) {
        self.expect_continue = false;
    }

    /// The body framing, once the final header is read.
    pub fn body_reader(&self) -> Option<&BodyReader> {
        match &self.phase {
            Phase::Body(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_header(&self) -> bool {
        matches!(self.phase, Phase::Header)
    }

    fn parse_header(&mut self, input: &mut BytesMut, closed: bool) -> Result<Event, Error> {
        let Some((used, head)) = try_parse_response(input)? else {
            if closed {
                return Err(Error::ClosedWhile(Awaiting::Header));
            }
            return Ok(Event::NeedMore);
        };

        input.advance(used);

        let status = head.status;

        if status.is_informational() {
            if status == StatusCode::CONTINUE && self.expect_continue {
                self.expect_continue = false;
                return Ok(Event::Continue);
            }

            debug!("Ignore provisional response: {}", status);
            return Ok(Event::Provisional(status));
        }

        let reader = BodyReader::for_response(&self.method, status.as_u16(), &head.headers)?;

        trace!("Response {} with {} body", status, reader.name());

        self.phase = Phase::Body(reader);

        Ok(Event::Head(head))
    }
}

/// Try to parse a complete status line and header block.
///
/// Returns the number of input bytes used, or `None` if the input is
/// not yet complete.
pub(crate) fn try_parse_response(input: &[u8]) -> Result<Option<(usize, ResponseHead)>, Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    let input_used = match res.parse(input)? {
        httparse::Status::Complete(v) => v,
        httparse::Status::Partial => return Ok(None),
    };

    let version = match res.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(Error::UnsupportedVersion),
    };

    let status = res
        .code
        .and_then(|v| StatusCode::from_u16(v).ok())
        .ok_or_else(|| Error::HttpParseFail("invalid status code".into()))?;

    let reason = res.reason.unwrap_or_default().to_string();

    let mut map = HeaderMap::with_capacity(res.headers.len());
    for h in res.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| Error::BadHeader(h.name.to_string()))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| Error::BadHeader(format!("value of {}", h.name)))?;
        map.append(name, value);
    }

    let head = ResponseHead {
        status,
        reason,
        version,
        headers: map,
    };

    Ok(Some((input_used, head)))
}
