use std::fmt;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::uri::Authority;
use http::{HeaderMap, HeaderValue, Method, Request, Uri, Version};

use crate::body::BodyWriter;
use crate::ext::{HeaderIterExt, MethodExt};
use crate::util::{compare_lowercase_ascii, tokens};
use crate::Error;

/// Request body.
///
/// A generator is called repeatedly for the next piece of body, and
/// signals the end by returning `None`.
#[derive(Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    Generator(Box<dyn FnMut() -> Option<Bytes> + Send>),
}

impl Body {
    /// Body produced piece by piece from a closure.
    pub fn generator<F>(f: F) -> Self
    where
        F: FnMut() -> Option<Bytes> + Send + 'static,
    {
        Body::Generator(Box::new(f))
    }

    /// Tells if the body is known to be empty.
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Bytes(v) => v.is_empty(),
            Body::Generator(_) => false,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Bytes(v) => f.debug_tuple("Bytes").field(&v.len()).finish(),
            Self::Generator(_) => write!(f, "Generator"),
        }
    }
}

impl From<()> for Body {
    fn from(_: ()) -> Self {
        Body::Empty
    }
}

impl From<Bytes> for Body {
    fn from(value: Bytes) -> Self {
        Body::Bytes(value)
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::Bytes(value.into())
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::Bytes(value.into())
    }
}

impl From<&'static str> for Body {
    fn from(value: &'static str) -> Self {
        Body::Bytes(Bytes::from_static(value.as_bytes()))
    }
}

impl From<&'static [u8]> for Body {
    fn from(value: &'static [u8]) -> Self {
        Body::Bytes(Bytes::from_static(value))
    }
}

/// The parts of a request that are kept once it has been sent.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Split a request into head and body.
    pub fn from_request<B: Into<Body>>(request: Request<B>) -> (RequestHead, Body) {
        let (parts, body) = request.into_parts();
        let head = RequestHead {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
        };
        (head, body.into())
    }

    /// Value for the host header, taken from the uri.
    pub(crate) fn host_header(&self) -> Result<HeaderValue, Error> {
        let authority = self
            .uri
            .authority()
            .ok_or_else(|| Error::InvalidUri(format!("missing host: {}", self.uri)))?;

        let host = host_port(authority);

        HeaderValue::from_str(&host).map_err(|_| Error::BadHeader(host))
    }
}

/// `host[:port]` of an authority. Userinfo must never go on the wire.
fn host_port(authority: &Authority) -> String {
    match authority.port_u16() {
        Some(port) => format!("{}:{}", authority.host(), port),
        None => authority.host().to_string(),
    }
}

/// What the analysis found out about a request.
#[derive(Debug)]
pub(crate) struct RequestInfo {
    pub writer: BodyWriter,
    pub expect_continue: bool,
}

/// Validate a request and add the headers needed to put it on the wire.
pub(crate) fn analyze(head: &mut RequestHead, body: &Body) -> Result<RequestInfo, Error> {
    let m = &head.method;

    m.verify_version(head.version)?;

    let count_host = head.headers.get_all(HOST).iter().count();
    if count_host > 1 {
        return Err(Error::TooManyHostHeaders);
    }

    let count_len = head.headers.get_all(CONTENT_LENGTH).iter().count();
    if count_len > 1 {
        return Err(Error::TooManyContentLengthHeaders);
    }

    let mut content_length: Option<u64> = None;
    if let Some(h) = head.headers.get(CONTENT_LENGTH) {
        let n = h
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or(Error::BadContentLengthHeader)?;
        content_length = Some(n);
    }

    let has_chunked = head
        .headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(tokens)
        .any(|v| compare_lowercase_ascii(v, "chunked"));

    if !body.is_empty() && !m.need_request_body() {
        return Err(Error::MethodForbidsBody(m.clone()));
    }

    let writer = match body {
        Body::Empty => {
            head.headers.remove(TRANSFER_ENCODING);
            if m.need_request_body() {
                head.headers.insert(CONTENT_LENGTH, HeaderValue::from(0_u64));
            }
            BodyWriter::None
        }

        Body::Bytes(v) => {
            // The known length wins over whatever the caller declared.
            let len = v.len() as u64;
            head.headers.remove(TRANSFER_ENCODING);
            head.headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
            BodyWriter::Sized(len)
        }

        // https://datatracker.ietf.org/doc/html/rfc2616#section-4.4
        // Messages MUST NOT include both a Content-Length header field and a
        // non-identity transfer-coding.
        Body::Generator(_) if has_chunked => {
            head.headers.remove(CONTENT_LENGTH);
            BodyWriter::Chunked
        }

        Body::Generator(_) => match content_length {
            Some(n) => BodyWriter::Sized(n),
            None if head.version == Version::HTTP_10 => {
                return Err(Error::BadHeader(
                    "HTTP/1.0 body without content-length".into(),
                ))
            }
            None => {
                head.headers
                    .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                BodyWriter::Chunked
            }
        },
    };

    if count_host == 0 {
        let host = head.host_header()?;
        head.headers.insert(HOST, host);
    } else if let Some(h) = head.headers.get(HOST) {
        h.to_str()
            .map_err(|_| Error::BadHeader("host header is not a string".into()))?;
    }

    // Without a body there is nothing to gate.
    let expect_continue = writer.has_body() && head.headers.iter().has_expect_100();

    Ok(RequestInfo {
        writer,
        expect_continue,
    })
}

/// Write the request line and headers.
///
/// `absolute` writes the request target in absolute-form, which is what
/// a proxy wants.
pub(crate) fn write_prelude(head: &RequestHead, absolute: bool, out: &mut Vec<u8>) {
    let version = match head.version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };

    let path = head
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .filter(|p| !p.is_empty())
        .unwrap_or("/");

    out.extend_from_slice(head.method.as_str().as_bytes());
    out.push(b' ');

    if absolute {
        if let (Some(scheme), Some(authority)) = (head.uri.scheme_str(), head.uri.authority()) {
            out.extend_from_slice(scheme.as_bytes());
            out.extend_from_slice(b"://");
            out.extend_from_slice(host_port(authority).as_bytes());
        }
    }

    out.extend_from_slice(path.as_bytes());
    out.push(b' ');
    out.extend_from_slice(version.as_bytes());
    out.extend_from_slice(b"\r\n");

    for (name, value) in &head.headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b"\r\n");
}
