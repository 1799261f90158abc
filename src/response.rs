use std::borrow::Cow;

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};

use crate::ext::StatusExt;
use crate::parser::ResponseHead;
use crate::request::RequestHead;

/// A complete response.
///
/// Redirects followed on the way to this response are kept in `previous`,
/// the most recent first.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub version: Version,
    pub headers: HeaderMap,
    /// The body, unless it was streamed to a sink.
    pub body: Bytes,
    /// The request that produced this response.
    pub request: RequestHead,
    pub previous: Option<Box<Response>>,
}

impl Response {
    pub(crate) fn new(head: ResponseHead, request: RequestHead) -> Self {
        Response {
            status: head.status,
            reason: head.reason,
            version: head.version,
            headers: head.headers,
            body: Bytes::new(),
            request,
            previous: None,
        }
    }

    /// A 3xx response pointing at some other location.
    pub fn is_redirect(&self) -> bool {
        self.status.is_location_redirect()
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// 4xx or 5xx
    pub fn is_error(&self) -> bool {
        self.status.is_client_error() || self.status.is_server_error()
    }

    /// The body as text, with invalid utf-8 replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Number of redirects before this response.
    pub fn redirect_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.previous.as_deref();
        while let Some(r) = cur {
            count += 1;
            cur = r.previous.as_deref();
        }
        count
    }
}

#[cfg(test)]
mod test {
    use http::{Method, Request};

    use super::*;

    fn response(status: u16) -> Response {
        let req = Request::get("http://foo.test/").body(()).unwrap();
        let (request, _) = RequestHead::from_request(req);
        let head = ResponseHead {
            status: StatusCode::from_u16(status).unwrap(),
            reason: String::new(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        };
        Response::new(head, request)
    }

    #[test]
    fn classification() {
        assert!(response(200).is_success());
        assert!(response(301).is_redirect());
        assert!(!response(304).is_redirect());
        assert!(response(404).is_error());
        assert!(response(503).is_error());
        assert!(!response(204).is_error());
    }

    #[test]
    fn redirect_chain() {
        let mut first = response(301);
        first.body = Bytes::from_static(b"moved");
        let mut second = response(302);
        second.previous = Some(Box::new(first));
        let mut last = response(200);
        last.previous = Some(Box::new(second));

        assert_eq!(last.redirect_count(), 2);
        assert_eq!(last.request.method, Method::GET);
        let prev = last.previous.as_ref().unwrap();
        assert_eq!(prev.previous.as_ref().unwrap().text(), "moved");
    }
}
