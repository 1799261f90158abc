use http::uri::Scheme;
use http::{Method, StatusCode, Uri};
use url::Url;

use crate::ext::{MethodExt, StatusExt};
use crate::request::RequestHead;
use crate::{Error, Response};

/// Whether a redirect with this status is followed for the method.
///
/// 307/308 keep the method, which means a request body would have to be
/// resent. Those are not followed, and neither is DELETE.
pub(crate) fn will_follow(method: &Method, status: StatusCode) -> bool {
    if status.is_redirect_retaining_status() {
        !method.need_request_body() && *method != Method::DELETE
    } else {
        true
    }
}

/// The uri to follow for a redirect response.
pub(crate) fn location(response: &Response) -> Result<Uri, Error> {
    let header = response
        .headers
        .get("location")
        .ok_or(Error::NoLocationHeader)?;

    let location = header
        .to_str()
        .map_err(|_| Error::BadLocationHeader(String::from_utf8_lossy(header.as_bytes()).to_string()))?;

    resolve_location(&response.request.uri, location)
}

fn resolve_location(current: &Uri, location: &str) -> Result<Uri, Error> {
    let absolute = if is_absolute(location) {
        location.to_string()
    } else if location.starts_with('/') {
        let scheme = current.scheme_str().unwrap_or("http");
        let authority = current
            .authority()
            .ok_or_else(|| Error::BadLocationHeader(location.to_string()))?;
        format!("{}://{}{}", scheme, authority, location)
    } else {
        return Err(Error::UnrecognisedLocation(location.to_string()));
    };

    let url = Url::parse(&absolute).map_err(|_| Error::BadLocationHeader(location.to_string()))?;

    url.as_str()
        .parse::<Uri>()
        .map_err(|_| Error::BadLocationHeader(location.to_string()))
}

fn is_absolute(location: &str) -> bool {
    let lower = location.get(..8).unwrap_or(location).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// The request to send for a redirect. `None` if it is not followed.
pub(crate) fn next_request(previous: &RequestHead, status: StatusCode, uri: Uri) -> Option<RequestHead> {
    let method = &previous.method;

    if !will_follow(method, status) {
        return None;
    }

    // 301/302/303 turn POST, PUT and the like into GET, the way curl does.
    let new_method = if status.is_redirect_retaining_status() || matches!(*method, Method::GET | Method::HEAD)
    {
        method.clone()
    } else {
        Method::GET
    };

    let mut next = previous.clone();
    let keep_auth = can_redirect_auth_header(&previous.uri, &uri);

    next.method = new_method;
    next.uri = uri;

    if !keep_auth {
        next.headers.remove("authorization");
    }
    next.headers.remove("cookie");
    next.headers.remove("content-length");
    next.headers.remove("transfer-encoding");
    next.headers.remove("host");
    // The body is never resent.
    next.headers.remove("expect");

    Some(next)
}

fn can_redirect_auth_header(prev: &Uri, next: &Uri) -> bool {
    let host_prev = prev.authority().map(|a| a.host());
    let host_next = next.authority().map(|a| a.host());
    let scheme_prev = prev.scheme();
    let scheme_next = next.scheme();
    host_prev == host_next && (scheme_prev == scheme_next || scheme_next == Some(&Scheme::HTTPS))
}
