use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};

use crate::util::{compare_lowercase_ascii, tokens};
use crate::Error;

pub(crate) trait MethodExt {
    fn is_http10(&self) -> bool;
    fn is_http11(&self) -> bool;
    fn need_request_body(&self) -> bool;
    fn verify_version(&self, version: Version) -> Result<(), Error>;
}

impl MethodExt for Method {
    fn is_http10(&self) -> bool {
        self == Method::GET || self == Method::HEAD || self == Method::POST
    }

    fn is_http11(&self) -> bool {
        self == Method::PUT
            || self == Method::DELETE
            || self == Method::CONNECT
            || self == Method::OPTIONS
            || self == Method::TRACE
            || self == Method::PATCH
    }

    fn need_request_body(&self) -> bool {
        self == Method::POST || self == Method::PUT || self == Method::PATCH
    }

    fn verify_version(&self, v: Version) -> Result<(), Error> {
        if v != Version::HTTP_10 && v != Version::HTTP_11 {
            return Err(Error::UnsupportedVersion);
        }

        // Extension methods are let through on HTTP/1.1.
        let is_extension = !self.is_http10() && !self.is_http11();

        let method_ok = self.is_http10() || v == Version::HTTP_11 && (self.is_http11() || is_extension);

        if !method_ok {
            return Err(Error::MethodVersionMismatch(self.clone(), v));
        }

        Ok(())
    }
}

pub(crate) trait HeaderIterExt {
    fn has(self, key: &str, value: &str) -> bool;
    fn has_expect_100(self) -> bool;
}

impl<'a, I: Iterator<Item = (&'a HeaderName, &'a HeaderValue)>> HeaderIterExt for I {
    /// Tells if any header `key` holds the (lowercase) token `value`.
    fn has(self, key: &str, value: &str) -> bool {
        self.filter(|i| i.0 == key)
            .filter_map(|i| i.1.to_str().ok())
            .any(|v| tokens(v).any(|t| compare_lowercase_ascii(t, value)))
    }

    fn has_expect_100(self) -> bool {
        self.has("expect", "100-continue")
    }
}

pub(crate) trait HeaderMapExt {
    /// The `max=N` parameter of a `Keep-Alive` header.
    fn keep_alive_max(&self) -> Option<usize>;
}

impl HeaderMapExt for HeaderMap {
    fn keep_alive_max(&self) -> Option<usize> {
        self.get_all("keep-alive")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(tokens)
            .filter_map(|t| t.split_once('='))
            .filter(|(k, _)| compare_lowercase_ascii(k.trim(), "max"))
            .find_map(|(_, v)| v.trim().parse().ok())
    }
}

pub(crate) trait StatusExt {
    /// Detect 307/308 redirect
    fn is_redirect_retaining_status(&self) -> bool;

    /// 3xx that points somewhere else. 304 is excluded since it has no location.
    fn is_location_redirect(&self) -> bool;
}

impl StatusExt for StatusCode {
    fn is_redirect_retaining_status(&self) -> bool {
        *self == StatusCode::TEMPORARY_REDIRECT || *self == StatusCode::PERMANENT_REDIRECT
    }

    fn is_location_redirect(&self) -> bool {
        matches!(self.as_u16(), 301 | 302 | 303 | 307 | 308)
    }
}
