use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue};

use super::hooks::{OnHeader, OnRedirect};
use crate::Error;

/// Client wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Max connections per host and port. 0 is unlimited.
    pub max_connections_per_host: usize,
    /// Max requests in flight on one connection. 0 is unlimited.
    pub max_in_flight: usize,
    /// Pipeline requests on connections that allow it.
    pub pipeline: bool,
    pub max_redirects: u32,
    /// Overall time for a request, redirects included.
    pub timeout: Option<Duration>,
    /// Max time without any progress reading or writing.
    pub stall_timeout: Option<Duration>,
    /// How long to wait for `100 Continue` before sending the body anyway.
    pub continue_timeout: Option<Duration>,
    /// Treat 4xx and 5xx responses as errors.
    pub fail_on_error: bool,
    pub user_agent: Option<String>,
    /// Ask the server to keep the connection open.
    pub keep_alive: bool,
    /// Connect to this host and port instead.
    pub proxy: Option<(String, u16)>,
    pub local_addr: Option<SocketAddr>,
    /// Decode `Content-Encoding` with the installed decoders.
    pub decode_content: bool,
    /// Sent with every request, unless the request has its own value.
    pub headers: HeaderMap,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_connections_per_host: 1,
            max_in_flight: 4,
            pipeline: true,
            max_redirects: 3,
            timeout: None,
            stall_timeout: None,
            continue_timeout: None,
            fail_on_error: false,
            user_agent: Some(format!("h1line/{}", env!("CARGO_PKG_VERSION"))),
            keep_alive: true,
            proxy: None,
            local_addr: None,
            decode_content: false,
            headers: HeaderMap::new(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_connections_per_host(mut self, v: usize) -> Self {
        self.max_connections_per_host = v;
        self
    }

    pub fn with_max_in_flight(mut self, v: usize) -> Self {
        self.max_in_flight = v;
        self
    }

    pub fn with_pipeline(mut self, v: bool) -> Self {
        self.pipeline = v;
        self
    }

    pub fn with_max_redirects(mut self, v: u32) -> Self {
        self.max_redirects = v;
        self
    }

    pub fn with_timeout(mut self, v: Duration) -> Self {
        self.timeout = Some(v);
        self
    }

    pub fn with_stall_timeout(mut self, v: Duration) -> Self {
        self.stall_timeout = Some(v);
        self
    }

    pub fn with_continue_timeout(mut self, v: Duration) -> Self {
        self.continue_timeout = Some(v);
        self
    }

    pub fn with_fail_on_error(mut self, v: bool) -> Self {
        self.fail_on_error = v;
        self
    }

    /// `None` sends no user-agent.
    pub fn with_user_agent(mut self, v: Option<String>) -> Self {
        self.user_agent = v;
        self
    }

    pub fn with_keep_alive(mut self, v: bool) -> Self {
        self.keep_alive = v;
        self
    }

    pub fn with_proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.proxy = Some((host.into(), port));
        self
    }

    pub fn with_local_addr(mut self, v: SocketAddr) -> Self {
        self.local_addr = Some(v);
        self
    }

    pub fn with_decode_content(mut self, v: bool) -> Self {
        self.decode_content = v;
        self
    }

    pub fn with_header<K, V>(mut self, key: K, value: V) -> Result<Self, Error>
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let name = HeaderName::try_from(key).map_err(Into::into)?;
        let value = HeaderValue::try_from(value).map_err(Into::into)?;
        self.headers.append(name, value);
        Ok(self)
    }
}

/// Per request overrides and callbacks.
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub stall_timeout: Option<Duration>,
    pub max_redirects: Option<u32>,
    pub fail_on_error: Option<bool>,
    /// Send `Expect: 100-continue` and hold the body until the server agrees.
    pub expect_continue: bool,
    pub proxy: Option<(String, u16)>,
    /// Connect to this host, instead of the uri host.
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<bool>,
    pub on_redirect: Option<OnRedirect>,
    pub on_header: Option<OnHeader>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, v: Duration) -> Self {
        self.timeout = Some(v);
        self
    }

    pub fn with_stall_timeout(mut self, v: Duration) -> Self {
        self.stall_timeout = Some(v);
        self
    }

    pub fn with_max_redirects(mut self, v: u32) -> Self {
        self.max_redirects = Some(v);
        self
    }

    pub fn with_fail_on_error(mut self, v: bool) -> Self {
        self.fail_on_error = Some(v);
        self
    }

    pub fn with_expect_continue(mut self, v: bool) -> Self {
        self.expect_continue = v;
        self
    }

    pub fn with_proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.proxy = Some((host.into(), port));
        self
    }

    pub fn with_target(mut self, host: impl Into<String>, port: u16, tls: bool) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self.tls = Some(tls);
        self
    }

    pub fn with_on_redirect<F>(mut self, f: F) -> Self
    where
        F: Fn(&crate::Response, &http::Uri) + Send + Sync + 'static,
    {
        self.on_redirect = Some(std::sync::Arc::new(f));
        self
    }

    pub fn with_on_header<F>(mut self, f: F) -> Self
    where
        F: Fn(&crate::Response) -> super::hooks::BodySink + Send + Sync + 'static,
    {
        self.on_header = Some(std::sync::Arc::new(f));
        self
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("timeout", &self.timeout)
            .field("stall_timeout", &self.stall_timeout)
            .field("max_redirects", &self.max_redirects)
            .field("fail_on_error", &self.fail_on_error)
            .field("expect_continue", &self.expect_continue)
            .field("proxy", &self.proxy)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .finish()
    }
}
