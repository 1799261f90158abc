//! The request orchestrator.
//!
//! A [`Client`] owns the connection pool. Each request goes through:
//!
//! ```text
//!  prepare ──▶ acquire ──▶ send ──▶ response ──┬──▶ final response
//!     ▲                                       │
//!     └──────────── redirect ◀────────────────┘
//! ```
//!
//! The overall `timeout` covers every step, all redirects included. When it
//! runs out the request in flight is aborted, which closes its connection.
//!
//! ```no_run
//! # async fn run() -> Result<(), h1line::Error> {
//! use h1line::{Client, Config};
//!
//! let client = Client::new(Config::default());
//! let res = client.get("http://example.test/").await?;
//! println!("{} {}", res.status, res.text());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use http::uri::Scheme;
use http::{HeaderValue, Request, Uri, Version};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::conn::Outgoing;
use crate::connect::{Connect, TcpConnector, Target};
use crate::decode::{DecoderFactory, Decoders};
use crate::ext::MethodExt;
use crate::pool::{Pool, PoolPolicy};
use crate::request::{self, Body, RequestHead};
use crate::timer::sleep_until_opt;
use crate::{Error, Response};

mod config;
pub use config::{Config, RequestOptions};

pub(crate) mod hooks;
pub use hooks::{BodySink, Callbacks, Hooks, OnHeader, OnRedirect};

pub(crate) mod redirect;

use hooks::NoHooks;

/// HTTP/1.1 client.
///
/// Cheap to clone. Clones share the connection pool.
#[derive(Clone)]
pub struct Client {
    config: Arc<Config>,
    pool: Pool,
    hooks: Arc<dyn Hooks>,
    decoders: Option<Decoders>,
}

impl Client {
    pub fn new(config: Config) -> Self {
        Self::with_connector(config, TcpConnector::new())
    }

    /// Client that opens connections with `connector`.
    pub fn with_connector(config: Config, connector: impl Connect) -> Self {
        let policy = PoolPolicy {
            max_connections_per_host: config.max_connections_per_host,
            max_in_flight: config.max_in_flight,
            pipeline: config.pipeline,
        };

        Client {
            pool: Pool::new(Arc::new(connector), policy),
            config: Arc::new(config),
            hooks: Arc::new(NoHooks),
            decoders: None,
        }
    }

    pub fn with_hooks(mut self, hooks: impl Hooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Decoders for `Content-Encoding`. Used when `decode_content` is set.
    pub fn with_decoders(mut self, factory: impl DecoderFactory) -> Self {
        self.decoders = Some(Decoders::new(Arc::new(factory)));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn get(&self, uri: &str) -> Result<Response, Error> {
        let uri: Uri = uri.parse().map_err(|_| Error::InvalidUri(uri.to_string()))?;
        let req = Request::get(uri).body(Body::Empty)?;
        self.request(req).await
    }

    /// POST the pairs as `application/x-www-form-urlencoded`.
    pub async fn post_form<K, V>(&self, uri: &str, pairs: &[(K, V)]) -> Result<Response, Error>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let uri: Uri = uri.parse().map_err(|_| Error::InvalidUri(uri.to_string()))?;

        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter().map(|(k, v)| (k.as_ref(), v.as_ref())))
            .finish();

        let req = Request::post(uri)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(encoded))?;

        self.request(req).await
    }

    pub async fn request<B: Into<Body>>(&self, req: Request<B>) -> Result<Response, Error> {
        self.request_with(req, RequestOptions::default()).await
    }

    /// Run a request to completion, following redirects.
    pub async fn request_with<B: Into<Body>>(
        &self,
        req: Request<B>,
        mut opts: RequestOptions,
    ) -> Result<Response, Error> {
        let (mut head, mut body) = RequestHead::from_request(req);

        if head.uri.authority().is_none() {
            if let Some(host) = &opts.host {
                head.uri = explicit_uri(&head.uri, host, opts.port, opts.tls.unwrap_or(false))?;
            }
        }

        let timeout = opts.timeout.or(self.config.timeout);
        let deadline = timeout.map(|t| Instant::now() + t);
        let fail_on_error = opts.fail_on_error.unwrap_or(self.config.fail_on_error);

        let mut remaining = opts.max_redirects.unwrap_or(self.config.max_redirects);
        let mut previous: Option<Box<Response>> = None;

        loop {
            self.prepare(&mut head, &opts)?;

            let follow = remaining > 0;
            let mut response = self.send_once(head, body, &opts, follow, deadline).await?;

            if follow && response.is_redirect() {
                let uri = redirect::location(&response)?;

                if let Some(next) = redirect::next_request(&response.request, response.status, uri.clone()) {
                    debug!("Redirect {} {} -> {}", response.status, response.request.uri, uri);

                    if let Some(cb) = &opts.on_redirect {
                        cb(&response, &uri);
                    }

                    response.previous = previous.take();
                    previous = Some(Box::new(response));

                    // The explicit target only applies to the first request.
                    opts.host = None;
                    opts.port = None;
                    opts.tls = None;

                    head = next;
                    body = Body::Empty;
                    remaining -= 1;
                    continue;
                }
            }

            response.previous = previous;

            self.hooks.process_response(&response);

            if fail_on_error && response.is_error() {
                debug!("Fail on error: {} {}", response.status.as_u16(), response.reason);
                return Err(Error::Status(Box::new(response)));
            }

            return Ok(response);
        }
    }

    /// Run the request on a task, reporting to `callbacks`.
    pub fn spawn_request<B: Into<Body>>(
        &self,
        req: Request<B>,
        opts: RequestOptions,
        callbacks: Callbacks,
    ) -> JoinHandle<()> {
        let req = req.map(Into::into);
        let client = self.clone();

        tokio::spawn(async move {
            match client.request_with(req, opts).await {
                Ok(response) => (callbacks.on_response)(response),
                Err(e) => (callbacks.on_error)(e),
            }
        })
    }

    /// Fill in the headers the client adds to every request.
    fn prepare(&self, head: &mut RequestHead, opts: &RequestOptions) -> Result<(), Error> {
        let config = &self.config;

        for name in config.headers.keys() {
            if head.headers.contains_key(name) {
                continue;
            }
            for value in config.headers.get_all(name) {
                head.headers.append(name.clone(), value.clone());
            }
        }

        if let Some(ua) = &config.user_agent {
            if !head.headers.contains_key("user-agent") {
                let value = HeaderValue::from_str(ua).map_err(|_| Error::BadHeader("user-agent".into()))?;
                head.headers.insert("user-agent", value);
            }
        }

        if !head.headers.contains_key("connection") {
            if !config.keep_alive {
                head.headers.insert("connection", HeaderValue::from_static("close"));
            } else if head.version == Version::HTTP_10 {
                head.headers.insert("connection", HeaderValue::from_static("keep-alive"));
            }
        }

        if config.decode_content && !head.headers.contains_key("accept-encoding") {
            if let Some(decoders) = &self.decoders {
                let value = HeaderValue::from_str(&decoders.accept_encoding())
                    .map_err(|_| Error::BadHeader("accept-encoding".into()))?;
                head.headers.insert("accept-encoding", value);
            }
        }

        if opts.expect_continue && head.method.need_request_body() && !head.headers.contains_key("expect") {
            head.headers.insert("expect", HeaderValue::from_static("100-continue"));
        }

        self.hooks.prepare_request(head);

        Ok(())
    }

    /// One request and its response, no redirects.
    async fn send_once(
        &self,
        mut head: RequestHead,
        body: Body,
        opts: &RequestOptions,
        follow_redirects: bool,
        deadline: Option<Instant>,
    ) -> Result<Response, Error> {
        let info = request::analyze(&mut head, &body)?;
        let (target, absolute) = self.target(&head, opts)?;

        trace!("{} {} via {}", head.method, head.uri, target);

        let lease = tokio::select! {
            r = self.pool.acquire(&target) => r?,
            _ = sleep_until_opt(deadline) => {
                debug!("Timed out waiting for connection to {}", target);
                return Err(Error::Timeout);
            }
        };

        let (reply, rx) = oneshot::channel();

        let decoders = if self.config.decode_content {
            self.decoders.clone()
        } else {
            None
        };

        let out = Outgoing {
            seq: self.pool.next_seq(),
            head,
            body,
            info,
            absolute,
            stall_timeout: opts.stall_timeout.or(self.config.stall_timeout),
            continue_timeout: self.config.continue_timeout,
            follow_redirects,
            on_header: opts.on_header.clone(),
            decoders,
            reply,
        };

        let mut fut = lease.send(out, rx);

        let result = tokio::select! {
            r = &mut fut => Some(r),
            _ = sleep_until_opt(deadline) => None,
        };

        match result {
            Some(r) => r,
            None => {
                debug!("Timed out waiting for response from {}", target);
                fut.abort(Error::Timeout);
                Err(Error::Timeout)
            }
        }
    }

    /// Where to connect, and whether the request target is absolute-form.
    fn target(&self, head: &RequestHead, opts: &RequestOptions) -> Result<(Target, bool), Error> {
        let uri = &head.uri;

        let https = match uri.scheme() {
            None => false,
            Some(s) if *s == Scheme::HTTP => false,
            Some(s) if *s == Scheme::HTTPS => true,
            Some(s) => return Err(Error::InvalidUri(format!("unsupported scheme: {}", s))),
        };

        let tls = opts.tls.unwrap_or(https);
        let local_addr = self.config.local_addr;

        let proxy = opts.proxy.as_ref().or(self.config.proxy.as_ref());

        if let Some((host, port)) = proxy {
            let target = Target {
                host: host.clone(),
                port: *port,
                tls: false,
                local_addr,
            };
            return Ok((target, true));
        }

        let host = match (&opts.host, uri.host()) {
            (Some(h), _) => h.clone(),
            (None, Some(h)) => h.to_string(),
            (None, None) => return Err(Error::InvalidUri(format!("missing host: {}", uri))),
        };

        let port = opts
            .port
            .or_else(|| uri.port_u16())
            .unwrap_or(if tls { 443 } else { 80 });

        let target = Target {
            host,
            port,
            tls,
            local_addr,
        };

        Ok((target, false))
    }
}

/// A relative uri made absolute against an explicit host.
fn explicit_uri(uri: &Uri, host: &str, port: Option<u16>, tls: bool) -> Result<Uri, Error> {
    let (scheme, default_port) = if tls {
        (Scheme::HTTPS, 443)
    } else {
        (Scheme::HTTP, 80)
    };

    let authority = match port {
        Some(p) if p != default_port => format!("{}:{}", host, p),
        _ => host.to_string(),
    };

    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    Uri::builder()
        .scheme(scheme)
        .authority(authority.as_str())
        .path_and_query(path)
        .build()
        .map_err(|_| Error::InvalidUri(format!("{}{}", authority, path)))
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("decoders", &self.decoders)
            .finish()
    }
}

#[cfg(test)]
mod test;
