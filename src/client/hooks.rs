use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::Uri;

use crate::request::RequestHead;
use crate::{Error, Response};

/// Receives a streamed response body. `None` marks the end.
pub type BodySink = Box<dyn FnMut(Option<Bytes>) + Send>;

/// Called with the final response header. The returned sink gets the body.
pub type OnHeader = Arc<dyn Fn(&Response) -> BodySink + Send + Sync>;

/// Called with a redirect response and the location about to be followed.
pub type OnRedirect = Arc<dyn Fn(&Response, &Uri) + Send + Sync>;

/// Extension points around each request.
///
/// A cookie jar is the typical user: add `Cookie` in `prepare_request`
/// and pick up `Set-Cookie` in `process_response`.
pub trait Hooks: Send + Sync + 'static {
    /// Called before every request is sent, including redirects.
    fn prepare_request(&self, _head: &mut RequestHead) {}

    /// Called once per final (not followed) response.
    fn process_response(&self, _response: &Response) {}
}

pub(crate) struct NoHooks;

impl Hooks for NoHooks {}

/// Callback style completion for [`Client::spawn_request`](super::Client::spawn_request).
pub struct Callbacks {
    pub on_response: Box<dyn FnOnce(Response) + Send>,
    pub on_error: Box<dyn FnOnce(Error) + Send>,
}

impl Callbacks {
    pub fn new<R, E>(on_response: R, on_error: E) -> Self
    where
        R: FnOnce(Response) + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
    {
        Callbacks {
            on_response: Box::new(on_response),
            on_error: Box::new(on_error),
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks").finish()
    }
}
