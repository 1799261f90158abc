//! One connection to a server.
//!
//! A connection is a tokio task owning the byte stream. It takes requests
//! from a channel, writes them in order and keeps one responder per written
//! request in a FIFO queue. Incoming bytes are always fed to the responder at
//! the head of the queue, since HTTP/1.1 answers in request order.
//!
//! ```text
//!   Idle ──▶ HeaderSend ──▶ HeaderRecv ──▶ NoBody | Chunked | FixedLen | UntilClose ──▶ Done
//!                ▲              │ 1xx                                                    │
//!                │              └──▶ (loop)                                              │
//!                └───────────────────────────── next queued request ◀────────────────────┘
//! ```
//!
//! Any failure of the stream fails every responder in the queue with the
//! same error, and the connection is closed.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::Version;
use smallvec::SmallVec;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};

use crate::body::BodyWriter;
use crate::client::hooks::{BodySink, OnHeader};
use crate::client::redirect::will_follow;
use crate::connect::BoxStream;
use crate::decode::{ContentDecoder, Decoders};
use crate::ext::{HeaderIterExt, HeaderMapExt, StatusExt};
use crate::parser::{Event, ResponseHead, ResponseParser};
use crate::request::{write_prelude, Body, RequestHead, RequestInfo};
use crate::timer::{sleep_until_opt, Countdown};
use crate::{Error, Response};

const READ_SIZE: usize = 16 * 1024;

/// Size of buffered body output before it is written out.
const WRITE_SIZE: usize = 16 * 1024;

pub(crate) type Reply = oneshot::Sender<Result<Response, Error>>;

/// A request handed to a connection.
pub(crate) struct Outgoing {
    pub seq: u64,
    pub head: RequestHead,
    pub body: Body,
    pub info: RequestInfo,
    /// Write the request target in absolute-form (proxy).
    pub absolute: bool,
    pub stall_timeout: Option<Duration>,
    pub continue_timeout: Option<Duration>,
    /// Whether redirect responses will be followed, in which case their body is
    /// read but not kept.
    pub follow_redirects: bool,
    pub on_header: Option<OnHeader>,
    pub decoders: Option<Decoders>,
    pub reply: Reply,
}

pub(crate) enum Control {
    /// Fail the request `seq`. If it is written, the connection goes with it.
    Abort { seq: u64, error: Error },
}

/// What a response header told us about the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Learned {
    /// Server speaks HTTP/1.1 with keep-alive.
    pub pipeline_ok: bool,
    /// Keep-Alive max=N
    pub max_in_flight: Option<usize>,
    /// The connection closes after the current response.
    pub closing: bool,
}

/// Callbacks from a connection to its owner.
pub(crate) trait ConnEvents: Send + 'static {
    /// A final response header arrived.
    fn learned(&self, learned: Learned);
    /// One request is done with the connection.
    fn released(&self);
    /// The connection is gone.
    fn closed(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Http10,
    ClientConnectionClose,
    ServerConnectionClose,
    Not100Continue,
    CloseDelimitedBody,
}

impl CloseReason {
    fn explain(&self) -> &'static str {
        match self {
            CloseReason::Http10 => "version is http1.0",
            CloseReason::ClientConnectionClose => "client sent Connection: close",
            CloseReason::ServerConnectionClose => "server sent Connection: close",
            CloseReason::Not100Continue => "got non-100 response before sending body",
            CloseReason::CloseDelimitedBody => "response body is close delimited",
        }
    }
}

/// Sending side of a connection.
#[derive(Debug, Clone)]
pub(crate) struct ConnHandle {
    pub tx: mpsc::UnboundedSender<Outgoing>,
    pub ctl: mpsc::UnboundedSender<Control>,
}

/// Start a connection task over the stream.
pub(crate) fn spawn<E: ConnEvents>(id: u64, stream: BoxStream, events: E) -> ConnHandle {
    let (tx, requests) = mpsc::unbounded_channel();
    let (ctl, control) = mpsc::unbounded_channel();

    let (reader, writer) = tokio::io::split(stream);

    let conn = Connection {
        id,
        reader,
        writer,
        requests,
        control,
        events,
        input: BytesMut::with_capacity(READ_SIZE),
        queue: VecDeque::new(),
        gated: None,
        stall: Countdown::default(),
        stall_seq: None,
        eof: false,
        closing: false,
        requests_closed: false,
    };

    tokio::spawn(conn.run());

    ConnHandle { tx, ctl }
}

/// One written request waiting for its response.
struct Responder {
    seq: u64,
    parser: ResponseParser,
    request: RequestHead,
    response: Option<Response>,
    body: BytesMut,
    reply: Option<Reply>,
    on_header: Option<OnHeader>,
    sink: Option<BodySink>,
    decoders: Option<Decoders>,
    decoder: Option<Box<dyn ContentDecoder>>,
    follow_redirects: bool,
    discard: bool,
    stall_timeout: Option<Duration>,
    /// Bytes arrived while this was at the head of the queue.
    started: bool,
    close_reason: SmallVec<[CloseReason; 4]>,
}

impl Responder {
    fn fail(&mut self, error: Error) {
        if let Some(reply) = self.reply.take() {
            reply.send(Err(error)).ok();
        }
    }
}

/// A request body held back until the server sends 100 Continue.
struct Gated {
    seq: u64,
    body: Body,
    writer: BodyWriter,
    stall_timeout: Option<Duration>,
    timer: Countdown,
}

enum Wake {
    Read(io::Result<usize>),
    Request(Option<Outgoing>),
    Control(Option<Control>),
    Stall,
    ContinueTimeout,
}

struct Connection<E> {
    id: u64,
    reader: ReadHalf<BoxStream>,
    writer: WriteHalf<BoxStream>,
    requests: mpsc::UnboundedReceiver<Outgoing>,
    control: mpsc::UnboundedReceiver<Control>,
    events: E,
    input: BytesMut,
    queue: VecDeque<Responder>,
    gated: Option<Gated>,
    stall: Countdown,
    stall_seq: Option<u64>,
    eof: bool,
    /// No more requests are taken.
    closing: bool,
    requests_closed: bool,
}

impl<E: ConnEvents> Connection<E> {
    async fn run(mut self) {
        if let Err(e) = self.run_loop().await {
            debug!("Connection {} failed: {}", self.id, e);
            self.fail_all(e);
        }

        self.close().await;
    }

    async fn run_loop(&mut self) -> Result<(), Error> {
        loop {
            let accept = self.gated.is_none() && !self.closing && !self.requests_closed;

            if self.requests_closed && self.queue.is_empty() {
                debug!("Connection {} no longer used", self.id);
                return Ok(());
            }

            let stall_deadline = self.stall.deadline();
            let continue_deadline = self.gated.as_ref().and_then(|g| g.timer.deadline());

            self.input.reserve(READ_SIZE);

            let wake = tokio::select! {
                r = self.reader.read_buf(&mut self.input), if !self.eof => Wake::Read(r),
                m = self.requests.recv(), if accept => Wake::Request(m),
                c = self.control.recv() => Wake::Control(c),
                _ = sleep_until_opt(stall_deadline) => Wake::Stall,
                _ = sleep_until_opt(continue_deadline) => Wake::ContinueTimeout,
            };

            match wake {
                Wake::Read(r) => {
                    let n = match r {
                        Ok(n) => n,
                        Err(e) if self.queue.is_empty() => {
                            debug!("Idle connection {} read error: {}", self.id, e);
                            return Ok(());
                        }
                        Err(e) => return Err(e.into()),
                    };

                    if n == 0 {
                        trace!("Connection {} EOF", self.id);
                        self.eof = true;
                    }

                    if self.queue.is_empty() {
                        if n > 0 {
                            warn!("Unexpected bytes on idle connection {}", self.id);
                        } else {
                            debug!("Idle connection {} closed by server", self.id);
                        }
                        return Ok(());
                    }

                    if let Some(head) = self.queue.front_mut() {
                        head.started = true;
                    }
                    self.stall.reset();

                    if !self.drive().await? {
                        return Ok(());
                    }
                }

                Wake::Request(Some(out)) => self.start(out).await?,

                Wake::Request(None) => {
                    self.requests_closed = true;
                }

                Wake::Control(Some(Control::Abort { seq, error })) => {
                    if self.queue.iter().any(|r| r.seq == seq) {
                        debug!("Abort request {} on connection {}: {}", seq, self.id, error);
                        return Err(error);
                    }
                    // Not written yet, or already done.
                    trace!("Abort of request {} not on the wire", seq);
                }

                Wake::Control(None) => {
                    // All handles are gone, which also closes requests.
                    self.requests_closed = true;
                    if self.queue.is_empty() {
                        return Ok(());
                    }
                    // Without control senders nobody can abort, keep reading.
                    self.drain_until_done().await?;
                    return Ok(());
                }

                Wake::Stall => return Err(Error::Stalled(self.stall_phase())),

                Wake::ContinueTimeout => {
                    debug!("No 100-continue in time, send body");
                    self.release_gated().await?;
                }
            }
        }
    }

    /// Read until the queue is empty, without listening to control/requests.
    async fn drain_until_done(&mut self) -> Result<(), Error> {
        while !self.queue.is_empty() {
            if self.gated.is_some() {
                self.release_gated().await?;
            }

            self.input.reserve(READ_SIZE);

            let stall_deadline = self.stall.deadline();
            let n = tokio::select! {
                r = self.reader.read_buf(&mut self.input), if !self.eof => r?,
                _ = sleep_until_opt(stall_deadline) => {
                    return Err(Error::Stalled(self.stall_phase()));
                }
            };

            if n == 0 {
                self.eof = true;
            }
            self.stall.reset();

            if !self.drive().await? {
                break;
            }
        }
        Ok(())
    }

    /// Write a new request.
    async fn start(&mut self, out: Outgoing) -> Result<(), Error> {
        if out.reply.is_closed() {
            // Cancelled before it reached the wire.
            trace!("Skip cancelled request {}", out.seq);
            self.events.released();
            return Ok(());
        }

        let Outgoing {
            seq,
            head,
            body,
            info,
            absolute,
            stall_timeout,
            continue_timeout,
            follow_redirects,
            on_header,
            decoders,
            reply,
        } = out;

        let mut close_reason = SmallVec::new();
        if head.version == Version::HTTP_10 && !head.headers.iter().has("connection", "keep-alive") {
            close_reason.push(CloseReason::Http10);
        }
        if head.headers.iter().has("connection", "close") {
            close_reason.push(CloseReason::ClientConnectionClose);
            // Nothing can follow this request.
            self.closing = true;
        }

        debug!("Send {} {} on connection {}", head.method, head.uri, self.id);

        let mut buf = Vec::with_capacity(1024);
        write_prelude(&head, absolute, &mut buf);

        let responder = Responder {
            seq,
            parser: ResponseParser::new(head.method.clone(), info.expect_continue),
            request: head,
            response: None,
            body: BytesMut::new(),
            reply: Some(reply),
            on_header,
            sink: None,
            decoders,
            decoder: None,
            follow_redirects,
            discard: false,
            stall_timeout,
            started: false,
            close_reason,
        };

        // Queued before writing, so a failed write fails this one too.
        self.queue.push_back(responder);

        if info.expect_continue {
            self.write_all(&buf, stall_timeout).await?;

            let mut timer = Countdown::new(continue_timeout);
            timer.start();

            self.gated = Some(Gated {
                seq,
                body,
                writer: info.writer,
                stall_timeout,
                timer,
            });
        } else {
            self.write_body(buf, body, info.writer, stall_timeout).await?;
        }

        self.arm_stall();

        Ok(())
    }

    async fn write_body(
        &mut self,
        mut buf: Vec<u8>,
        body: Body,
        mut writer: BodyWriter,
        stall_timeout: Option<Duration>,
    ) -> Result<(), Error> {
        match body {
            Body::Empty => {}
            Body::Bytes(v) => writer.write(&v, &mut buf)?,
            Body::Generator(mut f) => {
                while let Some(chunk) = f() {
                    writer.write(&chunk, &mut buf)?;
                    if buf.len() >= WRITE_SIZE {
                        self.write_all(&buf, stall_timeout).await?;
                        buf.clear();
                    }
                }
            }
        }

        writer.finish(&mut buf)?;

        self.write_all(&buf, stall_timeout).await
    }

    async fn write_all(&mut self, buf: &[u8], stall_timeout: Option<Duration>) -> Result<(), Error> {
        let mut timer = Countdown::new(stall_timeout);
        timer.start();

        let mut pos = 0;
        while pos < buf.len() {
            let deadline = timer.deadline();
            let n = tokio::select! {
                r = self.writer.write(&buf[pos..]) => r?,
                _ = sleep_until_opt(deadline) => return Err(Error::Stalled("writing request")),
            };

            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }

            pos += n;
            timer.reset();
        }

        let deadline = timer.deadline();
        tokio::select! {
            r = self.writer.flush() => r?,
            _ = sleep_until_opt(deadline) => return Err(Error::Stalled("writing request")),
        }

        trace!("Wrote {} bytes on connection {}", buf.len(), self.id);

        Ok(())
    }

    /// Send the body held back for 100-continue.
    async fn release_gated(&mut self) -> Result<(), Error> {
        let Some(gated) = self.gated.take() else {
            return Ok(());
        };

        if let Some(r) = self.queue.iter_mut().find(|r| r.seq == gated.seq) {
            r.parser.stop_gating();
        }

        self.write_body(Vec::new(), gated.body, gated.writer, gated.stall_timeout)
            .await
    }

    /// Feed buffered input to the responders.
    ///
    /// Returns false when the connection is to be closed.
    async fn drive(&mut self) -> Result<bool, Error> {
        loop {
            let Some(head) = self.queue.front_mut() else {
                break;
            };

            let ev = head.parser.parse(&mut self.input, self.eof)?;

            match ev {
                Event::NeedMore => break,

                Event::Continue => {
                    trace!("Got 100-continue");
                    self.release_gated().await?;
                }

                Event::Provisional(_) => {}

                Event::Head(h) => self.on_head(h),

                Event::Data(v) => self.on_data(v)?,

                Event::End => {
                    if !self.finish()? {
                        return Ok(false);
                    }
                }
            }
        }

        if self.queue.is_empty() && self.gated.is_none() {
            if self.eof {
                return Ok(false);
            }

            if !self.input.is_empty() {
                warn!("Unexpected bytes after response on connection {}", self.id);
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn on_head(&mut self, head: ResponseHead) {
        let gated_seq = self.gated.as_ref().map(|g| g.seq);

        let Some(r) = self.queue.front_mut() else {
            return;
        };

        if gated_seq == Some(r.seq) {
            // https://curl.se/mail/lib-2004-08/0002.html
            // A final answer before the body was sent. The body is never sent
            // and the connection can't be reused.
            debug!("Response before 100-continue, drop body");
            self.gated = None;
            r.close_reason.push(CloseReason::Not100Continue);
        }

        let keep_alive = head.headers.iter().has("connection", "keep-alive");
        let server_close = head.headers.iter().has("connection", "close");

        if head.version == Version::HTTP_10 && !keep_alive {
            r.close_reason.push(CloseReason::Http10);
        }
        if server_close {
            r.close_reason.push(CloseReason::ServerConnectionClose);
        }
        if r.parser.body_reader().is_some_and(|b| b.is_close_delimited()) {
            r.close_reason.push(CloseReason::CloseDelimitedBody);
        }

        let closing = !r.close_reason.is_empty();

        let learned = Learned {
            pipeline_ok: head.version == Version::HTTP_11 && !closing,
            max_in_flight: head.headers.keep_alive_max(),
            closing,
        };

        let response = Response::new(head, r.request.clone());

        r.discard = r.follow_redirects
            && response.status.is_location_redirect()
            && response.headers.contains_key("location")
            && will_follow(&r.request.method, response.status);

        if !r.discard {
            if let Some(d) = &r.decoders {
                r.decoder = match d.for_response(&response.headers) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("{}, body not decoded", e);
                        None
                    }
                };
            }

            if let Some(on_header) = &r.on_header {
                r.sink = Some(on_header(&response));
            }
        }

        r.response = Some(response);

        if closing {
            self.closing = true;
        }

        self.events.learned(learned);
    }

    fn on_data(&mut self, data: Bytes) -> Result<(), Error> {
        let Some(r) = self.queue.front_mut() else {
            return Ok(());
        };

        trace!("Body data: {}", data.len());

        if r.discard {
            return Ok(());
        }

        let data = match &mut r.decoder {
            Some(d) => d.decode(&data)?,
            None => data,
        };

        if data.is_empty() {
            return Ok(());
        }

        match &mut r.sink {
            Some(sink) => sink(Some(data)),
            None => r.body.extend_from_slice(&data),
        }

        Ok(())
    }

    /// The head response is complete. Returns false if the connection must close.
    fn finish(&mut self) -> Result<bool, Error> {
        let Some(mut r) = self.queue.pop_front() else {
            return Ok(true);
        };

        if let Some(d) = &mut r.decoder {
            let last = d.finish()?;
            if !last.is_empty() {
                match &mut r.sink {
                    Some(sink) => sink(Some(last)),
                    None => r.body.extend_from_slice(&last),
                }
            }
        }

        if let Some(sink) = &mut r.sink {
            sink(None);
        }

        if let (Some(mut response), Some(reply)) = (r.response.take(), r.reply.take()) {
            response.body = r.body.split().freeze();
            debug!(
                "Response {} for request {} on connection {}",
                response.status, r.seq, self.id
            );
            reply.send(Ok(response)).ok();
        }

        self.events.released();
        self.arm_stall();

        if let Some(reason) = r.close_reason.first() {
            debug!("Close connection {}: {}", self.id, reason.explain());
            return Ok(false);
        }

        Ok(true)
    }

    /// Point the stall countdown at the head of the queue.
    fn arm_stall(&mut self) {
        match self.queue.front() {
            Some(r) if self.stall_seq != Some(r.seq) => {
                self.stall_seq = Some(r.seq);
                self.stall = Countdown::new(r.stall_timeout);
                self.stall.start();
            }
            Some(_) => {}
            None => {
                self.stall_seq = None;
                self.stall.stop();
            }
        }
    }

    fn stall_phase(&self) -> &'static str {
        match self.queue.front() {
            Some(r) if r.parser.is_header() && !r.started => "waiting for response",
            Some(r) if r.parser.is_header() => "receiving header",
            Some(_) => "receiving body",
            None => "waiting for response",
        }
    }

    /// Fail every queued request, in order.
    fn fail_all(&mut self, error: Error) {
        self.gated = None;
        for mut r in self.queue.drain(..) {
            trace!("Fail request {}: {}", r.seq, error);
            r.fail(error.clone());
        }
    }

    async fn close(mut self) {
        if !self.queue.is_empty() {
            self.fail_all(Error::ConnectionClosed);
        }

        self.events.closed();

        // Requests that raced the close never reached the wire.
        self.requests.close();
        while let Ok(out) = self.requests.try_recv() {
            out.reply.send(Err(Error::ConnectionClosed)).ok();
        }

        self.writer.shutdown().await.ok();

        debug!("Connection {} closed", self.id);
    }
}
