use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::Request;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::client::{Client, Config};
use crate::connect::{BoxStream, Connect, ConnectFuture, Target};
use crate::request::Body;
use crate::Error;

/// One thing the scripted server does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Read a request header.
    Read,
    /// Read this many body bytes of the last request.
    ReadBody(usize),
    Write(&'static str),
    Sleep(Duration),
    /// Wait, recording any request bytes that arrive meanwhile.
    Quiet(Duration),
    /// Close the connection.
    Close,
}

pub use Step::*;

#[derive(Default)]
struct State {
    scripts: VecDeque<Vec<Step>>,
    failures: VecDeque<Error>,
    targets: Vec<Target>,
    requests: Vec<(usize, String)>,
    unexpected: Vec<(usize, Vec<u8>)>,
}

/// Connector handing out in-memory connections, each served by the next
/// queued script.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<State>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script for the next connection.
    pub fn script(&self, steps: Vec<Step>) -> &Self {
        self.state.lock().unwrap().scripts.push_back(steps);
        self
    }

    /// Fail the next connect attempt.
    pub fn fail_next(&self, error: Error) -> &Self {
        self.state.lock().unwrap().failures.push_back(error);
        self
    }

    pub fn client(&self, config: Config) -> Client {
        Client::with_connector(config, self.clone())
    }

    /// Every connect attempt, failed ones included.
    pub fn targets(&self) -> Vec<Target> {
        self.state.lock().unwrap().targets.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().targets.len()
    }

    /// Requests seen by the servers, tagged with the connection number.
    pub fn requests(&self) -> Vec<(usize, String)> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn request_lines(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|(_, r)| r.lines().next().unwrap_or_default().to_string())
            .collect()
    }

    /// Bytes received during a `Quiet` step.
    pub fn unexpected(&self) -> Vec<(usize, Vec<u8>)> {
        self.state.lock().unwrap().unexpected.clone()
    }
}

impl Connect for MockConnector {
    fn connect(&self, target: &Target) -> ConnectFuture {
        let mut state = self.state.lock().unwrap();

        let conn = state.targets.len();
        state.targets.push(target.clone());

        if let Some(error) = state.failures.pop_front() {
            return Box::pin(async move { Err(error) });
        }

        let steps = state.scripts.pop_front().unwrap_or_default();
        let (client, server) = tokio::io::duplex(64 * 1024);

        tokio::spawn(serve(conn, server, steps, self.state.clone()));

        Box::pin(async move { Ok(Box::new(client) as BoxStream) })
    }
}

async fn serve(conn: usize, mut stream: DuplexStream, steps: Vec<Step>, state: Arc<Mutex<State>>) {
    for step in steps {
        match step {
            Read => {
                let Some(head) = read_head(&mut stream).await else {
                    return;
                };
                state.lock().unwrap().requests.push((conn, head));
            }
            ReadBody(n) => {
                let mut buf = vec![0; n];
                if stream.read_exact(&mut buf).await.is_err() {
                    return;
                }
                let mut state = state.lock().unwrap();
                if let Some((_, r)) = state.requests.iter_mut().rev().find(|(c, _)| *c == conn) {
                    r.push_str(&String::from_utf8_lossy(&buf));
                }
            }
            Write(s) => {
                if stream.write_all(s.as_bytes()).await.is_err() {
                    return;
                }
            }
            Sleep(d) => tokio::time::sleep(d).await,
            Quiet(d) => {
                let mut buf = [0; 1024];
                if let Ok(Ok(n)) = tokio::time::timeout(d, stream.read(&mut buf)).await {
                    if n > 0 {
                        state.lock().unwrap().unexpected.push((conn, buf[..n].to_vec()));
                    }
                }
            }
            Close => return,
        }
    }

    // Hold the connection until the client lets go.
    let mut buf = [0; 1024];
    while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
}

async fn read_head(stream: &mut DuplexStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut b = [0; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut b).await.ok()?;
        buf.push(b[0]);
    }
    Some(String::from_utf8_lossy(&buf).to_string())
}

pub fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::Empty).unwrap()
}

pub fn post(uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::post(uri).body(body.into()).unwrap()
}

pub const OK: &str = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
