//! Connection pool.
//!
//! Connections are grouped per [`ConnKey`]. A request acquires a [`Lease`] on
//! a connection, which reserves one in-flight slot. The slot is given back
//! when the connection reports the response done, or when an unused lease
//! is dropped.
//!
//! Admission for a key, in order of preference:
//!
//! 1. An idle connection.
//! 2. A connection known to pipeline, with spare in-flight capacity.
//! 3. A new connection, if below the per-host limit.
//! 4. Wait in the FIFO queue for the key.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};

use crate::conn::{self, ConnEvents, ConnHandle, Control, Learned, Outgoing};
use crate::connect::{Connect, Target};
use crate::ext::HeaderIterExt;
use crate::{Error, Response};

/// Pool key. The effective connect target (the proxy, if one is used).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ConnKey {
    pub host: String,
    pub port: u16,
}

impl From<&Target> for ConnKey {
    fn from(t: &Target) -> Self {
        ConnKey {
            host: t.host.clone(),
            port: t.port,
        }
    }
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PoolPolicy {
    /// 0 is unlimited.
    pub max_connections_per_host: usize,
    /// 0 is unlimited.
    pub max_in_flight: usize,
    pub pipeline: bool,
}

#[derive(Clone)]
pub(crate) struct Pool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    inner: Mutex<PoolInner>,
    connector: Arc<dyn Connect>,
    policy: PoolPolicy,
    seq: AtomicU64,
}

#[derive(Default)]
struct PoolInner {
    entries: HashMap<ConnKey, PoolEntry>,
    next_id: u64,
}

struct PoolEntry {
    target: Target,
    conns: Vec<Slot>,
    waiters: VecDeque<Waiter>,
    /// Connects in progress.
    connecting: usize,
    /// Waiters that triggered the connects in progress.
    attempts: Vec<u64>,
}

struct Slot {
    id: u64,
    handle: ConnHandle,
    reserved: usize,
    /// Not known until the first response header.
    pipeline_ok: bool,
    /// Cap from Keep-Alive max, if smaller than the policy.
    max_in_flight: usize,
    closing: bool,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<Lease, Error>>,
}

impl Pool {
    pub fn new(connector: Arc<dyn Connect>, policy: PoolPolicy) -> Self {
        Pool {
            shared: Arc::new(PoolShared {
                inner: Mutex::new(PoolInner::default()),
                connector,
                policy,
                seq: AtomicU64::new(1),
            }),
        }
    }

    /// Sequence number for a new request.
    pub fn next_seq(&self) -> u64 {
        self.shared.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Get a connection for the target.
    pub async fn acquire(&self, target: &Target) -> Result<Lease, Error> {
        let key = ConnKey::from(target);

        let rx = {
            let mut inner = self.shared.lock();
            let waiter_id = inner.next_id();
            let policy = self.shared.policy;

            let entry = inner
                .entries
                .entry(key.clone())
                .or_insert_with(|| PoolEntry::new(target.clone()));

            // Waiters already queued go first.
            if entry.waiters.is_empty() {
                if let Some(idx) = entry.admit_index(&policy) {
                    let slot = &entry.conns[idx];
                    debug!("Reuse connection {} to {}", slot.id, key);
                    return Ok(entry.lease(idx, &key, &self.shared));
                }
            }

            let (tx, rx) = oneshot::channel();
            entry.waiters.push_back(Waiter { id: waiter_id, tx });

            trace!("Queue waiter {} for {}", waiter_id, key);

            // Waiters ahead of this one may be gone.
            self.shared.drain(&mut inner, &key);

            rx
        };

        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    #[cfg(test)]
    pub fn connection_count(&self, target: &Target) -> usize {
        let inner = self.shared.lock();
        inner
            .entries
            .get(&ConnKey::from(target))
            .map(|e| e.conns.len())
            .unwrap_or(0)
    }
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // A panic while holding the lock leaves the pool usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a connect if there are more waiters than connects in progress.
    fn maybe_connect(self: &Arc<Self>, entry: &mut PoolEntry, key: &ConnKey, policy: &PoolPolicy) {
        entry.waiters.retain(|w| !w.tx.is_closed());

        if entry.waiters.len() <= entry.connecting || !entry.can_open(policy) {
            return;
        }

        let Some(waiter_id) = entry
            .waiters
            .iter()
            .map(|w| w.id)
            .find(|id| !entry.attempts.contains(id))
        else {
            return;
        };

        entry.connecting += 1;
        entry.attempts.push(waiter_id);

        debug!("Open connection to {} for waiter {}", entry.target, waiter_id);

        let shared = Arc::clone(self);
        let key = key.clone();
        let target = entry.target.clone();

        tokio::spawn(async move {
            let result = shared.connector.connect(&target).await;
            shared.connected(key, waiter_id, result);
        });
    }

    fn connected(
        self: &Arc<Self>,
        key: ConnKey,
        waiter_id: u64,
        result: Result<crate::connect::BoxStream, Error>,
    ) {
        let mut inner = self.lock();
        let id = inner.next_id();
        let policy = self.policy;

        let Some(entry) = inner.entries.get_mut(&key) else {
            return;
        };

        entry.connecting = entry.connecting.saturating_sub(1);
        entry.attempts.retain(|a| *a != waiter_id);

        match result {
            Ok(stream) => {
                let events = PoolRef {
                    shared: Arc::downgrade(self),
                    key: key.clone(),
                    id,
                };

                let handle = conn::spawn(id, stream, events);

                entry.conns.push(Slot {
                    id,
                    handle,
                    reserved: 0,
                    pipeline_ok: false,
                    max_in_flight: policy.max_in_flight,
                    closing: false,
                });

                debug!("Connection {} to {} ready", id, key);
            }
            Err(e) => {
                warn!("Connect to {} failed: {}", key, e);

                // Only the waiter that caused this connect gets the error.
                if let Some(pos) = entry.waiters.iter().position(|w| w.id == waiter_id) {
                    if let Some(w) = entry.waiters.remove(pos) {
                        w.tx.send(Err(e)).ok();
                    }
                }
            }
        }

        self.drain(&mut inner, &key);
    }

    /// Hand out leases to queued waiters while capacity allows.
    fn drain(self: &Arc<Self>, inner: &mut PoolInner, key: &ConnKey) {
        let policy = self.policy;

        let Some(entry) = inner.entries.get_mut(key) else {
            return;
        };

        while let Some(front) = entry.waiters.front() {
            if front.tx.is_closed() {
                entry.waiters.pop_front();
                continue;
            }

            let Some(idx) = entry.admit_index(&policy) else {
                break;
            };

            let Some(waiter) = entry.waiters.pop_front() else {
                break;
            };

            let lease = entry.lease(idx, key, self);

            trace!("Admit waiter {} on connection {}", waiter.id, lease.conn_id);

            if let Err(Ok(mut lease)) = waiter.tx.send(Ok(lease)) {
                // The waiter went away. Undo here, since dropping an armed
                // lease would take the lock again.
                lease.armed = false;
                entry.conns[idx].reserved -= 1;
            }
        }

        self.maybe_connect(entry, key, &policy);

        if entry.is_unused() {
            inner.entries.remove(key);
        }
    }

    fn with_slot<F>(self: &Arc<Self>, key: &ConnKey, id: u64, f: F)
    where
        F: FnOnce(&mut Slot),
    {
        let mut inner = self.lock();

        if let Some(slot) = inner
            .entries
            .get_mut(key)
            .and_then(|e| e.conns.iter_mut().find(|s| s.id == id))
        {
            f(slot);
        }

        self.drain(&mut inner, key);
    }
}

impl PoolEntry {
    fn new(target: Target) -> Self {
        PoolEntry {
            target,
            conns: Vec::new(),
            waiters: VecDeque::new(),
            connecting: 0,
            attempts: Vec::new(),
        }
    }

    fn can_open(&self, policy: &PoolPolicy) -> bool {
        let max = policy.max_connections_per_host;
        max == 0 || self.conns.len() + self.connecting < max
    }

    /// Index of the connection to admit a new request on.
    fn admit_index(&self, policy: &PoolPolicy) -> Option<usize> {
        let idle = self
            .conns
            .iter()
            .position(|s| !s.closing && s.reserved == 0);

        if idle.is_some() {
            return idle;
        }

        if !policy.pipeline {
            return None;
        }

        self.conns.iter().position(|s| {
            !s.closing && s.pipeline_ok && (s.max_in_flight == 0 || s.reserved < s.max_in_flight)
        })
    }

    fn lease(&mut self, idx: usize, key: &ConnKey, shared: &Arc<PoolShared>) -> Lease {
        let slot = &mut self.conns[idx];
        slot.reserved += 1;

        Lease {
            shared: Arc::downgrade(shared),
            key: key.clone(),
            conn_id: slot.id,
            handle: slot.handle.clone(),
            armed: true,
        }
    }

    fn is_unused(&self) -> bool {
        self.conns.is_empty() && self.waiters.is_empty() && self.connecting == 0
    }
}

impl PoolInner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// A connection's way back into the pool.
struct PoolRef {
    shared: Weak<PoolShared>,
    key: ConnKey,
    id: u64,
}

impl ConnEvents for PoolRef {
    fn learned(&self, learned: Learned) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        if learned.pipeline_ok {
            trace!("Connection {} can pipeline", self.id);
        }

        shared.with_slot(&self.key, self.id, |slot| {
            slot.pipeline_ok = learned.pipeline_ok;
            slot.closing |= learned.closing;

            if let Some(cap) = learned.max_in_flight {
                // Only limits new admissions.
                let cap = cap.max(1);
                if slot.max_in_flight == 0 || cap < slot.max_in_flight {
                    debug!("Connection {} capped at {} in flight", slot.id, cap);
                    slot.max_in_flight = cap;
                }
            }
        });
    }

    fn released(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        shared.with_slot(&self.key, self.id, |slot| {
            slot.reserved = slot.reserved.saturating_sub(1);
        });
    }

    fn closed(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        let mut inner = shared.lock();

        if let Some(entry) = inner.entries.get_mut(&self.key) {
            entry.conns.retain(|s| s.id != self.id);
            debug!("Connection {} removed from {}", self.id, self.key);
        }

        shared.drain(&mut inner, &self.key);
    }
}

/// A reserved slot on a connection.
///
/// Dropping the lease without sending gives the slot back.
pub(crate) struct Lease {
    shared: Weak<PoolShared>,
    key: ConnKey,
    conn_id: u64,
    handle: ConnHandle,
    armed: bool,
}

impl Lease {
    /// Hand the request to the connection.
    ///
    /// `rx` is the receiving end of the request's reply channel.
    pub fn send(mut self, out: Outgoing, rx: ReplyRx) -> ResponseFuture {
        let seq = out.seq;

        if out.head.headers.iter().has("connection", "close") {
            // Nothing more can go on this connection.
            self.mark_closing();
        }

        // The connection gives the slot back from here on.
        self.armed = false;

        if let Err(mpsc::error::SendError(out)) = self.handle.tx.send(out) {
            debug!("Connection {} went away before send", self.conn_id);
            self.armed = true;
            out.reply.send(Err(Error::ConnectionClosed)).ok();
        }

        ResponseFuture {
            seq,
            rx,
            ctl: self.handle.ctl.clone(),
            done: false,
        }
    }

    fn mark_closing(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        let mut inner = shared.lock();

        if let Some(slot) = inner
            .entries
            .get_mut(&self.key)
            .and_then(|e| e.conns.iter_mut().find(|s| s.id == self.conn_id))
        {
            slot.closing = true;
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        if let Some(shared) = self.shared.upgrade() {
            trace!("Unused lease on connection {}", self.conn_id);
            shared.with_slot(&self.key, self.conn_id, |slot| {
                slot.reserved = slot.reserved.saturating_sub(1);
            });
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("conn_id", &self.conn_id)
            .finish()
    }
}

pub(crate) type ReplyRx = oneshot::Receiver<Result<Response, Error>>;

/// The response to a sent request.
///
/// Dropping it before completion cancels the request.
pub(crate) struct ResponseFuture {
    seq: u64,
    rx: ReplyRx,
    ctl: mpsc::UnboundedSender<Control>,
    done: bool,
}

impl ResponseFuture {
    /// Fail the request with `error`. A request on the wire takes its
    /// connection down with it.
    pub fn abort(mut self, error: Error) {
        self.cancel(error);
    }

    fn cancel(&mut self, error: Error) {
        if self.done {
            return;
        }
        self.done = true;

        // Closed first, so the connection skips it if not yet written.
        self.rx.close();

        self.ctl
            .send(Control::Abort {
                seq: self.seq,
                error,
            })
            .ok();
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(r) => {
                this.done = true;
                Poll::Ready(r.unwrap_or(Err(Error::ConnectionClosed)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        self.cancel(Error::Cancelled);
    }
}
