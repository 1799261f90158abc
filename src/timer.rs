use std::future;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};

/// One-shot countdown.
///
/// The countdown holds no timer of its own, only a deadline. Racing against
/// it is done by awaiting [`sleep_until_opt`] with [`Countdown::deadline`].
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Countdown {
    duration: Option<Duration>,
    deadline: Option<Instant>,
}

impl Countdown {
    /// A countdown of `duration`. `None` never fires.
    pub fn new(duration: Option<Duration>) -> Self {
        Countdown {
            duration,
            deadline: None,
        }
    }

    pub fn start(&mut self) {
        if let Some(d) = self.duration {
            self.deadline = Some(Instant::now() + d);
        }
    }

    /// Restart a running countdown. A stopped one stays stopped.
    pub fn reset(&mut self) {
        if self.deadline.is_some() {
            self.start();
        }
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Sleep until the deadline, or forever without one.
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => future::pending().await,
    }
}
