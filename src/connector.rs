//! Outer reconnect loop.
//!
//! Dials the orchestrator until it answers, hands the connection to
//! [`session::run`], and dials again when the session ends with an error.
//! Failed dials back off exponentially (250 ms doubling up to 16 s by
//! default), and a session that ended on a failed command waits one backoff
//! step before redialing. Identical consecutive dial errors are logged once, and backoff
//! notices stop once the cap is reached, so an agent left running against a
//! dead orchestrator does not flood its log.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::config::Config;
use crate::process::ProcessControl;
use crate::session::{self, Client, SessionError};

/// Log line to emit after a backoff step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffNotice {
    RetryingIn(Duration),
    /// Emitted once when the cap is reached.
    RetryingEvery(Duration),
}

/// Exponential backoff between dial attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Back to the initial delay after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Register a failed attempt: double the delay (clamped to the cap) and
    /// return how long to sleep, plus a notice while the delay still grows.
    pub fn fail(&mut self) -> (Duration, Option<BackoffNotice>) {
        if self.current >= self.max {
            return (self.current, None);
        }
        self.current = (self.current * 2).min(self.max);
        let notice = if self.current < self.max {
            BackoffNotice::RetryingIn(self.current)
        } else {
            BackoffNotice::RetryingEvery(self.max)
        };
        (self.current, Some(notice))
    }
}

/// Remembers the last logged error so repeats can be suppressed.
#[derive(Debug, Default)]
pub struct ErrorDedup {
    last: Option<String>,
}

impl ErrorDedup {
    /// True if `message` differs from the previous one (and remembers it).
    pub fn is_new(&mut self, message: &str) -> bool {
        if self.last.as_deref() == Some(message) {
            return false;
        }
        self.last = Some(message.to_string());
        true
    }

    pub fn clear(&mut self) {
        self.last = None;
    }
}

/// Dials `address:port` with backoff and runs sessions on the result.
pub struct Connector {
    address: String,
    port: u16,
    backoff: Backoff,
    errors: ErrorDedup,
}

impl Connector {
    pub fn new(config: &Config) -> Self {
        Self {
            address: config.server.address.clone(),
            port: config.port(),
            backoff: Backoff::new(config.backoff.initial(), config.backoff.max()),
            errors: ErrorDedup::default(),
        }
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Dial until a connection succeeds.
    pub async fn connect(&mut self) -> TcpStream {
        loop {
            match TcpStream::connect((self.address.as_str(), self.port)).await {
                Ok(stream) => {
                    self.backoff.reset();
                    self.errors.clear();
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY: {e}");
                    }
                    return stream;
                }
                Err(e) => {
                    let message = e.to_string();
                    if self.errors.is_new(&message) {
                        warn!("{message}");
                    }
                    let (delay, notice) = self.backoff.fail();
                    match notice {
                        Some(BackoffNotice::RetryingIn(d)) => {
                            info!("Failed to connect, retrying in {d:?}");
                        }
                        Some(BackoffNotice::RetryingEvery(d)) => {
                            info!("Failed to connect, retrying every {}s", d.as_secs());
                        }
                        None => {}
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Connect, run a session, repeat, until the orchestrator sends `shutdown`.
    pub async fn run<C: ProcessControl>(&mut self, client: &mut Client<C>) {
        info!(address = %self.address, port = self.port, "Connecting to server");
        while client.is_running() {
            let stream = self.connect().await;
            info!("Connected");
            match session::run(client, stream).await {
                Ok(()) => break,
                Err(e @ SessionError::Command { .. }) => {
                    warn!("{e}");
                    // One backoff step before redialing after a failed command
                    let (delay, _) = self.backoff.fail();
                    info!("Reconnecting in {delay:?}...");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!("{e}");
                    info!("Reconnecting...");
                }
            }
        }
        info!(state = %client.state(), "Connector stopped");
    }
}
