//! Exponential-backoff retry.
//!
//! `Retry` re-invokes a future factory until it succeeds, the attempt
//! budget is spent, or the error is classified non-retryable. Both the
//! dispatcher's per-request retry and the discovery scan loop are built
//! on it; the scan loop additionally wraps its retry in a circuit breaker.

use std::time::Duration;

use futures::{Async, Future, Poll};
use futures::future::Either;
use tokio_timer::{Sleep, Timer};

use error::Error;

mod breaker;

pub use self::breaker::{Breaker, CircuitState};

/// Message fragments that mark an error as permanently failed.
const NON_RETRYABLE: &'static [&'static str] = &["invalid payload",
                                                 "malformed request",
                                                 "authentication failed",
                                                 "permission denied",
                                                 "parsing failed"];

/// Message fragments that mark an error as a known transient category.
const TRANSIENT: &'static [&'static str] =
    &["no nodes", "node not found", "connection", "timeout", "unavailable", "temporary"];

/// An error is retryable unless its message marks it permanently failed;
/// the known transient categories are always retryable.
pub fn is_retryable(e: &Error) -> bool {
    let msg = format!("{}", e);
    if NON_RETRYABLE.iter().any(|frag| msg.contains(frag)) {
        return false;
    }
    if TRANSIENT.iter().any(|frag| msg.contains(frag)) {
        return true;
    }
    true
}

/// Transience test for discovery scans: resolver hiccups and network
/// timeouts are worth retrying, anything else surfaces immediately.
pub fn is_scan_transient(e: &Error) -> bool {
    let msg = format!("{}", e);
    ["timeout", "connection", "resolver"].iter().any(|frag| msg.contains(frag))
}

#[derive(Clone, Debug)]
pub struct Backoff {
    pub max_attempts: usize,
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Backoff {
    pub fn new(max_attempts: usize,
               initial: Duration,
               max: Duration,
               multiplier: f64)
               -> Backoff {
        Backoff {
            max_attempts: max_attempts,
            initial: initial,
            max: max,
            multiplier: multiplier,
        }
    }

    /// Delay before retry number `retries` (1-based), exponentially grown
    /// and capped.
    pub fn delay(&self, retries: usize) -> Duration {
        let base = millis(&self.initial) as f64;
        let exp = self.multiplier.powi(retries as i32 - 1);
        let capped = (base * exp).min(millis(&self.max) as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Default for Backoff {
    fn default() -> Backoff {
        Backoff::new(3,
                     Duration::from_millis(500),
                     Duration::from_secs(5),
                     2.0)
    }
}

fn millis(d: &Duration) -> u64 {
    d.as_secs() * 1_000 + (d.subsec_nanos() / 1_000_000) as u64
}

pub type AttemptFuture<T> = Box<Future<Item = T, Error = Error>>;

/// Bounds a future by a wall-clock deadline. `what` names the awaited
/// thing in the resulting timeout message.
pub fn with_deadline<F>(timer: &Timer,
                        duration: Duration,
                        what: &'static str,
                        f: F)
                        -> AttemptFuture<F::Item>
    where F: Future<Error = Error> + 'static,
          F::Item: 'static
{
    let sleep = timer.sleep(duration);
    Box::new(f.select2(sleep).then(move |res| match res {
        Ok(Either::A((v, _))) => Ok(v),
        Ok(Either::B(((), _))) => Err(Error::Timeout(what)),
        Err(Either::A((e, _))) => Err(e),
        Err(Either::B((e, _))) => Err(Error::from(e)),
    }))
}

/// Retries a factory-produced future with exponential backoff.
pub struct Retry<T> {
    timer: Timer,
    backoff: Backoff,
    mk: Box<FnMut() -> AttemptFuture<T>>,
    retryable: fn(&Error) -> bool,
    attempt: usize,
    state: State<T>,
}

enum State<T> {
    Pending(AttemptFuture<T>),
    Sleeping(Sleep),
}

impl<T> Retry<T> {
    pub fn new<F>(timer: &Timer,
                  backoff: Backoff,
                  retryable: fn(&Error) -> bool,
                  mut mk: F)
                  -> Retry<T>
        where F: FnMut() -> AttemptFuture<T> + 'static
    {
        let first = mk();
        Retry {
            timer: timer.clone(),
            backoff: backoff,
            mk: Box::new(mk),
            retryable: retryable,
            attempt: 1,
            state: State::Pending(first),
        }
    }
}

impl<T> Future for Retry<T> {
    type Item = T;
    type Error = Error;

    fn poll(&mut self) -> Poll<T, Error> {
        loop {
            let next = match self.state {
                State::Pending(ref mut fut) => {
                    match fut.poll() {
                        Ok(Async::Ready(v)) => return Ok(Async::Ready(v)),
                        Ok(Async::NotReady) => return Ok(Async::NotReady),
                        Err(e) => {
                            if self.attempt >= self.backoff.max_attempts ||
                               !(self.retryable)(&e) {
                                return Err(e);
                            }
                            let delay = self.backoff.delay(self.attempt);
                            debug!("attempt {} failed ({}), retrying in {:?}",
                                   self.attempt,
                                   e,
                                   delay);
                            State::Sleeping(self.timer.sleep(delay))
                        }
                    }
                }
                State::Sleeping(ref mut sleep) => {
                    match sleep.poll() {
                        Ok(Async::Ready(())) => {
                            self.attempt += 1;
                            State::Pending((self.mk)())
                        }
                        Ok(Async::NotReady) => return Ok(Async::NotReady),
                        Err(e) => return Err(Error::from(e)),
                    }
                }
            };
            self.state = next;
        }
    }
}
