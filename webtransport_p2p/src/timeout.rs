//! Generic timeout strategies.
//!
//! Lets the transport bound session readiness and (optionally) the handshake
//! without tying callers to one timer implementation.

use core::time::Duration;

use futures::{
    future::{select, BoxFuture, Either},
    FutureExt,
};
use futures_timer::Delay;
use thiserror::Error;

/// A trait for time-limiting futures.
pub trait Timeout: Clone + Send + Sync + 'static {
    /// Wrap a future with a timeout.
    fn timeout<'a, T: Send + 'a>(
        &'a self,
        dur: Duration,
        fut: BoxFuture<'a, T>,
    ) -> BoxFuture<'a, Result<T, TimedOut>>;
}

/// An error indicating that an operation has timed out.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, Hash)]
#[error("Operation timed out")]
pub struct TimedOut;

/// A timeout strategy using the [`futures-timer`] crate.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuturesTimerTimeout;

impl Timeout for FuturesTimerTimeout {
    fn timeout<'a, T: Send + 'a>(
        &'a self,
        dur: Duration,
        fut: BoxFuture<'a, T>,
    ) -> BoxFuture<'a, Result<T, TimedOut>> {
        async move {
            match select(fut, Delay::new(dur)).await {
                Either::Left((val, _delay)) => Ok(val),
                Either::Right(_) => Err(TimedOut),
            }
        }
        .boxed()
    }
}
