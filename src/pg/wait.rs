//! Cooperative wait strategies.
//!
//! When a connection has a [`WaitHook`], blocking commands are issued
//! non-blocking and the hook is called every time the session needs the
//! socket to become readable or writable. The hook runs with the connection
//! mutex released and may switch to other work (a green thread, an event
//! loop) as long as it eventually returns.

use std::thread;

use super::wire::RawSocket;
use crate::error::Result;

/// What the session is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// A single blocking-or-yielding wait primitive.
pub trait WaitHook: Send + Sync {
    /// Return once `descriptor` is likely ready for `interest`.
    ///
    /// An error aborts the command in progress and closes the session.
    fn wait(&self, descriptor: Option<RawSocket>, interest: Interest) -> Result<()>;
}

/// Yield the current thread and retry.
#[derive(Debug, Default, Clone, Copy)]
pub struct YieldWait;

impl WaitHook for YieldWait {
    fn wait(&self, _descriptor: Option<RawSocket>, _interest: Interest) -> Result<()> {
        thread::yield_now();
        Ok(())
    }
}

impl<F> WaitHook for F
where
    F: Fn(Option<RawSocket>, Interest) -> Result<()> + Send + Sync,
{
    fn wait(&self, descriptor: Option<RawSocket>, interest: Interest) -> Result<()> {
        self(descriptor, interest)
    }
}
