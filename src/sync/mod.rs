//! Helpers for waiting on channels with a deadline.
pub mod oneshot;

use std::{future::Future, time::Duration};

use thiserror::Error;

/// Why a [TimeoutReceiver::recv_timeout] call returned without a value
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReceiveTimeoutError {
    #[error("no reply before the deadline")]
    Timeout,
    #[error("sender dropped before replying")]
    Closed,
}

/// Receivers that give up after a deadline. Used for replies that the
/// hardware may never send.
pub trait TimeoutReceiver<T> {
    fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<T, ReceiveTimeoutError>> + Send;
}
