//! Operator-triggered task cancellation.

use tokio::sync::watch;

use crate::error::UpdateError;

/// Read side of the task-cancelled flag.
///
/// Long-running loops call [`Cancellation::checkpoint`] between waits.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A flag that is never raised.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Fails with [`UpdateError::Cancelled`] once the task was cancelled.
    pub fn checkpoint(&self) -> Result<(), UpdateError> {
        if self.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        Ok(())
    }
}
