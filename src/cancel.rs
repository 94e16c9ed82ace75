use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// cooperative cancellation flag shared between a caller and a running operation
///
/// operations check it between object writes, never in the middle of hashing.
#[derive(Clone, Debug, Default)]
pub struct Cancellable {
    flag: Arc<AtomicBool>,
}

impl Cancellable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Err(Cancelled) once cancel() has been called
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// check an optional token
pub(crate) fn check(cancel: Option<&Cancellable>) -> Result<()> {
    match cancel {
        Some(c) => c.check(),
        None => Ok(()),
    }
}
