//! Scope-exit callbacks whose failures are logged, never propagated.

use crate::error::Result;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Run `callback`, logging an error or a panic instead of letting it escape.
///
/// Returns whether the callback completed successfully.
pub fn run_logged<F>(label: &str, callback: F) -> bool
where
    F: FnOnce() -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            tracing::error!(label, error = %err, "cleanup failed");
            false
        }
        Err(payload) => {
            tracing::error!(label, panic = panic_message(&*payload), "cleanup panicked");
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Runs a callback when dropped unless cancelled.
pub struct Deferred<F>
where
    F: FnOnce() -> Result<()>,
{
    label: &'static str,
    callback: Option<F>,
}

impl<F> Deferred<F>
where
    F: FnOnce() -> Result<()>,
{
    pub fn new(label: &'static str, callback: F) -> Self {
        Self {
            label,
            callback: Some(callback),
        }
    }

    /// Disarm the callback.
    pub fn cancel(mut self) {
        self.callback = None;
    }
}

impl<F> Drop for Deferred<F>
where
    F: FnOnce() -> Result<()>,
{
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            run_logged(self.label, callback);
        }
    }
}

impl<F> std::fmt::Debug for Deferred<F>
where
    F: FnOnce() -> Result<()>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("label", &self.label)
            .field("armed", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::cell::Cell;

    #[test]
    fn test_runs_on_drop() {
        let ran = Cell::new(false);
        {
            let _guard = Deferred::new("test", || {
                ran.set(true);
                Ok(())
            });
        }
        assert!(ran.get());
    }

    #[test]
    fn test_cancel_disarms() {
        let ran = Cell::new(false);
        let guard = Deferred::new("test", || {
            ran.set(true);
            Ok(())
        });
        guard.cancel();
        assert!(!ran.get());
    }

    #[test]
    fn test_errors_and_panics_are_swallowed() {
        assert!(!run_logged("err", || Err(Error::invalid_digest("boom"))));
        assert!(!run_logged("panic", || panic!("boom")));
        assert!(run_logged("ok", || Ok(())));

        // Dropping a guard whose callback fails must not propagate.
        drop(Deferred::new("err", || Err(Error::invalid_digest("boom"))));
    }
}
