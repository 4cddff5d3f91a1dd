//! Logging adapters for failures the orchestrator tolerates.
//!
//! A periodic job whose cycle fails logs the error with the job name and
//! reports no work done, so the next tick runs as usual. A lookup that finds
//! nothing where something was expected logs a warning and yields `None`.

use std::fmt::Display;
use std::panic::Location;

pub trait CycleResultExt<T> {
    /// Log a failed cycle of `job` and turn it into `None`.
    fn or_log_cycle(self, job: &'static str) -> Option<T>;
}

impl<T, E: Display> CycleResultExt<T> for Result<T, E> {
    #[track_caller]
    fn or_log_cycle(self, job: &'static str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(
                    target: "orchestrator_core",
                    job,
                    error = %e,
                    location = %Location::caller(),
                    "Periodic job cycle failed"
                );
                None
            }
        }
    }
}

pub trait MissingExt<T> {
    /// Warn that `what` was expected but not found.
    fn log_missing<W: Display>(self, what: W) -> Option<T>;
}

impl<T> MissingExt<T> for Option<T> {
    #[track_caller]
    fn log_missing<W: Display>(self, what: W) -> Option<T> {
        if self.is_none() {
            tracing::warn!(
                target: "orchestrator_core",
                missing = %what,
                location = %Location::caller(),
                "Expected record not found"
            );
        }
        self
    }
}
