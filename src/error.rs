//! Errors that carry meaning for the runner, as opposed to plain transport or I/O errors.

use failure_derive::Fail;

#[derive(Debug, Fail)]
pub enum RunnerError {
    /// Resources could not be acquired, or deploying them left nothing usable. Fatal.
    #[fail(display = "reservation failed: {}", reason)]
    ReservationFailure { reason: String },

    /// One combination could not be run. Only that combination is affected.
    #[fail(
        display = "combination {} failed while {}: {}",
        combination, stage, reason
    )]
    WorkerFailure {
        combination: String,
        stage: Stage,
        reason: String,
    },

    /// The reservation died while combinations were still left to run.
    #[fail(
        display = "reservation {} was lost with {} combinations remaining",
        job, remaining
    )]
    ReservationLost { job: String, remaining: usize },

    /// A `--param` value that could not be parsed.
    #[fail(display = "bad parameter specification: {:?}", spec)]
    BadParameter { spec: String },
}

/// The step of a worker's workflow that failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Stage {
    Staging,
    Executing,
    Collecting,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Stage::Staging => write!(f, "staging files"),
            Stage::Executing => write!(f, "executing"),
            Stage::Collecting => write!(f, "collecting results"),
        }
    }
}

impl RunnerError {
    pub fn reservation_failure<S: Into<String>>(reason: S) -> Self {
        RunnerError::ReservationFailure {
            reason: reason.into(),
        }
    }
}
