//! Error types
use crate::*;
use std::backtrace::Backtrace;
use thiserror::Error;

/// Error currency of handlers and flows.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A captured handler (or task) failure.
///
/// The kernel never lets one of these abort dispatch: it is attached to the
/// event's [`Value`], fired as an `error` event, and as a `<name>_failure`
/// notice when the event opted in.
#[derive(Debug, Clone, Error)]
#[error("handler fault: {message}")]
pub struct Fault {
    message: String,
    detail: String,
    trace: Arc<str>,
    handler: Option<HandlerId>,
}

impl Fault {
    pub(crate) fn capture(error: BoxError, handler: Option<HandlerId>) -> Self {
        Self {
            message: error.to_string(),
            detail: format!("{error:?}"),
            trace: Backtrace::force_capture().to_string().into(),
            handler,
        }
    }

    /// The failure's display message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The failure's debug rendering.
    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// A backtrace captured where the failure was observed.
    pub fn trace(&self) -> &str {
        &self.trace
    }

    /// The handler the event was dispatching when the failure surfaced.
    pub fn handler(&self) -> Option<HandlerId> {
        self.handler
    }
}

/// Failure to hand the run loop to a thread or process.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The runner thread could not be spawned.
    #[error("failed to spawn runner thread: {0}")]
    Thread(#[from] std::io::Error),
    /// The runner process could not be forked.
    #[error("failed to fork runner process: {0}")]
    Process(#[from] nix::Error),
}
