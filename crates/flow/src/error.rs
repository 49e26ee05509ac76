//! Workflow engine errors.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FlowError {
    /// The bounded event queue rejected a publish.
    #[error("event queue is full")]
    QueueFull,

    /// The engine is not accepting events.
    #[error("workflow engine is not running")]
    NotRunning,

    /// `start` was called on a running engine.
    #[error("workflow engine is already running")]
    AlreadyRunning,

    /// No workflow registered under this name.
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),
}
