#![doc = include_str!("../README.md")]

mod error;
mod event;
mod handler;
mod stack_flow;
mod workflow;

pub use error::FlowError;
pub use event::{Event, EventKind};
pub use handler::{ClosureHandler, EventHandler};
pub use stack_flow::{FlowStats, StackFlow};
pub use workflow::{StepKind, StepStatus, WorkflowStep};

pub type Result<T> = std::result::Result<T, FlowError>;
