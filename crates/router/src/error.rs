//! Bus errors.

use thiserror::Error;

use crate::frame::FrameError;

#[derive(Error, Debug)]
pub enum RouterError {
    /// The named channel is not registered with the manager.
    #[error("channel `{0}` is not registered")]
    UnknownChannel(String),

    /// The channel exists but is deactivated.
    #[error("channel `{0}` is inactive")]
    Inactive(String),

    /// A channel with this name is already registered.
    #[error("channel `{0}` is already registered")]
    DuplicateChannel(String),

    /// A topic with no entry in the routing table.
    #[error("no route for topic `{0}`")]
    RoutingMiss(String),

    /// The channel's transport can no longer carry messages.
    #[error("transport `{0}` is closed")]
    TransportClosed(String),

    /// The transport cannot receive.
    #[error("transport `{0}` has no receive side")]
    ReceiveUnsupported(String),

    /// An inbound frame failed validation.
    #[error(transparent)]
    Frame(#[from] FrameError),
}
