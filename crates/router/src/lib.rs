#![doc = include_str!("../README.md")]

mod channel;
mod error;
mod filter;
pub mod frame;
mod manager;
mod message;
mod transport;

pub use channel::{Channel, ChannelKind, ChannelStats};
pub use error::RouterError;
pub use filter::{ClosureFilter, MessageFilter, MinPriorityFilter, SenderFilter, TopicFilter};
pub use frame::{FrameError, FrameHeader};
pub use manager::{ChannelManager, RouterStats};
pub use message::ChannelMessage;
pub use transport::{InprocTransport, Transport};

pub type Result<T> = std::result::Result<T, RouterError>;
