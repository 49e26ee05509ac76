#![doc = include_str!("../README.md")]

/// Helper macro to execute a system call that returns an `io::Result`.
//
// Macro must be defined before any modules that use it.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

mod acceptor;
mod addr;
mod buffer;
mod channel;
mod connection;
mod error;
mod event_loop;
mod interest;
mod poller;
mod server;
mod socket;

pub use acceptor::Acceptor;
pub use addr::Address;
pub use buffer::Buffer;
pub use channel::{Channel, ChannelRef};
pub use connection::{
    ConnState, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback,
};
pub use error::Error;
pub use event_loop::{EventLoop, LoopHandle, TimerId};
pub use interest::{Interest, Ready};
pub use poller::Poller;
pub use server::{ServerHandle, ServerStats, TcpServer};
pub use socket::Socket;

pub type Result<T> = std::result::Result<T, Error>;
