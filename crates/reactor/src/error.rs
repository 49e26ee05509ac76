//! Reactor errors.

use std::io;

use thiserror::Error;

/// An error occurring in the reactor or the TCP server stack.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// An address outside the supported IPv4 family.
    #[error("address family not supported: {0}")]
    UnsupportedAddress(std::net::SocketAddr),

    /// The server was asked to start twice.
    #[error("server `{0}` is already started")]
    AlreadyStarted(String),
}
