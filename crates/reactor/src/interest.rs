//! Interest and readiness bit sets.
//!
//! Small hand-rolled sets: interest is what a [`Channel`](crate::Channel)
//! asks the poller to watch, readiness is what a poll reported back.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Interest in readiness events for a file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(READABLE);
    pub const WRITABLE: Interest = Interest(WRITABLE);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub fn insert(&mut self, other: Interest) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Interest) {
        self.0 &= !other.0;
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, other: Interest) {
        self.0 |= other.0;
    }
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => write!(f, "read|write"),
            (true, false) => write!(f, "read"),
            (false, true) => write!(f, "write"),
            (false, false) => write!(f, "none"),
        }
    }
}

/// Readiness reported by one poll for one file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready(u8);

const ERROR: u8 = 0b0100;
const HANGUP: u8 = 0b1000;

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(READABLE);
    pub const WRITABLE: Ready = Ready(WRITABLE);
    pub const ERROR: Ready = Ready(ERROR);
    pub const HANGUP: Ready = Ready(HANGUP);

    /// Translate an epoll event mask.
    pub(crate) fn from_epoll(events: u32) -> Ready {
        let mut ready = Ready::EMPTY;
        if events & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0 {
            ready |= Ready::READABLE;
        }
        if events & libc::EPOLLOUT as u32 != 0 {
            ready |= Ready::WRITABLE;
        }
        if events & libc::EPOLLERR as u32 != 0 {
            ready |= Ready::ERROR;
        }
        if events & libc::EPOLLHUP as u32 != 0 {
            ready |= Ready::HANGUP;
        }
        ready
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & ERROR != 0
    }

    pub fn is_hangup(self) -> bool {
        self.0 & HANGUP != 0
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_round_trip() {
        let mut interest = Interest::NONE;
        interest.insert(Interest::READABLE);
        interest.insert(Interest::WRITABLE);
        assert!(interest.is_readable() && interest.is_writable());

        interest.remove(Interest::WRITABLE);
        assert_eq!(interest, Interest::READABLE);

        interest.remove(Interest::READABLE);
        assert!(interest.is_empty());
    }

    #[test]
    fn epoll_translation() {
        let ready = Ready::from_epoll((libc::EPOLLIN | libc::EPOLLHUP) as u32);
        assert!(ready.is_readable());
        assert!(ready.is_hangup());
        assert!(!ready.is_writable());
        assert!(!ready.is_error());
    }
}
