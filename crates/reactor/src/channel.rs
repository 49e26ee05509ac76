//! Per-descriptor dispatch record.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::event_loop::EventLoop;
use crate::interest::{Interest, Ready};

/// Shared handle to a [`Channel`]. Channels live on the loop thread only.
pub type ChannelRef = Rc<RefCell<Channel>>;

type Callback = Box<dyn FnMut(&mut EventLoop)>;

/// Where the poller currently knows this channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollerState {
    /// Never registered, or fully removed.
    New,
    /// Registered with the kernel.
    Added,
    /// In the poller's map but deleted from the kernel (no interest).
    Detached,
}

/// A channel ties one file descriptor to the callbacks that should run
/// when it becomes ready.
///
/// A channel does not own its descriptor. It must be removed from its
/// loop before the descriptor is closed, and is only ever touched from
/// the loop thread.
pub struct Channel {
    fd: RawFd,
    interest: Interest,
    ready: Ready,
    state: PollerState,
    handling: bool,
    on_read: Option<Callback>,
    on_write: Option<Callback>,
    on_close: Option<Callback>,
    on_error: Option<Callback>,
}

impl Channel {
    pub fn new(fd: RawFd) -> ChannelRef {
        Rc::new(RefCell::new(Channel {
            fd,
            interest: Interest::NONE,
            ready: Ready::EMPTY,
            state: PollerState::New,
            handling: false,
            on_read: None,
            on_write: None,
            on_close: None,
            on_error: None,
        }))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn ready(&self) -> Ready {
        self.ready
    }

    pub fn is_reading(&self) -> bool {
        self.interest.is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.interest.is_writable()
    }

    pub fn set_on_read(&mut self, f: impl FnMut(&mut EventLoop) + 'static) {
        self.on_read = Some(Box::new(f));
    }

    pub fn set_on_write(&mut self, f: impl FnMut(&mut EventLoop) + 'static) {
        self.on_write = Some(Box::new(f));
    }

    pub fn set_on_close(&mut self, f: impl FnMut(&mut EventLoop) + 'static) {
        self.on_close = Some(Box::new(f));
    }

    pub fn set_on_error(&mut self, f: impl FnMut(&mut EventLoop) + 'static) {
        self.on_error = Some(Box::new(f));
    }

    pub(crate) fn add_interest(&mut self, interest: Interest) {
        self.interest.insert(interest);
    }

    pub(crate) fn remove_interest(&mut self, interest: Interest) {
        self.interest.remove(interest);
    }

    pub(crate) fn clear_interest(&mut self) {
        self.interest = Interest::NONE;
    }

    pub(crate) fn set_ready(&mut self, ready: Ready) {
        self.ready = ready;
    }

    pub(crate) fn poller_state(&self) -> PollerState {
        self.state
    }

    pub(crate) fn set_poller_state(&mut self, state: PollerState) {
        self.state = state;
    }

    /// Dispatch the callbacks for the readiness recorded by the last poll.
    ///
    /// Order is fixed: close (hangup with nothing left to read), then
    /// error, then read, then write. The `handling` flag is set for the
    /// duration of the dispatch: a callback may remove the channel from
    /// its loop (the ready list defers the actual destruction to the end
    /// of the poll round), but destroying a channel mid-dispatch trips
    /// the assertion in `Drop`. A channel that was removed earlier in
    /// the same poll round is skipped entirely.
    pub(crate) fn handle_event(channel: &ChannelRef, event_loop: &mut EventLoop) {
        let ready = {
            let mut ch = channel.borrow_mut();
            if ch.state == PollerState::New {
                return;
            }
            ch.handling = true;
            ch.ready
        };

        if ready.is_hangup() && !ready.is_readable() {
            Self::invoke(channel, event_loop, Slot::Close);
        }
        if ready.is_error() {
            Self::invoke(channel, event_loop, Slot::Error);
        }
        if ready.is_readable() {
            Self::invoke(channel, event_loop, Slot::Read);
        }
        if ready.is_writable() {
            Self::invoke(channel, event_loop, Slot::Write);
        }

        channel.borrow_mut().handling = false;
    }

    fn invoke(channel: &ChannelRef, event_loop: &mut EventLoop, slot: Slot) {
        // The callback is taken out for the duration of the call so it can
        // freely borrow the channel, e.g. to toggle its own interest.
        let taken = {
            let mut ch = channel.borrow_mut();
            match slot {
                Slot::Read => ch.on_read.take(),
                Slot::Write => ch.on_write.take(),
                Slot::Close => ch.on_close.take(),
                Slot::Error => ch.on_error.take(),
            }
        };
        if let Some(mut cb) = taken {
            cb(event_loop);

            let mut ch = channel.borrow_mut();
            let restore = match slot {
                Slot::Read => &mut ch.on_read,
                Slot::Write => &mut ch.on_write,
                Slot::Close => &mut ch.on_close,
                Slot::Error => &mut ch.on_error,
            };
            // The callback may have installed a replacement; keep that one.
            if restore.is_none() {
                *restore = Some(cb);
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(
            !self.handling,
            "channel for fd {} destroyed while handling an event",
            self.fd
        );
    }
}

#[derive(Clone, Copy)]
enum Slot {
    Read,
    Write,
    Close,
    Error,
}
