//! epoll-backed event demultiplexer.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use tracing::trace;

use crate::channel::{ChannelRef, PollerState};
use crate::interest::Ready;

/// Initial capacity of the kernel event buffer; doubled when saturated.
const INITIAL_EVENTS: usize = 64;

/// A level-triggered epoll demultiplexer.
///
/// The poller maps registered descriptors to their channels and keeps the
/// kernel's interest state in sync with each channel's mask. It is not
/// thread-safe: exactly one [`EventLoop`](crate::EventLoop) owns it.
pub struct Poller {
    epoll_fd: RawFd,
    channels: HashMap<RawFd, ChannelRef>,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        let epoll_fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Poller {
            epoll_fd,
            channels: HashMap::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INITIAL_EVENTS],
        })
    }

    /// Register a new channel or sync an existing one's interest mask
    /// with the kernel. A channel whose interest drops to empty is
    /// deleted from the kernel but stays in the map until removed.
    pub fn update(&mut self, channel: &ChannelRef) -> io::Result<()> {
        let mut ch = channel.borrow_mut();
        match ch.poller_state() {
            PollerState::New | PollerState::Detached => {
                if ch.poller_state() == PollerState::New {
                    self.channels.insert(ch.fd(), Rc::clone(channel));
                }
                self.ctl(libc::EPOLL_CTL_ADD, ch.fd(), interest_bits(ch.interest()))?;
                ch.set_poller_state(PollerState::Added);
            }
            PollerState::Added => {
                if ch.interest().is_empty() {
                    self.ctl(libc::EPOLL_CTL_DEL, ch.fd(), 0)?;
                    ch.set_poller_state(PollerState::Detached);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, ch.fd(), interest_bits(ch.interest()))?;
                }
            }
        }
        Ok(())
    }

    /// Drop a channel from the poller. The channel's interest must have
    /// been cleared first; its descriptor may be closed afterwards.
    ///
    /// Legal from within the channel's own dispatch: the poll round's
    /// ready list holds the channel until dispatch finishes, and the
    /// handling flag is asserted against at destruction.
    pub fn remove(&mut self, channel: &ChannelRef) -> io::Result<()> {
        let mut ch = channel.borrow_mut();
        debug_assert!(ch.interest().is_empty());

        self.channels.remove(&ch.fd());
        if ch.poller_state() == PollerState::Added {
            self.ctl(libc::EPOLL_CTL_DEL, ch.fd(), 0)?;
        }
        ch.set_poller_state(PollerState::New);
        Ok(())
    }

    pub fn channel(&self, fd: RawFd) -> Option<ChannelRef> {
        self.channels.get(&fd).map(Rc::clone)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Wait for readiness for at most `timeout_ms` milliseconds and push
    /// the ready channels, readiness recorded, onto `active`.
    ///
    /// An interrupted wait reports no readiness rather than an error.
    pub fn poll(&mut self, timeout_ms: i32, active: &mut Vec<ChannelRef>) -> io::Result<()> {
        let n = match syscall!(epoll_wait(
            self.epoll_fd,
            self.events.as_mut_ptr(),
            self.events.len() as i32,
            timeout_ms,
        )) {
            Ok(n) => n as usize,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => return Err(e),
        };

        for event in &self.events[..n] {
            let fd = event.u64 as RawFd;
            if let Some(channel) = self.channels.get(&fd) {
                channel.borrow_mut().set_ready(Ready::from_epoll(event.events));
                active.push(Rc::clone(channel));
            } else {
                trace!(target: "reactor", fd, "readiness for unknown descriptor");
            }
        }

        if n == self.events.len() {
            // The kernel filled the whole buffer; give it more room.
            self.events
                .resize(n * 2, libc::epoll_event { events: 0, u64: 0 });
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        syscall!(epoll_ctl(self.epoll_fd, op, fd, &mut event))?;
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        let _ = syscall!(close(self.epoll_fd));
    }
}

fn interest_bits(interest: crate::Interest) -> u32 {
    let mut bits = 0u32;
    if interest.is_readable() {
        bits |= (libc::EPOLLIN | libc::EPOLLPRI) as u32;
    }
    if interest.is_writable() {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use std::time::Instant;

    #[test]
    fn empty_poll_times_out() {
        let mut poller = Poller::new().unwrap();
        let mut active = Vec::new();

        let start = Instant::now();
        poller.poll(20, &mut active).unwrap();
        assert!(active.is_empty());
        assert!(start.elapsed().as_millis() >= 20);
    }

    #[test]
    fn pipe_readiness_and_interest_sync() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        let mut poller = Poller::new().unwrap();
        let channel = Channel::new(rd);
        channel.borrow_mut().add_interest(crate::Interest::READABLE);
        poller.update(&channel).unwrap();
        assert_eq!(poller.len(), 1);

        // Nothing written yet: no readiness.
        let mut active = Vec::new();
        poller.poll(0, &mut active).unwrap();
        assert!(active.is_empty());

        let n = unsafe { libc::write(wr, b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);
        poller.poll(100, &mut active).unwrap();
        assert_eq!(active.len(), 1);
        assert!(active[0].borrow().ready().is_readable());

        // Interest cleared: the kernel stops reporting.
        channel.borrow_mut().clear_interest();
        poller.update(&channel).unwrap();
        active.clear();
        poller.poll(0, &mut active).unwrap();
        assert!(active.is_empty());

        poller.remove(&channel).unwrap();
        assert!(poller.is_empty());

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
