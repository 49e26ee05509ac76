//! Listening socket plumbing.

use std::cell::RefCell;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use tracing::{error, warn};

use crate::addr::Address;
use crate::channel::{Channel, ChannelRef};
use crate::event_loop::EventLoop;
use crate::socket::Socket;

const BACKLOG: i32 = 128;

/// Invoked with each accepted socket and its peer address.
pub type NewConnectionCallback = Box<dyn FnMut(&mut EventLoop, Socket, Address)>;

struct Inner {
    socket: Socket,
    idle_fd: RawFd,
    on_connection: Option<NewConnectionCallback>,
}

/// Owns a listening socket and its reactor channel.
///
/// On readiness it accepts until the backlog drains. Descriptor
/// exhaustion is degraded gracefully: a reserved idle descriptor is
/// closed, the pending connection accepted and dropped, and the reserve
/// reopened, so the loop never spins on EMFILE.
pub struct Acceptor {
    inner: Rc<RefCell<Inner>>,
    channel: Option<ChannelRef>,
    local_addr: Address,
}

impl Acceptor {
    pub fn bind(addr: &Address) -> io::Result<Acceptor> {
        let socket = Socket::stream()?;
        socket.set_reuse_addr(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(addr)?;
        let local_addr = socket.local_addr()?;
        let idle_fd = open_idle_fd()?;

        Ok(Acceptor {
            inner: Rc::new(RefCell::new(Inner {
                socket,
                idle_fd,
                on_connection: None,
            })),
            channel: None,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> Address {
        self.local_addr
    }

    pub fn listen_fd(&self) -> RawFd {
        self.inner.borrow().socket.as_raw_fd()
    }

    pub fn is_listening(&self) -> bool {
        self.channel.is_some()
    }

    pub fn set_new_connection_callback(
        &mut self,
        cb: impl FnMut(&mut EventLoop, Socket, Address) + 'static,
    ) {
        self.inner.borrow_mut().on_connection = Some(Box::new(cb));
    }

    pub fn listen(&mut self, event_loop: &mut EventLoop) -> io::Result<()> {
        event_loop.assert_in_loop_thread();
        let fd = {
            let inner = self.inner.borrow();
            inner.socket.listen(BACKLOG)?;
            inner.socket.as_raw_fd()
        };

        let channel = Channel::new(fd);
        let inner = Rc::clone(&self.inner);
        channel
            .borrow_mut()
            .set_on_read(move |lp| Inner::handle_accept(&inner, lp));
        event_loop.enable_reading(&channel);
        self.channel = Some(channel);
        Ok(())
    }

    /// Stop accepting. The listening socket stays open until drop.
    pub fn stop(&mut self, event_loop: &mut EventLoop) {
        if let Some(channel) = self.channel.take() {
            event_loop.disable_all(&channel);
            event_loop.remove_channel(&channel);
        }
    }
}

impl Inner {
    fn handle_accept(inner: &Rc<RefCell<Inner>>, event_loop: &mut EventLoop) {
        let mut cb = inner.borrow_mut().on_connection.take();
        loop {
            let accepted = inner.borrow().socket.accept();
            match accepted {
                Ok((socket, peer)) => match cb.as_mut() {
                    Some(cb) => cb(event_loop, socket, peer),
                    None => warn!(target: "server", %peer, "accepted without a handler"),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e)
                    if e.raw_os_error() == Some(libc::EMFILE)
                        || e.raw_os_error() == Some(libc::ENFILE) =>
                {
                    Self::shed_connection(inner);
                }
                Err(e) => {
                    error!(target: "server", %e, "accept failed");
                    break;
                }
            }
        }
        if let Some(cb) = cb {
            let mut i = inner.borrow_mut();
            if i.on_connection.is_none() {
                i.on_connection = Some(cb);
            }
        }
    }

    fn shed_connection(inner: &Rc<RefCell<Inner>>) {
        warn!(target: "server", "descriptor limit hit; shedding one pending connection");
        let mut i = inner.borrow_mut();
        let _ = syscall!(close(i.idle_fd));
        if let Ok(fd) = syscall!(accept(
            i.socket.as_raw_fd(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )) {
            let _ = syscall!(close(fd));
        }
        i.idle_fd = match open_idle_fd() {
            Ok(fd) => fd,
            Err(e) => {
                error!(target: "server", %e, "failed to reopen reserve descriptor");
                -1
            }
        };
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.idle_fd >= 0 {
            let _ = syscall!(close(self.idle_fd));
        }
    }
}

fn open_idle_fd() -> io::Result<RawFd> {
    syscall!(open(
        b"/dev/null\0".as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC,
    ))
}
