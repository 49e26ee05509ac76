//! Per-connection state machine over a channel, a socket and two buffers.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, error, trace, warn};

use crate::addr::Address;
use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::socket::Socket;

/// Output-buffer level that triggers the high-water callback.
const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;

/// Fired when a connection is established.
pub type ConnectionCallback = Arc<dyn Fn(&mut EventLoop, &Arc<TcpConnection>) + Send + Sync>;
/// Fired when bytes arrive; the receiver consumes them from the buffer.
pub type MessageCallback = Arc<dyn Fn(&mut EventLoop, &Arc<TcpConnection>, &mut Buffer) + Send + Sync>;
/// Fired when the output buffer fully drains.
pub type WriteCompleteCallback = Arc<dyn Fn(&mut EventLoop, &Arc<TcpConnection>) + Send + Sync>;
/// Fired when the output buffer first exceeds the high-water mark.
pub type HighWaterMarkCallback =
    Arc<dyn Fn(&mut EventLoop, &Arc<TcpConnection>, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&mut EventLoop, &Arc<TcpConnection>) + Send + Sync>;

/// Connection lifecycle. Transitions are monotone:
/// `Connecting → Connected → Disconnecting → Disconnected`, with
/// `Disconnecting` skipped on abortive closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> ConnState {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

pub(crate) struct ConnectionHooks {
    pub on_connection: Option<ConnectionCallback>,
    pub on_message: Option<MessageCallback>,
    pub on_write_complete: Option<WriteCompleteCallback>,
    pub on_high_water: Option<HighWaterMarkCallback>,
    pub on_close: CloseCallback,
}

/// One TCP connection, shared by reference counting.
///
/// All I/O and state transitions happen on the owning loop's thread;
/// [`send`](TcpConnection::send) and the close requests are safe to call
/// from anywhere because they trampoline through the loop's task queue.
/// Handlers that stash a connection should keep a `Weak` and upgrade
/// before use.
pub struct TcpConnection {
    name: String,
    handle: LoopHandle,
    socket: Socket,
    local_addr: Address,
    peer_addr: Address,
    state: AtomicU8,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    high_water_mark: AtomicUsize,
    connected_at: Instant,
    hooks: ConnectionHooks,
}

impl TcpConnection {
    pub(crate) fn new(
        name: String,
        handle: LoopHandle,
        socket: Socket,
        local_addr: Address,
        peer_addr: Address,
        hooks: ConnectionHooks,
    ) -> Arc<TcpConnection> {
        Arc::new(TcpConnection {
            name,
            handle,
            socket,
            local_addr,
            peer_addr,
            state: AtomicU8::new(ConnState::Connecting as u8),
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            connected_at: Instant::now(),
            hooks,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> Address {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Address {
        self.peer_addr
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn set_no_delay(&self, on: bool) -> io::Result<()> {
        self.socket.set_no_delay(on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.socket.set_keep_alive(on)
    }

    pub fn set_high_water_mark(&self, bytes: usize) {
        self.high_water_mark.store(bytes, Ordering::Relaxed);
    }

    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Send `data` to the peer from any thread.
    ///
    /// The bytes are copied and handed to the loop thread; submission
    /// order is preserved per caller. A zero-length send is a no-op.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        match self.state() {
            ConnState::Disconnecting | ConnState::Disconnected => {
                warn!(target: "server", conn = %self.name, "send on closing connection dropped");
                return;
            }
            _ => {}
        }
        let owned = data.to_vec();
        let conn = Arc::clone(self);
        self.handle.queue_in_loop(move |event_loop| {
            TcpConnection::send_in_loop(&conn, event_loop, &owned);
        });
    }

    /// Send from the loop thread, writing directly to the socket when the
    /// output buffer is idle and spilling the remainder into it.
    pub fn send_in_loop(conn: &Arc<Self>, event_loop: &mut EventLoop, data: &[u8]) {
        event_loop.assert_in_loop_thread();
        if conn.state() != ConnState::Connected {
            warn!(target: "server", conn = %conn.name, "send on closed connection dropped");
            return;
        }
        if data.is_empty() {
            return;
        }

        let channel = event_loop.channel_for(conn.fd());
        let writing = channel
            .as_ref()
            .map(|ch| ch.borrow().is_writing())
            .unwrap_or(false);
        let output_empty = {
            let output = conn.output.lock().expect("output buffer poisoned");
            output.readable_bytes() == 0
        };

        let mut written = 0;
        if !writing && output_empty {
            match conn.socket.send(data) {
                Ok(n) => written = n,
                Err(e) if would_block(&e) => {}
                Err(e) => {
                    error!(target: "server", conn = %conn.name, %e, "write failed");
                    Self::handle_close(conn, event_loop);
                    return;
                }
            }
        }
        if written > 0 {
            conn.bytes_sent.fetch_add(written as u64, Ordering::Relaxed);
        }
        if written == data.len() {
            Self::queue_write_complete(conn, event_loop);
            return;
        }

        let remainder = &data[written..];
        let (old_len, new_len) = {
            let mut output = conn.output.lock().expect("output buffer poisoned");
            let old_len = output.readable_bytes();
            output.append(remainder);
            (old_len, old_len + remainder.len())
        };

        let mark = conn.high_water_mark.load(Ordering::Relaxed);
        if old_len < mark && new_len >= mark {
            if let Some(cb) = conn.hooks.on_high_water.clone() {
                let c = Arc::clone(conn);
                event_loop.queue_in_loop(move |lp| cb(lp, &c, new_len));
            }
        }
        if let Some(ch) = channel {
            if !ch.borrow().is_writing() {
                event_loop.enable_writing(&ch);
            }
        }
    }

    /// Close the write half once the output buffer drains. Reads stay
    /// open until the peer closes its side.
    pub fn shutdown(self: &Arc<Self>) {
        let swapped = self.state.compare_exchange(
            ConnState::Connected as u8,
            ConnState::Disconnecting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if swapped.is_ok() {
            let conn = Arc::clone(self);
            self.handle.queue_in_loop(move |event_loop| {
                let writing = event_loop
                    .channel_for(conn.fd())
                    .map(|ch| ch.borrow().is_writing())
                    .unwrap_or(false);
                if !writing {
                    // Nothing buffered: close the write half now.
                    // Otherwise the write handler does it on drain.
                    if let Err(e) = conn.socket.shutdown_write() {
                        debug!(target: "server", conn = %conn.name, %e, "shutdown");
                    }
                }
            });
        }
    }

    /// Tear the connection down without waiting for the output buffer.
    pub fn force_close(self: &Arc<Self>) {
        match self.state() {
            ConnState::Connected | ConnState::Disconnecting => {
                let conn = Arc::clone(self);
                self.handle.queue_in_loop(move |event_loop| {
                    TcpConnection::force_close_in_loop(&conn, event_loop);
                });
            }
            _ => {}
        }
    }

    pub(crate) fn force_close_in_loop(conn: &Arc<Self>, event_loop: &mut EventLoop) {
        match conn.state() {
            ConnState::Connected | ConnState::Disconnecting => {
                Self::handle_close(conn, event_loop);
            }
            _ => {}
        }
    }

    /// Attach the connection to the loop and announce it. Called once,
    /// on the loop thread, after accept or connect completes.
    pub(crate) fn connect_established(conn: &Arc<TcpConnection>, event_loop: &mut EventLoop) {
        event_loop.assert_in_loop_thread();
        let prev = conn
            .state
            .swap(ConnState::Connected as u8, Ordering::AcqRel);
        debug_assert_eq!(ConnState::from_u8(prev), ConnState::Connecting);

        let channel = Channel::new(conn.fd());
        {
            let mut ch = channel.borrow_mut();
            let weak = Arc::downgrade(conn);
            ch.set_on_read(move |lp| {
                if let Some(c) = weak.upgrade() {
                    TcpConnection::handle_read(&c, lp);
                }
            });
            let weak = Arc::downgrade(conn);
            ch.set_on_write(move |lp| {
                if let Some(c) = weak.upgrade() {
                    TcpConnection::handle_write(&c, lp);
                }
            });
            let weak = Arc::downgrade(conn);
            ch.set_on_close(move |lp| {
                if let Some(c) = weak.upgrade() {
                    TcpConnection::handle_close(&c, lp);
                }
            });
            let weak = Arc::downgrade(conn);
            ch.set_on_error(move |_| {
                if let Some(c) = weak.upgrade() {
                    TcpConnection::handle_error(&c);
                }
            });
        }
        event_loop.enable_reading(&channel);
        trace!(target: "server", conn = %conn.name, peer = %conn.peer_addr, "established");

        if let Some(cb) = &conn.hooks.on_connection {
            cb(event_loop, conn);
        }
    }

    /// Final detach. Queued behind the close callback so the connection
    /// outlives the stack frame that closed it.
    pub(crate) fn connect_destroyed(conn: &Arc<TcpConnection>, event_loop: &mut EventLoop) {
        event_loop.assert_in_loop_thread();
        conn.state
            .store(ConnState::Disconnected as u8, Ordering::Release);
        if let Some(channel) = event_loop.channel_for(conn.fd()) {
            event_loop.disable_all(&channel);
            event_loop.remove_channel(&channel);
        }
        trace!(target: "server", conn = %conn.name, "destroyed");
    }

    fn handle_read(conn: &Arc<TcpConnection>, event_loop: &mut EventLoop) {
        let mut total = 0;
        let mut peer_closed = false;
        loop {
            let res = {
                let mut input = conn.input.lock().expect("input buffer poisoned");
                input.read_fd(conn.fd())
            };
            match res {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(n) => total += n,
                Err(e) if would_block(&e) => break,
                Err(e) => {
                    error!(target: "server", conn = %conn.name, %e, "read failed");
                    Self::handle_error(conn);
                    Self::handle_close(conn, event_loop);
                    return;
                }
            }
        }

        if total > 0 {
            conn.bytes_received.fetch_add(total as u64, Ordering::Relaxed);
            Self::deliver_input(conn, event_loop);
        }
        if peer_closed {
            Self::handle_close(conn, event_loop);
        }
    }

    fn deliver_input(conn: &Arc<TcpConnection>, event_loop: &mut EventLoop) {
        let Some(cb) = conn.hooks.on_message.clone() else {
            // No consumer installed; don't let the input buffer grow.
            conn.input
                .lock()
                .expect("input buffer poisoned")
                .retrieve_all();
            return;
        };
        // The buffer is lent to the callback outside the lock so the
        // callback may freely call back into the connection.
        let mut buffer = {
            let mut input = conn.input.lock().expect("input buffer poisoned");
            mem::take(&mut *input)
        };
        cb(event_loop, conn, &mut buffer);
        let mut input = conn.input.lock().expect("input buffer poisoned");
        *input = buffer;
    }

    fn handle_write(conn: &Arc<TcpConnection>, event_loop: &mut EventLoop) {
        let Some(channel) = event_loop.channel_for(conn.fd()) else {
            return;
        };
        if !channel.borrow().is_writing() {
            trace!(target: "server", conn = %conn.name, "write readiness after disable");
            return;
        }

        let outcome = {
            let mut output = conn.output.lock().expect("output buffer poisoned");
            match conn.socket.send(output.peek()) {
                Ok(n) => {
                    output.retrieve(n);
                    Ok((n, output.readable_bytes() == 0))
                }
                Err(e) => Err(e),
            }
        };

        match outcome {
            Ok((written, drained)) => {
                conn.bytes_sent.fetch_add(written as u64, Ordering::Relaxed);
                if drained {
                    event_loop.disable_writing(&channel);
                    Self::queue_write_complete(conn, event_loop);
                    if conn.state() == ConnState::Disconnecting {
                        if let Err(e) = conn.socket.shutdown_write() {
                            debug!(target: "server", conn = %conn.name, %e, "shutdown");
                        }
                    }
                }
            }
            Err(e) if would_block(&e) => {}
            Err(e) => {
                error!(target: "server", conn = %conn.name, %e, "write failed");
                Self::handle_close(conn, event_loop);
            }
        }
    }

    fn handle_close(conn: &Arc<TcpConnection>, event_loop: &mut EventLoop) {
        event_loop.assert_in_loop_thread();
        let prev = conn
            .state
            .swap(ConnState::Disconnected as u8, Ordering::AcqRel);
        if ConnState::from_u8(prev) == ConnState::Disconnected {
            return;
        }
        trace!(target: "server", conn = %conn.name, "closed");

        if let Some(channel) = event_loop.channel_for(conn.fd()) {
            event_loop.disable_all(&channel);
            event_loop.remove_channel(&channel);
        }
        let close = Arc::clone(&conn.hooks.on_close);
        close(event_loop, conn);
    }

    fn handle_error(conn: &Arc<TcpConnection>) {
        match conn.socket.take_error() {
            Ok(Some(e)) => error!(target: "server", conn = %conn.name, %e, "socket error"),
            Ok(None) => {}
            Err(e) => error!(target: "server", conn = %conn.name, %e, "SO_ERROR query failed"),
        }
    }

    fn queue_write_complete(conn: &Arc<TcpConnection>, event_loop: &mut EventLoop) {
        if let Some(cb) = conn.hooks.on_write_complete.clone() {
            let c = Arc::clone(conn);
            event_loop.queue_in_loop(move |lp| cb(lp, &c));
        }
    }
}

fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
