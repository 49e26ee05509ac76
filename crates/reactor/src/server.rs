//! TCP server: acceptor plus a registry of live connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::acceptor::Acceptor;
use crate::addr::Address;
use crate::connection::{
    CloseCallback, ConnectionCallback, ConnectionHooks, HighWaterMarkCallback, MessageCallback,
    TcpConnection, WriteCompleteCallback,
};
use crate::error::Error;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::socket::Socket;
use crate::{Buffer, Result};

/// Point-in-time server counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerStats {
    pub connections_created: u64,
    pub connections_closed: u64,
    pub active_connections: usize,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[derive(Default)]
struct Callbacks {
    on_connection: Option<ConnectionCallback>,
    on_message: Option<MessageCallback>,
    on_write_complete: Option<WriteCompleteCallback>,
    on_high_water: Option<HighWaterMarkCallback>,
    on_close: Option<ConnectionCallback>,
}

struct ServerShared {
    name: String,
    handle: LoopHandle,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    callbacks: Mutex<Callbacks>,
    next_conn_id: AtomicU64,
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    closed_bytes_received: AtomicU64,
    closed_bytes_sent: AtomicU64,
    listen_fd: AtomicI32,
}

/// A TCP server bound to one listen address and one event loop.
///
/// Connections are named `"<server>#<seq>"` and owned by the server's
/// registry; the registry is only mutated on the loop thread. Configure
/// callbacks with the `set_*` builders, then call
/// [`start`](TcpServer::start) on the loop thread.
pub struct TcpServer {
    shared: Arc<ServerShared>,
    acceptor: Acceptor,
    started: bool,
}

impl TcpServer {
    /// Create a server bound to `addr`. Port 0 picks an ephemeral port;
    /// see [`local_addr`](TcpServer::local_addr) for the outcome.
    pub fn bind(handle: LoopHandle, name: impl Into<String>, addr: &Address) -> Result<TcpServer> {
        let acceptor = Acceptor::bind(addr)?;
        let name = name.into();
        Ok(TcpServer {
            shared: Arc::new(ServerShared {
                name,
                handle,
                connections: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(Callbacks::default()),
                next_conn_id: AtomicU64::new(0),
                connections_created: AtomicU64::new(0),
                connections_closed: AtomicU64::new(0),
                closed_bytes_received: AtomicU64::new(0),
                closed_bytes_sent: AtomicU64::new(0),
                listen_fd: AtomicI32::new(-1),
            }),
            acceptor,
            started: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn local_addr(&self) -> Address {
        self.acceptor.local_addr()
    }

    pub fn set_connection_callback(
        self,
        cb: impl Fn(&mut EventLoop, &Arc<TcpConnection>) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks().on_connection = Some(Arc::new(cb));
        self
    }

    pub fn set_message_callback(
        self,
        cb: impl Fn(&mut EventLoop, &Arc<TcpConnection>, &mut Buffer) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks().on_message = Some(Arc::new(cb));
        self
    }

    pub fn set_write_complete_callback(
        self,
        cb: impl Fn(&mut EventLoop, &Arc<TcpConnection>) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks().on_write_complete = Some(Arc::new(cb));
        self
    }

    pub fn set_high_water_mark_callback(
        self,
        cb: impl Fn(&mut EventLoop, &Arc<TcpConnection>, usize) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks().on_high_water = Some(Arc::new(cb));
        self
    }

    pub fn set_close_callback(
        self,
        cb: impl Fn(&mut EventLoop, &Arc<TcpConnection>) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks().on_close = Some(Arc::new(cb));
        self
    }

    /// Start listening. Must run on the loop thread.
    pub fn start(&mut self, event_loop: &mut EventLoop) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyStarted(self.shared.name.clone()));
        }
        self.started = true;

        let shared = Arc::clone(&self.shared);
        self.acceptor
            .set_new_connection_callback(move |lp, socket, peer| {
                ServerShared::new_connection(&shared, lp, socket, peer);
            });
        self.acceptor.listen(event_loop)?;
        self.shared
            .listen_fd
            .store(self.acceptor.listen_fd(), Ordering::Release);

        info!(
            target: "server",
            server = %self.shared.name,
            addr = %self.local_addr(),
            "listening"
        );
        Ok(())
    }

    /// Stop accepting and close every connection. Must run on the loop
    /// thread; use [`ServerHandle::stop`] from elsewhere.
    pub fn stop(&mut self, event_loop: &mut EventLoop) {
        self.acceptor.stop(event_loop);
        ServerShared::close_all(&self.shared, event_loop);
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn connection(&self, name: &str) -> Option<Arc<TcpConnection>> {
        self.shared.connection(name)
    }

    pub fn stats(&self) -> ServerStats {
        self.shared.stats()
    }

    fn callbacks(&self) -> std::sync::MutexGuard<'_, Callbacks> {
        self.shared.callbacks.lock().expect("callbacks poisoned")
    }
}

impl ServerShared {
    fn new_connection(shared: &Arc<ServerShared>, event_loop: &mut EventLoop, socket: Socket, peer: Address) {
        let id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("{}#{}", shared.name, id);

        let local = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(target: "server", %peer, %e, "dropping connection without a local address");
                return;
            }
        };

        let weak = Arc::downgrade(shared);
        let close: CloseCallback = Arc::new(move |lp, conn| {
            if let Some(shared) = weak.upgrade() {
                ServerShared::remove_connection(&shared, lp, conn);
            }
        });

        let hooks = {
            let cbs = shared.callbacks.lock().expect("callbacks poisoned");
            ConnectionHooks {
                on_connection: cbs.on_connection.clone(),
                on_message: cbs.on_message.clone(),
                on_write_complete: cbs.on_write_complete.clone(),
                on_high_water: cbs.on_high_water.clone(),
                on_close: close,
            }
        };

        let conn = TcpConnection::new(
            name.clone(),
            shared.handle.clone(),
            socket,
            local,
            peer,
            hooks,
        );
        shared
            .connections
            .lock()
            .expect("connection map poisoned")
            .insert(name.clone(), Arc::clone(&conn));
        shared.connections_created.fetch_add(1, Ordering::Relaxed);
        debug!(target: "server", conn = %name, %peer, "connection accepted");

        TcpConnection::connect_established(&conn, event_loop);
    }

    fn remove_connection(
        shared: &Arc<ServerShared>,
        event_loop: &mut EventLoop,
        conn: &Arc<TcpConnection>,
    ) {
        let removed = shared
            .connections
            .lock()
            .expect("connection map poisoned")
            .remove(conn.name());
        if removed.is_some() {
            shared.connections_closed.fetch_add(1, Ordering::Relaxed);
            shared
                .closed_bytes_received
                .fetch_add(conn.bytes_received(), Ordering::Relaxed);
            shared
                .closed_bytes_sent
                .fetch_add(conn.bytes_sent(), Ordering::Relaxed);
        }

        let user_close = {
            let cbs = shared.callbacks.lock().expect("callbacks poisoned");
            cbs.on_close.clone()
        };
        if let Some(cb) = user_close {
            cb(event_loop, conn);
        }

        // Detach one iteration later so the connection outlives the
        // stack frame of its own close handler.
        let conn = Arc::clone(conn);
        event_loop.queue_in_loop(move |lp| TcpConnection::connect_destroyed(&conn, lp));
    }

    fn close_all(shared: &Arc<ServerShared>, event_loop: &mut EventLoop) {
        let conns: Vec<_> = {
            let map = shared.connections.lock().expect("connection map poisoned");
            map.values().cloned().collect()
        };
        for conn in conns {
            TcpConnection::force_close_in_loop(&conn, event_loop);
        }
    }

    fn connection(&self, name: &str) -> Option<Arc<TcpConnection>> {
        self.connections
            .lock()
            .expect("connection map poisoned")
            .get(name)
            .cloned()
    }

    fn stats(&self) -> ServerStats {
        let (active, live_received, live_sent) = {
            let map = self.connections.lock().expect("connection map poisoned");
            let received = map.values().map(|c| c.bytes_received()).sum::<u64>();
            let sent = map.values().map(|c| c.bytes_sent()).sum::<u64>();
            (map.len(), received, sent)
        };
        ServerStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            active_connections: active,
            bytes_received: self.closed_bytes_received.load(Ordering::Relaxed) + live_received,
            bytes_sent: self.closed_bytes_sent.load(Ordering::Relaxed) + live_sent,
        }
    }
}

/// Cloneable, thread-safe face of a [`TcpServer`].
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<ServerShared>,
}

impl ServerHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Send to one connection by name. Returns false if it is unknown.
    pub fn send_to(&self, name: &str, data: &[u8]) -> bool {
        match self.shared.connection(name) {
            Some(conn) => {
                conn.send(data);
                true
            }
            None => false,
        }
    }

    /// Send to every live connection; returns how many were addressed.
    pub fn broadcast(&self, data: &[u8]) -> usize {
        let conns: Vec<_> = {
            let map = self
                .shared
                .connections
                .lock()
                .expect("connection map poisoned");
            map.values().cloned().collect()
        };
        for conn in &conns {
            conn.send(data);
        }
        conns.len()
    }

    pub fn connection(&self, name: &str) -> Option<Arc<TcpConnection>> {
        self.shared.connection(name)
    }

    /// Stop accepting and close every connection, from any thread.
    pub fn stop(&self) {
        let shared = Arc::clone(&self.shared);
        self.shared.handle.queue_in_loop(move |lp| {
            let fd = shared.listen_fd.load(Ordering::Acquire);
            if fd >= 0 {
                if let Some(channel) = lp.channel_for(fd) {
                    lp.disable_all(&channel);
                    lp.remove_channel(&channel);
                }
            }
            ServerShared::close_all(&shared, lp);
        });
    }

    pub fn active_connections(&self) -> usize {
        self.shared
            .connections
            .lock()
            .expect("connection map poisoned")
            .len()
    }

    pub fn stats(&self) -> ServerStats {
        self.shared.stats()
    }
}
