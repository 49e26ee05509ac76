use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use eyre::WrapErr;
use tracing::{debug, info, warn};

use edge_flow::{ClosureHandler, Event, EventKind, StackFlow};
use edge_reactor::{Address, Buffer, EventLoop, LoopHandle, TcpConnection, TcpServer};
use edge_router::{frame, Channel, ChannelManager, FrameHeader, InprocTransport};

use crate::config::NodeConfig;

/// How long to let the workflow worker drain at shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(200);
/// Cadence of the periodic counters log line.
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// The assembled node: workflow engine, message router and TCP front.
pub struct Node {
    config: NodeConfig,
}

impl Node {
    pub fn new(config: NodeConfig) -> Node {
        Node { config }
    }

    /// Bring the services up, run the reactor until a shutdown signal,
    /// then tear everything down in reverse order.
    pub fn run(self) -> eyre::Result<()> {
        let listen: Address = self
            .config
            .server
            .listen
            .parse()
            .wrap_err("invalid listen address")?;

        // The mask must be in place before any service thread spawns so
        // every thread inherits it and signals land in the waiter.
        let signals = block_shutdown_signals();

        let mut event_loop = EventLoop::new().wrap_err("failed to create event loop")?;
        spawn_signal_waiter(signals, event_loop.handle())?;

        let flow = self.start_flow()?;
        let manager = self.start_router()?;
        let mut server = self.start_server(&mut event_loop, &listen, &flow, &manager)?;

        {
            let flow = Arc::clone(&flow);
            let manager = Arc::clone(&manager);
            let server_handle = server.handle();
            event_loop.run_every(STATS_INTERVAL, move |lp| {
                let server = server_handle.stats();
                let flow = flow.stats();
                let router = manager.stats();
                info!(
                    target: "node",
                    iterations = lp.iterations(),
                    dispatches = lp.dispatches(),
                    connections = server.active_connections,
                    bytes_in = server.bytes_received,
                    bytes_out = server.bytes_sent,
                    events = flow.events_processed,
                    workflows = flow.workflows_executed,
                    routed = router.messages_routed,
                    misses = router.routing_misses,
                    "counters"
                );
            });
        }

        let _ = flow.publish(Event::new(EventKind::SystemStart).set_source("edged"));
        event_loop.run().wrap_err("event loop failed")?;

        info!(target: "node", "shutting down");
        server.stop(&mut event_loop);
        let _ = flow.publish(Event::new(EventKind::SystemStop).set_source("edged"));
        let deadline = Instant::now() + SHUTDOWN_DRAIN;
        while flow.queued() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        flow.stop();

        Ok(())
    }

    fn start_flow(&self) -> eyre::Result<Arc<StackFlow>> {
        let flow = Arc::new(StackFlow::new("edged", self.config.flow.queue_capacity));

        flow.register(Arc::new(ClosureHandler::new(
            "lifecycle-log",
            EventKind::ALL,
            |event| {
                debug!(target: "node", %event, "event");
                true
            },
        )));

        flow.start()?;
        Ok(flow)
    }

    fn start_router(&self) -> eyre::Result<Arc<ChannelManager>> {
        let manager = Arc::new(ChannelManager::new("edged"));
        manager.set_routing_error_callback(|topic, e| {
            warn!(target: "node", topic, %e, "routing error");
        });

        for channel_config in &self.config.router.channels {
            let name = channel_config.name.clone();
            let transport = InprocTransport::loopback(format!("inproc://{name}"));
            let channel = Channel::new(name.clone(), channel_config.kind, Box::new(transport));
            channel.set_message_callback(move |msg| {
                debug!(target: "node", channel = %name, id = msg.id, topic = %msg.topic, "delivered");
            });
            channel.start()?;
            manager.register_channel(channel)?;
        }

        for (topic, channels) in &self.config.router.routes {
            for channel in channels {
                manager.add_route(topic.clone(), channel.clone());
            }
        }

        Ok(manager)
    }

    fn start_server(
        &self,
        event_loop: &mut EventLoop,
        listen: &Address,
        flow: &Arc<StackFlow>,
        manager: &Arc<ChannelManager>,
    ) -> eyre::Result<TcpServer> {
        let no_delay = self.config.server.no_delay;
        let high_water_mark = self.config.server.high_water_mark;
        let max_payload = self.config.server.max_payload;

        let on_connect_flow = Arc::clone(flow);
        let on_close_flow = Arc::clone(flow);
        let ingest_flow = Arc::clone(flow);
        let ingest_manager = Arc::clone(manager);

        let mut server = TcpServer::bind(event_loop.handle(), "edged", listen)?
            .set_connection_callback(move |_, conn| {
                if no_delay {
                    let _ = conn.set_no_delay(true);
                }
                conn.set_high_water_mark(high_water_mark);
                let _ = on_connect_flow.publish(
                    Event::new(EventKind::ConnectionEstablished)
                        .set_source(conn.name())
                        .set_param("peer", conn.peer_addr().to_string()),
                );
            })
            .set_close_callback(move |_, conn| {
                let _ = on_close_flow.publish(
                    Event::new(EventKind::ConnectionLost)
                        .set_source(conn.name())
                        .set_param("peer", conn.peer_addr().to_string()),
                );
            })
            .set_message_callback(move |_, conn, buffer| {
                ingest(&ingest_flow, &ingest_manager, conn, buffer, max_payload);
            });

        server.start(event_loop)?;
        Ok(server)
    }
}

/// Consume complete frames from `buffer`: validate, publish the event,
/// route the payload by the frame's receiver id.
fn ingest(
    flow: &StackFlow,
    manager: &ChannelManager,
    conn: &Arc<TcpConnection>,
    buffer: &mut Buffer,
    max_payload: u32,
) {
    loop {
        if buffer.readable_bytes() < frame::HEADER_LEN {
            return;
        }
        let header = match FrameHeader::parse(buffer.peek(), max_payload) {
            Ok(header) => header,
            Err(e) => {
                // A broken header means the stream cannot be resynced;
                // drop what is buffered but keep the connection.
                warn!(target: "node", conn = conn.name(), %e, "discarding unframeable input");
                let _ = flow.publish(
                    Event::new(EventKind::ErrorOccurred)
                        .set_source(conn.name())
                        .set_param("error", e.to_string()),
                );
                buffer.retrieve_all();
                return;
            }
        };

        let frame_len = frame::HEADER_LEN + header.payload_len as usize;
        if buffer.readable_bytes() < frame_len {
            // Wait for the rest of the frame.
            return;
        }

        let payload = &buffer.peek()[frame::HEADER_LEN..frame_len];
        match header.validate_payload(payload) {
            Ok(()) => {
                debug!(target: "node", conn = conn.name(), %header, "frame accepted");
                let event = Event::new(EventKind::MessageReceived)
                    .set_source(conn.name())
                    .set_target(&header.receiver)
                    .set_priority(header.priority)
                    .set_param("kind", header.kind.to_string())
                    .set_param("sequence", header.sequence.to_string());
                if let Err(e) = flow.publish(event) {
                    warn!(target: "node", conn = conn.name(), %e, "event dropped");
                }
                manager.route_message(&header.receiver, payload);
            }
            Err(e) => {
                warn!(target: "node", conn = conn.name(), %e, "dropping corrupt frame");
                let _ = flow.publish(
                    Event::new(EventKind::ErrorOccurred)
                        .set_source(conn.name())
                        .set_param("error", e.to_string()),
                );
            }
        }
        buffer.retrieve(frame_len);
    }
}

/// Block SIGINT/SIGTERM for this thread and all threads spawned after.
fn block_shutdown_signals() -> libc::sigset_t {
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
    set
}

/// Wait for a blocked shutdown signal and quit the loop when it lands.
fn spawn_signal_waiter(set: libc::sigset_t, handle: LoopHandle) -> eyre::Result<()> {
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            let mut signal: libc::c_int = 0;
            if unsafe { libc::sigwait(&set, &mut signal) } == 0 {
                info!(target: "node", signal, "shutdown signal received");
                handle.quit();
            }
        })
        .wrap_err("failed to spawn signal waiter")?;
    Ok(())
}
