//! Channel registry and topic routing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::channel::Channel;
use crate::error::RouterError;
use crate::message::ChannelMessage;

/// Point-in-time routing counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterStats {
    pub messages_routed: u64,
    pub deliveries: u64,
    pub routing_misses: u64,
    pub send_errors: u64,
}

type RoutingErrorCallback = Arc<dyn Fn(&str, &RouterError) + Send + Sync>;

/// Owns the channels and the topic → channel routing table.
///
/// Routes may name channels that are not (or no longer) registered;
/// such entries are tolerated at routing-table edit time and surface as
/// send-time errors. A topic with no routes is a routing miss: counted
/// and reported to the error hook, invisible to the caller.
pub struct ChannelManager {
    name: String,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    routes: RwLock<HashMap<String, Vec<String>>>,
    on_routing_error: RwLock<Option<RoutingErrorCallback>>,
    messages_routed: AtomicU64,
    deliveries: AtomicU64,
    routing_misses: AtomicU64,
    send_errors: AtomicU64,
}

impl ChannelManager {
    pub fn new(name: impl Into<String>) -> ChannelManager {
        ChannelManager {
            name: name.into(),
            channels: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            on_routing_error: RwLock::new(None),
            messages_routed: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            routing_misses: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a channel under its name.
    pub fn register_channel(&self, channel: Arc<Channel>) -> Result<(), RouterError> {
        let mut channels = self.channels.write().expect("channel registry poisoned");
        if channels.contains_key(channel.name()) {
            return Err(RouterError::DuplicateChannel(channel.name().to_string()));
        }
        debug!(target: "router", manager = %self.name, channel = channel.name(), "channel registered");
        channels.insert(channel.name().to_string(), channel);
        Ok(())
    }

    /// Remove a channel. Routes naming it stay behind and fail at send
    /// time until removed.
    pub fn unregister_channel(&self, name: &str) -> Option<Arc<Channel>> {
        let mut channels = self.channels.write().expect("channel registry poisoned");
        channels.remove(name)
    }

    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .expect("channel registry poisoned")
            .get(name)
            .cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.channels
            .read()
            .expect("channel registry poisoned")
            .len()
    }

    /// Route `topic` to `channel_name`, keeping one edge per pair.
    /// The channel does not need to be registered yet.
    pub fn add_route(&self, topic: impl Into<String>, channel_name: impl Into<String>) {
        let mut routes = self.routes.write().expect("routing table poisoned");
        let entry = routes.entry(topic.into()).or_default();
        let channel_name = channel_name.into();
        if !entry.contains(&channel_name) {
            entry.push(channel_name);
        }
    }

    /// Remove one routing edge; absent edges are ignored.
    pub fn remove_route(&self, topic: &str, channel_name: &str) {
        let mut routes = self.routes.write().expect("routing table poisoned");
        if let Some(entry) = routes.get_mut(topic) {
            entry.retain(|name| name != channel_name);
            if entry.is_empty() {
                routes.remove(topic);
            }
        }
    }

    /// The channel names `topic` routes to, in order.
    pub fn routes(&self, topic: &str) -> Vec<String> {
        self.routes
            .read()
            .expect("routing table poisoned")
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_routing_error_callback(
        &self,
        cb: impl Fn(&str, &RouterError) + Send + Sync + 'static,
    ) {
        *self
            .on_routing_error
            .write()
            .expect("error hook poisoned") = Some(Arc::new(cb));
    }

    /// Send `content` to every channel routed for `topic`, in route
    /// order. Returns the number of successful deliveries.
    pub fn route_message(&self, topic: &str, content: &[u8]) -> usize {
        let names = self.routes(topic);
        if names.is_empty() {
            self.routing_misses.fetch_add(1, Ordering::Relaxed);
            warn!(target: "router", manager = %self.name, topic, "no route for topic");
            self.report(topic, &RouterError::RoutingMiss(topic.to_string()));
            return 0;
        }

        self.messages_routed.fetch_add(1, Ordering::Relaxed);
        let message = ChannelMessage::new(topic, content.to_vec());

        let mut delivered = 0;
        for name in names {
            let channel = self.channel(&name);
            match channel {
                Some(channel) => match channel.send(&message) {
                    Ok(true) => delivered += 1,
                    Ok(false) => {}
                    Err(e) => {
                        self.send_errors.fetch_add(1, Ordering::Relaxed);
                        self.report(topic, &e);
                    }
                },
                None => {
                    self.send_errors.fetch_add(1, Ordering::Relaxed);
                    let e = RouterError::UnknownChannel(name.clone());
                    warn!(target: "router", manager = %self.name, topic, %e, "route to missing channel");
                    self.report(topic, &e);
                }
            }
        }
        self.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Send `message` to every registered active channel, ignoring the
    /// routing table. Returns the number of successful deliveries.
    pub fn broadcast(&self, message: &ChannelMessage) -> usize {
        let channels: Vec<_> = {
            let map = self.channels.read().expect("channel registry poisoned");
            map.values().cloned().collect()
        };

        let mut delivered = 0;
        for channel in channels {
            if !channel.is_active() {
                continue;
            }
            match channel.send(message) {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(e) => {
                    self.send_errors.fetch_add(1, Ordering::Relaxed);
                    self.report(&message.topic, &e);
                }
            }
        }
        self.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            routing_misses: self.routing_misses.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }

    fn report(&self, topic: &str, error: &RouterError) {
        let cb = self
            .on_routing_error
            .read()
            .expect("error hook poisoned")
            .clone();
        if let Some(cb) = cb {
            cb(topic, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;
    use crate::transport::InprocTransport;
    use std::sync::atomic::AtomicUsize;

    fn manager_with_channels(names: &[&str]) -> ChannelManager {
        let manager = ChannelManager::new("test");
        for name in names {
            let channel = Channel::new(
                *name,
                ChannelKind::PointToPoint,
                Box::new(InprocTransport::loopback(format!("inproc://{name}"))),
            );
            manager.register_channel(channel).unwrap();
        }
        manager
    }

    #[test]
    fn routes_deliver_to_listed_channels_only() {
        let manager = manager_with_channels(&["c1", "c2", "c3"]);
        manager.add_route("t", "c1");
        manager.add_route("t", "c2");

        assert_eq!(manager.route_message("t", b"payload"), 2);
        assert_eq!(manager.channel("c1").unwrap().stats().sent, 1);
        assert_eq!(manager.channel("c2").unwrap().stats().sent, 1);
        assert_eq!(manager.channel("c3").unwrap().stats().sent, 0);

        let stats = manager.stats();
        assert_eq!(stats.messages_routed, 1);
        assert_eq!(stats.deliveries, 2);
        assert_eq!(stats.routing_misses, 0);
    }

    #[test]
    fn unrouted_topic_is_a_counted_miss() {
        let manager = manager_with_channels(&["c1"]);
        manager.add_route("t", "c1");

        assert_eq!(manager.route_message("u", b"x"), 0);
        let stats = manager.stats();
        assert_eq!(stats.routing_misses, 1);
        assert_eq!(stats.deliveries, 0);
        assert_eq!(manager.channel("c1").unwrap().stats().sent, 0);
    }

    #[test]
    fn duplicate_route_edges_collapse() {
        let manager = manager_with_channels(&["c1"]);
        manager.add_route("t", "c1");
        manager.add_route("t", "c1");
        assert_eq!(manager.routes("t"), vec!["c1"]);
        assert_eq!(manager.route_message("t", b"x"), 1);
    }

    #[test]
    fn route_to_unregistered_channel_errors_at_send_time() {
        let manager = manager_with_channels(&["c1"]);
        manager.add_route("t", "ghost");

        let reported = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reported);
        manager.set_routing_error_callback(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(manager.route_message("t", b"x"), 0);
        assert_eq!(manager.stats().send_errors, 1);
        assert_eq!(reported.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn route_removal_is_tolerant() {
        let manager = manager_with_channels(&["c1"]);
        manager.add_route("t", "c1");
        manager.remove_route("t", "absent");
        manager.remove_route("unknown-topic", "c1");
        manager.remove_route("t", "c1");
        assert!(manager.routes("t").is_empty());
    }

    #[test]
    fn broadcast_ignores_routes_but_honors_activity() {
        let manager = manager_with_channels(&["c1", "c2", "c3"]);
        manager.channel("c2").unwrap().deactivate();

        let message = ChannelMessage::new("anything", b"x".to_vec());
        assert_eq!(manager.broadcast(&message), 2);
        assert_eq!(manager.channel("c1").unwrap().stats().sent, 1);
        assert_eq!(manager.channel("c2").unwrap().stats().sent, 0);
        assert_eq!(manager.channel("c3").unwrap().stats().sent, 1);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let manager = manager_with_channels(&["c1"]);
        let dup = Channel::new(
            "c1",
            ChannelKind::Broadcast,
            Box::new(InprocTransport::loopback("inproc://dup")),
        );
        assert!(matches!(
            manager.register_channel(dup),
            Err(RouterError::DuplicateChannel(_))
        ));
        assert_eq!(manager.channel_count(), 1);
    }
}
