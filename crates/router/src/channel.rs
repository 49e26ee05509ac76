//! Named bus endpoints.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{trace, warn};

use crate::error::RouterError;
use crate::filter::MessageFilter;
use crate::message::ChannelMessage;
use crate::transport::Transport;

/// Delivery discipline of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    PointToPoint,
    PublishSubscribe,
    RequestResponse,
    Broadcast,
    Multicast,
}

impl ChannelKind {
    /// Whether topic subscription makes sense for this kind.
    pub fn supports_subscriptions(self) -> bool {
        matches!(
            self,
            ChannelKind::PublishSubscribe | ChannelKind::Multicast
        )
    }
}

/// Point-in-time channel counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelStats {
    pub sent: u64,
    pub received: u64,
    pub filtered: u64,
    pub errors: u64,
}

type MessageCallback = Arc<dyn Fn(&ChannelMessage) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&RouterError) + Send + Sync>;

/// A named endpoint over some transport.
///
/// Outbound messages pass the ordered filter chain; one veto drops the
/// message (counted, not an error). Inbound messages arrive through
/// [`notify_message_received`](Channel::notify_message_received), on
/// whatever thread the transport receives on.
pub struct Channel {
    name: String,
    kind: ChannelKind,
    active: AtomicBool,
    transport: Box<dyn Transport>,
    filters: RwLock<Vec<Arc<dyn MessageFilter>>>,
    subscriptions: Mutex<HashSet<String>>,
    on_message: RwLock<Option<MessageCallback>>,
    on_error: RwLock<Option<ErrorCallback>>,
    sent: AtomicU64,
    received: AtomicU64,
    filtered: AtomicU64,
    errors: AtomicU64,
}

impl Channel {
    pub fn new(name: impl Into<String>, kind: ChannelKind, transport: Box<dyn Transport>) -> Arc<Channel> {
        Arc::new(Channel {
            name: name.into(),
            kind,
            active: AtomicBool::new(true),
            transport,
            filters: RwLock::new(Vec::new()),
            subscriptions: Mutex::new(HashSet::new()),
            on_message: RwLock::new(None),
            on_error: RwLock::new(None),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn add_filter(&self, filter: Arc<dyn MessageFilter>) {
        self.filters.write().expect("filter chain poisoned").push(filter);
    }

    pub fn set_message_callback(&self, cb: impl Fn(&ChannelMessage) + Send + Sync + 'static) {
        *self.on_message.write().expect("message callback poisoned") = Some(Arc::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl Fn(&RouterError) + Send + Sync + 'static) {
        *self.on_error.write().expect("error callback poisoned") = Some(Arc::new(cb));
    }

    /// Wire the transport's receive side to this channel. Inbound
    /// messages will arrive on the transport's receive thread.
    pub fn start(self: &Arc<Self>) -> Result<(), RouterError> {
        let weak = Arc::downgrade(self);
        self.transport.start_receiver(Box::new(move |message| {
            if let Some(channel) = weak.upgrade() {
                channel.notify_message_received(message);
            }
        }))
    }

    /// Send `message` if it passes the filter chain.
    ///
    /// Returns whether the message was transmitted; a filtered message
    /// yields `Ok(false)`.
    pub fn send(&self, message: &ChannelMessage) -> Result<bool, RouterError> {
        if !self.is_active() {
            return Err(RouterError::Inactive(self.name.clone()));
        }

        {
            let filters = self.filters.read().expect("filter chain poisoned");
            for filter in filters.iter() {
                if !filter.accept(message) {
                    self.filtered.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        target: "router",
                        channel = %self.name,
                        filter = filter.name(),
                        id = message.id,
                        "message filtered"
                    );
                    return Ok(false);
                }
            }
        }

        match self.transport.transmit(message) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.report_error(&e);
                Err(e)
            }
        }
    }

    /// Called by the receive side for each inbound message.
    pub fn notify_message_received(&self, message: ChannelMessage) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let cb = self
            .on_message
            .read()
            .expect("message callback poisoned")
            .clone();
        match cb {
            Some(cb) => cb(&message),
            None => trace!(
                target: "router",
                channel = %self.name,
                id = message.id,
                "inbound message without a consumer"
            ),
        }
    }

    /// Subscribe to a topic. Only publish-subscribe and multicast
    /// channels accept subscriptions; other kinds return false.
    pub fn subscribe(&self, topic: &str) -> bool {
        if !self.kind.supports_subscriptions() {
            warn!(target: "router", channel = %self.name, kind = ?self.kind, "subscribe on non-subscribing kind");
            return false;
        }
        self.subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .insert(topic.to_string());
        true
    }

    pub fn unsubscribe(&self, topic: &str) -> bool {
        if !self.kind.supports_subscriptions() {
            return false;
        }
        self.subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .remove(topic)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .contains(topic)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn report_error(&self, error: &RouterError) {
        let cb = self.on_error.read().expect("error callback poisoned").clone();
        if let Some(cb) = cb {
            cb(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::MinPriorityFilter;
    use crate::transport::InprocTransport;
    use std::sync::mpsc;
    use std::time::Duration;

    fn loopback_channel(kind: ChannelKind) -> Arc<Channel> {
        Channel::new(
            "test",
            kind,
            Box::new(InprocTransport::loopback("inproc://test")),
        )
    }

    #[test]
    fn filtered_sends_count_but_do_not_error() {
        let channel = loopback_channel(ChannelKind::PointToPoint);
        channel.add_filter(Arc::new(MinPriorityFilter::new(5)));

        let low = ChannelMessage::new("t", b"".to_vec()).set_priority(1);
        let high = ChannelMessage::new("t", b"".to_vec()).set_priority(9);

        assert!(!channel.send(&low).unwrap());
        assert!(channel.send(&high).unwrap());

        let stats = channel.stats();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.filtered, 1);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn inactive_channel_rejects_sends() {
        let channel = loopback_channel(ChannelKind::PointToPoint);
        channel.deactivate();
        assert!(matches!(
            channel.send(&ChannelMessage::new("t", b"".to_vec())),
            Err(RouterError::Inactive(_))
        ));
        channel.activate();
        assert!(channel.send(&ChannelMessage::new("t", b"".to_vec())).unwrap());
    }

    #[test]
    fn receive_side_runs_the_message_callback() {
        let channel = loopback_channel(ChannelKind::PublishSubscribe);
        let (probe_tx, probe_rx) = mpsc::channel();
        let probe_tx = Mutex::new(probe_tx);
        channel.set_message_callback(move |msg| {
            probe_tx.lock().unwrap().send(msg.id).unwrap();
        });
        channel.start().unwrap();

        let msg = ChannelMessage::new("t", b"ping".to_vec());
        channel.send(&msg).unwrap();

        let id = probe_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(id, msg.id);
        assert_eq!(channel.stats().received, 1);
    }

    #[test]
    fn subscriptions_follow_the_channel_kind() {
        for kind in [ChannelKind::PublishSubscribe, ChannelKind::Multicast] {
            let channel = loopback_channel(kind);
            assert!(channel.subscribe("updates"));
            assert!(channel.is_subscribed("updates"));
            assert!(channel.unsubscribe("updates"));
            assert!(!channel.is_subscribed("updates"));
        }
        for kind in [
            ChannelKind::PointToPoint,
            ChannelKind::RequestResponse,
            ChannelKind::Broadcast,
        ] {
            let channel = loopback_channel(kind);
            assert!(!channel.subscribe("updates"));
            assert!(!channel.unsubscribe("updates"));
        }
    }
}
