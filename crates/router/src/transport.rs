//! Transport capability under a bus channel.

use std::thread;

use tracing::trace;

use crate::error::RouterError;
use crate::message::ChannelMessage;

/// Invoked by a transport's receive thread for each inbound message.
pub type ReceiveCallback = Box<dyn FnMut(ChannelMessage) + Send>;

/// What a concrete transport must provide.
///
/// Implementations that can receive spawn a dedicated thread in
/// [`start_receiver`](Transport::start_receiver) and invoke the callback
/// there; callers must be prepared for that thread.
pub trait Transport: Send + Sync {
    /// The endpoint this transport is attached to, in the transport's
    /// own URI conventions.
    fn endpoint(&self) -> &str;

    fn transmit(&self, message: &ChannelMessage) -> Result<(), RouterError>;

    fn start_receiver(&self, on_message: ReceiveCallback) -> Result<(), RouterError>;
}

/// In-process transport over a pair of queues.
///
/// [`pair`](InprocTransport::pair) yields two linked ends: whatever one
/// transmits, the other receives. [`loopback`](InprocTransport::loopback)
/// yields a single end that receives its own transmissions, which is
/// what a local service endpoint wants.
pub struct InprocTransport {
    endpoint: String,
    tx: flume::Sender<ChannelMessage>,
    rx: flume::Receiver<ChannelMessage>,
}

impl InprocTransport {
    pub fn pair(endpoint: impl Into<String>) -> (InprocTransport, InprocTransport) {
        let endpoint = endpoint.into();
        let (a_tx, a_rx) = flume::unbounded();
        let (b_tx, b_rx) = flume::unbounded();
        (
            InprocTransport {
                endpoint: endpoint.clone(),
                tx: a_tx,
                rx: b_rx,
            },
            InprocTransport {
                endpoint,
                tx: b_tx,
                rx: a_rx,
            },
        )
    }

    pub fn loopback(endpoint: impl Into<String>) -> InprocTransport {
        let (tx, rx) = flume::unbounded();
        InprocTransport {
            endpoint: endpoint.into(),
            tx,
            rx,
        }
    }
}

impl Transport for InprocTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn transmit(&self, message: &ChannelMessage) -> Result<(), RouterError> {
        self.tx
            .send(message.clone())
            .map_err(|_| RouterError::TransportClosed(self.endpoint.clone()))
    }

    fn start_receiver(&self, mut on_message: ReceiveCallback) -> Result<(), RouterError> {
        let rx = self.rx.clone();
        let endpoint = self.endpoint.clone();
        thread::Builder::new()
            .name(format!("recv-{endpoint}"))
            .spawn(move || {
                while let Ok(message) = rx.recv() {
                    on_message(message);
                }
                trace!(target: "router", %endpoint, "receive side closed");
            })
            .map_err(|_| RouterError::TransportClosed(self.endpoint.clone()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn pair_ends_are_cross_linked() {
        let (a, b) = InprocTransport::pair("inproc://test");
        let (probe_tx, probe_rx) = mpsc::channel();

        b.start_receiver(Box::new(move |msg| {
            probe_tx.send(msg.content).unwrap();
        }))
        .unwrap();

        a.transmit(&ChannelMessage::new("t", b"ping".to_vec()))
            .unwrap();
        let got = probe_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, b"ping");
    }

    #[test]
    fn loopback_receives_its_own_sends() {
        let t = InprocTransport::loopback("inproc://local");
        let (probe_tx, probe_rx) = mpsc::channel();

        t.start_receiver(Box::new(move |msg| {
            probe_tx.send(msg.topic).unwrap();
        }))
        .unwrap();

        t.transmit(&ChannelMessage::new("echo", b"".to_vec()))
            .unwrap();
        let topic = probe_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(topic, "echo");
    }
}
