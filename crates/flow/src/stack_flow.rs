//! The event queue and its worker thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use tracing::{debug, trace, warn};

use crate::error::FlowError;
use crate::event::{Event, EventKind};
use crate::handler::EventHandler;
use crate::workflow::{StepStatus, WorkflowStep};

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowStats {
    pub events_processed: u64,
    pub handlers_invoked: u64,
    pub handler_errors: u64,
    pub workflows_executed: u64,
    pub queued: usize,
}

struct FlowShared {
    name: String,
    handlers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
    workflows: Mutex<HashMap<String, WorkflowStep>>,
    running: AtomicBool,
    events_processed: AtomicU64,
    handlers_invoked: AtomicU64,
    handler_errors: AtomicU64,
    workflows_executed: AtomicU64,
}

/// A named event-processing unit.
///
/// Events are published into a bounded queue and consumed, one at a
/// time, by a dedicated worker thread. For each event the worker first
/// runs the handlers registered for the event's kind, in registration
/// order, then offers the event to every registered workflow. A handler
/// that blocks stalls everything behind it; handlers must be quick.
///
/// Queued events that were never consumed are dropped at
/// [`stop`](StackFlow::stop); the queue is not durable.
pub struct StackFlow {
    shared: Arc<FlowShared>,
    tx: flume::Sender<Event>,
    rx: flume::Receiver<Event>,
    stop_tx: Mutex<Option<flume::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StackFlow {
    /// Create an engine with a bounded queue of `capacity` events.
    pub fn new(name: impl Into<String>, capacity: usize) -> StackFlow {
        let (tx, rx) = flume::bounded(capacity);
        StackFlow {
            shared: Arc::new(FlowShared {
                name: name.into(),
                handlers: RwLock::new(HashMap::new()),
                workflows: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                events_processed: AtomicU64::new(0),
                handlers_invoked: AtomicU64::new(0),
                handler_errors: AtomicU64::new(0),
                workflows_executed: AtomicU64::new(0),
            }),
            tx,
            rx,
            stop_tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Register `handler` under `kind`. Handlers run in registration
    /// order; registering one handler twice dispatches it twice.
    pub fn register_handler(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.shared.handlers.write().expect("handler registry poisoned");
        handlers.entry(kind).or_default().push(handler);
    }

    /// Register `handler` under every kind it reports through
    /// [`EventHandler::handles`].
    pub fn register(&self, handler: Arc<dyn EventHandler>) {
        for kind in EventKind::ALL {
            if handler.handles(kind) {
                self.register_handler(kind, Arc::clone(&handler));
            }
        }
    }

    /// Remove the most recent registration of `name` under `kind`.
    pub fn unregister_handler(&self, kind: EventKind, name: &str) -> bool {
        let mut handlers = self.shared.handlers.write().expect("handler registry poisoned");
        if let Some(list) = handlers.get_mut(&kind) {
            if let Some(pos) = list.iter().rposition(|h| h.name() == name) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.shared
            .handlers
            .read()
            .expect("handler registry poisoned")
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Register a workflow under its root step's name, replacing any
    /// previous tree with that name.
    pub fn register_workflow(&self, workflow: WorkflowStep) {
        let mut workflows = self.shared.workflows.lock().expect("workflow registry poisoned");
        workflows.insert(workflow.name().to_string(), workflow);
    }

    pub fn unregister_workflow(&self, name: &str) -> bool {
        let mut workflows = self.shared.workflows.lock().expect("workflow registry poisoned");
        workflows.remove(name).is_some()
    }

    /// Run the named workflow against `event` right now, on the calling
    /// thread. The tree is reset first, so a re-run behaves like a fresh
    /// one. Returns whether the root completed.
    pub fn execute_workflow(&self, name: &str, event: &Event) -> Result<bool, FlowError> {
        let mut workflows = self.shared.workflows.lock().expect("workflow registry poisoned");
        let workflow = workflows
            .get_mut(name)
            .ok_or_else(|| FlowError::UnknownWorkflow(name.to_string()))?;
        workflow.reset();
        let completed = workflow.execute(event);
        if workflow.status() != StepStatus::Skipped {
            self.shared.workflows_executed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(completed)
    }

    /// Queue `event` for the worker. Fails with
    /// [`FlowError::QueueFull`] when the bounded queue is at capacity.
    pub fn publish(&self, event: Event) -> Result<(), FlowError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(_)) => Err(FlowError::QueueFull),
            Err(flume::TrySendError::Disconnected(_)) => Err(FlowError::NotRunning),
        }
    }

    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Spawn the worker thread.
    pub fn start(&self) -> Result<(), FlowError> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(FlowError::AlreadyRunning);
        }
        let (stop_tx, stop_rx) = flume::bounded(1);
        *self.stop_tx.lock().expect("stop signal poisoned") = Some(stop_tx);

        let shared = Arc::clone(&self.shared);
        let rx = self.rx.clone();
        let worker = std::thread::Builder::new()
            .name(format!("flow-{}", self.shared.name))
            .spawn(move || FlowShared::worker_loop(&shared, rx, stop_rx))
            .expect("failed to spawn worker thread");
        *self.worker.lock().expect("worker handle poisoned") = Some(worker);

        debug!(target: "flow", flow = %self.shared.name, "started");
        Ok(())
    }

    /// Stop the worker after the event it is currently processing and
    /// drop everything still queued.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(stop_tx) = self.stop_tx.lock().expect("stop signal poisoned").take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.lock().expect("worker handle poisoned").take() {
            if let Err(e) = worker.join() {
                warn!(target: "flow", flow = %self.shared.name, "worker panicked: {e:?}");
            }
        }

        let dropped = self.rx.drain().count();
        if dropped > 0 {
            debug!(target: "flow", flow = %self.shared.name, dropped, "dropped queued events");
        }
    }

    pub fn stats(&self) -> FlowStats {
        FlowStats {
            events_processed: self.shared.events_processed.load(Ordering::Relaxed),
            handlers_invoked: self.shared.handlers_invoked.load(Ordering::Relaxed),
            handler_errors: self.shared.handler_errors.load(Ordering::Relaxed),
            workflows_executed: self.shared.workflows_executed.load(Ordering::Relaxed),
            queued: self.rx.len(),
        }
    }
}

impl Drop for StackFlow {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Wakeup {
    Event(Result<Event, flume::RecvError>),
    Stop,
}

impl FlowShared {
    fn worker_loop(shared: &Arc<FlowShared>, rx: flume::Receiver<Event>, stop_rx: flume::Receiver<()>) {
        loop {
            if stop_rx.try_recv().is_ok() {
                break;
            }
            let wakeup = flume::Selector::new()
                .recv(&stop_rx, |_| Wakeup::Stop)
                .recv(&rx, Wakeup::Event)
                .wait();
            match wakeup {
                Wakeup::Stop => break,
                Wakeup::Event(Ok(event)) => Self::dispatch(shared, &event),
                Wakeup::Event(Err(_)) => break,
            }
        }
        trace!(target: "flow", flow = %shared.name, "worker exiting");
    }

    fn dispatch(shared: &Arc<FlowShared>, event: &Event) {
        trace!(target: "flow", flow = %shared.name, %event, "dispatching");

        // Snapshot the registrations so user code runs without the lock.
        let snapshot: Vec<Arc<dyn EventHandler>> = {
            let handlers = shared.handlers.read().expect("handler registry poisoned");
            handlers.get(&event.kind).cloned().unwrap_or_default()
        };
        for handler in snapshot {
            shared.handlers_invoked.fetch_add(1, Ordering::Relaxed);
            if !handler.handle(event) {
                shared.handler_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "flow",
                    flow = %shared.name,
                    handler = handler.name(),
                    %event,
                    "handler reported failure"
                );
            }
        }
        shared.events_processed.fetch_add(1, Ordering::Relaxed);

        // Offer the event to every workflow; a skipped root declined it.
        let mut workflows = shared.workflows.lock().expect("workflow registry poisoned");
        for workflow in workflows.values_mut() {
            workflow.reset();
            workflow.execute(event);
            if workflow.status() != StepStatus::Skipped {
                shared.workflows_executed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ClosureHandler;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let flow = StackFlow::new("order", 16);
        let seen = Arc::new(StdMutex::new(Vec::new()));

        for tag in ["h1", "h2"] {
            let seen = Arc::clone(&seen);
            flow.register_handler(
                EventKind::Custom,
                Arc::new(ClosureHandler::new(tag, [EventKind::Custom], move |_| {
                    seen.lock().unwrap().push(tag);
                    true
                })),
            );
        }

        flow.start().unwrap();
        flow.publish(Event::new(EventKind::Custom)).unwrap();
        wait_until("dispatch", || flow.stats().events_processed == 1);

        assert_eq!(*seen.lock().unwrap(), vec!["h1", "h2"]);
        assert_eq!(flow.stats().handlers_invoked, 2);
        assert_eq!(flow.stats().handler_errors, 0);
        flow.stop();
    }

    #[test]
    fn failing_handler_does_not_stop_dispatch() {
        let flow = StackFlow::new("errors", 16);
        let reached = Arc::new(AtomicUsize::new(0));

        flow.register_handler(
            EventKind::Custom,
            Arc::new(ClosureHandler::new("bad", [EventKind::Custom], |_| false)),
        );
        let counter = Arc::clone(&reached);
        flow.register_handler(
            EventKind::Custom,
            Arc::new(ClosureHandler::new("good", [EventKind::Custom], move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            })),
        );

        flow.start().unwrap();
        flow.publish(Event::new(EventKind::Custom)).unwrap();
        wait_until("dispatch", || flow.stats().events_processed == 1);

        assert_eq!(reached.load(Ordering::SeqCst), 1);
        assert_eq!(flow.stats().handler_errors, 1);
        assert_eq!(flow.stats().handlers_invoked, 2);
        flow.stop();
    }

    #[test]
    fn register_unregister_round_trip() {
        let flow = StackFlow::new("round", 4);
        let noop = |name: &str| {
            Arc::new(ClosureHandler::new(name, [EventKind::Custom], |_| true))
                as Arc<dyn EventHandler>
        };

        assert_eq!(flow.handler_count(EventKind::Custom), 0);
        flow.register_handler(EventKind::Custom, noop("a"));
        flow.register_handler(EventKind::Custom, noop("b"));
        flow.register_handler(EventKind::Custom, noop("a"));
        assert_eq!(flow.handler_count(EventKind::Custom), 3);

        assert!(flow.unregister_handler(EventKind::Custom, "a"));
        assert_eq!(flow.handler_count(EventKind::Custom), 2);
        assert!(flow.unregister_handler(EventKind::Custom, "a"));
        assert!(!flow.unregister_handler(EventKind::Custom, "a"));
        assert!(flow.unregister_handler(EventKind::Custom, "b"));
        assert_eq!(flow.handler_count(EventKind::Custom), 0);
    }

    #[test]
    fn full_queue_rejects_publish() {
        let flow = StackFlow::new("tiny", 2);
        // Worker not started: nothing drains the queue.
        flow.publish(Event::new(EventKind::Custom)).unwrap();
        flow.publish(Event::new(EventKind::Custom)).unwrap();
        assert_eq!(
            flow.publish(Event::new(EventKind::Custom)),
            Err(FlowError::QueueFull)
        );
        assert_eq!(flow.queued(), 2);
    }

    #[test]
    fn stop_drops_queued_events() {
        let flow = StackFlow::new("drops", 16);
        flow.start().unwrap();
        flow.stop();

        flow.publish(Event::new(EventKind::Custom)).unwrap();
        assert_eq!(flow.queued(), 1);
        flow.start().unwrap();
        wait_until("drain", || flow.queued() == 0);
        flow.stop();
    }

    #[test]
    fn workflows_trigger_from_published_events() {
        let flow = StackFlow::new("wf", 16);
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        flow.register_workflow(
            WorkflowStep::condition("on-start", |e| e.kind == EventKind::SystemStart).child(
                WorkflowStep::action("mark", move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                }),
            ),
        );

        flow.start().unwrap();
        flow.publish(Event::new(EventKind::Custom)).unwrap();
        flow.publish(Event::new(EventKind::SystemStart)).unwrap();
        wait_until("dispatch", || flow.stats().events_processed == 2);

        // The custom event was declined by the root condition.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(flow.stats().workflows_executed, 1);
        flow.stop();
    }

    #[test]
    fn execute_workflow_reports_the_verdict() {
        let flow = StackFlow::new("manual", 4);
        flow.register_workflow(
            WorkflowStep::sequential("pipeline")
                .child(WorkflowStep::action("ok", |_| true))
                .child(WorkflowStep::action("fails", |_| false)),
        );

        let event = Event::new(EventKind::Custom);
        assert_eq!(flow.execute_workflow("pipeline", &event), Ok(false));
        assert!(matches!(
            flow.execute_workflow("missing", &event),
            Err(FlowError::UnknownWorkflow(_))
        ));
        // Re-running resets the tree first.
        assert_eq!(flow.execute_workflow("pipeline", &event), Ok(false));
        assert_eq!(flow.stats().workflows_executed, 2);
    }

    #[test]
    fn start_twice_is_an_error() {
        let flow = StackFlow::new("twice", 4);
        flow.start().unwrap();
        assert_eq!(flow.start(), Err(FlowError::AlreadyRunning));
        flow.stop();
    }
}
