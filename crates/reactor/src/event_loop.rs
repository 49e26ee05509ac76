//! The reactor loop: poll, dispatch, run queued tasks, fire timers.

use std::collections::{BinaryHeap, HashSet};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::{error, trace, warn};

use crate::channel::{Channel, ChannelRef};
use crate::interest::Interest;
use crate::poller::Poller;

/// Upper bound on one poll, also the idle wakeup cadence.
const POLL_TIMEOUT_MS: i32 = 10_000;

/// A unit of work handed to the loop thread.
pub type Task = Box<dyn FnOnce(&mut EventLoop) + Send>;

/// Identifies a scheduled timer for best-effort cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct LoopShared {
    thread: ThreadId,
    wakeup_fd: RawFd,
    quit: AtomicBool,
    draining: AtomicBool,
    pending: Mutex<Vec<Task>>,
    iterations: AtomicU64,
    dispatches: AtomicU64,
}

impl Drop for LoopShared {
    fn drop(&mut self) {
        let _ = syscall!(close(self.wakeup_fd));
    }
}

/// Cheap, cloneable, `Send + Sync` face of an [`EventLoop`].
///
/// Everything a foreign thread may do to a loop goes through its handle:
/// queue a task, ask for shutdown, read counters. Tasks queued from the
/// loop thread itself run within the current iteration.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Queue `task` for execution on the loop thread and rouse the loop
    /// if it may be sleeping in `poll`.
    pub fn queue_in_loop(&self, task: impl FnOnce(&mut EventLoop) + Send + 'static) {
        {
            let mut pending = self.shared.pending.lock().expect("task queue poisoned");
            pending.push(Box::new(task));
        }
        // A task queued by another thread, or from inside a running
        // pending task, would otherwise wait out the full poll timeout.
        if !self.is_in_loop_thread() || self.shared.draining.load(Ordering::Acquire) {
            self.wake();
        }
    }

    /// Alias for [`LoopHandle::queue_in_loop`]. A handle cannot run work
    /// inline even on the loop thread; use
    /// [`EventLoop::run_in_loop`] when the loop itself is at hand.
    pub fn run_in_loop(&self, task: impl FnOnce(&mut EventLoop) + Send + 'static) {
        self.queue_in_loop(task);
    }

    /// Ask the loop to exit after the current iteration.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wake();
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    /// Completed loop iterations.
    pub fn iterations(&self) -> u64 {
        self.shared.iterations.load(Ordering::Relaxed)
    }

    /// Channel readiness dispatches.
    pub fn dispatches(&self) -> u64 {
        self.shared.dispatches.load(Ordering::Relaxed)
    }

    fn wake(&self) {
        let token: u64 = 1;
        let res = unsafe {
            libc::write(
                self.shared.wakeup_fd,
                &token as *const u64 as *const libc::c_void,
                8,
            )
        };
        if res != 8 {
            warn!(target: "reactor", "failed to wake event loop");
        }
    }
}

/// A single-threaded event loop.
///
/// Construction pins the loop to the calling thread; every mutating
/// method asserts it runs there. Foreign threads interact through
/// [`LoopHandle`].
pub struct EventLoop {
    shared: Arc<LoopShared>,
    poller: Poller,
    timers: TimerQueue,
    active: Vec<ChannelRef>,
    looping: bool,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        let poller = Poller::new()?;
        let wakeup_fd = syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))?;

        let shared = Arc::new(LoopShared {
            thread: thread::current().id(),
            wakeup_fd,
            quit: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            iterations: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
        });

        let mut event_loop = EventLoop {
            shared,
            poller,
            timers: TimerQueue::new(),
            active: Vec::new(),
            looping: false,
        };

        // The wakeup channel reads and discards; its only job is to make
        // `poll` return.
        let wakeup = Channel::new(wakeup_fd);
        wakeup.borrow_mut().set_on_read(move |_| {
            let mut token = 0u64;
            let _ = syscall!(read(
                wakeup_fd,
                &mut token as *mut u64 as *mut libc::c_void,
                8,
            ));
        });
        event_loop.enable_reading(&wakeup);

        Ok(event_loop)
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "event loop owned by {:?} touched from {:?}",
                self.shared.thread,
                thread::current().id(),
            );
        }
    }

    /// Run until [`quit`](LoopHandle::quit) is requested.
    ///
    /// Each iteration: poll, dispatch ready channels, drain the pending
    /// task queue, fire expired timers.
    pub fn run(&mut self) -> io::Result<()> {
        self.assert_in_loop_thread();
        assert!(!self.looping, "event loop entered twice");
        self.looping = true;
        self.shared.quit.store(false, Ordering::Release);

        while !self.shared.quit.load(Ordering::Acquire) {
            let timeout = self.poll_timeout_ms();
            let mut active = mem::take(&mut self.active);

            if let Err(e) = self.poller.poll(timeout, &mut active) {
                self.looping = false;
                return Err(e);
            }
            self.shared.iterations.fetch_add(1, Ordering::Relaxed);
            trace!(target: "reactor", ready = active.len(), "loop iteration");

            for channel in &active {
                self.shared.dispatches.fetch_add(1, Ordering::Relaxed);
                Channel::handle_event(channel, self);
            }
            active.clear();
            self.active = active;

            self.drain_pending();
            self.fire_timers();
        }

        self.looping = false;
        Ok(())
    }

    /// Ask the loop to exit. Safe to call from the loop thread only; use
    /// [`LoopHandle::quit`] elsewhere.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
    }

    /// Run `task` immediately. The caller is necessarily on the loop
    /// thread, which the call asserts.
    pub fn run_in_loop(&mut self, task: impl FnOnce(&mut EventLoop)) {
        self.assert_in_loop_thread();
        task(self);
    }

    /// Queue `task` for the pending-task phase of the current iteration.
    pub fn queue_in_loop(&self, task: impl FnOnce(&mut EventLoop) + Send + 'static) {
        self.handle().queue_in_loop(task);
    }

    pub fn enable_reading(&mut self, channel: &ChannelRef) {
        self.assert_in_loop_thread();
        channel.borrow_mut().add_interest(Interest::READABLE);
        self.sync_channel(channel);
    }

    pub fn disable_reading(&mut self, channel: &ChannelRef) {
        self.assert_in_loop_thread();
        channel.borrow_mut().remove_interest(Interest::READABLE);
        self.sync_channel(channel);
    }

    pub fn enable_writing(&mut self, channel: &ChannelRef) {
        self.assert_in_loop_thread();
        channel.borrow_mut().add_interest(Interest::WRITABLE);
        self.sync_channel(channel);
    }

    pub fn disable_writing(&mut self, channel: &ChannelRef) {
        self.assert_in_loop_thread();
        channel.borrow_mut().remove_interest(Interest::WRITABLE);
        self.sync_channel(channel);
    }

    pub fn disable_all(&mut self, channel: &ChannelRef) {
        self.assert_in_loop_thread();
        channel.borrow_mut().clear_interest();
        self.sync_channel(channel);
    }

    /// Drop a channel from the loop. Its interest must already be empty;
    /// only afterwards may the descriptor be closed.
    pub fn remove_channel(&mut self, channel: &ChannelRef) {
        self.assert_in_loop_thread();
        if let Err(e) = self.poller.remove(channel) {
            let fd = channel.borrow().fd();
            error!(target: "reactor", fd, %e, "failed to remove channel");
        }
    }

    /// The channel registered for `fd`, if any.
    pub fn channel_for(&self, fd: RawFd) -> Option<ChannelRef> {
        self.poller.channel(fd)
    }

    /// Schedule `callback` to run once after `delay`.
    pub fn run_after(
        &mut self,
        delay: Duration,
        callback: impl FnMut(&mut EventLoop) + 'static,
    ) -> TimerId {
        self.assert_in_loop_thread();
        self.timers.schedule(delay, None, Box::new(callback))
    }

    /// Schedule `callback` to run every `interval`, first after one
    /// interval from now.
    pub fn run_every(
        &mut self,
        interval: Duration,
        callback: impl FnMut(&mut EventLoop) + 'static,
    ) -> TimerId {
        self.assert_in_loop_thread();
        self.timers
            .schedule(interval, Some(interval), Box::new(callback))
    }

    /// Best-effort cancel: a timer already being fired may still run.
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.assert_in_loop_thread();
        self.timers.cancel(id)
    }

    pub fn iterations(&self) -> u64 {
        self.shared.iterations.load(Ordering::Relaxed)
    }

    pub fn dispatches(&self) -> u64 {
        self.shared.dispatches.load(Ordering::Relaxed)
    }

    fn sync_channel(&mut self, channel: &ChannelRef) {
        if let Err(e) = self.poller.update(channel) {
            let fd = channel.borrow().fd();
            error!(target: "reactor", fd, %e, "failed to update poller");
        }
    }

    fn poll_timeout_ms(&self) -> i32 {
        match self.timers.next_deadline() {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                let ms = left.as_millis().min(POLL_TIMEOUT_MS as u128) as i32;
                if ms == 0 && !left.is_zero() {
                    1
                } else {
                    ms
                }
            }
            None => POLL_TIMEOUT_MS,
        }
    }

    fn drain_pending(&mut self) {
        self.shared.draining.store(true, Ordering::Release);
        let tasks = {
            let mut pending = self.shared.pending.lock().expect("task queue poisoned");
            mem::take(&mut *pending)
        };
        if !tasks.is_empty() {
            trace!(target: "reactor", count = tasks.len(), "running pending tasks");
        }
        for task in tasks {
            task(self);
        }
        self.shared.draining.store(false, Ordering::Release);
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        for mut slot in self.timers.pop_expired(now) {
            if self.timers.consume_cancel(slot.id) {
                continue;
            }
            (slot.callback)(self);
            if slot.period.is_some() {
                // The callback, or a sibling in this batch, may have
                // cancelled the timer; only then is it not rearmed.
                if self.timers.consume_cancel(slot.id) {
                    continue;
                }
                self.timers.reinsert(slot);
            } else {
                self.timers.release(slot.id);
            }
        }
    }
}

struct TimerSlot {
    deadline: Instant,
    seq: u64,
    id: u64,
    period: Option<Duration>,
    callback: Box<dyn FnMut(&mut EventLoop)>,
}

impl PartialEq for TimerSlot {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerSlot {}

impl PartialOrd for TimerSlot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerSlot {
    // Reversed so the max-heap surfaces the earliest deadline; ties go to
    // the earlier insertion.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerQueue {
    heap: BinaryHeap<TimerSlot>,
    live: HashSet<u64>,
    cancelled: HashSet<u64>,
    next_id: u64,
    next_seq: u64,
}

impl TimerQueue {
    fn new() -> TimerQueue {
        TimerQueue {
            heap: BinaryHeap::new(),
            live: HashSet::new(),
            cancelled: HashSet::new(),
            next_id: 0,
            next_seq: 0,
        }
    }

    fn schedule(
        &mut self,
        delay: Duration,
        period: Option<Duration>,
        callback: Box<dyn FnMut(&mut EventLoop)>,
    ) -> TimerId {
        self.next_id += 1;
        self.next_seq += 1;
        let id = self.next_id;
        self.live.insert(id);
        self.heap.push(TimerSlot {
            deadline: Instant::now() + delay,
            seq: self.next_seq,
            id,
            period,
            callback,
        });
        TimerId(id)
    }

    /// Mark a timer as cancelled. The id stays "live" from `schedule`
    /// until the timer fired for the last time, so cancellation works
    /// even from within another expired timer's callback.
    fn cancel(&mut self, id: TimerId) -> bool {
        if self.live.remove(&id.0) {
            self.cancelled.insert(id.0);
            true
        } else {
            false
        }
    }

    fn consume_cancel(&mut self, id: u64) -> bool {
        self.cancelled.remove(&id)
    }

    /// Forget a one-shot timer that has fired.
    fn release(&mut self, id: u64) {
        self.live.remove(&id);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|slot| slot.deadline)
    }

    fn pop_expired(&mut self, now: Instant) -> Vec<TimerSlot> {
        let mut expired = Vec::new();
        while let Some(slot) = self.heap.peek() {
            if slot.deadline > now {
                break;
            }
            let slot = self.heap.pop().expect("peeked entry vanished");
            expired.push(slot);
        }
        expired
    }

    fn reinsert(&mut self, mut slot: TimerSlot) {
        self.next_seq += 1;
        slot.seq = self.next_seq;
        slot.deadline = Instant::now() + slot.period.expect("reinserting one-shot timer");
        self.heap.push(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut event_loop = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = Rc::clone(&order);
        event_loop.run_after(Duration::from_millis(40), move |_| o.borrow_mut().push(2));
        let o = Rc::clone(&order);
        event_loop.run_after(Duration::from_millis(10), move |_| o.borrow_mut().push(1));
        event_loop.run_after(Duration::from_millis(60), |lp| lp.quit());

        event_loop.run().unwrap();
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn repeating_timer_fires_until_cancelled() {
        let mut event_loop = EventLoop::new().unwrap();
        let hits = Rc::new(RefCell::new(0u32));

        let h = Rc::clone(&hits);
        let id = event_loop.run_every(Duration::from_millis(5), move |_| *h.borrow_mut() += 1);
        event_loop.run_after(Duration::from_millis(40), move |lp| {
            assert!(lp.cancel_timer(id));
            lp.quit();
        });

        event_loop.run().unwrap();
        let fired = *hits.borrow();
        assert!(fired >= 3, "expected several firings, got {fired}");
    }

    #[test]
    fn cross_thread_task_wakes_the_loop() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        let worker = thread::spawn(move || {
            assert!(!handle.is_in_loop_thread());
            handle.queue_in_loop(move |lp| {
                flag.store(true, Ordering::SeqCst);
                lp.quit();
            });
        });

        let start = Instant::now();
        event_loop.run().unwrap();
        worker.join().unwrap();

        assert!(ran.load(Ordering::SeqCst));
        // Far below the idle poll timeout: the wakeup fd did its job.
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn task_queued_from_pending_task_runs_next_iteration() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let steps = Arc::new(AtomicUsize::new(0));

        let outer_steps = Arc::clone(&steps);
        let inner_handle = handle.clone();
        handle.queue_in_loop(move |_| {
            outer_steps.fetch_add(1, Ordering::SeqCst);
            let inner_steps = Arc::clone(&outer_steps);
            // Queued while the pending batch is draining: must wake the
            // next iteration instead of waiting out the poll timeout.
            inner_handle.queue_in_loop(move |lp| {
                inner_steps.fetch_add(1, Ordering::SeqCst);
                lp.quit();
            });
        });

        let start = Instant::now();
        event_loop.run().unwrap();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn counters_advance() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();

        let h = handle.clone();
        thread::spawn(move || h.queue_in_loop(|lp| lp.quit()))
            .join()
            .unwrap();
        event_loop.run().unwrap();

        assert!(handle.iterations() >= 1);
        // The wakeup channel read counts as a dispatch.
        assert!(handle.dispatches() >= 1);
    }
}
