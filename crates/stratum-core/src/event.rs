//! Deferred callbacks run under the topology lock.
//!
//! Anything that must mutate the graph but is triggered from a context that
//! cannot (or should not) take the topology lock is posted here. A single
//! worker thread drains the queue in FIFO order, taking the topology lock
//! before it pops each event. Cancellation therefore never races with
//! execution: a thread that holds the lock and cancels an event knows the
//! worker has not started it.

use std::collections::VecDeque;

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::{Condvar, Mutex};

use crate::error::GeomError;
use crate::topology::{ClassId, ConsumerId, NodeId, ProviderId, Topology};

/// An entity an event depends on. Cancelling by reference drops every
/// pending event that names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventRef {
    /// A class.
    Class(ClassId),
    /// A node.
    Node(NodeId),
    /// A provider.
    Provider(ProviderId),
    /// A consumer.
    Consumer(ConsumerId),
}

type EventFn = Box<dyn FnOnce(&mut Topology) + Send>;

pub(crate) struct Event {
    seq: u64,
    refs: Vec<EventRef>,
    func: EventFn,
    done: Option<Sender<()>>,
}

impl Event {
    /// Runs the callback and hands back the waiter's sender, if any.
    ///
    /// Signal it only after releasing the topology lock.
    pub(crate) fn run(self, topo: &mut Topology) -> Option<Sender<()>> {
        tracing::trace!(target: "stratum::event", seq = self.seq, "running event");
        (self.func)(topo);
        self.done
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Event>,
    next_seq: u64,
    running: bool,
    closed: bool,
}

/// FIFO of pending events plus the worker's wake-up condition.
#[derive(Default)]
pub(crate) struct EventQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn push(&self, refs: &[EventRef], func: EventFn, done: Option<Sender<()>>) -> Result<(), GeomError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(GeomError::QueueClosed);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push_back(Event {
            seq,
            refs: refs.to_vec(),
            func,
            done,
        });
        tracing::trace!(target: "stratum::event", seq, ?refs, "event posted");
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Queues `f`.
    pub(crate) fn post<F>(&self, refs: &[EventRef], f: F) -> Result<(), GeomError>
    where
        F: FnOnce(&mut Topology) + Send + 'static,
    {
        self.push(refs, Box::new(f), None)
    }

    /// Queues `f` and returns a receiver that yields once it has run. The
    /// receiver disconnects instead if the event is cancelled.
    pub(crate) fn post_waitable<F>(&self, refs: &[EventRef], f: F) -> Result<Receiver<()>, GeomError>
    where
        F: FnOnce(&mut Topology) + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.push(refs, Box::new(f), Some(tx))?;
        Ok(rx)
    }

    /// Drops every pending event referencing `target`. Returns how many.
    pub(crate) fn cancel(&self, target: EventRef) -> usize {
        let mut state = self.state.lock();
        let before = state.pending.len();
        state.pending.retain(|e| !e.refs.contains(&target));
        let cancelled = before - state.pending.len();
        if cancelled > 0 {
            tracing::debug!(target: "stratum::event", entity = ?target, cancelled, "events cancelled");
        }
        cancelled
    }

    /// Blocks until an event is pending. Returns false once the queue is
    /// closed; pending events are then dropped as cancelled.
    pub(crate) fn wait_ready(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                let dropped = state.pending.len();
                state.pending.clear();
                if dropped > 0 {
                    tracing::debug!(target: "stratum::event", dropped, "queue closed with pending events");
                }
                return false;
            }
            if !state.pending.is_empty() {
                return true;
            }
            self.ready.wait(&mut state);
        }
    }

    /// Takes the next event. Call only while holding the topology lock.
    pub(crate) fn pop(&self) -> Option<Event> {
        let mut state = self.state.lock();
        let event = state.pending.pop_front();
        state.running = event.is_some();
        event
    }

    /// Marks the event taken by [`pop`](EventQueue::pop) as finished.
    pub(crate) fn finish(&self) {
        self.state.lock().running = false;
    }

    /// True if nothing is pending or running.
    pub(crate) fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && !state.running
    }

    /// Number of pending events.
    pub(crate) fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Refuses further posts and wakes the worker so it can exit.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_and_cancel() {
        let queue = EventQueue::new();
        let a = NodeId(0);
        let b = NodeId(1);
        queue.post(&[EventRef::Node(a)], |_| {}).unwrap();
        queue.post(&[EventRef::Node(b)], |_| {}).unwrap();
        queue.post(&[EventRef::Node(a), EventRef::Node(b)], |_| {}).unwrap();
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.cancel(EventRef::Node(a)), 2);
        assert_eq!(queue.len(), 1);
        let event = queue.pop().unwrap();
        assert_eq!(event.refs, vec![EventRef::Node(b)]);
        assert!(!queue.is_idle());
        queue.finish();
        assert!(queue.is_idle());
    }

    #[test]
    fn cancelled_waiter_disconnects() {
        let queue = EventQueue::new();
        let rx = queue
            .post_waitable(&[EventRef::Provider(ProviderId(4))], |_| {})
            .unwrap();
        queue.cancel(EventRef::Provider(ProviderId(4)));
        assert!(rx.recv().is_err());
    }

    #[test]
    fn closed_queue_refuses_posts() {
        let queue = EventQueue::new();
        queue.post(&[], |_| {}).unwrap();
        queue.close();
        assert!(!queue.wait_ready());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.post(&[], |_| {}), Err(GeomError::QueueClosed));
    }
}
