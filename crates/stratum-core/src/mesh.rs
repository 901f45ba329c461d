//! The mesh: topology lock, event worker and the entry points around them.

use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, MutexGuard};

use crate::ctl::ControlRequest;
use crate::error::GeomError;
use crate::event::{EventQueue, EventRef};
use crate::topology::{Class, ClassId, MeshSettings, MeshSnapshot, Topology};

thread_local! {
    /// Meshes whose topology lock the current thread holds.
    static HELD: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct Shared {
    topology: Mutex<Topology>,
    events: Arc<EventQueue>,
}

/// Exclusive access to the topology: holding it *is* holding the lock.
pub struct TopologyGuard<'a> {
    guard: MutexGuard<'a, Topology>,
    key: usize,
}

impl core::ops::Deref for TopologyGuard<'_> {
    type Target = Topology;

    fn deref(&self) -> &Topology {
        &self.guard
    }
}

impl core::ops::DerefMut for TopologyGuard<'_> {
    fn deref_mut(&mut self) -> &mut Topology {
        &mut self.guard
    }
}

impl Drop for TopologyGuard<'_> {
    fn drop(&mut self) {
        let key = self.key;
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&k| k == key) {
                held.swap_remove(pos);
            }
        });
    }
}

/// Cloneable handle to a running mesh.
///
/// Node operations must not keep one: the mesh owns the nodes, so a node
/// holding the mesh would keep it alive forever.
#[derive(Clone)]
pub struct MeshHandle(Arc<Shared>);

impl MeshHandle {
    fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// True if the calling thread holds this mesh's topology lock.
    pub fn holds_topology(&self) -> bool {
        let key = self.key();
        HELD.with(|held| held.borrow().contains(&key))
    }

    /// Takes the topology lock.
    ///
    /// The lock is not reentrant: calling this again on the same thread
    /// while a guard is alive deadlocks.
    pub fn topology(&self) -> TopologyGuard<'_> {
        let guard = self.0.topology.lock();
        let key = self.key();
        HELD.with(|held| held.borrow_mut().push(key));
        TopologyGuard { guard, key }
    }

    /// Queues `f` to run on the event worker under the topology lock.
    pub fn post_event<F>(&self, refs: &[EventRef], f: F) -> Result<(), GeomError>
    where
        F: FnOnce(&mut Topology) + Send + 'static,
    {
        self.0.events.post(refs, f)
    }

    /// Queues `f` and blocks until it has run.
    ///
    /// Fails with [`GeomError::WouldDeadlock`] if the caller holds the
    /// topology lock, and with [`GeomError::EventCancelled`] if the event is
    /// cancelled (or the mesh shuts down) before it runs.
    pub fn wait_for_event<F>(&self, refs: &[EventRef], f: F) -> Result<(), GeomError>
    where
        F: FnOnce(&mut Topology) + Send + 'static,
    {
        if self.holds_topology() {
            return Err(GeomError::WouldDeadlock);
        }
        let done = self.0.events.post_waitable(refs, f)?;
        done.recv().map_err(|_| GeomError::EventCancelled)
    }

    /// Removes every pending event that references `target`.
    pub fn cancel_event(&self, target: EventRef) -> usize {
        self.0.events.cancel(target)
    }

    /// Number of events waiting to run.
    pub fn pending_events(&self) -> usize {
        self.0.events.len()
    }

    /// Blocks until the event queue is empty, including events posted by
    /// events that ran in the meantime.
    pub fn settle(&self) -> Result<(), GeomError> {
        if self.holds_topology() {
            return Err(GeomError::WouldDeadlock);
        }
        while !self.0.events.is_idle() {
            self.wait_for_event(&[], |_| {})?;
        }
        Ok(())
    }

    /// Registers a class (see [`Topology::register_class`]).
    pub fn register_class(&self, class: Arc<dyn Class>) -> Result<ClassId, GeomError> {
        self.topology().register_class(class)
    }

    /// Runs a control request under the topology lock and hands it back,
    /// with its error slot set if it failed. A class callback that panics
    /// fails only this request.
    pub fn control(&self, mut req: ControlRequest) -> ControlRequest {
        let mut topo = self.topology();
        let outcome = catch_unwind(AssertUnwindSafe(|| crate::ctl::dispatch(&mut topo, &mut req)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::debug!(target: "stratum::ctl", verb = ?req.verb(), %err, "control request failed");
            }
            Err(_) => {
                let err = req.error("Control request panicked.");
                tracing::error!(target: "stratum::ctl", verb = ?req.verb(), %err, "control callback panicked");
            }
        }
        req
    }

    /// Serializable view of the graph.
    pub fn snapshot(&self) -> MeshSnapshot {
        self.topology().snapshot()
    }

    /// XML-like configuration dump.
    pub fn dump_conf(&self) -> String {
        self.topology().dump_conf()
    }
}

/// A storage graph with its event worker.
///
/// Dropping the mesh stops the worker; events still pending are discarded
/// as cancelled.
pub struct Mesh {
    handle: MeshHandle,
    worker: Option<JoinHandle<()>>,
}

impl Mesh {
    /// A mesh with default settings.
    pub fn new() -> Self {
        Self::with_settings(MeshSettings::default())
    }

    /// A mesh with explicit settings.
    pub fn with_settings(settings: MeshSettings) -> Self {
        let events = Arc::new(EventQueue::new());
        let shared = Arc::new(Shared {
            topology: Mutex::new(Topology::new(Arc::clone(&events), settings)),
            events,
        });
        let handle = MeshHandle(shared);
        let worker = {
            let handle = handle.clone();
            std::thread::spawn(move || run_worker(&handle))
        };
        tracing::debug!(target: "stratum::event", "mesh started");
        Self {
            handle,
            worker: Some(worker),
        }
    }

    /// A cloneable handle for other threads.
    pub fn handle(&self) -> MeshHandle {
        self.handle.clone()
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

impl core::ops::Deref for Mesh {
    type Target = MeshHandle;

    fn deref(&self) -> &MeshHandle {
        &self.handle
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        self.handle.0.events.close();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::error!(target: "stratum::event", "event worker panicked");
        }
    }
}

fn run_worker(mesh: &MeshHandle) {
    let events = &mesh.0.events;
    while events.wait_ready() {
        let mut topo = mesh.topology();
        let Some(event) = events.pop() else {
            continue;
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| event.run(&mut topo)));
        drop(topo);
        events.finish();
        match outcome {
            Ok(Some(done)) => {
                let _ = done.send(());
            }
            Ok(None) => {}
            Err(_) => {
                tracing::error!(target: "stratum::event", "event callback panicked");
            }
        }
    }
    tracing::debug!(target: "stratum::event", "event worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn wait_for_event_runs_under_lock() {
        let mesh = Mesh::new();
        let handle = mesh.handle();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        mesh.wait_for_event(&[], move |topo| {
            s.store(topo.node_count() + 1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!handle.holds_topology());
    }

    #[test]
    fn waiting_while_holding_lock_is_refused() {
        let mesh = Mesh::new();
        let _topo = mesh.topology();
        assert!(mesh.holds_topology());
        assert_eq!(mesh.wait_for_event(&[], |_| {}), Err(GeomError::WouldDeadlock));
        assert_eq!(mesh.settle(), Err(GeomError::WouldDeadlock));
    }

    #[test]
    fn settle_drains_chained_events() {
        let mesh = Mesh::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        mesh.post_event(&[], move |topo| {
            let c2 = Arc::clone(&c);
            c.fetch_add(1, Ordering::SeqCst);
            topo.post_event(&[], move |_| {
                c2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        })
        .unwrap();
        mesh.settle().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(mesh.pending_events(), 0);
    }

    #[test]
    fn panicking_event_does_not_stop_worker() {
        let mesh = Mesh::new();
        mesh.post_event(&[], |_| panic!("boom")).unwrap();
        mesh.settle().unwrap();
        assert!(mesh.wait_for_event(&[], |_| {}).is_ok());
    }

    struct Faulty;

    impl Class for Faulty {
        fn name(&self) -> &str {
            "FAULTY"
        }

        fn ctlreq(
            &self,
            topo: &mut Topology,
            req: &mut ControlRequest,
            class: ClassId,
            verb: &str,
        ) -> Result<(), crate::ctl::CtlError> {
            if verb == "explode" {
                panic!("boom");
            }
            crate::ctl::std_ctlreq(self, topo, req, class, verb)
        }
    }

    #[test]
    fn panicking_control_fails_only_that_request() {
        let mesh = Mesh::new();
        mesh.register_class(Arc::new(Faulty)).unwrap();
        let req = mesh.control(ControlRequest::new("FAULTY", "explode"));
        assert_eq!(req.error_message(), Some("Control request panicked."));
        assert!(!mesh.holds_topology());

        let req = mesh.control(ControlRequest::new("FAULTY", "list"));
        assert_eq!(req.result(), Ok(()));
        mesh.settle().unwrap();
    }

    #[test]
    fn drop_joins_worker() {
        let mesh = Mesh::new();
        let handle = mesh.handle();
        drop(mesh);
        assert_eq!(handle.post_event(&[], |_| {}), Err(GeomError::QueueClosed));
    }
}
