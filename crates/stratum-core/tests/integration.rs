//! Integration tests for stratum-core.
//!
//! Builds small meshes out of in-test classes and checks the cross-module
//! behavior: access propagation through stacked nodes, orphan and wither
//! teardown via the event queue, the request/deliver pipeline, taste, and
//! control-request dispatch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stratum_core::{
    Access, Bio, BioCommand, BioError, CLASS_VERSION, Class, ClassId, ControlRequest, CtlError,
    EventRef, GeomError, Geometry, Mesh, MeshSettings, NodeId, NodeOps, ProviderId, TasteMode,
    Teardown, Topology, io,
};

const MIB: u64 = 1 << 20;

// ============================================================================
// Fixtures
// ============================================================================

/// Bare class: only a name.
struct Plain(&'static str);

impl Class for Plain {
    fn name(&self) -> &str {
        self.0
    }
}

/// In-memory leaf storage.
struct RamDisk {
    data: Mutex<Vec<u8>>,
    read_only: bool,
}

impl RamDisk {
    fn patterned(size: u64) -> Self {
        Self {
            data: Mutex::new((0..size).map(|i| (i % 251) as u8).collect()),
            read_only: false,
        }
    }

    fn read_only(size: u64) -> Self {
        Self {
            read_only: true,
            ..Self::patterned(size)
        }
    }
}

impl NodeOps for RamDisk {
    fn start(&self, bio: Bio) {
        let Some(mut bio) = bio.try_attr_u64("GEOM::candelete", 1) else {
            return;
        };
        let start = bio.offset as usize;
        let end = start + bio.length as usize;
        match bio.cmd {
            BioCommand::Read => {
                bio.data.copy_from_slice(&self.data.lock().unwrap()[start..end]);
                io::complete(bio);
            }
            BioCommand::Write => {
                self.data.lock().unwrap()[start..end].copy_from_slice(&bio.data);
                io::complete(bio);
            }
            BioCommand::Delete | BioCommand::Flush => io::complete(bio),
            BioCommand::GetAttr => io::deliver(bio, Err(BioError::NotSupported)),
        }
    }

    fn access(&self, topo: &mut Topology, pp: ProviderId, delta: Access) -> Result<(), GeomError> {
        if self.read_only && delta.write > 0 {
            return Err(GeomError::Vetoed {
                node: topo.provider(pp)?.node(),
                reason: BioError::NotPermitted,
            });
        }
        Ok(())
    }
}

/// Consumer-side node that counts callbacks.
#[derive(Default)]
struct Watcher {
    orphaned: AtomicUsize,
    spoiled: AtomicUsize,
    hold_on_orphan: bool,
}

impl NodeOps for Watcher {
    fn orphan(&self, topo: &mut Topology, cp: stratum_core::ConsumerId) {
        self.orphaned.fetch_add(1, Ordering::SeqCst);
        if !self.hold_on_orphan {
            topo.std_orphan(cp);
        }
    }

    fn spoiled(&self, topo: &mut Topology, cp: stratum_core::ConsumerId) {
        self.spoiled.fetch_add(1, Ordering::SeqCst);
        topo.std_spoiled(cp);
    }
}

/// Middle-of-stack node forwarding every bio to its single consumer.
struct PassThrough {
    lower: Mutex<Option<stratum_core::ConsumerRef>>,
}

impl NodeOps for PassThrough {
    fn start(&self, bio: Bio) {
        match self.lower.lock().unwrap().clone() {
            Some(cp) => io::pass_through(bio, &cp),
            None => io::deliver(bio, Err(BioError::NoDevice)),
        }
    }
}

struct Fixture {
    mesh: Mesh,
    disk_class: ClassId,
    user_class: ClassId,
}

impl Fixture {
    fn new() -> Self {
        Self::with_settings(MeshSettings::default())
    }

    fn with_settings(settings: MeshSettings) -> Self {
        let mesh = Mesh::with_settings(settings);
        let disk_class = mesh.register_class(Arc::new(Plain("DISK"))).unwrap();
        let user_class = mesh.register_class(Arc::new(Plain("USER"))).unwrap();
        Self {
            mesh,
            disk_class,
            user_class,
        }
    }

    /// Disk node `name` exposing provider `name` over a patterned RamDisk.
    fn disk(&self, name: &str, size: u64) -> (NodeId, ProviderId) {
        self.disk_with(name, size, RamDisk::patterned(size))
    }

    fn disk_with(&self, name: &str, size: u64, ops: RamDisk) -> (NodeId, ProviderId) {
        let mut topo = self.mesh.topology();
        let node = topo.new_node_with(self.disk_class, name, Arc::new(ops)).unwrap();
        let pp = topo.new_provider(node, name, Geometry::new(size, 512)).unwrap();
        (node, pp)
    }

    /// User node with one consumer attached to `pp`.
    fn user(&self, name: &str, pp: ProviderId, ops: Arc<Watcher>) -> (NodeId, stratum_core::ConsumerId) {
        let mut topo = self.mesh.topology();
        let node = topo.new_node_with(self.user_class, name, ops).unwrap();
        let cp = topo.new_consumer(node).unwrap();
        topo.attach(cp, pp).unwrap();
        (node, cp)
    }
}

// ============================================================================
// 1. Read then orphan
// ============================================================================

#[test]
fn read_then_orphan_tears_down_both_nodes() {
    let fx = Fixture::new();
    let (a, p) = fx.disk("a0", MIB);
    let watcher = Arc::new(Watcher::default());
    let (b, c) = fx.user("b", p, Arc::clone(&watcher));

    let cref = {
        let mut topo = fx.mesh.topology();
        topo.access(c, Access::READ).unwrap();
        assert_eq!(topo.provider(p).unwrap().access(), Access::READ);
        assert_eq!(topo.node(b).unwrap().rank(), 2);
        topo.consumer_ref(c).unwrap()
    };

    let sector = io::read_data(&cref, 0, 512).unwrap();
    let expected: Vec<u8> = (0..512u64).map(|i| (i % 251) as u8).collect();
    assert_eq!(sector, expected);

    fx.mesh.topology().orphan_provider(p, BioError::Io).unwrap();
    fx.mesh.settle().unwrap();

    assert_eq!(watcher.orphaned.load(Ordering::SeqCst), 1);
    let topo = fx.mesh.topology();
    assert!(topo.consumer(c).is_err());
    assert!(topo.provider(p).is_err());
    assert!(topo.node(a).is_err());
    assert!(topo.node(b).is_err());
    assert_eq!(topo.node_count(), 0);
    drop(topo);

    assert_eq!(io::read_data(&cref, 0, 512), Err(BioError::NoDevice));
}

#[test]
fn repeated_orphan_is_noop() {
    let fx = Fixture::new();
    let (_, p) = fx.disk("d", MIB);
    let watcher = Arc::new(Watcher {
        hold_on_orphan: true,
        ..Watcher::default()
    });
    fx.user("u", p, Arc::clone(&watcher));

    {
        let mut topo = fx.mesh.topology();
        topo.orphan_provider(p, BioError::Io).unwrap();
        topo.orphan_provider(p, BioError::NoDevice).unwrap();
        assert_eq!(topo.provider(p).unwrap().error(), Some(BioError::Io));
    }
    fx.mesh.settle().unwrap();
    assert_eq!(watcher.orphaned.load(Ordering::SeqCst), 1);
}

#[test]
fn orphan_callback_never_runs_synchronously() {
    let fx = Fixture::new();
    let (_, p) = fx.disk("d", MIB);
    let watcher = Arc::new(Watcher::default());
    fx.user("u", p, Arc::clone(&watcher));

    let mut topo = fx.mesh.topology();
    topo.orphan_provider(p, BioError::Io).unwrap();
    assert_eq!(watcher.orphaned.load(Ordering::SeqCst), 0);
    assert!(topo.provider(p).unwrap().is_orphaned());
    drop(topo);
    fx.mesh.settle().unwrap();
    assert_eq!(watcher.orphaned.load(Ordering::SeqCst), 1);
}

#[test]
fn attach_to_orphaned_provider_fails() {
    let fx = Fixture::new();
    let (_, p) = fx.disk("d", MIB);
    let watcher = Arc::new(Watcher {
        hold_on_orphan: true,
        ..Watcher::default()
    });
    fx.user("u", p, watcher);

    let mut topo = fx.mesh.topology();
    topo.orphan_provider(p, BioError::Io).unwrap();
    let late = topo.new_node(fx.user_class, "late").unwrap();
    let cp = topo.new_consumer(late).unwrap();
    assert_eq!(topo.attach(cp, p), Err(GeomError::ProviderOrphaned(p)));
}

// ============================================================================
// 2. Wither deferral
// ============================================================================

#[test]
fn destroy_idle_node_is_immediate() {
    let fx = Fixture::new();
    let (a, p) = fx.disk("d", MIB);
    let mut topo = fx.mesh.topology();
    assert_eq!(topo.destroy_node(a), Ok(Teardown::Destroyed));
    assert!(topo.provider(p).is_err());
    assert!(topo.class(fx.disk_class).unwrap().nodes().is_empty());
}

#[test]
fn wither_waits_for_open_consumer() {
    let fx = Fixture::new();
    let (a, p) = fx.disk("d", MIB);
    let watcher = Arc::new(Watcher {
        hold_on_orphan: true,
        ..Watcher::default()
    });
    let (_, c) = fx.user("u", p, Arc::clone(&watcher));
    fx.mesh.topology().access(c, Access::READ).unwrap();

    assert_eq!(fx.mesh.topology().destroy_node(a), Ok(Teardown::Withering));
    fx.mesh.settle().unwrap();
    assert_eq!(watcher.orphaned.load(Ordering::SeqCst), 1);

    let mut topo = fx.mesh.topology();
    assert!(topo.node(a).unwrap().is_withering());
    assert!(topo.provider(p).unwrap().is_withering());

    topo.access(c, -Access::READ).unwrap();
    assert!(topo.node(a).is_ok(), "still attached");
    topo.detach(c).unwrap();
    assert!(topo.provider(p).is_err());
    assert!(topo.node(a).is_err());
}

#[test]
fn withering_node_frees_idle_consumers() {
    let fx = Fixture::new();
    let (_, p) = fx.disk("d", MIB);
    let (u, c) = fx.user("u", p, Arc::new(Watcher::default()));

    let mut topo = fx.mesh.topology();
    assert_eq!(topo.destroy_node(u), Ok(Teardown::Destroyed));
    assert!(topo.consumer(c).is_err());
    assert!(topo.provider(p).unwrap().consumers().is_empty());
}

// ============================================================================
// 3. Access arbitration
// ============================================================================

#[test]
fn exclusive_conflicts_are_rejected_without_change() {
    let fx = Fixture::new();
    let (_, p) = fx.disk("d", MIB);
    let (_, c1) = fx.user("u1", p, Arc::new(Watcher::default()));
    let (_, c2) = fx.user("u2", p, Arc::new(Watcher::default()));

    let mut topo = fx.mesh.topology();
    topo.access(c1, Access::EXCLUSIVE).unwrap();
    assert_eq!(topo.access(c2, Access::READ), Err(GeomError::ExclusiveConflict(p)));
    assert_eq!(topo.consumer(c2).unwrap().access(), Access::NONE);
    assert_eq!(topo.provider(p).unwrap().access(), Access::EXCLUSIVE);

    topo.access(c1, -Access::EXCLUSIVE).unwrap();
    topo.access(c2, Access::READ).unwrap();
    assert_eq!(
        topo.access(c1, Access::new(0, 0, 1)),
        Err(GeomError::ExclusiveConflict(p))
    );
}

#[test]
fn negative_access_is_rejected() {
    let fx = Fixture::new();
    let (_, p) = fx.disk("d", MIB);
    let (_, c) = fx.user("u", p, Arc::new(Watcher::default()));
    let mut topo = fx.mesh.topology();
    assert_eq!(topo.access(c, -Access::READ), Err(GeomError::NegativeAccess(c)));
}

#[test]
fn overflowing_access_is_rejected_without_change() {
    let fx = Fixture::new();
    let (_, p) = fx.disk("d", MIB);
    let (_, c1) = fx.user("u1", p, Arc::new(Watcher::default()));
    let (_, c2) = fx.user("u2", p, Arc::new(Watcher::default()));
    let mut topo = fx.mesh.topology();

    let most = Access::new(i32::MAX, 0, 0);
    topo.access(c1, most).unwrap();
    assert_eq!(topo.access(c1, Access::READ), Err(GeomError::AccessOverflow(c1)));
    assert_eq!(topo.access(c2, Access::READ), Err(GeomError::AccessOverflow(c2)));
    assert_eq!(topo.consumer(c2).unwrap().access(), Access::NONE);
    assert_eq!(topo.provider(p).unwrap().access(), most);

    topo.access(c1, -most).unwrap();
    topo.access(c2, Access::READ).unwrap();
}

#[test]
fn failed_provider_refuses_opens_but_allows_close() {
    let fx = Fixture::new();
    let (_, p) = fx.disk("d", MIB);
    let (_, c) = fx.user("u", p, Arc::new(Watcher::default()));
    let mut topo = fx.mesh.topology();
    topo.access(c, Access::READ).unwrap();
    topo.error_provider(p, Some(BioError::Io)).unwrap();
    assert_eq!(
        topo.access(c, Access::READ),
        Err(GeomError::ProviderFailed(BioError::Io))
    );
    topo.access(c, -Access::READ).unwrap();
    topo.error_provider(p, None).unwrap();
    topo.access(c, Access::READ).unwrap();
}

#[test]
fn access_cascades_through_stack() {
    let fx = Fixture::new();
    let (_, p) = fx.disk("d", MIB);
    let (mid, c_mid, p_mid) = {
        let mut topo = fx.mesh.topology();
        let mid = topo.new_node(fx.user_class, "mid").unwrap();
        let c_mid = topo.new_consumer(mid).unwrap();
        topo.attach(c_mid, p).unwrap();
        let p_mid = topo.new_provider(mid, "mid", Geometry::new(MIB, 512)).unwrap();
        (mid, c_mid, p_mid)
    };
    let (top, c_top) = fx.user("top", p_mid, Arc::new(Watcher::default()));

    let mut topo = fx.mesh.topology();
    assert_eq!(topo.node(top).unwrap().rank(), 3);
    topo.access(c_top, Access::READ_WRITE).unwrap();
    assert_eq!(topo.consumer(c_mid).unwrap().access(), Access::READ_WRITE);
    assert_eq!(topo.provider(p).unwrap().access(), Access::READ_WRITE);

    topo.access(c_top, -Access::READ_WRITE).unwrap();
    assert_eq!(topo.provider(p).unwrap().access(), Access::NONE);
    assert!(topo.node(mid).is_ok());
}

#[test]
fn vetoed_cascade_rolls_back() {
    let fx = Fixture::new();
    let (_, p_ok) = fx.disk("ok", MIB);
    let (_, p_ro) = fx.disk_with("ro", MIB, RamDisk::read_only(MIB));

    let (c_ok, c_ro, p_mid) = {
        let mut topo = fx.mesh.topology();
        let mid = topo.new_node(fx.user_class, "mirror").unwrap();
        let c_ok = topo.new_consumer(mid).unwrap();
        let c_ro = topo.new_consumer(mid).unwrap();
        topo.attach(c_ok, p_ok).unwrap();
        topo.attach(c_ro, p_ro).unwrap();
        let p_mid = topo.new_provider(mid, "mirror", Geometry::new(MIB, 512)).unwrap();
        (c_ok, c_ro, p_mid)
    };
    let (_, c_top) = fx.user("top", p_mid, Arc::new(Watcher::default()));

    let mut topo = fx.mesh.topology();
    let err = topo.access(c_top, Access::READ_WRITE).unwrap_err();
    assert!(matches!(err, GeomError::Vetoed { reason: BioError::NotPermitted, .. }));
    assert_eq!(topo.consumer(c_ok).unwrap().access(), Access::NONE);
    assert_eq!(topo.consumer(c_ro).unwrap().access(), Access::NONE);
    assert_eq!(topo.consumer(c_top).unwrap().access(), Access::NONE);
    assert_eq!(topo.provider(p_ok).unwrap().access(), Access::NONE);

    topo.access(c_top, Access::READ).unwrap();
    assert_eq!(topo.provider(p_ro).unwrap().access(), Access::READ);
}

// ============================================================================
// 4. Edges
// ============================================================================

#[test]
fn attach_rules() {
    let fx = Fixture::new();
    let (a, pa) = fx.disk("a", MIB);
    let (_, pb) = fx.disk("b", MIB);
    let mut topo = fx.mesh.topology();

    let self_cp = topo.new_consumer(a).unwrap();
    assert!(matches!(topo.attach(self_cp, pa), Err(GeomError::WouldCycle { .. })));

    let cp = topo.new_consumer(a).unwrap();
    topo.attach(cp, pb).unwrap();
    assert_eq!(topo.attach(cp, pb), Err(GeomError::AlreadyAttached(cp)));
    assert_eq!(topo.destroy_provider(pb), Err(GeomError::ProviderBusy(pb)));
    assert_eq!(topo.destroy_consumer(cp), Err(GeomError::ConsumerAttached(cp)));

    topo.access(cp, Access::READ).unwrap();
    assert_eq!(topo.detach(cp), Err(GeomError::ConsumerOpen(cp)));
    topo.access(cp, -Access::READ).unwrap();
    topo.detach(cp).unwrap();
    assert_eq!(topo.detach(cp), Err(GeomError::NotAttached(cp)));
    topo.destroy_consumer(cp).unwrap();
    topo.destroy_provider(pb).unwrap();
}

#[test]
fn transitive_cycle_is_rejected() {
    let fx = Fixture::new();
    let mut topo = fx.mesh.topology();
    let x = topo.new_node(fx.user_class, "x").unwrap();
    let y = topo.new_node(fx.user_class, "y").unwrap();
    let z = topo.new_node(fx.user_class, "z").unwrap();
    let px = topo.new_provider(x, "x", Geometry::new(MIB, 512)).unwrap();
    let py = topo.new_provider(y, "y", Geometry::new(MIB, 512)).unwrap();
    let pz = topo.new_provider(z, "z", Geometry::new(MIB, 512)).unwrap();

    let cy = topo.new_consumer(y).unwrap();
    topo.attach(cy, px).unwrap();
    let cz = topo.new_consumer(z).unwrap();
    topo.attach(cz, py).unwrap();
    let cx = topo.new_consumer(x).unwrap();
    assert_eq!(
        topo.attach(cx, pz),
        Err(GeomError::WouldCycle {
            consumer: cx,
            provider: pz
        })
    );
    assert_eq!(topo.node(z).unwrap().rank(), 3);
}

#[test]
fn names_are_unique() {
    let fx = Fixture::new();
    fx.disk("d", MIB);
    let mut topo = fx.mesh.topology();
    assert!(matches!(
        topo.new_node(fx.disk_class, "d"),
        Err(GeomError::NameConflict { kind: "node", .. })
    ));
    let other = topo.new_node(fx.user_class, "d").unwrap();
    assert!(matches!(
        topo.new_provider(other, "d", Geometry::new(MIB, 512)),
        Err(GeomError::NameConflict { kind: "provider", .. })
    ));
    assert!(matches!(
        topo.new_provider(other, "odd", Geometry::new(1000, 512)),
        Err(GeomError::InvalidGeometry(_))
    ));
}

#[test]
fn spoil_defers_callback_and_keeps_edge() {
    let fx = Fixture::new();
    let (_, p) = fx.disk("d", MIB);
    let w1 = Arc::new(Watcher::default());
    let w2 = Arc::new(Watcher::default());
    let (_, c1) = fx.user("u1", p, Arc::clone(&w1));
    let (_, c2) = fx.user("u2", p, Arc::clone(&w2));

    {
        let mut topo = fx.mesh.topology();
        assert_eq!(topo.spoil_others(p, Some(c1)), Ok(1));
        assert!(topo.consumer(c2).unwrap().is_spoiled());
        assert!(!topo.consumer(c1).unwrap().is_spoiled());
    }
    fx.mesh.settle().unwrap();
    assert_eq!(w1.spoiled.load(Ordering::SeqCst), 0);
    assert_eq!(w2.spoiled.load(Ordering::SeqCst), 1);
    let topo = fx.mesh.topology();
    assert!(!topo.consumer(c2).unwrap().is_spoiled());
    assert_eq!(topo.consumer(c2).unwrap().provider(), Some(p));
}

// ============================================================================
// 5. Events
// ============================================================================

#[test]
fn cancelled_event_never_runs() {
    let fx = Fixture::new();
    let (a, _) = fx.disk("d", MIB);
    let ran = Arc::new(AtomicUsize::new(0));

    {
        let topo = fx.mesh.topology();
        let r = Arc::clone(&ran);
        topo.post_event(&[EventRef::Node(a)], move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(topo.cancel_event(EventRef::Node(a)), 1);
    }
    fx.mesh.settle().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn destroying_provider_cancels_its_events() {
    let fx = Fixture::new();
    let (_, p) = fx.disk("d", MIB);
    let ran = Arc::new(AtomicUsize::new(0));

    {
        let mut topo = fx.mesh.topology();
        let r = Arc::clone(&ran);
        topo.post_event(&[EventRef::Provider(p)], move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        topo.destroy_provider(p).unwrap();
    }
    fx.mesh.settle().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn waiter_sees_cancellation() {
    let fx = Fixture::new();
    let (a, _) = fx.disk("d", MIB);
    let handle = fx.mesh.handle();

    let topo = fx.mesh.topology();
    let waiter = std::thread::spawn(move || handle.wait_for_event(&[EventRef::Node(a)], |_| {}));
    while fx.mesh.pending_events() == 0 {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(topo.cancel_event(EventRef::Node(a)), 1);
    drop(topo);
    assert_eq!(waiter.join().unwrap(), Err(GeomError::EventCancelled));
}

// ============================================================================
// 6. Pipeline
// ============================================================================

#[test]
fn request_errors_are_delivered() {
    let fx = Fixture::new();
    let (_, p) = fx.disk("d", 8 * 512);
    let (u, c) = fx.user("u", p, Arc::new(Watcher::default()));
    let (cref, loose) = {
        let mut topo = fx.mesh.topology();
        let loose = topo.new_consumer(u).unwrap();
        (topo.consumer_ref(c).unwrap(), topo.consumer_ref(loose).unwrap())
    };

    assert_eq!(io::read_data(&loose, 0, 512), Err(BioError::NoDevice));
    assert_eq!(io::read_data(&cref, 0, 512), Err(BioError::NotPermitted));

    fx.mesh.topology().access(c, Access::READ).unwrap();
    assert_eq!(io::write_data(&cref, 0, vec![0; 512]), Err(BioError::NotPermitted));
    assert_eq!(io::read_data(&cref, 100, 512), Err(BioError::InvalidArgument));
    assert_eq!(io::read_data(&cref, 9 * 512, 512), Err(BioError::InvalidArgument));
    assert_eq!(io::read_data(&cref, 8 * 512, 512).unwrap().len(), 0);
    assert_eq!(io::read_data(&cref, 6 * 512, 4 * 512).unwrap().len(), 2 * 512);

    assert!(cref.stats().ended() >= 6);
    assert_eq!(cref.stats().in_flight(), 0);
}

#[test]
fn oversized_delete_is_truncated_at_media_end() {
    let fx = Fixture::new();
    let (_, p) = fx.disk("d", 8 * 512);
    let (_, c) = fx.user("u", p, Arc::new(Watcher::default()));
    fx.mesh.topology().access(c, Access::READ_WRITE).unwrap();
    let cref = fx.mesh.topology().consumer_ref(c).unwrap();

    let seen = Arc::new(Mutex::new(None));
    let s = Arc::clone(&seen);
    io::request(
        Bio::delete(512, u64::MAX & !511).on_done(move |bio| {
            *s.lock().unwrap() = Some((bio.result(), bio.length));
        }),
        &cref,
    );
    assert_eq!(*seen.lock().unwrap(), Some((Ok(()), 7 * 512)));
}

#[test]
fn write_then_read_back() {
    let fx = Fixture::new();
    let (_, p) = fx.disk("d", MIB);
    let (_, c) = fx.user("u", p, Arc::new(Watcher::default()));
    fx.mesh.topology().access(c, Access::READ_WRITE).unwrap();
    let cref = fx.mesh.topology().consumer_ref(c).unwrap();

    io::write_data(&cref, 4096, vec![0xAB; 1024]).unwrap();
    assert_eq!(io::read_data(&cref, 4096, 1024).unwrap(), vec![0xAB; 1024]);
}

#[test]
fn attribute_queries() {
    let fx = Fixture::new();
    let (_, p) = fx.disk("d", MIB);
    let (_, c) = fx.user("u", p, Arc::new(Watcher::default()));
    let cref = fx.mesh.topology().consumer_ref(c).unwrap();

    let answer = io::getattr(&cref, "GEOM::candelete", 8).unwrap();
    assert_eq!(answer, 1u64.to_le_bytes().to_vec());
    assert_eq!(io::getattr(&cref, "GEOM::nope", 8), Err(BioError::NotSupported));
}

#[test]
fn pass_through_node_forwards_io() {
    let fx = Fixture::new();
    let (_, p) = fx.disk("d", MIB);
    let ops = Arc::new(PassThrough {
        lower: Mutex::new(None),
    });
    let (c_low, p_mid) = {
        let mut topo = fx.mesh.topology();
        let mid = topo.new_node_with(fx.user_class, "nop", Arc::clone(&ops) as Arc<dyn NodeOps>).unwrap();
        let c_low = topo.new_consumer(mid).unwrap();
        topo.attach(c_low, p).unwrap();
        *ops.lower.lock().unwrap() = Some(topo.consumer_ref(c_low).unwrap());
        let p_mid = topo.new_provider(mid, "d.nop", Geometry::new(MIB, 512)).unwrap();
        (c_low, p_mid)
    };
    let (_, c_top) = fx.user("top", p_mid, Arc::new(Watcher::default()));
    fx.mesh.topology().access(c_top, Access::READ).unwrap();
    let cref = fx.mesh.topology().consumer_ref(c_top).unwrap();

    let data = io::read_data(&cref, 512, 512).unwrap();
    let expected: Vec<u8> = (512..1024u64).map(|i| (i % 251) as u8).collect();
    assert_eq!(data, expected);
    let low = fx.mesh.topology().consumer_ref(c_low).unwrap();
    assert_eq!(low.stats().ended(), 1);
}

#[test]
fn callback_completion_runs_in_delivering_context() {
    let fx = Fixture::new();
    let (_, p) = fx.disk("d", MIB);
    let (_, c) = fx.user("u", p, Arc::new(Watcher::default()));
    fx.mesh.topology().access(c, Access::READ).unwrap();
    let cref = fx.mesh.topology().consumer_ref(c).unwrap();

    let seen = Arc::new(Mutex::new(None));
    let s = Arc::clone(&seen);
    io::request(
        Bio::read(0, 512).on_done(move |bio| {
            *s.lock().unwrap() = Some((bio.result(), bio.completed));
        }),
        &cref,
    );
    assert_eq!(*seen.lock().unwrap(), Some((Ok(()), 512)));
}

// ============================================================================
// 7. Classes and taste
// ============================================================================

/// Claims any provider whose name starts with `t`.
struct Taster;

impl Class for Taster {
    fn name(&self) -> &str {
        "TASTER"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn taste(
        &self,
        topo: &mut Topology,
        class: ClassId,
        provider: ProviderId,
        _mode: TasteMode,
    ) -> Option<NodeId> {
        let name = topo.provider(provider).ok()?.name().to_string();
        if !name.starts_with('t') {
            return None;
        }
        let node = topo.new_node(class, format!("{name}.taste")).ok()?;
        let cp = topo.new_consumer(node).ok()?;
        if topo.attach(cp, provider).is_err() {
            let _ = topo.destroy_node(node);
            return None;
        }
        Some(node)
    }
}

struct OldClass;

impl Class for OldClass {
    fn name(&self) -> &str {
        "OLD"
    }

    fn version(&self) -> u32 {
        CLASS_VERSION - 1
    }
}

#[test]
fn class_registration_rules() {
    let fx = Fixture::new();
    assert!(matches!(
        fx.mesh.register_class(Arc::new(Plain("DISK"))),
        Err(GeomError::NameConflict { kind: "class", .. })
    ));
    assert!(matches!(
        fx.mesh.register_class(Arc::new(OldClass)),
        Err(GeomError::VersionMismatch { .. })
    ));

    fx.disk("d", MIB);
    let mut topo = fx.mesh.topology();
    assert!(matches!(
        topo.unregister_class(fx.disk_class),
        Err(GeomError::ClassBusy { nodes: 1, .. })
    ));
    topo.unregister_class(fx.user_class).unwrap();
    assert!(topo.class_by_name("USER").is_none());
}

#[test]
fn late_registration_tastes_existing_providers() {
    let fx = Fixture::new();
    fx.disk("t0", MIB);
    fx.disk("x0", MIB);
    let taster = fx.mesh.register_class(Arc::new(Taster)).unwrap();

    let topo = fx.mesh.topology();
    assert!(topo.node_by_name(taster, "t0.taste").is_some());
    assert!(topo.node_by_name(taster, "x0.taste").is_none());
}

#[test]
fn auto_taste_claims_new_providers_once() {
    let fx = Fixture::with_settings(MeshSettings { auto_taste: true });
    let taster = fx.mesh.register_class(Arc::new(Taster)).unwrap();
    let (_, p) = fx.disk("t1", MIB);
    fx.mesh.settle().unwrap();

    let mut topo = fx.mesh.topology();
    assert!(topo.node_by_name(taster, "t1.taste").is_some());
    assert_eq!(topo.taste(p, TasteMode::Normal), Ok(None));
    assert_eq!(topo.taste(p, TasteMode::Insist), Ok(None));
    assert_eq!(topo.provider(p).unwrap().consumers().len(), 1);
}

// ============================================================================
// 8. Control requests
// ============================================================================

/// Creates RamDisk nodes from `size`/`name` parameters.
struct RamClass;

impl Class for RamClass {
    fn name(&self) -> &str {
        "RAM"
    }

    fn create_node(
        &self,
        topo: &mut Topology,
        req: &mut ControlRequest,
        class: ClassId,
        _provider: Option<ProviderId>,
    ) -> Result<(), CtlError> {
        let size = req.get_int("size")?;
        let name = req.get_text("name")?;
        let node = topo
            .new_node_with(class, name.as_str(), Arc::new(RamDisk::patterned(size as u64)))
            .map_err(|e| req.error(e.to_string()))?;
        topo.new_provider(node, name.as_str(), Geometry::new(size as u64, 512))
            .map_err(|e| req.error(e.to_string()))?;
        Ok(())
    }
}

#[test]
fn control_create_list_destroy() {
    let mesh = Mesh::new();
    let ram = mesh.register_class(Arc::new(RamClass)).unwrap();
    let user = mesh.register_class(Arc::new(Plain("USER"))).unwrap();

    let req = mesh.control(
        ControlRequest::new("RAM", "create")
            .with("size", 4096_i64)
            .with("name", "r0"),
    );
    assert_eq!(req.result(), Ok(()));

    let req = mesh.control(ControlRequest::new("RAM", "list"));
    let output = req.text("output").unwrap();
    assert!(output.contains("Geom name: r0"));
    assert!(output.contains("Mediasize: 4096"));

    let cp = {
        let mut topo = mesh.topology();
        let p = topo.provider_by_name("r0").unwrap();
        let u = topo.new_node(user, "u").unwrap();
        let cp = topo.new_consumer(u).unwrap();
        topo.attach(cp, p).unwrap();
        topo.access(cp, Access::READ).unwrap();
        cp
    };

    let req = mesh.control(ControlRequest::new("RAM", "destroy").with("node", "r0"));
    assert_eq!(req.error_message(), Some("Provider r0 is still open."));

    let req = mesh.control(
        ControlRequest::new("RAM", "destroy")
            .with("node", "r0")
            .with("force", true),
    );
    assert_eq!(req.result(), Ok(()));
    mesh.settle().unwrap();
    let topo = mesh.topology();
    assert!(topo.consumer(cp).is_err());
    assert!(topo.node_by_name(ram, "r0").is_none());
}

#[test]
fn control_errors_are_verbatim() {
    let mesh = Mesh::new();
    mesh.register_class(Arc::new(RamClass)).unwrap();

    let req = mesh.control(ControlRequest::new("NOPE", "list"));
    assert_eq!(req.error_message(), Some("Class NOPE not found."));

    let req = mesh.control(ControlRequest::new("RAM", "destroy").with("node", "ghost"));
    assert_eq!(req.error_message(), Some("Node ghost not found."));

    let req = mesh.control(ControlRequest::new("RAM", "create").with("name", "r1"));
    assert_eq!(req.error_message(), Some("Missing size argument."));
    assert_eq!(req.text("name"), Some("r1"));

    let req = mesh.control(ControlRequest::new("RAM", "create").with("provider", "/dev/none"));
    assert_eq!(req.error_message(), Some("Provider none not found."));

    let req = mesh.control(ControlRequest::new("RAM", "frobnicate"));
    assert_eq!(req.error_message(), Some("Unknown verb frobnicate."));
}

// ============================================================================
// 9. Diagnostics
// ============================================================================

#[test]
fn dump_and_snapshot_describe_graph() {
    let fx = Fixture::new();
    let (_, p) = fx.disk("d0", MIB);
    let (_, c) = fx.user("u0", p, Arc::new(Watcher::default()));
    fx.mesh.topology().access(c, Access::READ).unwrap();

    let dump = fx.mesh.dump_conf();
    assert!(dump.starts_with("<mesh>"));
    assert!(dump.contains("<name>DISK</name>"));
    assert!(dump.contains("<provider ref=\"d0\"/>"));
    assert!(dump.contains("<mode>r1w0e0</mode>"));
    assert!(dump.contains("<mediasize>1048576</mediasize>"));

    let snap = fx.mesh.snapshot();
    assert_eq!(snap.classes.len(), 2);
    let disk = &snap.classes[0].nodes[0];
    assert_eq!(disk.providers[0].name, "d0");
    assert_eq!(disk.providers[0].access, Access::READ);
    let json = serde_json::to_string(&snap).unwrap();
    assert!(json.contains("\"u0\""));
}
