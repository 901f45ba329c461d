//! Nodes: instantiated transformation stages.
//!
//! A node is created by its class, exposes providers, owns consumers, and
//! carries its behavior and private state as one [`NodeOps`] object. Tearing a
//! node down is cooperative: providers with attached consumers are orphaned
//! first, and the node stays in the WITHER state until the washer finds it
//! quiescent.

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::{Access, ClassId, ConsumerId, ProviderId, ProviderRef, Topology};
use crate::bio::Bio;
use crate::error::{BioError, GeomError};
use crate::event::EventRef;

/// Unique identifier for a node.
///
/// Node IDs are assigned sequentially and never reused within a topology.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Returns the raw slot index.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Upcasting helper so node payloads can be recovered by concrete type.
///
/// Implemented for every `Send + Sync + 'static` type; never implement it by hand.
pub trait AsAny: Any + Send + Sync {
    /// Borrows `self` as `dyn Any`.
    fn as_any(&self) -> &dyn Any;
    /// Converts a shared handle into a shared `dyn Any`.
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// What a [`NodeOps::dumpconf`] call is describing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DumpTarget {
    /// The node itself.
    Node(NodeId),
    /// One of the node's providers.
    Provider(ProviderId),
    /// One of the node's consumers.
    Consumer(ConsumerId),
}

/// Behavior and private state of one node.
///
/// [`start`](NodeOps::start) and [`ioctl`](NodeOps::ioctl) run on the I/O
/// path: no topology lock, any thread, possibly re-entrantly from a
/// completion. Everything taking `&mut Topology` runs under the lock.
pub trait NodeOps: AsAny {
    /// Begins processing a bio addressed to one of this node's providers.
    ///
    /// Completion must always be reported with [`deliver`](crate::io::deliver),
    /// either before returning or later from any context.
    fn start(&self, bio: Bio) {
        crate::io::deliver(bio, Err(BioError::NotSupported));
    }

    /// Approves (or vetoes) an access change on one of this node's providers.
    ///
    /// The default cascades the delta to every attached consumer of the node.
    fn access(
        &self,
        topo: &mut Topology,
        provider: ProviderId,
        delta: Access,
    ) -> Result<(), GeomError> {
        topo.std_access(provider, delta)
    }

    /// Reacts to the provider under one of this node's consumers failing.
    fn orphan(&self, topo: &mut Topology, consumer: ConsumerId) {
        topo.std_orphan(consumer);
    }

    /// Reacts to the provider under one of this node's consumers changing state.
    fn spoiled(&self, topo: &mut Topology, consumer: ConsumerId) {
        topo.std_spoiled(consumer);
    }

    /// Appends class-specific configuration lines to a dump.
    fn dumpconf(&self, _out: &mut String, _indent: &str, _target: DumpTarget) {}

    /// Handles a device control command on one of this node's providers.
    fn ioctl(&self, _provider: &ProviderRef, _cmd: u32, _data: &mut Vec<u8>) -> Result<(), BioError> {
        Err(BioError::NotSupported)
    }
}

/// Node operations with every default: used by classes that supply none.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdOps;

impl NodeOps for StdOps {}

/// Outcome of [`Topology::destroy_node`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Teardown {
    /// The node was freed before the call returned.
    Destroyed,
    /// The node is withering; it is freed once its attachments drain.
    Withering,
}

/// A live node in the topology.
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) class: ClassId,
    pub(crate) ops: Arc<dyn NodeOps>,
    pub(crate) providers: BTreeSet<ProviderId>,
    pub(crate) consumers: BTreeSet<ConsumerId>,
    pub(crate) rank: u32,
    pub(crate) withering: bool,
    pub(crate) wither_error: Option<BioError>,
}

impl Node {
    /// Returns the node handle.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Returns the node name (unique within its class).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the owning class.
    pub fn class(&self) -> ClassId {
        self.class
    }

    /// Returns the node's operations object.
    pub fn ops(&self) -> &Arc<dyn NodeOps> {
        &self.ops
    }

    /// Returns the providers this node exposes.
    pub fn providers(&self) -> &BTreeSet<ProviderId> {
        &self.providers
    }

    /// Returns the consumers this node owns.
    pub fn consumers(&self) -> &BTreeSet<ConsumerId> {
        &self.consumers
    }

    /// Returns the node's rank in the stack (1 for leaves).
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Returns true once the node has started withering.
    pub fn is_withering(&self) -> bool {
        self.withering
    }

    /// Returns the error the node was withered with, if any.
    pub fn wither_error(&self) -> Option<BioError> {
        self.wither_error
    }
}

impl Topology {
    /// Creates a node of `class` using the class's default node operations.
    pub fn new_node(&mut self, class: ClassId, name: impl Into<String>) -> Result<NodeId, GeomError> {
        let ops = self.class(class)?.imp().node_ops();
        self.new_node_with(class, name, ops)
    }

    /// Creates a node of `class` with explicit node operations.
    ///
    /// Fails with [`GeomError::NameConflict`] if the class already has a node
    /// with this name.
    pub fn new_node_with(
        &mut self,
        class: ClassId,
        name: impl Into<String>,
        ops: Arc<dyn NodeOps>,
    ) -> Result<NodeId, GeomError> {
        let name = name.into();
        self.class(class)?;
        if self.node_by_name(class, &name).is_some() {
            return Err(GeomError::NameConflict { kind: "node", name });
        }

        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(Node {
            id,
            name,
            class,
            ops,
            providers: BTreeSet::new(),
            consumers: BTreeSet::new(),
            rank: 1,
            withering: false,
            wither_error: None,
        }));
        self.class_mut(class)?.nodes.insert(id);
        tracing::debug!(
            target: "stratum::topology",
            node = %id,
            name = %self.nodes[id.index()].as_ref().map_or("", |n| n.name.as_str()),
            "node created"
        );
        Ok(id)
    }

    /// Returns a node's operations object downcast to its concrete type.
    pub fn node_ops_as<T: NodeOps>(&self, id: NodeId) -> Option<Arc<T>> {
        let ops = Arc::clone(&self.node(id).ok()?.ops);
        AsAny::into_any_arc(ops).downcast::<T>().ok()
    }

    /// Tears a node down, or starts withering it if attachments remain.
    ///
    /// Providers with consumers are orphaned (their consumers are notified
    /// through the event queue); consumers without access are detached and
    /// destroyed. Whatever is left is freed by the washer as it drains, with
    /// no further call needed.
    pub fn destroy_node(&mut self, id: NodeId) -> Result<Teardown, GeomError> {
        self.wither_node(id, BioError::NoDevice)?;
        Ok(if self.node(id).is_ok() {
            Teardown::Withering
        } else {
            Teardown::Destroyed
        })
    }

    /// Marks a node as withering with `error` and orphans its busy providers.
    pub fn wither_node(&mut self, id: NodeId, error: BioError) -> Result<(), GeomError> {
        let node = self.node_mut(id)?;
        if !node.withering {
            node.withering = true;
            node.wither_error = Some(error);
            let providers: Vec<ProviderId> = node.providers.iter().copied().collect();
            tracing::debug!(target: "stratum::topology", node = %id, %error, "node withering");
            for pp in providers {
                if self.provider(pp)?.consumers().is_empty() {
                    self.provider_mut(pp)?.mark_withering(error);
                } else {
                    self.orphan_provider(pp, error)?;
                }
            }
        }
        self.wither_wash();
        Ok(())
    }

    /// Frees whatever withering nodes have become quiescent.
    ///
    /// Runs until a full pass makes no progress, since freeing one node's
    /// consumer can release a provider further down.
    pub(crate) fn wither_wash(&mut self) {
        loop {
            let withering: Vec<NodeId> = self
                .nodes()
                .filter(|n| n.withering)
                .map(|n| n.id)
                .collect();
            let mut progress = false;
            for id in withering {
                progress |= self.wash_node(id);
            }
            if !progress {
                break;
            }
        }
    }

    fn wash_node(&mut self, id: NodeId) -> bool {
        let Ok(node) = self.node(id) else {
            return false;
        };
        let consumers: Vec<ConsumerId> = node.consumers.iter().copied().collect();
        let providers: Vec<ProviderId> = node.providers.iter().copied().collect();
        let mut progress = false;

        for cp in consumers {
            let Ok(consumer) = self.consumer(cp) else {
                continue;
            };
            if !consumer.access().is_zero() {
                continue;
            }
            if consumer.provider().is_some() && self.detach_internal(cp).is_err() {
                continue;
            }
            if self.destroy_consumer(cp).is_ok() {
                progress = true;
            }
        }

        for pp in providers {
            if self
                .provider(pp)
                .is_ok_and(|p| p.consumers().is_empty())
                && self.destroy_provider_internal(pp).is_ok()
            {
                progress = true;
            }
        }

        if let Ok(node) = self.node(id)
            && node.providers.is_empty()
            && node.consumers.is_empty()
        {
            self.free_node(id);
            progress = true;
        }
        progress
    }

    fn free_node(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(id.index()).and_then(Option::take) else {
            return;
        };
        if let Ok(class) = self.class_mut(node.class) {
            class.nodes.remove(&id);
        }
        self.cancel_event(EventRef::Node(id));
        tracing::debug!(target: "stratum::topology", node = %id, name = %node.name, "node destroyed");
    }

    /// Standard orphan reaction: close the consumer's remaining access,
    /// detach and destroy it, and wither the owning node with the provider's
    /// error.
    pub fn std_orphan(&mut self, cp: ConsumerId) {
        let Ok(consumer) = self.consumer(cp) else {
            return;
        };
        let node = consumer.node();
        let held = consumer.access();
        let error = consumer
            .provider()
            .and_then(|pp| self.provider(pp).ok())
            .and_then(super::Provider::error)
            .unwrap_or(BioError::NoDevice);

        if !held.is_zero()
            && let Err(err) = self.access(cp, -held)
        {
            tracing::warn!(target: "stratum::access", consumer = %cp, %err, "could not close orphaned consumer");
        }
        if self.detach_internal(cp).is_ok()
            && let Err(err) = self.destroy_consumer(cp)
        {
            tracing::warn!(target: "stratum::topology", consumer = %cp, %err, "could not destroy orphaned consumer");
        }
        if let Err(err) = self.wither_node(node, error) {
            tracing::warn!(target: "stratum::topology", node = %node, %err, "wither after orphan failed");
        }
    }

    /// Standard spoil reaction: acknowledge the change and keep the edge.
    pub fn std_spoiled(&mut self, cp: ConsumerId) {
        if let Ok(consumer) = self.consumer_mut(cp) {
            consumer.spoiled = false;
            tracing::trace!(target: "stratum::topology", consumer = %cp, "spoil acknowledged");
        }
    }
}
