//! Graph arena for the mesh: classes, nodes, providers and consumers.
//!
//! Every entity lives in a slot vector owned by [`Topology`] and is addressed by
//! a small copyable handle ([`ClassId`], [`NodeId`], [`ProviderId`],
//! [`ConsumerId`]). Handles are assigned sequentially and never reused, so a
//! stale handle simply fails to resolve instead of aliasing a newer entity.
//!
//! Membership that a pointer-linked design would keep in intrusive lists is
//! explicit here: a class knows its nodes, a node its providers and consumers,
//! a provider its attached consumers. All of it is mutated only through
//! `&mut Topology`, which is only reachable through the topology lock
//! ([`Mesh::topology`](crate::Mesh::topology)).
//!
//! # Lifecycle
//!
//! ```text
//! register_class ─► new_node ─► new_provider ──────────────┐
//!                       │                                  ▼
//!                       └────► new_consumer ─► attach ─► access ─► (I/O)
//!                                                          │
//!            destroy_node / orphan ─► wither ─► washer ◄─ detach
//! ```
//!
//! The I/O path does not live here: it follows [`ConsumerRef`] →
//! [`ProviderRef`] → node operations without touching the arena (see
//! [`io`](crate::io)).

mod access;
mod class;
mod consumer;
mod dump;
mod node;
mod provider;

use std::collections::BTreeSet;
use std::sync::Arc;

pub use access::Access;
pub use class::{CLASS_VERSION, Class, ClassEntry, ClassId, TasteMode};
pub use consumer::{Consumer, ConsumerId, ConsumerRef};
pub use dump::{
    ClassSnapshot, ConsumerSnapshot, MeshSnapshot, NodeSnapshot, ProviderSnapshot,
};
pub use node::{AsAny, DumpTarget, Node, NodeId, NodeOps, StdOps, Teardown};
pub use provider::{Geometry, IoStats, Provider, ProviderId, ProviderRef};

use crate::error::GeomError;
use crate::event::{EventQueue, EventRef};

/// Tunables that shape how the topology reacts to structural changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshSettings {
    /// Post a deferred taste event for every new provider.
    pub auto_taste: bool,
}

/// The graph of classes, nodes, providers and consumers.
///
/// Obtain one through [`Mesh::topology()`](crate::Mesh::topology); holding the
/// returned guard *is* holding the topology lock.
pub struct Topology {
    classes: Vec<Option<ClassEntry>>,
    nodes: Vec<Option<Node>>,
    providers: Vec<Option<Provider>>,
    consumers: Vec<Option<Consumer>>,
    events: Arc<EventQueue>,
    settings: MeshSettings,
}

impl Topology {
    pub(crate) fn new(events: Arc<EventQueue>, settings: MeshSettings) -> Self {
        Self {
            classes: Vec::new(),
            nodes: Vec::new(),
            providers: Vec::new(),
            consumers: Vec::new(),
            events,
            settings,
        }
    }

    /// Returns the active settings.
    pub fn settings(&self) -> &MeshSettings {
        &self.settings
    }

    // --- Lookup ---

    /// Returns the registered class entry for `id`.
    pub fn class(&self, id: ClassId) -> Result<&ClassEntry, GeomError> {
        self.classes
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(GeomError::ClassNotFound(id))
    }

    /// Returns the live node for `id`.
    pub fn node(&self, id: NodeId) -> Result<&Node, GeomError> {
        self.nodes
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(GeomError::NodeNotFound(id))
    }

    /// Returns the live provider for `id`.
    pub fn provider(&self, id: ProviderId) -> Result<&Provider, GeomError> {
        self.providers
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(GeomError::ProviderNotFound(id))
    }

    /// Returns the live consumer for `id`.
    pub fn consumer(&self, id: ConsumerId) -> Result<&Consumer, GeomError> {
        self.consumers
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(GeomError::ConsumerNotFound(id))
    }

    pub(crate) fn class_mut(&mut self, id: ClassId) -> Result<&mut ClassEntry, GeomError> {
        self.classes
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(GeomError::ClassNotFound(id))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GeomError> {
        self.nodes
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(GeomError::NodeNotFound(id))
    }

    pub(crate) fn provider_mut(&mut self, id: ProviderId) -> Result<&mut Provider, GeomError> {
        self.providers
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(GeomError::ProviderNotFound(id))
    }

    pub(crate) fn consumer_mut(&mut self, id: ConsumerId) -> Result<&mut Consumer, GeomError> {
        self.consumers
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(GeomError::ConsumerNotFound(id))
    }

    /// Returns the I/O handle of a consumer, for use outside the lock.
    pub fn consumer_ref(&self, id: ConsumerId) -> Result<ConsumerRef, GeomError> {
        Ok(self.consumer(id)?.handle().clone())
    }

    /// Returns the I/O handle of a provider, for use outside the lock.
    pub fn provider_ref(&self, id: ProviderId) -> Result<ProviderRef, GeomError> {
        Ok(self.provider(id)?.handle().clone())
    }

    /// Iterates over registered classes in registration order.
    pub fn classes(&self) -> impl Iterator<Item = &ClassEntry> {
        self.classes.iter().flatten()
    }

    /// Iterates over every live node.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().flatten()
    }

    /// Iterates over every live provider.
    pub fn providers(&self) -> impl Iterator<Item = &Provider> {
        self.providers.iter().flatten()
    }

    /// Iterates over every live consumer.
    pub fn consumers(&self) -> impl Iterator<Item = &Consumer> {
        self.consumers.iter().flatten()
    }

    /// Finds a registered class by name.
    pub fn class_by_name(&self, name: &str) -> Option<ClassId> {
        self.classes().find(|c| c.name() == name).map(ClassEntry::id)
    }

    /// Finds a node of `class` by name.
    pub fn node_by_name(&self, class: ClassId, name: &str) -> Option<NodeId> {
        let entry = self.class(class).ok()?;
        entry
            .nodes()
            .iter()
            .copied()
            .find(|&n| self.node(n).is_ok_and(|node| node.name() == name))
    }

    /// Finds a provider by its globally unique name.
    pub fn provider_by_name(&self, name: &str) -> Option<ProviderId> {
        self.providers().find(|p| p.name() == name).map(Provider::id)
    }

    /// Returns the number of live nodes.
    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }

    /// Returns the number of live providers.
    pub fn provider_count(&self) -> usize {
        self.providers().count()
    }

    /// Returns the number of live consumers.
    pub fn consumer_count(&self) -> usize {
        self.consumers().count()
    }

    // --- Events ---

    /// Queues `f` to run later on the event worker, under the topology lock.
    ///
    /// `refs` names the entities the event depends on; destroying any of them
    /// cancels the event.
    pub fn post_event<F>(&self, refs: &[EventRef], f: F) -> Result<(), GeomError>
    where
        F: FnOnce(&mut Topology) + Send + 'static,
    {
        self.events.post(refs, f)
    }

    /// Removes every pending event that references `target`.
    pub fn cancel_event(&self, target: EventRef) -> usize {
        self.events.cancel(target)
    }

    // --- Cycle detection ---

    /// Returns true if `from` consumes, directly or transitively, from a
    /// provider of `to`. Also true when `from == to`.
    pub(crate) fn depends_on(&self, from: NodeId, to: NodeId) -> bool {
        let mut visited = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            let Ok(node) = self.node(current) else {
                continue;
            };
            for &cp in node.consumers() {
                if let Ok(consumer) = self.consumer(cp)
                    && let Some(pp) = consumer.provider()
                    && let Ok(provider) = self.provider(pp)
                {
                    stack.push(provider.node());
                }
            }
        }
        false
    }

    /// Recomputes a node's rank: 1 for a leaf, otherwise one more than the
    /// highest-ranked node it consumes from.
    pub(crate) fn recompute_rank(&mut self, id: NodeId) {
        let Ok(node) = self.node(id) else {
            return;
        };
        let rank = node
            .consumers()
            .iter()
            .filter_map(|&cp| self.consumer(cp).ok()?.provider())
            .filter_map(|pp| self.provider(pp).ok())
            .filter_map(|p| self.node(p.node()).ok())
            .map(|n| n.rank() + 1)
            .max()
            .unwrap_or(1);
        if let Ok(node) = self.node_mut(id) {
            node.rank = rank;
        }
    }
}
