//! Consumers: a node's attachment points onto providers.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use arc_swap::ArcSwapOption;

use super::provider::ProviderShared;
use super::{Access, IoStats, NodeId, ProviderId, ProviderRef, Topology};
use crate::error::GeomError;
use crate::event::EventRef;

/// Unique identifier for a consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConsumerId(pub(crate) u32);

impl ConsumerId {
    /// Returns the raw slot index.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ConsumerId({})", self.0)
    }
}

struct ConsumerShared {
    id: ConsumerId,
    node: NodeId,
    provider: ArcSwapOption<ProviderShared>,
    read: AtomicI32,
    write: AtomicI32,
    exclusive: AtomicI32,
    stats: IoStats,
}

/// Lock-free view of a consumer: what a node keeps to issue I/O.
///
/// The link to the provider is swapped atomically by attach/detach, so the
/// I/O path sees either the old or the new provider and never needs the
/// topology lock.
#[derive(Clone)]
pub struct ConsumerRef(Arc<ConsumerShared>);

impl ConsumerRef {
    /// Consumer handle in the topology.
    pub fn id(&self) -> ConsumerId {
        self.0.id
    }

    /// Owning node.
    pub fn node(&self) -> NodeId {
        self.0.node
    }

    /// The attached provider, if any.
    pub fn provider(&self) -> Option<ProviderRef> {
        self.0.provider.load_full().map(ProviderRef::from_shared)
    }

    /// Access counts as last granted.
    pub fn access(&self) -> Access {
        Access {
            read: self.0.read.load(Ordering::Acquire),
            write: self.0.write.load(Ordering::Acquire),
            exclusive: self.0.exclusive.load(Ordering::Acquire),
        }
    }

    /// I/O counters.
    pub fn stats(&self) -> &IoStats {
        &self.0.stats
    }

    pub(crate) fn store_access(&self, access: Access) {
        self.0.read.store(access.read, Ordering::Release);
        self.0.write.store(access.write, Ordering::Release);
        self.0.exclusive.store(access.exclusive, Ordering::Release);
    }

    fn link(&self, provider: Option<&ProviderRef>) {
        self.0
            .provider
            .store(provider.map(|p| Arc::clone(p.shared())));
    }
}

impl core::fmt::Debug for ConsumerRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConsumerRef")
            .field("id", &self.0.id)
            .field("node", &self.0.node)
            .finish_non_exhaustive()
    }
}

/// A live consumer in the topology.
pub struct Consumer {
    handle: ConsumerRef,
    pub(crate) provider: Option<ProviderId>,
    pub(crate) access: Access,
    pub(crate) spoiled: bool,
    pub(crate) index: usize,
}

impl Consumer {
    /// Consumer handle.
    pub fn id(&self) -> ConsumerId {
        self.handle.id()
    }

    /// Owning node.
    pub fn node(&self) -> NodeId {
        self.handle.node()
    }

    /// Attached provider.
    pub fn provider(&self) -> Option<ProviderId> {
        self.provider
    }

    /// Held access counts.
    pub fn access(&self) -> Access {
        self.access
    }

    /// True between a spoil and its acknowledgement.
    pub fn is_spoiled(&self) -> bool {
        self.spoiled
    }

    /// Module-private index (e.g. a mirror component slot).
    pub fn index(&self) -> usize {
        self.index
    }

    /// The lock-free I/O view.
    pub fn handle(&self) -> &ConsumerRef {
        &self.handle
    }
}

impl Topology {
    /// Creates an unattached consumer owned by `node`, with zero access.
    pub fn new_consumer(&mut self, node: NodeId) -> Result<ConsumerId, GeomError> {
        self.node(node)?;
        let id = ConsumerId(self.consumers.len() as u32);
        let handle = ConsumerRef(Arc::new(ConsumerShared {
            id,
            node,
            provider: ArcSwapOption::empty(),
            read: AtomicI32::new(0),
            write: AtomicI32::new(0),
            exclusive: AtomicI32::new(0),
            stats: IoStats::default(),
        }));
        self.consumers.push(Some(Consumer {
            handle,
            provider: None,
            access: Access::NONE,
            spoiled: false,
            index: 0,
        }));
        self.node_mut(node)?.consumers.insert(id);
        tracing::trace!(target: "stratum::topology", consumer = %id, node = %node, "consumer created");
        Ok(id)
    }

    /// Sets a consumer's module-private index.
    pub fn set_consumer_index(&mut self, id: ConsumerId, index: usize) -> Result<(), GeomError> {
        self.consumer_mut(id)?.index = index;
        Ok(())
    }

    /// Destroys a consumer. It must be detached first.
    pub fn destroy_consumer(&mut self, id: ConsumerId) -> Result<(), GeomError> {
        let consumer = self.consumer(id)?;
        if consumer.provider.is_some() {
            return Err(GeomError::ConsumerAttached(id));
        }
        let node = consumer.node();
        self.consumers[id.index()] = None;
        if let Ok(node) = self.node_mut(node) {
            node.consumers.remove(&id);
        }
        self.cancel_event(EventRef::Consumer(id));
        tracing::trace!(target: "stratum::topology", consumer = %id, "consumer destroyed");
        Ok(())
    }

    /// Attaches a consumer to a provider.
    ///
    /// Fails if the consumer is already attached, if the provider has been
    /// orphaned, or if the consumer's node would end up consuming from itself.
    pub fn attach(&mut self, cp: ConsumerId, pp: ProviderId) -> Result<(), GeomError> {
        let consumer = self.consumer(cp)?;
        if consumer.provider.is_some() {
            return Err(GeomError::AlreadyAttached(cp));
        }
        let node = consumer.node();
        let provider = self.provider(pp)?;
        if provider.orphaned {
            return Err(GeomError::ProviderOrphaned(pp));
        }
        if self.depends_on(provider.node(), node) {
            return Err(GeomError::WouldCycle {
                consumer: cp,
                provider: pp,
            });
        }

        let handle = provider.handle().clone();
        self.provider_mut(pp)?.consumers.insert(cp);
        let consumer = self.consumer_mut(cp)?;
        consumer.provider = Some(pp);
        consumer.handle.link(Some(&handle));
        self.recompute_rank(node);
        tracing::debug!(
            target: "stratum::topology",
            consumer = %cp,
            provider = %handle.name(),
            "attached"
        );
        Ok(())
    }

    /// Detaches a consumer, then lets the washer free whatever became idle.
    ///
    /// Fails unless all access counts are zero. A withering provider that
    /// loses its last consumer is destroyed.
    pub fn detach(&mut self, cp: ConsumerId) -> Result<(), GeomError> {
        self.detach_internal(cp)?;
        self.wither_wash();
        Ok(())
    }

    pub(crate) fn detach_internal(&mut self, cp: ConsumerId) -> Result<(), GeomError> {
        let consumer = self.consumer(cp)?;
        let Some(pp) = consumer.provider else {
            return Err(GeomError::NotAttached(cp));
        };
        if !consumer.access.is_zero() {
            return Err(GeomError::ConsumerOpen(cp));
        }
        let node = consumer.node();

        let consumer = self.consumer_mut(cp)?;
        consumer.provider = None;
        consumer.spoiled = false;
        consumer.handle.link(None);
        if let Ok(provider) = self.provider_mut(pp) {
            provider.consumers.remove(&cp);
        }
        self.recompute_rank(node);
        tracing::debug!(target: "stratum::topology", consumer = %cp, provider = %pp, "detached");
        self.reap_provider(pp);
        Ok(())
    }
}
