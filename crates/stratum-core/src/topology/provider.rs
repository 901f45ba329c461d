//! Providers: the named block endpoints nodes expose.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{Access, ConsumerId, NodeId, NodeOps, TasteMode, Topology};
use crate::error::{BioError, GeomError};
use crate::event::EventRef;

/// Unique identifier for a provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProviderId(pub(crate) u32);

impl ProviderId {
    /// Returns the raw slot index.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ProviderId({})", self.0)
    }
}

/// Size and alignment of a provider's media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Media size in bytes. Always a multiple of `sectorsize`.
    pub mediasize: u64,
    /// Sector size in bytes. Nonzero power of two.
    pub sectorsize: u32,
    /// Optimal stripe size in bytes, or 0 if none.
    pub stripesize: u64,
    /// Offset of the first stripe boundary, below `stripesize`.
    pub stripeoffset: u64,
}

impl Geometry {
    /// Geometry with no stripe hint.
    pub const fn new(mediasize: u64, sectorsize: u32) -> Self {
        Self {
            mediasize,
            sectorsize,
            stripesize: 0,
            stripeoffset: 0,
        }
    }

    /// Adds a stripe hint.
    #[must_use]
    pub const fn with_stripe(mut self, stripesize: u64, stripeoffset: u64) -> Self {
        self.stripesize = stripesize;
        self.stripeoffset = stripeoffset;
        self
    }

    /// Checks the alignment rules.
    pub fn validate(&self) -> Result<(), GeomError> {
        if self.sectorsize == 0 || !self.sectorsize.is_power_of_two() {
            return Err(GeomError::InvalidGeometry(format!(
                "sector size {} is not a nonzero power of two",
                self.sectorsize
            )));
        }
        if self.mediasize % u64::from(self.sectorsize) != 0 {
            return Err(GeomError::InvalidGeometry(format!(
                "media size {} is not a multiple of sector size {}",
                self.mediasize, self.sectorsize
            )));
        }
        if self.stripesize > 0 && self.stripeoffset >= self.stripesize {
            return Err(GeomError::InvalidGeometry(format!(
                "stripe offset {} is not below stripe size {}",
                self.stripeoffset, self.stripesize
            )));
        }
        Ok(())
    }
}

/// Start/end I/O counters kept on both ends of an edge.
#[derive(Debug, Default)]
pub struct IoStats {
    started: AtomicU64,
    ended: AtomicU64,
    failed: AtomicU64,
}

impl IoStats {
    pub(crate) fn start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn end(&self, failed: bool) {
        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.ended.fetch_add(1, Ordering::Release);
    }

    /// Requests started.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Requests completed.
    pub fn ended(&self) -> u64 {
        self.ended.load(Ordering::Acquire)
    }

    /// Requests completed with an error.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Requests started but not yet completed.
    pub fn in_flight(&self) -> u64 {
        self.started().saturating_sub(self.ended())
    }

    /// Clears all counters.
    pub fn reset(&self) {
        self.started.store(0, Ordering::Relaxed);
        self.ended.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
    }
}

pub(crate) struct ProviderShared {
    id: ProviderId,
    name: String,
    node: NodeId,
    ops: Arc<dyn NodeOps>,
    mediasize: AtomicU64,
    sectorsize: u32,
    stripesize: u64,
    stripeoffset: u64,
    can_delete: AtomicBool,
    error: Mutex<Option<BioError>>,
    stats: IoStats,
}

/// Lock-free view of a provider for the I/O path.
///
/// Cheap to clone. Keeps working (reporting the provider's error) after the
/// provider has left the topology.
#[derive(Clone)]
pub struct ProviderRef(Arc<ProviderShared>);

impl ProviderRef {
    /// Provider handle in the topology.
    pub fn id(&self) -> ProviderId {
        self.0.id
    }

    /// Globally unique provider name.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Node exposing this provider.
    pub fn node(&self) -> NodeId {
        self.0.node
    }

    /// Current media size in bytes.
    pub fn mediasize(&self) -> u64 {
        self.0.mediasize.load(Ordering::Acquire)
    }

    /// Sector size in bytes.
    pub fn sectorsize(&self) -> u32 {
        self.0.sectorsize
    }

    /// Current geometry.
    pub fn geometry(&self) -> Geometry {
        Geometry {
            mediasize: self.mediasize(),
            sectorsize: self.0.sectorsize,
            stripesize: self.0.stripesize,
            stripeoffset: self.0.stripeoffset,
        }
    }

    /// True if the provider accepts delete (trim) requests.
    pub fn can_delete(&self) -> bool {
        self.0.can_delete.load(Ordering::Relaxed)
    }

    /// The error the provider carries, if it has failed.
    pub fn error(&self) -> Option<BioError> {
        *self.0.error.lock()
    }

    /// I/O counters.
    pub fn stats(&self) -> &IoStats {
        &self.0.stats
    }

    pub(crate) fn ops(&self) -> &Arc<dyn NodeOps> {
        &self.0.ops
    }

    /// Sends a device control command to the exposing node.
    pub fn ioctl(&self, cmd: u32, data: &mut Vec<u8>) -> Result<(), BioError> {
        if let Some(err) = self.error() {
            return Err(err);
        }
        self.0.ops.ioctl(self, cmd, data)
    }

    pub(crate) fn set_error(&self, error: Option<BioError>) {
        *self.0.error.lock() = error;
    }

    pub(crate) fn shared(&self) -> &Arc<ProviderShared> {
        &self.0
    }

    pub(crate) fn from_shared(shared: Arc<ProviderShared>) -> Self {
        Self(shared)
    }
}

impl core::fmt::Debug for ProviderRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProviderRef")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .finish_non_exhaustive()
    }
}

/// A live provider in the topology.
pub struct Provider {
    handle: ProviderRef,
    pub(crate) consumers: BTreeSet<ConsumerId>,
    pub(crate) access: Access,
    pub(crate) orphaned: bool,
    pub(crate) withering: bool,
}

impl Provider {
    /// Provider handle.
    pub fn id(&self) -> ProviderId {
        self.handle.id()
    }

    /// Globally unique name.
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Exposing node.
    pub fn node(&self) -> NodeId {
        self.handle.node()
    }

    /// Attached consumers.
    pub fn consumers(&self) -> &BTreeSet<ConsumerId> {
        &self.consumers
    }

    /// Aggregate access counts (the sum over attached consumers).
    pub fn access(&self) -> Access {
        self.access
    }

    /// ORPHAN flag: permanently failed, refuses new attachments.
    pub fn is_orphaned(&self) -> bool {
        self.orphaned
    }

    /// WITHER flag: destroyed as soon as the last consumer leaves.
    pub fn is_withering(&self) -> bool {
        self.withering
    }

    /// Current error value.
    pub fn error(&self) -> Option<BioError> {
        self.handle.error()
    }

    /// Current geometry.
    pub fn geometry(&self) -> Geometry {
        self.handle.geometry()
    }

    /// The lock-free I/O view.
    pub fn handle(&self) -> &ProviderRef {
        &self.handle
    }

    pub(crate) fn mark_withering(&mut self, error: BioError) {
        self.withering = true;
        if self.handle.error().is_none() {
            self.handle.set_error(Some(error));
        }
    }
}

impl Topology {
    /// Exposes a new provider on `node`.
    ///
    /// Provider names are unique across the whole mesh. With auto-taste
    /// enabled a normal-mode taste is queued for the new provider.
    pub fn new_provider(
        &mut self,
        node: NodeId,
        name: impl Into<String>,
        geometry: Geometry,
    ) -> Result<ProviderId, GeomError> {
        let name = name.into();
        geometry.validate()?;
        let ops = Arc::clone(self.node(node)?.ops());
        if self.provider_by_name(&name).is_some() {
            return Err(GeomError::NameConflict {
                kind: "provider",
                name,
            });
        }

        let id = ProviderId(self.providers.len() as u32);
        let handle = ProviderRef(Arc::new(ProviderShared {
            id,
            name,
            node,
            ops,
            mediasize: AtomicU64::new(geometry.mediasize),
            sectorsize: geometry.sectorsize,
            stripesize: geometry.stripesize,
            stripeoffset: geometry.stripeoffset,
            can_delete: AtomicBool::new(false),
            error: Mutex::new(None),
            stats: IoStats::default(),
        }));
        tracing::debug!(
            target: "stratum::topology",
            provider = %handle.name(),
            node = %node,
            mediasize = geometry.mediasize,
            sectorsize = geometry.sectorsize,
            "provider created"
        );
        self.providers.push(Some(Provider {
            handle,
            consumers: BTreeSet::new(),
            access: Access::NONE,
            orphaned: false,
            withering: false,
        }));
        self.node_mut(node)?.providers.insert(id);

        if self.settings().auto_taste {
            self.post_event(&[EventRef::Provider(id)], move |topo| {
                if let Err(err) = topo.taste(id, TasteMode::Normal) {
                    tracing::warn!(target: "stratum::topology", provider = %id, %err, "auto-taste failed");
                }
            })?;
        }
        Ok(id)
    }

    /// Destroys a provider. Fails while consumers are attached.
    pub fn destroy_provider(&mut self, id: ProviderId) -> Result<(), GeomError> {
        if !self.provider(id)?.consumers.is_empty() {
            return Err(GeomError::ProviderBusy(id));
        }
        self.destroy_provider_internal(id)
    }

    pub(crate) fn destroy_provider_internal(&mut self, id: ProviderId) -> Result<(), GeomError> {
        let provider = self.provider(id)?;
        if !provider.consumers.is_empty() {
            return Err(GeomError::ProviderBusy(id));
        }
        let node = provider.node();
        let Some(provider) = self.providers.get_mut(id.index()).and_then(Option::take) else {
            return Err(GeomError::ProviderNotFound(id));
        };
        if provider.handle.error().is_none() {
            provider.handle.set_error(Some(BioError::NoDevice));
        }
        if let Ok(node) = self.node_mut(node) {
            node.providers.remove(&id);
        }
        self.cancel_event(EventRef::Provider(id));
        tracing::debug!(target: "stratum::topology", provider = %provider.name(), "provider destroyed");
        Ok(())
    }

    /// Destroys a withering provider once its last consumer has left, and
    /// withers its node if that leaves the node empty.
    pub(crate) fn reap_provider(&mut self, id: ProviderId) {
        let Ok(provider) = self.provider(id) else {
            return;
        };
        if !provider.withering || !provider.consumers.is_empty() {
            return;
        }
        let node = provider.node();
        let error = provider.error().unwrap_or(BioError::NoDevice);
        if self.destroy_provider_internal(id).is_err() {
            return;
        }
        if let Ok(n) = self.node(node)
            && !n.withering
            && n.providers.is_empty()
            && n.consumers.is_empty()
            && let Err(err) = self.wither_node(node, error)
        {
            tracing::warn!(target: "stratum::topology", node = %node, %err, "wither of emptied node failed");
        }
    }

    /// Marks a provider permanently failed and notifies its consumers.
    ///
    /// Sets ORPHAN and WITHER and the provider error, then queues one event
    /// that calls the orphan callback of each attached consumer's node. The
    /// callbacks never run synchronously inside this call. Orphaning an
    /// already orphaned provider does nothing.
    pub fn orphan_provider(&mut self, id: ProviderId, error: BioError) -> Result<(), GeomError> {
        let provider = self.provider_mut(id)?;
        if provider.orphaned {
            return Ok(());
        }
        provider.orphaned = true;
        provider.withering = true;
        provider.handle.set_error(Some(error));
        let idle = provider.consumers.is_empty();
        tracing::info!(
            target: "stratum::topology",
            provider = %provider.name(),
            %error,
            consumers = provider.consumers.len(),
            "provider orphaned"
        );

        if idle {
            self.reap_provider(id);
            return Ok(());
        }
        self.post_event(&[EventRef::Provider(id)], move |topo| topo.run_orphan(id))
    }

    fn run_orphan(&mut self, id: ProviderId) {
        let Ok(provider) = self.provider(id) else {
            return;
        };
        let consumers: Vec<ConsumerId> = provider.consumers.iter().copied().collect();
        for cp in consumers {
            let Ok(consumer) = self.consumer(cp) else {
                continue;
            };
            if consumer.provider() != Some(id) {
                continue;
            }
            let Ok(node) = self.node(consumer.node()) else {
                continue;
            };
            let ops = Arc::clone(node.ops());
            tracing::trace!(target: "stratum::topology", consumer = %cp, provider = %id, "orphan callback");
            ops.orphan(self, cp);
        }
        self.reap_provider(id);
    }

    /// Sets a provider's error without orphaning it. New opens and I/O fail
    /// with `error` until it is cleared with `None`.
    pub fn error_provider(&mut self, id: ProviderId, error: Option<BioError>) -> Result<(), GeomError> {
        let provider = self.provider(id)?;
        provider.handle.set_error(error);
        tracing::debug!(target: "stratum::topology", provider = %provider.name(), ?error, "provider error set");
        Ok(())
    }

    /// Marks `consumer` spoiled and queues its node's spoiled callback.
    ///
    /// The edge stays intact; the consumer's node decides what to do.
    pub fn spoil(&mut self, provider: ProviderId, consumer: ConsumerId) -> Result<(), GeomError> {
        if self.consumer(consumer)?.provider() != Some(provider) {
            return Err(GeomError::NotAttached(consumer));
        }
        self.consumer_mut(consumer)?.spoiled = true;
        self.post_event(&[EventRef::Consumer(consumer)], move |topo| {
            let Ok(c) = topo.consumer(consumer) else {
                return;
            };
            if !c.is_spoiled() {
                return;
            }
            let Ok(node) = topo.node(c.node()) else {
                return;
            };
            let ops = Arc::clone(node.ops());
            ops.spoiled(topo, consumer);
        })
    }

    /// Spoils every consumer of `provider` except `except`. Returns how many
    /// consumers were spoiled.
    pub fn spoil_others(
        &mut self,
        provider: ProviderId,
        except: Option<ConsumerId>,
    ) -> Result<usize, GeomError> {
        let targets: Vec<ConsumerId> = self
            .provider(provider)?
            .consumers
            .iter()
            .copied()
            .filter(|&cp| Some(cp) != except)
            .collect();
        for &cp in &targets {
            self.spoil(provider, cp)?;
        }
        Ok(targets.len())
    }

    /// Changes a provider's media size. Callers usually follow up with
    /// [`spoil_others`](Topology::spoil_others).
    pub fn set_mediasize(&mut self, id: ProviderId, mediasize: u64) -> Result<(), GeomError> {
        let handle = self.provider(id)?.handle();
        Geometry {
            mediasize,
            ..handle.geometry()
        }
        .validate()?;
        handle.0.mediasize.store(mediasize, Ordering::Release);
        tracing::debug!(target: "stratum::topology", provider = %handle.name(), mediasize, "media size changed");
        Ok(())
    }

    /// Sets the CAN_DELETE flag.
    pub fn set_can_delete(&mut self, id: ProviderId, can_delete: bool) -> Result<(), GeomError> {
        self.provider(id)?
            .handle()
            .0
            .can_delete
            .store(can_delete, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_rejects_zero_sector() {
        assert!(matches!(
            Geometry::new(1024, 0).validate(),
            Err(GeomError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn geometry_rejects_unaligned_media() {
        assert!(Geometry::new(1000, 512).validate().is_err());
        assert!(Geometry::new(1024, 512).validate().is_ok());
    }

    #[test]
    fn geometry_stripe_offset_below_size() {
        assert!(Geometry::new(4096, 512).with_stripe(1024, 512).validate().is_ok());
        assert!(Geometry::new(4096, 512).with_stripe(1024, 1024).validate().is_err());
    }

    #[test]
    fn stats_track_in_flight() {
        let stats = IoStats::default();
        stats.start();
        stats.start();
        stats.end(true);
        assert_eq!(stats.in_flight(), 1);
        assert_eq!(stats.failed(), 1);
        stats.reset();
        assert_eq!(stats.started(), 0);
    }
}
