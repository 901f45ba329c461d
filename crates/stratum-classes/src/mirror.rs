//! `MIRROR`: RAID-1 over any number of components.
//!
//! Writes, deletes and flushes go to every component and complete with the
//! first component error; reads rotate between the healthy components. A
//! component whose provider is orphaned, or shrinks below the mirror's size,
//! is dropped and the mirror carries on degraded. Only losing the last
//! component withers the node.
//!
//! There is no resynchronization: an inserted component is trusted to hold
//! the same data as the others.

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use stratum_core::{
    Bio, BioCommand, BioError, Class, ClassId, ConsumerId, ConsumerRef, ControlRequest,
    CtlError, DumpTarget, GeomError, Geometry, NodeId, NodeOps, ParamValue, ProviderId, Topology,
    ctl, io,
};

use crate::util::{drop_consumer, fail};

/// Class name.
pub const CLASS_NAME: &str = "MIRROR";

/// Prefix of exposed provider names.
pub const PREFIX: &str = "mirror/";

struct Component {
    id: ConsumerId,
    handle: ConsumerRef,
}

impl Component {
    fn healthy(&self) -> bool {
        self.handle.provider().is_some_and(|p| p.error().is_none())
    }

    fn provider_name(&self) -> Option<String> {
        self.handle.provider().map(|p| p.name().to_string())
    }
}

/// Node operations of one mirror.
pub struct Mirror {
    components: RwLock<Vec<Component>>,
    next: AtomicUsize,
    mediasize: u64,
}

impl Mirror {
    fn new(mediasize: u64) -> Self {
        Self {
            components: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
            mediasize,
        }
    }

    /// Number of attached components.
    pub fn len(&self) -> usize {
        self.components.read().len()
    }

    /// True once every component is gone.
    pub fn is_empty(&self) -> bool {
        self.components.read().is_empty()
    }

    /// Provider names of the components, in insertion order.
    pub fn component_names(&self) -> Vec<String> {
        self.components
            .read()
            .iter()
            .filter_map(Component::provider_name)
            .collect()
    }

    fn push(&self, id: ConsumerId, handle: ConsumerRef) {
        self.components.write().push(Component { id, handle });
    }

    /// Forgets `cp`. Returns how many components remain.
    fn forget(&self, cp: ConsumerId) -> usize {
        let mut components = self.components.write();
        components.retain(|c| c.id != cp);
        components.len()
    }

    fn pick_reader(&self) -> Option<ConsumerRef> {
        let components = self.components.read();
        let healthy: Vec<&Component> = components.iter().filter(|c| c.healthy()).collect();
        if healthy.is_empty() {
            return None;
        }
        let turn = self.next.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(healthy[turn].handle.clone())
    }

    fn writers(&self) -> Vec<ConsumerRef> {
        self.components
            .read()
            .iter()
            .filter(|c| c.healthy())
            .map(|c| c.handle.clone())
            .collect()
    }

    /// Drops one component, withering the node if it was the last.
    fn lose(&self, topo: &mut Topology, cp: ConsumerId, why: &str) {
        let remaining = self.forget(cp);
        if remaining == 0 {
            tracing::warn!(target: "stratum::topology", consumer = %cp, why, "last mirror component lost");
            topo.std_orphan(cp);
            return;
        }
        tracing::warn!(target: "stratum::topology", consumer = %cp, remaining, why, "mirror degraded");
        if let Err(err) = drop_consumer(topo, cp) {
            tracing::warn!(target: "stratum::topology", consumer = %cp, %err, "could not drop mirror component");
        }
    }
}

impl NodeOps for Mirror {
    fn start(&self, bio: Bio) {
        match bio.cmd {
            BioCommand::Read | BioCommand::GetAttr => match self.pick_reader() {
                Some(cp) => io::pass_through(bio, &cp),
                None => io::deliver(bio, Err(BioError::NoDevice)),
            },
            BioCommand::Write | BioCommand::Delete | BioCommand::Flush => {
                let targets = self.writers();
                if targets.is_empty() {
                    io::deliver(bio, Err(BioError::NoDevice));
                    return;
                }
                let family = bio.fan_out();
                let children: Vec<Bio> = targets.iter().map(|_| family.clone_bio()).collect();
                family.seal();
                for (child, cp) in children.into_iter().zip(&targets) {
                    io::request(child, cp);
                }
            }
        }
    }

    fn orphan(&self, topo: &mut Topology, consumer: ConsumerId) {
        self.lose(topo, consumer, "component orphaned");
    }

    fn spoiled(&self, topo: &mut Topology, consumer: ConsumerId) {
        let shrunk = topo
            .consumer(consumer)
            .ok()
            .and_then(|c| c.provider())
            .and_then(|pp| topo.provider(pp).ok())
            .is_some_and(|p| p.geometry().mediasize < self.mediasize);
        if shrunk {
            self.lose(topo, consumer, "component shrank");
        } else {
            topo.std_spoiled(consumer);
        }
    }

    fn dumpconf(&self, out: &mut String, indent: &str, target: DumpTarget) {
        match target {
            DumpTarget::Node(_) => {
                let _ = writeln!(out, "{indent}<components>{}</components>", self.len());
            }
            DumpTarget::Consumer(cp) => {
                if let Some(index) = self.components.read().iter().position(|c| c.id == cp) {
                    let _ = writeln!(out, "{indent}<index>{index}</index>");
                }
            }
            DumpTarget::Provider(_) => {}
        }
    }
}

/// The `MIRROR` class.
#[derive(Debug, Default, Clone, Copy)]
pub struct MirrorClass;

impl MirrorClass {
    /// Reads the `components` parameter: a list of provider names, or one
    /// comma-separated text.
    fn component_params(req: &mut ControlRequest) -> Result<Vec<String>, CtlError> {
        let names: Vec<String> = match req.param("components") {
            Some(ParamValue::Text(text)) => text.split(',').map(|s| s.trim().to_string()).collect(),
            Some(ParamValue::List(list)) => list
                .iter()
                .map(|raw| String::from_utf8_lossy(raw).into_owned())
                .collect(),
            _ => {
                req.get_list("components")?;
                Vec::new()
            }
        };
        if names.is_empty() || names.iter().any(String::is_empty) {
            return Err(req.error("Invalid components argument."));
        }
        Ok(names)
    }

    /// Smallest media size (rounded to the largest sector size) across
    /// `providers`.
    fn geometry(topo: &Topology, providers: &[ProviderId]) -> Result<Geometry, GeomError> {
        let mut sectorsize = 0u32;
        let mut mediasize = u64::MAX;
        for &pp in providers {
            let g = topo.provider(pp)?.geometry();
            sectorsize = sectorsize.max(g.sectorsize);
            mediasize = mediasize.min(g.mediasize);
        }
        let sector = u64::from(sectorsize.max(1));
        let geometry = Geometry::new(mediasize - mediasize % sector, sectorsize);
        geometry.validate()?;
        if geometry.mediasize == 0 {
            return Err(GeomError::InvalidGeometry("components too small".into()));
        }
        Ok(geometry)
    }

    fn build(
        topo: &mut Topology,
        class: ClassId,
        name: &str,
        providers: &[ProviderId],
    ) -> Result<NodeId, GeomError> {
        let geometry = Self::geometry(topo, providers)?;
        let ops = Arc::new(Mirror::new(geometry.mediasize));
        let node = topo.new_node_with(class, name, Arc::clone(&ops) as Arc<dyn NodeOps>)?;
        let built = providers
            .iter()
            .try_for_each(|&pp| {
                let cp = topo.new_consumer(node)?;
                topo.set_consumer_index(cp, ops.len())?;
                topo.attach(cp, pp)?;
                ops.push(cp, topo.consumer_ref(cp)?);
                Ok::<(), GeomError>(())
            })
            .and_then(|()| topo.new_provider(node, format!("{PREFIX}{name}"), geometry));
        match built {
            Ok(_) => Ok(node),
            Err(err) => {
                let _ = topo.destroy_node(node);
                Err(err)
            }
        }
    }

    fn mirror_of(topo: &Topology, req: &mut ControlRequest, node: NodeId) -> Result<Arc<Mirror>, CtlError> {
        topo.node_ops_as::<Mirror>(node)
            .ok_or_else(|| req.error("Node is not a mirror."))
    }

    fn insert(
        topo: &mut Topology,
        req: &mut ControlRequest,
        node: NodeId,
        mirror: &Mirror,
    ) -> Result<(), CtlError> {
        let name = req.get_text("component")?;
        let provider = ctl::resolve_provider(topo, req, &name)?;
        let exposed = topo
            .node(node)
            .ok()
            .and_then(|n| n.providers().iter().next().copied())
            .ok_or_else(|| req.error("Mirror has no provider."))?;
        let (held, geometry) = match topo.provider(exposed) {
            Ok(p) => (p.access(), p.geometry()),
            Err(err) => return Err(fail(req, err)),
        };
        let candidate = topo.provider_ref(provider).map_err(|e| fail(req, e))?.geometry();
        if candidate.mediasize < geometry.mediasize || geometry.sectorsize % candidate.sectorsize != 0 {
            return Err(req.error(format!("Provider {name} is too small or misaligned.")));
        }

        let cp = topo.new_consumer(node).map_err(|e| fail(req, e))?;
        let joined = topo
            .set_consumer_index(cp, mirror.len())
            .and_then(|()| topo.attach(cp, provider))
            .and_then(|()| topo.access(cp, held));
        if let Err(err) = joined {
            let _ = drop_consumer(topo, cp);
            return Err(fail(req, err));
        }
        match topo.consumer_ref(cp) {
            Ok(handle) => mirror.push(cp, handle),
            Err(err) => return Err(fail(req, err)),
        }
        tracing::info!(target: "stratum::ctl", node = %node, component = %name, %held, "mirror component inserted");
        Ok(())
    }

    fn remove(
        topo: &mut Topology,
        req: &mut ControlRequest,
        mirror: &Mirror,
    ) -> Result<(), CtlError> {
        let name = req.get_text("component")?;
        let found = mirror
            .components
            .read()
            .iter()
            .find(|c| c.provider_name().as_deref() == Some(name.as_str()))
            .map(|c| c.id);
        let Some(cp) = found else {
            return Err(req.error(format!("Component {name} not found.")));
        };
        if mirror.len() == 1 {
            return Err(req.error("Cannot remove last component."));
        }
        mirror.forget(cp);
        drop_consumer(topo, cp).map_err(|e| fail(req, e))?;
        tracing::info!(target: "stratum::ctl", component = %name, "mirror component removed");
        Ok(())
    }
}

impl Class for MirrorClass {
    fn name(&self) -> &str {
        CLASS_NAME
    }

    /// `create`: `name`, `components` (provider names).
    fn create_node(
        &self,
        topo: &mut Topology,
        req: &mut ControlRequest,
        class: ClassId,
        _provider: Option<ProviderId>,
    ) -> Result<(), CtlError> {
        let name = req.get_text("name")?;
        let names = Self::component_params(req)?;
        let mut providers = Vec::with_capacity(names.len());
        for component in &names {
            let pp = ctl::resolve_provider(topo, req, component)?;
            if providers.contains(&pp) {
                return Err(req.error(format!("Provider {component} listed twice.")));
            }
            providers.push(pp);
        }
        Self::build(topo, class, &name, &providers).map_err(|e| fail(req, e))?;
        tracing::info!(target: "stratum::ctl", %name, components = names.len(), "mirror created");
        Ok(())
    }

    /// `configure` actions `insert` and `remove`, both taking `component`.
    fn config_node(
        &self,
        topo: &mut Topology,
        req: &mut ControlRequest,
        node: NodeId,
        action: &str,
    ) -> Result<(), CtlError> {
        let mirror = Self::mirror_of(topo, req, node)?;
        match action {
            "insert" => Self::insert(topo, req, node, &mirror),
            "remove" => Self::remove(topo, req, &mirror),
            other => Err(req.error(format!("Unknown action {other}."))),
        }
    }
}
