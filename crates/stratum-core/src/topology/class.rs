//! Transformation classes and class-driven discovery ("taste").
//!
//! A [`Class`] describes one kind of transformation (a partition slicer, a
//! mirror, a memory disk). Registering it with the topology makes it eligible
//! to taste providers and to receive control requests; every node it creates
//! is recorded in its [`ClassEntry`].

use std::collections::BTreeSet;
use std::sync::Arc;

use super::{NodeId, NodeOps, ProviderId, StdOps, Topology};
use crate::ctl::{ControlRequest, CtlError};
use crate::error::GeomError;

/// Framework interface version a class must declare to be registered.
pub const CLASS_VERSION: u32 = 0x2004_1207;

/// Unique identifier for a registered class.
///
/// Assigned in registration order and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassId(pub(crate) u32);

impl ClassId {
    /// Returns the raw slot index.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for ClassId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ClassId({})", self.0)
    }
}

/// How insistently a class should look at a provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TasteMode {
    /// Skip providers that are already claimed by some consumer.
    Normal,
    /// Re-evaluate even claimed providers (e.g. a class registered late).
    Insist,
    /// Offer the provider for an invisible pass-through overlay.
    Transparent,
}

/// Callback table of a transformation class.
///
/// Only [`name`](Class::name) is required. Every other hook has the behavior
/// of a class that does not care about it: tastes nothing, creates nothing,
/// destroys nodes with [`Topology::destroy_node`], rejects unknown verbs.
///
/// Callbacks that take `&mut Topology` run with the topology lock held.
pub trait Class: Send + Sync {
    /// Class name, unique within the mesh.
    fn name(&self) -> &str;

    /// Interface version; must equal [`CLASS_VERSION`].
    fn version(&self) -> u32 {
        CLASS_VERSION
    }

    /// Taste priority. Higher values are offered providers first.
    fn priority(&self) -> i32 {
        0
    }

    /// One-time hook run when the class is registered.
    fn init(&self) {}

    /// One-time hook run when the class is unregistered.
    fn fini(&self) {}

    /// Looks at `provider` and optionally instantiates a node on top of it.
    ///
    /// Returning `Some` claims the provider; no further class is asked.
    fn taste(
        &self,
        _topo: &mut Topology,
        _class: ClassId,
        _provider: ProviderId,
        _mode: TasteMode,
    ) -> Option<NodeId> {
        None
    }

    /// Node operations copied into nodes created without explicit ones.
    fn node_ops(&self) -> Arc<dyn NodeOps> {
        Arc::new(StdOps)
    }

    /// First-level control request handler.
    ///
    /// The default resolves the standard verbs (`create`, `destroy`,
    /// `configure`, `list`) and routes them to the hooks below.
    fn ctlreq(
        &self,
        topo: &mut Topology,
        req: &mut ControlRequest,
        class: ClassId,
        verb: &str,
    ) -> Result<(), CtlError> {
        crate::ctl::std_ctlreq(self, topo, req, class, verb)
    }

    /// Handles the `create` verb. `provider` is set when the request named one.
    fn create_node(
        &self,
        _topo: &mut Topology,
        req: &mut ControlRequest,
        _class: ClassId,
        _provider: Option<ProviderId>,
    ) -> Result<(), CtlError> {
        Err(req.error(format!("class '{}' does not support create", self.name())))
    }

    /// Handles the `destroy` verb for a resolved node.
    fn destroy_node(
        &self,
        topo: &mut Topology,
        req: &mut ControlRequest,
        _class: ClassId,
        node: NodeId,
    ) -> Result<(), CtlError> {
        crate::ctl::std_destroy_node(topo, req, node)
    }

    /// Handles the `configure` verb for a resolved node. `action` is the
    /// request's `action` parameter.
    fn config_node(
        &self,
        _topo: &mut Topology,
        req: &mut ControlRequest,
        _node: NodeId,
        action: &str,
    ) -> Result<(), CtlError> {
        Err(req.error(format!(
            "class '{}' has no configure action '{action}'",
            self.name()
        )))
    }
}

/// A registered class and the nodes it owns.
pub struct ClassEntry {
    id: ClassId,
    name: String,
    imp: Arc<dyn Class>,
    pub(crate) nodes: BTreeSet<NodeId>,
}

impl ClassEntry {
    /// Returns the class handle.
    pub fn id(&self) -> ClassId {
        self.id
    }

    /// Returns the class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the class implementation.
    pub fn imp(&self) -> &Arc<dyn Class> {
        &self.imp
    }

    /// Returns the nodes instantiated by this class.
    pub fn nodes(&self) -> &BTreeSet<NodeId> {
        &self.nodes
    }
}

impl Topology {
    /// Registers a class, runs its init hook and lets it taste every existing
    /// provider in [`TasteMode::Insist`].
    pub fn register_class(&mut self, imp: Arc<dyn Class>) -> Result<ClassId, GeomError> {
        let name = imp.name().to_string();
        if imp.version() != CLASS_VERSION {
            return Err(GeomError::VersionMismatch {
                class: name,
                expected: CLASS_VERSION,
                found: imp.version(),
            });
        }
        if self.class_by_name(&name).is_some() {
            return Err(GeomError::NameConflict {
                kind: "class",
                name,
            });
        }

        let id = ClassId(self.classes.len() as u32);
        self.classes.push(Some(ClassEntry {
            id,
            name: name.clone(),
            imp: Arc::clone(&imp),
            nodes: BTreeSet::new(),
        }));
        imp.init();
        tracing::info!(target: "stratum::topology", class = %name, "class registered");

        let existing: Vec<ProviderId> = self.providers().map(|p| p.id()).collect();
        for pp in existing {
            if self.provider(pp).is_ok() {
                self.taste_class(id, pp, TasteMode::Insist)?;
            }
        }
        Ok(id)
    }

    /// Unregisters a class. Fails while the class still owns nodes.
    pub fn unregister_class(&mut self, id: ClassId) -> Result<(), GeomError> {
        let entry = self.class(id)?;
        if !entry.nodes.is_empty() {
            return Err(GeomError::ClassBusy {
                class: entry.name.clone(),
                nodes: entry.nodes.len(),
            });
        }
        let imp = Arc::clone(&entry.imp);
        imp.fini();
        let name = entry.name.clone();
        self.classes[id.index()] = None;
        tracing::info!(target: "stratum::topology", class = %name, "class unregistered");
        Ok(())
    }

    /// Offers `provider` to every registered class, highest priority first,
    /// until one of them instantiates a node on it.
    pub fn taste(
        &mut self,
        provider: ProviderId,
        mode: TasteMode,
    ) -> Result<Option<NodeId>, GeomError> {
        let pp = self.provider(provider)?;
        if pp.is_orphaned() {
            return Ok(None);
        }
        if mode == TasteMode::Normal && !pp.consumers().is_empty() {
            tracing::trace!(
                target: "stratum::topology",
                provider = %pp.name(),
                "taste skipped: provider already claimed"
            );
            return Ok(None);
        }

        for class in self.taste_order() {
            if self.provider(provider).is_err() {
                break;
            }
            if let Some(node) = self.taste_class(class, provider, mode)? {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    /// Class handles sorted by descending priority, then registration order.
    fn taste_order(&self) -> Vec<ClassId> {
        let mut order: Vec<(i32, ClassId)> = self
            .classes()
            .map(|c| (c.imp.priority(), c.id))
            .collect();
        order.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        order.into_iter().map(|(_, id)| id).collect()
    }

    fn taste_class(
        &mut self,
        class: ClassId,
        provider: ProviderId,
        mode: TasteMode,
    ) -> Result<Option<NodeId>, GeomError> {
        if self.class_consumes(class, provider) {
            return Ok(None);
        }
        let imp = Arc::clone(self.class(class)?.imp());
        let found = imp.taste(self, class, provider, mode);
        if let Some(node) = found {
            tracing::debug!(
                target: "stratum::topology",
                class = %imp.name(),
                node = %node,
                provider = %provider,
                ?mode,
                "taste claimed provider"
            );
        }
        Ok(found)
    }

    /// True if some node of `class` already consumes from `provider`.
    fn class_consumes(&self, class: ClassId, provider: ProviderId) -> bool {
        let Ok(pp) = self.provider(provider) else {
            return false;
        };
        pp.consumers().iter().any(|&cp| {
            self.consumer(cp)
                .and_then(|c| self.node(c.node()))
                .is_ok_and(|n| n.class() == class)
        })
    }
}
