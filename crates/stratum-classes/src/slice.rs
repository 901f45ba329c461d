//! `SLICE`: fixed windows onto a lower provider.
//!
//! A slice node consumes one provider and exposes a provider covering
//! `[offset, offset + length)` of it. Requests are cloned, shifted by the
//! window offset and sent down; the media-end checks of the pipeline already
//! keep them inside the window.

use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};

use stratum_core::{
    Bio, BioError, Class, ClassId, ConsumerRef, ControlRequest, CtlError, DumpTarget,
    Geometry, NodeOps, ProviderId, Topology, io,
};

use crate::util::{fail, node_over};

/// Class name.
pub const CLASS_NAME: &str = "SLICE";

/// Node operations translating requests by a fixed offset.
pub struct Window {
    lower: OnceLock<ConsumerRef>,
    offset: u64,
}

impl Window {
    /// A window starting `offset` bytes into the lower provider.
    pub fn new(offset: u64) -> Self {
        Self {
            lower: OnceLock::new(),
            offset,
        }
    }

    /// Byte offset into the lower provider.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Binds the consumer requests are forwarded to. Only the first call
    /// has any effect.
    pub fn bind(&self, lower: ConsumerRef) {
        let _ = self.lower.set(lower);
    }
}

impl NodeOps for Window {
    fn start(&self, bio: Bio) {
        let Some(lower) = self.lower.get() else {
            io::deliver(bio, Err(BioError::NoDevice));
            return;
        };
        if !bio.cmd.is_ranged() {
            io::pass_through(bio, lower);
            return;
        }
        let family = bio.fan_out();
        let mut child = family.clone_bio();
        child.offset += self.offset;
        family.seal();
        io::request(child, lower);
    }

    fn dumpconf(&self, out: &mut String, indent: &str, target: DumpTarget) {
        if let DumpTarget::Provider(_) = target {
            let _ = writeln!(out, "{indent}<offset>{}</offset>", self.offset);
        }
    }
}

/// Builds a window node named `name` over `provider` exposing `length`
/// bytes from `offset`. The exposed provider carries the same name.
pub fn build_window(
    topo: &mut Topology,
    class: ClassId,
    name: &str,
    provider: ProviderId,
    offset: u64,
    length: u64,
) -> Result<ProviderId, stratum_core::GeomError> {
    let lower = topo.provider_ref(provider)?.geometry();
    let geometry = Geometry {
        mediasize: length,
        sectorsize: lower.sectorsize,
        stripesize: lower.stripesize,
        stripeoffset: if lower.stripesize > 0 {
            (lower.stripeoffset + lower.stripesize - offset % lower.stripesize) % lower.stripesize
        } else {
            0
        },
    };
    geometry.validate()?;

    let ops = Arc::new(Window::new(offset));
    let (node, cp) = node_over(topo, class, name, Arc::clone(&ops) as Arc<dyn NodeOps>, provider)?;
    ops.bind(topo.consumer_ref(cp)?);
    match topo.new_provider(node, name, geometry) {
        Ok(pp) => Ok(pp),
        Err(err) => {
            let _ = topo.destroy_node(node);
            Err(err)
        }
    }
}

/// The `SLICE` class.
#[derive(Debug, Default, Clone, Copy)]
pub struct SliceClass;

impl Class for SliceClass {
    fn name(&self) -> &str {
        CLASS_NAME
    }

    /// `create`: `provider`, `offset`, optional `length` (default: to the
    /// end), optional `name` (default `<provider>s<n>`).
    fn create_node(
        &self,
        topo: &mut Topology,
        req: &mut ControlRequest,
        class: ClassId,
        provider: Option<ProviderId>,
    ) -> Result<(), CtlError> {
        let Some(provider) = provider else {
            return Err(req.error("Missing provider argument."));
        };
        let lower = topo.provider_ref(provider).map_err(|e| fail(req, e))?;
        let media = lower.mediasize();
        let sector = u64::from(lower.sectorsize());

        let offset = req.get_int("offset")?;
        if offset < 0 || offset as u64 % sector != 0 || offset as u64 >= media {
            return Err(req.error("Invalid offset argument."));
        }
        let offset = offset as u64;
        let length = match req.opt_int("length")? {
            None => media - offset,
            Some(len) if len > 0 && offset + len as u64 <= media && len as u64 % sector == 0 => len as u64,
            Some(_) => return Err(req.error("Invalid length argument.")),
        };

        let name = match req.text("name") {
            Some(name) => name.to_string(),
            None => (0u32..)
                .map(|n| format!("{}s{n}", lower.name()))
                .find(|n| topo.provider_by_name(n).is_none())
                .unwrap_or_default(),
        };
        build_window(topo, class, &name, provider, offset, length).map_err(|e| fail(req, e))?;
        tracing::info!(target: "stratum::ctl", %name, lower = %lower.name(), offset, length, "slice created");
        req.set_param("name", name);
        Ok(())
    }
}
