//! `NOP`: transparent pass-through with request counters.
//!
//! A nop node sits on top of a provider and exposes `<provider>.nop` with the
//! same geometry. Every request is forwarded unchanged. Useful as a probe in
//! a stack and as the class offered providers in
//! [`TasteMode::Transparent`].

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use stratum_core::{
    Bio, BioCommand, BioError, Class, ClassId, ConsumerRef, ControlRequest, CtlError, DumpTarget,
    GeomError, NodeId, NodeOps, ProviderId, ProviderRef, TasteMode, Topology, io,
};

use crate::util::{fail, node_over};

/// Class name.
pub const CLASS_NAME: &str = "NOP";

/// `ioctl` command resetting the counters.
pub const IOCTL_RESET: u32 = 0x4e01;
/// `ioctl` command returning reads and writes as two little-endian `u64`s.
pub const IOCTL_COUNTERS: u32 = 0x4e02;

/// Node operations of one nop node.
#[derive(Default)]
pub struct Nop {
    lower: OnceLock<ConsumerRef>,
    reads: AtomicU64,
    writes: AtomicU64,
    read_bytes: AtomicU64,
    written_bytes: AtomicU64,
}

impl Nop {
    /// Read requests seen since the last reset.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Write requests seen since the last reset.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        for counter in [&self.reads, &self.writes, &self.read_bytes, &self.written_bytes] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl NodeOps for Nop {
    fn start(&self, bio: Bio) {
        match bio.cmd {
            BioCommand::Read => {
                self.reads.fetch_add(1, Ordering::Relaxed);
                self.read_bytes.fetch_add(bio.length, Ordering::Relaxed);
            }
            BioCommand::Write => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                self.written_bytes.fetch_add(bio.length, Ordering::Relaxed);
            }
            _ => {}
        }
        match self.lower.get() {
            Some(lower) => io::pass_through(bio, lower),
            None => io::deliver(bio, Err(BioError::NoDevice)),
        }
    }

    fn dumpconf(&self, out: &mut String, indent: &str, target: DumpTarget) {
        if let DumpTarget::Node(_) = target {
            let _ = writeln!(out, "{indent}<reads>{}</reads>", self.reads());
            let _ = writeln!(out, "{indent}<writes>{}</writes>", self.writes());
            let _ = writeln!(out, "{indent}<readbytes>{}</readbytes>", self.read_bytes.load(Ordering::Relaxed));
            let _ = writeln!(out, "{indent}<wrotebytes>{}</wrotebytes>", self.written_bytes.load(Ordering::Relaxed));
        }
    }

    fn ioctl(&self, _provider: &ProviderRef, cmd: u32, data: &mut Vec<u8>) -> Result<(), BioError> {
        match cmd {
            IOCTL_RESET => {
                self.reset();
                Ok(())
            }
            IOCTL_COUNTERS => {
                data.clear();
                data.extend_from_slice(&self.reads().to_le_bytes());
                data.extend_from_slice(&self.writes().to_le_bytes());
                Ok(())
            }
            _ => Err(BioError::NotSupported),
        }
    }
}

/// The `NOP` class.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopClass;

impl NopClass {
    /// Stacks a nop node on `provider`.
    pub fn create(topo: &mut Topology, class: ClassId, provider: ProviderId) -> Result<NodeId, GeomError> {
        let lower = topo.provider_ref(provider)?;
        let name = format!("{}.nop", lower.name());
        let ops = Arc::new(Nop::default());
        let (node, cp) = node_over(topo, class, &name, Arc::clone(&ops) as Arc<dyn NodeOps>, provider)?;
        let exposed = topo.consumer_ref(cp).and_then(|lower_cp| {
            let _ = ops.lower.set(lower_cp);
            topo.new_provider(node, name.as_str(), lower.geometry())
        });
        let exposed = match exposed {
            Ok(pp) => pp,
            Err(err) => {
                let _ = topo.destroy_node(node);
                return Err(err);
            }
        };
        if lower.can_delete() {
            topo.set_can_delete(exposed, true)?;
        }
        tracing::debug!(target: "stratum::topology", %name, "nop attached");
        Ok(node)
    }
}

impl Class for NopClass {
    fn name(&self) -> &str {
        CLASS_NAME
    }

    fn taste(
        &self,
        topo: &mut Topology,
        class: ClassId,
        provider: ProviderId,
        mode: TasteMode,
    ) -> Option<NodeId> {
        if mode != TasteMode::Transparent {
            return None;
        }
        Self::create(topo, class, provider).ok()
    }

    /// `create`: `provider`.
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
        Self::create(topo, class, provider).map_err(|e| fail(req, e))?;
        Ok(())
    }

    /// `configure` action `reset` zeroes the counters.
    fn config_node(
        &self,
        topo: &mut Topology,
        req: &mut ControlRequest,
        node: NodeId,
        action: &str,
    ) -> Result<(), CtlError> {
        let Some(nop) = topo.node_ops_as::<Nop>(node) else {
            return Err(req.error("Node is not a nop."));
        };
        match action {
            "reset" => {
                nop.reset();
                Ok(())
            }
            other => Err(req.error(format!("Unknown action {other}."))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::md::MdClass;
    use stratum_core::{Access, Mesh};

    #[test]
    fn counts_and_resets() {
        let mesh = Mesh::new();
        mesh.register_class(Arc::new(MdClass)).unwrap();
        let nop = mesh.register_class(Arc::new(NopClass)).unwrap();
        mesh.control(ControlRequest::new("MD", "create").with("size", 4096_i64).with("name", "m"));
        let req = mesh.control(ControlRequest::new(CLASS_NAME, "create").with("provider", "m"));
        assert_eq!(req.result(), Ok(()));

        let (cp, exposed) = {
            let mut topo = mesh.topology();
            let pp = topo.provider_by_name("m.nop").unwrap();
            assert!(topo.provider_ref(pp).unwrap().can_delete());
            let user = topo.new_node(nop, "user").unwrap();
            let cp = topo.new_consumer(user).unwrap();
            topo.attach(cp, pp).unwrap();
            topo.access(cp, Access::READ_WRITE).unwrap();
            (topo.consumer_ref(cp).unwrap(), topo.provider_ref(pp).unwrap())
        };

        io::write_data(&cp, 0, vec![1; 1024]).unwrap();
        assert_eq!(io::read_data(&cp, 512, 512).unwrap(), vec![1; 512]);

        let mut counters = Vec::new();
        exposed.ioctl(IOCTL_COUNTERS, &mut counters).unwrap();
        assert_eq!(&counters[..8], &1u64.to_le_bytes());
        assert_eq!(&counters[8..], &1u64.to_le_bytes());

        let req = mesh.control(
            ControlRequest::new(CLASS_NAME, "configure")
                .with("node", "m.nop")
                .with("action", "reset"),
        );
        assert_eq!(req.result(), Ok(()));
        let node = mesh.topology().node_by_name(nop, "m.nop").unwrap();
        let ops = mesh.topology().node_ops_as::<Nop>(node).unwrap();
        assert_eq!(ops.reads(), 0);
        assert_eq!(exposed.ioctl(0xdead, &mut counters), Err(BioError::NotSupported));
    }

    #[test]
    fn only_transparent_taste_claims() {
        let mesh = Mesh::new();
        mesh.register_class(Arc::new(MdClass)).unwrap();
        let nop = mesh.register_class(Arc::new(NopClass)).unwrap();
        mesh.control(ControlRequest::new("MD", "create").with("size", 4096_i64).with("name", "m"));

        let mut topo = mesh.topology();
        let pp = topo.provider_by_name("m").unwrap();
        assert_eq!(topo.taste(pp, TasteMode::Normal), Ok(None));
        let node = topo.taste(pp, TasteMode::Transparent).unwrap().unwrap();
        assert_eq!(topo.node_by_name(nop, "m.nop"), Some(node));
    }
}
