//! `LABEL`: name-based access to providers carrying a label sector.
//!
//! The first sector of a labeled provider holds:
//!
//! | Bytes | Content |
//! |-------|---------|
//! | 0..8 | magic `STRATLBL` |
//! | 8..10 | name length, little-endian `u16` |
//! | 10.. | name (UTF-8) |
//!
//! Tasting a provider reads that sector through a short-lived probe node.
//! On a match the class builds a window node exposing `label/<name>`, which
//! covers everything after the label sector.
//!
//! Class-specific verbs: `label` (`provider`, `name`) writes a label and
//! tastes the provider again; `clear` (`provider`) zeroes the label sector.

use std::sync::Arc;

use stratum_core::{
    Access, BioError, Class, ClassId, ConsumerRef, ControlRequest, CtlError, GeomError, NodeId,
    ProviderId, StdOps, TasteMode, Topology, ctl, io,
};

use crate::slice::build_window;
use crate::util::{drop_consumer, fail, with_access};

/// Class name.
pub const CLASS_NAME: &str = "LABEL";

/// Label sector magic.
pub const MAGIC: &[u8; 8] = b"STRATLBL";

/// Prefix of exposed provider names.
pub const PREFIX: &str = "label/";

/// Encodes a label sector of `sectorsize` bytes. `None` if the name does not fit.
pub fn encode(name: &str, sectorsize: usize) -> Option<Vec<u8>> {
    let len = u16::try_from(name.len()).ok()?;
    if name.is_empty() || MAGIC.len() + 2 + name.len() > sectorsize {
        return None;
    }
    let mut sector = vec![0; sectorsize];
    sector[..8].copy_from_slice(MAGIC);
    sector[8..10].copy_from_slice(&len.to_le_bytes());
    sector[10..10 + name.len()].copy_from_slice(name.as_bytes());
    Some(sector)
}

/// Decodes a label sector. `None` if it carries no valid label.
pub fn decode(sector: &[u8]) -> Option<String> {
    if sector.get(..8)? != MAGIC {
        return None;
    }
    let len = u16::from_le_bytes([*sector.get(8)?, *sector.get(9)?]) as usize;
    let name = std::str::from_utf8(sector.get(10..10 + len)?).ok()?;
    (!name.is_empty() && !name.contains('/')).then(|| name.to_string())
}

/// The `LABEL` class.
#[derive(Debug, Default, Clone, Copy)]
pub struct LabelClass;

impl LabelClass {
    /// Runs `f` against a temporary consumer of `provider` opened for `mode`.
    fn probe<T>(
        topo: &mut Topology,
        class: ClassId,
        provider: ProviderId,
        mode: Access,
        f: impl FnOnce(&ConsumerRef) -> T,
    ) -> Result<T, GeomError> {
        let name = format!("{}.probe", topo.provider(provider)?.name());
        let node = topo.new_node_with(class, name.as_str(), Arc::new(StdOps))?;
        let outcome = topo.new_consumer(node).and_then(|cp| {
            topo.attach(cp, provider)?;
            let handle = topo.consumer_ref(cp)?;
            let out = with_access(topo, cp, mode, |_| f(&handle));
            drop_consumer(topo, cp)?;
            out
        });
        let _ = topo.destroy_node(node);
        outcome
    }

    fn read_label(topo: &mut Topology, class: ClassId, provider: ProviderId) -> Option<String> {
        let sector = u64::from(topo.provider(provider).ok()?.geometry().sectorsize);
        let data = Self::probe(topo, class, provider, Access::READ, |cp| io::read_data(cp, 0, sector))
            .ok()?
            .ok()?;
        decode(&data)
    }

    fn write_sector(
        topo: &mut Topology,
        class: ClassId,
        provider: ProviderId,
        sector: Vec<u8>,
    ) -> Result<(), String> {
        match Self::probe(topo, class, provider, Access::READ_WRITE, |cp| io::write_data(cp, 0, sector)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(err) => Err(err.to_string()),
        }
    }

    /// Label nodes of `class` consuming `provider`.
    fn label_nodes(topo: &Topology, class: ClassId, provider: ProviderId) -> Vec<NodeId> {
        let Ok(pp) = topo.provider(provider) else {
            return Vec::new();
        };
        pp.consumers()
            .iter()
            .filter_map(|&cp| topo.consumer(cp).ok().map(|c| c.node()))
            .filter(|&node| topo.node(node).is_ok_and(|n| n.class() == class))
            .collect()
    }

    fn labeled(topo: &Topology, class: ClassId, provider: ProviderId) -> bool {
        !Self::label_nodes(topo, class, provider).is_empty()
    }

    fn label_verb(
        &self,
        topo: &mut Topology,
        req: &mut ControlRequest,
        class: ClassId,
    ) -> Result<(), CtlError> {
        let provider_name = req.get_text(ctl::name_of::PROVIDER)?;
        let provider = ctl::resolve_provider(topo, req, &provider_name)?;
        if Self::labeled(topo, class, provider) {
            return Err(req.error(format!("Provider {provider_name} is already labeled.")));
        }
        let name = req.get_text("name")?;
        let sectorsize = topo.provider_ref(provider).map_err(|e| fail(req, e))?.sectorsize();
        let Some(sector) = encode(&name, sectorsize as usize) else {
            return Err(req.error("Invalid name argument."));
        };
        if let Err(err) = Self::write_sector(topo, class, provider, sector) {
            return Err(req.error(format!("Cannot write label: {err}.")));
        }
        tracing::info!(target: "stratum::ctl", provider = %provider_name, label = %name, "label written");
        match self.taste(topo, class, provider, TasteMode::Insist) {
            Some(_) => Ok(()),
            None => Err(req.error(format!("Label {name} written but not attached."))),
        }
    }

    fn clear_verb(
        &self,
        topo: &mut Topology,
        req: &mut ControlRequest,
        class: ClassId,
    ) -> Result<(), CtlError> {
        let provider_name = req.get_text(ctl::name_of::PROVIDER)?;
        let provider = ctl::resolve_provider(topo, req, &provider_name)?;
        let sectorsize = topo.provider_ref(provider).map_err(|e| fail(req, e))?.sectorsize();
        if let Err(err) = Self::write_sector(topo, class, provider, vec![0; sectorsize as usize]) {
            return Err(req.error(format!("Cannot clear label: {err}.")));
        }
        for node in Self::label_nodes(topo, class, provider) {
            topo.wither_node(node, BioError::NoDevice).map_err(|e| fail(req, e))?;
        }
        tracing::info!(target: "stratum::ctl", provider = %provider_name, "label cleared");
        Ok(())
    }
}

impl Class for LabelClass {
    fn name(&self) -> &str {
        CLASS_NAME
    }

    fn priority(&self) -> i32 {
        5
    }

    fn taste(
        &self,
        topo: &mut Topology,
        class: ClassId,
        provider: ProviderId,
        mode: TasteMode,
    ) -> Option<NodeId> {
        if mode == TasteMode::Transparent {
            return None;
        }
        let geometry = topo.provider(provider).ok()?.geometry();
        if geometry.mediasize <= u64::from(geometry.sectorsize) {
            return None;
        }
        let label = Self::read_label(topo, class, provider)?;
        let name = format!("{PREFIX}{label}");
        if topo.provider_by_name(&name).is_some() {
            tracing::warn!(target: "stratum::topology", %name, "duplicate label ignored");
            return None;
        }

        let sector = u64::from(geometry.sectorsize);
        match build_window(topo, class, &name, provider, sector, geometry.mediasize - sector) {
            Ok(pp) => {
                tracing::info!(target: "stratum::topology", %name, "label found");
                topo.provider(pp).ok().map(|p| p.node())
            }
            Err(err) => {
                tracing::debug!(target: "stratum::topology", %name, %err, "label attach failed");
                None
            }
        }
    }

    fn ctlreq(
        &self,
        topo: &mut Topology,
        req: &mut ControlRequest,
        class: ClassId,
        verb: &str,
    ) -> Result<(), CtlError> {
        match verb {
            "label" => self.label_verb(topo, req, class),
            "clear" => self.clear_verb(topo, req, class),
            _ => ctl::std_ctlreq(self, topo, req, class, verb),
        }
    }
}
