//! `MD`: memory-backed disks.
//!
//! Every node holds one provider of the same name whose contents live in a
//! heap buffer. Memory disks are the leaves of test and demo stacks, and the
//! `configure` actions let a caller inject the events real hardware would
//! produce:
//!
//! | Action | Parameters | Effect |
//! |--------|------------|--------|
//! | `fail` | optional `error` (errno, default 5) | orphans the provider |
//! | `resize` | `size` | changes the media size and spoils every consumer |
//! | `readonly` | `readonly` flag | refuses (or allows) write opens |

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use stratum_core::{
    Access, Bio, BioCommand, BioError, Class, ClassId, ControlRequest, CtlError, DumpTarget,
    GeomError, Geometry, NodeId, NodeOps, ProviderId, Topology, io,
};

use crate::util::fail;

/// Class name.
pub const CLASS_NAME: &str = "MD";

const DEFAULT_SECTOR: i64 = 512;

/// Node operations of one memory disk.
pub struct MdDisk {
    data: RwLock<Vec<u8>>,
    readonly: AtomicBool,
}

impl MdDisk {
    /// A zero-filled disk of `size` bytes. `None` if the buffer cannot be
    /// allocated.
    pub fn new(size: u64) -> Option<Self> {
        let mut data = Vec::new();
        let len = Self::reserve(&mut data, size)?;
        data.resize(len, 0);
        Some(Self {
            data: RwLock::new(data),
            readonly: AtomicBool::new(false),
        })
    }

    /// Makes room for `size` bytes in total without aborting on failure.
    fn reserve(data: &mut Vec<u8>, size: u64) -> Option<usize> {
        let len = usize::try_from(size).ok()?;
        data.try_reserve_exact(len.saturating_sub(data.len())).ok()?;
        Some(len)
    }

    /// Current buffer length in bytes.
    pub fn len(&self) -> u64 {
        self.data.read().len() as u64
    }

    /// True for a zero-length disk.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// True if writes are refused.
    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::Acquire)
    }

    /// Turns write refusal on or off.
    pub fn set_readonly(&self, on: bool) {
        self.readonly.store(on, Ordering::Release);
    }

    /// Grows the buffer to at least `size` bytes. False if that cannot be
    /// allocated; the buffer is then unchanged.
    fn grow(&self, size: u64) -> bool {
        let mut data = self.data.write();
        match Self::reserve(&mut data, size) {
            Some(len) if len > data.len() => {
                data.resize(len, 0);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    fn truncate(&self, size: u64) {
        self.data.write().truncate(size as usize);
    }

    fn range(bio: &Bio) -> core::ops::Range<usize> {
        let start = bio.offset as usize;
        start..start + bio.length as usize
    }
}

impl NodeOps for MdDisk {
    fn start(&self, bio: Bio) {
        let Some(mut bio) = bio.try_attr_u64("GEOM::candelete", 1) else {
            return;
        };
        let range = Self::range(&bio);
        let writes = matches!(bio.cmd, BioCommand::Write | BioCommand::Delete);
        if writes && self.is_readonly() {
            io::deliver(bio, Err(BioError::NotPermitted));
            return;
        }

        let result = match bio.cmd {
            BioCommand::Read => self.data.read().get(range).map(|src| {
                bio.data.copy_from_slice(src);
            }),
            BioCommand::Write => self.data.write().get_mut(range).map(|dst| {
                dst.copy_from_slice(&bio.data);
            }),
            BioCommand::Delete => self.data.write().get_mut(range).map(|dst| dst.fill(0)),
            BioCommand::Flush => Some(()),
            BioCommand::GetAttr => {
                io::deliver(bio, Err(BioError::NotSupported));
                return;
            }
        };
        match result {
            Some(()) => io::complete(bio),
            // Shrunk underneath an in-flight request.
            None => io::deliver(bio, Err(BioError::InvalidArgument)),
        }
    }

    fn access(&self, topo: &mut Topology, provider: ProviderId, delta: Access) -> Result<(), GeomError> {
        if delta.write > 0 && self.is_readonly() {
            return Err(GeomError::Vetoed {
                node: topo.provider(provider)?.node(),
                reason: BioError::NotPermitted,
            });
        }
        Ok(())
    }

    fn dumpconf(&self, out: &mut String, indent: &str, target: DumpTarget) {
        if let DumpTarget::Node(_) = target {
            let _ = writeln!(out, "{indent}<type>malloc</type>");
            let _ = writeln!(out, "{indent}<length>{}</length>", self.len());
            let _ = writeln!(out, "{indent}<readonly>{}</readonly>", u8::from(self.is_readonly()));
        }
    }
}

/// The `MD` class.
#[derive(Debug, Default, Clone, Copy)]
pub struct MdClass;

impl MdClass {
    fn next_name(topo: &Topology, class: ClassId) -> String {
        (0u32..)
            .map(|unit| format!("md{unit}"))
            .find(|name| topo.node_by_name(class, name).is_none() && topo.provider_by_name(name).is_none())
            .unwrap_or_default()
    }

    fn provider_of(topo: &Topology, node: NodeId) -> Option<ProviderId> {
        topo.node(node).ok()?.providers().iter().next().copied()
    }
}

impl Class for MdClass {
    fn name(&self) -> &str {
        CLASS_NAME
    }

    /// `create`: `size` (bytes), optional `sectorsize`, `name`, `readonly`.
    /// The chosen name is written back into the `name` parameter.
    fn create_node(
        &self,
        topo: &mut Topology,
        req: &mut ControlRequest,
        class: ClassId,
        _provider: Option<ProviderId>,
    ) -> Result<(), CtlError> {
        let size = req.get_int("size")?;
        if size <= 0 {
            return Err(req.error("Invalid size argument."));
        }
        let sectorsize = req.opt_int("sectorsize")?.unwrap_or(DEFAULT_SECTOR);
        let Ok(sectorsize) = u32::try_from(sectorsize) else {
            return Err(req.error("Invalid sectorsize argument."));
        };
        let geometry = Geometry::new(size as u64, sectorsize);
        geometry.validate().map_err(|e| fail(req, e))?;

        let name = match req.text("name") {
            Some(name) => name.to_string(),
            None => Self::next_name(topo, class),
        };
        let Some(disk) = MdDisk::new(size as u64).map(Arc::new) else {
            return Err(req.error("Invalid size argument."));
        };
        disk.set_readonly(req.flag("readonly"));

        let node = topo
            .new_node_with(class, name.as_str(), disk)
            .map_err(|e| fail(req, e))?;
        let provider = match topo.new_provider(node, name.as_str(), geometry) {
            Ok(pp) => pp,
            Err(err) => {
                let _ = topo.destroy_node(node);
                return Err(fail(req, err));
            }
        };
        topo.set_can_delete(provider, true).map_err(|e| fail(req, e))?;
        tracing::info!(target: "stratum::ctl", %name, size, sectorsize, "memory disk created");
        req.set_param("name", name);
        Ok(())
    }

    fn config_node(
        &self,
        topo: &mut Topology,
        req: &mut ControlRequest,
        node: NodeId,
        action: &str,
    ) -> Result<(), CtlError> {
        let (Some(disk), Some(provider)) = (topo.node_ops_as::<MdDisk>(node), Self::provider_of(topo, node))
        else {
            return Err(req.error("Node is not an active memory disk."));
        };

        match action {
            "fail" => {
                let errno = req.opt_int("error")?.unwrap_or(5);
                let error = BioError::from_errno(errno as i32);
                topo.orphan_provider(provider, error).map_err(|e| fail(req, e))
            }
            "resize" => {
                let size = req.get_int("size")?;
                if size <= 0 {
                    return Err(req.error("Invalid size argument."));
                }
                let size = size as u64;
                let geometry = topo.provider_ref(provider).map_err(|e| fail(req, e))?.geometry();
                Geometry {
                    mediasize: size,
                    ..geometry
                }
                .validate()
                .map_err(|e| fail(req, e))?;

                if !disk.grow(size) {
                    return Err(req.error("Invalid size argument."));
                }
                topo.set_mediasize(provider, size).map_err(|e| fail(req, e))?;
                disk.truncate(size);
                let spoiled = topo.spoil_others(provider, None).map_err(|e| fail(req, e))?;
                tracing::info!(target: "stratum::ctl", node = %node, size, spoiled, "memory disk resized");
                Ok(())
            }
            "readonly" => {
                let on = req.flag("readonly");
                if on {
                    let open = topo.provider(provider).map_err(|e| fail(req, e))?;
                    if open.access().write > 0 {
                        let name = open.name().to_string();
                        return Err(req.error(format!("Provider {name} is open for writing.")));
                    }
                }
                disk.set_readonly(on);
                Ok(())
            }
            other => Err(req.error(format!("Unknown action {other}."))),
        }
    }
}
