//! Plumbing shared by the built-in classes.

use std::sync::Arc;

use stratum_core::{
    Access, ClassId, ConsumerId, ControlRequest, CtlError, GeomError, NodeId, NodeOps,
    ProviderId, Topology,
};

/// Records `err` in the request and returns it as a control error.
pub(crate) fn fail(req: &mut ControlRequest, err: GeomError) -> CtlError {
    req.error(err.to_string())
}

/// Creates a node with one consumer attached to `provider`.
///
/// On failure nothing is left behind.
pub(crate) fn node_over(
    topo: &mut Topology,
    class: ClassId,
    name: &str,
    ops: Arc<dyn NodeOps>,
    provider: ProviderId,
) -> Result<(NodeId, ConsumerId), GeomError> {
    let node = topo.new_node_with(class, name, ops)?;
    let attached = topo
        .new_consumer(node)
        .and_then(|cp| topo.attach(cp, provider).map(|()| cp));
    match attached {
        Ok(cp) => Ok((node, cp)),
        Err(err) => {
            let _ = topo.destroy_node(node);
            Err(err)
        }
    }
}

/// Closes whatever access `cp` holds, detaches it and destroys it.
pub(crate) fn drop_consumer(topo: &mut Topology, cp: ConsumerId) -> Result<(), GeomError> {
    let held = topo.consumer(cp)?.access();
    if !held.is_zero() {
        topo.access(cp, -held)?;
    }
    if topo.consumer(cp)?.provider().is_some() {
        topo.detach(cp)?;
    }
    // Detaching can wash a withering owner, consumer included.
    if topo.consumer(cp).is_err() {
        return Ok(());
    }
    topo.destroy_consumer(cp)
}

/// Runs `f` with `cp` opened for `mode`, closing it again afterwards.
pub(crate) fn with_access<T>(
    topo: &mut Topology,
    cp: ConsumerId,
    mode: Access,
    f: impl FnOnce(&Topology) -> T,
) -> Result<T, GeomError> {
    topo.access(cp, mode)?;
    let out = f(topo);
    topo.access(cp, -mode)?;
    Ok(out)
}
