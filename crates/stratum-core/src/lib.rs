//! Stratum Core - a storage transformation graph
//!
//! Independently written transformation classes stack into a directed acyclic
//! graph of nodes. Each node exposes block endpoints (providers) that other
//! nodes consume through attachment points (consumers). The crate routes
//! asynchronous I/O through that graph, arbitrates read/write/exclusive
//! access across the stack, and serializes structural changes against
//! completions and failures that arrive from anywhere.
//!
//! # Core Abstractions
//!
//! ## Graph
//!
//! - [`Mesh`] / [`MeshHandle`] - owns the topology lock and the event worker
//! - [`Topology`] - the arena of classes, nodes, providers and consumers;
//!   reachable only through [`Mesh::topology`]
//! - [`Class`] - callback table of a transformation module
//! - [`NodeOps`] - per-node behavior and private state
//!
//! ## I/O
//!
//! - [`Bio`] - one request; [`FanOut`] splits it into children
//! - [`io::request`] / [`io::deliver`] - the lock-free pipeline
//! - [`ConsumerRef`] / [`ProviderRef`] - handles usable outside the lock
//!
//! ## Administration
//!
//! - [`ControlRequest`] - typed parameter bag dispatched with
//!   [`MeshHandle::control`]
//! - [`Topology::dump_conf`] / [`Topology::snapshot`] - diagnostics
//!
//! # Locking
//!
//! Structural mutation needs `&mut Topology`, which only a
//! [`TopologyGuard`] hands out. The I/O path never takes that lock. Work
//! that must mutate the graph from an I/O context goes through
//! [`MeshHandle::post_event`] and runs later on the event worker.
//!
//! # Example
//!
//! ```rust,ignore
//! use stratum_core::{Access, Geometry, Mesh, io};
//!
//! let mesh = Mesh::new();
//! let consumer = {
//!     let mut topo = mesh.topology();
//!     let disk = topo.new_node(md_class, "md0")?;
//!     let pp = topo.new_provider(disk, "md0", Geometry::new(1 << 20, 512))?;
//!     let user = topo.new_node(user_class, "reader")?;
//!     let cp = topo.new_consumer(user)?;
//!     topo.attach(cp, pp)?;
//!     topo.access(cp, Access::READ)?;
//!     topo.consumer_ref(cp)?
//! };
//! let sector = io::read_data(&consumer, 0, 512)?;
//! ```

pub mod bio;
pub mod ctl;
pub mod error;
pub mod event;
pub mod io;
pub mod mesh;
pub mod topology;

pub use bio::{Bio, BioCommand, BioState, Completion, FanOut};
pub use ctl::{ControlRequest, CtlError, ParamValue};
pub use error::{BioError, GeomError};
pub use event::EventRef;
pub use mesh::{Mesh, MeshHandle, TopologyGuard};
pub use topology::{
    Access, AsAny, CLASS_VERSION, Class, ClassEntry, ClassId, ClassSnapshot, Consumer,
    ConsumerId, ConsumerRef, ConsumerSnapshot, DumpTarget, Geometry, IoStats, MeshSettings,
    MeshSnapshot, Node, NodeId, NodeOps, NodeSnapshot, Provider, ProviderId, ProviderRef,
    ProviderSnapshot, StdOps, TasteMode, Teardown, Topology,
};
