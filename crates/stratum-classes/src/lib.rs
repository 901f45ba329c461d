//! Built-in transformation classes for stratum meshes.
//!
//! Each module implements one class against the `stratum-core` callback
//! tables; [`ClassCatalog`] lists them and registers them with a mesh.
//!
//! | Class | Role |
//! |-------|------|
//! | [`MD`](md) | memory-backed leaf disks, with fault injection |
//! | [`NOP`](nop) | counting pass-through, claims on transparent taste |
//! | [`SLICE`](slice) | fixed windows onto a provider |
//! | [`LABEL`](label) | `label/<name>` providers found by taste |
//! | [`MIRROR`](mirror) | RAID-1 over several providers |
//!
//! # Example
//!
//! ```rust
//! use stratum_classes::ClassCatalog;
//! use stratum_core::{ControlRequest, Mesh};
//!
//! let mesh = Mesh::new();
//! ClassCatalog::new().register_all(&mesh.handle()).unwrap();
//!
//! let req = mesh.control(ControlRequest::new("MD", "create").with("size", 1_i64 << 20));
//! assert_eq!(req.text("name"), Some("md0"));
//! ```

pub mod catalog;
pub mod label;
pub mod md;
pub mod mirror;
pub mod nop;
pub mod slice;

mod util;

pub use catalog::{ClassCatalog, ClassDescriptor, ClassKind};
pub use label::LabelClass;
pub use md::{MdClass, MdDisk};
pub use mirror::{Mirror, MirrorClass};
pub use nop::{Nop, NopClass};
pub use slice::{SliceClass, Window};
