//! CLI command implementations.

pub mod build;
pub mod classes;
pub mod common;
pub mod ctl;
pub mod io;
pub mod topologies;
pub mod validate;
