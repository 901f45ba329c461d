//! Topology build command.

use clap::Args;
use stratum_core::MeshSnapshot;

use super::common::build_topology;

#[derive(Args)]
pub struct BuildArgs {
    /// Topology name or path
    topology: String,

    /// Print the mesh snapshot as JSON
    #[arg(long, conflicts_with = "dump")]
    json: bool,

    /// Print the XML-like configuration dump
    #[arg(long)]
    dump: bool,
}

pub fn run(args: BuildArgs) -> anyhow::Result<()> {
    let (topology, mesh) = build_topology(&args.topology)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&mesh.snapshot())?);
    } else if args.dump {
        print!("{}", mesh.dump_conf());
    } else {
        println!("{} ({} request(s))", topology.name, topology.len());
        if let Some(description) = &topology.description {
            println!("{description}");
        }
        println!();
        print_tree(&mesh.snapshot());
    }
    Ok(())
}

/// One line per node, providers and consumers indented beneath it.
fn print_tree(snapshot: &MeshSnapshot) {
    for class in snapshot.classes.iter().filter(|c| !c.nodes.is_empty()) {
        println!("{}", class.name);
        for node in &class.nodes {
            let wither = if node.withering { " (withering)" } else { "" };
            println!("  {} [rank {}]{wither}", node.name, node.rank);
            for cp in &node.consumers {
                println!(
                    "    <- {} {}",
                    cp.provider.as_deref().unwrap_or("-"),
                    cp.access
                );
            }
            for pp in &node.providers {
                println!(
                    "    -> {} {} bytes, {}-byte sectors, {}",
                    pp.name, pp.mediasize, pp.sectorsize, pp.access
                );
            }
        }
    }
}
