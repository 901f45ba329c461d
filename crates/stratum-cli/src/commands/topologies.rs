//! Topology library commands.
//!
//! Lists the topology files `stratum` can find by name and installs new
//! ones into the user directory.

use std::path::Path;

use clap::{Args, Subcommand};
use stratum_config::{
    TopologyFile, TopologyValidator, ensure_user_topologies_dir, list_all_topologies,
    list_user_topologies, system_topologies_dir, topology_name_from_path, user_config_dir,
    user_topologies_dir,
};

#[derive(Args)]
pub struct TopologiesArgs {
    #[command(subcommand)]
    command: TopologiesCommand,
}

#[derive(Subcommand)]
enum TopologiesCommand {
    /// List topologies in the user and system directories
    List {
        /// Show only user topologies
        #[arg(long)]
        user: bool,
    },

    /// Validate a topology file and copy it into the user directory
    Install {
        /// Path of the topology file
        path: String,

        /// Name to install under (defaults to the topology's own name)
        #[arg(short, long)]
        name: Option<String>,

        /// Overwrite an installed topology of the same name
        #[arg(long)]
        force: bool,
    },

    /// Show topology directories
    Paths,
}

pub fn run(args: TopologiesArgs) -> anyhow::Result<()> {
    match args.command {
        TopologiesCommand::List { user } => list_topologies(user),
        TopologiesCommand::Install { path, name, force } => {
            install_topology(Path::new(&path), name.as_deref(), force)
        }
        TopologiesCommand::Paths => show_paths(),
    }
}

fn list_topologies(user_only: bool) -> anyhow::Result<()> {
    let found = if user_only {
        list_user_topologies()
    } else {
        list_all_topologies()
    };

    println!("Topologies:");
    println!("===========");
    if found.is_empty() {
        println!("  (none)");
        println!();
        println!("  Install one with: stratum topologies install <file>");
        return Ok(());
    }
    for path in found {
        let name = topology_name_from_path(&path).unwrap_or_else(|| "unknown".to_string());
        match TopologyFile::load(&path) {
            Ok(topology) => {
                let desc = topology.description.as_deref().unwrap_or("");
                println!("  {:20} {:3} request(s)  {}", name, topology.len(), desc);
            }
            Err(_) => println!("  {name:20} (error loading)"),
        }
    }
    Ok(())
}

fn install_topology(path: &Path, name: Option<&str>, force: bool) -> anyhow::Result<()> {
    let topology = TopologyFile::load(path)?;
    TopologyValidator::new().validate_topology(&topology)?;

    let name = name.unwrap_or(topology.name.as_str());
    if name.is_empty() || name.contains(['/', '\\']) {
        anyhow::bail!("Invalid topology name '{name}'.");
    }
    let target = ensure_user_topologies_dir()?.join(format!("{name}.toml"));
    if target.exists() && !force {
        anyhow::bail!("Topology '{name}' already exists. Use --force to overwrite.");
    }

    topology.save(&target)?;
    println!("Installed topology '{name}' to {}", target.display());
    Ok(())
}

fn show_paths() -> anyhow::Result<()> {
    println!("Topology Directories:");
    println!("=====================");
    println!();
    println!("User topologies:   {}", user_topologies_dir().display());
    println!("System topologies: {}", system_topologies_dir().display());
    println!("Config dir:        {}", user_config_dir().display());
    Ok(())
}
