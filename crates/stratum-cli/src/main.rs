//! Stratum CLI - command-line client for stratum storage meshes.
//!
//! Every invocation builds a fresh in-memory mesh from a topology file,
//! runs one command against it and exits.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "stratum")]
#[command(author, version, about = "Stratum storage mesh CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the built-in classes and their verbs
    Classes(commands::classes::ClassesArgs),

    /// Check a topology file without building it
    Validate(commands::validate::ValidateArgs),

    /// Build a topology and show the resulting mesh
    Build(commands::build::BuildArgs),

    /// Send one control request to a built topology
    Ctl(commands::ctl::CtlArgs),

    /// Read from a provider of a built topology
    Read(commands::io::ReadArgs),

    /// Write to a provider of a built topology and verify it
    Write(commands::io::WriteArgs),

    /// List and install topology files
    Topologies(commands::topologies::TopologiesArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Classes(args) => commands::classes::run(args),
        Commands::Validate(args) => commands::validate::run(args),
        Commands::Build(args) => commands::build::run(args),
        Commands::Ctl(args) => commands::ctl::run(args),
        Commands::Read(args) => commands::io::read(args),
        Commands::Write(args) => commands::io::write(args),
        Commands::Topologies(args) => commands::topologies::run(args),
    }
}
