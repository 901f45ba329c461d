//! Topology validation command.

use clap::Args;
use stratum_config::{TopologyValidator, ValidationError};

use super::common::{init_tracing, load_topology};

#[derive(Args)]
pub struct ValidateArgs {
    /// Topology name or path
    topology: String,
}

pub fn run(args: ValidateArgs) -> anyhow::Result<()> {
    let topology = load_topology(&args.topology)?;
    init_tracing(topology.settings.trace.as_deref());

    match TopologyValidator::new().validate_topology(&topology) {
        Ok(()) => {
            println!("{}: {} request(s), valid", topology.name, topology.len());
            Ok(())
        }
        Err(ValidationError::Multiple(errors)) => {
            for err in &errors {
                eprintln!("  {err}");
            }
            anyhow::bail!("{}: {} problem(s) found", topology.name, errors.len())
        }
        Err(err) => anyhow::bail!("{}: {err}", topology.name),
    }
}
