//! Class listing command.

#![allow(clippy::print_literal)] // Table headers use literal strings intentionally

use clap::Args;
use stratum_config::{ClassCatalog, STANDARD_VERBS};

#[derive(Args)]
pub struct ClassesArgs {
    /// Show details for a specific class
    #[arg(value_name = "CLASS")]
    class: Option<String>,
}

pub fn run(args: ClassesArgs) -> anyhow::Result<()> {
    let catalog = ClassCatalog::new();

    if let Some(name) = &args.class {
        let class = catalog
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown class: {name}"))?;

        println!("{}", class.name);
        println!("{}", "=".repeat(class.name.len()));
        println!();
        println!("{}", class.description);
        println!();
        println!("  {:10}  {}", "Kind", class.kind.name());
        println!("  {:10}  {}", "Tastes", if class.tastes { "yes" } else { "no" });

        let verbs: Vec<&str> = STANDARD_VERBS.iter().chain(class.verbs).copied().collect();
        println!("  {:10}  {}", "Verbs", verbs.join(", "));
        if !class.actions.is_empty() {
            println!("  {:10}  {}", "Actions", class.actions.join(", "));
        }
        println!();
        println!("Example usage:");
        println!();
        println!("  stratum ctl <TOPOLOGY> {} list", class.name);
        return Ok(());
    }

    println!("Available Classes");
    println!("=================");
    println!();
    for class in catalog.all() {
        println!("  {:8} {:10} - {}", class.name, class.kind.name(), class.description);
    }
    println!();
    println!("Use 'stratum classes <name>' for verbs and actions.");
    Ok(())
}
