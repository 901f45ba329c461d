//! Shared CLI helpers used across multiple commands.

use std::fmt::Write as _;
use std::sync::Arc;

use stratum_config::{TopologyFile, find_topology};
use stratum_core::{Access, Class, ConsumerRef, Mesh};
use tracing_subscriber::EnvFilter;

/// Class owning the nodes the CLI opens providers through.
struct Client;

impl Class for Client {
    fn name(&self) -> &str {
        "CLI"
    }
}

/// Installs the log subscriber on stderr.
///
/// `RUST_LOG` wins; otherwise `fallback` (a topology's `trace` setting),
/// otherwise `info`. Only the first call has an effect.
pub fn init_tracing(fallback: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(fallback.unwrap_or("info")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Parse a `key=value` string for clap's `value_parser`.
pub fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid parameter format: '{s}' (expected key=value)")),
    }
}

/// Loads a topology by name or path.
pub fn load_topology(name: &str) -> anyhow::Result<TopologyFile> {
    let Some(path) = find_topology(name) else {
        anyhow::bail!(
            "Topology '{}' not found. Looked for a file, then in {}.",
            name,
            stratum_config::user_topologies_dir().display()
        );
    };
    Ok(TopologyFile::load(&path)?)
}

/// Loads and builds a topology, installing logging from its settings.
pub fn build_topology(name: &str) -> anyhow::Result<(TopologyFile, Mesh)> {
    let topology = load_topology(name)?;
    init_tracing(topology.settings.trace.as_deref());
    let mesh = topology.build()?;
    Ok((topology, mesh))
}

/// Opens `provider` for `mode` through a fresh client node.
pub fn open_provider(mesh: &Mesh, provider: &str, mode: Access) -> anyhow::Result<ConsumerRef> {
    let existing = mesh.topology().class_by_name("CLI");
    let class = match existing {
        Some(class) => class,
        None => mesh.register_class(Arc::new(Client))?,
    };

    let mut topo = mesh.topology();
    let Some(pp) = topo.provider_by_name(provider) else {
        anyhow::bail!("Provider '{provider}' not found.");
    };
    let name = format!("cli.{}", topo.node_count());
    let node = topo.new_node(class, name)?;
    let cp = topo.new_consumer(node)?;
    topo.attach(cp, pp)?;
    topo.access(cp, mode)?;
    Ok(topo.consumer_ref(cp)?)
}

/// Classic 16-bytes-per-line hex dump, offsets starting at `base`.
pub fn hexdump(base: u64, data: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x} ", base + line as u64 * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(byte) => {
                    let _ = write!(out, " {byte:02x}");
                }
                None => out.push_str("   "),
            }
        }
        out.push_str("  |");
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }
    out
}
