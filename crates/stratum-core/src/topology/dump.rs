//! Diagnostics: an XML-like configuration dump and a serializable snapshot.

use std::fmt::Write;

use serde::Serialize;

use super::{Access, ClassEntry, DumpTarget, Node, Topology};

/// Serializable view of the whole mesh.
#[derive(Debug, Clone, Serialize)]
pub struct MeshSnapshot {
    /// Registered classes in registration order.
    pub classes: Vec<ClassSnapshot>,
}

/// One class and its nodes.
#[derive(Debug, Clone, Serialize)]
pub struct ClassSnapshot {
    /// Class slot.
    pub id: u32,
    /// Class name.
    pub name: String,
    /// Nodes owned by the class.
    pub nodes: Vec<NodeSnapshot>,
}

/// One node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    /// Node slot.
    pub id: u32,
    /// Node name.
    pub name: String,
    /// Stack rank.
    pub rank: u32,
    /// WITHER flag.
    pub withering: bool,
    /// Exposed providers.
    pub providers: Vec<ProviderSnapshot>,
    /// Owned consumers.
    pub consumers: Vec<ConsumerSnapshot>,
}

/// One provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSnapshot {
    /// Provider slot.
    pub id: u32,
    /// Provider name.
    pub name: String,
    /// Media size in bytes.
    pub mediasize: u64,
    /// Sector size in bytes.
    pub sectorsize: u32,
    /// Stripe size in bytes.
    pub stripesize: u64,
    /// Stripe offset in bytes.
    pub stripeoffset: u64,
    /// Aggregate access counts.
    pub access: Access,
    /// Error text, if the provider has failed.
    pub error: Option<String>,
    /// ORPHAN flag.
    pub orphaned: bool,
    /// WITHER flag.
    pub withering: bool,
    /// Requests started.
    pub started: u64,
    /// Requests completed.
    pub ended: u64,
}

/// One consumer.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerSnapshot {
    /// Consumer slot.
    pub id: u32,
    /// Name of the attached provider.
    pub provider: Option<String>,
    /// Held access counts.
    pub access: Access,
    /// Spoiled flag.
    pub spoiled: bool,
}

impl Topology {
    /// Captures the current graph as plain data.
    pub fn snapshot(&self) -> MeshSnapshot {
        MeshSnapshot {
            classes: self.classes().map(|c| self.class_snapshot(c)).collect(),
        }
    }

    fn class_snapshot(&self, class: &ClassEntry) -> ClassSnapshot {
        ClassSnapshot {
            id: class.id().0,
            name: class.name().to_string(),
            nodes: class
                .nodes()
                .iter()
                .filter_map(|&n| self.node(n).ok())
                .map(|n| self.node_snapshot(n))
                .collect(),
        }
    }

    fn node_snapshot(&self, node: &Node) -> NodeSnapshot {
        let providers = node
            .providers()
            .iter()
            .filter_map(|&pp| self.provider(pp).ok())
            .map(|p| {
                let geometry = p.geometry();
                ProviderSnapshot {
                    id: p.id().0,
                    name: p.name().to_string(),
                    mediasize: geometry.mediasize,
                    sectorsize: geometry.sectorsize,
                    stripesize: geometry.stripesize,
                    stripeoffset: geometry.stripeoffset,
                    access: p.access(),
                    error: p.error().map(|e| e.to_string()),
                    orphaned: p.is_orphaned(),
                    withering: p.is_withering(),
                    started: p.handle().stats().started(),
                    ended: p.handle().stats().ended(),
                }
            })
            .collect();
        let consumers = node
            .consumers()
            .iter()
            .filter_map(|&cp| self.consumer(cp).ok())
            .map(|c| ConsumerSnapshot {
                id: c.id().0,
                provider: c
                    .provider()
                    .and_then(|pp| self.provider(pp).ok())
                    .map(|p| p.name().to_string()),
                access: c.access(),
                spoiled: c.is_spoiled(),
            })
            .collect();
        NodeSnapshot {
            id: node.id().0,
            name: node.name().to_string(),
            rank: node.rank(),
            withering: node.is_withering(),
            providers,
            consumers,
        }
    }

    /// Renders the mesh as an XML-like configuration tree.
    ///
    /// Each node's [`dumpconf`](super::NodeOps::dumpconf) hook contributes
    /// a `<config>` section for the node, its providers and its consumers.
    pub fn dump_conf(&self) -> String {
        let mut out = String::new();
        // Formatting into a String cannot fail.
        let _ = self.write_conf(&mut out);
        out
    }

    fn write_conf(&self, out: &mut String) -> core::fmt::Result {
        writeln!(out, "<mesh>")?;
        for class in self.classes() {
            writeln!(out, "  <class id=\"{}\">", class.id().0)?;
            writeln!(out, "    <name>{}</name>", escape(class.name()))?;
            for &id in class.nodes() {
                let Ok(node) = self.node(id) else {
                    continue;
                };
                self.write_node(out, node)?;
            }
            writeln!(out, "  </class>")?;
        }
        writeln!(out, "</mesh>")
    }

    fn write_node(&self, out: &mut String, node: &Node) -> core::fmt::Result {
        writeln!(out, "    <geom id=\"{}\">", node.id().0)?;
        writeln!(out, "      <name>{}</name>", escape(node.name()))?;
        writeln!(out, "      <rank>{}</rank>", node.rank())?;
        if node.is_withering() {
            writeln!(out, "      <wither/>")?;
        }
        write_config(out, "      ", |out, indent| {
            node.ops().dumpconf(out, indent, DumpTarget::Node(node.id()));
        })?;

        for &cp in node.consumers() {
            let Ok(consumer) = self.consumer(cp) else {
                continue;
            };
            writeln!(out, "      <consumer id=\"{}\">", cp.0)?;
            if let Some(provider) = consumer.provider().and_then(|pp| self.provider(pp).ok()) {
                writeln!(out, "        <provider ref=\"{}\"/>", escape(provider.name()))?;
            }
            writeln!(out, "        <mode>{}</mode>", consumer.access())?;
            write_config(out, "        ", |out, indent| {
                node.ops().dumpconf(out, indent, DumpTarget::Consumer(cp));
            })?;
            writeln!(out, "      </consumer>")?;
        }

        for &pp in node.providers() {
            let Ok(provider) = self.provider(pp) else {
                continue;
            };
            let geometry = provider.geometry();
            writeln!(out, "      <provider id=\"{}\">", pp.0)?;
            writeln!(out, "        <name>{}</name>", escape(provider.name()))?;
            writeln!(out, "        <mode>{}</mode>", provider.access())?;
            writeln!(out, "        <mediasize>{}</mediasize>", geometry.mediasize)?;
            writeln!(out, "        <sectorsize>{}</sectorsize>", geometry.sectorsize)?;
            if geometry.stripesize > 0 {
                writeln!(out, "        <stripesize>{}</stripesize>", geometry.stripesize)?;
                writeln!(out, "        <stripeoffset>{}</stripeoffset>", geometry.stripeoffset)?;
            }
            if let Some(err) = provider.error() {
                writeln!(out, "        <error>{}</error>", err.errno())?;
            }
            write_config(out, "        ", |out, indent| {
                node.ops().dumpconf(out, indent, DumpTarget::Provider(pp));
            })?;
            writeln!(out, "      </provider>")?;
        }
        writeln!(out, "    </geom>")
    }
}

/// Emits a `<config>` block only if the hook wrote something.
fn write_config(
    out: &mut String,
    indent: &str,
    hook: impl FnOnce(&mut String, &str),
) -> core::fmt::Result {
    let inner = format!("{indent}  ");
    let mut body = String::new();
    hook(&mut body, &inner);
    if body.is_empty() {
        return Ok(());
    }
    writeln!(out, "{indent}<config>")?;
    out.push_str(&body);
    if !body.ends_with('\n') {
        out.push('\n');
    }
    writeln!(out, "{indent}</config>")
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
