//! Administrative control requests.
//!
//! A [`ControlRequest`] is an ordered bag of named, typed parameters. Two of
//! them address the request: `class` (the class name) and `verb`. The
//! remaining ones are read by the class callbacks with the typed getters,
//! which record a descriptive error in the request when a parameter is
//! missing or malformed. The first recorded error wins and comes back to
//! the caller verbatim.
//!
//! # Standard verbs
//!
//! | Verb | Parameters | Routed to |
//! |------|------------|-----------|
//! | `create` | optional `provider` | [`Class::create_node`] |
//! | `destroy` | `node`, optional `force` | [`Class::destroy_node`] |
//! | `configure` | `node`, `action` | [`Class::config_node`] |
//! | `list` | optional `node` | writes the `output` parameter |

use std::fmt::Write;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topology::{Class, ClassId, NodeId, ProviderId, Topology};

/// Value of one control-request parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamValue {
    /// Signed integer.
    Int(i64),
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes.
    Blob(Vec<u8>),
    /// List of opaque byte strings.
    List(Vec<Vec<u8>>),
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for ParamValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl From<Vec<Vec<u8>>> for ParamValue {
    fn from(v: Vec<Vec<u8>>) -> Self {
        Self::List(v)
    }
}

/// A failed control request. Displays as the recorded message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CtlError(String);

impl CtlError {
    /// The message, as recorded in the request.
    pub fn message(&self) -> &str {
        &self.0
    }
}

/// One named parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    /// Parameter name.
    pub name: String,
    /// Parameter value.
    pub value: ParamValue,
}

/// An administrative request: parameters in, parameters and error out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    params: Vec<Param>,
    error: Option<String>,
}

impl ControlRequest {
    /// A request addressed to `class` with `verb`.
    pub fn new(class: &str, verb: &str) -> Self {
        Self::default().with("class", class).with("verb", verb)
    }

    /// Builder form of [`set_param`](ControlRequest::set_param).
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.set_param(name, value);
        self
    }

    /// Sets a parameter, replacing an existing one of the same name in place.
    pub fn set_param(&mut self, name: &str, value: impl Into<ParamValue>) {
        let value = value.into();
        match self.params.iter_mut().find(|p| p.name == name) {
            Some(param) => param.value = value,
            None => self.params.push(Param {
                name: name.to_string(),
                value,
            }),
        }
    }

    /// Raw parameter lookup.
    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    /// All parameters in insertion order.
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// True if the parameter is present.
    pub fn has(&self, name: &str) -> bool {
        self.param(name).is_some()
    }

    /// The `class` parameter.
    pub fn class(&self) -> Option<&str> {
        self.text(name_of::CLASS)
    }

    /// The `verb` parameter.
    pub fn verb(&self) -> Option<&str> {
        self.text(name_of::VERB)
    }

    /// Text parameter lookup without error recording.
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.param(name)? {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// True if the parameter is a nonzero integer or the text `1`/`true`/`yes`.
    pub fn flag(&self, name: &str) -> bool {
        match self.param(name) {
            Some(ParamValue::Int(v)) => *v != 0,
            Some(ParamValue::Text(s)) => matches!(s.as_str(), "1" | "true" | "yes"),
            _ => false,
        }
    }

    /// Records `message` as the request error unless one is already set, and
    /// returns the error that is now recorded.
    pub fn error(&mut self, message: impl Into<String>) -> CtlError {
        let recorded = self.error.get_or_insert_with(|| message.into());
        CtlError(recorded.clone())
    }

    /// The recorded error message, if any.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// `Ok` unless an error has been recorded.
    pub fn result(&self) -> Result<(), CtlError> {
        match &self.error {
            Some(msg) => Err(CtlError(msg.clone())),
            None => Ok(()),
        }
    }

    /// Integer parameter. Text holding a decimal integer is accepted too.
    pub fn get_int(&mut self, name: &str) -> Result<i64, CtlError> {
        match self.opt_int(name)? {
            Some(v) => Ok(v),
            None => Err(self.error(format!("Missing {name} argument."))),
        }
    }

    /// Optional integer parameter; an error only if present but malformed.
    pub fn opt_int(&mut self, name: &str) -> Result<Option<i64>, CtlError> {
        let parsed = match self.param(name) {
            None => return Ok(None),
            Some(ParamValue::Int(v)) => Some(*v),
            Some(ParamValue::Text(s)) => parse_int(s),
            Some(_) => None,
        };
        match parsed {
            Some(v) => Ok(Some(v)),
            None => Err(self.error(format!("Invalid {name} argument."))),
        }
    }

    /// Text parameter.
    pub fn get_text(&mut self, name: &str) -> Result<String, CtlError> {
        match self.param(name) {
            Some(ParamValue::Text(s)) => Ok(s.clone()),
            Some(_) => Err(self.error(format!("Invalid {name} argument."))),
            None => Err(self.error(format!("Missing {name} argument."))),
        }
    }

    /// Blob parameter. Text is accepted as its UTF-8 bytes.
    pub fn get_blob(&mut self, name: &str) -> Result<Vec<u8>, CtlError> {
        match self.param(name) {
            Some(ParamValue::Blob(b)) => Ok(b.clone()),
            Some(ParamValue::Text(s)) => Ok(s.as_bytes().to_vec()),
            Some(_) => Err(self.error(format!("Invalid {name} argument."))),
            None => Err(self.error(format!("Missing {name} argument."))),
        }
    }

    /// List parameter.
    pub fn get_list(&mut self, name: &str) -> Result<Vec<Vec<u8>>, CtlError> {
        match self.param(name) {
            Some(ParamValue::List(l)) => Ok(l.clone()),
            Some(_) => Err(self.error(format!("Invalid {name} argument."))),
            None => Err(self.error(format!("Missing {name} argument."))),
        }
    }
}

/// Well-known parameter names.
pub mod name_of {
    /// Target class name.
    pub const CLASS: &str = "class";
    /// Verb.
    pub const VERB: &str = "verb";
    /// Target node name.
    pub const NODE: &str = "node";
    /// Target provider name.
    pub const PROVIDER: &str = "provider";
    /// Sub-action of `configure`.
    pub const ACTION: &str = "action";
    /// Override for `destroy` of an open node.
    pub const FORCE: &str = "force";
    /// Text written by `list`.
    pub const OUTPUT: &str = "output";
}

fn parse_int(text: &str) -> Option<i64> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// Resolves the request's class and hands it to the class's handler.
pub fn dispatch(topo: &mut Topology, req: &mut ControlRequest) -> Result<(), CtlError> {
    let Some(class_name) = req.class().map(str::to_string) else {
        return Err(req.error("Class not specified."));
    };
    let Some(verb) = req.verb().map(str::to_string) else {
        return Err(req.error("Verb missing."));
    };
    let Some(class) = topo.class_by_name(&class_name) else {
        return Err(req.error(format!("Class {class_name} not found.")));
    };
    let imp = match topo.class(class) {
        Ok(entry) => std::sync::Arc::clone(entry.imp()),
        Err(err) => return Err(req.error(err.to_string())),
    };
    tracing::debug!(target: "stratum::ctl", class = %class_name, %verb, "control request");
    imp.ctlreq(topo, req, class, &verb)?;
    req.result()
}

/// Standard verb handling shared by every class.
pub fn std_ctlreq<C: Class + ?Sized>(
    imp: &C,
    topo: &mut Topology,
    req: &mut ControlRequest,
    class: ClassId,
    verb: &str,
) -> Result<(), CtlError> {
    match verb {
        "create" => {
            let provider = match req.text(name_of::PROVIDER).map(str::to_string) {
                Some(name) => Some(resolve_provider(topo, req, &name)?),
                None => None,
            };
            imp.create_node(topo, req, class, provider)
        }
        "destroy" => {
            let node = resolve_node(topo, req, class)?;
            imp.destroy_node(topo, req, class, node)
        }
        "configure" => {
            let node = resolve_node(topo, req, class)?;
            let action = req.get_text(name_of::ACTION)?;
            imp.config_node(topo, req, node, &action)
        }
        "list" => list(topo, req, class),
        other => Err(req.error(format!("Unknown verb {other}."))),
    }
}

/// Looks up a provider by name; a leading `/dev/` is ignored.
pub fn resolve_provider(
    topo: &Topology,
    req: &mut ControlRequest,
    name: &str,
) -> Result<ProviderId, CtlError> {
    let name = name.strip_prefix("/dev/").unwrap_or(name);
    topo.provider_by_name(name)
        .ok_or_else(|| req.error(format!("Provider {name} not found.")))
}

/// Looks up the node named by the `node` parameter within `class`.
pub fn resolve_node(
    topo: &Topology,
    req: &mut ControlRequest,
    class: ClassId,
) -> Result<NodeId, CtlError> {
    let name = req.get_text(name_of::NODE)?;
    topo.node_by_name(class, &name)
        .ok_or_else(|| req.error(format!("Node {name} not found.")))
}

/// Standard `destroy`: refuses nodes with open providers unless `force` is set.
pub fn std_destroy_node(
    topo: &mut Topology,
    req: &mut ControlRequest,
    node: NodeId,
) -> Result<(), CtlError> {
    let force = req.flag(name_of::FORCE);
    let open = match topo.node(node) {
        Ok(n) => n
            .providers()
            .iter()
            .filter_map(|&pp| topo.provider(pp).ok())
            .find(|p| !p.access().is_zero())
            .map(|p| p.name().to_string()),
        Err(err) => return Err(req.error(err.to_string())),
    };
    if let Some(name) = open {
        if !force {
            return Err(req.error(format!("Provider {name} is still open.")));
        }
        tracing::warn!(target: "stratum::ctl", provider = %name, "destroying open provider (forced)");
    }
    match topo.destroy_node(node) {
        Ok(teardown) => {
            tracing::info!(target: "stratum::ctl", node = %node, ?teardown, "node destroyed");
            Ok(())
        }
        Err(err) => Err(req.error(err.to_string())),
    }
}

fn list(topo: &Topology, req: &mut ControlRequest, class: ClassId) -> Result<(), CtlError> {
    let nodes: Vec<NodeId> = match req.text(name_of::NODE).map(str::to_string) {
        Some(name) => vec![
            topo.node_by_name(class, &name)
                .ok_or_else(|| req.error(format!("Node {name} not found.")))?,
        ],
        None => match topo.class(class) {
            Ok(entry) => entry.nodes().iter().copied().collect(),
            Err(err) => return Err(req.error(err.to_string())),
        },
    };

    let mut out = String::new();
    for id in nodes {
        let Ok(node) = topo.node(id) else {
            continue;
        };
        // Formatting into a String cannot fail.
        let _ = write_node_listing(topo, &mut out, node);
    }
    req.set_param(name_of::OUTPUT, out);
    Ok(())
}

fn write_node_listing(
    topo: &Topology,
    out: &mut String,
    node: &crate::topology::Node,
) -> core::fmt::Result {
    writeln!(out, "Geom name: {}", node.name())?;
    if node.is_withering() {
        writeln!(out, "State: WITHER")?;
    }
    if !node.providers().is_empty() {
        writeln!(out, "Providers:")?;
        for (i, &pp) in node.providers().iter().enumerate() {
            let Ok(p) = topo.provider(pp) else {
                continue;
            };
            let g = p.geometry();
            writeln!(out, "{}. Name: {}", i + 1, p.name())?;
            writeln!(out, "   Mediasize: {}", g.mediasize)?;
            writeln!(out, "   Sectorsize: {}", g.sectorsize)?;
            if g.stripesize > 0 {
                writeln!(out, "   Stripesize: {}", g.stripesize)?;
                writeln!(out, "   Stripeoffset: {}", g.stripeoffset)?;
            }
            writeln!(out, "   Mode: {}", p.access())?;
        }
    }
    if !node.consumers().is_empty() {
        writeln!(out, "Consumers:")?;
        for (i, &cp) in node.consumers().iter().enumerate() {
            let Ok(c) = topo.consumer(cp) else {
                continue;
            };
            let name = c
                .provider()
                .and_then(|pp| topo.provider(pp).ok())
                .map_or("(detached)", |p| p.name());
            writeln!(out, "{}. Name: {}", i + 1, name)?;
            writeln!(out, "   Mode: {}", c.access())?;
        }
    }
    writeln!(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        let mut req = ControlRequest::new("MD", "create");
        let first = req.error("Missing size argument.");
        let second = req.error("something else");
        assert_eq!(first.message(), "Missing size argument.");
        assert_eq!(second.message(), "Missing size argument.");
        assert_eq!(req.result(), Err(first));
    }

    #[test]
    fn set_param_replaces_in_place() {
        let mut req = ControlRequest::new("MD", "create").with("size", 1024_i64);
        req.set_param("size", 2048_i64);
        assert_eq!(req.params().len(), 3);
        assert_eq!(req.param("size"), Some(&ParamValue::Int(2048)));
    }

    #[test]
    fn get_int_accepts_text() {
        let mut req = ControlRequest::default()
            .with("a", "4096")
            .with("b", "0x200")
            .with("c", "lots");
        assert_eq!(req.get_int("a"), Ok(4096));
        assert_eq!(req.get_int("b"), Ok(512));
        assert_eq!(req.get_int("c").unwrap_err().message(), "Invalid c argument.");
    }

    #[test]
    fn missing_parameter_is_reported() {
        let mut req = ControlRequest::default();
        assert_eq!(req.get_text("node").unwrap_err().message(), "Missing node argument.");
        assert_eq!(req.opt_int("size"), Ok(None));
    }

    #[test]
    fn flags() {
        let req = ControlRequest::default()
            .with("force", true)
            .with("quiet", "yes")
            .with("verbose", 0_i64);
        assert!(req.flag("force"));
        assert!(req.flag("quiet"));
        assert!(!req.flag("verbose"));
        assert!(!req.flag("absent"));
    }

    #[test]
    fn params_serialize() {
        let req = ControlRequest::new("MD", "list");
        let json = serde_json::to_string(&req).unwrap();
        let back: ControlRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.class(), Some("MD"));
        assert_eq!(back.verb(), Some("list"));
    }
}
